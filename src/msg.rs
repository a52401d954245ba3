use super::{address, CoreId};
use serde::{Deserialize, Serialize};

/// Size of the fixed message header on the wire.
///
/// bytes: 4 kind/components/hit, 4 requester, 8 address, 8 physical address,
/// 8 perf handle, 4 data length.
pub const HEADER_SIZE: usize = 36;

/// Protocol message catalog.
#[derive(
    Debug,
    strum::EnumIter,
    strum::FromRepr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Kind {
    // cache > directory
    EX_REQ = 1,
    SH_REQ,
    UPGRADE_REQ,
    // directory > cache
    INV_REQ,
    FLUSH_REQ,
    WB_REQ,
    NULLIFY_REQ,
    // replies
    EX_REP,
    SH_REP,
    UPGRADE_REP,
    INV_REP,
    FLUSH_REP,
    WB_REP,
    // directory > DRAM
    DRAM_READ_REQ,
    DRAM_WRITE_REQ,
    // DRAM > directory
    DRAM_READ_REP,
}

impl Kind {
    /// Requests that occupy a slot in the pending request queue.
    #[must_use]
    pub fn is_queued_request(self) -> bool {
        matches!(
            self,
            Kind::EX_REQ | Kind::SH_REQ | Kind::UPGRADE_REQ | Kind::NULLIFY_REQ
        )
    }
}

impl From<Kind> for stats::directory::MessageKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::EX_REQ => Self::EX_REQ,
            Kind::SH_REQ => Self::SH_REQ,
            Kind::UPGRADE_REQ => Self::UPGRADE_REQ,
            Kind::INV_REQ => Self::INV_REQ,
            Kind::FLUSH_REQ => Self::FLUSH_REQ,
            Kind::WB_REQ => Self::WB_REQ,
            Kind::NULLIFY_REQ => Self::NULLIFY_REQ,
            Kind::EX_REP => Self::EX_REP,
            Kind::SH_REP => Self::SH_REP,
            Kind::UPGRADE_REP => Self::UPGRADE_REP,
            Kind::INV_REP => Self::INV_REP,
            Kind::FLUSH_REP => Self::FLUSH_REP,
            Kind::WB_REP => Self::WB_REP,
            Kind::DRAM_READ_REQ => Self::DRAM_READ_REQ,
            Kind::DRAM_WRITE_REQ => Self::DRAM_WRITE_REQ,
            Kind::DRAM_READ_REP => Self::DRAM_READ_REP,
        }
    }
}

/// Logical component a message is sent from or to.
#[derive(
    Debug, strum::FromRepr, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MemComponent {
    LAST_LEVEL_CACHE = 1,
    DIRECTORY,
    DRAM,
}

/// Where an access was served, for instrumentation only.
#[derive(
    Debug,
    Default,
    strum::FromRepr,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum HitWhere {
    #[default]
    UNKNOWN = 0,
    CACHE_REMOTE,
    DRAM,
    DRAM_LOCAL,
    DRAM_REMOTE,
}

/// Opaque performance accounting handle owned by the sender.
///
/// The directory passes it through unmodified.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerfHandle(pub u64);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message of {len} bytes is shorter than the {HEADER_SIZE} byte header")]
    Truncated { len: usize },
    #[error("invalid message kind {0}")]
    InvalidKind(u8),
    #[error("invalid memory component {0}")]
    InvalidComponent(u8),
    #[error("invalid hit location {0}")]
    InvalidHitWhere(u8),
    #[error("data length {len} is neither zero nor the block size {block_size}")]
    InvalidDataLength { len: usize, block_size: usize },
    #[error("message length {len} does not match header ({expected} bytes expected)")]
    LengthMismatch { len: usize, expected: usize },
}

/// A coherence protocol message.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Message {
    pub kind: Kind,
    pub sender_component: MemComponent,
    pub receiver_component: MemComponent,
    pub requester: CoreId,
    pub addr: address,
    pub physical_addr: address,
    /// Exactly one cache block, if present.
    pub data: Option<Vec<u8>>,
    pub hit_where: HitWhere,
    pub perf: PerfHandle,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("from", &self.sender_component)
            .field("to", &self.receiver_component)
            .field("requester", &self.requester)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("physical_addr", &format_args!("{:#x}", self.physical_addr))
            .field("data", &self.data.as_ref().map(Vec::len))
            .field("hit_where", &self.hit_where)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}({:#x}, requester={}", self.kind, self.addr, self.requester)?;
        if self.has_data() {
            write!(f, ", data")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub kind: Kind,
    pub sender_component: MemComponent,
    pub receiver_component: MemComponent,
    pub requester: CoreId,
    pub addr: address,
    pub physical_addr: address,
    pub data: Option<Vec<u8>>,
    pub hit_where: HitWhere,
    pub perf: PerfHandle,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Message {
        debug_assert!(
            self.data.as_ref().map_or(true, |data| !data.is_empty()),
            "data must be absent rather than empty"
        );
        Message {
            kind: self.kind,
            sender_component: self.sender_component,
            receiver_component: self.receiver_component,
            requester: self.requester,
            addr: self.addr,
            physical_addr: self.physical_addr,
            data: self.data,
            hit_where: self.hit_where,
            perf: self.perf,
        }
    }
}

impl Message {
    /// A request from a core's last level cache to the directory.
    ///
    /// Virtual and physical address are identical.
    #[must_use]
    pub fn request(kind: Kind, requester: CoreId, addr: address) -> Self {
        Builder {
            kind,
            sender_component: MemComponent::LAST_LEVEL_CACHE,
            receiver_component: MemComponent::DIRECTORY,
            requester,
            addr,
            physical_addr: addr,
            data: None,
            hit_where: HitWhere::UNKNOWN,
            perf: PerfHandle::default(),
        }
        .build()
    }

    /// A reply from a core's last level cache to the directory.
    #[must_use]
    pub fn cache_reply(
        kind: Kind,
        requester: CoreId,
        addr: address,
        data: Option<Vec<u8>>,
    ) -> Self {
        Builder {
            kind,
            sender_component: MemComponent::LAST_LEVEL_CACHE,
            receiver_component: MemComponent::DIRECTORY,
            requester,
            addr,
            physical_addr: addr,
            data,
            hit_where: HitWhere::UNKNOWN,
            perf: PerfHandle::default(),
        }
        .build()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    /// Length of the encoded message in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data_len()
    }

    /// Serializes the message into a flat buffer: fixed header followed by the
    /// optional block payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind as u8);
        buf.push(self.sender_component as u8);
        buf.push(self.receiver_component as u8);
        buf.push(self.hit_where as u8);
        buf.extend_from_slice(&(self.requester as u32).to_le_bytes());
        buf.extend_from_slice(&self.addr.to_le_bytes());
        buf.extend_from_slice(&self.physical_addr.to_le_bytes());
        buf.extend_from_slice(&self.perf.0.to_le_bytes());
        buf.extend_from_slice(&(self.data_len() as u32).to_le_bytes());
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf
    }

    /// Reconstructs a message from a buffer produced by [`Message::encode`].
    pub fn decode(buf: &[u8], block_size: usize) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated { len: buf.len() });
        }
        let u32_at = |offset: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[offset..offset + 4]);
            u32::from_le_bytes(bytes)
        };
        let u64_at = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };

        let kind = Kind::from_repr(buf[0]).ok_or(DecodeError::InvalidKind(buf[0]))?;
        let sender_component =
            MemComponent::from_repr(buf[1]).ok_or(DecodeError::InvalidComponent(buf[1]))?;
        let receiver_component =
            MemComponent::from_repr(buf[2]).ok_or(DecodeError::InvalidComponent(buf[2]))?;
        let hit_where = HitWhere::from_repr(buf[3]).ok_or(DecodeError::InvalidHitWhere(buf[3]))?;
        let requester = u32_at(4) as CoreId;
        let addr = u64_at(8);
        let physical_addr = u64_at(16);
        let perf = PerfHandle(u64_at(24));
        let data_len = u32_at(32) as usize;

        if data_len != 0 && data_len != block_size {
            return Err(DecodeError::InvalidDataLength {
                len: data_len,
                block_size,
            });
        }
        let expected = HEADER_SIZE + data_len;
        if buf.len() != expected {
            return Err(DecodeError::LengthMismatch {
                len: buf.len(),
                expected,
            });
        }
        let data = (data_len > 0).then(|| buf[HEADER_SIZE..].to_vec());

        Ok(Message {
            kind,
            sender_component,
            receiver_component,
            requester,
            addr,
            physical_addr,
            data,
            hit_where,
            perf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, DecodeError, HitWhere, Kind, MemComponent, Message, PerfHandle};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn encode_decode_preserves_message() -> eyre::Result<()> {
        let msg = Builder {
            kind: Kind::FLUSH_REP,
            sender_component: MemComponent::LAST_LEVEL_CACHE,
            receiver_component: MemComponent::DIRECTORY,
            requester: 7,
            addr: 0x1000,
            physical_addr: 0x8000_1000,
            data: Some(vec![0xAB; 64]),
            hit_where: HitWhere::CACHE_REMOTE,
            perf: PerfHandle(42),
        }
        .build();
        let buf = msg.encode();
        diff::assert_eq!(buf.len(), super::HEADER_SIZE + 64);
        diff::assert_eq!(Message::decode(&buf, 64)?, msg);

        let without_data = Message { data: None, ..msg };
        diff::assert_eq!(
            Message::decode(&without_data.encode(), 64)?,
            without_data
        );
        Ok(())
    }

    #[test]
    fn decode_rejects_partial_blocks() {
        let mut msg = Message::request(Kind::SH_REQ, 1, 0x40);
        msg.data = Some(vec![1; 32]);
        diff::assert_eq!(
            Message::decode(&msg.encode(), 64),
            Err(DecodeError::InvalidDataLength {
                len: 32,
                block_size: 64
            })
        );
        diff::assert_eq!(
            Message::decode(&[0u8; 10], 64),
            Err(DecodeError::Truncated { len: 10 })
        );
        let mut buf = Message::request(Kind::SH_REQ, 1, 0x40).encode();
        buf[0] = 200;
        diff::assert_eq!(Message::decode(&buf, 64), Err(DecodeError::InvalidKind(200)));
    }
}
