use crate::{address, directory, msg, policy::PolicyId, CoreId};

/// A violated protocol invariant.
///
/// The directory engine is a closed system: every one of these is a defect in
/// the caller (or the engine) and aborts the simulation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected {kind:?} for block {addr:#x} in state {state:?}")]
    UnexpectedMessage {
        kind: msg::Kind,
        addr: address,
        state: Option<directory::State>,
    },
    #[error("no directory entry for block {addr:#x}")]
    MissingEntry { addr: address },
    #[error("cannot replace a directory entry for block {addr:#x}: every candidate has outstanding requests")]
    NoEvictionCandidate { addr: address },
    #[error("{kind:?} from core {core} for block {addr:#x} which it does not share")]
    NotASharer {
        kind: msg::Kind,
        core: CoreId,
        addr: address,
    },
    #[error("{kind:?} for block {addr:#x} carries no data")]
    MissingData { kind: msg::Kind, addr: address },
    #[error("core {core} is not tracked by the directory")]
    InvalidCore { core: CoreId },
    #[error("{kind:?} for block {addr:#x} without a pending request")]
    NoPendingRequest { kind: msg::Kind, addr: address },
    #[error("block {addr:#x} is homed at node {home}, not at node {node}")]
    WrongHome {
        addr: address,
        home: CoreId,
        node: CoreId,
    },
    #[error("unexpected message from {component:?}")]
    UnexpectedSender { component: msg::MemComponent },
    #[error("segment [{start:#x}, {end:#x}) overlaps an existing segment")]
    SegmentOverlap { start: address, end: address },
    #[error("policy {id:?} is not registered")]
    UnknownPolicy { id: PolicyId },
    #[error(transparent)]
    Decode(#[from] msg::DecodeError),
}
