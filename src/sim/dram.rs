use crate::{
    address,
    interconn::MemoryManager,
    msg::{self, HitWhere, Kind, MemComponent, Message},
    CoreId, Error,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Functional main memory behind a home node's directory.
///
/// Blocks never written read as zeros.
#[derive(Debug)]
pub struct Dram {
    node: CoreId,
    block_size: usize,
    mem: Arc<dyn MemoryManager>,
    blocks: HashMap<address, Vec<u8>>,
    pub num_reads: u64,
    pub num_writes: u64,
}

impl Dram {
    #[must_use]
    pub fn new(node: CoreId, mem: Arc<dyn MemoryManager>) -> Self {
        Self {
            node,
            block_size: mem.cache_block_size(),
            mem,
            blocks: HashMap::new(),
            num_reads: 0,
            num_writes: 0,
        }
    }

    #[must_use]
    pub fn block(&self, physical_addr: address) -> Vec<u8> {
        self.blocks
            .get(&physical_addr)
            .cloned()
            .unwrap_or_else(|| vec![0; self.block_size])
    }

    pub fn receive(&mut self, msg: Message) -> Result<(), Error> {
        match msg.kind {
            Kind::DRAM_READ_REQ => {
                self.num_reads += 1;
                let reply = msg::Builder {
                    kind: Kind::DRAM_READ_REP,
                    sender_component: MemComponent::DRAM,
                    receiver_component: MemComponent::DIRECTORY,
                    data: Some(self.block(msg.physical_addr)),
                    hit_where: HitWhere::DRAM,
                    requester: msg.requester,
                    addr: msg.addr,
                    physical_addr: msg.physical_addr,
                    perf: msg.perf,
                }
                .build();
                self.mem.send(reply, self.node);
                Ok(())
            }
            Kind::DRAM_WRITE_REQ => {
                let data = msg.data.ok_or(Error::MissingData {
                    kind: msg.kind,
                    addr: msg.addr,
                })?;
                self.num_writes += 1;
                self.blocks.insert(msg.physical_addr, data);
                Ok(())
            }
            kind => Err(Error::UnexpectedMessage {
                kind,
                addr: msg.addr,
                state: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Dram;
    use crate::{
        msg::{self, HitWhere, Kind, MemComponent, Message},
        testing::Recorder,
    };
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use std::sync::Arc;

    fn dram_request(kind: Kind, requester: usize, data: Option<Vec<u8>>) -> Message {
        msg::Builder {
            kind,
            sender_component: MemComponent::DIRECTORY,
            receiver_component: MemComponent::DRAM,
            requester,
            addr: 0x40,
            physical_addr: 0x40,
            data,
            hit_where: HitWhere::UNKNOWN,
            perf: msg::PerfHandle(3),
        }
        .build()
    }

    #[test]
    fn reads_back_written_blocks() -> eyre::Result<()> {
        let mem = Arc::new(Recorder::new(4));
        let mut dram = Dram::new(2, Arc::clone(&mem) as _);

        dram.receive(dram_request(Kind::DRAM_READ_REQ, 1, None))?;
        dram.receive(dram_request(Kind::DRAM_WRITE_REQ, 1, Some(vec![1, 2, 3, 4])))?;
        dram.receive(dram_request(Kind::DRAM_READ_REQ, 3, None))?;

        let sent = mem.take();
        diff::assert_eq!(sent.len(), 2);
        diff::assert_eq!(sent[0].receiver, Some(2));
        diff::assert_eq!(sent[0].msg.data, Some(vec![0; 4]));
        diff::assert_eq!(sent[1].msg.kind, Kind::DRAM_READ_REP);
        diff::assert_eq!(sent[1].msg.requester, 3);
        diff::assert_eq!(sent[1].msg.hit_where, HitWhere::DRAM);
        diff::assert_eq!(sent[1].msg.perf, msg::PerfHandle(3));
        diff::assert_eq!(sent[1].msg.data, Some(vec![1, 2, 3, 4]));
        diff::assert_eq!((dram.num_reads, dram.num_writes), (2, 1));
        Ok(())
    }
}
