use super::{
    address,
    interconn::Packet,
    msg::{MemComponent, Message},
    policy::{Dispatcher, Policy},
    CoreId, Error,
};

/// Directory side of a home node.
///
/// Decodes packets addressed to the directory and hands them to the policy
/// serving their address, based on the sending component.
#[derive(Debug)]
pub struct HomeNode {
    pub id: CoreId,
    block_size: usize,
    dispatcher: Dispatcher,
}

impl HomeNode {
    #[must_use]
    pub fn new(id: CoreId, block_size: usize, dispatcher: Dispatcher) -> Self {
        Self {
            id,
            block_size,
            dispatcher,
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Blocks with directory requests that were not served yet.
    #[must_use]
    pub fn pending(&self) -> Vec<address> {
        self.dispatcher.pending()
    }

    pub fn receive(&mut self, packet: &Packet, time: u64) -> Result<(), Error> {
        debug_assert_eq!(packet.dest, self.id);
        let msg = Message::decode(&packet.payload, self.block_size)?;
        match msg.sender_component {
            MemComponent::LAST_LEVEL_CACHE => {
                self.dispatcher.handle_from_cache(packet.src, msg, time)
            }
            MemComponent::DRAM => self.dispatcher.handle_from_memory(packet.src, msg, time),
            MemComponent::DIRECTORY => {
                self.dispatcher
                    .handle_from_peer_directory(packet.src, msg, time)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HomeNode;
    use crate::{
        config,
        home::Interleaved,
        interconn::Packet,
        msg::{DecodeError, Kind, MemComponent, Message},
        policy::{Dispatcher, DirectoryPolicy},
        testing::{self, Recorder},
        Error,
    };
    use color_eyre::eyre;
    use parking_lot::Mutex;
    use pretty_assertions_sorted as diff;
    use std::sync::Arc;

    fn home_node(mem: &Arc<Recorder>) -> HomeNode {
        let config = config::Config::default();
        let policy = DirectoryPolicy::new(
            0,
            config.protocol,
            &config,
            Arc::new(Interleaved::new(6, vec![0])),
            Arc::clone(mem) as _,
            Arc::new(Mutex::new(stats::Directory::default())),
        );
        HomeNode::new(0, config.cache_block_size, Dispatcher::new(Box::new(policy)))
    }

    #[test]
    fn routes_by_sender_component() -> eyre::Result<()> {
        testing::init_logging();
        let mem = Arc::new(Recorder::new(64));
        let mut node = home_node(&mem);

        let request = Packet {
            src: 1,
            dest: 0,
            component: MemComponent::DIRECTORY,
            payload: Message::request(Kind::EX_REQ, 1, 0x40).encode(),
        };
        node.receive(&request, 0)?;
        diff::assert_eq!(mem.take_kinds(), vec![(Kind::DRAM_READ_REQ, Some(0))]);

        // a peer directory may only forward to the right home
        let mut forwarded = Message::request(Kind::SH_REQ, 2, 0x40);
        forwarded.sender_component = MemComponent::DIRECTORY;
        let forwarded = Packet {
            src: 3,
            dest: 0,
            component: MemComponent::DIRECTORY,
            payload: forwarded.encode(),
        };
        node.receive(&forwarded, 1)?;
        assert!(mem.take().is_empty());
        diff::assert_eq!(
            node.dispatcher().policy_id(0x40),
            crate::policy::PolicyId::DEFAULT
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_packets() {
        let mem = Arc::new(Recorder::new(64));
        let mut node = home_node(&mem);
        let packet = Packet {
            src: 1,
            dest: 0,
            component: MemComponent::DIRECTORY,
            payload: vec![1, 2, 3],
        };
        diff::assert_eq!(
            node.receive(&packet, 0),
            Err(Error::Decode(DecodeError::Truncated { len: 3 }))
        );
    }
}
