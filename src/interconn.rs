use super::{msg, CoreId};
use console::style;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outbound side of the memory manager as seen by a policy.
///
/// Sending is fire-and-forget.
pub trait MemoryManager: std::fmt::Debug + Send + Sync {
    fn send(&self, msg: msg::Message, receiver: CoreId);

    /// Sends the message to the last level cache of every core.
    fn broadcast(&self, msg: msg::Message);

    #[must_use]
    fn cache_block_size(&self) -> usize;
}

/// An encoded message in flight between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: CoreId,
    pub dest: CoreId,
    /// Component at `dest` the message is for.
    pub component: msg::MemComponent,
    pub payload: Vec<u8>,
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = self
            .payload
            .first()
            .and_then(|kind| msg::Kind::from_repr(*kind));
        write!(
            f,
            "Packet({:?}, {} -> {}/{:?}, {} bytes)",
            kind,
            self.src,
            self.dest,
            self.component,
            self.payload.len()
        )
    }
}

/// Interconnect is a general interconnect
///
/// Functions are not mutable because the interface should
/// implement locking internally
pub trait Interconnect<P>: std::fmt::Debug + Send + Sync {
    fn busy(&self) -> bool;

    fn push(&self, src: CoreId, dest: CoreId, packet: P);

    /// Next packet in global delivery order.
    fn pop(&self) -> Option<P>;

    #[must_use]
    fn num_nodes(&self) -> usize;
}

/// Delivers packets in global FIFO order without modeling latency.
#[derive(Debug)]
pub struct ToyInterconnect<P> {
    pub num_nodes: usize,
    queue: Mutex<VecDeque<P>>,
}

impl<P> ToyInterconnect<P> {
    #[must_use]
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Interconnect<P> for ToyInterconnect<P>
where
    P: std::fmt::Display + std::fmt::Debug + Send,
{
    fn busy(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn push(&self, src: CoreId, dest: CoreId, packet: P) {
        debug_assert!(src < self.num_nodes && dest < self.num_nodes);
        log::debug!(
            "{}: from node {src} to {dest}",
            style(format!("INTERCONN PUSH {packet}")).bold(),
        );
        self.queue.lock().push_back(packet);
    }

    fn pop(&self) -> Option<P> {
        let packet = self.queue.lock().pop_front();
        if let Some(ref packet) = packet {
            log::debug!("{}", style(format!("INTERCONN POP {packet}")).bold());
        }
        packet
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }
}

/// Memory manager of a single node, encoding messages onto an interconnect.
#[derive(Debug)]
pub struct NetworkMemoryManager<I> {
    node: CoreId,
    block_size: usize,
    interconn: Arc<I>,
}

impl<I> NetworkMemoryManager<I> {
    #[must_use]
    pub fn new(node: CoreId, block_size: usize, interconn: Arc<I>) -> Self {
        Self {
            node,
            block_size,
            interconn,
        }
    }
}

impl<I> MemoryManager for NetworkMemoryManager<I>
where
    I: Interconnect<Packet>,
{
    fn send(&self, msg: msg::Message, receiver: CoreId) {
        debug_assert!(msg.data.as_ref().map_or(true, |data| data.len() == self.block_size));
        let packet = Packet {
            src: self.node,
            dest: receiver,
            component: msg.receiver_component,
            payload: msg.encode(),
        };
        self.interconn.push(self.node, receiver, packet);
    }

    fn broadcast(&self, msg: msg::Message) {
        let payload = msg.encode();
        for dest in 0..self.interconn.num_nodes() {
            let packet = Packet {
                src: self.node,
                dest,
                component: msg::MemComponent::LAST_LEVEL_CACHE,
                payload: payload.clone(),
            };
            self.interconn.push(self.node, dest, packet);
        }
    }

    fn cache_block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::{Interconnect, MemoryManager, NetworkMemoryManager, Packet, ToyInterconnect};
    use crate::msg::{Kind, MemComponent, Message};
    use color_eyre::eyre;
    use pretty_assertions_sorted::assert_eq;
    use std::sync::Arc;

    #[test]
    fn broadcast_reaches_every_node_in_order() -> eyre::Result<()> {
        crate::testing::init_logging();
        let interconn: Arc<ToyInterconnect<Packet>> = Arc::new(ToyInterconnect::new(3));
        let mem = NetworkMemoryManager::new(1, 64, Arc::clone(&interconn));

        mem.send(Message::request(Kind::SH_REQ, 1, 0x40), 0);
        mem.broadcast(Message::request(Kind::INV_REQ, 2, 0x80));
        assert_eq!(interconn.len(), 4);

        let first = interconn.pop().unwrap();
        assert_eq!((first.src, first.dest), (1, 0));
        assert_eq!(first.component, MemComponent::DIRECTORY);
        assert_eq!(Message::decode(&first.payload, 64)?.kind, Kind::SH_REQ);

        let dests: Vec<_> = std::iter::from_fn(|| interconn.pop())
            .map(|packet| (packet.dest, packet.component))
            .collect();
        assert_eq!(
            dests,
            vec![
                (0, MemComponent::LAST_LEVEL_CACHE),
                (1, MemComponent::LAST_LEVEL_CACHE),
                (2, MemComponent::LAST_LEVEL_CACHE),
            ]
        );
        assert!(!interconn.busy());
        Ok(())
    }
}
