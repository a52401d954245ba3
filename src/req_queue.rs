use super::{address, msg, CoreId};
use indexmap::IndexMap;
use std::collections::VecDeque;

/// A request waiting for (or in) service at the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub msg: msg::Message,
    /// Arrival time.
    pub time: u64,
    /// Data was requested from memory.
    ///
    /// Voluntary invalidations must not wake the request until the data arrives.
    pub waiting_for_data: bool,
    /// Sharer asked to forward its copy.
    ///
    /// A failed forward is never retried.
    pub forwarding_from: Option<CoreId>,
}

impl PendingRequest {
    #[must_use]
    pub fn new(msg: msg::Message, time: u64) -> Self {
        Self {
            msg,
            time,
            waiting_for_data: false,
            forwarding_from: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> msg::Kind {
        self.msg.kind
    }

    #[must_use]
    pub fn requester(&self) -> CoreId {
        self.msg.requester
    }

    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.forwarding_from.is_some()
    }
}

impl std::fmt::Display for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.msg, self.time)?;
        if self.waiting_for_data {
            write!(f, "[waiting]")?;
        }
        if let Some(forwarder) = self.forwarding_from {
            write!(f, "[forwarding from {forwarder}]")?;
        }
        Ok(())
    }
}

/// Per block FIFO of pending requests.
///
/// Only the head of a queue is in service.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: IndexMap<address, VecDeque<PendingRequest>>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request and returns the new queue length.
    pub fn enqueue(&mut self, addr: address, req: PendingRequest) -> usize {
        debug_assert!(req.kind().is_queued_request());
        let queue = self.entries.entry(addr).or_default();
        queue.push_back(req);
        queue.len()
    }

    /// Removes the head of the queue.
    pub fn dequeue(&mut self, addr: address) -> Option<PendingRequest> {
        let queue = self.entries.get_mut(&addr)?;
        let head = queue.pop_front();
        if queue.is_empty() {
            self.entries.shift_remove(&addr);
        }
        head
    }

    #[must_use]
    pub fn front(&self, addr: address) -> Option<&PendingRequest> {
        self.entries.get(&addr).and_then(VecDeque::front)
    }

    pub fn front_mut(&mut self, addr: address) -> Option<&mut PendingRequest> {
        self.entries.get_mut(&addr).and_then(VecDeque::front_mut)
    }

    #[must_use]
    pub fn len(&self, addr: address) -> usize {
        self.entries.get(&addr).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self, addr: address) -> bool {
        self.len(addr) == 0
    }

    /// Blocks with requests in flight, in order of first arrival.
    pub fn addresses(&self) -> impl Iterator<Item = address> + '_ {
        self.entries.keys().copied()
    }

    /// Total number of pending requests.
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingRequest, RequestQueue};
    use crate::msg::{Kind, Message};
    use pretty_assertions_sorted::assert_eq;

    #[test]
    fn queue_is_fifo_per_block() {
        let mut queue = RequestQueue::new();
        assert_eq!(
            queue.enqueue(0x40, PendingRequest::new(Message::request(Kind::SH_REQ, 1, 0x40), 0)),
            1
        );
        assert_eq!(
            queue.enqueue(0x80, PendingRequest::new(Message::request(Kind::EX_REQ, 2, 0x80), 1)),
            1
        );
        assert_eq!(
            queue.enqueue(0x40, PendingRequest::new(Message::request(Kind::EX_REQ, 3, 0x40), 2)),
            2
        );
        assert_eq!(queue.num_pending(), 3);
        assert_eq!(queue.addresses().collect::<Vec<_>>(), vec![0x40, 0x80]);

        queue.front_mut(0x40).unwrap().waiting_for_data = true;
        let head = queue.dequeue(0x40).unwrap();
        assert_eq!((head.kind(), head.requester()), (Kind::SH_REQ, 1));
        assert!(head.waiting_for_data);
        assert_eq!(queue.front(0x40).map(PendingRequest::requester), Some(3));

        assert!(queue.dequeue(0x40).is_some());
        assert!(queue.is_empty(0x40));
        assert_eq!(queue.addresses().collect::<Vec<_>>(), vec![0x80]);
        assert!(queue.dequeue(0x40).is_none());
    }
}
