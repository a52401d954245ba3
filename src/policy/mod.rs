pub mod directory;

pub use directory::DirectoryPolicy;

use crate::{address, msg, segment::SegmentTable, CoreId, Error};
use std::collections::HashMap;

/// Identifier of a registered policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId(pub u64);

impl PolicyId {
    /// The directory engine serving all addresses outside of any segment.
    pub const DEFAULT: PolicyId = PolicyId(0);
}

/// Consistency policy of a home node.
///
/// One entry point per logical sender. Each call runs to completion and
/// leaves anything it waits for as queued state.
pub trait Policy: std::fmt::Debug + Send {
    fn handle_from_cache(&mut self, sender: CoreId, msg: msg::Message, time: u64)
        -> Result<(), Error>;

    fn handle_from_memory(&mut self, sender: CoreId, msg: msg::Message, time: u64)
        -> Result<(), Error>;

    fn handle_from_peer_directory(
        &mut self,
        sender: CoreId,
        msg: msg::Message,
        time: u64,
    ) -> Result<(), Error>;

    /// Blocks with requests that were not served yet.
    fn pending(&self) -> Vec<address> {
        Vec::new()
    }
}

/// Selects the policy for each message by the segment of its address.
#[derive(Debug)]
pub struct Dispatcher {
    policies: HashMap<PolicyId, Box<dyn Policy>>,
    segments: SegmentTable,
}

impl Dispatcher {
    #[must_use]
    pub fn new(default: Box<dyn Policy>) -> Self {
        Self {
            policies: HashMap::from([(PolicyId::DEFAULT, default)]),
            segments: SegmentTable::new(),
        }
    }

    pub fn register(&mut self, id: PolicyId, policy: Box<dyn Policy>) {
        self.policies.insert(id, policy);
    }

    /// Serves `[start, end)` with a registered policy.
    pub fn add_segment(&mut self, start: address, end: address, id: PolicyId) -> Result<(), Error> {
        if !self.policies.contains_key(&id) {
            return Err(Error::UnknownPolicy { id });
        }
        self.segments.create(start, end, id)?;
        Ok(())
    }

    #[must_use]
    pub fn policy_id(&self, addr: address) -> PolicyId {
        self.segments.lookup(addr).unwrap_or(PolicyId::DEFAULT)
    }

    fn policy(&mut self, addr: address) -> Result<&mut Box<dyn Policy>, Error> {
        let id = self.policy_id(addr);
        self.policies
            .get_mut(&id)
            .ok_or(Error::UnknownPolicy { id })
    }
}

impl Policy for Dispatcher {
    fn handle_from_cache(
        &mut self,
        sender: CoreId,
        msg: msg::Message,
        time: u64,
    ) -> Result<(), Error> {
        self.policy(msg.physical_addr)?
            .handle_from_cache(sender, msg, time)
    }

    fn handle_from_memory(
        &mut self,
        sender: CoreId,
        msg: msg::Message,
        time: u64,
    ) -> Result<(), Error> {
        self.policy(msg.physical_addr)?
            .handle_from_memory(sender, msg, time)
    }

    fn handle_from_peer_directory(
        &mut self,
        sender: CoreId,
        msg: msg::Message,
        time: u64,
    ) -> Result<(), Error> {
        self.policy(msg.physical_addr)?
            .handle_from_peer_directory(sender, msg, time)
    }

    fn pending(&self) -> Vec<address> {
        let mut pending: Vec<address> = self
            .policies
            .values()
            .flat_map(|policy| policy.pending())
            .collect();
        pending.sort_unstable();
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::{Dispatcher, Policy, PolicyId};
    use crate::{
        msg::{Kind, Message},
        CoreId, Error,
    };
    use color_eyre::eyre;
    use parking_lot::Mutex;
    use pretty_assertions_sorted::assert_eq;
    use std::sync::Arc;

    /// Records which entry point saw which address.
    #[derive(Debug)]
    struct Tap {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, &'static str, u64)>>>,
    }

    impl Policy for Tap {
        fn handle_from_cache(&mut self, _: CoreId, msg: Message, _: u64) -> Result<(), Error> {
            self.seen.lock().push((self.name, "cache", msg.addr));
            Ok(())
        }

        fn handle_from_memory(&mut self, _: CoreId, msg: Message, _: u64) -> Result<(), Error> {
            self.seen.lock().push((self.name, "memory", msg.addr));
            Ok(())
        }

        fn handle_from_peer_directory(
            &mut self,
            _: CoreId,
            msg: Message,
            _: u64,
        ) -> Result<(), Error> {
            self.seen.lock().push((self.name, "peer", msg.addr));
            Ok(())
        }
    }

    #[test]
    fn dispatch_by_segment() -> eyre::Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tap = |name| {
            Box::new(Tap {
                name,
                seen: Arc::clone(&seen),
            })
        };
        let mut dispatcher = Dispatcher::new(tap("default"));
        dispatcher.register(PolicyId(1), tap("segment"));
        dispatcher.add_segment(0x1000, 0x2000, PolicyId(1))?;
        assert_eq!(
            dispatcher.add_segment(0x3000, 0x4000, PolicyId(7)),
            Err(Error::UnknownPolicy { id: PolicyId(7) })
        );

        dispatcher.handle_from_cache(1, Message::request(Kind::SH_REQ, 1, 0x40), 0)?;
        dispatcher.handle_from_memory(0, Message::request(Kind::DRAM_READ_REP, 1, 0x1040), 0)?;
        dispatcher.handle_from_peer_directory(2, Message::request(Kind::EX_REQ, 1, 0x2000), 0)?;

        assert_eq!(
            *seen.lock(),
            vec![
                ("default", "cache", 0x40),
                ("segment", "memory", 0x1040),
                ("default", "peer", 0x2000),
            ]
        );
        Ok(())
    }
}
