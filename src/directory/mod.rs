pub mod store;

pub use store::Store;

use crate::{address, config, CoreId};
use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Directory state of a block.
#[derive(
    Debug,
    Default,
    strum::EnumIter,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum State {
    #[default]
    UNCACHED,
    SHARED,
    EXCLUSIVE,
    /// Reserved.
    OWNED,
    MODIFIED,
}

impl State {
    #[must_use]
    pub fn is_owned_exclusively(self) -> bool {
        matches!(self, State::EXCLUSIVE | State::MODIFIED)
    }
}

impl From<State> for stats::directory::State {
    fn from(state: State) -> Self {
        match state {
            State::UNCACHED => Self::UNCACHED,
            State::SHARED => Self::SHARED,
            State::EXCLUSIVE => Self::EXCLUSIVE,
            State::OWNED => Self::OWNED,
            State::MODIFIED => Self::MODIFIED,
        }
    }
}

/// Sharer set of a directory entry.
///
/// Membership is always tracked exactly. The hardware model only decides
/// whether a sharer can be added and whether invalidations must be broadcast.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Sharers {
    kind: config::DirectoryKind,
    max_hw_sharers: usize,
    members: BitVec,
    broadcast: bool,
}

impl std::fmt::Debug for Sharers {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut set = f.debug_set();
        set.entries(self.iter());
        if self.broadcast {
            set.entry(&"*");
        }
        set.finish()
    }
}

impl Sharers {
    #[must_use]
    pub fn new(kind: config::DirectoryKind, max_hw_sharers: usize, max_num_sharers: usize) -> Self {
        Self {
            kind,
            max_hw_sharers,
            members: BitVec::repeat(false, max_num_sharers),
            broadcast: false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.count_ones()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.not_any()
    }

    #[must_use]
    pub fn contains(&self, core: CoreId) -> bool {
        self.members.get(core).is_some_and(|bit| *bit)
    }

    /// Whether invalidations must conservatively go to every core.
    #[must_use]
    pub fn in_broadcast_mode(&self) -> bool {
        self.broadcast
    }

    /// Adds a sharer.
    ///
    /// Returns `false` if the hardware model cannot track another sharer.
    pub fn add(&mut self, core: CoreId) -> bool {
        if self.contains(core) {
            return true;
        }
        let count = self.len();
        match self.kind {
            config::DirectoryKind::LIMITED_NO_BROADCAST if count >= self.max_hw_sharers => {
                return false;
            }
            config::DirectoryKind::LIMITED_BROADCAST if count >= self.max_hw_sharers => {
                self.broadcast = true;
            }
            _ => {}
        }
        self.members.set(core, true);
        true
    }

    pub fn remove(&mut self, core: CoreId) {
        if core < self.members.len() {
            self.members.set(core, false);
        }
        if self.is_empty() {
            self.broadcast = false;
        }
    }

    /// The lowest numbered sharer.
    #[must_use]
    pub fn one(&self) -> Option<CoreId> {
        self.members.first_one()
    }

    pub fn iter(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.members.iter_ones()
    }

    /// Sharers to invalidate, and whether to broadcast instead.
    #[must_use]
    pub fn list(&self) -> (bool, SmallVec<[CoreId; 8]>) {
        (self.broadcast, self.iter().collect())
    }
}

/// Coherence metadata of a single block.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    pub addr: address,
    pub physical_addr: address,
    pub state: State,
    pub owner: Option<CoreId>,
    pub sharers: Sharers,
    /// Sharer that most recently received a cache-to-cache copy (MESIF).
    pub forwarder: Option<CoreId>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("sharers", &self.sharers)
            .field("forwarder", &self.forwarder)
            .finish()
    }
}

impl Entry {
    #[must_use]
    pub fn new(addr: address, physical_addr: address, sharers: Sharers) -> Self {
        debug_assert!(sharers.is_empty());
        Self {
            addr,
            physical_addr,
            state: State::UNCACHED,
            owner: None,
            sharers,
            forwarder: None,
        }
    }

    /// Checks the relation between state, owner and sharers.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        match self.state {
            State::UNCACHED => self.sharers.is_empty() && self.owner.is_none(),
            State::SHARED => !self.sharers.is_empty() && self.owner.is_none(),
            State::EXCLUSIVE | State::MODIFIED => {
                self.sharers.len() == 1 && self.owner.is_some() && self.owner == self.sharers.one()
            }
            State::OWNED => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Entry, Sharers, State};
    use crate::config::DirectoryKind;
    use pretty_assertions_sorted::assert_eq;

    #[test]
    fn limited_broadcast_overflows_into_broadcast_mode() {
        let mut sharers = Sharers::new(DirectoryKind::LIMITED_BROADCAST, 2, 8);
        assert!(sharers.add(1));
        assert!(sharers.add(5));
        assert!(!sharers.in_broadcast_mode());
        assert!(sharers.add(3));
        assert!(sharers.in_broadcast_mode());
        assert_eq!(sharers.iter().collect::<Vec<_>>(), vec![1, 3, 5]);

        sharers.remove(1);
        sharers.remove(5);
        assert!(sharers.in_broadcast_mode());
        sharers.remove(3);
        assert!(!sharers.in_broadcast_mode());
        assert!(sharers.is_empty());
    }

    #[test]
    fn limited_no_broadcast_refuses_extra_sharers() {
        let mut sharers = Sharers::new(DirectoryKind::LIMITED_NO_BROADCAST, 2, 8);
        assert!(sharers.add(4));
        assert!(sharers.add(2));
        assert!(sharers.add(4));
        assert!(!sharers.add(6));
        assert_eq!(sharers.len(), 2);
        assert_eq!(sharers.one(), Some(2));
        let (broadcast, list) = sharers.list();
        assert!(!broadcast);
        assert_eq!(list.as_slice(), &[2, 4]);
    }

    #[test]
    fn entry_consistency() {
        let mut entry = Entry::new(0x40, 0x40, Sharers::new(DirectoryKind::FULL_MAP, 4, 4));
        assert!(entry.is_consistent());

        entry.sharers.add(2);
        entry.state = State::EXCLUSIVE;
        assert!(!entry.is_consistent());
        entry.owner = Some(2);
        assert!(entry.is_consistent());

        entry.state = State::SHARED;
        assert!(!entry.is_consistent());
        entry.owner = None;
        assert!(entry.is_consistent());
    }
}
