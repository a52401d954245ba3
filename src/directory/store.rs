use super::{Entry, Sharers};
use crate::{address, config, Error};
use std::collections::HashMap;

/// Bounded, set-associative directory store.
///
/// Entries replaced to make room for a new block are moved to a side list
/// until their copies have been nullified, so replies for them still find
/// their entry.
#[derive(Debug)]
pub struct Store {
    num_sets: usize,
    associativity: usize,
    block_size_log2: u32,
    kind: config::DirectoryKind,
    max_hw_sharers: usize,
    max_num_sharers: usize,
    /// nset x assoc lines in total
    lines: Vec<Option<Entry>>,
    evicting: HashMap<address, Entry>,
}

impl Store {
    #[must_use]
    pub fn new(config: &config::Config) -> Self {
        let num_sets = config.directory.num_sets();
        let associativity = config.directory.associativity;
        Self {
            num_sets,
            associativity,
            block_size_log2: config.block_size_log2(),
            kind: config.directory.kind,
            max_hw_sharers: config.directory.max_hw_sharers,
            max_num_sharers: config.max_num_sharers(),
            lines: vec![None; num_sets * associativity],
            evicting: HashMap::new(),
        }
    }

    #[must_use]
    pub fn max_hw_sharers(&self) -> usize {
        self.max_hw_sharers
    }

    #[must_use]
    pub fn max_num_sharers(&self) -> usize {
        self.max_num_sharers
    }

    #[inline]
    fn set_index(&self, addr: address) -> usize {
        ((addr >> self.block_size_log2) % self.num_sets as u64) as usize
    }

    fn set(&self, addr: address) -> std::ops::Range<usize> {
        let start = self.set_index(addr) * self.associativity;
        start..start + self.associativity
    }

    fn way(&self, addr: address) -> Option<usize> {
        self.set(addr).find(|&idx| {
            self.lines[idx]
                .as_ref()
                .is_some_and(|entry| entry.addr == addr)
        })
    }

    #[must_use]
    pub fn lookup(&self, addr: address) -> Option<&Entry> {
        match self.way(addr) {
            Some(idx) => self.lines[idx].as_ref(),
            None => self.evicting.get(&addr),
        }
    }

    pub fn lookup_mut(&mut self, addr: address) -> Option<&mut Entry> {
        match self.way(addr) {
            Some(idx) => self.lines[idx].as_mut(),
            None => self.evicting.get_mut(&addr),
        }
    }

    fn new_entry(&self, addr: address, physical_addr: address) -> Entry {
        let sharers = Sharers::new(self.kind, self.max_hw_sharers, self.max_num_sharers);
        Entry::new(addr, physical_addr, sharers)
    }

    /// Inserts a fresh entry if the block's set has a free way.
    pub fn try_insert(&mut self, addr: address, physical_addr: address) -> bool {
        debug_assert!(self.lookup(addr).is_none());
        let free = self.set(addr).find(|&idx| self.lines[idx].is_none());
        match free {
            Some(idx) => {
                self.lines[idx] = Some(self.new_entry(addr, physical_addr));
                true
            }
            None => false,
        }
    }

    /// Entries competing with `addr` for a way.
    pub fn replacement_candidates(&self, addr: address) -> impl Iterator<Item = &Entry> + '_ {
        self.lines[self.set(addr)].iter().flatten()
    }

    /// Replaces `victim` with a fresh entry for `addr`.
    ///
    /// The victim stays reachable through [`Store::lookup`] until it is
    /// [released](Store::release).
    pub fn replace(
        &mut self,
        victim: address,
        addr: address,
        physical_addr: address,
    ) -> Result<(), Error> {
        let idx = self
            .way(victim)
            .ok_or(Error::MissingEntry { addr: victim })?;
        debug_assert_eq!(self.set_index(victim), self.set_index(addr));
        let new_entry = self.new_entry(addr, physical_addr);
        if let Some(old) = self.lines[idx].replace(new_entry) {
            self.evicting.insert(victim, old);
        }
        Ok(())
    }

    /// Drops a replaced entry once its block is no longer cached anywhere.
    pub fn release(&mut self, addr: address) -> Option<Entry> {
        self.evicting.remove(&addr)
    }

    #[must_use]
    pub fn is_evicting(&self, addr: address) -> bool {
        self.evicting.contains_key(&addr)
    }

    /// All tracked entries, including the ones being nullified.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.lines.iter().flatten().chain(self.evicting.values())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.iter().flatten().count() + self.evicting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::config;
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn store(total_entries: usize, associativity: usize) -> Store {
        let config = config::Config {
            directory: config::Directory {
                total_entries,
                associativity,
                ..config::Directory::default()
            },
            ..config::Config::default()
        };
        Store::new(&config)
    }

    #[test]
    fn insert_until_set_is_full() {
        let mut store = store(4, 2);
        // 0x0, 0x80 and 0x100 map to set 0
        assert!(store.try_insert(0x0, 0x0));
        assert!(store.try_insert(0x80, 0x80));
        assert!(!store.try_insert(0x100, 0x100));
        // 0x40 maps to set 1
        assert!(store.try_insert(0x40, 0x40));
        diff::assert_eq!(store.len(), 3);

        let mut candidates: Vec<_> = store
            .replacement_candidates(0x100)
            .map(|entry| entry.addr)
            .collect();
        candidates.sort_unstable();
        diff::assert_eq!(candidates, vec![0x0, 0x80]);
    }

    #[test]
    fn replaced_entry_stays_reachable_until_released() -> eyre::Result<()> {
        let mut store = store(2, 2);
        assert!(store.try_insert(0x0, 0x0));
        assert!(store.try_insert(0x40, 0x40));
        store.lookup_mut(0x40).unwrap().sharers.add(1);

        store.replace(0x40, 0x80, 0x80)?;
        assert!(store.is_evicting(0x40));
        assert!(store.lookup(0x80).is_some());
        diff::assert_eq!(store.lookup(0x40).map(|entry| entry.sharers.len()), Some(1));
        diff::assert_eq!(store.len(), 3);

        let released = store.release(0x40);
        diff::assert_eq!(released.map(|entry| entry.addr), Some(0x40));
        assert!(store.lookup(0x40).is_none());
        assert!(store.replace(0x40, 0xC0, 0xC0).is_err());
        Ok(())
    }
}
