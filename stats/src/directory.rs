use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

#[derive(
    Debug,
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
    UNCACHED = 0,
    SHARED,
    EXCLUSIVE,
    OWNED,
    MODIFIED,
}

#[derive(
    Debug,
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
pub enum MessageKind {
    EX_REQ = 0,
    SH_REQ,
    UPGRADE_REQ,
    INV_REQ,
    FLUSH_REQ,
    WB_REQ,
    NULLIFY_REQ,
    EX_REP,
    SH_REP,
    UPGRADE_REP,
    INV_REP,
    FLUSH_REP,
    WB_REP,
    DRAM_READ_REQ,
    DRAM_WRITE_REQ,
    DRAM_READ_REP,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRow {
    pub node: usize,
    pub metric: String,
    pub value: u64,
}

/// Directory statistics of a single home node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Number of modeled directory lookups (one per request from a cache).
    pub lookups: u64,
    /// Number of directory entries evicted, keyed by the victim state.
    pub evictions: HashMap<State, u64>,
    /// Number of shared requests served by a cache-to-cache forward.
    pub forward: u64,
    /// Number of forwards where the forwarder no longer had the data.
    pub forward_failed: u64,
    /// Number of broadcast invalidations.
    pub broadcasts: u64,
    pub received: HashMap<MessageKind, u64>,
    pub sent: HashMap<MessageKind, u64>,
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            lookups: 0,
            evictions: State::iter().map(|state| (state, 0)).collect(),
            forward: 0,
            forward_failed: 0,
            broadcasts: 0,
            received: MessageKind::iter().map(|kind| (kind, 0)).collect(),
            sent: MessageKind::iter().map(|kind| (kind, 0)).collect(),
        }
    }
}

impl std::ops::AddAssign for Directory {
    fn add_assign(&mut self, other: Self) {
        self.lookups += other.lookups;
        self.forward += other.forward;
        self.forward_failed += other.forward_failed;
        self.broadcasts += other.broadcasts;
        for (k, v) in other.evictions {
            *self.evictions.entry(k).or_insert(0) += v;
        }
        for (k, v) in other.received {
            *self.received.entry(k).or_insert(0) += v;
        }
        for (k, v) in other.sent {
            *self.sent.entry(k).or_insert(0) += v;
        }
    }
}

impl Directory {
    pub fn inc_received(&mut self, kind: impl Into<MessageKind>) {
        *self.received.entry(kind.into()).or_insert(0) += 1;
    }

    pub fn inc_sent(&mut self, kind: impl Into<MessageKind>) {
        *self.sent.entry(kind.into()).or_insert(0) += 1;
    }

    pub fn inc_eviction(&mut self, state: impl Into<State>) {
        *self.evictions.entry(state.into()).or_insert(0) += 1;
    }

    #[must_use]
    pub fn num_sent(&self, kind: MessageKind) -> u64 {
        self.sent.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn num_received(&self, kind: MessageKind) -> u64 {
        self.received.get(&kind).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn num_evictions(&self) -> u64 {
        self.evictions.values().sum()
    }

    #[must_use]
    pub fn flatten(&self, node: usize) -> Vec<CsvRow> {
        let row = |metric: String, value: u64| CsvRow {
            node,
            metric,
            value,
        };
        let mut rows = vec![
            row("lookups".to_string(), self.lookups),
            row("forward".to_string(), self.forward),
            row("forward_failed".to_string(), self.forward_failed),
            row("broadcasts".to_string(), self.broadcasts),
        ];
        for state in State::iter() {
            let value = self.evictions.get(&state).copied().unwrap_or(0);
            rows.push(row(format!("evict[{state:?}]"), value));
        }
        for kind in MessageKind::iter() {
            rows.push(row(format!("received[{kind:?}]"), self.num_received(kind)));
        }
        for kind in MessageKind::iter() {
            rows.push(row(format!("sent[{kind:?}]"), self.num_sent(kind)));
        }
        rows
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut out = f.debug_struct("DirectoryStats");
        out.field("lookups", &self.lookups);
        out.field("forward", &self.forward);
        out.field("forward_failed", &self.forward_failed);
        out.field("broadcasts", &self.broadcasts);

        let mut evictions: Vec<_> = self.evictions.iter().filter(|(_, &n)| n > 0).collect();
        evictions.sort();
        for (state, count) in evictions {
            out.field(&format!("evict[{state:?}]"), count);
        }
        let mut sent: Vec<_> = self.sent.iter().filter(|(_, &n)| n > 0).collect();
        sent.sort();
        for (kind, count) in sent {
            out.field(&format!("sent[{kind:?}]"), count);
        }
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Directory, MessageKind, State};

    #[test]
    fn add_assign_sums_counters() {
        let mut a = Directory::default();
        a.inc_sent(MessageKind::INV_REQ);
        a.inc_eviction(State::SHARED);
        a.forward = 2;

        let mut b = Directory::default();
        b.inc_sent(MessageKind::INV_REQ);
        b.inc_sent(MessageKind::EX_REP);
        b.forward_failed = 1;

        a += b;
        assert_eq!(a.num_sent(MessageKind::INV_REQ), 2);
        assert_eq!(a.num_sent(MessageKind::EX_REP), 1);
        assert_eq!(a.num_evictions(), 1);
        assert_eq!((a.forward, a.forward_failed), (2, 1));
    }

    #[test]
    fn flatten_emits_one_row_per_counter() {
        let stats = Directory::default();
        let rows = stats.flatten(3);
        assert!(rows.iter().all(|row| row.node == 3));
        assert_eq!(rows.len(), 4 + 5 + 2 * 16);
    }
}
