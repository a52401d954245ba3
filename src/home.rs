use super::{address, CoreId};

/// Maps a physical address to the node holding its directory entry.
pub trait HomeLookup: std::fmt::Debug + Send + Sync + 'static {
    #[must_use]
    fn home(&self, physical_addr: address) -> CoreId;
}

/// Interleaves blocks of `1 << granularity_log2` bytes across nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interleaved {
    pub granularity_log2: u32,
    pub nodes: Vec<CoreId>,
}

impl Interleaved {
    #[must_use]
    pub fn new(granularity_log2: u32, nodes: Vec<CoreId>) -> Self {
        assert!(!nodes.is_empty(), "need at least one home node");
        Self {
            granularity_log2,
            nodes,
        }
    }
}

impl HomeLookup for Interleaved {
    fn home(&self, physical_addr: address) -> CoreId {
        let idx = (physical_addr >> self.granularity_log2) % self.nodes.len() as u64;
        self.nodes[idx as usize]
    }
}
