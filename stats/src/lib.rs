#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod directory;
pub mod sim;

pub use directory::Directory;
pub use sim::Sim;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    /// Per home node directory statistics.
    pub directories: HashMap<usize, Directory>,
}

impl Stats {
    /// Directory statistics summed over all home nodes.
    #[must_use]
    pub fn total_directory(&self) -> Directory {
        let mut total = Directory::default();
        for stats in self.directories.values() {
            total += stats.clone();
        }
        total
    }

    /// Flattens all directory statistics into CSV rows, sorted by node.
    #[must_use]
    pub fn flatten(&self) -> Vec<directory::CsvRow> {
        let mut nodes: Vec<_> = self.directories.keys().copied().collect();
        nodes.sort_unstable();
        nodes
            .into_iter()
            .flat_map(|node| self.directories[&node].flatten(node))
            .collect()
    }
}
