use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    /// Number of simulation steps (one packet delivery or one issued command each).
    pub cycles: u64,
    /// Number of packets delivered by the interconnect.
    pub packets: u64,
    /// Number of completed trace commands.
    pub completed: u64,
    /// Number of commands that hit in the private cache.
    pub hits: u64,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.packets += other.packets;
        self.completed += other.completed;
        self.hits += other.hits;
    }
}
