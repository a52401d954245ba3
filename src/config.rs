use super::{address, CoreId};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Coherence protocol variant.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    clap::ValueEnum,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    MSI,
    #[default]
    MESI,
    MESIF,
}

/// Hardware model of the per-entry sharer set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryKind {
    /// One presence bit per core: the set never overflows.
    #[default]
    FULL_MAP,
    /// Overflowing the hardware pointers switches the entry to broadcast mode.
    LIMITED_BROADCAST,
    /// Overflowing the hardware pointers is refused.
    LIMITED_NO_BROADCAST,
}

/// Directory store parameters of every home node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Directory {
    pub total_entries: usize,
    pub associativity: usize,
    pub max_hw_sharers: usize,
    pub kind: DirectoryKind,
    /// Log2 of the address interleaving granularity across home nodes.
    pub home_lookup_param: u32,
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            total_entries: 1024,
            associativity: 16,
            max_hw_sharers: 64,
            kind: DirectoryKind::FULL_MAP,
            home_lookup_param: 6,
        }
    }
}

impl Directory {
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.total_entries / self.associativity
    }
}

/// An address range served by its own directory engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: address,
    pub length: u64,
    pub protocol: Protocol,
}

impl Segment {
    #[must_use]
    pub fn end(&self) -> address {
        self.start.saturating_add(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_cores: usize,
    pub cache_block_size: usize,
    pub protocol: Protocol,
    pub directory: Directory,
    /// Nodes hosting a directory and a memory controller.
    pub memory_controllers: Vec<CoreId>,
    pub segments: Vec<Segment>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cores: 4,
            cache_block_size: 64,
            protocol: Protocol::default(),
            directory: Directory::default(),
            memory_controllers: vec![0],
            segments: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Maximum number of logical sharers of a block.
    #[must_use]
    pub fn max_num_sharers(&self) -> usize {
        self.num_cores
    }

    #[must_use]
    pub fn block_size_log2(&self) -> u32 {
        self.cache_block_size.trailing_zeros()
    }

    /// Aligns an address to its cache block.
    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !(self.cache_block_size as u64 - 1)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::Invalid(msg));
        if self.num_cores == 0 {
            return invalid("need at least one core".to_string());
        }
        if !self.cache_block_size.is_power_of_two() {
            return invalid(format!(
                "cache block size {} is not a power of two",
                self.cache_block_size
            ));
        }
        let dir = &self.directory;
        if dir.total_entries == 0 || dir.associativity == 0 {
            return invalid("directory must have at least one entry".to_string());
        }
        if dir.total_entries % dir.associativity != 0 {
            return invalid(format!(
                "{} directory entries cannot be split into sets of {}",
                dir.total_entries, dir.associativity
            ));
        }
        if dir.max_hw_sharers == 0 {
            return invalid("max_hw_sharers must be positive".to_string());
        }
        if self.memory_controllers.is_empty() {
            return invalid("need at least one memory controller".to_string());
        }
        if let Some(node) = self
            .memory_controllers
            .iter()
            .find(|&&node| node >= self.num_cores)
        {
            return invalid(format!(
                "memory controller node {node} out of range (have {} nodes)",
                self.num_cores
            ));
        }
        if let Some(segment) = self.segments.iter().find(|segment| segment.length == 0) {
            return invalid(format!("segment at {:#x} is empty", segment.start));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, DirectoryKind, Protocol};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    #[test]
    fn parse_partial_yaml() -> eyre::Result<()> {
        let config: Config = serde_yaml::from_str(
            r#"
num_cores: 8
protocol: mesif
directory:
  associativity: 4
  kind: limited_broadcast
  max_hw_sharers: 2
segments:
  - start: 0x10000
    length: 4096
    protocol: msi
"#,
        )?;
        config.validate()?;
        diff::assert_eq!(config.num_cores, 8);
        diff::assert_eq!(config.protocol, Protocol::MESIF);
        diff::assert_eq!(config.directory.kind, DirectoryKind::LIMITED_BROADCAST);
        diff::assert_eq!(config.directory.total_entries, 1024);
        diff::assert_eq!(config.directory.num_sets(), 256);
        diff::assert_eq!(config.memory_controllers, vec![0]);
        diff::assert_eq!(config.segments[0].end(), 0x11000);
        diff::assert_eq!(config.max_num_sharers(), 8);
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let mut config = Config {
            cache_block_size: 48,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.cache_block_size = 64;
        config.directory.total_entries = 10;
        config.directory.associativity = 4;
        assert!(config.validate().is_err());

        config.directory.total_entries = 16;
        config.memory_controllers = vec![4];
        assert!(config.validate().is_err());

        config.memory_controllers = vec![3];
        assert!(config.validate().is_ok());
        diff::assert_eq!(config.block_addr(0x1234), 0x1200);
    }
}
