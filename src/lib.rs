#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation
)]

pub mod config;
pub mod directory;
pub mod error;
pub mod home;
pub mod interconn;
pub mod msg;
pub mod node;
pub mod policy;
pub mod req_queue;
pub mod segment;
pub mod sim;

#[cfg(test)]
pub mod testing;

pub use error::Error;

use color_eyre::eyre;
use std::path::Path;

/// Block (and message) address.
pub type address = u64;

/// Identifier of a core, which is also the identifier of the node hosting it.
pub type CoreId = usize;

pub fn parse_commands(path: impl AsRef<Path>) -> eyre::Result<Vec<sim::Command>> {
    let file = std::fs::File::open(path.as_ref())?;
    let reader = std::io::BufReader::new(file);
    let commands = serde_json::from_reader(reader)?;
    Ok(commands)
}

pub struct Optional<T>(pub Option<T>);

impl<T> std::fmt::Display for Optional<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(ref value) => write!(f, "Some({value})"),
            None => write!(f, "None"),
        }
    }
}

impl<T> std::fmt::Debug for Optional<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
