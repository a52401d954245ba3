pub mod cache;
pub mod dram;

use crate::{
    address, config,
    home::{HomeLookup, Interleaved},
    interconn::{Interconnect, MemoryManager, NetworkMemoryManager, Packet, ToyInterconnect},
    msg::{MemComponent, Message},
    node::HomeNode,
    policy::{Dispatcher, DirectoryPolicy, PolicyId},
    CoreId,
};
use console::style;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    READ,
    WRITE,
    EVICT,
}

/// A memory access of a core, read from a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub core: CoreId,
    pub kind: Access,
    pub addr: address,
    /// Byte stored by a write.
    #[serde(default)]
    pub value: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub core: CoreId,
    pub kind: Access,
    pub addr: address,
    /// Byte read or written.
    pub value: Option<u8>,
    pub cycle: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error("protocol error in cycle {cycle}: {source}")]
    Protocol {
        cycle: u64,
        #[source]
        source: crate::Error,
    },

    #[error(
        "deadlock in cycle {cycle}: cores {busy:?} wait for a reply that never comes \
        (directory requests pending for blocks {pending:x?})"
    )]
    Deadlock {
        cycle: u64,
        busy: Vec<CoreId>,
        pending: Vec<address>,
    },

    #[error("command for core {core}, but there are only {num_cores} cores")]
    InvalidCore { core: CoreId, num_cores: usize },

    #[error("node {node} has no {component:?}")]
    NoSuchComponent {
        node: CoreId,
        component: MemComponent,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub completions: Vec<Completion>,
    pub stats: stats::Stats,
}

type Interconn = ToyInterconnect<Packet>;

/// Cores with private caches and home nodes with a directory and memory,
/// connected by an ordered interconnect.
///
/// Each cycle every idle core issues its next command, then a single packet
/// is delivered.
#[derive(Debug)]
pub struct Simulation {
    config: config::Config,
    interconn: Arc<Interconn>,
    agents: Vec<cache::Agent>,
    homes: HashMap<CoreId, HomeNode>,
    drams: HashMap<CoreId, dram::Dram>,
    stats: HashMap<CoreId, Arc<Mutex<stats::Directory>>>,
    cycle: u64,
    packets: u64,
}

impl Simulation {
    pub fn new(config: config::Config) -> Result<Self, Error> {
        config.validate()?;
        let interconn: Arc<Interconn> = Arc::new(ToyInterconnect::new(config.num_cores));
        let home_lookup: Arc<dyn HomeLookup> = Arc::new(Interleaved::new(
            config.directory.home_lookup_param,
            config.memory_controllers.clone(),
        ));
        let mems: Vec<Arc<dyn MemoryManager>> = (0..config.num_cores)
            .map(|node| {
                Arc::new(NetworkMemoryManager::new(
                    node,
                    config.cache_block_size,
                    Arc::clone(&interconn),
                )) as Arc<dyn MemoryManager>
            })
            .collect();

        let agents = mems
            .iter()
            .enumerate()
            .map(|(core, mem)| cache::Agent::new(core, Arc::clone(&home_lookup), Arc::clone(mem)))
            .collect();

        let mut homes = HashMap::new();
        let mut drams = HashMap::new();
        let mut stats = HashMap::new();
        for &node in &config.memory_controllers {
            let node_stats = Arc::new(Mutex::new(stats::Directory::default()));
            let policy = |protocol| {
                Box::new(DirectoryPolicy::new(
                    node,
                    protocol,
                    &config,
                    Arc::clone(&home_lookup),
                    Arc::clone(&mems[node]),
                    Arc::clone(&node_stats),
                ))
            };
            let mut dispatcher = Dispatcher::new(policy(config.protocol));
            for (i, segment) in config.segments.iter().enumerate() {
                let id = PolicyId(i as u64 + 1);
                dispatcher.register(id, policy(segment.protocol));
                dispatcher
                    .add_segment(segment.start, segment.end(), id)
                    .map_err(|source| Error::Protocol { cycle: 0, source })?;
            }
            homes.insert(node, HomeNode::new(node, config.cache_block_size, dispatcher));
            drams.insert(node, dram::Dram::new(node, Arc::clone(&mems[node])));
            stats.insert(node, node_stats);
        }

        Ok(Self {
            config,
            interconn,
            agents,
            homes,
            drams,
            stats,
            cycle: 0,
            packets: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &config::Config {
        &self.config
    }

    #[must_use]
    pub fn agent(&self, core: CoreId) -> Option<&cache::Agent> {
        self.agents.get(core)
    }

    #[must_use]
    pub fn dram(&self, node: CoreId) -> Option<&dram::Dram> {
        self.drams.get(&node)
    }

    /// Blocks with directory requests that were not served yet, over all home nodes.
    #[must_use]
    pub fn pending(&self) -> Vec<address> {
        let mut pending: Vec<address> = self.homes.values().flat_map(HomeNode::pending).collect();
        pending.sort_unstable();
        pending
    }

    fn deliver(&mut self, packet: Packet, completions: &mut Vec<Completion>) -> Result<(), Error> {
        let cycle = self.cycle;
        let no_such_component = Error::NoSuchComponent {
            node: packet.dest,
            component: packet.component,
        };
        match packet.component {
            MemComponent::LAST_LEVEL_CACHE => {
                let msg = Message::decode(&packet.payload, self.config.cache_block_size)
                    .map_err(|err| Error::Protocol {
                        cycle,
                        source: err.into(),
                    })?;
                let agent = self
                    .agents
                    .get_mut(packet.dest)
                    .ok_or(no_such_component)?;
                let done = agent
                    .receive(msg, cycle)
                    .map_err(|source| Error::Protocol { cycle, source })?;
                completions.extend(done);
            }
            MemComponent::DIRECTORY => {
                let home = self
                    .homes
                    .get_mut(&packet.dest)
                    .ok_or(no_such_component)?;
                home.receive(&packet, cycle)
                    .map_err(|source| Error::Protocol { cycle, source })?;
            }
            MemComponent::DRAM => {
                let msg = Message::decode(&packet.payload, self.config.cache_block_size)
                    .map_err(|err| Error::Protocol {
                        cycle,
                        source: err.into(),
                    })?;
                let dram = self
                    .drams
                    .get_mut(&packet.dest)
                    .ok_or(no_such_component)?;
                dram.receive(msg)
                    .map_err(|source| Error::Protocol { cycle, source })?;
            }
        }
        Ok(())
    }

    /// Runs the commands to completion.
    ///
    /// Commands of a core are issued in trace order, each after the previous
    /// one completed. Caches and directories keep their state across runs.
    pub fn run(&mut self, commands: Vec<Command>) -> Result<Output, Error> {
        let num_cores = self.config.num_cores;
        let mut queues: Vec<VecDeque<Command>> = vec![VecDeque::new(); num_cores];
        for cmd in commands {
            let queue = queues.get_mut(cmd.core).ok_or(Error::InvalidCore {
                core: cmd.core,
                num_cores,
            })?;
            queue.push_back(cmd);
        }

        let mut completions = Vec::new();
        loop {
            log::info!("======== cycle {} ========", self.cycle);

            for (agent, queue) in self.agents.iter_mut().zip(queues.iter_mut()) {
                if !agent.is_idle() {
                    continue;
                }
                if let Some(cmd) = queue.pop_front() {
                    completions.extend(agent.issue(cmd, self.cycle));
                }
            }

            if !self.interconn.busy() {
                let busy: Vec<CoreId> = self
                    .agents
                    .iter()
                    .enumerate()
                    .filter(|(_, agent)| !agent.is_idle())
                    .map(|(core, _)| core)
                    .collect();
                if !busy.is_empty() {
                    let err = Error::Deadlock {
                        cycle: self.cycle,
                        busy,
                        pending: self.pending(),
                    };
                    log::error!("{err}");
                    return Err(err);
                }
                if queues.iter().all(VecDeque::is_empty) {
                    break;
                }
            } else if let Some(packet) = self.interconn.pop() {
                self.packets += 1;
                if let Err(err) = self.deliver(packet, &mut completions) {
                    log::error!("{err}");
                    return Err(err);
                }
            }
            self.cycle += 1;
        }

        for done in &completions {
            log::debug!(
                "{}: core {} {:?} {:#x} = {:?}",
                style(format!("COMPLETED @ {}", done.cycle)).bold(),
                done.core,
                done.kind,
                done.addr,
                done.value
            );
        }
        let stats = stats::Stats {
            sim: stats::Sim {
                cycles: self.cycle,
                packets: self.packets,
                completed: completions.len() as u64,
                hits: self.agents.iter().map(|agent| agent.hits).sum(),
            },
            directories: self
                .stats
                .iter()
                .map(|(&node, stats)| (node, stats.lock().clone()))
                .collect(),
        };
        Ok(Output { completions, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Command, Error, Simulation};
    use crate::{config, testing};
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;
    use stats::directory::MessageKind;
    use strum::IntoEnumIterator;

    fn cmd(core: usize, kind: Access, addr: u64, value: u8) -> Command {
        Command {
            core,
            kind,
            addr,
            value,
        }
    }

    fn read(core: usize, addr: u64) -> Command {
        cmd(core, Access::READ, addr, 0)
    }

    fn write(core: usize, addr: u64, value: u8) -> Command {
        cmd(core, Access::WRITE, addr, value)
    }

    fn evict(core: usize, addr: u64) -> Command {
        cmd(core, Access::EVICT, addr, 0)
    }

    fn config(protocol: config::Protocol) -> config::Config {
        config::Config {
            num_cores: 4,
            protocol,
            memory_controllers: vec![0, 2],
            ..config::Config::default()
        }
    }

    /// Values read by all cores, ordered by core.
    fn values(output: &super::Output) -> Vec<(usize, u64, Option<u8>)> {
        let mut values: Vec<_> = output
            .completions
            .iter()
            .map(|done| (done.core, done.addr, done.value))
            .collect();
        values.sort_unstable();
        values
    }

    #[test]
    fn writes_are_visible_to_other_cores() -> eyre::Result<()> {
        testing::init_logging();
        for protocol in config::Protocol::iter() {
            let mut sim = Simulation::new(config(protocol))?;
            sim.run(vec![write(0, 0x41, 7), write(1, 0x80, 9)])?;

            let output = sim.run(vec![read(2, 0x42), read(3, 0x80), read(1, 0x41)])?;
            diff::assert_eq!(
                values(&output),
                vec![(1, 0x41, Some(7)), (2, 0x42, Some(0)), (3, 0x80, Some(9))]
            );

            sim.run(vec![write(3, 0x41, 11)])?;
            let output = sim.run(vec![read(0, 0x41), read(1, 0x41), read(2, 0x41)])?;
            diff::assert_eq!(
                values(&output),
                vec![
                    (0, 0x41, Some(11)),
                    (1, 0x41, Some(11)),
                    (2, 0x41, Some(11)),
                ]
            );
            assert!(sim.pending().is_empty());
        }
        Ok(())
    }

    #[test]
    fn evicted_dirty_block_is_written_back() -> eyre::Result<()> {
        testing::init_logging();
        let mut sim = Simulation::new(config(config::Protocol::MESI))?;
        let output = sim.run(vec![
            write(1, 0x43, 5),
            evict(1, 0x40),
            read(1, 0x40),
            read(1, 0x43),
        ])?;
        diff::assert_eq!(
            output
                .completions
                .iter()
                .map(|done| done.value)
                .collect::<Vec<_>>(),
            vec![Some(5), None, Some(0), Some(5)]
        );
        // 0x40 is homed at node 2
        let dram = sim.dram(2).ok_or_else(|| eyre::eyre!("no dram at node 2"))?;
        diff::assert_eq!(dram.block(0x40)[3], 5);
        diff::assert_eq!(dram.num_writes, 1);
        diff::assert_eq!(output.stats.sim.hits, 1);
        Ok(())
    }

    #[test]
    fn mesif_serves_reads_from_caches() -> eyre::Result<()> {
        testing::init_logging();
        let mut sim = Simulation::new(config(config::Protocol::MESIF))?;
        let output = sim.run(vec![
            read(1, 0x0),
            read(2, 0x0),
            read(3, 0x0),
        ])?;
        diff::assert_eq!(output.completions.len(), 3);
        let total = output.stats.total_directory();
        diff::assert_eq!(total.num_sent(MessageKind::DRAM_READ_REQ), 1);
        diff::assert_eq!(total.num_sent(MessageKind::WB_REQ), 2);
        Ok(())
    }

    #[test]
    fn broadcast_upgrade_keeps_the_requesters_copy() -> eyre::Result<()> {
        testing::init_logging();
        let config = config::Config {
            protocol: config::Protocol::MSI,
            directory: config::Directory {
                kind: config::DirectoryKind::LIMITED_BROADCAST,
                max_hw_sharers: 1,
                ..config::Directory::default()
            },
            ..config(config::Protocol::MSI)
        };
        let mut sim = Simulation::new(config)?;
        let output = sim.run(vec![
            read(1, 0x0),
            read(2, 0x0),
            read(3, 0x0),
            write(1, 0x0, 3),
            read(2, 0x0),
        ])?;
        diff::assert_eq!(output.completions.len(), 5);
        let total = output.stats.total_directory();
        assert!(total.broadcasts >= 1);
        diff::assert_eq!(
            sim.agent(1)
                .and_then(|agent| agent.line(0x0))
                .map(|line| line.data[0]),
            Some(3)
        );
        Ok(())
    }

    #[test]
    fn segments_use_their_own_protocol() -> eyre::Result<()> {
        testing::init_logging();
        let config = config::Config {
            segments: vec![config::Segment {
                start: 0x1000,
                length: 0x1000,
                protocol: config::Protocol::MSI,
            }],
            ..config(config::Protocol::MESI)
        };
        let mut sim = Simulation::new(config)?;
        sim.run(vec![read(1, 0x1000), read(1, 0x0)])?;
        let line = |addr| {
            sim.agent(1)
                .and_then(|agent| agent.line(addr))
                .map(|line| line.status)
        };
        diff::assert_eq!(line(0x1000), Some(super::cache::Status::SHARED));
        diff::assert_eq!(line(0x0), Some(super::cache::Status::EXCLUSIVE));
        Ok(())
    }

    #[test]
    fn commands_for_unknown_cores_are_rejected() -> eyre::Result<()> {
        let mut sim = Simulation::new(config(config::Protocol::MESI))?;
        let err = sim.run(vec![read(4, 0x0)]).err();
        assert!(matches!(
            err,
            Some(Error::InvalidCore {
                core: 4,
                num_cores: 4
            })
        ));
        Ok(())
    }
}
