use super::{Access, Command, Completion};
use crate::{
    address,
    home::HomeLookup,
    interconn::MemoryManager,
    msg::{Kind, MemComponent, Message},
    CoreId, Error,
};
use console::style;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Status {
    SHARED,
    EXCLUSIVE,
    MODIFIED,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub status: Status,
    pub data: Vec<u8>,
}

/// Outstanding miss of a core.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    cmd: Command,
    block_addr: address,
    request: Kind,
}

/// Private last level cache of a core, speaking the cache side of the
/// directory protocol.
///
/// Capacity is unbounded: lines only leave through explicit evictions or
/// requests from the directory. A core has at most one outstanding miss.
#[derive(Debug)]
pub struct Agent {
    core: CoreId,
    block_size: usize,
    home_lookup: Arc<dyn HomeLookup>,
    mem: Arc<dyn MemoryManager>,
    lines: HashMap<address, Line>,
    pending: Option<Pending>,
    pub hits: u64,
}

impl Agent {
    #[must_use]
    pub fn new(core: CoreId, home_lookup: Arc<dyn HomeLookup>, mem: Arc<dyn MemoryManager>) -> Self {
        Self {
            core,
            block_size: mem.cache_block_size(),
            home_lookup,
            mem,
            lines: HashMap::new(),
            pending: None,
            hits: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    #[must_use]
    pub fn line(&self, block_addr: address) -> Option<&Line> {
        self.lines.get(&block_addr)
    }

    fn block_addr(&self, addr: address) -> address {
        addr & !(self.block_size as u64 - 1)
    }

    fn offset(&self, addr: address) -> usize {
        (addr % self.block_size as u64) as usize
    }

    fn send(&self, msg: Message) {
        let home = self.home_lookup.home(msg.physical_addr);
        log::debug!(
            "{}: {} to node {}",
            style(format!("CACHE[{}] SEND", self.core)).bold(),
            msg,
            home
        );
        self.mem.send(msg, home);
    }

    fn complete(&self, cmd: &Command, value: Option<u8>, cycle: u64) -> Completion {
        Completion {
            core: self.core,
            kind: cmd.kind,
            addr: cmd.addr,
            value,
            cycle,
        }
    }

    /// Reply surrendering a line that leaves the cache.
    fn surrender(&self, addr: address, line: Line) -> Message {
        match line.status {
            Status::MODIFIED => {
                Message::cache_reply(Kind::FLUSH_REP, self.core, addr, Some(line.data))
            }
            Status::SHARED | Status::EXCLUSIVE => {
                Message::cache_reply(Kind::INV_REP, self.core, addr, None)
            }
        }
    }

    /// Starts a trace command.
    ///
    /// Returns the completion if the command did not need the directory.
    pub fn issue(&mut self, cmd: Command, cycle: u64) -> Option<Completion> {
        debug_assert!(self.is_idle());
        let block_addr = self.block_addr(cmd.addr);
        let offset = self.offset(cmd.addr);
        let status = self.lines.get(&block_addr).map(|line| line.status);

        let request = match (cmd.kind, status) {
            (Access::EVICT, _) => {
                if let Some(line) = self.lines.remove(&block_addr) {
                    let reply = self.surrender(block_addr, line);
                    self.send(reply);
                }
                return Some(self.complete(&cmd, None, cycle));
            }
            (Access::READ, None) => Kind::SH_REQ,
            (Access::WRITE, None) => Kind::EX_REQ,
            (Access::WRITE, Some(Status::SHARED)) => Kind::UPGRADE_REQ,
            (access, Some(_)) => {
                let mut value = None;
                if let Some(line) = self.lines.get_mut(&block_addr) {
                    if access == Access::WRITE {
                        // silent upgrade
                        line.status = Status::MODIFIED;
                        line.data[offset] = cmd.value;
                    }
                    value = Some(line.data[offset]);
                }
                self.hits += 1;
                return Some(self.complete(&cmd, value, cycle));
            }
        };

        self.send(Message::request(request, self.core, block_addr));
        self.pending = Some(Pending {
            cmd,
            block_addr,
            request,
        });
        None
    }

    /// Handles a message from the directory.
    ///
    /// Returns the completion of the outstanding miss if the message resolved it.
    pub fn receive(&mut self, msg: Message, cycle: u64) -> Result<Option<Completion>, Error> {
        if msg.sender_component != MemComponent::DIRECTORY {
            return Err(Error::UnexpectedSender {
                component: msg.sender_component,
            });
        }
        log::debug!(
            "{}: {}",
            style(format!("CACHE[{}] RECV", self.core)).bold(),
            msg
        );
        let (kind, addr) = (msg.kind, msg.addr);
        let unexpected = || Error::UnexpectedMessage {
            kind,
            addr,
            state: None,
        };

        match kind {
            Kind::SH_REP | Kind::EX_REP | Kind::UPGRADE_REP => {
                let pending = match self.pending.take() {
                    Some(pending) if pending.block_addr == addr => pending,
                    other => {
                        self.pending = other;
                        return Err(unexpected());
                    }
                };
                let offset = self.offset(pending.cmd.addr);
                let (status, data) = match (kind, msg.data) {
                    (Kind::UPGRADE_REP, _) => {
                        let line = self.lines.remove(&addr).ok_or_else(unexpected)?;
                        (Status::MODIFIED, line.data)
                    }
                    (_, None) => return Err(Error::MissingData { kind, addr }),
                    (Kind::SH_REP, Some(data)) => (Status::SHARED, data),
                    (_, Some(data)) if pending.cmd.kind == Access::WRITE => {
                        (Status::MODIFIED, data)
                    }
                    (_, Some(data)) => (Status::EXCLUSIVE, data),
                };
                let mut line = Line { status, data };
                let value = if pending.cmd.kind == Access::WRITE {
                    line.data[offset] = pending.cmd.value;
                    pending.cmd.value
                } else {
                    line.data[offset]
                };
                self.lines.insert(addr, line);
                Ok(Some(self.complete(&pending.cmd, Some(value), cycle)))
            }
            Kind::INV_REQ => {
                let upgrading = self.pending.as_ref().is_some_and(|pending| {
                    pending.block_addr == addr && pending.request == Kind::UPGRADE_REQ
                });
                if msg.requester == self.core && upgrading {
                    // broadcast caused by our own upgrade
                    return Ok(None);
                }
                if let Some(line) = self.lines.remove(&addr) {
                    let reply = self.surrender(addr, line);
                    self.send(reply);
                }
                Ok(None)
            }
            Kind::FLUSH_REQ => {
                if let Some(line) = self.lines.remove(&addr) {
                    self.send(Message::cache_reply(
                        Kind::FLUSH_REP,
                        self.core,
                        addr,
                        Some(line.data),
                    ));
                }
                Ok(None)
            }
            Kind::WB_REQ => {
                if let Some(line) = self.lines.get_mut(&addr) {
                    line.status = Status::SHARED;
                    let data = line.data.clone();
                    self.send(Message::cache_reply(Kind::WB_REP, self.core, addr, Some(data)));
                }
                Ok(None)
            }
            _ => Err(unexpected()),
        }
    }
}
