use super::Policy;
use crate::{
    address, config,
    directory::{self, State},
    home::HomeLookup,
    interconn::MemoryManager,
    msg::{self, HitWhere, Kind, MemComponent, Message, PerfHandle},
    req_queue::{PendingRequest, RequestQueue},
    CoreId, Error,
};
use console::style;
use itertools::Itertools;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

/// Directory based MSI/MESI/MESIF coherence engine of a single home node.
///
/// Requests to a block are served strictly in arrival order. Only the head
/// of a block's request queue may change its directory entry; a head that
/// waits for a reply stays queued and is resumed by that reply.
#[derive(Debug)]
pub struct DirectoryPolicy {
    node_id: CoreId,
    protocol: config::Protocol,
    home_lookup: Arc<dyn HomeLookup>,
    mem: Arc<dyn MemoryManager>,
    store: directory::Store,
    queue: RequestQueue,
    stats: Arc<Mutex<stats::Directory>>,
    now: u64,
}

impl DirectoryPolicy {
    #[must_use]
    pub fn new(
        node_id: CoreId,
        protocol: config::Protocol,
        config: &config::Config,
        home_lookup: Arc<dyn HomeLookup>,
        mem: Arc<dyn MemoryManager>,
        stats: Arc<Mutex<stats::Directory>>,
    ) -> Self {
        Self {
            node_id,
            protocol,
            home_lookup,
            mem,
            store: directory::Store::new(config),
            queue: RequestQueue::new(),
            stats,
            now: 0,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> CoreId {
        self.node_id
    }

    #[must_use]
    pub fn protocol(&self) -> config::Protocol {
        self.protocol
    }

    #[must_use]
    pub fn entry(&self, addr: address) -> Option<&directory::Entry> {
        self.store.lookup(addr)
    }

    #[must_use]
    pub fn store(&self) -> &directory::Store {
        &self.store
    }

    #[must_use]
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    fn builder(
        kind: Kind,
        receiver_component: MemComponent,
        requester: CoreId,
        addr: address,
        physical_addr: address,
    ) -> msg::Builder {
        msg::Builder {
            kind,
            sender_component: MemComponent::DIRECTORY,
            receiver_component,
            requester,
            addr,
            physical_addr,
            data: None,
            hit_where: HitWhere::UNKNOWN,
            perf: PerfHandle::default(),
        }
    }

    fn send(&self, msg: Message, receiver: CoreId) {
        log::debug!(
            "{}: {} to node {}",
            style(format!("DIRECTORY[{}] SEND", self.node_id)).bold(),
            msg,
            receiver
        );
        self.stats.lock().inc_sent(msg.kind);
        self.mem.send(msg, receiver);
    }

    fn broadcast(&self, msg: Message) {
        log::debug!(
            "{}: {}",
            style(format!("DIRECTORY[{}] BROADCAST", self.node_id)).bold(),
            msg
        );
        {
            let mut stats = self.stats.lock();
            stats.inc_sent(msg.kind);
            stats.broadcasts += 1;
        }
        self.mem.broadcast(msg);
    }

    /// Invalidates all `sharers`, or every core in broadcast mode.
    fn invalidate(
        &self,
        requester: CoreId,
        addr: address,
        physical_addr: address,
        perf: PerfHandle,
        (broadcast, sharers): (bool, SmallVec<[CoreId; 8]>),
    ) {
        let inv = |perf| {
            msg::Builder {
                perf,
                ..Self::builder(
                    Kind::INV_REQ,
                    MemComponent::LAST_LEVEL_CACHE,
                    requester,
                    addr,
                    physical_addr,
                )
            }
            .build()
        };
        if broadcast {
            self.broadcast(inv(PerfHandle::default()));
            return;
        }
        log::debug!(
            "{}: {:#x} at cores [{}]",
            style(format!("DIRECTORY[{}] INVALIDATE", self.node_id)).bold(),
            addr,
            sharers.iter().join(", ")
        );
        for (i, sharer) in sharers.into_iter().enumerate() {
            let perf = if i == 0 { perf } else { PerfHandle::default() };
            self.send(inv(perf), sharer);
        }
    }

    /// Writes a block returned by a cache back to memory.
    fn write_back(&self, msg: &Message, data: Vec<u8>) {
        let write = msg::Builder {
            data: Some(data),
            ..Self::builder(
                Kind::DRAM_WRITE_REQ,
                MemComponent::DRAM,
                msg.requester,
                msg.addr,
                msg.physical_addr,
            )
        }
        .build();
        self.send(write, self.node_id);
    }

    fn head(&self, addr: address, kind: Kind) -> Result<&PendingRequest, Error> {
        self.queue
            .front(addr)
            .ok_or(Error::NoPendingRequest { kind, addr })
    }

    fn entry_mut(&mut self, addr: address) -> Result<&mut directory::Entry, Error> {
        self.store
            .lookup_mut(addr)
            .ok_or(Error::MissingEntry { addr })
    }

    fn state(&self, addr: address) -> Option<State> {
        self.store.lookup(addr).map(|entry| entry.state)
    }

    fn check_core(&self, core: CoreId) -> Result<(), Error> {
        if core < self.store.max_num_sharers() {
            Ok(())
        } else {
            Err(Error::InvalidCore { core })
        }
    }

    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            for entry in self.store.iter() {
                debug_assert!(
                    entry.is_consistent(),
                    "inconsistent directory entry {entry:?}"
                );
                log::trace!("{entry:?}");
            }
        }
    }

    /// Finds the entry of the head request's block, allocating one if needed.
    fn lookup_or_allocate(&mut self, addr: address, kind: Kind) -> Result<(), Error> {
        if self.store.lookup(addr).is_some() {
            return Ok(());
        }
        let head = self.head(addr, kind)?;
        let (requester, physical_addr) = (head.requester(), head.msg.physical_addr);
        if self.store.try_insert(addr, physical_addr) {
            return Ok(());
        }
        self.allocate(addr, physical_addr, requester)
    }

    /// Replaces the entry with the fewest sharers and no pending requests,
    /// nullifying its remaining copies.
    fn allocate(
        &mut self,
        addr: address,
        physical_addr: address,
        requester: CoreId,
    ) -> Result<(), Error> {
        let queue = &self.queue;
        let (victim, victim_physical_addr, victim_state) = self
            .store
            .replacement_candidates(addr)
            .filter(|entry| queue.is_empty(entry.addr))
            .min_by_key(|entry| entry.sharers.len())
            .map(|entry| (entry.addr, entry.physical_addr, entry.state))
            .ok_or(Error::NoEvictionCandidate { addr })?;

        log::debug!(
            "{}: {:#x} ({:?}) for {:#x}",
            style(format!("DIRECTORY[{}] EVICT", self.node_id)).bold(),
            victim,
            victim_state,
            addr
        );
        self.stats.lock().inc_eviction(victim_state);
        self.store.replace(victim, addr, physical_addr)?;

        let nullify = Self::builder(
            Kind::NULLIFY_REQ,
            MemComponent::DIRECTORY,
            requester,
            victim,
            victim_physical_addr,
        )
        .build();
        let len = self
            .queue
            .enqueue(victim, PendingRequest::new(nullify, self.now));
        debug_assert_eq!(len, 1);
        self.process_nullify(victim)
    }

    fn process_nullify(&mut self, addr: address) -> Result<(), Error> {
        let head = self.head(addr, Kind::NULLIFY_REQ)?;
        let (requester, physical_addr) = (head.requester(), head.msg.physical_addr);
        let entry = self.entry_mut(addr)?;

        match entry.state {
            State::EXCLUSIVE | State::MODIFIED => {
                let owner = owner(entry, Kind::NULLIFY_REQ)?;
                let flush = Self::builder(
                    Kind::FLUSH_REQ,
                    MemComponent::LAST_LEVEL_CACHE,
                    requester,
                    addr,
                    physical_addr,
                )
                .build();
                self.send(flush, owner);
            }
            State::SHARED => {
                let sharers = entry.sharers.list();
                self.invalidate(
                    requester,
                    addr,
                    physical_addr,
                    PerfHandle::default(),
                    sharers,
                );
            }
            State::UNCACHED => {
                self.store.release(addr);
                self.process_next(addr)?;
            }
            state @ State::OWNED => {
                return Err(Error::UnexpectedMessage {
                    kind: Kind::NULLIFY_REQ,
                    addr,
                    state: Some(state),
                });
            }
        }
        Ok(())
    }

    /// Completes the head request and starts serving the next one using the
    /// current directory state.
    fn process_next(&mut self, addr: address) -> Result<(), Error> {
        let completed = self.queue.dequeue(addr);
        debug_assert!(completed.is_some());
        if let Some(completed) = completed {
            log::debug!(
                "{}: {}",
                style(format!("DIRECTORY[{}] DONE", self.node_id)).bold(),
                completed
            );
        }
        let Some(next) = self.queue.front(addr) else {
            return Ok(());
        };
        log::debug!(
            "{}: {}",
            style(format!("DIRECTORY[{}] NEXT", self.node_id)).bold(),
            next
        );
        match next.kind() {
            Kind::EX_REQ => self.process_ex_req(addr, None),
            Kind::SH_REQ => self.process_sh_req(addr, None),
            Kind::UPGRADE_REQ => self.process_upgrade_req(addr, None),
            kind => Err(Error::UnexpectedMessage {
                kind,
                addr,
                state: self.state(addr),
            }),
        }
    }

    fn process_ex_req(&mut self, addr: address, cached: Option<Vec<u8>>) -> Result<(), Error> {
        self.lookup_or_allocate(addr, Kind::EX_REQ)?;
        let head = self.head(addr, Kind::EX_REQ)?;
        let (requester, physical_addr, perf) =
            (head.requester(), head.msg.physical_addr, head.msg.perf);
        let stashed = head.msg.data.clone();
        let entry = self.entry_mut(addr)?;

        match entry.state {
            // the owner may have silently upgraded to modified
            State::EXCLUSIVE | State::MODIFIED => {
                debug_assert!(cached.is_none());
                let owner = owner(entry, Kind::EX_REQ)?;
                let flush = msg::Builder {
                    perf,
                    ..Self::builder(
                        Kind::FLUSH_REQ,
                        MemComponent::LAST_LEVEL_CACHE,
                        requester,
                        addr,
                        physical_addr,
                    )
                }
                .build();
                self.send(flush, owner);
            }
            State::SHARED => {
                debug_assert!(cached.is_none());
                let sharers = entry.sharers.list();
                self.invalidate(requester, addr, physical_addr, perf, sharers);
            }
            State::UNCACHED => {
                let added = entry.sharers.add(requester);
                debug_assert!(added);
                entry.owner = Some(requester);
                entry.state = State::MODIFIED;
                self.retrieve_and_send(Kind::EX_REP, requester, addr, cached.or(stashed))?;
            }
            state @ State::OWNED => {
                return Err(Error::UnexpectedMessage {
                    kind: Kind::EX_REQ,
                    addr,
                    state: Some(state),
                });
            }
        }
        Ok(())
    }

    fn process_sh_req(&mut self, addr: address, cached: Option<Vec<u8>>) -> Result<(), Error> {
        self.lookup_or_allocate(addr, Kind::SH_REQ)?;
        let head = self.head(addr, Kind::SH_REQ)?;
        let (requester, physical_addr, perf, forwarding) = (
            head.requester(),
            head.msg.physical_addr,
            head.msg.perf,
            head.is_forwarding(),
        );
        let protocol = self.protocol;
        let entry = self.entry_mut(addr)?;

        match entry.state {
            state @ (State::EXCLUSIVE | State::MODIFIED) => {
                debug_assert!(cached.is_none());
                let owner = owner(entry, Kind::SH_REQ)?;
                if owner == requester {
                    return Err(Error::UnexpectedMessage {
                        kind: Kind::SH_REQ,
                        addr,
                        state: Some(state),
                    });
                }
                // downgrade, keeping the data
                let wb = msg::Builder {
                    perf,
                    ..Self::builder(
                        Kind::WB_REQ,
                        MemComponent::LAST_LEVEL_CACHE,
                        requester,
                        addr,
                        physical_addr,
                    )
                }
                .build();
                self.send(wb, owner);
            }
            State::SHARED => {
                if entry.sharers.contains(requester) {
                    if forwarding {
                        // woken up by the forwarder's reply
                        let mut stats = self.stats.lock();
                        stats.forward += 1;
                        if cached.is_none() {
                            stats.forward_failed += 1;
                        }
                    }
                    self.retrieve_and_send(Kind::SH_REP, requester, addr, cached)?;
                } else if entry.sharers.add(requester) {
                    self.retrieve_and_send(Kind::SH_REP, requester, addr, cached)?;
                } else {
                    // no room: invalidate one sharer and retry once it replied
                    let sharer = entry.sharers.one().ok_or(Error::UnexpectedMessage {
                        kind: Kind::SH_REQ,
                        addr,
                        state: Some(State::SHARED),
                    })?;
                    let inv = msg::Builder {
                        perf,
                        ..Self::builder(
                            Kind::INV_REQ,
                            MemComponent::LAST_LEVEL_CACHE,
                            requester,
                            addr,
                            physical_addr,
                        )
                    }
                    .build();
                    self.send(inv, sharer);
                }
            }
            State::UNCACHED => {
                let added = entry.sharers.add(requester);
                debug_assert!(added);
                let reply = if protocol == config::Protocol::MSI {
                    entry.state = State::SHARED;
                    Kind::SH_REP
                } else {
                    entry.owner = Some(requester);
                    entry.state = State::EXCLUSIVE;
                    Kind::EX_REP
                };
                self.retrieve_and_send(reply, requester, addr, cached)?;
            }
            state @ State::OWNED => {
                return Err(Error::UnexpectedMessage {
                    kind: Kind::SH_REQ,
                    addr,
                    state: Some(state),
                });
            }
        }
        Ok(())
    }

    fn process_upgrade_req(
        &mut self,
        addr: address,
        cached: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        self.lookup_or_allocate(addr, Kind::UPGRADE_REQ)?;
        let head = self.head(addr, Kind::UPGRADE_REQ)?;
        let (requester, physical_addr, perf) =
            (head.requester(), head.msg.physical_addr, head.msg.perf);
        let stashed = head.msg.data.clone();
        let entry = self.entry_mut(addr)?;

        let upgrade_rep = msg::Builder {
            perf,
            ..Self::builder(
                Kind::UPGRADE_REP,
                MemComponent::LAST_LEVEL_CACHE,
                requester,
                addr,
                physical_addr,
            )
        }
        .build();

        match entry.state {
            State::EXCLUSIVE | State::MODIFIED => {
                if entry.sharers.one() == Some(requester) {
                    debug_assert_eq!(entry.owner, Some(requester));
                    entry.state = State::MODIFIED;
                    self.send(upgrade_rep, requester);
                    self.process_next(addr)?;
                } else {
                    let owner = owner(entry, Kind::UPGRADE_REQ)?;
                    let flush = msg::Builder {
                        perf,
                        ..Self::builder(
                            Kind::FLUSH_REQ,
                            MemComponent::LAST_LEVEL_CACHE,
                            requester,
                            addr,
                            physical_addr,
                        )
                    }
                    .build();
                    self.send(flush, owner);
                }
            }
            State::SHARED => {
                if entry.sharers.len() == 1 && entry.sharers.contains(requester) {
                    entry.owner = Some(requester);
                    entry.state = State::MODIFIED;
                    self.send(upgrade_rep, requester);
                    self.process_next(addr)?;
                    return Ok(());
                }

                let requester_has_copy = entry.sharers.contains(requester);
                let (broadcast, sharers) = entry.sharers.list();
                if !requester_has_copy {
                    log::debug!(
                        "upgrade of {:#x} by core {}: {} sharer(s), but the requester holds no copy",
                        addr,
                        requester,
                        sharers.len()
                    );
                }
                if broadcast {
                    self.invalidate(requester, addr, physical_addr, perf, (true, sharers));
                    return Ok(());
                }
                let others = sharers.into_iter().filter(|&sharer| sharer != requester);
                for (i, sharer) in others.enumerate() {
                    // flush one copy instead of refetching the block from memory
                    let kind = if !requester_has_copy && i == 0 {
                        Kind::FLUSH_REQ
                    } else {
                        Kind::INV_REQ
                    };
                    let req = msg::Builder {
                        perf: if i == 0 { perf } else { PerfHandle::default() },
                        ..Self::builder(
                            kind,
                            MemComponent::LAST_LEVEL_CACHE,
                            requester,
                            addr,
                            physical_addr,
                        )
                    }
                    .build();
                    self.send(req, sharer);
                }
            }
            State::UNCACHED => {
                debug_assert!(entry.sharers.is_empty());
                let added = entry.sharers.add(requester);
                debug_assert!(added);
                entry.owner = Some(requester);
                entry.state = State::MODIFIED;
                self.retrieve_and_send(Kind::EX_REP, requester, addr, cached.or(stashed))?;
            }
            state @ State::OWNED => {
                return Err(Error::UnexpectedMessage {
                    kind: Kind::UPGRADE_REQ,
                    addr,
                    state: Some(state),
                });
            }
        }
        Ok(())
    }

    /// Replies to the head request, fetching the block first unless it was
    /// returned by a cache.
    fn retrieve_and_send(
        &mut self,
        reply: Kind,
        receiver: CoreId,
        addr: address,
        cached: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let node_id = self.node_id;
        let protocol = self.protocol;

        if let Some(data) = cached {
            let entry = self.entry_mut(addr)?;
            // the last receiver of a copy is the least likely to evict it soon
            entry.forwarder = Some(receiver);
            let physical_addr = entry.physical_addr;
            let perf = self.head(addr, reply)?.msg.perf;
            let msg = msg::Builder {
                data: Some(data),
                hit_where: HitWhere::CACHE_REMOTE,
                perf,
                ..Self::builder(
                    reply,
                    MemComponent::LAST_LEVEL_CACHE,
                    receiver,
                    addr,
                    physical_addr,
                )
            }
            .build();
            self.send(msg, receiver);
            return self.process_next(addr);
        }

        let (state, forwarder) = {
            let entry = self.store.lookup(addr).ok_or(Error::MissingEntry { addr })?;
            (entry.state, entry.forwarder)
        };
        let head = self
            .queue
            .front_mut(addr)
            .ok_or(Error::NoPendingRequest { kind: reply, addr })?;
        let (physical_addr, perf) = (head.msg.physical_addr, head.msg.perf);

        // MESIF: ask the forwarder for its copy, at most once per request
        if protocol == config::Protocol::MESIF
            && !head.is_forwarding()
            && state == State::SHARED
        {
            if let Some(forwarder) = forwarder.filter(|&forwarder| forwarder != receiver) {
                head.forwarding_from = Some(forwarder);
                let wb = msg::Builder {
                    perf,
                    ..Self::builder(
                        Kind::WB_REQ,
                        MemComponent::LAST_LEVEL_CACHE,
                        receiver,
                        addr,
                        physical_addr,
                    )
                }
                .build();
                self.send(wb, forwarder);
                return Ok(());
            }
        }

        if head.kind() == Kind::UPGRADE_REQ {
            log::warn!(
                "upgrade of {:#x} by core {} needs a memory fetch: all copies were lost",
                addr,
                receiver
            );
        }
        head.waiting_for_data = true;
        let read = msg::Builder {
            perf,
            ..Self::builder(
                Kind::DRAM_READ_REQ,
                MemComponent::DRAM,
                receiver,
                addr,
                physical_addr,
            )
        }
        .build();
        self.send(read, node_id);
        Ok(())
    }

    fn process_dram_reply(&mut self, sender: CoreId, msg: Message) -> Result<(), Error> {
        let addr = msg.addr;
        let head = self.head(addr, msg.kind)?;
        let (kind, requester, physical_addr, perf) = (
            head.kind(),
            head.requester(),
            head.msg.physical_addr,
            head.msg.perf,
        );
        let state = self
            .state(addr)
            .ok_or(Error::MissingEntry { addr })?;

        let reply = match (kind, state) {
            (Kind::SH_REQ, State::EXCLUSIVE) => Kind::EX_REP,
            (Kind::SH_REQ, State::SHARED) => Kind::SH_REP,
            // nobody holds a copy anymore when an upgrade had to fetch
            (Kind::EX_REQ, State::MODIFIED) | (Kind::UPGRADE_REQ, _) => Kind::EX_REP,
            _ => {
                return Err(Error::UnexpectedMessage {
                    kind: msg.kind,
                    addr,
                    state: Some(state),
                })
            }
        };
        let hit_where = match msg.hit_where {
            HitWhere::DRAM if sender == msg.requester => HitWhere::DRAM_LOCAL,
            HitWhere::DRAM => HitWhere::DRAM_REMOTE,
            other => other,
        };
        let data = msg.data.ok_or(Error::MissingData {
            kind: msg.kind,
            addr,
        })?;

        let rep = msg::Builder {
            data: Some(data),
            hit_where,
            perf,
            ..Self::builder(
                reply,
                MemComponent::LAST_LEVEL_CACHE,
                requester,
                addr,
                physical_addr,
            )
        }
        .build();
        self.send(rep, requester);
        self.process_next(addr)
    }

    fn process_inv_rep(&mut self, sender: CoreId, msg: &Message) -> Result<(), Error> {
        let addr = msg.addr;
        let entry = self.entry_mut(addr)?;
        if !matches!(entry.state, State::SHARED | State::EXCLUSIVE) {
            return Err(Error::UnexpectedMessage {
                kind: msg.kind,
                addr,
                state: Some(entry.state),
            });
        }
        if !entry.sharers.contains(sender) {
            return Err(Error::NotASharer {
                kind: msg.kind,
                core: sender,
                addr,
            });
        }
        entry.sharers.remove(sender);
        if entry.forwarder == Some(sender) {
            entry.forwarder = None;
        }
        if entry.owner == Some(sender) {
            entry.owner = None;
        }
        if entry.sharers.is_empty() {
            entry.state = State::UNCACHED;
        }
        let state = entry.state;
        let num_sharers = entry.sharers.len();

        let Some(head) = self.queue.front(addr) else {
            // voluntary eviction
            return Ok(());
        };
        let requester_has_copy = self
            .store
            .lookup(addr)
            .is_some_and(|entry| entry.sharers.contains(head.requester()));

        match head.kind() {
            Kind::EX_REQ => {
                if state == State::UNCACHED {
                    self.process_ex_req(addr, None)?;
                }
            }
            Kind::UPGRADE_REQ => {
                // only act once every other copy is gone
                if num_sharers == 0 || (num_sharers == 1 && requester_has_copy) {
                    self.process_upgrade_req(addr, None)?;
                }
            }
            Kind::SH_REQ => {
                if head.waiting_for_data {
                    // woken up by the data from memory instead
                } else if head.forwarding_from.is_some_and(|forwarder| forwarder != sender) {
                    // woken up by the forwarder instead
                } else {
                    self.process_sh_req(addr, None)?;
                }
            }
            Kind::NULLIFY_REQ => {
                if state == State::UNCACHED {
                    self.process_nullify(addr)?;
                }
            }
            kind => {
                return Err(Error::UnexpectedMessage {
                    kind,
                    addr,
                    state: Some(state),
                })
            }
        }
        Ok(())
    }

    fn process_flush_rep(&mut self, sender: CoreId, msg: &Message) -> Result<(), Error> {
        let addr = msg.addr;
        let data = msg.data.clone().ok_or(Error::MissingData {
            kind: msg.kind,
            addr,
        })?;
        let entry = self.entry_mut(addr)?;
        if !entry.sharers.contains(sender) {
            return Err(Error::NotASharer {
                kind: msg.kind,
                core: sender,
                addr,
            });
        }
        entry.sharers.remove(sender);
        entry.forwarder = None;
        entry.owner = None;
        if entry.sharers.is_empty() {
            entry.state = State::UNCACHED;
        } else if entry.state != State::SHARED {
            // only a shared copy can be flushed while other copies remain
            return Err(Error::UnexpectedMessage {
                kind: msg.kind,
                addr,
                state: Some(entry.state),
            });
        }
        let num_sharers = entry.sharers.len();

        match self.queue.front(addr).map(PendingRequest::kind) {
            None => {
                // voluntary eviction of a dirty copy
                self.write_back(msg, data);
            }
            Some(kind @ (Kind::EX_REQ | Kind::UPGRADE_REQ)) => {
                if num_sharers == 0 {
                    if kind == Kind::EX_REQ {
                        self.process_ex_req(addr, Some(data))?;
                    } else {
                        self.process_upgrade_req(addr, Some(data))?;
                    }
                } else if let Some(head) = self.queue.front_mut(addr) {
                    // keep the flushed block until the remaining copies are gone
                    head.msg.data = Some(data);
                }
            }
            Some(Kind::SH_REQ) => {
                self.write_back(msg, data.clone());
                self.process_sh_req(addr, Some(data))?;
            }
            Some(Kind::NULLIFY_REQ) => {
                self.write_back(msg, data);
                self.process_nullify(addr)?;
            }
            Some(kind) => {
                return Err(Error::UnexpectedMessage {
                    kind,
                    addr,
                    state: self.state(addr),
                });
            }
        }
        Ok(())
    }

    fn process_wb_rep(&mut self, sender: CoreId, msg: &Message) -> Result<(), Error> {
        let addr = msg.addr;
        let data = msg.data.clone().ok_or(Error::MissingData {
            kind: msg.kind,
            addr,
        })?;
        let head = self.head(addr, msg.kind)?;
        if head.kind() != Kind::SH_REQ {
            return Err(Error::UnexpectedMessage {
                kind: msg.kind,
                addr,
                state: self.state(addr),
            });
        }
        let entry = self.entry_mut(addr)?;
        if !entry.sharers.contains(sender) {
            return Err(Error::NotASharer {
                kind: msg.kind,
                core: sender,
                addr,
            });
        }
        let previous = entry.state;
        entry.owner = None;
        entry.state = State::SHARED;
        if previous.is_owned_exclusively() {
            // the downgraded copy may be dirty
            self.write_back(msg, data.clone());
        }
        self.process_sh_req(addr, Some(data))
    }

    fn handle_request(&mut self, msg: Message) -> Result<(), Error> {
        let addr = msg.addr;
        let kind = msg.kind;
        let len = self.queue.enqueue(addr, PendingRequest::new(msg, self.now));
        if len > 1 {
            log::debug!(
                "{}: {:?} for {:#x} waits behind {} request(s) ({} pending in total)",
                style(format!("DIRECTORY[{}] QUEUE", self.node_id)).bold(),
                kind,
                addr,
                len - 1,
                self.queue.num_pending()
            );
            return Ok(());
        }
        match kind {
            Kind::EX_REQ => self.process_ex_req(addr, None),
            Kind::SH_REQ => self.process_sh_req(addr, None),
            Kind::UPGRADE_REQ => self.process_upgrade_req(addr, None),
            kind => Err(Error::UnexpectedMessage {
                kind,
                addr,
                state: self.state(addr),
            }),
        }
    }
}

fn owner(entry: &directory::Entry, kind: Kind) -> Result<CoreId, Error> {
    entry.owner.ok_or(Error::UnexpectedMessage {
        kind,
        addr: entry.addr,
        state: Some(entry.state),
    })
}

impl Policy for DirectoryPolicy {
    fn handle_from_cache(
        &mut self,
        sender: CoreId,
        msg: Message,
        time: u64,
    ) -> Result<(), Error> {
        self.now = time;
        self.check_core(sender)?;
        self.check_core(msg.requester)?;
        self.stats.lock().inc_received(msg.kind);

        let home = self.home_lookup.home(msg.physical_addr);
        if home != self.node_id {
            let mut forwarded = msg;
            forwarded.sender_component = MemComponent::DIRECTORY;
            forwarded.receiver_component = MemComponent::DIRECTORY;
            self.send(forwarded, home);
            return Ok(());
        }

        log::debug!(
            "{}: {} from core {}",
            style(format!("DIRECTORY[{}] RECV", self.node_id)).bold(),
            msg,
            sender
        );

        let result = match msg.kind {
            Kind::EX_REQ | Kind::SH_REQ | Kind::UPGRADE_REQ => {
                self.stats.lock().lookups += 1;
                self.handle_request(msg)
            }
            Kind::INV_REP => self.process_inv_rep(sender, &msg),
            Kind::FLUSH_REP => self.process_flush_rep(sender, &msg),
            Kind::WB_REP => self.process_wb_rep(sender, &msg),
            kind => Err(Error::UnexpectedMessage {
                kind,
                addr: msg.addr,
                state: self.state(msg.addr),
            }),
        };
        self.check_invariants();
        result
    }

    fn handle_from_memory(
        &mut self,
        sender: CoreId,
        msg: Message,
        time: u64,
    ) -> Result<(), Error> {
        self.now = time;
        self.stats.lock().inc_received(msg.kind);
        log::debug!(
            "{}: {} from memory at node {}",
            style(format!("DIRECTORY[{}] RECV", self.node_id)).bold(),
            msg,
            sender
        );
        let result = match msg.kind {
            Kind::DRAM_READ_REP => self.process_dram_reply(sender, msg),
            kind => Err(Error::UnexpectedMessage {
                kind,
                addr: msg.addr,
                state: self.state(msg.addr),
            }),
        };
        self.check_invariants();
        result
    }

    fn handle_from_peer_directory(
        &mut self,
        _sender: CoreId,
        msg: Message,
        time: u64,
    ) -> Result<(), Error> {
        let home = self.home_lookup.home(msg.physical_addr);
        if home != self.node_id {
            return Err(Error::WrongHome {
                addr: msg.addr,
                home,
                node: self.node_id,
            });
        }
        // serve as if sent by the requesting cache directly
        self.handle_from_cache(msg.requester, msg, time)
    }

    fn pending(&self) -> Vec<address> {
        self.queue.addresses().collect()
    }
}
