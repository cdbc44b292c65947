//! The per-worker orchestrator.
//!
//! A [`Master`] owns this worker's blocks (through a [`Collection`]), their
//! links, and all message queues. User code runs callbacks over the blocks
//! with [`Master::foreach`] and moves the enqueued messages with
//! [`Master::exchange`] or [`Master::iexchange`].
//!
//! ```
//! use parablock::prelude::*;
//!
//! struct Counter(u64);
//! impl Block for Counter {
//!     fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> { buf.save(&self.0) }
//!     fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> { Ok(Counter(buf.load()?)) }
//! }
//!
//! let mut master = Master::new(NoComm, MasterConfig::default(), None).unwrap();
//! master.add(0, Counter(1), Link::default()).unwrap();
//! master
//!     .foreach(|b: &mut Counter, _p: &mut Proxy| {
//!         b.0 += 1;
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(master.block(0).unwrap().0, 2);
//! ```

pub mod collectives;
pub mod exchange;
pub mod iexchange;
pub mod proxy;
pub mod queues;
pub mod state;

pub use collectives::{CollectiveId, CollectiveRecord, CollectiveValues};
pub use proxy::Proxy;
pub use queues::{QueueBuffer, QueuePolicy, QueueRecord, QueueSizePolicy};
pub use state::{ExchangeMode, ExchangePhase, ExchangeProgress, TerminationPhase, Vote};

use self::collectives::CollectiveSlot;
use self::exchange::Transport;
use self::queues::{IncomingQueues, IncomingRound, OutgoingQueues};
use crate::algs::communicator::Communicator;
use crate::algs::wire::HEADER_SIZE;
use crate::assigner::Assigner;
use crate::block_error::BlockError;
use crate::collection::Collection;
use crate::link::Link;
use crate::serialization::Block;
use crate::storage::ExternalStorage;
use crate::types::Gid;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Runtime settings of a [`Master`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Worker threads for `foreach`; `1` runs callbacks on the calling thread.
    pub threads: usize,
    /// Maximum number of resident blocks; `None` keeps everything in memory.
    pub limit: Option<usize>,
    /// Run `foreach` callbacks at once instead of at the next `execute`/`exchange`.
    pub immediate: bool,
    /// Cap on posted, unmatched sends.
    pub max_in_flight_sends: usize,
    /// Largest transport message in bytes, header included.
    pub max_message_size: usize,
    /// Queues above this many bytes are paged out when storage is attached.
    pub queue_unload_size: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            limit: None,
            immediate: true,
            max_in_flight_sends: 64,
            max_message_size: i32::MAX as usize,
            queue_unload_size: 4096,
        }
    }
}

impl MasterConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn with_max_in_flight_sends(mut self, n: usize) -> Self {
        self.max_in_flight_sends = n;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_queue_unload_size(mut self, bytes: usize) -> Self {
        self.queue_unload_size = bytes;
        self
    }
}

type Callback<B> = Arc<dyn Fn(&mut B, &mut Proxy<'_>) -> Result<(), BlockError> + Send + Sync>;
type SkipFn = Arc<dyn Fn(Gid) -> bool + Send + Sync>;

struct Command<B> {
    f: Callback<B>,
    skip: Option<SkipFn>,
}

impl<B> Command<B> {
    fn skips(&self, gid: Gid) -> bool {
        self.skip.as_ref().is_some_and(|s| s(gid))
    }
}

struct WorkItem<'a, B> {
    gid: Gid,
    block: &'a mut B,
    link: &'a Link,
    outgoing: &'a mut OutgoingQueues,
    incoming: Option<&'a mut IncomingQueues>,
    slot: &'a mut CollectiveSlot,
}

pub struct Master<B: Block, C: Communicator> {
    comm: C,
    config: MasterConfig,
    blocks: Collection<B>,
    gids: Vec<Gid>,
    lids: HashMap<Gid, usize>,
    links: Vec<Link>,
    expected: usize,
    exchange_round: u64,
    outgoing: HashMap<Gid, OutgoingQueues>,
    incoming: BTreeMap<u64, IncomingRound>,
    collectives: HashMap<Gid, CollectiveSlot>,
    commands: Vec<Command<B>>,
    storage: Option<Arc<dyn ExternalStorage>>,
    queue_policy: Box<dyn QueuePolicy>,
    pool: Option<rayon::ThreadPool>,
    transport: Transport<C::SendHandle>,
}

impl<B: Block, C: Communicator> Master<B, C> {
    /// Create an empty master. A memory `limit` requires `storage`.
    pub fn new(
        comm: C,
        mut config: MasterConfig,
        storage: Option<Arc<dyn ExternalStorage>>,
    ) -> Result<Self, BlockError> {
        if config.limit.is_some() && storage.is_none() {
            return Err(BlockError::Config(
                "a memory limit requires external storage".into(),
            ));
        }
        if config.limit == Some(0) {
            return Err(BlockError::Config("memory limit must be positive".into()));
        }
        config.threads = config.threads.max(1);
        config.max_in_flight_sends = config.max_in_flight_sends.max(1);
        config.max_message_size = config.max_message_size.max(HEADER_SIZE + 1);

        let pool = if config.threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.threads)
                    .build()
                    .map_err(|e| BlockError::Config(e.to_string()))?,
            )
        } else {
            None
        };
        log::debug!(
            "master on rank {}/{}: {config:?}",
            comm.rank(),
            comm.size()
        );
        Ok(Self {
            comm,
            queue_policy: Box::new(QueueSizePolicy::new(config.queue_unload_size)),
            config,
            blocks: Collection::new(storage.clone()),
            gids: Vec::new(),
            lids: HashMap::new(),
            links: Vec::new(),
            expected: 0,
            exchange_round: 0,
            outgoing: HashMap::new(),
            incoming: BTreeMap::new(),
            collectives: HashMap::new(),
            commands: Vec::new(),
            storage,
            pool,
            transport: Transport::new(),
        })
    }

    /// Replace the default [`QueueSizePolicy`].
    pub fn with_queue_policy(mut self, policy: impl QueuePolicy + 'static) -> Self {
        self.queue_policy = Box::new(policy);
        self
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&Arc<dyn ExternalStorage>> {
        self.storage.as_ref()
    }

    // --- block management ---

    /// Admit a block, evicting resident blocks first if the memory limit is reached.
    pub fn add(&mut self, gid: Gid, block: B, link: Link) -> Result<usize, BlockError> {
        if self.lids.contains_key(&gid) {
            return Err(BlockError::Config(format!("block {gid} added twice")));
        }
        if let Some(limit) = self.config.limit {
            if self.blocks.in_memory() >= limit {
                self.blocks.unload_all()?;
            }
        }
        let lid = self.blocks.add(block);
        self.expected += link.size_unique();
        self.gids.push(gid);
        self.lids.insert(gid, lid);
        self.links.push(link);
        self.outgoing.entry(gid).or_default();
        self.collectives.entry(gid).or_default();
        Ok(lid)
    }

    /// Remove a block and hand it back with its link. Later local ids shift down.
    pub fn release(&mut self, lid: usize) -> Result<(B, Link), BlockError> {
        self.admit(lid)?;
        let block = self.blocks.release(lid)?;
        let gid = self.gids.remove(lid);
        let link = self.links.remove(lid);
        self.expected -= link.size_unique();
        self.lids.remove(&gid);
        for (i, g) in self.gids.iter().enumerate().skip(lid) {
            self.lids.insert(*g, i);
        }
        let storage = self.storage.as_ref();
        if let Some(queues) = self.outgoing.remove(&gid) {
            if queues.values().any(|q| q.size() > 0) {
                log::warn!("released block {gid} with unsent messages");
            }
            for (_, q) in queues {
                q.discard(storage);
            }
        }
        for round in self.incoming.values_mut() {
            if let Some(queues) = round.queues.remove(&gid) {
                for (_, q) in queues {
                    q.discard(storage);
                }
            }
        }
        self.collectives.remove(&gid);
        Ok((block, link))
    }

    /// Block at `lid`, paged in if necessary.
    pub fn block(&mut self, lid: usize) -> Result<&mut B, BlockError> {
        self.admit(lid)?;
        self.blocks.get(lid)
    }

    /// Block at `lid` if it is resident.
    pub fn peek(&self, lid: usize) -> Option<&B> {
        self.blocks.find(lid)
    }

    pub fn link(&self, lid: usize) -> Option<&Link> {
        self.links.get(lid)
    }

    /// Swap in a new link, keeping `expected` consistent.
    pub fn replace_link(&mut self, lid: usize, link: Link) -> Result<Link, BlockError> {
        let slot = self
            .links
            .get_mut(lid)
            .ok_or(BlockError::InvalidLocalId(lid))?;
        self.expected = self.expected - slot.size_unique() + link.size_unique();
        Ok(std::mem::replace(slot, link))
    }

    pub fn gid(&self, lid: usize) -> Option<Gid> {
        self.gids.get(lid).copied()
    }

    pub fn gids(&self) -> &[Gid] {
        &self.gids
    }

    pub fn lid(&self, gid: Gid) -> Option<usize> {
        self.lids.get(&gid).copied()
    }

    pub fn local(&self, gid: Gid) -> bool {
        self.lids.contains_key(&gid)
    }

    /// Number of local blocks.
    pub fn size(&self) -> usize {
        self.gids.len()
    }

    pub fn in_memory(&self) -> usize {
        self.blocks.in_memory()
    }

    pub fn unload_all(&mut self) -> Result<(), BlockError> {
        self.blocks.unload_all()
    }

    /// Refresh neighbor ranks in every link.
    pub fn fix_links(&mut self, assigner: &dyn Assigner) {
        for link in &mut self.links {
            link.fix(assigner);
        }
    }

    /// Messages a round-based exchange waits for.
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn exchange_round(&self) -> u64 {
        self.exchange_round
    }

    fn admit(&mut self, lid: usize) -> Result<(), BlockError> {
        if let Some(limit) = self.config.limit {
            if !self.blocks.is_resident(lid) && self.blocks.in_memory() >= limit {
                self.blocks.unload_others(lid)?;
            }
        }
        Ok(())
    }

    // --- execution ---

    /// Run `f` on every block.
    pub fn foreach<F>(&mut self, f: F) -> Result<(), BlockError>
    where
        F: Fn(&mut B, &mut Proxy<'_>) -> Result<(), BlockError> + Send + Sync + 'static,
    {
        self.push_command(Command {
            f: Arc::new(f),
            skip: None,
        })
    }

    /// Run `f` on every block whose gid `skip` rejects.
    pub fn foreach_skip<F, S>(&mut self, f: F, skip: S) -> Result<(), BlockError>
    where
        F: Fn(&mut B, &mut Proxy<'_>) -> Result<(), BlockError> + Send + Sync + 'static,
        S: Fn(Gid) -> bool + Send + Sync + 'static,
    {
        self.push_command(Command {
            f: Arc::new(f),
            skip: Some(Arc::new(skip)),
        })
    }

    fn push_command(&mut self, cmd: Command<B>) -> Result<(), BlockError> {
        self.commands.push(cmd);
        if self.config.immediate {
            self.execute()
        } else {
            Ok(())
        }
    }

    /// Run deferred commands, block by block.
    pub fn execute(&mut self) -> Result<(), BlockError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.commands);
        let round = self.exchange_round;
        let current = self.incoming.entry(round).or_default();
        for &gid in &self.gids {
            current.queues.entry(gid).or_default();
            self.outgoing.entry(gid).or_default();
            self.collectives.entry(gid).or_default();
        }
        if self.pool.is_some() && self.config.limit.is_none() {
            self.run_parallel(&commands)
        } else {
            self.run_sequential(&commands)
        }
    }

    fn run_sequential(&mut self, commands: &[Command<B>]) -> Result<(), BlockError> {
        let round = self.exchange_round;
        for lid in 0..self.gids.len() {
            let gid = self.gids[lid];
            if commands.iter().all(|c| c.skips(gid)) {
                continue;
            }
            self.admit(lid)?;
            let block = self.blocks.get(lid)?;
            let storage = self.storage.as_ref();
            let outgoing = self.outgoing.entry(gid).or_default();
            let incoming = self
                .incoming
                .get_mut(&round)
                .and_then(|r| r.queues.get_mut(&gid));
            let slot = self.collectives.entry(gid).or_default();
            let mut proxy = Proxy::new(
                gid,
                &self.links[lid],
                round,
                &mut *outgoing,
                incoming,
                slot,
                storage,
            );
            for cmd in commands.iter().filter(|c| !c.skips(gid)) {
                (cmd.f)(block, &mut proxy)?;
            }
            drop(proxy);
            queues::page_outgoing(gid, outgoing, self.queue_policy.as_ref(), storage);

            if let Some(limit) = self.config.limit {
                if self.blocks.in_memory() > limit {
                    self.blocks.unload(lid)?;
                }
            }
        }
        Ok(())
    }

    fn run_parallel(&mut self, commands: &[Command<B>]) -> Result<(), BlockError> {
        let round = self.exchange_round;
        let storage = self.storage.as_ref();
        let policy = self.queue_policy.as_ref();
        let blocks = self.blocks.blocks_mut()?;
        let mut outgoing: HashMap<Gid, &mut OutgoingQueues> =
            self.outgoing.iter_mut().map(|(g, q)| (*g, q)).collect();
        let mut incoming: HashMap<Gid, &mut IncomingQueues> = self
            .incoming
            .get_mut(&round)
            .map(|r| r.queues.iter_mut().map(|(g, q)| (*g, q)).collect())
            .unwrap_or_default();
        let mut slots: HashMap<Gid, &mut CollectiveSlot> =
            self.collectives.iter_mut().map(|(g, s)| (*g, s)).collect();

        let mut items = Vec::with_capacity(blocks.len());
        for ((block, &gid), link) in blocks.into_iter().zip(&self.gids).zip(&self.links) {
            let (Some(out), Some(slot)) = (outgoing.remove(&gid), slots.remove(&gid)) else {
                return Err(BlockError::UnknownGid(gid));
            };
            items.push(WorkItem {
                gid,
                block,
                link,
                outgoing: out,
                incoming: incoming.remove(&gid),
                slot,
            });
        }

        let Some(pool) = self.pool.as_ref() else {
            return Err(BlockError::Config("no thread pool".into()));
        };
        pool.install(|| {
            items.into_par_iter().try_for_each(|item| {
                let WorkItem {
                    gid,
                    block,
                    link,
                    outgoing,
                    incoming,
                    slot,
                } = item;
                if commands.iter().all(|c| c.skips(gid)) {
                    return Ok(());
                }
                let mut proxy =
                    Proxy::new(gid, link, round, &mut *outgoing, incoming, slot, storage);
                for cmd in commands.iter().filter(|c| !c.skips(gid)) {
                    (cmd.f)(block, &mut proxy)?;
                }
                drop(proxy);
                queues::page_outgoing(gid, outgoing, policy, storage);
                Ok(())
            })
        })
    }
}

impl<B: Block, C: Communicator> Drop for Master<B, C> {
    fn drop(&mut self) {
        let storage = self.storage.as_ref();
        for (_, queues) in self.outgoing.drain() {
            for (_, q) in queues {
                q.discard(storage);
            }
        }
        for (_, round) in std::mem::take(&mut self.incoming) {
            round.discard(storage);
        }
    }
}
