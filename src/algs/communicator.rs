//! Thin façade over intra-process or inter-process (MPI) message passing.
//!
//! Messages are *owned byte vectors* (no zero-copy guarantees). Sends are
//! synchronous-mode and non-blocking: a send handle only tests complete once
//! the receiver has matched the message, which is what the NBX termination
//! idiom in `master::exchange` relies on. Receives are probe-driven: the
//! runtime never knows the sender or the size up front.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Typed message tag so exchange disciplines never cross streams.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(u16);

impl CommTag {
    /// Round-based `exchange` traffic.
    pub const EXCHANGE: CommTag = CommTag(0x0B10);
    /// Asynchronous `iexchange` traffic.
    pub const IEXCHANGE: CommTag = CommTag(0x0B11);

    pub const fn new(raw: u16) -> Self {
        CommTag(raw)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// Element-wise reduction used by the all-reduce collectives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    pub fn apply_i64(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Product => a.wrapping_mul(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    pub fn identity_f64(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Product => 1.0,
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }

    pub fn identity_i64(self) -> i64 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Product => 1,
            ReduceOp::Min => i64::MAX,
            ReduceOp::Max => i64::MIN,
        }
    }
}

/// Anything that can be tested or waited on.
pub trait Wait {
    /// Non-blocking completion check.
    fn test(&mut self) -> bool;

    /// Spin until completion.
    fn wait(mut self)
    where
        Self: Sized,
    {
        while !self.test() {
            std::thread::yield_now();
        }
    }
}

impl Wait for () {
    fn test(&mut self) -> bool {
        true
    }
}

/// Point-to-point and collective interface used by [`Master`](crate::master::Master).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `ibarrier`.
    type BarrierHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Post a synchronous-mode non-blocking send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: CommTag, buf: Vec<u8>) -> Self::SendHandle;

    /// Receive one pending message carrying `tag` from any source, if present.
    fn try_recv(&self, tag: CommTag) -> Option<(usize, Vec<u8>)>;

    /// Enter a non-blocking barrier.
    fn ibarrier(&self) -> Self::BarrierHandle;

    fn barrier(&self) {
        self.ibarrier().wait();
    }

    /// Element-wise all-reduce; every rank must pass the same length.
    fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Vec<f64>;

    fn all_reduce_i64(&self, values: &[i64], op: ReduceOp) -> Vec<i64>;

    /// Gather one byte buffer from every rank, indexed by rank.
    fn all_gather_bytes(&self, buf: &[u8]) -> Vec<Vec<u8>>;
}

/// Compile-time no-op comm for single-worker runs and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type BarrierHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, peer: usize, _tag: CommTag, _buf: Vec<u8>) {
        log::warn!("NoComm dropped a message addressed to rank {peer}");
    }
    fn try_recv(&self, _tag: CommTag) -> Option<(usize, Vec<u8>)> {
        None
    }
    fn ibarrier(&self) {}
    fn all_reduce_f64(&self, values: &[f64], _op: ReduceOp) -> Vec<f64> {
        values.to_vec()
    }
    fn all_reduce_i64(&self, values: &[i64], _op: ReduceOp) -> Vec<i64> {
        values.to_vec()
    }
    fn all_gather_bytes(&self, buf: &[u8]) -> Vec<Vec<u8>> {
        vec![buf.to_vec()]
    }
}

// --- LocalWorld: several ranks inside one process, one thread each ---

struct Envelope {
    source: usize,
    payload: Bytes,
    matched: Arc<AtomicBool>,
}

struct EpochSlot {
    arrived: usize,
    departed: usize,
    contributions: Vec<Option<Vec<u8>>>,
}

impl EpochSlot {
    fn new(size: usize) -> Self {
        Self {
            arrived: 0,
            departed: 0,
            contributions: vec![None; size],
        }
    }
}

struct LocalShared {
    size: usize,
    /// Keyed by (destination, tag); FIFO per sender keeps MPI's non-overtaking rule.
    mailboxes: DashMap<(usize, u16), VecDeque<Envelope>>,
    barriers: Mutex<HashMap<u64, EpochSlot>>,
    gathers: Mutex<HashMap<u64, EpochSlot>>,
    gathered: Condvar,
}

/// An in-process "world" of `size` ranks sharing mailboxes.
///
/// Call [`LocalWorld::comm`] exactly once per rank; collectives and barriers
/// are matched by per-rank epoch counters, just like MPI matches them by call
/// order on a communicator.
#[derive(Clone)]
pub struct LocalWorld {
    shared: Arc<LocalShared>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(LocalShared {
                size: size.max(1),
                mailboxes: DashMap::new(),
                barriers: Mutex::new(HashMap::new()),
                gathers: Mutex::new(HashMap::new()),
                gathered: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Communicator endpoint for `rank`.
    pub fn comm(&self, rank: usize) -> LocalComm {
        LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
            barrier_epoch: Arc::new(AtomicU64::new(0)),
            gather_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `f` on `size` threads, one per rank, and collect the results by rank.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let world = LocalWorld::new(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = (0..world.size())
                .map(|rank| {
                    let comm = world.comm(rank);
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}

/// One rank's endpoint into a [`LocalWorld`].
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<LocalShared>,
    barrier_epoch: Arc<AtomicU64>,
    gather_epoch: Arc<AtomicU64>,
}

pub struct LocalSendHandle {
    matched: Arc<AtomicBool>,
}

impl Wait for LocalSendHandle {
    fn test(&mut self) -> bool {
        self.matched.load(Ordering::Acquire)
    }
}

pub struct LocalBarrierHandle {
    shared: Arc<LocalShared>,
    epoch: u64,
    done: bool,
}

impl Wait for LocalBarrierHandle {
    fn test(&mut self) -> bool {
        if self.done {
            return true;
        }
        let size = self.shared.size;
        let mut barriers = self.shared.barriers.lock();
        let finished = match barriers.get_mut(&self.epoch) {
            Some(slot) if slot.arrived == size => {
                slot.departed += 1;
                true
            }
            _ => false,
        };
        if finished {
            if barriers
                .get(&self.epoch)
                .is_some_and(|slot| slot.departed == size)
            {
                barriers.remove(&self.epoch);
            }
            self.done = true;
        }
        finished
    }
}

impl LocalComm {
    fn gather_all(&self, buf: &[u8]) -> Vec<Vec<u8>> {
        let epoch = self.gather_epoch.fetch_add(1, Ordering::Relaxed);
        let size = self.shared.size;
        let mut slots = self.shared.gathers.lock();
        {
            let slot = slots.entry(epoch).or_insert_with(|| EpochSlot::new(size));
            slot.contributions[self.rank] = Some(buf.to_vec());
            slot.arrived += 1;
            if slot.arrived == size {
                self.shared.gathered.notify_all();
            }
        }
        while !slots.get(&epoch).is_some_and(|slot| slot.arrived == size) {
            self.shared.gathered.wait(&mut slots);
        }
        let (out, last) = match slots.get_mut(&epoch) {
            Some(slot) => {
                slot.departed += 1;
                let out = slot
                    .contributions
                    .iter()
                    .map(|c| c.clone().unwrap_or_default())
                    .collect();
                (out, slot.departed == size)
            }
            None => (Vec::new(), false),
        };
        if last {
            slots.remove(&epoch);
        }
        out
    }
}

fn le_f64(chunk: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(chunk);
    f64::from_le_bytes(raw)
}

fn le_i64(chunk: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(chunk);
    i64::from_le_bytes(raw)
}

impl Communicator for LocalComm {
    type SendHandle = LocalSendHandle;
    type BarrierHandle = LocalBarrierHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: Vec<u8>) -> LocalSendHandle {
        let matched = Arc::new(AtomicBool::new(false));
        self.shared
            .mailboxes
            .entry((peer, tag.as_u16()))
            .or_default()
            .push_back(Envelope {
                source: self.rank,
                payload: Bytes::from(buf),
                matched: Arc::clone(&matched),
            });
        LocalSendHandle { matched }
    }

    fn try_recv(&self, tag: CommTag) -> Option<(usize, Vec<u8>)> {
        let envelope = {
            let mut queue = self.shared.mailboxes.get_mut(&(self.rank, tag.as_u16()))?;
            queue.pop_front()?
        };
        envelope.matched.store(true, Ordering::Release);
        Some((envelope.source, envelope.payload.to_vec()))
    }

    fn ibarrier(&self) -> LocalBarrierHandle {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::Relaxed);
        self.shared
            .barriers
            .lock()
            .entry(epoch)
            .or_insert_with(|| EpochSlot::new(0))
            .arrived += 1;
        LocalBarrierHandle {
            shared: Arc::clone(&self.shared),
            epoch,
            done: false,
        }
    }

    fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Vec<f64> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let parts = self.gather_all(&bytes);
        let mut out = values.to_vec();
        for (rank, part) in parts.iter().enumerate() {
            for (i, chunk) in part.chunks_exact(8).enumerate().take(out.len()) {
                let v = le_f64(chunk);
                out[i] = if rank == 0 { v } else { op.apply_f64(out[i], v) };
            }
        }
        out
    }

    fn all_reduce_i64(&self, values: &[i64], op: ReduceOp) -> Vec<i64> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let parts = self.gather_all(&bytes);
        let mut out = values.to_vec();
        for (rank, part) in parts.iter().enumerate() {
            for (i, chunk) in part.chunks_exact(8).enumerate().take(out.len()) {
                let v = le_i64(chunk);
                out[i] = if rank == 0 { v } else { op.apply_i64(out[i], v) };
            }
        }
        out
    }

    fn all_gather_bytes(&self, buf: &[u8]) -> Vec<Vec<u8>> {
        self.gather_all(buf)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use crate::block_error::BlockError;
    use mpi::Threading;
    use mpi::collective::SystemOperation;
    use mpi::datatype::PartitionMut;
    use mpi::environment::Universe;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// World communicator plus the universe that keeps MPI initialized.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
        _universe: Universe,
    }

    // SAFETY: `MpiComm::new` only succeeds when MPI granted MPI_THREAD_MULTIPLE,
    // under which any thread may call into MPI concurrently.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    /// Accept only the threading level that lets the communicator cross threads.
    fn require_multiple(granted: Threading) -> Result<(), BlockError> {
        if granted == Threading::Multiple {
            Ok(())
        } else {
            log::error!("MPI granted {granted:?}, MPI_THREAD_MULTIPLE is required");
            Err(BlockError::MpiInit)
        }
    }

    impl MpiComm {
        pub fn new() -> Result<Self, BlockError> {
            let (universe, threading) =
                mpi::initialize_with_threading(Threading::Multiple).ok_or(BlockError::MpiInit)?;
            require_multiple(threading)?;
            log::debug!("MPI initialized with threading level {threading:?}");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Type-erased MPI request; owns the leaked send buffer until completion.
    pub struct MpiHandle {
        poll: Box<dyn FnMut() -> bool>,
        buffer: Option<*mut [u8]>,
        done: bool,
    }

    impl MpiHandle {
        fn pending<R, F>(request: R, mut test: F, buffer: Option<*mut [u8]>) -> Self
        where
            R: 'static,
            F: FnMut(R) -> Result<(), R> + 'static,
        {
            let mut slot = Some(request);
            let poll = move || match slot.take() {
                Some(r) => match test(r) {
                    Ok(()) => true,
                    Err(r) => {
                        slot = Some(r);
                        false
                    }
                },
                None => true,
            };
            Self {
                poll: Box::new(poll),
                buffer,
                done: false,
            }
        }

        fn release(&mut self) {
            if let Some(raw) = self.buffer.take() {
                // SAFETY: `raw` came from `Box::into_raw` in `isend` and the
                // request that borrowed it has completed.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }

    impl Wait for MpiHandle {
        fn test(&mut self) -> bool {
            if !self.done && (self.poll)() {
                self.done = true;
                self.release();
            }
            self.done
        }
    }

    impl Drop for MpiHandle {
        fn drop(&mut self) {
            while !self.test() {
                std::thread::yield_now();
            }
        }
    }

    fn system_op(op: ReduceOp) -> SystemOperation {
        match op {
            ReduceOp::Sum => SystemOperation::sum(),
            ReduceOp::Product => SystemOperation::product(),
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type BarrierHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: CommTag, buf: Vec<u8>) -> MpiHandle {
            let raw: *mut [u8] = Box::into_raw(buf.into_boxed_slice());
            // SAFETY: freed in `MpiHandle::release` once the send completed.
            let data: &'static [u8] = unsafe { &*raw };
            let request = self
                .world
                .process_at_rank(peer as i32)
                .immediate_synchronous_send_with_tag(StaticScope, data, tag.as_u16() as i32);
            MpiHandle::pending(request, |r| r.test().map(|_| ()), Some(raw))
        }

        fn try_recv(&self, tag: CommTag) -> Option<(usize, Vec<u8>)> {
            let (msg, status) = self
                .world
                .any_process()
                .immediate_matched_probe_with_tag(tag.as_u16() as i32)?;
            let (data, _) = msg.matched_receive_vec::<u8>();
            Some((status.source_rank() as usize, data))
        }

        fn ibarrier(&self) -> MpiHandle {
            let request = self.world.immediate_barrier();
            MpiHandle::pending(request, |r| r.test().map(|_| ()), None)
        }

        fn all_reduce_f64(&self, values: &[f64], op: ReduceOp) -> Vec<f64> {
            let mut out = vec![0.0f64; values.len()];
            self.world
                .all_reduce_into(values, &mut out[..], system_op(op));
            out
        }

        fn all_reduce_i64(&self, values: &[i64], op: ReduceOp) -> Vec<i64> {
            let mut out = vec![0i64; values.len()];
            self.world
                .all_reduce_into(values, &mut out[..], system_op(op));
            out
        }

        fn all_gather_bytes(&self, buf: &[u8]) -> Vec<Vec<u8>> {
            let count = buf.len() as i32;
            let mut counts = vec![0i32; self.size];
            self.world.all_gather_into(&count, &mut counts[..]);
            let displs: Vec<i32> = counts
                .iter()
                .scan(0i32, |acc, &c| {
                    let d = *acc;
                    *acc += c;
                    Some(d)
                })
                .collect();
            let total: i32 = counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let mut partition = PartitionMut::new(&mut recv[..], &counts[..], &displs[..]);
                self.world.all_gather_varcount_into(buf, &mut partition);
            }
            counts
                .iter()
                .zip(&displs)
                .map(|(&c, &d)| recv[d as usize..(d + c) as usize].to_vec())
                .collect()
        }
    }

}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiHandle};
