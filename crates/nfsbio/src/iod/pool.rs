//! Worker pool shared by all mounts.
//!
//! The registry records each worker and whether it is assigned to a mount.
//! A worker is assigned by sending it the mount over its private channel;
//! it then drains that mount's queue and detaches when the queue is empty.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{AsyncTarget, SubmitError};
use crate::cache::BufHandle;
use crate::config::{ConfigError, IodConfig};
use crate::sync::Waiter;

type Assignment = Arc<dyn AsyncTarget>;

#[derive(Debug)]
struct WorkerSlot {
    id: usize,
    /// Assigned to a mount, or about to receive an assignment.
    busy: bool,
    tx: Sender<Assignment>,
}

#[derive(Debug, Default)]
struct Registry {
    workers: Vec<WorkerSlot>,
    next_id: usize,
    shutdown: bool,
}

#[derive(Debug)]
struct PoolShared {
    config: IodConfig,
    registry: Mutex<Registry>,
}

impl PoolShared {
    /// Returns the worker to the idle set. `false` means it should exit.
    fn mark_idle(&self, id: usize) -> bool {
        let mut reg = self.registry.lock();
        match reg.workers.iter_mut().find(|w| w.id == id) {
            Some(slot) => {
                slot.busy = false;
                true
            }
            None => false,
        }
    }

    /// Retires an idle worker unless the pool is at its floor.
    fn retire_if_idle(&self, id: usize) -> bool {
        let mut reg = self.registry.lock();
        if reg.shutdown {
            return true;
        }
        let Some(idx) = reg.workers.iter().position(|w| w.id == id) else {
            return true;
        };
        if reg.workers[idx].busy || reg.workers.len() <= self.config.min_iods {
            return false;
        }
        reg.workers.swap_remove(idx);
        debug!(worker = id, remaining = reg.workers.len(), "Idle nfsiod retired");
        true
    }

    fn forget(&self, id: usize) {
        self.registry.lock().workers.retain(|w| w.id != id);
    }
}

/// Pool of background I/O workers (`nfsiod`s).
///
/// Workers are spawned lazily up to `max_iods` and retire after
/// `idle_timeout` without work. Dropping the pool tells every worker to
/// exit once it has drained its current mount.
#[derive(Debug)]
pub struct IodPool {
    shared: Arc<PoolShared>,
}

impl IodPool {
    /// Creates an empty pool.
    pub fn new(config: IodConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            shared: Arc::new(PoolShared {
                config,
                registry: Mutex::new(Registry::default()),
            }),
        }))
    }

    /// Pool configuration.
    pub fn config(&self) -> &IodConfig {
        &self.shared.config
    }

    /// Live workers, assigned or idle.
    pub fn worker_count(&self) -> usize {
        self.shared.registry.lock().workers.len()
    }

    /// Workers waiting for an assignment.
    pub fn idle_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .workers
            .iter()
            .filter(|w| !w.busy)
            .count()
    }

    /// Queues `buf` for async service on `target`'s mount.
    ///
    /// Refuses bare-commit buffers once `commit_limit` workers serve the
    /// mount. Blocks while the mount queue holds `2 * max_iods` buffers.
    /// Rejections return the buffer so the caller can do the I/O itself.
    pub(crate) fn submit(
        &self,
        target: &Assignment,
        buf: BufHandle,
        waiter: &Waiter<'_>,
        commit_limit: usize,
    ) -> Result<(), SubmitError> {
        let queue = target.queue();
        let bound = self.shared.config.queue_bound();
        let commit_only = buf.is_commit_only();

        'again: loop {
            let mut q = queue.lock();
            if commit_only && q.attached >= commit_limit {
                trace!(attached = q.attached, commit_limit, "Bare commit left to caller");
                return Err(SubmitError::Busy(buf));
            }

            let mut gotiod = false;
            if let Some((id, tx)) = self.claim() {
                // Sent under the queue lock: the worker cannot look at the
                // queue before our buffer is on it.
                q.attached += 1;
                if tx.send(Arc::clone(target)).is_ok() {
                    gotiod = true;
                } else {
                    q.attached -= 1;
                    self.shared.forget(id);
                }
            }
            if !gotiod && q.attached == 0 {
                trace!("No nfsiod available");
                return Err(SubmitError::Busy(buf));
            }

            while q.bufs.len() >= bound {
                q.space_waiters += 1;
                let waited = waiter.wait(queue.space_cv(), &mut q);
                q.space_waiters -= 1;
                if waited.is_err() {
                    return Err(SubmitError::Interrupted(buf));
                }
                if q.attached == 0 {
                    continue 'again;
                }
            }

            q.bufs.push_back(buf);
            return Ok(());
        }
    }

    fn claim(&self) -> Option<(usize, Sender<Assignment>)> {
        let mut reg = self.shared.registry.lock();
        if reg.shutdown {
            return None;
        }
        if let Some(slot) = reg.workers.iter_mut().find(|w| !w.busy) {
            slot.busy = true;
            return Some((slot.id, slot.tx.clone()));
        }
        if reg.workers.len() < self.shared.config.max_iods {
            return self.spawn(&mut reg);
        }
        None
    }

    fn spawn(&self, reg: &mut Registry) -> Option<(usize, Sender<Assignment>)> {
        let id = reg.next_id;
        let (tx, rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("nfsiod-{id}"))
            .spawn(move || worker_loop(&shared, id, &rx));
        match spawned {
            Ok(_) => {
                reg.next_id += 1;
                reg.workers.push(WorkerSlot {
                    id,
                    busy: true,
                    tx: tx.clone(),
                });
                info!(worker = id, total = reg.workers.len(), "Spawned nfsiod");
                Some((id, tx))
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn nfsiod");
                None
            }
        }
    }
}

impl Drop for IodPool {
    fn drop(&mut self) {
        let mut reg = self.shared.registry.lock();
        reg.shutdown = true;
        // Dropping the senders disconnects every idle worker.
        reg.workers.clear();
        debug!("nfsiod pool shut down");
    }
}

fn worker_loop(
    shared: &PoolShared,
    id: usize,
    rx: &crossbeam_channel::Receiver<Assignment>,
) {
    debug!(worker = id, "nfsiod started");
    loop {
        match rx.recv_timeout(shared.config.idle_timeout) {
            Ok(target) => {
                serve(id, target.as_ref());
                drop(target);
                if !shared.mark_idle(id) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.retire_if_idle(id) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = id, "nfsiod exiting");
}

fn serve(id: usize, target: &dyn AsyncTarget) {
    let queue = target.queue();
    let mut served = 0usize;
    while let Some(buf) = queue.pop_or_detach() {
        target.run_async(buf);
        served += 1;
    }
    trace!(worker = id, served, "nfsiod detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoCmd;
    use crate::cache::BufCache;
    use crate::iod::MountQueue;
    use crate::rpc::FileId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Target whose I/O blocks until the gate opens.
    #[derive(Default)]
    struct GatedTarget {
        queue: MountQueue,
        gate: parking_lot::Mutex<bool>,
        cv: parking_lot::Condvar,
        served: AtomicUsize,
    }

    impl GatedTarget {
        fn open(&self) {
            *self.gate.lock() = true;
            self.cv.notify_all();
        }
    }

    impl AsyncTarget for GatedTarget {
        fn queue(&self) -> &MountQueue {
            &self.queue
        }

        fn run_async(&self, buf: BufHandle) {
            let mut open = self.gate.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
            self.served.fetch_add(1, Ordering::SeqCst);
            drop(buf);
        }
    }

    fn dirty(cache: &Arc<BufCache>, lbn: u64) -> BufHandle {
        let mut b = cache
            .get_block(FileId(1), lbn, lbn, 16, &Waiter::uninterruptible())
            .unwrap();
        b.copy_in(0, &[1; 16]);
        b.set_async(IoCmd::Write);
        b
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_spawns_named_worker_and_serves() {
        let pool = IodPool::new(IodConfig::default().max_iods(2)).unwrap();
        let target = Arc::new(GatedTarget::default());
        target.open();
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        wait_until(|| target.served.load(Ordering::SeqCst) == 1);
        assert_eq!(pool.worker_count(), 1);
        wait_until(|| target.queue.attached() == 0);
        wait_until(|| pool.idle_count() == 1);
    }

    #[test]
    fn test_bare_commit_refused_at_limit() {
        let pool = IodPool::new(IodConfig::default().max_iods(2)).unwrap();
        let target = Arc::new(GatedTarget::default());
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        // One worker attached and stuck
        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();

        let mut commit = dirty(&cache, 1);
        commit.mark_needs_commit(crate::rpc::WriteVerifier(1));
        let err = pool
            .submit(&assignment, commit, &Waiter::uninterruptible(), 1)
            .unwrap_err();
        assert!(matches!(err, SubmitError::Busy(_)));
        assert_eq!(err.into_handle().lbn(), 1);
        target.open();
    }

    #[test]
    fn test_busy_when_no_worker_attached() {
        let pool = IodPool::new(IodConfig::default().max_iods(1)).unwrap();
        let busy = Arc::new(GatedTarget::default());
        let other = Arc::new(GatedTarget::default());
        let busy_assignment: Assignment = busy.clone();
        let other_assignment: Assignment = other.clone();
        let cache = BufCache::new();

        pool.submit(&busy_assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        let err = pool
            .submit(&other_assignment, dirty(&cache, 1), &Waiter::uninterruptible(), 1)
            .unwrap_err();
        assert!(matches!(err, SubmitError::Busy(_)));
        busy.open();
    }

    #[test]
    fn test_full_queue_blocks_until_space() {
        let pool = IodPool::new(IodConfig::default().max_iods(1)).unwrap();
        let target = Arc::new(GatedTarget::default());
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        // First buffer is taken by the worker, the next two fill the queue
        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        wait_until(|| target.queue.is_empty());
        for lbn in 1..=2 {
            pool.submit(&assignment, dirty(&cache, lbn), &Waiter::uninterruptible(), 1)
                .unwrap();
        }
        assert_eq!(target.queue.len(), 2);

        let submitter = {
            let pool = Arc::clone(&pool);
            let assignment = Arc::clone(&assignment);
            let buf = dirty(&cache, 3);
            thread::spawn(move || {
                pool.submit(&assignment, buf, &Waiter::uninterruptible(), 1)
                    .is_ok()
            })
        };

        wait_until(|| target.queue.space_waiters() == 1);
        assert!(!submitter.is_finished());
        target.open();
        assert!(submitter.join().unwrap());
        wait_until(|| target.served.load(Ordering::SeqCst) == 4);
    }

    #[test]
    fn test_interrupted_submitter_gets_buffer_back() {
        let pool = IodPool::new(IodConfig::default().max_iods(1)).unwrap();
        let target = Arc::new(GatedTarget::default());
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        wait_until(|| target.queue.is_empty());
        for lbn in 1..=2 {
            pool.submit(&assignment, dirty(&cache, lbn), &Waiter::uninterruptible(), 1)
                .unwrap();
        }

        let token = crate::context::CancelToken::new();
        token.cancel();
        let waiter = Waiter::new(true, &token, Duration::from_millis(5));
        let err = pool
            .submit(&assignment, dirty(&cache, 3), &waiter, 1)
            .unwrap_err();
        assert!(matches!(err, SubmitError::Interrupted(_)));
        target.open();
    }

    #[test]
    fn test_idle_worker_retires() {
        let config = IodConfig::default()
            .max_iods(2)
            .idle_timeout(Duration::from_millis(20));
        let pool = IodPool::new(config).unwrap();
        let target = Arc::new(GatedTarget::default());
        target.open();
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        wait_until(|| pool.worker_count() == 0);
    }

    #[test]
    fn test_min_iods_floor_respected() {
        let config = IodConfig::default()
            .max_iods(2)
            .min_iods(1)
            .idle_timeout(Duration::from_millis(10));
        let pool = IodPool::new(config).unwrap();
        let target = Arc::new(GatedTarget::default());
        target.open();
        let assignment: Assignment = target.clone();
        let cache = BufCache::new();

        pool.submit(&assignment, dirty(&cache, 0), &Waiter::uninterruptible(), 1)
            .unwrap();
        wait_until(|| target.served.load(Ordering::SeqCst) == 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.worker_count(), 1);
    }
}
