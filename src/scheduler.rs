//! The operations scheduler.
//!
//! A CVMFS repository accepts only one open transaction at a time, so every
//! mutation is funneled through a single worker. Producers submit batches of
//! operations with [`SchedulerHandle::add_fs_operations`], receive a batch
//! index, and wait on it with [`SchedulerHandle::wait_for`]. The worker
//! ([`OperationsLoop`]) drains all pending batches into one transaction,
//! applies them in submission order, publishes, and then releases the waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::fsop::ScheduledOperation;
use crate::transaction::{RepositoryBackend, TransactionDriver};

/// Identifies a submitted batch; assigned in increasing order.
pub type BatchIndex = u64;

/// Errors surfaced to submitters by the scheduler itself. The outcome of
/// an individual operation is instead read from its [`crate::fsop::Operation`]
/// handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler no longer accepts or processes work.
    #[error("Operations scheduler has stopped")]
    Stopped,
    /// The index was never returned by a successful submission, or was
    /// already waited on.
    #[error("Batch {0} was not scheduled")]
    NotScheduled(BatchIndex),
    /// The transaction containing the batch could not be opened or
    /// published; none of its operations should be considered applied.
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

type BatchResult = std::result::Result<(), SchedulerError>;

struct Batch {
    index: BatchIndex,
    ops: Vec<Arc<dyn ScheduledOperation>>,
    done: oneshot::Sender<BatchResult>,
}

struct Queue {
    /// Taken on shutdown
    sender: Option<mpsc::UnboundedSender<Batch>>,
    next_index: BatchIndex,
    waiters: HashMap<BatchIndex, oneshot::Receiver<BatchResult>>,
}

/// The submission side of the scheduler. Cheap to clone; all clones
/// share one queue.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<Mutex<Queue>>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock().unwrap();
        f.debug_struct("SchedulerHandle")
            .field("accepting", &queue.sender.is_some())
            .field("next_index", &queue.next_index)
            .finish()
    }
}

/// Counters reported by the worker when it exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub transactions: u64,
    pub failed_transactions: u64,
    pub batches: u64,
    pub operations: u64,
}

/// The worker side of the scheduler; the only owner of the repository
/// transaction.
pub struct OperationsLoop<B> {
    driver: TransactionDriver<B>,
    receiver: mpsc::UnboundedReceiver<Batch>,
    max_batch_operations: usize,
    stats: LoopStats,
}

/// Create a scheduler for `backend`.
///
/// At most `max_batch_operations` operations are drained into a single
/// transaction, but a batch is never split, and at least one batch is
/// always taken.
pub fn new_scheduler<B: RepositoryBackend>(
    backend: B,
    max_batch_operations: usize,
) -> (SchedulerHandle, OperationsLoop<B>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let queue = Queue {
        sender: Some(sender),
        next_index: 0,
        waiters: HashMap::new(),
    };
    let handle = SchedulerHandle {
        queue: Arc::new(Mutex::new(queue)),
    };
    let worker = OperationsLoop {
        driver: TransactionDriver::new(backend),
        receiver,
        max_batch_operations,
        stats: Default::default(),
    };
    (handle, worker)
}

impl SchedulerHandle {
    /// Queue a batch of operations, returning its index. Never blocks.
    ///
    /// The completion notification for the returned index is held by the
    /// scheduler until it is consumed with [`Self::wait_for`] or released
    /// with [`Self::discard`]; callers must do one of the two.
    pub fn add_fs_operations(
        &self,
        ops: impl IntoIterator<Item = Arc<dyn ScheduledOperation>>,
    ) -> std::result::Result<BatchIndex, SchedulerError> {
        let ops = ops.into_iter().collect::<Vec<_>>();
        let mut queue = self.queue.lock().unwrap();
        let index = queue.next_index;
        let sender = queue.sender.as_ref().ok_or(SchedulerError::Stopped)?;
        let (done, waiter) = oneshot::channel();
        // Sending under the lock keeps the channel in index order.
        sender
            .send(Batch { index, ops, done })
            .map_err(|_| SchedulerError::Stopped)?;
        queue.next_index += 1;
        queue.waiters.insert(index, waiter);
        tracing::trace!("Queued batch {index}");
        Ok(index)
    }

    /// Wait until the batch at `index` has been processed, i.e. every
    /// operation in it was attempted in a transaction that has since been
    /// published.
    ///
    /// Dropping the returned future stops waiting but does not cancel the
    /// batch, and the index cannot be waited on again.
    pub async fn wait_for(&self, index: BatchIndex) -> std::result::Result<(), SchedulerError> {
        let waiter = self
            .queue
            .lock()
            .unwrap()
            .waiters
            .remove(&index)
            .ok_or(SchedulerError::NotScheduled(index))?;
        waiter.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Release the completion notification of a batch without waiting for
    /// it. The batch itself is still processed. Returns `false` if `index`
    /// has no pending notification.
    pub fn discard(&self, index: BatchIndex) -> bool {
        self.queue.lock().unwrap().waiters.remove(&index).is_some()
    }

    /// Submit a batch and wait for it.
    pub async fn submit(
        &self,
        ops: impl IntoIterator<Item = Arc<dyn ScheduledOperation>>,
    ) -> std::result::Result<(), SchedulerError> {
        let index = self.add_fs_operations(ops)?;
        self.wait_for(index).await
    }

    /// Stop accepting new batches. Batches that were already accepted are
    /// still processed, after which the worker exits.
    pub fn shutdown(&self) {
        let mut queue = self.queue.lock().unwrap();
        if queue.sender.take().is_some() {
            tracing::debug!("Scheduler shutting down");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.queue.lock().unwrap().sender.is_some()
    }
}

impl<B: RepositoryBackend> OperationsLoop<B> {
    /// Run the worker on a dedicated thread.
    pub fn spawn(self) -> Result<std::thread::JoinHandle<LoopStats>> {
        std::thread::Builder::new()
            .name("cvmfs-transactions".into())
            .spawn(move || self.start_operations_loop())
            .context("Spawning operations loop")
    }

    /// Process batches until the scheduler is shut down (or every handle is
    /// dropped) and the queue is empty. Blocks the calling thread, which must
    /// not be running an async executor.
    pub fn start_operations_loop(mut self) -> LoopStats {
        tracing::debug!("Operations loop started");
        while let Some(first) = self.receiver.blocking_recv() {
            let batches = self.drain(first);
            self.process(batches);
        }
        tracing::debug!("Operations loop finished: {:?}", self.stats);
        self.stats
    }

    /// Collect further pending batches, stopping once the operation limit
    /// is reached.
    fn drain(&mut self, first: Batch) -> Vec<Batch> {
        let mut n_ops = first.ops.len();
        let mut batches = vec![first];
        while n_ops < self.max_batch_operations {
            let Ok(next) = self.receiver.try_recv() else {
                break;
            };
            n_ops += next.ops.len();
            batches.push(next);
        }
        batches
    }

    fn process(&mut self, batches: Vec<Batch>) {
        let n_ops = batches.iter().map(|b| b.ops.len()).sum::<usize>();
        let first = batches.first().map(|b| b.index).unwrap_or_default();
        let last = batches.last().map(|b| b.index).unwrap_or_default();
        self.stats.batches += batches.len() as u64;
        self.stats.operations += n_ops as u64;

        let r = if n_ops == 0 {
            Ok(())
        } else {
            match self.run_transaction(&batches) {
                Ok(()) => {
                    self.stats.transactions += 1;
                    tracing::info!(
                        "Published {n_ops} operations from batches {first}..={last}"
                    );
                    Ok(())
                }
                Err(e) => {
                    self.stats.failed_transactions += 1;
                    tracing::error!("Transaction for batches {first}..={last} failed: {e:#}");
                    let msg = format!("{e:#}");
                    // Operations that were never applied, e.g. because the
                    // transaction could not be opened
                    for op in batches.iter().flat_map(|b| b.ops.iter()) {
                        op.complete(Err(anyhow::anyhow!("Transaction failed: {msg}")));
                    }
                    Err(SchedulerError::Transaction(msg))
                }
            }
        };
        for batch in batches {
            // The submitter may have stopped waiting, which is fine.
            let _ = batch.done.send(r.clone());
        }
    }

    fn run_transaction(&mut self, batches: &[Batch]) -> Result<()> {
        self.driver.open()?;
        let applied = batches
            .iter()
            .try_for_each(|batch| self.driver.apply(&batch.ops));
        if let Err(e) = applied {
            if let Err(abort_err) = self.driver.abort() {
                tracing::error!("Failed to abort transaction: {abort_err:#}");
            }
            return Err(e);
        }
        self.driver.publish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use cap_std_ext::cap_std;
    use cap_std_ext::cap_std::fs::Dir;
    use cap_std_ext::cap_tempfile::TempDir;

    use super::*;
    use crate::fsop::{AddCatalog, FsOperation, Operation, OperationState};
    use crate::transaction::tests::{BackendControl, TestBackend};

    /// Appends its id to a shared log and counts its applications.
    struct Record {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        applied: Arc<AtomicU64>,
    }

    impl FsOperation for Record {
        fn apply(&mut self, _root: &Dir) -> Result<()> {
            self.log.lock().unwrap().push(self.id);
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn describe(&self) -> String {
            format!("record {}", self.id)
        }
    }

    fn new_test_scheduler(
        td: &Dir,
        max_batch_operations: usize,
    ) -> (SchedulerHandle, OperationsLoop<TestBackend>, Arc<BackendControl>) {
        let (backend, control) = TestBackend::new(td);
        let (handle, worker) = new_scheduler(backend, max_batch_operations);
        (handle, worker, control)
    }

    fn records(
        ids: std::ops::Range<usize>,
        log: &Arc<Mutex<Vec<usize>>>,
    ) -> Vec<Arc<Operation<Record>>> {
        ids.map(|id| {
            Operation::new(Record {
                id,
                log: Arc::clone(log),
                applied: Default::default(),
            })
        })
        .collect()
    }

    fn scheduled(ops: &[Arc<Operation<Record>>]) -> Vec<Arc<dyn ScheduledOperation>> {
        ops.iter().map(|o| o.scheduled()).collect()
    }

    #[tokio::test]
    async fn test_submit_and_wait() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 1000);
        let worker = worker.spawn()?;

        let op = Operation::new(AddCatalog::new("layers/ab"));
        let index = handle.add_fs_operations([op.scheduled()])?;
        assert_eq!(index, 0);
        handle.wait_for(index).await?;
        assert_eq!(op.state(), OperationState::Applied);
        assert!(td.try_exists("layers/ab/.cvmfscatalog")?);
        assert_eq!(control.published.load(Ordering::SeqCst), 1);

        // Waiting again on a consumed index
        assert_eq!(
            handle.wait_for(index).await,
            Err(SchedulerError::NotScheduled(index))
        );

        handle.shutdown();
        let stats = worker.join().unwrap();
        similar_asserts::assert_eq!(
            stats,
            LoopStats {
                transactions: 1,
                failed_transactions: 0,
                batches: 1,
                operations: 1
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_not_scheduled() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, _worker, _control) = new_test_scheduler(&td, 1000);
        assert_eq!(
            handle.wait_for(42).await,
            Err(SchedulerError::NotScheduled(42))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 1000);

        // Accepted before shutdown, so it is still processed
        let op = Operation::new(AddCatalog::new("before"));
        let index = handle.add_fs_operations([op.scheduled()])?;
        handle.shutdown();
        assert!(!handle.is_accepting());

        let late = Operation::new(AddCatalog::new("after"));
        assert_eq!(
            handle.add_fs_operations([late.scheduled()]),
            Err(SchedulerError::Stopped)
        );

        let worker = worker.spawn()?;
        handle.wait_for(index).await?;
        assert_eq!(op.state(), OperationState::Applied);
        assert_eq!(late.state(), OperationState::Pending);
        worker.join().unwrap();
        assert_eq!(control.published.load(Ordering::SeqCst), 1);
        assert!(!td.try_exists("after")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_discard() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, _control) = new_test_scheduler(&td, 1000);
        let op = Operation::new(AddCatalog::new("discarded"));
        let index = handle.add_fs_operations([op.scheduled()])?;
        assert!(handle.discard(index));
        assert!(!handle.discard(index));
        assert_eq!(
            handle.wait_for(index).await,
            Err(SchedulerError::NotScheduled(index))
        );

        // The batch is still processed
        handle.shutdown();
        worker.spawn()?.join().unwrap();
        assert_eq!(op.state(), OperationState::Applied);
        assert!(td.try_exists("discarded/.cvmfscatalog")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_gone() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, _control) = new_test_scheduler(&td, 1000);
        let index = handle.add_fs_operations([])?;
        drop(worker);
        assert_eq!(handle.wait_for(index).await, Err(SchedulerError::Stopped));
        assert_eq!(handle.add_fs_operations([]), Err(SchedulerError::Stopped));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_batches_share_transaction() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 1000);
        let log = Arc::new(Mutex::new(Vec::new()));

        // Queue everything before the worker starts, so that one drain sees it all
        let ops = records(0..9, &log);
        let indices = ops
            .chunks(3)
            .map(|chunk| handle.add_fs_operations(scheduled(chunk)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        assert_eq!(indices, [0, 1, 2]);

        let worker = worker.spawn()?;
        for index in indices {
            handle.wait_for(index).await?;
        }
        handle.shutdown();
        worker.join().unwrap();

        assert_eq!(control.begun.load(Ordering::SeqCst), 1);
        assert_eq!(control.published.load(Ordering::SeqCst), 1);
        similar_asserts::assert_eq!(*log.lock().unwrap(), (0..9).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_max_batch_operations() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 4);
        let log = Arc::new(Mutex::new(Vec::new()));

        let ops = records(0..10, &log);
        let indices = ops
            .chunks(2)
            .map(|chunk| handle.add_fs_operations(scheduled(chunk)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        handle.shutdown();

        let worker = worker.spawn()?;
        for index in indices {
            handle.wait_for(index).await?;
        }
        let stats = worker.join().unwrap();
        // [0, 1] + [2, 3], [4, 5] + [6, 7], [8, 9]
        assert_eq!(control.published.load(Ordering::SeqCst), 3);
        assert_eq!(stats.transactions, 3);
        assert_eq!(stats.batches, 5);
        similar_asserts::assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_operation_failure_is_local() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        td.write("blocker", "")?;
        let (handle, worker, control) = new_test_scheduler(&td, 1000);
        let worker = worker.spawn()?;

        let bad = Operation::new(AddCatalog::new("blocker/sub"));
        let good = Operation::new(AddCatalog::new("good"));
        handle.submit([bad.scheduled(), good.scheduled()]).await?;
        assert_eq!(bad.state(), OperationState::Failed);
        assert!(bad.first_error().is_some());
        assert_eq!(good.state(), OperationState::Applied);
        assert_eq!(control.published.load(Ordering::SeqCst), 1);

        handle.shutdown();
        worker.join().unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_transaction_failures() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 1000);
        let worker = worker.spawn()?;

        control.fail_begin.store(true, Ordering::SeqCst);
        let op = Operation::new(AddCatalog::new("a"));
        let r = handle.submit([op.scheduled()]).await;
        assert!(
            matches!(&r, Err(SchedulerError::Transaction(msg)) if msg.contains("injected begin failure")),
            "{r:?}"
        );
        assert_eq!(op.state(), OperationState::Failed);
        control.fail_begin.store(false, Ordering::SeqCst);

        control.fail_publish.store(true, Ordering::SeqCst);
        let op = Operation::new(AddCatalog::new("b"));
        let r = handle.submit([op.scheduled()]).await;
        assert!(
            matches!(&r, Err(SchedulerError::Transaction(msg)) if msg.contains("injected publish failure")),
            "{r:?}"
        );
        assert_eq!(control.aborted.load(Ordering::SeqCst), 1);
        // Applied in a transaction which was rolled back
        assert_eq!(op.state(), OperationState::Failed);
        let e = format!("{:#}", op.first_error().unwrap());
        assert!(e.contains("injected publish failure"), "{e}");
        control.fail_publish.store(false, Ordering::SeqCst);

        // The scheduler keeps going
        let op = Operation::new(AddCatalog::new("c"));
        handle.submit([op.scheduled()]).await?;
        assert_eq!(op.state(), OperationState::Applied);

        handle.shutdown();
        let stats = worker.join().unwrap();
        assert_eq!(stats.failed_transactions, 2);
        assert_eq!(stats.transactions, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters() -> Result<()> {
        const SUBMITTERS: usize = 8;
        const OPS: usize = 5;

        let td = TempDir::new(cap_std::ambient_authority())?;
        let (handle, worker, control) = new_test_scheduler(&td, 16);
        let worker = worker.spawn()?;
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..SUBMITTERS {
            let handle = handle.clone();
            let ops = records(i * OPS..(i + 1) * OPS, &log);
            tasks.spawn(async move {
                handle.submit(scheduled(&ops)).await?;
                // Every operation of this batch is complete once the wait returns
                for op in ops.iter() {
                    assert_eq!(op.state(), OperationState::Applied);
                    assert_eq!(op.lock().applied.load(Ordering::SeqCst), 1);
                }
                anyhow::Ok(ops)
            });
        }
        let mut all = Vec::new();
        while let Some(r) = tasks.join_next().await {
            all.extend(r??);
        }
        handle.shutdown();
        let stats = worker.join().unwrap();

        assert_eq!(all.len(), SUBMITTERS * OPS);
        assert!(all
            .iter()
            .all(|op| op.lock().applied.load(Ordering::SeqCst) == 1));
        let mut log = log.lock().unwrap().clone();
        // Operations of one batch are contiguous and in order
        for chunk in log.chunks(OPS) {
            let start = chunk[0];
            assert_eq!(start % OPS, 0);
            assert_eq!(chunk, (start..start + OPS).collect::<Vec<_>>());
        }
        log.sort_unstable();
        assert_eq!(log, (0..SUBMITTERS * OPS).collect::<Vec<_>>());
        assert_eq!(stats.operations, (SUBMITTERS * OPS) as u64);
        assert_eq!(
            control.published.load(Ordering::SeqCst),
            stats.transactions
        );
        Ok(())
    }
}
