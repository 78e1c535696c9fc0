//! Batched single-writer workers.
//!
//! An [`AsyncStore`] moves a [`SyncStore`] onto its own named thread and talks
//! to it over a command channel. Writes are queued and applied in one write
//! transaction once more than `max_pending_writes` are waiting or the first
//! queued write is `max_pending_delay_ms` old, whichever comes first. A read
//! first flushes everything queued before it, so it observes every earlier
//! write made through the same instance.
//!
//! A batch is all-or-nothing: if any write fails, the transaction is rolled
//! back and every write of the batch completes with
//! [`StoreError::BatchAborted`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{Result, StoreError};
use crate::sqlite_db::SqliteDb;

/// A store whose operations run synchronously on one connection.
pub trait SyncStore: Send + 'static {
    /// Name used for the worker thread and in logs.
    const NAME: &'static str;

    /// The store's connection, opened on first use.
    fn connection(&mut self) -> Result<&mut SqliteDb>;

    fn begin_write_transaction(&mut self) -> Result<()> {
        self.connection()?.begin_write_transaction()
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.connection()?.commit_transaction()
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        self.connection()?.rollback_transaction()
    }
}

/// Write batching limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A batch is flushed as soon as more writes than this are queued.
    pub max_pending_writes: usize,
    /// Longest time the first write of a batch waits before a flush.
    pub max_pending_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: 50,
            max_pending_delay_ms: 10,
        }
    }
}

impl BatchConfig {
    pub fn max_pending_delay(&self) -> Duration {
        Duration::from_millis(self.max_pending_delay_ms)
    }
}

/// Counters describing a worker's batches.
#[derive(Debug, Default)]
pub struct AsyncStoreStats {
    batches_committed: AtomicU64,
    batches_aborted: AtomicU64,
    writes_committed: AtomicU64,
}

impl AsyncStoreStats {
    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.load(Ordering::Relaxed)
    }

    pub fn batches_aborted(&self) -> u64 {
        self.batches_aborted.load(Ordering::Relaxed)
    }

    pub fn writes_committed(&self) -> u64 {
        self.writes_committed.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion
// ─────────────────────────────────────────────────────────────────────────────

enum CompletionState<T> {
    Pending(oneshot::Receiver<Result<T>>),
    Failed(Option<StoreError>),
}

/// The one-shot result of an operation submitted to an [`AsyncStore`].
///
/// Resolves exactly once. If the worker goes away before answering, the
/// result is [`StoreError::Closed`].
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

impl<T> Completion<T> {
    fn pending(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: CompletionState::Pending(receiver),
        }
    }

    /// A completion that is already resolved with `err`.
    pub fn failed(err: StoreError) -> Self {
        Self {
            state: CompletionState::Failed(Some(err)),
        }
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_wait(self) -> Result<T> {
        match self.state {
            CompletionState::Pending(receiver) => receiver.blocking_recv().unwrap_or(Err(StoreError::Closed)),
            CompletionState::Failed(err) => Err(err.unwrap_or(StoreError::Closed)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            CompletionState::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(StoreError::Closed))),
            CompletionState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(StoreError::Closed))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AsyncStore
// ─────────────────────────────────────────────────────────────────────────────

type WriteOp<S> = Box<dyn FnOnce(&mut S) -> Result<()> + Send>;
type ReadOp<S> = Box<dyn FnOnce(&mut S) + Send>;
type Ack = oneshot::Sender<Result<()>>;

enum Command<S> {
    Write { op: WriteOp<S>, done: Ack },
    Read(ReadOp<S>),
    Flush(Ack),
    Close(Ack),
}

/// Handle to a store running on its own worker thread. Cheap to clone.
pub struct AsyncStore<S: SyncStore> {
    sender: mpsc::Sender<Command<S>>,
    stats: Arc<AsyncStoreStats>,
}

impl<S: SyncStore> Clone for AsyncStore<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: SyncStore> AsyncStore<S> {
    /// Move `store` onto a new worker thread.
    pub fn spawn(store: S, config: BatchConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let stats = Arc::new(AsyncStoreStats::default());
        let worker = Worker {
            store,
            receiver,
            config,
            pending: Vec::new(),
            deadline: None,
            stats: Arc::clone(&stats),
        };
        thread::Builder::new()
            .name(format!("{}-db", S::NAME))
            .spawn(move || worker.run())?;
        tracing::debug!(store = S::NAME, ?config, "store worker spawned");
        Ok(Self { sender, stats })
    }

    /// Queue a write. Completes once the batch holding it commits.
    pub fn write<F>(&self, op: F) -> Completion<()>
    where
        F: FnOnce(&mut S) -> Result<()> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        match self.sender.send(Command::Write {
            op: Box::new(op),
            done,
        }) {
            Ok(()) => Completion::pending(receiver),
            Err(_) => Completion::failed(StoreError::Closed),
        }
    }

    /// Run a read after flushing every write queued before it.
    ///
    /// Also used for range deletes, which run immediately after the flush.
    pub fn read<T, F>(&self, op: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        let command = Command::Read(Box::new(move |store: &mut S| {
            let _ = done.send(op(store));
        }));
        match self.sender.send(command) {
            Ok(()) => Completion::pending(receiver),
            Err(_) => Completion::failed(StoreError::Closed),
        }
    }

    /// Commit everything queued so far.
    pub fn force_flush(&self) -> Completion<()> {
        self.control(Command::Flush)
    }

    /// Flush, release the connection and stop the worker.
    pub fn close(&self) -> Completion<()> {
        self.control(Command::Close)
    }

    fn control(&self, make: fn(Ack) -> Command<S>) -> Completion<()> {
        let (done, receiver) = oneshot::channel();
        match self.sender.send(make(done)) {
            Ok(()) => Completion::pending(receiver),
            Err(_) => Completion::failed(StoreError::Closed),
        }
    }

    pub fn stats(&self) -> &AsyncStoreStats {
        &self.stats
    }
}

struct PendingWrite<S> {
    op: WriteOp<S>,
    done: Ack,
}

struct Worker<S: SyncStore> {
    store: S,
    receiver: mpsc::Receiver<Command<S>>,
    config: BatchConfig,
    pending: Vec<PendingWrite<S>>,
    deadline: Option<Instant>,
    stats: Arc<AsyncStoreStats>,
}

impl<S: SyncStore> Worker<S> {
    fn run(mut self) {
        let close_ack = loop {
            let command = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let _ = self.flush();
                        continue;
                    }
                    match self.receiver.recv_timeout(deadline - now) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            let _ = self.flush();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break None,
                    }
                }
                None => match self.receiver.recv() {
                    Ok(command) => command,
                    Err(_) => break None,
                },
            };

            match command {
                Command::Write { op, done } => {
                    self.pending.push(PendingWrite { op, done });
                    if self.pending.len() > self.config.max_pending_writes {
                        let _ = self.flush();
                    } else if self.deadline.is_none() {
                        self.deadline = Some(Instant::now() + self.config.max_pending_delay());
                    }
                }
                Command::Read(op) => {
                    let _ = self.flush();
                    op(&mut self.store);
                }
                Command::Flush(done) => {
                    let result = self.flush();
                    let _ = done.send(result);
                }
                Command::Close(done) => break Some(done),
            }
        };

        if let Err(err) = self.flush() {
            tracing::warn!(store = S::NAME, error = %err, "final flush failed");
        }
        // Dropping the worker releases the store and its connection.
        drop(self);
        tracing::info!(store = S::NAME, "store worker stopped");
        if let Some(done) = close_ack {
            let _ = done.send(Ok(()));
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.deadline = None;
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        let mut acks = Vec::with_capacity(count);
        let mut ops = Vec::with_capacity(count);
        for PendingWrite { op, done } in batch {
            ops.push(op);
            acks.push(done);
        }

        match self.apply(ops) {
            Ok(()) => {
                self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .writes_committed
                    .fetch_add(count as u64, Ordering::Relaxed);
                tracing::trace!(store = S::NAME, writes = count, "batch committed");
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(store = S::NAME, writes = count, error = %err, "batch rolled back");
                if let Err(rollback_err) = self.store.rollback_transaction() {
                    tracing::error!(store = S::NAME, error = %rollback_err, "rollback failed");
                }
                self.stats.batches_aborted.fetch_add(1, Ordering::Relaxed);
                for ack in acks {
                    let _ = ack.send(Err(StoreError::BatchAborted(message.clone())));
                }
                Err(StoreError::BatchAborted(message))
            }
        }
    }

    fn apply(&mut self, ops: Vec<WriteOp<S>>) -> Result<()> {
        self.store.begin_write_transaction()?;
        for op in ops {
            op(&mut self.store)?;
        }
        self.store.commit_transaction()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Flush and shutdown hooks shared by every async store.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn force_flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<S: SyncStore> Lifecycle for AsyncStore<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    async fn force_flush(&self) -> Result<()> {
        AsyncStore::force_flush(self).await
    }

    async fn close(&self) -> Result<()> {
        AsyncStore::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerConnection;

    struct CounterStore {
        conn: WorkerConnection,
    }

    impl CounterStore {
        fn new() -> Self {
            let db = SqliteDb::open_in_memory().unwrap();
            db.exec("CREATE TABLE items (id INT8 PRIMARY KEY, value STRING)").unwrap();
            Self {
                conn: WorkerConnection::detached(db),
            }
        }

        fn insert(&mut self, id: i64) -> Result<()> {
            self.connection()?
                .execute("INSERT INTO items VALUES (?1, 'x')", [id])?;
            Ok(())
        }

        fn count(&mut self) -> Result<i64> {
            Ok(self
                .connection()?
                .query_row("SELECT count(*) FROM items", [], |r| r.get(0))?)
        }
    }

    impl SyncStore for CounterStore {
        const NAME: &'static str = "counter";

        fn connection(&mut self) -> Result<&mut SqliteDb> {
            self.conn.get()
        }
    }

    fn slow_config() -> BatchConfig {
        BatchConfig {
            max_pending_writes: 50,
            max_pending_delay_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let store = AsyncStore::spawn(CounterStore::new(), slow_config()).unwrap();
        let writes: Vec<_> = (0..10).map(|i| store.write(move |s| s.insert(i))).collect();

        // The delay is a minute, so only the read can have flushed these.
        let count = store.read(|s| s.count()).await.unwrap();
        assert_eq!(count, 10);
        for write in writes {
            write.await.unwrap();
        }
        assert_eq!(store.stats().batches_committed(), 1);
    }

    #[tokio::test]
    async fn test_sixty_writes_two_batches() {
        let store = AsyncStore::spawn(CounterStore::new(), BatchConfig::default()).unwrap();
        let writes: Vec<_> = (0..60).map(|i| store.write(move |s| s.insert(i))).collect();
        for write in writes {
            write.await.unwrap();
        }

        let batches = store.stats().batches_committed();
        assert!((1..=2).contains(&batches), "got {} batches", batches);
        assert_eq!(store.stats().writes_committed(), 60);
        assert_eq!(store.read(|s| s.count()).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_threshold_flushes_without_timer() {
        let store = AsyncStore::spawn(CounterStore::new(), slow_config()).unwrap();
        let writes: Vec<_> = (0..51).map(|i| store.write(move |s| s.insert(i))).collect();
        // The 51st write exceeds the threshold and flushes the batch.
        for write in writes {
            write.await.unwrap();
        }
        assert_eq!(store.stats().batches_committed(), 1);
    }

    #[tokio::test]
    async fn test_timer_flushes_small_batch() {
        let store = AsyncStore::spawn(CounterStore::new(), BatchConfig::default()).unwrap();
        store.write(|s| s.insert(1)).await.unwrap();
        assert_eq!(store.stats().batches_committed(), 1);
    }

    #[tokio::test]
    async fn test_failing_write_aborts_whole_batch() {
        let store = AsyncStore::spawn(CounterStore::new(), slow_config()).unwrap();
        let first = store.write(|s| s.insert(1));
        // Duplicate primary key.
        let second = store.write(|s| s.insert(1));
        let third = store.write(|s| s.insert(2));

        let flushed = store.force_flush().await;
        assert!(matches!(flushed, Err(StoreError::BatchAborted(_))));
        for write in [first, second, third] {
            assert!(matches!(write.await, Err(StoreError::BatchAborted(_))));
        }
        assert_eq!(store.read(|s| s.count()).await.unwrap(), 0);
        assert_eq!(store.stats().batches_aborted(), 1);

        // The worker keeps serving after an aborted batch.
        store.write(|s| s.insert(3)).await.unwrap();
        assert_eq!(store.read(|s| s.count()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_later_calls() {
        let store = AsyncStore::spawn(CounterStore::new(), slow_config()).unwrap();
        let write = store.write(|s| s.insert(1));
        store.close().await.unwrap();
        write.await.unwrap();

        assert!(matches!(store.read(|s| s.count()).await, Err(StoreError::Closed)));
        assert!(matches!(store.write(|s| s.insert(2)).await, Err(StoreError::Closed)));
        assert!(matches!(store.close().await, Err(StoreError::Closed)));
    }

    #[test]
    fn test_blocking_wait_outside_runtime() {
        let store = AsyncStore::spawn(CounterStore::new(), BatchConfig::default()).unwrap();
        store.write(|s| s.insert(5)).blocking_wait().unwrap();
        assert_eq!(store.read(|s| s.count()).blocking_wait().unwrap(), 1);
    }

    #[test]
    fn test_batch_config_serde_defaults() {
        let config: BatchConfig = serde_json::from_str("{\"max_pending_writes\": 7}").unwrap();
        assert_eq!(config.max_pending_writes, 7);
        assert_eq!(config.max_pending_delay_ms, 10);
    }
}
