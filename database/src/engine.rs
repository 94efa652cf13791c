use core::time::Duration;
use std::{sync::Arc, time::Instant};

use anyhow::{bail, ensure, Result};
use async_channel::{Receiver, Sender};
use enum_map::EnumMap;
use futures::StreamExt as _;
use log::{debug, error, info};
use thiserror::Error;
use tokio::{select, task::JoinHandle, time::interval_at};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use types::models::{Model, ModelType};

use crate::{
    pool::{Connection, ConnectionPool},
    statements::{Statement, StatementTable},
};

#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

/// Statistics of a single worker's batcher.
#[derive(Clone, Default, Debug)]
pub struct WorkerReport {
    pub flushes: usize,
    pub rows: usize,
    pub failed_batches: usize,
    pub failed_rows: usize,
    /// Models that could not be turned into statements.
    pub rejected_models: usize,
    pub persist_time: Duration,
    pub rows_by_type: EnumMap<ModelType, usize>,
}

#[derive(Clone, Default, Debug)]
pub struct PersistenceReport {
    pub workers: Vec<WorkerReport>,
}

impl PersistenceReport {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.workers.iter().map(|worker| worker.rows).sum()
    }

    #[must_use]
    pub fn failed_batches(&self) -> usize {
        self.workers.iter().map(|worker| worker.failed_batches).sum()
    }

    #[must_use]
    pub fn failed_rows(&self) -> usize {
        self.workers
            .iter()
            .map(|worker| worker.failed_rows + worker.rejected_models)
            .sum()
    }

    pub fn log(&self) {
        for (id, worker) in self.workers.iter().enumerate() {
            info!(
                "persistence worker {id}: {} rows in {} flushes ({} failed batches) in {:?}",
                worker.rows, worker.flushes, worker.failed_batches, worker.persist_time,
            );
        }

        info!(
            "persisted {} rows in total, {} rows failed",
            self.rows(),
            self.failed_rows(),
        );
    }
}

/// Handle for enqueueing models. Cheap to clone.
///
/// Every worker owns a queue. A model goes to the queue picked by its
/// [`Model::ordering_key`], so a drop and the rows that replace it are written by the same worker
/// in the order they were persisted.
#[derive(Clone)]
pub struct Persister {
    queues: Arc<[Sender<Model>]>,
    cancellation: CancellationToken,
}

impl Persister {
    /// Waits for space in the queue if it is full.
    pub async fn persist(&self, model: Model) -> Result<()> {
        ensure!(!self.cancellation.is_cancelled(), Error::Cancelled);

        let Some(tx) = self.queues.get(self.route(model.ordering_key())) else {
            bail!(Error::Closed);
        };

        select! {
            () = self.cancellation.cancelled() => bail!(Error::Cancelled),
            result = tx.send(model) => result.map_err(|_| Error::Closed)?,
        }

        Ok(())
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues.iter().map(Sender::len).sum()
    }

    fn route(&self, key: u64) -> usize {
        let workers = u64::try_from(self.queues.len()).unwrap_or(u64::MAX);
        usize::try_from(key % workers).unwrap_or_default()
    }

    fn close(&self) {
        for tx in &*self.queues {
            tx.close();
        }
    }
}

/// A pool of workers draining bounded queues of [`Model`]s into batches.
///
/// A worker flushes its batch once it holds `batch_size` statements, or when the flush timer fires
/// while its queue is empty. Cancelling the token makes workers stop waiting for new models,
/// persist whatever is already queued and exit.
pub struct PersistenceEngine<P: ConnectionPool> {
    pool: P,
    persister: Persister,
    workers: Vec<JoinHandle<Result<(P::Connection, WorkerReport)>>>,
}

impl<P: ConnectionPool> PersistenceEngine<P> {
    /// `queue_capacity` is shared evenly between the workers.
    pub fn start(pool: P, options: Options, cancellation: CancellationToken) -> Result<Self> {
        let Options {
            workers,
            batch_size,
            flush_interval,
            queue_capacity,
        } = options;

        ensure!(workers > 0, Error::ZeroWorkers);
        ensure!(batch_size > 0, Error::ZeroBatchSize);
        ensure!(queue_capacity > 0, Error::ZeroQueueCapacity);

        let capacity = queue_capacity.div_ceil(workers);
        let table = Arc::new(StatementTable::default());
        let mut queues = Vec::with_capacity(workers);

        let workers = (0..workers)
            .map(|id| {
                let (tx, rx) = async_channel::bounded(capacity);

                queues.push(tx);

                let worker = Worker {
                    id,
                    connection: Some(pool.connect()?),
                    batch: Vec::with_capacity(batch_size),
                    batch_size,
                    table: Arc::clone(&table),
                    report: WorkerReport::default(),
                };

                Ok(tokio::spawn(worker.run(
                    rx,
                    flush_interval,
                    cancellation.clone(),
                )))
            })
            .collect::<Result<_>>()?;

        info!("started {} persistence workers", options.workers);

        Ok(Self {
            pool,
            persister: Persister {
                queues: queues.into(),
                cancellation,
            },
            workers,
        })
    }

    #[must_use]
    pub fn persister(&self) -> Persister {
        self.persister.clone()
    }

    /// Stops accepting models, waits for every worker to persist what is queued and closes the pool.
    pub async fn finish(self) -> Result<PersistenceReport> {
        let Self {
            pool,
            persister,
            workers,
        } = self;

        persister.close();

        let mut connections = Vec::with_capacity(workers.len());
        let mut report = PersistenceReport::default();

        for handle in workers {
            let (connection, worker_report) = handle.await??;
            connections.push(connection);
            report.workers.push(worker_report);
        }

        pool.close(connections)?;

        Ok(report)
    }
}

struct Worker<C> {
    id: usize,
    // Only `None` while a flush is running on a blocking thread.
    connection: Option<C>,
    batch: Vec<Statement>,
    batch_size: usize,
    table: Arc<StatementTable>,
    report: WorkerReport,
}

impl<C: Connection> Worker<C> {
    async fn run(
        mut self,
        rx: Receiver<Model>,
        flush_interval: Duration,
        cancellation: CancellationToken,
    ) -> Result<(C, WorkerReport)> {
        let first_tick = tokio::time::Instant::now() + flush_interval;
        let mut flush_timer = IntervalStream::new(interval_at(first_tick, flush_interval)).fuse();

        loop {
            select! {
                biased;

                () = cancellation.cancelled() => {
                    debug!("persistence worker {} cancelled", self.id);
                    rx.close();
                    break;
                }

                model = rx.recv() => match model {
                    Ok(model) => self.push(&model).await?,
                    Err(_) => break,
                },

                _ = flush_timer.select_next_some() => {
                    if !self.batch.is_empty() && rx.is_empty() {
                        self.flush().await?;
                    }
                }
            }
        }

        while let Ok(model) = rx.try_recv() {
            self.push(&model).await?;
        }

        if !self.batch.is_empty() {
            self.flush().await?;
        }

        debug!("persistence worker {} finished", self.id);

        let Some(connection) = self.connection else {
            bail!(Error::ConnectionLost { worker: self.id });
        };

        Ok((connection, self.report))
    }

    async fn push(&mut self, model: &Model) -> Result<()> {
        match self.table.build(model) {
            Ok(statement) => self.batch.push(statement),
            Err(error) => {
                error!(
                    "persistence worker {} rejected {} model: {error:?}",
                    self.id,
                    model.model_type(),
                );

                self.report.rejected_models += 1;
            }
        }

        if self.batch.len() >= self.batch_size {
            self.flush().await?;
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            bail!(Error::ConnectionLost { worker: self.id });
        };

        let batch = core::mem::take(&mut self.batch);
        let rows = batch.len();
        let start = Instant::now();

        let (connection, batch, result) = tokio::task::spawn_blocking(move || {
            let result = connection.execute_batch(&batch);
            (connection, batch, result)
        })
        .await?;

        let elapsed = start.elapsed();

        self.connection = Some(connection);
        self.report.flushes += 1;
        self.report.persist_time += elapsed;

        match result {
            Ok(()) => {
                self.report.rows += rows;

                for statement in &batch {
                    self.report.rows_by_type[statement.model_type] += 1;
                }

                debug!("persistence worker {} wrote {rows} rows in {elapsed:?}", self.id);
            }
            Err(error) => {
                self.report.failed_batches += 1;
                self.report.failed_rows += rows;

                error!(
                    "persistence worker {} failed to write batch of {rows} rows: {error:?}",
                    self.id,
                );
            }
        }

        self.batch = batch;
        self.batch.clear();

        Ok(())
    }
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("persistence engine needs at least one worker")]
    ZeroWorkers,
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("queue capacity must be positive")]
    ZeroQueueCapacity,
    #[error("persistence queue is closed")]
    Closed,
    #[error("persistence was cancelled")]
    Cancelled,
    #[error("persistence worker {worker} lost its connection")]
    ConnectionLost { worker: usize },
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use parking_lot::Mutex;
    use rusqlite::types::Value;
    use tempfile::TempDir;
    use tokio::time::sleep;
    use types::{
        containers::{NormalizedBlock, Withdrawal},
        models::{BlockRecord, WithdrawalRecord},
        primitives::H160,
    };

    use crate::sqlite::SqlitePool;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingPool {
        flushes: Arc<Mutex<Vec<usize>>>,
        closed: Arc<Mutex<Option<usize>>>,
    }

    struct RecordingConnection {
        flushes: Arc<Mutex<Vec<usize>>>,
    }

    impl Connection for RecordingConnection {
        fn execute_batch(&mut self, statements: &[Statement]) -> Result<()> {
            self.flushes.lock().push(statements.len());
            Ok(())
        }
    }

    impl ConnectionPool for RecordingPool {
        type Connection = RecordingConnection;

        fn connect(&self) -> Result<Self::Connection> {
            Ok(RecordingConnection {
                flushes: Arc::clone(&self.flushes),
            })
        }

        fn close(&self, connections: Vec<Self::Connection>) -> Result<()> {
            *self.closed.lock() = Some(connections.len());
            Ok(())
        }
    }

    fn options(batch_size: usize, flush_interval: Duration) -> Options {
        Options {
            workers: 1,
            batch_size,
            flush_interval,
            queue_capacity: 16,
        }
    }

    fn withdrawal(slot: u64, index: u64) -> Model {
        Model::Withdrawal(WithdrawalRecord {
            slot,
            withdrawal: Withdrawal {
                index,
                validator_index: index,
                address: H160::repeat_byte(1),
                amount: 1_000,
            },
        })
    }

    #[tokio::test]
    async fn flushes_full_batches_and_remainder() -> Result<()> {
        let pool = RecordingPool::default();
        let engine = PersistenceEngine::start(
            pool.clone(),
            options(4, Duration::from_secs(3600)),
            CancellationToken::new(),
        )?;

        let persister = engine.persister();

        for index in 0..10 {
            persister.persist(withdrawal(1, index)).await?;
        }

        let report = engine.finish().await?;

        // ceil(10 / 4) batches.
        assert_eq!(*pool.flushes.lock(), [4, 4, 2]);
        assert_eq!(*pool.closed.lock(), Some(1));
        assert_eq!(report.rows(), 10);
        assert_eq!(report.workers[0].flushes, 3);
        assert_eq!(report.workers[0].rows_by_type[ModelType::Withdrawal], 10);

        Ok(())
    }

    #[tokio::test]
    async fn timer_flushes_idle_partial_batch_once() -> Result<()> {
        let pool = RecordingPool::default();
        let engine = PersistenceEngine::start(
            pool.clone(),
            options(1000, Duration::from_millis(50)),
            CancellationToken::new(),
        )?;

        engine.persister().persist(withdrawal(1, 0)).await?;

        sleep(Duration::from_millis(300)).await;

        assert_eq!(*pool.flushes.lock(), [1]);

        engine.finish().await?;

        assert_eq!(*pool.flushes.lock(), [1]);

        Ok(())
    }

    #[tokio::test]
    async fn cancellation_drains_queue_and_rejects_new_models() -> Result<()> {
        let pool = RecordingPool::default();
        let cancellation = CancellationToken::new();
        let engine = PersistenceEngine::start(
            pool.clone(),
            options(1000, Duration::from_secs(3600)),
            cancellation.clone(),
        )?;

        let persister = engine.persister();

        persister.persist(withdrawal(1, 0)).await?;
        persister.persist(withdrawal(1, 1)).await?;

        cancellation.cancel();

        let error = persister
            .persist(withdrawal(1, 2))
            .await
            .expect_err("persisting after cancellation should fail")
            .downcast::<Error>()?;

        assert_eq!(error, Error::Cancelled);

        let report = engine.finish().await?;

        assert_eq!(report.rows(), 2);
        assert_eq!(pool.flushes.lock().iter().sum::<usize>(), 2);

        Ok(())
    }

    #[derive(Clone, Default)]
    struct SlowDropPool {
        blocks: Arc<Mutex<BTreeSet<i64>>>,
    }

    struct SlowDropConnection {
        blocks: Arc<Mutex<BTreeSet<i64>>>,
    }

    impl Connection for SlowDropConnection {
        fn execute_batch(&mut self, statements: &[Statement]) -> Result<()> {
            for statement in statements {
                let Some(Value::Integer(slot)) = statement.arguments.first() else {
                    continue;
                };

                match statement.model_type {
                    ModelType::Block => {
                        self.blocks.lock().insert(*slot);
                    }
                    ModelType::BlockDrop => {
                        std::thread::sleep(Duration::from_millis(200));
                        self.blocks.lock().remove(slot);
                    }
                    _ => {}
                }
            }

            Ok(())
        }
    }

    impl ConnectionPool for SlowDropPool {
        type Connection = SlowDropConnection;

        fn connect(&self) -> Result<Self::Connection> {
            Ok(SlowDropConnection {
                blocks: Arc::clone(&self.blocks),
            })
        }

        fn close(&self, _connections: Vec<Self::Connection>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn reinserted_block_survives_slow_drop_with_many_workers() -> Result<()> {
        let pool = SlowDropPool::default();

        pool.blocks.lock().insert(40);

        let engine = PersistenceEngine::start(
            pool.clone(),
            Options {
                workers: 2,
                ..options(1, Duration::from_secs(3600))
            },
            CancellationToken::new(),
        )?;

        let persister = engine.persister();

        persister.persist(Model::BlockDrop(40)).await?;
        persister.persist(block(40, 2)).await?;
        persister.persist(block(41, 1)).await?;

        let report = engine.finish().await?;

        assert_eq!(*pool.blocks.lock(), BTreeSet::from([40, 41]));
        assert_eq!(report.workers[0].rows_by_type[ModelType::BlockDrop], 1);
        assert_eq!(report.workers[0].rows_by_type[ModelType::Block], 1);
        assert_eq!(report.workers[1].rows_by_type[ModelType::Block], 1);

        Ok(())
    }

    #[tokio::test]
    async fn queued_counts_every_worker_queue() -> Result<()> {
        let pool = SlowDropPool::default();
        let engine = PersistenceEngine::start(
            pool,
            Options {
                workers: 2,
                ..options(1, Duration::from_secs(3600))
            },
            CancellationToken::new(),
        )?;

        let persister = engine.persister();

        // The first drop of each worker is taken off its queue and blocks the worker.
        for slot in 0..6 {
            persister.persist(Model::BlockDrop(slot)).await?;
        }

        sleep(Duration::from_millis(50)).await;

        assert_eq!(persister.queued(), 4);

        engine.finish().await?;

        Ok(())
    }

    #[test]
    fn zero_workers_are_rejected() -> Result<()> {
        let result = PersistenceEngine::start(
            RecordingPool::default(),
            Options {
                workers: 0,
                ..options(1, Duration::from_secs(1))
            },
            CancellationToken::new(),
        );

        let Err(error) = result else {
            panic!("zero workers should be rejected");
        };

        assert_eq!(error.downcast::<Error>()?, Error::ZeroWorkers);

        Ok(())
    }

    fn block(slot: u64, root: u8) -> Model {
        Model::Block(BlockRecord {
            epoch: slot / 32,
            timestamp: 1_606_824_023 + 12 * slot,
            block: NormalizedBlock {
                root: types::primitives::H256::repeat_byte(root),
                proposed: true,
                ..NormalizedBlock::missed(slot)
            },
            rewards: None,
        })
    }

    fn epoch_models() -> Vec<Model> {
        (64..96)
            .flat_map(|slot| [block(slot, 1), withdrawal(slot, slot)])
            .collect()
    }

    fn reprocessing_models() -> Vec<Model> {
        (64..96)
            .flat_map(|slot| [Model::BlockDrop(slot), Model::WithdrawalDrop(slot)])
            .chain(epoch_models())
            .collect()
    }

    async fn persist_all(path: &std::path::Path, models: Vec<Model>) -> Result<()> {
        let engine = PersistenceEngine::start(
            SqlitePool::open(path)?,
            Options {
                workers: 2,
                batch_size: 7,
                flush_interval: Duration::from_secs(3600),
                queue_capacity: 8,
            },
            CancellationToken::new(),
        )?;

        let persister = engine.persister();

        for model in models {
            persister.persist(model).await?;
        }

        let report = engine.finish().await?;

        assert_eq!(report.failed_batches(), 0);

        Ok(())
    }

    fn dump(path: &std::path::Path) -> Result<Vec<String>> {
        let connection = rusqlite::Connection::open(path)?;
        let mut rows = vec![];

        for table in ["t_block_metrics", "t_withdrawals"] {
            let mut statement = connection.prepare(&format!("SELECT * FROM {table} ORDER BY 1, 2"))?;
            let column_count = statement.column_count();

            let mut query = statement.query([])?;

            while let Some(row) = query.next()? {
                let values = (0..column_count)
                    .map(|index| row.get::<_, rusqlite::types::Value>(index))
                    .collect::<Result<Vec<_>, _>>()?;

                rows.push(format!("{table}: {values:?}"));
            }
        }

        Ok(rows)
    }

    #[tokio::test]
    async fn reprocessing_epoch_is_idempotent() -> Result<()> {
        let once = TempDir::new()?;
        let twice = TempDir::new()?;
        let once_path = once.path().join("analyzer.sqlite");
        let twice_path = twice.path().join("analyzer.sqlite");

        persist_all(&once_path, epoch_models()).await?;
        persist_all(&twice_path, epoch_models()).await?;
        persist_all(&twice_path, reprocessing_models()).await?;

        let expected = dump(&once_path)?;

        assert_eq!(expected.len(), 64);
        assert_eq!(dump(&twice_path)?, expected);

        Ok(())
    }
}
