use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use fieldx::fxstruct;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::DbError;
use crate::error::PoolError;
use crate::queue::TaskQueue;
use crate::task::Task;
use crate::traits::Connector;
use crate::worker::Worker;

/// Self-scaling set of database workers sharing one [`TaskQueue`].
///
/// The pool starts with a single worker. A monitor thread watches the queue: whenever the backlog exceeds the
/// contention threshold another worker is launched, up to `max_workers`; once the queue runs dry the pool shrinks back
/// to one worker.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use idcache::prelude::*;
/// let pool = Pool::builder()
///     .connector(Arc::new(MemoryDatabase::default()))
///     .config(&PoolConfig::default())
///     .build()?;
/// pool.start()?;
/// let (task, signal) = Task::select("groups", Query::all());
/// pool.queue(task);
/// let groups = signal.outcome()?;
/// pool.stop();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[fxstruct(
    sync,
    rc,
    no_new,
    default(off),
    builder(
        post_build,
        opt_in,
        doc("Builder object of [`Pool`]."),
        method_doc("Implement builder pattern for [`Pool`].")
    )
)]
pub struct Pool {
    #[fieldx(get(clone), builder(required))]
    connector:            Arc<dyn Connector>,
    /// Never less than one.
    #[fieldx(get(copy), builder, default(PoolConfig::default().max_workers()))]
    max_workers:          usize,
    #[fieldx(get(copy), builder, default(PoolConfig::default().contention_threshold()))]
    contention_threshold: usize,
    #[fieldx(get(copy), builder, default(PoolConfig::default().monitor_interval()))]
    monitor_interval:     Duration,
    queue:                Arc<TaskQueue>,
    // Most recently launched last.
    workers:              Mutex<Vec<Worker>>,
    #[fieldx(default(AtomicUsize::new(1)))]
    next_worker_id:       AtomicUsize,
    started:              AtomicBool,
    stopping:             AtomicBool,
    monitor:              Mutex<Option<JoinHandle<()>>>,
}

impl PoolBuilder {
    /// Take the limits from a configuration section.
    pub fn config(self, config: &PoolConfig) -> Self {
        self.max_workers(config.max_workers())
            .contention_threshold(config.contention_threshold())
            .monitor_interval(config.monitor_interval())
    }
}

impl Pool {
    fn post_build(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self
    }

    /// Submit a task. Never blocks.
    ///
    /// Once [`stop`](Self::stop) has been called the task is dropped instead, so whoever waits for its signal gets
    /// [`DbError::Abandoned`].
    pub fn queue(&self, task: Task) {
        if !self.started.load(Ordering::SeqCst) {
            debug!("{task:?} queued before the pool was started");
        }
        if let Err(task) = self.queue.push(task) {
            warn!("{task:?} refused: the pool is stopped");
        }
    }

    /// Does the pool still take tasks?
    #[inline]
    pub fn accepts_tasks(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Launch the first worker and the monitor. Fails if the database cannot be reached at all.
    #[instrument(level = "debug", skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        if let Err(err) = self.launch_worker() {
            self.started.store(false, Ordering::SeqCst);
            return Err(PoolError::NoWorkers(err));
        }

        let pool = self.clone();
        let monitor = thread::Builder::new()
            .name("db-pool-monitor".into())
            .spawn(move || pool.monitor());
        match monitor {
            Ok(handle) => {
                *self.monitor.lock() = Some(handle);
            }
            Err(err) => {
                self.finalise();
                self.started.store(false, Ordering::SeqCst);
                return Err(PoolError::NoWorkers(DbError::connection(
                    self.connector.address(),
                    format!("cannot start pool monitor: {err}"),
                )));
            }
        }

        info!(
            "database pool started against {}, up to {} workers",
            self.connector.address(),
            self.max_workers
        );
        Ok(())
    }

    /// Refuse new tasks, stop the monitor, let the workers drain the queue, then stop them.
    #[instrument(level = "debug", skip(self))]
    pub fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) || self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        self.queue.wake_all();
        if let Some(monitor) = self.monitor.lock().take() {
            if monitor.join().is_err() {
                warn!("pool monitor terminated abnormally");
            }
        }
        self.finalise();
        info!("database pool stopped");
    }

    fn finalise(&self) {
        self.queue.wait_empty();
        loop {
            let Some(worker) = self.workers.lock().pop()
            else {
                break;
            };
            worker.stop();
        }
    }

    fn launch_worker(&self) -> Result<(), DbError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let worker = Worker::launch(id, self.connector.as_ref(), self.queue.clone())?;
        let count = {
            let mut workers = self.workers.lock();
            workers.push(worker);
            workers.len()
        };
        debug!("pool grew to {count} workers");
        Ok(())
    }

    fn shrink(&self) {
        loop {
            let worker = {
                let mut workers = self.workers.lock();
                if workers.len() <= 1 {
                    break;
                }
                workers.pop()
            };
            if let Some(worker) = worker {
                worker.stop();
            }
        }
    }

    fn monitor(self: Arc<Self>) {
        debug!("pool monitor started");
        let mut size = 0;
        while !self.stopping.load(Ordering::SeqCst) {
            size = self.queue.wait_changed(size, self.monitor_interval, &self.stopping);
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            if size == 0 {
                if self.worker_count() > 1 {
                    self.shrink();
                    debug!("queue drained, pool is down to one worker");
                }
            }
            else if size > self.contention_threshold && self.worker_count() < self.max_workers {
                if let Err(err) = self.launch_worker() {
                    warn!("failed to add a worker with {size} tasks queued: {err}");
                }
            }
        }
        debug!("pool monitor exited");
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }
}

impl Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.connector.address())
            .field("workers", &self.worker_count())
            .field("max_workers", &self.max_workers)
            .field("queued", &self.queue_len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use crate::doc;
    use crate::document::Query;
    use crate::signal::WaitTimeout;
    use std::time::Instant;

    fn pool_for(db: &MemoryDatabase, max_workers: usize) -> Arc<Pool> {
        Pool::builder()
            .connector(Arc::new(db.clone()))
            .max_workers(max_workers)
            .contention_threshold(2)
            .monitor_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn builder_takes_the_config() {
        let db = MemoryDatabase::default();
        let config = PoolConfig::builder()
            .max_workers(0)
            .contention_threshold(7)
            .monitor_interval_ms(30)
            .build()
            .unwrap();
        let pool = Pool::builder()
            .connector(Arc::new(db))
            .config(&config)
            .build()
            .unwrap();
        assert_eq!(pool.max_workers(), 1);
        assert_eq!(pool.contention_threshold(), 7);
        assert_eq!(pool.monitor_interval(), Duration::from_millis(30));
        assert_eq!(pool.connector().address(), "memory://localhost");

        assert!(Pool::builder().max_workers(2).build().is_err());
    }

    #[test]
    fn start_twice_fails() {
        let db = MemoryDatabase::default();
        let pool = pool_for(&db, 2);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn start_without_database() {
        let db = MemoryDatabase::default();
        db.set_online(false);
        let pool = pool_for(&db, 2);
        assert!(matches!(pool.start(), Err(PoolError::NoWorkers(_))));
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn scales_within_bounds() {
        let db = MemoryDatabase::default();
        db.set_latency(Duration::from_millis(5));
        let pool = pool_for(&db, 3);
        pool.start().unwrap();
        assert_eq!(pool.worker_count(), 1);

        let mut peak = 0;
        for n in 0..200 {
            pool.queue(Task::insert("t", doc!({ "n": n })));
        }
        wait_for("the pool to grow", || {
            peak = peak.max(pool.worker_count());
            peak > 1
        });
        wait_for("the queue to drain", || {
            let count = pool.worker_count();
            assert!((1..=3).contains(&count));
            pool.queue_len() == 0
        });
        wait_for("the pool to shrink", || pool.worker_count() == 1);
        assert_eq!(db.open_connections(), 1);

        pool.stop();
        assert_eq!(db.documents("t").len(), 200);
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn stop_drains_the_queue() {
        let db = MemoryDatabase::default();
        db.set_latency(Duration::from_millis(1));
        let pool = pool_for(&db, 2);
        pool.start().unwrap();
        for n in 0..50 {
            pool.queue(Task::insert("t", doc!({ "n": n })));
        }
        let (task, signal) = Task::select("t", Query::all());
        pool.queue(task);
        pool.stop();

        assert_eq!(db.documents("t").len(), 50);
        assert!(signal.is_ready());
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn tasks_after_stop_are_abandoned() {
        let db = MemoryDatabase::default();
        let pool = pool_for(&db, 2);
        pool.start().unwrap();
        assert!(pool.accepts_tasks());
        pool.stop();
        assert!(!pool.accepts_tasks());

        let (task, signal) = Task::select("t", Query::all());
        pool.queue(task);
        assert!(matches!(
            signal.wait_timeout(Duration::from_secs(2)),
            Err(WaitTimeout::Abandoned)
        ));
        pool.queue(Task::insert("t", doc!({"n": 1})));
        assert!(db.documents("t").is_empty());
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn stop_does_not_wait_for_the_monitor_interval() {
        let db = MemoryDatabase::default();
        let pool = Pool::builder()
            .connector(Arc::new(db))
            .monitor_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        pool.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(5), "stop took {:?}", started.elapsed());
    }
}
