use std::any::Any;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::error;

use crate::error::DbError;
use crate::queue::TaskQueue;
use crate::traits::Connection;
use crate::traits::Connector;

/// A thread draining the task queue over its own database connection.
#[derive(Debug)]
pub struct Worker {
    id:     usize,
    cancel: Arc<AtomicBool>,
    queue:  Arc<TaskQueue>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Connect on the calling thread, then start the worker thread. A connection failure is returned as is and no
    /// thread is started.
    pub fn launch(id: usize, connector: &dyn Connector, queue: Arc<TaskQueue>) -> Result<Self, DbError> {
        let conn = connector.connect()?;
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancel = cancel.clone();
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("db-worker-{id}"))
                .spawn(move || run(id, conn, &queue, &cancel))
                .map_err(|err| DbError::connection(connector.address(), format!("cannot start worker thread: {err}")))?
        };

        debug!("database worker {id} launched");
        Ok(Self {
            id,
            cancel,
            queue,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Ask the worker to exit after its current task and wait for it. Its connection is closed on exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take()
        else {
            return;
        };
        self.cancel.store(true, Ordering::SeqCst);
        self.queue.wake_all();
        if handle.join().is_err() {
            error!("database worker {} terminated abnormally", self.id);
        }
        debug!("database worker {} stopped", self.id);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(id: usize, mut conn: Box<dyn Connection>, queue: &TaskQueue, cancel: &AtomicBool) {
    while !cancel.load(Ordering::SeqCst) {
        let Some(task) = queue.pop_or_cancel(cancel)
        else {
            break;
        };

        let kind = task.kind();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task.execute(conn.as_mut()))) {
            error!(worker = id, "{kind} task panicked: {}", panic_message(&*panic));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    }
    else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    }
    else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use crate::doc;
    use crate::document::Query;
    use crate::task::Task;
    use std::time::Duration;

    #[test]
    fn executes_in_order_and_survives_failures() {
        let db = MemoryDatabase::default();
        let queue = Arc::new(TaskQueue::new());
        let worker = Worker::launch(1, &db, queue.clone()).unwrap();
        assert_eq!(db.open_connections(), 1);

        queue.push(Task::function(|_| panic!("boom"))).unwrap();
        let (bad, bad_signal) = Task::run_command(doc!({"nope": 1}));
        queue.push(bad).unwrap();
        for n in 0..10 {
            queue.push(Task::insert("t", doc!({ "n": n }))).unwrap();
        }
        let (select, signal) = Task::select("t", Query::all());
        queue.push(select).unwrap();

        assert!(bad_signal.outcome().is_err());
        let ns: Vec<_> = signal
            .outcome()
            .unwrap()
            .iter()
            .map(|d| d["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (0..10).collect::<Vec<_>>());

        worker.stop();
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn refuses_to_launch_offline() {
        let db = MemoryDatabase::default();
        db.set_online(false);
        let err = Worker::launch(1, &db, Arc::new(TaskQueue::new())).unwrap_err();
        assert!(err.is_connection());
        assert_eq!(db.open_connections(), 0);
    }

    #[test]
    fn stop_finishes_current_task() {
        let db = MemoryDatabase::default();
        db.set_latency(Duration::from_millis(50));
        let queue = Arc::new(TaskQueue::new());
        let worker = Worker::launch(1, &db, queue.clone()).unwrap();

        let (task, signal) = Task::select("t", Query::all());
        queue.push(task).unwrap();
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert_eq!(signal.outcome(), Ok(vec![]));
    }
}
