use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::task::Task;

/// Unbounded blocking FIFO of [`Task`]s shared by the pool's workers.
///
/// Two conditions hang off the same mutex: `new_task` wakes one worker per push, `changed` wakes everyone interested
/// in the queue size, which is the pool monitor and anybody draining the queue.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks:    Mutex<Tasks>,
    new_task: Condvar,
    changed:  Condvar,
}

#[derive(Debug, Default)]
struct Tasks {
    queued: VecDeque<Task>,
    closed: bool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task. A closed queue hands the task back.
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut tasks = self.tasks.lock();
        if tasks.closed {
            return Err(task);
        }
        tasks.queued.push_back(task);
        self.new_task.notify_one();
        self.changed.notify_all();
        Ok(())
    }

    /// Refuse further pushes. Tasks already queued stay there to be taken.
    pub fn close(&self) {
        self.tasks.lock().closed = true;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tasks.lock().closed
    }

    /// Block until a task is available and take the oldest one.
    pub fn pop(&self) -> Task {
        let mut tasks = self.tasks.lock();
        loop {
            if let Some(task) = tasks.queued.pop_front() {
                self.changed.notify_all();
                return task;
            }
            self.new_task.wait(&mut tasks);
        }
    }

    /// Like [`pop`](Self::pop), but gives up with `None` once `cancel` is raised and there is nothing to take.
    /// Whoever raises the flag must call [`wake_all`](Self::wake_all) afterwards.
    pub fn pop_or_cancel(&self, cancel: &AtomicBool) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        loop {
            if let Some(task) = tasks.queued.pop_front() {
                self.changed.notify_all();
                return Some(task);
            }
            if cancel.load(Ordering::SeqCst) {
                return None;
            }
            self.new_task.wait(&mut tasks);
        }
    }

    /// Wake every thread blocked in [`pop_or_cancel`](Self::pop_or_cancel) or [`wait_changed`](Self::wait_changed) so
    /// it can re-check its flag.
    pub fn wake_all(&self) {
        // Taking the lock orders the wakeup after any flag store made before this call.
        let _tasks = self.tasks.lock();
        self.new_task.notify_all();
        self.changed.notify_all();
    }

    /// Block until the size differs from `last_known`, `timeout` expires or `cancel` is raised; returns the current
    /// size. As with [`pop_or_cancel`](Self::pop_or_cancel), raising the flag must be followed by
    /// [`wake_all`](Self::wake_all).
    pub fn wait_changed(&self, last_known: usize, timeout: Duration, cancel: &AtomicBool) -> usize {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while tasks.queued.len() == last_known && !cancel.load(Ordering::SeqCst) {
            if self.changed.wait_until(&mut tasks, deadline).timed_out() {
                break;
            }
        }
        tasks.queued.len()
    }

    /// Block until every queued task has been taken by a worker.
    pub fn wait_empty(&self) {
        let mut tasks = self.tasks.lock();
        while !tasks.queued.is_empty() {
            self.changed.wait(&mut tasks);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.lock().queued.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use std::sync::Arc;
    use std::thread;

    fn marker(n: i64) -> Task {
        Task::insert("q", doc!({ "n": n }))
    }

    fn n_of(task: Task) -> i64 {
        match task {
            Task::Insert { document, .. } => document["n"].as_i64().unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fifo() {
        let q = TaskQueue::new();
        for n in 0..5 {
            q.push(marker(n)).unwrap();
        }
        assert_eq!(q.len(), 5);
        let order: Vec<_> = (0..5).map(|_| n_of(q.pop())).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(TaskQueue::new());
        let popper = {
            let q = q.clone();
            thread::spawn(move || n_of(q.pop()))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(marker(9)).unwrap();
        assert_eq!(popper.join().unwrap(), 9);
    }

    #[test]
    fn cancel_prefers_queued_tasks() {
        let q = TaskQueue::new();
        let cancel = AtomicBool::new(true);
        q.push(marker(1)).unwrap();
        assert!(q.pop_or_cancel(&cancel).is_some());
        assert!(q.pop_or_cancel(&cancel).is_none());
    }

    #[test]
    fn cancel_wakes_waiter() {
        let q = Arc::new(TaskQueue::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (q, cancel) = (q.clone(), cancel.clone());
            thread::spawn(move || q.pop_or_cancel(&cancel).is_none())
        };
        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::SeqCst);
        q.wake_all();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_changed_reports_size() {
        let q = Arc::new(TaskQueue::new());
        let cancel = AtomicBool::new(false);
        assert_eq!(q.wait_changed(0, Duration::from_millis(10), &cancel), 0);

        let pusher = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(marker(1)).unwrap();
            })
        };
        assert_eq!(q.wait_changed(0, Duration::from_secs(5), &cancel), 1);
        pusher.join().unwrap();

        let drainer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.pop();
            })
        };
        q.wait_empty();
        assert!(q.is_empty());
        drainer.join().unwrap();
    }

    #[test]
    fn cancel_interrupts_wait_changed() {
        let q = Arc::new(TaskQueue::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (q, cancel) = (q.clone(), cancel.clone());
            thread::spawn(move || {
                let started = Instant::now();
                q.wait_changed(0, Duration::from_secs(60), &cancel);
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::SeqCst);
        q.wake_all();
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn closed_queue_refuses_tasks() {
        let q = TaskQueue::new();
        q.push(marker(1)).unwrap();
        q.close();
        assert!(q.is_closed());
        let refused = q.push(marker(2)).unwrap_err();
        assert_eq!(n_of(refused), 2);
        // What was queued before closing is still there.
        assert_eq!(n_of(q.pop()), 1);
        assert!(q.is_empty());
    }
}
