//! One-shot completion signal.
//!
//! A [`Promise`] is held by the producer (normally a [`Task`](crate::task::Task) executed by a worker), the
//! matching [`Signal`] by whoever waits for the result. Resolving consumes the promise, waiting consumes the signal,
//! so a value is handed over exactly once and neither half can be reused.
use std::fmt::Debug;
use std::time::Duration;

use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use crossbeam::channel::TryRecvError;

use crate::error::DbError;

pub struct Promise<T> {
    tx: Sender<T>,
}

pub struct Signal<T> {
    rx: Receiver<T>,
}

/// Create a connected promise/signal pair.
pub fn promise<T>() -> (Promise<T>, Signal<T>) {
    let (tx, rx) = bounded(1);
    (Promise { tx }, Signal { rx })
}

impl<T> Promise<T> {
    /// Hand the value over. A signal that is no longer waited for is not an error.
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> Signal<T> {
    /// Block until the value is available. Returns `None` if the promise was dropped unresolved.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, WaitTimeout<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Ok(v),
            Err(RecvTimeoutError::Timeout) => Err(WaitTimeout::Pending(self)),
            Err(RecvTimeoutError::Disconnected) => Err(WaitTimeout::Abandoned),
        }
    }

    /// Non-blocking check.
    pub fn try_take(self) -> Result<T, WaitTimeout<T>> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(TryRecvError::Empty) => Err(WaitTimeout::Pending(self)),
            Err(TryRecvError::Disconnected) => Err(WaitTimeout::Abandoned),
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl<T, E> Signal<Result<T, E>>
where
    E: From<DbError>,
{
    /// Wait for a fallible result, folding an abandoned promise into the error type.
    pub fn outcome(self) -> Result<T, E> {
        self.wait().unwrap_or_else(|| Err(DbError::Abandoned.into()))
    }
}

/// Outcome of a bounded wait that did not produce a value.
pub enum WaitTimeout<T> {
    /// Still pending; the signal is handed back so the caller can wait again.
    Pending(Signal<T>),
    Abandoned,
}

impl<T> Debug for WaitTimeout<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(_) => write!(f, "WaitTimeout::Pending"),
            Self::Abandoned => write!(f, "WaitTimeout::Abandoned"),
        }
    }
}

impl<T> Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

impl<T> Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("ready", &self.is_ready()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolves_across_threads() {
        let (p, s) = promise::<u32>();
        let h = thread::spawn(move || p.resolve(42));
        assert_eq!(s.wait(), Some(42));
        h.join().unwrap();
    }

    #[test]
    fn dropped_promise_is_abandoned() {
        let (p, s) = promise::<Result<u32, DbError>>();
        drop(p);
        assert_eq!(s.outcome(), Err(DbError::Abandoned));
    }

    #[test]
    fn timeout_hands_signal_back() {
        let (p, s) = promise::<&'static str>();
        let s = match s.wait_timeout(Duration::from_millis(10)) {
            Err(WaitTimeout::Pending(s)) => s,
            other => panic!("unexpected {other:?}"),
        };
        assert!(!s.is_ready());
        p.resolve("done");
        assert!(s.is_ready());
        assert_eq!(s.try_take().unwrap(), "done");
    }
}
