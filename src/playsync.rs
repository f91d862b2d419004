// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::{Error, Result};

/// The run flag shared by a player and its workers. Workers check it at loop boundaries; it
/// never interrupts a worker blocked inside a stream read.
///
/// Waiting on the flag's condvar (barrier waits, pacing sleeps) returns as soon as the flag is
/// lowered.
#[derive(Clone)]
pub struct RunFlag {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    gate: Mutex<()>,
    condvar: Condvar,
}

impl RunFlag {
    /// Creates a new, lowered run flag.
    pub fn new() -> RunFlag {
        RunFlag {
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                gate: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Raises the flag. Returns false if it was already raised.
    pub fn raise(&self) -> bool {
        !self.inner.running.swap(true, Ordering::SeqCst)
    }

    /// Lowers the flag and wakes every waiter. Returns true only for the call that actually
    /// lowered it.
    pub fn lower(&self) -> bool {
        let lowered = self.inner.running.swap(false, Ordering::SeqCst);
        self.notify();
        lowered
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wakes waiters so that they re-check their conditions.
    pub fn notify(&self) {
        let _gate = self.inner.gate.lock();
        self.inner.condvar.notify_all();
    }

    /// Waits until the condition holds or the flag is lowered. Returns true if the condition
    /// held. Anything that can change the condition must call [RunFlag::notify] afterwards.
    pub fn wait_for<F>(&self, condition: F) -> bool
    where
        F: Fn() -> bool,
    {
        let mut gate = self.inner.gate.lock();
        self.inner
            .condvar
            .wait_while(&mut gate, |_| self.is_running() && !condition());
        condition()
    }

    /// Blocks until the flag is lowered.
    pub fn wait_lowered(&self) {
        self.wait_for(|| false);
    }

    /// Sleeps until the deadline or until the flag is lowered. Returns true if the flag is
    /// still raised.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut gate = self.inner.gate.lock();
        while self.is_running() {
            if self.inner.condvar.wait_until(&mut gate, deadline).timed_out() {
                break;
            }
        }
        self.is_running()
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        RunFlag::new()
    }
}

/// One first-sample event per stream. The merge worker waits on all of them before its first
/// tick.
#[derive(Clone)]
pub struct FirstSampleBarrier {
    arrived: Arc<Vec<AtomicBool>>,
    flag: RunFlag,
}

impl FirstSampleBarrier {
    pub fn new(streams: usize, flag: RunFlag) -> FirstSampleBarrier {
        FirstSampleBarrier {
            arrived: Arc::new((0..streams).map(|_| AtomicBool::new(false)).collect()),
            flag,
        }
    }

    /// Signals that the given stream produced its first sample.
    pub fn arrive(&self, stream: usize) {
        self.arrived[stream].store(true, Ordering::SeqCst);
        self.flag.notify();
    }

    pub fn is_complete(&self) -> bool {
        self.arrived
            .iter()
            .all(|arrived| arrived.load(Ordering::SeqCst))
    }

    /// Blocks until every stream arrived. Returns false if the run flag was lowered first.
    pub fn wait(&self) -> bool {
        self.flag.wait_for(|| self.is_complete())
    }
}

/// Keeps the first error of a run's workers. Workers never return their errors through
/// `close()`; callers that care can take it afterwards.
#[derive(Clone, Default)]
pub struct WorkerFailure {
    first: Arc<Mutex<Option<Error>>>,
}

impl WorkerFailure {
    pub fn new() -> WorkerFailure {
        WorkerFailure::default()
    }

    pub fn record(&self, err: Error) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err);
        }
    }

    pub fn take(&self) -> Option<Error> {
        self.first.lock().take()
    }
}

/// Joins a worker thread, logging and recording its error or panic.
pub(crate) fn join_worker(worker: &str, handle: JoinHandle<Result<()>>, failure: &WorkerFailure) {
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(worker, err = e.to_string(), "Worker failed");
            failure.record(e);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker, panic = message, "Worker panicked");
            failure.record(Error::WorkerPanic(message));
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn test_run_flag_lower_once() {
        let flag = RunFlag::new();
        assert!(!flag.is_running());
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_running());

        assert!(flag.lower());
        assert!(!flag.lower());
        assert!(!flag.is_running());
    }

    #[test]
    fn test_barrier_completes() {
        let flag = RunFlag::new();
        flag.raise();
        let barrier = FirstSampleBarrier::new(2, flag.clone());

        let join = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };

        barrier.arrive(1);
        thread::sleep(Duration::from_millis(20));
        assert!(!join.is_finished());
        barrier.arrive(0);
        assert!(join.join().unwrap());
    }

    #[test]
    fn test_barrier_released_by_lower() {
        let flag = RunFlag::new();
        flag.raise();
        let barrier = FirstSampleBarrier::new(2, flag.clone());

        let join = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };

        barrier.arrive(0);
        flag.lower();
        assert!(!join.join().unwrap());
    }

    #[test]
    fn test_sleep_until_interrupted() {
        let flag = RunFlag::new();
        flag.raise();

        let join = {
            let flag = flag.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let running = flag.sleep_until(start + Duration::from_secs(10));
                (running, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.lower();
        let (running, elapsed) = join.join().unwrap();
        assert!(!running);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_join_worker_records_first_failure() {
        let failure = WorkerFailure::new();
        join_worker("ok", thread::spawn(|| Ok(())), &failure);
        assert!(failure.take().is_none());

        join_worker(
            "first",
            thread::spawn(|| Err(Error::Other("first".into()))),
            &failure,
        );
        join_worker(
            "second",
            thread::spawn(|| Err(Error::Other("second".into()))),
            &failure,
        );
        assert!(matches!(failure.take(), Some(Error::Other(m)) if m == "first"));
        assert!(failure.take().is_none());
    }

    #[test]
    fn test_sleep_until_deadline() {
        let flag = RunFlag::new();
        flag.raise();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(flag.sleep_until(deadline));
        assert!(Instant::now() >= deadline);
    }
}
