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
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{error, info, span, Level, Span};

use crate::{
    error::{Error, Result},
    hooks::Hooks,
    pacing::TickStats,
    playsync::{join_worker, RunFlag, WorkerFailure},
    sample::{Header, Record, TIMESTAMP_FIELD},
    sinks::{feed_shared, CsvLogger, RecordSink, SharedSink},
    sonification::Dispatcher,
    streams::Stream,
    sync::{set_timestamp, Session},
};

/// Plays back a single stream: every sample is dispatched as soon as the stream produces it,
/// with no pacing of its own.
pub struct Player {
    /// The stream to listen to.
    stream: Stream,
    /// The sonification and its transport.
    dispatcher: Dispatcher,
    /// Whether to append the elapsed time since listen to every record.
    timestamp: bool,
    flag: RunFlag,
    stats: TickStats,
    logger: CsvLogger,
    sink: SharedSink,
    failure: WorkerFailure,
    listen_hooks: Hooks,
    close_hooks: Hooks,
    /// Keeps track of the listener join. There is at most one worker at a time.
    join: Mutex<Option<JoinHandle<Result<()>>>>,
    /// The logging span.
    span: Span,
}

impl Player {
    /// Creates a new player.
    pub fn new(stream: Stream, dispatcher: Dispatcher) -> Player {
        Player {
            span: span!(Level::INFO, "player", stream = stream.name()),
            stream,
            dispatcher,
            timestamp: false,
            flag: RunFlag::new(),
            stats: TickStats::new(),
            logger: CsvLogger::new(),
            sink: SharedSink::default(),
            failure: WorkerFailure::new(),
            listen_hooks: Hooks::new("listen"),
            close_hooks: Hooks::new("close"),
            join: Mutex::new(None),
        }
    }

    /// Appends a `timestamp` field holding the elapsed time since listen. An existing
    /// `timestamp` field of the stream is overwritten instead.
    pub fn with_timestamp(mut self, timestamp: bool) -> Player {
        self.timestamp = timestamp;
        self
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn is_listening(&self) -> bool {
        self.flag.is_running()
    }

    /// Registers a hook run on the caller's thread at every listen, before the worker starts.
    pub fn add_listen_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.listen_hooks.add(hook);
    }

    /// Registers a hook run by `close()` once the worker is joined.
    pub fn add_close_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.close_hooks.add(hook);
    }

    /// Sets or clears the sink fed with every dispatched record.
    pub fn set_feature_sink(&self, sink: Option<Box<dyn RecordSink>>) {
        *self.sink.lock() = sink;
    }

    pub fn log_start(&self, path: &Path, overwrite: bool) -> Result<()> {
        self.logger.start(path, overwrite)
    }

    pub fn log_stop(&self) -> Result<()> {
        self.logger.stop()
    }

    /// Counts the records dispatched by the current or last run.
    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Takes the error that ended the last run, if any.
    pub fn take_failure(&self) -> Option<Error> {
        self.failure.take()
    }

    /// Starts listening to the stream.
    pub fn listen(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut join = self.join.lock();
        if self.flag.is_running() {
            return Err(Error::AlreadyListening);
        }
        if let Some(stale) = join.take() {
            join_worker("listener", stale, &self.failure);
        }

        self.listen_hooks.run();
        self.stats.reset();
        self.flag.raise();

        let listener = Listener {
            stream: self.stream.clone(),
            dispatcher: self.dispatcher.clone(),
            timestamp: self.timestamp,
            flag: self.flag.clone(),
            stats: self.stats.clone(),
            logger: self.logger.clone(),
            sink: self.sink.clone(),
            start: Instant::now(),
        };
        let spawned = thread::Builder::new()
            .name("listener".into())
            .spawn(move || listener.run());
        match spawned {
            Ok(handle) => *join = Some(handle),
            Err(e) => {
                self.flag.lower();
                return Err(e.into());
            }
        }

        info!("Listening");
        Ok(())
    }

    /// Stops listening and joins the worker.
    pub fn close(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut join = self.join.lock();
        if !self.flag.lower() {
            return Err(Error::NotListening);
        }

        info!("Closing");
        if let Some(handle) = join.take() {
            join_worker("listener", handle, &self.failure);
        }
        self.close_hooks.run();
        info!(records = self.stats.ticks(), "Closed");
        Ok(())
    }

    /// Blocks until the current run ends on its own or is closed.
    pub fn wait(&self) {
        let _enter = self.span.enter();
        self.flag.wait_lowered();
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            join_worker("listener", handle, &self.failure);
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.flag.lower();
        if let Some(handle) = self.join.get_mut().take() {
            join_worker("listener", handle, &self.failure);
        }
    }
}

/// The worker of one run.
struct Listener {
    stream: Stream,
    dispatcher: Dispatcher,
    timestamp: bool,
    flag: RunFlag,
    stats: TickStats,
    logger: CsvLogger,
    sink: SharedSink,
    start: Instant,
}

impl Listener {
    fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "listener", stream = self.stream.name());
        let _enter = span.enter();
        info!("Listener thread started");

        let mut session = None;
        let result = self.dispatch_loop(&mut session);

        self.flag.lower();
        let stopped = self.dispatcher.stop();
        // Close hooks run after the stop bundle.
        drop(session);

        match result.as_ref() {
            Ok(()) => info!(records = self.stats.ticks(), "Listener thread ended"),
            Err(e) => error!(err = e.to_string(), "Listener thread failed"),
        }
        result.and(stopped)
    }

    fn dispatch_loop(&self, session: &mut Option<Session>) -> Result<()> {
        self.dispatcher.start()?;
        let session = session.insert(Session::open(&self.stream)?);

        let header = if self.timestamp {
            session.header().with_trailing(TIMESTAMP_FIELD)
        } else {
            session.header().clone()
        };
        let header: Arc<Header> = Arc::new(header);

        while let Some(sample) = session.next_sample()? {
            if !self.flag.is_running() {
                break;
            }

            let mut values = sample.into_values();
            if self.timestamp {
                set_timestamp(&header, &mut values, self.start.elapsed().as_secs_f64());
            }
            let record = Record::new(header.clone(), values);

            self.dispatcher.process(&record)?;
            self.logger.feed_if_active(&record)?;
            feed_shared(&self.sink, &record)?;
            self.stats.record_tick();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use parking_lot::Mutex;

    use crate::{
        error::{Error, Result},
        sample::{Record, Sample, Value},
        sinks::RecordSink,
        sonification::{mock, Dispatcher},
        streams::Stream,
        testutil::{eventually, ramp},
        transport,
    };

    use super::Player;

    fn dispatcher() -> (mock::Sonification, Arc<transport::mock::Transport>, Dispatcher) {
        let sonification = mock::Sonification::new();
        let transport = Arc::new(transport::mock::Transport::new());
        let dispatcher = Dispatcher::new(Box::new(sonification.clone()), transport.clone());
        (sonification, transport, dispatcher)
    }

    #[derive(Clone, Default)]
    struct Collect {
        records: Arc<Mutex<Vec<Record>>>,
    }

    impl RecordSink for Collect {
        fn feed(&mut self, record: &Record) -> Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_player_dispatches_every_sample() {
        let (sonification, transport, d) = dispatcher();
        let player = Player::new(ramp("r", 1000.0, &["a", "b"], Some(10), None), d);
        let sink = Collect::default();
        player.set_feature_sink(Some(Box::new(sink.clone())));

        player.listen().unwrap();
        player.wait();
        assert!(!player.is_listening());

        let records = sonification.records();
        assert_eq!(10, records.len());
        assert_eq!(vec!["a", "b"], records[0].header().names());
        assert_eq!(Some(Value::F64(9.0)), records[9].get("b"));
        assert_eq!(10, sink.records.lock().len());
        assert_eq!(10, player.stats().ticks());

        // start, ten records, stop, all in order.
        let sent = transport.sent();
        assert_eq!(12, sent.len());
        assert_eq!("/start", sent[0].commands[0].address);
        assert_eq!("/stop", sent[11].commands[0].address);

        // The run ended on its own.
        assert!(matches!(player.close(), Err(Error::NotListening)));
    }

    #[test]
    fn test_player_listen_close() {
        let (sonification, _, d) = dispatcher();
        let player = Player::new(ramp("r", 100.0, &["a"], None, None), d).with_timestamp(true);

        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let opened = opened.clone();
            player.stream().add_open_hook(move || {
                opened.fetch_add(1, Ordering::SeqCst);
            });
            let closed = closed.clone();
            player.stream().add_close_hook(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(matches!(player.close(), Err(Error::NotListening)));
        player.listen().unwrap();
        assert!(matches!(player.listen(), Err(Error::AlreadyListening)));
        eventually(|| sonification.records().len() >= 3, "Too few records");
        player.close().unwrap();
        assert!(matches!(player.close(), Err(Error::NotListening)));

        assert_eq!(1, opened.load(Ordering::SeqCst));
        assert_eq!(1, closed.load(Ordering::SeqCst));
        assert_eq!(1, sonification.stops());

        let records = sonification.records();
        assert_eq!(vec!["a", "timestamp"], records[0].header().names());
        let timestamps: Vec<f64> = records
            .iter()
            .map(|r| r.get("timestamp").unwrap().as_f64())
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_player_source_failure() {
        let (sonification, _, d) = dispatcher();
        let player = Player::new(ramp("r", 1000.0, &["a"], None, Some(3)), d);

        player.listen().unwrap();
        eventually(|| !player.is_listening(), "Player never stopped");
        player.wait();

        assert_eq!(3, sonification.records().len());
        assert_eq!(1, sonification.stops());
        assert!(matches!(player.take_failure(), Some(Error::Source { .. })));

        // The player can listen again after a failed run.
        player.listen().unwrap();
        player.wait();
        assert_eq!(6, sonification.records().len());
    }

    #[test]
    fn test_player_logs_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let (_, _, d) = dispatcher();
        let player = Player::new(ramp("r", 1000.0, &["a"], Some(2), None), d);

        player.log_start(&path, false).unwrap();
        player.listen().unwrap();
        player.wait();
        player.log_stop().unwrap();

        assert_eq!("a\n0\n1\n", std::fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn test_close_while_blocked_in_read() {
        let (sonification, _, d) = dispatcher();
        let slow = Stream::from_fn("slow", &["a"], || {
            || {
                thread::sleep(Duration::from_millis(200));
                Some(Ok(Sample::from(vec![1u8])))
            }
        });
        let player = Player::new(slow, d);
        player.listen().unwrap();
        thread::sleep(Duration::from_millis(50));

        // Returns once the pending read unblocks, and that sample is never dispatched.
        player.close().unwrap();
        assert!(sonification.records().is_empty());
        assert_eq!(1, sonification.stops());
    }
}
