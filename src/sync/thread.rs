// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
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
    pacing::TickStats,
    playsync::{join_worker, FirstSampleBarrier, RunFlag},
    preprocess::PreprocessorFactory,
    sample::{Header, Record, Value},
    sinks::{CsvLogger, RecordSink},
    sonification::Dispatcher,
    streams::Stream,
    thread_priority,
};

use super::{
    merge_worker, resolve_tick_rate, slot::Slot, tag, validate_names, Controls, Session,
    SlotReader,
};

struct RunHandles {
    merge: JoinHandle<Result<()>>,
    streams: Vec<(String, JoinHandle<Result<()>>)>,
}

/// Merges N streams on a fixed tick with one producer thread per stream plus one merge and
/// dispatch thread.
///
/// Every tick dispatches the latest sample of every stream, whether or not it changed since
/// the previous tick. The first tick waits for the first sample of every stream.
pub struct ThreadSynchronizer {
    streams: Vec<Stream>,
    controls: Controls,
    stream_loggers: Vec<CsvLogger>,
    /// The workers of the current or last run.
    handles: Mutex<Option<RunHandles>>,
    span: Span,
}

impl ThreadSynchronizer {
    /// Creates a synchronizer. Without a tick rate, the highest native rate of the streams is
    /// used.
    pub fn new(
        streams: Vec<Stream>,
        dispatcher: Dispatcher,
        tick_rate: Option<f64>,
    ) -> Result<ThreadSynchronizer> {
        validate_names(streams.iter().map(|stream| stream.name()))?;
        let tick_rate = resolve_tick_rate(
            tick_rate,
            streams.iter().map(|stream| (stream.name(), stream.rate())),
        )?;
        info!(
            tick_rate,
            streams = streams.len(),
            "Created thread synchronizer"
        );

        Ok(ThreadSynchronizer {
            stream_loggers: streams.iter().map(|_| CsvLogger::new()).collect(),
            streams,
            controls: Controls::new(dispatcher, tick_rate),
            handles: Mutex::new(None),
            span: span!(Level::INFO, "thread synchronizer"),
        })
    }

    /// Applies a preprocessor to every merged record. A fresh preprocessor is built from the
    /// factory at every listen.
    pub fn with_preprocessor(mut self, factory: PreprocessorFactory) -> ThreadSynchronizer {
        self.controls.preprocessor = Some(factory);
        self
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn tick_rate(&self) -> f64 {
        self.controls.tick_rate
    }

    pub fn is_listening(&self) -> bool {
        self.controls.flag.is_running()
    }

    /// Registers a hook run on the caller's thread at every listen, before any worker starts.
    pub fn add_listen_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.controls.listen_hooks.add(hook);
    }

    /// Registers a hook run by `close()` once every worker is joined.
    pub fn add_close_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.controls.close_hooks.add(hook);
    }

    /// Sets or clears the sink fed with every dispatched record.
    pub fn set_feature_sink(&self, sink: Option<Box<dyn RecordSink>>) {
        *self.controls.sink.lock() = sink;
    }

    /// Starts logging dispatched records.
    pub fn log_start(&self, path: &Path, overwrite: bool) -> Result<()> {
        self.controls.logger.start(path, overwrite)
    }

    pub fn log_stop(&self) -> Result<()> {
        self.controls.logger.stop()
    }

    /// Starts logging the tagged samples of one stream.
    pub fn log_start_stream(&self, index: usize, path: &Path, overwrite: bool) -> Result<()> {
        self.stream_logger(index)?.start(path, overwrite)
    }

    pub fn log_stop_stream(&self, index: usize) -> Result<()> {
        self.stream_logger(index)?.stop()
    }

    fn stream_logger(&self, index: usize) -> Result<&CsvLogger> {
        self.stream_loggers
            .get(index)
            .ok_or_else(|| Error::Other(format!("no stream at index {}", index)))
    }

    /// Tick counters of the current or last run.
    pub fn stats(&self) -> &TickStats {
        &self.controls.stats
    }

    /// Takes the first worker error of the last run, if any.
    pub fn take_failure(&self) -> Option<Error> {
        self.controls.failure.take()
    }

    /// Starts a run: one worker per stream plus the merge worker.
    pub fn listen(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut handles = self.handles.lock();
        if self.controls.flag.is_running() {
            return Err(Error::AlreadyListening);
        }
        // A run that ended on its own still has to be joined.
        if let Some(stale) = handles.take() {
            self.join(stale);
        }

        self.controls.listen_hooks.run();
        self.controls.stats.reset();
        self.controls.flag.raise();

        let start = Instant::now();
        let slots: Arc<Vec<Slot>> = Arc::new(self.streams.iter().map(|_| Slot::new()).collect());
        let barrier = FirstSampleBarrier::new(self.streams.len(), self.controls.flag.clone());

        let mut stream_handles = Vec::with_capacity(self.streams.len());
        for (index, stream) in self.streams.iter().enumerate() {
            let worker = StreamWorker {
                index,
                stream: stream.clone(),
                slots: slots.clone(),
                barrier: barrier.clone(),
                flag: self.controls.flag.clone(),
                logger: self.stream_loggers[index].clone(),
                start,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-stream", stream.name()))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => stream_handles.push((stream.name().to_string(), handle)),
                Err(e) => {
                    self.abort(stream_handles);
                    return Err(e.into());
                }
            }
        }

        let context = self.controls.merge_context(start);
        let spawned = thread::Builder::new().name("merge".into()).spawn(move || {
            thread_priority::configure_merge_thread();
            merge_worker(context, SlotSnapshots { slots, barrier })
        });
        let merge = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.abort(stream_handles);
                return Err(e.into());
            }
        };

        *handles = Some(RunHandles {
            merge,
            streams: stream_handles,
        });
        info!(
            streams = self.streams.len(),
            tick_rate = self.controls.tick_rate,
            "Listening"
        );
        Ok(())
    }

    /// Stops the run and joins every worker. A worker blocked inside a stream read is joined
    /// once that read returns.
    pub fn close(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut handles = self.handles.lock();
        if !self.controls.flag.lower() {
            return Err(Error::NotListening);
        }

        info!("Closing");
        if let Some(run) = handles.take() {
            self.join(run);
        }
        self.controls.close_hooks.run();
        info!(
            ticks = self.controls.stats.ticks(),
            late = self.controls.stats.late(),
            "Closed"
        );
        Ok(())
    }

    /// Blocks until the current run ends on its own or is closed, then joins its workers.
    pub fn wait(&self) {
        self.controls.flag.wait_lowered();
        let run = self.handles.lock().take();
        if let Some(run) = run {
            self.join(run);
        }
    }

    fn join(&self, run: RunHandles) {
        join_worker("merge", run.merge, &self.controls.failure);
        for (name, handle) in run.streams {
            join_worker(&name, handle, &self.controls.failure);
        }
    }

    fn abort(&self, spawned: Vec<(String, JoinHandle<Result<()>>)>) {
        error!("Failed to spawn worker, aborting run");
        self.controls.flag.lower();
        for (name, handle) in spawned {
            join_worker(&name, handle, &self.controls.failure);
        }
    }
}

impl Drop for ThreadSynchronizer {
    fn drop(&mut self) {
        self.controls.flag.lower();
        if let Some(run) = self.handles.get_mut().take() {
            self.join(run);
        }
    }
}

/// Reads one stream into its slot.
struct StreamWorker {
    index: usize,
    stream: Stream,
    slots: Arc<Vec<Slot>>,
    barrier: FirstSampleBarrier,
    flag: RunFlag,
    logger: CsvLogger,
    start: Instant,
}

impl StreamWorker {
    fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "stream", stream = self.stream.name());
        let _enter = span.enter();
        info!("Stream worker started");

        let result = self.read_loop();

        // One stream ending ends the whole run.
        self.flag.lower();
        match result.as_ref() {
            Ok(()) => info!("Stream worker ended"),
            Err(e) => error!(err = e.to_string(), "Stream worker failed"),
        }
        result
    }

    fn read_loop(&self) -> Result<()> {
        let mut session = Session::open(&self.stream)?;
        let header = Arc::new(session.tagged_header()?);
        let slot = &self.slots[self.index];

        while self.flag.is_running() {
            let sample = match session.next_sample()? {
                Some(sample) => sample,
                None => {
                    info!("Stream exhausted");
                    break;
                }
            };
            let values = tag(self.start.elapsed().as_secs_f64(), sample);

            if slot.is_populated() {
                slot.store(&values);
            } else {
                slot.init(header.clone(), &values);
                self.barrier.arrive(self.index);
            }

            if self.logger.is_logging() {
                self.logger
                    .feed_if_active(&Record::new(header.clone(), values))?;
            }
        }
        Ok(())
    }
}

struct SlotSnapshots {
    slots: Arc<Vec<Slot>>,
    barrier: FirstSampleBarrier,
}

impl SlotReader for SlotSnapshots {
    fn wait_started(&mut self) -> Result<Option<Vec<Header>>> {
        if !self.barrier.wait() {
            return Ok(None);
        }
        self.slots
            .iter()
            .map(|slot| {
                slot.header()
                    .map(|header| header.as_ref().clone())
                    .ok_or_else(|| Error::Other("slot empty after first sample".into()))
            })
            .collect::<Result<Vec<Header>>>()
            .map(Some)
    }

    fn read_into(&mut self, values: &mut Vec<Value>) -> Result<()> {
        for slot in self.slots.iter() {
            slot.snapshot_into(values);
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
        time::{Duration, Instant},
    };

    use serial_test::serial;

    use crate::{
        error::Error,
        preprocess::{Preprocessor, Scale},
        sample::{Sample, Value},
        sonification::{mock, Dispatcher},
        streams::Stream,
        testutil::{eventually, ramp},
        transport,
    };

    use super::ThreadSynchronizer;

    fn dispatcher() -> (mock::Sonification, Dispatcher) {
        let sonification = mock::Sonification::new();
        let dispatcher = Dispatcher::new(
            Box::new(sonification.clone()),
            Arc::new(transport::mock::Transport::new()),
        );
        (sonification, dispatcher)
    }

    #[test]
    fn test_configuration_errors() {
        let (_, d) = dispatcher();
        assert!(matches!(
            ThreadSynchronizer::new(vec![], d.clone(), Some(10.0)),
            Err(Error::NoStreams)
        ));
        assert!(matches!(
            ThreadSynchronizer::new(
                vec![ramp("a", 10.0, &["x"], None, None), ramp("a", 10.0, &["y"], None, None)],
                d.clone(),
                None
            ),
            Err(Error::DuplicateStream(_))
        ));
        assert!(matches!(
            ThreadSynchronizer::new(
                vec![Stream::from_fn("norate", &["x"], || || None)],
                d.clone(),
                None
            ),
            Err(Error::UnknownRate(_))
        ));

        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 5.0, &["x"], None, None),
                ramp("b", 40.0, &["y"], None, None),
            ],
            d,
            None,
        )
        .unwrap();
        assert_eq!(40.0, sync.tick_rate());
    }

    #[test]
    #[serial]
    fn test_listen_close() {
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 50.0, &["x"], None, None),
                ramp("b", 20.0, &["y"], None, None),
            ],
            d,
            Some(50.0),
        )
        .unwrap();

        let listens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let listens = listens.clone();
            sync.add_listen_hook(move || {
                listens.fetch_add(1, Ordering::SeqCst);
            });
            let closes = closes.clone();
            sync.add_close_hook(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(matches!(sync.close(), Err(Error::NotListening)));
        sync.listen().unwrap();
        assert!(matches!(sync.listen(), Err(Error::AlreadyListening)));
        assert!(sync.is_listening());
        eventually(|| !sonification.records().is_empty(), "No record dispatched");

        let start = Instant::now();
        sync.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!sync.is_listening());
        assert!(matches!(sync.close(), Err(Error::NotListening)));

        assert_eq!(1, listens.load(Ordering::SeqCst));
        assert_eq!(1, closes.load(Ordering::SeqCst));
        assert_eq!(1, sonification.starts());
        assert_eq!(1, sonification.stops());

        // A second run starts from scratch.
        sync.listen().unwrap();
        eventually(
            || sonification.starts() == 2 && sonification.records().len() > 2,
            "Second run never dispatched",
        );
        sync.close().unwrap();
        assert_eq!(2, sonification.stops());
    }

    #[test]
    #[serial]
    fn test_first_tick_waits_for_every_stream() {
        let (sonification, d) = dispatcher();
        let slow = Stream::from_fn("slow", &["s"], || {
            let mut first = true;
            move || {
                if first {
                    first = false;
                    thread::sleep(Duration::from_millis(300));
                }
                thread::sleep(Duration::from_millis(10));
                Some(Ok(Sample::from(vec![1.0])))
            }
        });
        let sync = ThreadSynchronizer::new(
            vec![ramp("fast", 100.0, &["f"], None, None), slow],
            d,
            Some(100.0),
        )
        .unwrap();

        let start = Instant::now();
        sync.listen().unwrap();
        eventually(|| !sonification.records().is_empty(), "No record dispatched");
        sync.close().unwrap();

        let first = sonification.process_times()[0];
        assert!(first - start >= Duration::from_millis(300));
        let record = &sonification.records()[0];
        assert_eq!(
            vec!["fast_timestamp", "f", "slow_timestamp", "s", "timestamp"],
            record.header().names()
        );
    }

    #[test]
    #[serial]
    fn test_colliding_fields() {
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 50.0, &["x"], None, None),
                ramp("b", 50.0, &["x"], None, None),
            ],
            d,
            None,
        )
        .unwrap();

        sync.listen().unwrap();
        sync.wait();
        assert!(!sync.is_listening());
        assert!(matches!(
            sync.take_failure(),
            Some(Error::DuplicateFields { names, .. }) if names == vec!["x".to_string()]
        ));
        assert!(sonification.records().is_empty());
        assert_eq!(1, sonification.stops());
    }

    #[test]
    #[serial]
    fn test_unpaceable_tick_ends_run() {
        let (sonification, d) = dispatcher();
        // The tick period fits a duration, but the deadline of tick 1 overflows the clock.
        let sync = ThreadSynchronizer::new(
            vec![ramp("a", 50.0, &["x"], None, None)],
            d,
            Some(1e-19),
        )
        .unwrap();

        sync.listen().unwrap();
        eventually(|| !sync.is_listening(), "Run never ended");
        sync.wait();
        assert_eq!(1, sonification.records().len());
        assert_eq!(1, sonification.stops());
        assert!(matches!(sync.take_failure(), Some(Error::InvalidTickRate(_))));
        assert!(matches!(sync.close(), Err(Error::NotListening)));
    }

    #[test]
    #[serial]
    fn test_stale_values_are_reused() {
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 10.0, &["a"], None, None),
                ramp("b", 1.0, &["b"], None, None),
            ],
            d,
            Some(10.0),
        )
        .unwrap();

        sync.listen().unwrap();
        eventually(|| sonification.records().len() >= 25, "Too few records");
        sync.close().unwrap();

        let records = sonification.records();
        let b: Vec<Value> = records.iter().map(|r| r.get("b").unwrap()).collect();
        let changes = b.windows(2).filter(|w| w[0] != w[1]).count();
        let repeats = b.len() - 1 - changes;
        // B changes about once every ten ticks, every other tick repeats its last value.
        assert!(changes >= 1, "B never changed in {} records", b.len());
        assert!(
            changes <= b.len() / 10 + 2,
            "{} changes in {} records",
            changes,
            b.len()
        );
        assert!(
            repeats * 4 >= (b.len() - 1) * 3,
            "{} repeats in {} records",
            repeats,
            b.len()
        );
    }

    #[test]
    #[serial]
    fn test_one_second_at_5hz() {
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 5.0, &["a"], None, None),
                ramp("b", 2.0, &["b"], None, None),
            ],
            d,
            Some(5.0),
        )
        .unwrap();

        sync.listen().unwrap();
        eventually(|| !sonification.records().is_empty(), "No record dispatched");
        // Ticks 0 to 4 are due within the first 800ms after the first one.
        thread::sleep(Duration::from_millis(900));
        sync.close().unwrap();

        let records = sonification.records();
        assert_eq!(5, records.len());
        assert_eq!(5, sync.stats().ticks());
        let mut last = 0.0;
        for record in records.iter() {
            assert!(record.get("a").is_some());
            assert!(record.get("b").is_some());
            let timestamp = record.get("timestamp").unwrap().as_f64();
            assert!(timestamp >= last);
            last = timestamp;
        }
    }

    #[test]
    #[serial]
    fn test_failing_stream_ends_run() {
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("ok", 20.0, &["a"], None, None),
                ramp("failing", 20.0, &["b"], None, Some(3)),
            ],
            d,
            None,
        )
        .unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = closed.clone();
            sync.streams()[1].add_close_hook(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }

        sync.listen().unwrap();
        eventually(|| !sync.is_listening(), "Run never ended");
        sync.wait();

        assert_eq!(1, sonification.stops());
        assert_eq!(1, closed.load(Ordering::SeqCst));
        assert!(matches!(sync.take_failure(), Some(Error::Source { stream, .. }) if stream == "failing"));
        // The run already ended, so there is nothing to close.
        assert!(matches!(sync.close(), Err(Error::NotListening)));
    }

    #[test]
    #[serial]
    fn test_stream_without_first_sample() {
        let (sonification, d) = dispatcher();
        let never = Stream::from_fn("never", &["n"], || || None).with_rate(10.0);
        let blocked = Stream::from_fn("blocked", &["b"], || {
            || {
                thread::sleep(Duration::from_millis(20));
                Some(Ok(Sample::from(vec![0.0])))
            }
        })
        .with_rate(10.0);
        let sync = ThreadSynchronizer::new(vec![never, blocked], d, None).unwrap();

        sync.listen().unwrap();
        eventually(|| !sync.is_listening(), "Run never ended");
        sync.wait();
        assert!(sonification.records().is_empty());
        assert_eq!(1, sonification.stops());
    }

    #[test]
    #[serial]
    fn test_merged_preprocessor_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (sonification, d) = dispatcher();
        let sync = ThreadSynchronizer::new(
            vec![
                ramp("a", 50.0, &["a"], None, None),
                ramp("b", 50.0, &["b"], Some(5), None),
            ],
            d,
            Some(50.0),
        )
        .unwrap()
        .with_preprocessor(Arc::new(|| Box::new(Scale::new(2.0)) as Box<dyn Preprocessor>));

        sync.log_start(&dir.path().join("merged.csv"), false).unwrap();
        sync.log_start_stream(1, &dir.path().join("b.csv"), false)
            .unwrap();
        assert!(sync.log_start_stream(2, &dir.path().join("c.csv"), false).is_err());

        sync.listen().unwrap();
        sync.wait();
        sync.log_stop().unwrap();
        sync.log_stop_stream(1).unwrap();
        assert!(matches!(sync.log_stop_stream(1), Err(Error::NotLogging)));

        // Every merged value is doubled, timestamps are left alone.
        for record in sonification.records() {
            let b = record.get("b").unwrap().as_f64();
            assert_eq!(0.0, b % 2.0);
            assert!(record.get("timestamp").unwrap().as_f64() < 5.0);
        }

        let b_log = std::fs::read_to_string(dir.path().join("b.csv")).unwrap();
        let lines: Vec<&str> = b_log.lines().collect();
        assert_eq!("b_timestamp,b", lines[0]);
        assert_eq!(6, lines.len());
        assert!(std::fs::read_to_string(dir.path().join("merged.csv"))
            .unwrap()
            .starts_with("a_timestamp,a,b_timestamp,b,timestamp\n"));
    }
}
