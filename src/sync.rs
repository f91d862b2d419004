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
use std::{collections::HashSet, sync::Arc, time::Instant};

use tracing::{info, span, Level};

use crate::{
    error::{Error, Result},
    hooks::Hooks,
    pacing::{self, Pacer, TickStats},
    playsync::{RunFlag, WorkerFailure},
    preprocess::{Preprocessor, PreprocessorFactory},
    sample::{Header, Record, Sample, SampleShape, Value, TIMESTAMP_FIELD},
    sinks::{feed_shared, CsvLogger, SharedSink},
    sonification::Dispatcher,
    streams::{Generator, Stream},
};

pub mod process;
pub mod slot;
pub mod thread;

pub use process::ProcessSynchronizer;
pub use thread::ThreadSynchronizer;

/// One open run of a stream, as seen by its consuming worker.
///
/// Opening runs the stream's open hooks. The close hooks run exactly once, when the session is
/// closed or dropped, on every exit path.
pub(crate) struct Session {
    name: String,
    generator: Box<dyn Generator>,
    preprocessor: Option<Box<dyn Preprocessor>>,
    header: Header,
    shape: Option<SampleShape>,
    close_hooks: Option<Hooks>,
}

impl Session {
    /// Runs the open hooks, opens the stream and validates its header.
    pub fn open(stream: &Stream) -> Result<Session> {
        stream.open_hooks().run();
        Session::start(stream).inspect_err(|_| stream.close_hooks().run())
    }

    fn start(stream: &Stream) -> Result<Session> {
        let mut generator = stream.open()?;
        let header = Header::new(stream.name(), generator.header()?)?;
        Ok(Session {
            name: stream.name().to_string(),
            generator,
            preprocessor: stream.build_preprocessor(),
            header,
            shape: None,
            close_hooks: Some(stream.close_hooks().clone()),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The header with the stream's elapsed time field inserted at the head.
    pub fn tagged_header(&self) -> Result<Header> {
        self.header
            .with_leading(&self.name, &crate::sample::stream_timestamp_field(&self.name))
    }

    /// Reads the next sample, blocking until the source produces it. Returns None once the
    /// source is exhausted.
    pub fn next_sample(&mut self) -> Result<Option<Sample>> {
        let mut sample = match self.generator.next_sample() {
            Some(sample) => sample?,
            None => return Ok(None),
        };

        if sample.len() != self.header.len() {
            return Err(Error::HeaderMismatch(
                self.name.clone(),
                self.header.len(),
                sample.len(),
            ));
        }
        let shape = *self.shape.get_or_insert_with(|| SampleShape::of(&sample));
        shape.check(&self.name, &sample)?;

        if let Some(preprocessor) = self.preprocessor.as_mut() {
            preprocessor.preprocess(&self.header, sample.values_mut());
            if let Some(value) = sample.values().iter().find(|v| v.dtype() != shape.dtype) {
                return Err(Error::SampleDType {
                    stream: self.name.clone(),
                    expected: shape.dtype,
                    actual: value.dtype(),
                });
            }
        }
        Ok(Some(sample))
    }

    /// Runs the close hooks. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(hooks) = self.close_hooks.take() {
            hooks.run();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Prefixes a sample with its elapsed time.
pub(crate) fn tag(elapsed: f64, sample: Sample) -> Vec<Value> {
    let mut values = Vec::with_capacity(sample.len() + 1);
    values.push(Value::F64(elapsed));
    values.extend(sample.into_values());
    values
}

/// Sets the composite `timestamp` field. The header must come from
/// `Header::with_trailing(TIMESTAMP_FIELD)`, so the field either already existed (and is
/// overwritten) or is the one just past the end of the values.
pub(crate) fn set_timestamp(header: &Header, values: &mut Vec<Value>, elapsed: f64) {
    match header.position(TIMESTAMP_FIELD) {
        Some(i) if i < values.len() => values[i] = Value::F64(elapsed),
        Some(_) => values.push(Value::F64(elapsed)),
        None => {}
    }
}

/// Checks a stream list: not empty, names unique.
pub(crate) fn validate_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateStream(name.to_string()));
        }
    }
    if seen.is_empty() {
        return Err(Error::NoStreams);
    }
    Ok(())
}

/// Returns the configured tick rate, or infers it as the highest native rate of the streams.
pub(crate) fn resolve_tick_rate<'a>(
    tick_rate: Option<f64>,
    rates: impl IntoIterator<Item = (&'a str, Option<f64>)>,
) -> Result<f64> {
    let tick_rate = match tick_rate {
        Some(tick_rate) => tick_rate,
        None => {
            let mut max: Option<f64> = None;
            for (name, rate) in rates {
                let rate = rate.ok_or_else(|| Error::UnknownRate(name.to_string()))?;
                max = Some(max.map_or(rate, |max| max.max(rate)));
            }
            max.ok_or(Error::NoStreams)?
        }
    };
    if !pacing::valid_rate(tick_rate) {
        return Err(Error::InvalidTickRate(tick_rate));
    }
    Ok(tick_rate)
}

/// The merge worker's view of the latest-value slots of one run.
pub(crate) trait SlotReader: Send {
    /// Blocks until every stream produced its first sample. Returns the tagged stream headers
    /// in declared order, or None if the run ended first.
    fn wait_started(&mut self) -> Result<Option<Vec<Header>>>;

    /// Called before each tick. Returns false if the run must end.
    fn poll(&mut self) -> bool {
        true
    }

    /// Appends the latest tagged values of every stream, in declared order.
    fn read_into(&mut self, values: &mut Vec<Value>) -> Result<()>;

    /// Called once the run ended, before the stop bundle is sent.
    fn finish(&mut self) {}
}

/// Everything the merge worker of one run needs, apart from the slots.
pub(crate) struct MergeContext {
    pub dispatcher: Dispatcher,
    pub tick_rate: f64,
    pub preprocessor: Option<PreprocessorFactory>,
    pub flag: RunFlag,
    pub stats: TickStats,
    pub logger: CsvLogger,
    pub sink: SharedSink,
    pub start: Instant,
}

/// Runs the merge/dispatch worker. The stop bundle is sent on every exit path and the run
/// flag is lowered.
pub(crate) fn merge_worker<R: SlotReader>(context: MergeContext, mut reader: R) -> Result<()> {
    let span = span!(Level::INFO, "merge");
    let _enter = span.enter();
    info!(tick_rate = context.tick_rate, "Merge worker started");

    let result = merge_loop(&context, &mut reader);

    context.flag.lower();
    reader.finish();
    let stopped = context.dispatcher.stop();

    info!(
        ticks = context.stats.ticks(),
        late = context.stats.late(),
        "Merge worker ended"
    );
    result.and(stopped)
}

fn merge_loop<R: SlotReader>(context: &MergeContext, reader: &mut R) -> Result<()> {
    context.dispatcher.start()?;

    let headers = match reader.wait_started()? {
        Some(headers) => headers,
        None => return Ok(()),
    };
    // Checked once: stream headers never change during a run.
    let header = Arc::new(Header::concat("merged record", &headers)?.with_trailing(TIMESTAMP_FIELD));
    let mut preprocessor = context.preprocessor.as_ref().map(|factory| factory());
    let mut pacer = Pacer::start(context.tick_rate, context.flag.clone(), context.stats.clone());

    while context.flag.is_running() && reader.poll() {
        let mut values = Vec::with_capacity(header.len());
        reader.read_into(&mut values)?;
        set_timestamp(&header, &mut values, context.start.elapsed().as_secs_f64());
        if values.len() != header.len() {
            return Err(Error::HeaderMismatch(
                "merged record".to_string(),
                header.len(),
                values.len(),
            ));
        }
        if let Some(preprocessor) = preprocessor.as_mut() {
            preprocessor.preprocess(&header, &mut values);
        }

        let record = Record::new(header.clone(), values);
        context.dispatcher.process(&record)?;
        context.logger.feed_if_active(&record)?;
        feed_shared(&context.sink, &record)?;

        if !pacer.wait_next()? {
            break;
        }
    }
    Ok(())
}

/// Lifecycle state shared by both synchronizers.
pub(crate) struct Controls {
    pub dispatcher: Dispatcher,
    pub tick_rate: f64,
    pub preprocessor: Option<PreprocessorFactory>,
    pub flag: RunFlag,
    pub stats: TickStats,
    pub logger: CsvLogger,
    pub sink: SharedSink,
    pub failure: WorkerFailure,
    pub listen_hooks: Hooks,
    pub close_hooks: Hooks,
}

impl Controls {
    pub fn new(dispatcher: Dispatcher, tick_rate: f64) -> Controls {
        Controls {
            dispatcher,
            tick_rate,
            preprocessor: None,
            flag: RunFlag::new(),
            stats: TickStats::new(),
            logger: CsvLogger::new(),
            sink: SharedSink::default(),
            failure: WorkerFailure::new(),
            listen_hooks: Hooks::new("listen"),
            close_hooks: Hooks::new("close"),
        }
    }

    /// Builds the merge context of a new run.
    pub fn merge_context(&self, start: Instant) -> MergeContext {
        MergeContext {
            dispatcher: self.dispatcher.clone(),
            tick_rate: self.tick_rate,
            preprocessor: self.preprocessor.clone(),
            flag: self.flag.clone(),
            stats: self.stats.clone(),
            logger: self.logger.clone(),
            sink: self.sink.clone(),
            start,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        error::Error,
        preprocess::Scale,
        sample::{DType, Header, Sample, Value},
        streams::Stream,
    };

    use super::*;

    #[test]
    fn test_validate_names() {
        assert!(validate_names(["a", "b"]).is_ok());
        assert!(matches!(validate_names(Vec::<&str>::new()), Err(Error::NoStreams)));
        assert!(matches!(
            validate_names(["a", "b", "a"]),
            Err(Error::DuplicateStream(name)) if name == "a"
        ));
    }

    #[test]
    fn test_resolve_tick_rate() {
        assert_eq!(
            20.0,
            resolve_tick_rate(None, [("a", Some(5.0)), ("b", Some(20.0))]).unwrap()
        );
        assert_eq!(
            7.0,
            resolve_tick_rate(Some(7.0), [("a", None)]).unwrap()
        );
        assert!(matches!(
            resolve_tick_rate(None, [("a", Some(5.0)), ("fifo", None)]),
            Err(Error::UnknownRate(name)) if name == "fifo"
        ));
        assert!(matches!(
            resolve_tick_rate(Some(0.0), Vec::new()),
            Err(Error::InvalidTickRate(_))
        ));
        assert!(matches!(
            resolve_tick_rate(Some(f64::NAN), Vec::new()),
            Err(Error::InvalidTickRate(_))
        ));
        // Positive, but one tick would outlast any representable duration.
        assert!(matches!(
            resolve_tick_rate(Some(1e-20), Vec::new()),
            Err(Error::InvalidTickRate(_))
        ));
        assert!(matches!(
            resolve_tick_rate(None, [("a", Some(f64::MIN_POSITIVE))]),
            Err(Error::InvalidTickRate(_))
        ));
    }

    #[test]
    fn test_set_timestamp() {
        let header = Header::new("test", ["a"]).unwrap().with_trailing("timestamp");
        let mut values = vec![Value::F64(1.0)];
        set_timestamp(&header, &mut values, 2.5);
        assert_eq!(vec![Value::F64(1.0), Value::F64(2.5)], values);

        // An existing timestamp field is overwritten in place.
        let header = Header::new("test", ["timestamp", "a"])
            .unwrap()
            .with_trailing("timestamp");
        let mut values = vec![Value::F64(0.1), Value::F64(1.0)];
        set_timestamp(&header, &mut values, 2.5);
        assert_eq!(vec![Value::F64(2.5), Value::F64(1.0)], values);
    }

    #[test]
    fn test_session_validates_shape() {
        let stream = Stream::from_fn("bad", &["a", "b"], || {
            let mut n = 0;
            move || {
                n += 1;
                Some(Ok(match n {
                    1 => Sample::from(vec![1.0, 2.0]),
                    2 => Sample::from(vec![1i32, 2i32]),
                    _ => Sample::from(vec![1.0]),
                }))
            }
        });

        let mut session = Session::open(&stream).unwrap();
        assert!(session.next_sample().unwrap().is_some());
        assert!(matches!(
            session.next_sample(),
            Err(Error::SampleDType {
                expected: DType::F64,
                actual: DType::I32,
                ..
            })
        ));
        assert!(matches!(
            session.next_sample(),
            Err(Error::HeaderMismatch(_, 2, 1))
        ));
    }

    #[test]
    fn test_session_duplicate_header() {
        let stream = Stream::from_fn("dup", &["x", "x"], || || None);
        assert!(matches!(
            Session::open(&stream),
            Err(Error::DuplicateFields { .. })
        ));
    }

    #[test]
    fn test_session_hooks_and_preprocessor() {
        let stream = Stream::from_fn("scaled", &["a"], || {
            let mut n = 0.0;
            move || {
                n += 1.0;
                (n < 3.0).then(|| Ok(Sample::from(vec![n])))
            }
        })
        .with_preprocessor(Arc::new(|| Box::new(Scale::new(10.0)) as Box<dyn Preprocessor>));

        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let events = events.clone();
            stream.add_open_hook(move || events.lock().push("open"));
        }
        {
            let events = events.clone();
            stream.add_close_hook(move || events.lock().push("close"));
        }

        {
            let mut session = Session::open(&stream).unwrap();
            assert_eq!(
                vec!["scaled_timestamp", "a"],
                session.tagged_header().unwrap().names()
            );
            assert_eq!(
                Sample::from(vec![10.0]),
                session.next_sample().unwrap().unwrap()
            );
            assert_eq!(
                Sample::from(vec![20.0]),
                session.next_sample().unwrap().unwrap()
            );
            assert!(session.next_sample().unwrap().is_none());
            assert_eq!(vec!["open"], *events.lock());
        }
        assert_eq!(vec!["open", "close"], *events.lock());
    }
}
