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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, span, Level, Span};

use crate::{
    error::{Error, Result},
    pacing,
    playsync::{join_worker, RunFlag, WorkerFailure},
    sample::{Header, Record, Value},
    sinks::{feed_shared, RecordSink, SharedSink},
    sonification::{Arg, Bundle, Command, Dispatcher, Sonification},
};

/// A finite table of recorded data, one f64 value per cell.
pub struct Table {
    header: Arc<Header>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(header: Header, rows: Vec<Vec<f64>>) -> Result<Table> {
        let rows = rows
            .into_iter()
            .map(|row| {
                if row.len() == header.len() {
                    Ok(row.into_iter().map(Value::F64).collect())
                } else {
                    Err(Error::HeaderMismatch(
                        "table".to_string(),
                        header.len(),
                        row.len(),
                    ))
                }
            })
            .collect::<Result<Vec<Vec<Value>>>>()?;
        Ok(Table {
            header: Arc::new(header),
            rows,
        })
    }

    /// Reads a CSV file with a header row. Whitespace around cells is ignored.
    pub fn from_csv(path: &Path) -> Result<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let header = Header::new(
            &path.display().to_string(),
            reader.headers()?.iter().map(str::to_string),
        )?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = record
                .iter()
                .zip(header.names())
                .map(|(cell, field)| {
                    cell.parse::<f64>().map_err(|_| Error::Parse {
                        field: field.clone(),
                        value: cell.to_string(),
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        info!(
            path = path.display().to_string(),
            rows = rows.len(),
            "Loaded table"
        );
        Table::new(header, rows)
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record(&self, index: usize) -> Record {
        Record::new(self.header.clone(), self.rows[index].clone())
    }

    fn value(&self, index: usize, column: usize) -> f64 {
        self.rows[index][column].as_f64()
    }
}

/// How row times are derived.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Timing {
    /// Rows are evenly spaced at a static frame rate.
    Fps(f64),
    /// Row times are read from a monotonic column, by index.
    Column(usize),
}

struct Loaded {
    table: Table,
    timing: Timing,
}

impl Loaded {
    /// The time of a row relative to the first row, at rate 1.
    fn offset(&self, index: usize) -> f64 {
        match self.timing {
            Timing::Fps(fps) => index as f64 / fps,
            Timing::Column(column) => {
                self.table.value(index, column) - self.table.value(0, column)
            }
        }
    }
}

/// A bundle of the offline score and its time in seconds from the start of the score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimedBundle {
    pub time: f64,
    pub bundle: Bundle,
}

/// Replays recorded data through the same dispatch contract as the live players.
///
/// Rows are paced on the wall clock, either at a static frame rate or following a timestamp
/// column. The rate scales playback and a negative rate plays backwards from the current
/// position. Seeking and rate changes while playing restart the replay transparently.
pub struct Replayer {
    dispatcher: Dispatcher,
    data: Mutex<Option<Arc<Loaded>>>,
    position: Arc<AtomicUsize>,
    rate: Mutex<f64>,
    flag: RunFlag,
    sink: SharedSink,
    failure: WorkerFailure,
    join: Mutex<Option<JoinHandle<Result<()>>>>,
    span: Span,
}

impl Replayer {
    pub fn new(dispatcher: Dispatcher) -> Replayer {
        Replayer {
            dispatcher,
            data: Mutex::new(None),
            position: Arc::new(AtomicUsize::new(0)),
            rate: Mutex::new(1.0),
            flag: RunFlag::new(),
            sink: Arc::new(Mutex::new(None)),
            failure: WorkerFailure::new(),
            join: Mutex::new(None),
            span: span!(Level::INFO, "replayer"),
        }
    }

    /// Loads a table. Rows are timed at the given frame rate, or by the `time_label` column if
    /// no frame rate is given. Rewinds to the first row.
    pub fn load(&self, table: Table, fps: Option<f64>, time_label: &str) -> Result<()> {
        let _enter = self.span.enter();
        if self.is_playing() {
            return Err(Error::Busy("load data"));
        }
        if table.is_empty() {
            return Err(Error::NoData);
        }
        let timing = match fps {
            Some(fps) if pacing::valid_rate(fps) => Timing::Fps(fps),
            Some(fps) => return Err(Error::InvalidTickRate(fps)),
            None => Timing::Column(
                table
                    .header()
                    .position(time_label)
                    .ok_or_else(|| Error::MissingColumn(time_label.to_string()))?,
            ),
        };

        info!(rows = table.len(), timing = format!("{:?}", timing), "Data loaded");
        *self.data.lock() = Some(Arc::new(Loaded { table, timing }));
        self.position.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.flag.is_running()
    }

    /// The index of the row last dispatched, or the seek target.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        *self.rate.lock()
    }

    pub fn set_feature_sink(&self, sink: Option<Box<dyn RecordSink>>) {
        *self.sink.lock() = sink;
    }

    /// Takes the first error of the last replay, if any.
    pub fn take_failure(&self) -> Option<Error> {
        self.failure.take()
    }

    /// Starts playback from the current position.
    pub fn play(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut join = self.join.lock();
        if self.flag.is_running() {
            return Err(Error::AlreadyPlaying);
        }
        if let Some(stale) = join.take() {
            join_worker("replayer", stale, &self.failure);
        }
        let data = self.data.lock().clone().ok_or(Error::NoData)?;

        let worker = ReplayWorker {
            dispatcher: self.dispatcher.clone(),
            data,
            position: self.position.clone(),
            rate: *self.rate.lock(),
            flag: self.flag.clone(),
            sink: self.sink.clone(),
        };
        self.flag.raise();
        match thread::Builder::new()
            .name("replayer".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *join = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.flag.lower();
                Err(e.into())
            }
        }
    }

    /// Stops playback, keeping the position.
    pub fn pause(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut join = self.join.lock();
        if !self.flag.lower() {
            return Err(Error::AlreadyPaused);
        }
        if let Some(handle) = join.take() {
            join_worker("replayer", handle, &self.failure);
        }
        info!(position = self.position(), "Paused");
        Ok(())
    }

    /// Blocks until playback reaches the end of the table or is paused.
    pub fn wait(&self) {
        self.flag.wait_lowered();
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            join_worker("replayer", handle, &self.failure);
        }
    }

    /// Moves to the row at the given index.
    pub fn seek(&self, index: usize) -> Result<()> {
        let data = self.loaded()?;
        let last = data.table.len() - 1;
        if index > last {
            return Err(Error::SeekOutOfRange {
                target: index as f64,
                max: last as f64,
            });
        }
        self.restart_with(|| self.position.store(index, Ordering::Relaxed))
    }

    /// Moves to the first row at or after the given time, in seconds of data time.
    pub fn seek_time(&self, time: f64) -> Result<()> {
        let data = self.loaded()?;
        let table = &data.table;
        let last = table.len() - 1;
        let max = match data.timing {
            Timing::Fps(fps) => last as f64 / fps,
            Timing::Column(column) => table.value(last, column),
        };
        if !(0.0..=max).contains(&time) {
            return Err(Error::SeekOutOfRange { target: time, max });
        }

        let index = match data.timing {
            Timing::Fps(fps) => (time * fps) as usize,
            Timing::Column(column) => table
                .rows
                .partition_point(|row| row[column].as_f64() < time),
        };
        self.seek(index.min(last))
    }

    /// Changes the playback rate. Negative rates play backwards, zero is rejected.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        if !pacing::valid_rate(rate.abs()) {
            return Err(Error::InvalidRate(rate));
        }
        self.restart_with(|| *self.rate.lock() = rate)
    }

    /// Renders the whole table into an offline score at the given positive rate. The stop
    /// bundle is due with the last row and a closing `/c_set` follows after `end_delay`.
    pub fn export(
        &self,
        sonification: &mut dyn Sonification,
        rate: f64,
        end_delay: Duration,
    ) -> Result<Vec<TimedBundle>> {
        if !pacing::valid_rate(rate) {
            return Err(Error::InvalidRate(rate));
        }
        let data = self.loaded()?;

        let mut score = Vec::with_capacity(data.table.len() + 3);
        score.push(TimedBundle {
            time: 0.0,
            bundle: sonification.start(),
        });
        let mut last = 0.0;
        for index in 0..data.table.len() {
            last = data.offset(index) / rate;
            score.push(TimedBundle {
                time: last,
                bundle: sonification.process(&data.table.record(index)),
            });
        }
        score.push(TimedBundle {
            time: last,
            bundle: sonification.stop(),
        });
        score.push(TimedBundle {
            time: last + end_delay.as_secs_f64(),
            bundle: Command::new("/c_set", vec![Arg::Int(0), Arg::Int(0)]).into(),
        });
        Ok(score)
    }

    fn loaded(&self) -> Result<Arc<Loaded>> {
        self.data.lock().clone().ok_or(Error::NoData)
    }

    /// Applies a change, pausing and resuming around it if playing.
    fn restart_with(&self, change: impl FnOnce()) -> Result<()> {
        let was_playing = self.pause().is_ok();
        change();
        if was_playing {
            self.play()
        } else {
            Ok(())
        }
    }
}

impl Drop for Replayer {
    fn drop(&mut self) {
        self.flag.lower();
        if let Some(handle) = self.join.get_mut().take() {
            join_worker("replayer", handle, &self.failure);
        }
    }
}

struct ReplayWorker {
    dispatcher: Dispatcher,
    data: Arc<Loaded>,
    position: Arc<AtomicUsize>,
    rate: f64,
    flag: RunFlag,
    sink: SharedSink,
}

impl ReplayWorker {
    fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "replay", rate = self.rate);
        let _enter = span.enter();
        info!(position = self.position.load(Ordering::Relaxed), "Replay started");

        let result = self.replay();
        self.flag.lower();
        let stopped = self.dispatcher.stop();
        info!(position = self.position.load(Ordering::Relaxed), "Replay ended");
        result.and(stopped)
    }

    fn replay(&self) -> Result<()> {
        self.dispatcher.start()?;

        let table = &self.data.table;
        let start = self.position.load(Ordering::Relaxed);
        let rows: Box<dyn Iterator<Item = usize>> = if self.rate > 0.0 {
            Box::new(start..table.len())
        } else {
            Box::new((0..=start).rev())
        };
        let start_offset = self.data.offset(start);
        let t0 = Instant::now();
        let wall0 = SystemTime::now();

        for (visited, index) in rows.enumerate() {
            if !self.flag.is_running() {
                break;
            }
            let target = match self.data.timing {
                Timing::Fps(fps) => visited as f64 / fps / self.rate.abs(),
                Timing::Column(_) => (self.data.offset(index) - start_offset) / self.rate,
            };
            // Row offsets divided by a slow rate can outgrow the clock.
            let target = target.max(0.0);
            let deadline =
                pacing::instant_after(t0, target).ok_or(Error::InvalidRate(self.rate))?;
            let at = Duration::try_from_secs_f64(target)
                .ok()
                .and_then(|offset| wall0.checked_add(offset))
                .ok_or(Error::InvalidRate(self.rate))?;

            let record = table.record(index);
            self.dispatcher.process_at(&record, Some(at))?;
            feed_shared(&self.sink, &record)?;
            self.position.store(index, Ordering::Relaxed);

            if !pacing::sleep_until(&self.flag, deadline) {
                break;
            }
        }
        Ok(())
    }
}
