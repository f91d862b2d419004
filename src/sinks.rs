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
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    error::{Error, Result},
    sample::Record,
};

/// Receives every dispatched record, e.g. for presentation. Errors are not isolated from the
/// dispatch loop.
pub trait RecordSink: Send {
    fn feed(&mut self, record: &Record) -> Result<()>;
}

/// A shared, optional record sink.
pub type SharedSink = Arc<Mutex<Option<Box<dyn RecordSink>>>>;

/// Feeds a record into a shared sink, if one is set.
pub(crate) fn feed_shared(sink: &SharedSink, record: &Record) -> Result<()> {
    match sink.lock().as_mut() {
        Some(sink) => sink.feed(record),
        None => Ok(()),
    }
}

struct ActiveLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    first_line: bool,
}

/// Logs records as CSV rows. The first record after `start` writes the header row.
///
/// Clones share the same log, so the player can start and stop it while a worker feeds it.
#[derive(Clone, Default)]
pub struct CsvLogger {
    active: Arc<Mutex<Option<ActiveLog>>>,
}

impl CsvLogger {
    pub fn new() -> CsvLogger {
        CsvLogger::default()
    }

    pub fn is_logging(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Starts logging to the given path. Fails if already logging or if the file exists and
    /// `overwrite` is false.
    pub fn start(&self, path: &Path, overwrite: bool) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::AlreadyLogging);
        }
        if path.exists() && !overwrite {
            return Err(Error::FileExists(path.to_path_buf()));
        }

        let writer = csv::Writer::from_path(path)?;
        info!(path = path.display().to_string(), "Logging started");
        *active = Some(ActiveLog {
            path: path.to_path_buf(),
            writer,
            first_line: true,
        });
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut active = match self.active.lock().take() {
            Some(active) => active,
            None => return Err(Error::NotLogging),
        };
        active.writer.flush()?;
        info!(path = active.path.display().to_string(), "Logging stopped");
        Ok(())
    }

    /// Logs a record if logging is active.
    pub fn feed_if_active(&self, record: &Record) -> Result<()> {
        match self.active.lock().as_mut() {
            Some(active) => Self::write(active, record),
            None => Ok(()),
        }
    }

    fn write(active: &mut ActiveLog, record: &Record) -> Result<()> {
        if active.first_line {
            active.writer.write_record(record.header().names())?;
            active.first_line = false;
        }
        active
            .writer
            .write_record(record.values().iter().map(|value| value.to_string()))?;
        Ok(())
    }
}

impl RecordSink for CsvLogger {
    fn feed(&mut self, record: &Record) -> Result<()> {
        match self.active.lock().as_mut() {
            Some(active) => Self::write(active, record),
            None => Err(Error::NotLogging),
        }
    }
}
