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
use std::{fmt, sync::Arc};

use crate::{
    error::Result,
    hooks::Hooks,
    preprocess::{Preprocessor, PreprocessorFactory},
    sample::Sample,
};

pub mod csv_fifo;
pub mod sources;
pub mod spec;

pub use spec::{SourceSpec, StreamSpec};

/// The producing side of one opened stream.
///
/// `header` is called exactly once, before any sample. `next_sample` blocks until a sample
/// is available and returns None once the source is exhausted.
pub trait Generator: Send {
    fn header(&mut self) -> Result<Vec<String>>;

    fn next_sample(&mut self) -> Option<Result<Sample>>;
}

type Opener = Arc<dyn Fn() -> Result<Box<dyn Generator>> + Send + Sync>;

/// A named, self-describing data source.
///
/// Opening a stream builds a new generator from the source's current state. A stream can be
/// opened again after it ends, but it is never rewound.
#[derive(Clone)]
pub struct Stream {
    name: String,
    rate: Option<f64>,
    opener: Opener,
    preprocessor: Option<PreprocessorFactory>,
    open_hooks: Hooks,
    close_hooks: Hooks,
}

impl Stream {
    /// Creates a stream from a generator constructor. Arguments of the generator are whatever
    /// the constructor captures.
    pub fn new<F>(name: &str, opener: F) -> Stream
    where
        F: Fn() -> Result<Box<dyn Generator>> + Send + Sync + 'static,
    {
        Stream {
            name: name.to_string(),
            rate: None,
            opener: Arc::new(opener),
            preprocessor: None,
            open_hooks: Hooks::new("stream open"),
            close_hooks: Hooks::new("stream close"),
        }
    }

    /// Creates a stream from a fixed header and a closure producing samples.
    pub fn from_fn<F, G>(name: &str, header: &[&str], make_next: F) -> Stream
    where
        F: Fn() -> G + Send + Sync + 'static,
        G: FnMut() -> Option<Result<Sample>> + Send + 'static,
    {
        let header: Vec<String> = header.iter().map(|name| name.to_string()).collect();
        Stream::new(name, move || {
            Ok(Box::new(sources::FnGenerator::new(header.clone(), make_next())) as Box<dyn Generator>)
        })
    }

    /// Declares the native production rate of the stream, in samples per second.
    pub fn with_rate(mut self, rate: f64) -> Stream {
        self.rate = Some(rate);
        self
    }

    /// Applies a fresh preprocessor from the factory to every sample of every run.
    pub fn with_preprocessor(mut self, factory: PreprocessorFactory) -> Stream {
        self.preprocessor = Some(factory);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Registers a hook run in the consuming worker before the first sample is requested.
    pub fn add_open_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.open_hooks.add(hook);
    }

    /// Registers a hook run in the consuming worker after the source ends or is cancelled.
    pub fn add_close_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.close_hooks.add(hook);
    }

    pub(crate) fn open_hooks(&self) -> &Hooks {
        &self.open_hooks
    }

    pub(crate) fn close_hooks(&self) -> &Hooks {
        &self.close_hooks
    }

    /// Opens a new, independent run of the source.
    pub fn open(&self) -> Result<Box<dyn Generator>> {
        (self.opener)()
    }

    /// Builds the preprocessor for one run, if the stream has one.
    pub(crate) fn build_preprocessor(&self) -> Option<Box<dyn Preprocessor>> {
        self.preprocessor.as_ref().map(|factory| factory())
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rate {
            Some(rate) => write!(f, "{} (@ {} Hz)", self.name, rate),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .finish()
    }
}
