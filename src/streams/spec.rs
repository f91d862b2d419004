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
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{preprocess::PreprocessorSpec, sample::DType};

use super::{csv_fifo::CsvFifo, sources, Generator, Stream};

fn default_fps() -> f64 {
    30.0
}

fn default_amp() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_dtype() -> DType {
    DType::F64
}

fn default_step() -> f64 {
    1.0
}

/// A serializable description of a built-in source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Sine {
        #[serde(default = "default_fps")]
        fps: f64,
        #[serde(default = "default_amp")]
        amp: f64,
        #[serde(default = "default_true")]
        timestamps: bool,
    },
    SinCos {
        #[serde(default = "default_fps")]
        fps: f64,
        #[serde(default = "default_amp")]
        sin_amp: f64,
        #[serde(default = "default_amp")]
        cos_amp: f64,
        #[serde(default = "default_true")]
        timestamps: bool,
    },
    CsvFifo {
        path: PathBuf,
        #[serde(default = "default_dtype")]
        dtype: DType,
    },
    Ramp {
        #[serde(default = "default_fps")]
        fps: f64,
        fields: Vec<String>,
        #[serde(default = "default_dtype")]
        dtype: DType,
        #[serde(default)]
        start: f64,
        #[serde(default = "default_step")]
        step: f64,
        limit: Option<u64>,
        fail_after: Option<u64>,
    },
}

impl SourceSpec {
    /// The native rate of the source, if it has one.
    pub fn rate(&self) -> Option<f64> {
        match self {
            SourceSpec::Sine { fps, .. }
            | SourceSpec::SinCos { fps, .. }
            | SourceSpec::Ramp { fps, .. } => Some(*fps),
            SourceSpec::CsvFifo { .. } => None,
        }
    }

    fn generator(&self, name: &str) -> Box<dyn Generator> {
        match self.clone() {
            SourceSpec::Sine {
                fps,
                amp,
                timestamps,
            } => Box::new(sources::Sine::new(fps, amp, timestamps)),
            SourceSpec::SinCos {
                fps,
                sin_amp,
                cos_amp,
                timestamps,
            } => Box::new(sources::SinCos::new(fps, sin_amp, cos_amp, timestamps)),
            SourceSpec::CsvFifo { path, dtype } => Box::new(CsvFifo::new(name, path, dtype)),
            SourceSpec::Ramp {
                fps,
                fields,
                dtype,
                start,
                step,
                limit,
                fail_after,
            } => Box::new(sources::Ramp::new(
                name, fps, fields, dtype, start, step, limit, fail_after,
            )),
        }
    }
}

/// A serializable description of a stream, which is all a stream worker process needs to
/// rebuild the stream on its side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub preprocessor: Option<PreprocessorSpec>,
}

impl StreamSpec {
    pub fn new(name: &str, source: SourceSpec) -> StreamSpec {
        StreamSpec {
            name: name.to_string(),
            source,
            preprocessor: None,
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: PreprocessorSpec) -> StreamSpec {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn rate(&self) -> Option<f64> {
        self.source.rate()
    }

    /// Builds the stream.
    pub fn build(&self) -> Stream {
        let source = self.source.clone();
        let name = self.name.clone();
        let mut stream = Stream::new(&self.name, move || Ok(source.generator(&name)));
        if let Some(rate) = self.rate() {
            stream = stream.with_rate(rate);
        }
        if let Some(preprocessor) = self.preprocessor.as_ref() {
            stream = stream.with_preprocessor(preprocessor.factory());
        }
        stream
    }
}
