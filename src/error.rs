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

use crate::sample::DType;

/// Errors raised by players, synchronizers and their collaborators.
///
/// Configuration errors are fatal and detected eagerly. State errors are
/// returned to the caller without changing any state. Source errors end the
/// run of the stream that raised them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicated field names in header of {context}: {names:?}")]
    DuplicateFields { context: String, names: Vec<String> },

    #[error("duplicated stream name: {0}")]
    DuplicateStream(String),

    #[error("stream {stream}: sample has {actual} values, expected {expected}")]
    SampleLength {
        stream: String,
        expected: usize,
        actual: usize,
    },

    #[error("stream {stream}: sample has dtype {actual}, expected {expected}")]
    SampleDType {
        stream: String,
        expected: DType,
        actual: DType,
    },

    #[error("stream {0}: header has {1} fields but sample has {2} values")]
    HeaderMismatch(String, usize, usize),

    #[error("empty list of streams")]
    NoStreams,

    #[error("invalid tick rate {0}, must be positive with a representable tick period")]
    InvalidTickRate(f64),

    #[error("tick rate not given and stream {0} has no known rate")]
    UnknownRate(String),

    #[error("invalid playback rate {0}")]
    InvalidRate(f64),

    #[error("seek target {target} out of range [0, {max}]")]
    SeekOutOfRange { target: f64, max: f64 },

    #[error("column {0} not found")]
    MissingColumn(String),

    #[error("no data loaded")]
    NoData,

    #[error("already listening")]
    AlreadyListening,

    #[error("already closed")]
    NotListening,

    #[error("already playing")]
    AlreadyPlaying,

    #[error("already paused")]
    AlreadyPaused,

    #[error("cannot {0} while playing")]
    Busy(&'static str),

    #[error("already logging")]
    AlreadyLogging,

    #[error("start logger first")]
    NotLogging,

    #[error("{0} already exists, use overwrite to replace it")]
    FileExists(PathBuf),

    #[error("stream {0}: source ended before producing a header")]
    MissingHeader(String),

    #[error("stream {stream}: {message}")]
    Source { stream: String, message: String },

    #[error("stream {0}: unexpected control message {1}")]
    Protocol(String, String),

    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),

    #[error("invalid value {value:?} for field {field}")]
    Parse { field: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config load/parse error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Builds a source error for the given stream.
    pub fn stream(stream: &str, message: impl ToString) -> Error {
        Error::Source {
            stream: stream.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
