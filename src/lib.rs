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

//! Real-time synchronization and pacing of data streams for sonification.
//!
//! A [Player] dispatches every sample of one stream. A [ThreadSynchronizer] or
//! [ProcessSynchronizer] reads N streams concurrently and merges their latest samples into
//! one record per tick at a fixed rate. A [Replayer] paces recorded data through the same
//! dispatch contract, or renders it into an offline score.
pub mod config;
pub mod error;
pub mod hooks;
pub mod pacing;
pub mod player;
pub mod playsync;
pub mod preprocess;
pub mod replay;
pub mod sample;
pub mod sinks;
pub mod sonification;
pub mod streams;
pub mod sync;
pub mod thread_priority;
pub mod transport;

#[cfg(test)]
pub mod testutil;

pub use error::{Error, Result};
pub use player::Player;
pub use replay::{Replayer, Table};
pub use sample::{DType, Header, Record, Sample, Value};
pub use sonification::{Dispatcher, Sonification};
pub use streams::{Stream, StreamSpec};
pub use sync::{ProcessSynchronizer, ThreadSynchronizer};
