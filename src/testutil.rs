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
mod polling;

pub use polling::{eventually, eventually_within};

use crate::{
    sample::DType,
    streams::{SourceSpec, Stream, StreamSpec},
};

/// A ramp source counting up from zero in every field.
pub fn ramp_spec(
    name: &str,
    fps: f64,
    fields: &[&str],
    limit: Option<u64>,
    fail_after: Option<u64>,
) -> StreamSpec {
    StreamSpec::new(
        name,
        SourceSpec::Ramp {
            fps,
            fields: fields.iter().map(|field| field.to_string()).collect(),
            dtype: DType::F64,
            start: 0.0,
            step: 1.0,
            limit,
            fail_after,
        },
    )
}

/// A built ramp stream, see [ramp_spec].
pub fn ramp(
    name: &str,
    fps: f64,
    fields: &[&str],
    limit: Option<u64>,
    fail_after: Option<u64>,
) -> Stream {
    ramp_spec(name, fps, fields, limit, fail_after).build()
}
