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
use std::time::Instant;

use crate::{
    error::{Error, Result},
    pacing::Interval,
    sample::{DType, Sample},
};

use super::Generator;

/// A generator driven by a closure.
pub struct FnGenerator<G> {
    header: Vec<String>,
    next: G,
}

impl<G> FnGenerator<G>
where
    G: FnMut() -> Option<Result<Sample>> + Send,
{
    pub fn new(header: Vec<String>, next: G) -> FnGenerator<G> {
        FnGenerator { header, next }
    }
}

impl<G> Generator for FnGenerator<G>
where
    G: FnMut() -> Option<Result<Sample>> + Send,
{
    fn header(&mut self) -> Result<Vec<String>> {
        Ok(self.header.clone())
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        (self.next)()
    }
}

/// Yields values of a sine wave varying with wall clock time.
pub struct Sine {
    amp: f64,
    timestamps: bool,
    interval: Interval,
    start: Option<Instant>,
}

impl Sine {
    pub fn new(fps: f64, amp: f64, timestamps: bool) -> Sine {
        Sine {
            amp,
            timestamps,
            interval: Interval::new(fps),
            start: None,
        }
    }
}

impl Generator for Sine {
    fn header(&mut self) -> Result<Vec<String>> {
        Ok(with_timestamp(self.timestamps, &["value"]))
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        if let Err(e) = self.interval.wait() {
            return Some(Err(e));
        }
        let t = self.start.get_or_insert_with(Instant::now).elapsed().as_secs_f64();
        let mut values = vec![t.sin() * self.amp];
        if self.timestamps {
            values.insert(0, t);
        }
        Some(Ok(Sample::from(values)))
    }
}

/// Yields a sine and a cosine varying with wall clock time.
pub struct SinCos {
    sin_amp: f64,
    cos_amp: f64,
    timestamps: bool,
    interval: Interval,
    start: Option<Instant>,
}

impl SinCos {
    pub fn new(fps: f64, sin_amp: f64, cos_amp: f64, timestamps: bool) -> SinCos {
        SinCos {
            sin_amp,
            cos_amp,
            timestamps,
            interval: Interval::new(fps),
            start: None,
        }
    }
}

impl Generator for SinCos {
    fn header(&mut self) -> Result<Vec<String>> {
        Ok(with_timestamp(self.timestamps, &["sin", "cos"]))
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        if let Err(e) = self.interval.wait() {
            return Some(Err(e));
        }
        let t = self.start.get_or_insert_with(Instant::now).elapsed().as_secs_f64();
        let mut values = vec![t.sin() * self.sin_amp, t.cos() * self.cos_amp];
        if self.timestamps {
            values.insert(0, t);
        }
        Some(Ok(Sample::from(values)))
    }
}

/// A deterministic counter: sample `n` holds `start + n * step` in every field.
pub struct Ramp {
    name: String,
    fields: Vec<String>,
    dtype: DType,
    start: f64,
    step: f64,
    limit: Option<u64>,
    fail_after: Option<u64>,
    interval: Interval,
    produced: u64,
}

impl Ramp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        fps: f64,
        fields: Vec<String>,
        dtype: DType,
        start: f64,
        step: f64,
        limit: Option<u64>,
        fail_after: Option<u64>,
    ) -> Ramp {
        Ramp {
            name: name.to_string(),
            fields,
            dtype,
            start,
            step,
            limit,
            fail_after,
            interval: Interval::new(fps),
            produced: 0,
        }
    }
}

impl Generator for Ramp {
    fn header(&mut self) -> Result<Vec<String>> {
        Ok(self.fields.clone())
    }

    fn next_sample(&mut self) -> Option<Result<Sample>> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return None;
        }
        if self.fail_after.is_some_and(|n| self.produced >= n) {
            return Some(Err(Error::stream(
                &self.name,
                format!("failed after {} samples", self.produced),
            )));
        }
        if let Err(e) = self.interval.wait() {
            return Some(Err(e));
        }
        let value = self.start + self.produced as f64 * self.step;
        self.produced += 1;
        Some(Ok(Sample::from_f64(
            self.dtype,
            &vec![value; self.fields.len()],
        )))
    }
}

fn with_timestamp(timestamps: bool, fields: &[&str]) -> Vec<String> {
    let mut header: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
    if timestamps {
        header.insert(0, "timestamp".to_string());
    }
    header
}
