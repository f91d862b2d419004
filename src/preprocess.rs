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
use std::{collections::VecDeque, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::sample::{Header, Value};

/// Transforms values in place before they are exposed downstream. A preprocessor may change
/// values but never the number of fields, and values keep their dtype.
pub trait Preprocessor: Send {
    fn preprocess(&mut self, header: &Header, values: &mut [Value]);
}

/// Builds a fresh preprocessor for every run.
pub type PreprocessorFactory = Arc<dyn Fn() -> Box<dyn Preprocessor> + Send + Sync>;

/// Replaces every field with the mean of its last `window` values.
pub struct MovingAverage {
    window: usize,
    history: Vec<VecDeque<f64>>,
}

impl MovingAverage {
    pub fn new(window: usize) -> MovingAverage {
        MovingAverage {
            window: window.max(1),
            history: Vec::new(),
        }
    }
}

impl Preprocessor for MovingAverage {
    fn preprocess(&mut self, _: &Header, values: &mut [Value]) {
        if self.history.len() != values.len() {
            self.history = vec![VecDeque::with_capacity(self.window); values.len()];
        }
        for (value, history) in values.iter_mut().zip(self.history.iter_mut()) {
            if history.len() == self.window {
                history.pop_front();
            }
            history.push_back(value.as_f64());
            let mean = history.iter().sum::<f64>() / history.len() as f64;
            *value = Value::from_f64(value.dtype(), mean);
        }
    }
}

/// Multiplies every field by a constant, skipping elapsed time fields.
pub struct Scale {
    factor: f64,
}

impl Scale {
    pub fn new(factor: f64) -> Scale {
        Scale { factor }
    }
}

impl Preprocessor for Scale {
    fn preprocess(&mut self, header: &Header, values: &mut [Value]) {
        for (name, value) in header.names().iter().zip(values.iter_mut()) {
            if name.ends_with("timestamp") {
                continue;
            }
            *value = Value::from_f64(value.dtype(), value.as_f64() * self.factor);
        }
    }
}

/// A serializable description of a built-in preprocessor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreprocessorSpec {
    MovingAverage { window: usize },
    Scale { factor: f64 },
}

impl PreprocessorSpec {
    pub fn build(&self) -> Box<dyn Preprocessor> {
        match self {
            PreprocessorSpec::MovingAverage { window } => Box::new(MovingAverage::new(*window)),
            PreprocessorSpec::Scale { factor } => Box::new(Scale::new(*factor)),
        }
    }

    pub fn factory(&self) -> PreprocessorFactory {
        let spec = self.clone();
        Arc::new(move || spec.build())
    }
}
