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
use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;

use crate::sample::Record;

use super::{Arg, Bundle, Command};

/// A call received by the mock sonification.
#[derive(Clone, Debug)]
pub enum Call {
    Start,
    Stop,
    Process(Record, Instant),
}

/// A sonification that records every call. Clones share the same call list.
#[derive(Clone, Default)]
pub struct Sonification {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Sonification {
    pub fn new() -> Sonification {
        Sonification::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Every record processed so far.
    pub fn records(&self) -> Vec<Record> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Process(record, _) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// The instants at which records were processed.
    pub fn process_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Process(_, at) => Some(*at),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self) -> usize {
        self.count(|call| matches!(call, Call::Start))
    }

    pub fn stops(&self) -> usize {
        self.count(|call| matches!(call, Call::Stop))
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }
}

impl super::Sonification for Sonification {
    fn start(&mut self) -> Bundle {
        self.calls.lock().push(Call::Start);
        Command::new("/start", vec![]).into()
    }

    fn stop(&mut self) -> Bundle {
        self.calls.lock().push(Call::Stop);
        Command::new("/stop", vec![]).into()
    }

    fn process(&mut self, record: &Record) -> Bundle {
        self.calls
            .lock()
            .push(Call::Process(record.clone(), Instant::now()));
        Command::new(
            "/process",
            record.values().iter().map(|v| Arg::Double(v.as_f64())).collect(),
        )
        .into()
    }
}
