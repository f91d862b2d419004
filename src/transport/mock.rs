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
use std::{fmt, time::SystemTime};

use parking_lot::Mutex;

use crate::{error::Result, sonification::Bundle};

/// A mock transport. Doesn't send anything, keeps every bundle instead.
#[derive(Default)]
pub struct Transport {
    sent: Mutex<Vec<Bundle>>,
    times: Mutex<Vec<Option<SystemTime>>>,
}

impl Transport {
    pub fn new() -> Transport {
        Transport::default()
    }

    /// Every bundle sent so far, in order.
    pub fn sent(&self) -> Vec<Bundle> {
        self.sent.lock().clone()
    }

    /// The requested execution times of every bundle sent so far.
    pub fn times(&self) -> Vec<Option<SystemTime>> {
        self.times.lock().clone()
    }
}

impl super::Transport for Transport {
    fn send(&self, bundle: &Bundle, at: Option<SystemTime>) -> Result<()> {
        self.sent.lock().push(bundle.clone());
        self.times.lock().push(at);
        Ok(())
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock")
    }
}
