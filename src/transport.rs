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

use tracing::debug;

use crate::{error::Result, sonification::Bundle};

pub mod mock;
pub mod osc;

/// Carries command bundles to the audio engine. Best effort: a sent bundle may be lost.
pub trait Transport: fmt::Display + Send + Sync {
    /// Sends a bundle, to be executed at the given time or as soon as possible.
    fn send(&self, bundle: &Bundle, at: Option<SystemTime>) -> Result<()>;
}

/// A transport that only logs what it would send.
pub struct LogTransport;

impl Transport for LogTransport {
    fn send(&self, bundle: &Bundle, at: Option<SystemTime>) -> Result<()> {
        for command in bundle.commands.iter() {
            debug!(
                address = command.address,
                args = format!("{:?}", command.args),
                at = format!("{:?}", at),
                "Command"
            );
        }
        Ok(())
    }
}

impl fmt::Display for LogTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log")
    }
}
