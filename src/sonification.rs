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
use std::{sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{error::Result, sample::Record, transport::Transport};

pub mod mock;

/// One argument of a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
}

/// One command for the audio engine: an address and its arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub address: String,
    pub args: Vec<Arg>,
}

impl Command {
    pub fn new(address: &str, args: Vec<Arg>) -> Command {
        Command {
            address: address.to_string(),
            args,
        }
    }
}

/// An ordered group of commands meant to be executed together. The dispatch core never looks
/// inside a bundle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub commands: Vec<Command>,
}

impl Bundle {
    pub fn new(commands: Vec<Command>) -> Bundle {
        Bundle { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl From<Command> for Bundle {
    fn from(command: Command) -> Bundle {
        Bundle {
            commands: vec![command],
        }
    }
}

/// Turns records into timed commands for an audio engine.
///
/// All three methods are called from the dispatch worker's thread.
pub trait Sonification: Send {
    /// Commands sent when a run starts.
    fn start(&mut self) -> Bundle;

    /// Commands sent when a run stops.
    fn stop(&mut self) -> Bundle;

    /// Commands updating the sonification for one record.
    fn process(&mut self, record: &Record) -> Bundle;
}

/// Pairs a sonification with the transport its bundles are sent through. Bundles are sent
/// unmodified and in the order they are produced.
#[derive(Clone)]
pub struct Dispatcher {
    sonification: Arc<Mutex<Box<dyn Sonification>>>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(sonification: Box<dyn Sonification>, transport: Arc<dyn Transport>) -> Dispatcher {
        Dispatcher {
            sonification: Arc::new(Mutex::new(sonification)),
            transport,
        }
    }

    pub fn start(&self) -> Result<()> {
        let bundle = self.sonification.lock().start();
        self.transport.send(&bundle, None)
    }

    pub fn stop(&self) -> Result<()> {
        let bundle = self.sonification.lock().stop();
        self.transport.send(&bundle, None)
    }

    pub fn process(&self, record: &Record) -> Result<()> {
        self.process_at(record, None)
    }

    /// Processes a record whose commands should be executed at the given time.
    pub fn process_at(&self, record: &Record, at: Option<SystemTime>) -> Result<()> {
        let bundle = self.sonification.lock().process(record);
        self.transport.send(&bundle, at)
    }
}

/// A generic sonification: creates one synth on start, sets one control per record field,
/// frees the synth on stop.
pub struct FieldMapping {
    synth: String,
    node: i32,
    fields: Option<Vec<String>>,
}

impl FieldMapping {
    pub fn new(synth: &str, node: i32, fields: Option<Vec<String>>) -> FieldMapping {
        FieldMapping {
            synth: synth.to_string(),
            node,
            fields,
        }
    }
}

impl Sonification for FieldMapping {
    fn start(&mut self) -> Bundle {
        Command::new(
            "/s_new",
            vec![
                Arg::String(self.synth.clone()),
                Arg::Int(self.node),
                Arg::Int(0),
                Arg::Int(0),
            ],
        )
        .into()
    }

    fn stop(&mut self) -> Bundle {
        Command::new("/n_free", vec![Arg::Int(self.node)]).into()
    }

    fn process(&mut self, record: &Record) -> Bundle {
        let mut args = vec![Arg::Int(self.node)];
        for (name, value) in record.header().names().iter().zip(record.values()) {
            if self
                .fields
                .as_ref()
                .is_some_and(|fields| !fields.contains(name))
            {
                continue;
            }
            args.push(Arg::String(name.clone()));
            args.push(Arg::Float(value.as_f64() as f32));
        }
        Command::new("/n_set", args).into()
    }
}
