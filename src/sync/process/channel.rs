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
use std::{
    fmt,
    io::{BufRead, BufReader, Read, Write},
    thread,
};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::Result, sample::DType};

/// Control messages between the parent and one stream worker process. Samples never travel
/// over the channel, only through the shared block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Worker to parent: the tagged header and dtype of the stream. The shared block is
    /// sized and holds the first sample.
    Header { fields: Vec<String>, dtype: DType },
    /// Worker to parent: the first sample was written.
    Started,
    /// Parent to worker: end the run.
    Stop,
    /// Worker to parent: the worker is leaving its loop, on any exit path.
    Exited,
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Header { fields, dtype } => {
                write!(f, "header({} {} fields)", fields.len(), dtype)
            }
            ControlMessage::Started => write!(f, "started"),
            ControlMessage::Stop => write!(f, "stop"),
            ControlMessage::Exited => write!(f, "exited"),
        }
    }
}

/// Writes control messages as JSON lines.
pub struct ControlSender<W: Write> {
    writer: W,
}

impl<W: Write> ControlSender<W> {
    pub fn new(writer: W) -> ControlSender<W> {
        ControlSender { writer }
    }

    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads control messages on a background thread so that loops can poll for them without
/// blocking. The receiver disconnects once the other end closes.
pub fn spawn_reader<R>(name: &str, reader: R) -> Result<Receiver<ControlMessage>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let name = name.to_string();
    thread::Builder::new()
        .name(format!("{}-control", name))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(stream = name, err = e.to_string(), "Control channel read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(message) => {
                        debug!(stream = name, message = message.to_string(), "Control message");
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(
                        stream = name,
                        line,
                        err = e.to_string(),
                        "Ignoring malformed control message"
                    ),
                }
            }
        })?;
    Ok(rx)
}
