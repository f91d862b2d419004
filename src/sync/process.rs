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
    io::Write,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tempfile::TempPath;
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::{
    error::{Error, Result},
    pacing::TickStats,
    playsync::{join_worker, RunFlag},
    preprocess::PreprocessorFactory,
    sample::{Header, Value},
    sinks::RecordSink,
    sonification::Dispatcher,
    streams::StreamSpec,
    thread_priority,
};

use super::{merge_worker, resolve_tick_rate, validate_names, Controls, SlotReader};

pub mod channel;
pub mod shm;
pub mod worker;

pub use channel::ControlMessage;
pub use shm::SharedBlock;
pub use worker::worker_main;

use channel::{spawn_reader, ControlSender};
use worker::epoch_seconds;

/// How long a blocked channel receive waits before re-checking the run flag.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The name of the hidden subcommand that runs a stream worker process.
pub const WORKER_COMMAND: &str = "stream-worker";

type SharedControl = Arc<Mutex<ControlSender<Box<dyn Write + Send>>>>;

fn send_stop(name: &str, control: &SharedControl) {
    if let Err(e) = control.lock().send(&ControlMessage::Stop) {
        debug!(stream = name, err = e.to_string(), "Stop not delivered");
    }
}

struct WorkerProcess {
    name: String,
    child: Child,
    control: SharedControl,
    /// Removed once the worker is reaped.
    _block: TempPath,
}

struct RunHandles {
    merge: JoinHandle<Result<()>>,
    workers: Vec<WorkerProcess>,
}

/// Merges N streams on a fixed tick like [super::ThreadSynchronizer], with every stream read
/// by its own worker process.
///
/// Workers re-execute the current binary (or the configured program) with the hidden
/// `stream-worker` subcommand and rebuild their stream from its [StreamSpec]. Each worker
/// writes its latest sample into a shared block. The control channel is the worker's stdin
/// and stdout.
pub struct ProcessSynchronizer {
    specs: Vec<StreamSpec>,
    program: Option<PathBuf>,
    controls: Controls,
    handles: Mutex<Option<RunHandles>>,
    span: Span,
}

impl ProcessSynchronizer {
    pub fn new(
        specs: Vec<StreamSpec>,
        dispatcher: Dispatcher,
        tick_rate: Option<f64>,
    ) -> Result<ProcessSynchronizer> {
        validate_names(specs.iter().map(|spec| spec.name.as_str()))?;
        let tick_rate = resolve_tick_rate(
            tick_rate,
            specs.iter().map(|spec| (spec.name.as_str(), spec.rate())),
        )?;
        info!(
            tick_rate,
            streams = specs.len(),
            "Created process synchronizer"
        );

        Ok(ProcessSynchronizer {
            specs,
            program: None,
            controls: Controls::new(dispatcher, tick_rate),
            handles: Mutex::new(None),
            span: span!(Level::INFO, "process synchronizer"),
        })
    }

    /// Sets the program run as stream worker. It must accept the `stream-worker` subcommand.
    /// Defaults to the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> ProcessSynchronizer {
        self.program = Some(program.into());
        self
    }

    /// Applies a preprocessor to every merged record. A fresh preprocessor is built from the
    /// factory at every listen.
    pub fn with_preprocessor(mut self, factory: PreprocessorFactory) -> ProcessSynchronizer {
        self.controls.preprocessor = Some(factory);
        self
    }

    pub fn specs(&self) -> &[StreamSpec] {
        &self.specs
    }

    pub fn tick_rate(&self) -> f64 {
        self.controls.tick_rate
    }

    pub fn is_listening(&self) -> bool {
        self.controls.flag.is_running()
    }

    pub fn add_listen_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.controls.listen_hooks.add(hook);
    }

    pub fn add_close_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.controls.close_hooks.add(hook);
    }

    pub fn set_feature_sink(&self, sink: Option<Box<dyn RecordSink>>) {
        *self.controls.sink.lock() = sink;
    }

    pub fn log_start(&self, path: &Path, overwrite: bool) -> Result<()> {
        self.controls.logger.start(path, overwrite)
    }

    pub fn log_stop(&self) -> Result<()> {
        self.controls.logger.stop()
    }

    pub fn stats(&self) -> &TickStats {
        &self.controls.stats
    }

    /// Takes the first worker error of the last run, if any.
    pub fn take_failure(&self) -> Option<Error> {
        self.controls.failure.take()
    }

    /// Starts a run: one worker process per stream plus the merge thread.
    pub fn listen(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut handles = self.handles.lock();
        if self.controls.flag.is_running() {
            return Err(Error::AlreadyListening);
        }
        if let Some(stale) = handles.take() {
            self.join(stale);
        }

        let program = match self.program.as_ref() {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        self.controls.listen_hooks.run();
        self.controls.stats.reset();
        self.controls.flag.raise();

        let start = Instant::now();
        let epoch = epoch_seconds(SystemTime::now());
        let mut workers = Vec::with_capacity(self.specs.len());
        let mut channels = Vec::with_capacity(self.specs.len());
        for spec in self.specs.iter() {
            match spawn_worker(&program, spec, epoch) {
                Ok((worker, channel)) => {
                    workers.push(worker);
                    channels.push(channel);
                }
                Err(e) => {
                    error!(stream = spec.name, err = e.to_string(), "Failed to spawn worker");
                    self.abort(workers);
                    return Err(e);
                }
            }
        }

        let context = self.controls.merge_context(start);
        let reader = BlockReader {
            streams: channels,
            flag: self.controls.flag.clone(),
        };
        let spawned = thread::Builder::new().name("merge".into()).spawn(move || {
            thread_priority::configure_merge_thread();
            merge_worker(context, reader)
        });
        let merge = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.abort(workers);
                return Err(e.into());
            }
        };

        *handles = Some(RunHandles { merge, workers });
        info!(
            streams = self.specs.len(),
            tick_rate = self.controls.tick_rate,
            "Listening"
        );
        Ok(())
    }

    /// Stops the run, joins the merge thread and reaps every worker process.
    pub fn close(&self) -> Result<()> {
        let _enter = self.span.enter();
        let mut handles = self.handles.lock();
        if !self.controls.flag.lower() {
            return Err(Error::NotListening);
        }

        info!("Closing");
        if let Some(run) = handles.take() {
            self.join(run);
        }
        self.controls.close_hooks.run();
        info!(
            ticks = self.controls.stats.ticks(),
            late = self.controls.stats.late(),
            "Closed"
        );
        Ok(())
    }

    /// Blocks until the current run ends on its own or is closed, then reaps its workers.
    pub fn wait(&self) {
        self.controls.flag.wait_lowered();
        let run = self.handles.lock().take();
        if let Some(run) = run {
            self.join(run);
        }
    }

    fn join(&self, run: RunHandles) {
        join_worker("merge", run.merge, &self.controls.failure);
        for mut worker in run.workers {
            // The merge thread already asked every worker to stop, unless it never got that far.
            send_stop(&worker.name, &worker.control);
            match worker.child.wait() {
                Ok(status) if status.success() => {
                    debug!(stream = worker.name, "Stream worker reaped")
                }
                Ok(status) => {
                    warn!(
                        stream = worker.name,
                        status = status.to_string(),
                        "Stream worker exited with failure"
                    );
                    self.controls.failure.record(Error::stream(
                        &worker.name,
                        format!("worker process {}", status),
                    ));
                }
                Err(e) => error!(
                    stream = worker.name,
                    err = e.to_string(),
                    "Failed to reap stream worker"
                ),
            }
        }
    }

    fn abort(&self, workers: Vec<WorkerProcess>) {
        self.controls.flag.lower();
        for mut worker in workers {
            if let Err(e) = worker.child.kill() {
                debug!(stream = worker.name, err = e.to_string(), "Kill failed");
            }
            let _ = worker.child.wait();
        }
    }
}

impl Drop for ProcessSynchronizer {
    fn drop(&mut self) {
        self.controls.flag.lower();
        if let Some(run) = self.handles.get_mut().take() {
            self.join(run);
        }
    }
}

/// The parent's end of one worker: where its block lives and how to talk to it.
struct StreamChannel {
    name: String,
    path: PathBuf,
    messages: Receiver<ControlMessage>,
    control: SharedControl,
    block: Option<SharedBlock>,
}

fn spawn_worker(
    program: &Path,
    spec: &StreamSpec,
    epoch: f64,
) -> Result<(WorkerProcess, StreamChannel)> {
    let block = tempfile::Builder::new()
        .prefix("sonisync-")
        .suffix(".block")
        .tempfile()?
        .into_temp_path();

    let mut child = Command::new(program)
        .arg(WORKER_COMMAND)
        .arg("--spec")
        .arg(serde_json::to_string(spec)?)
        .arg("--block")
        .arg(block.as_os_str())
        .arg("--start")
        .arg(epoch.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let (stdin, stdout) = match (stdin, stdout) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Other("worker pipes not captured".into()));
        }
    };
    let messages = spawn_reader(&spec.name, stdout)?;
    let control: SharedControl = Arc::new(Mutex::new(ControlSender::new(
        Box::new(stdin) as Box<dyn Write + Send>
    )));
    info!(stream = spec.name, pid = child.id(), "Spawned stream worker");

    let channel = StreamChannel {
        name: spec.name.clone(),
        path: block.to_path_buf(),
        messages,
        control: control.clone(),
        block: None,
    };
    let worker = WorkerProcess {
        name: spec.name.clone(),
        child,
        control,
        _block: block,
    };
    Ok((worker, channel))
}

/// Reads the shared blocks of every worker for the merge thread.
struct BlockReader {
    streams: Vec<StreamChannel>,
    flag: RunFlag,
}

impl BlockReader {
    /// Waits for the next message of one stream. Returns None if the run ended or the worker
    /// exited first.
    fn next_message(&self, stream: &StreamChannel) -> Result<Option<ControlMessage>> {
        loop {
            if !self.flag.is_running() {
                return Ok(None);
            }
            match stream.messages.recv_timeout(POLL_INTERVAL) {
                Ok(ControlMessage::Exited) => {
                    info!(stream = stream.name, "Stream worker exited before starting");
                    return Ok(None);
                }
                Ok(message) => return Ok(Some(message)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Protocol(
                        stream.name.clone(),
                        "channel closed".to_string(),
                    ))
                }
            }
        }
    }
}

impl SlotReader for BlockReader {
    fn wait_started(&mut self) -> Result<Option<Vec<Header>>> {
        let mut headers = Vec::with_capacity(self.streams.len());
        for i in 0..self.streams.len() {
            let stream = &self.streams[i];
            let (fields, dtype) = match self.next_message(stream)? {
                Some(ControlMessage::Header { fields, dtype }) => (fields, dtype),
                Some(message) => {
                    return Err(Error::Protocol(stream.name.clone(), message.to_string()))
                }
                None => return Ok(None),
            };
            let header = Header::new(&stream.name, fields)?;
            let block = SharedBlock::open(&stream.path, header.len().saturating_sub(1), dtype)?;
            self.streams[i].block = Some(block);
            headers.push(header);
        }

        for stream in self.streams.iter() {
            match self.next_message(stream)? {
                Some(ControlMessage::Started) => {}
                Some(message) => {
                    return Err(Error::Protocol(stream.name.clone(), message.to_string()))
                }
                None => return Ok(None),
            }
        }
        Ok(Some(headers))
    }

    fn poll(&mut self) -> bool {
        for stream in self.streams.iter() {
            loop {
                match stream.messages.try_recv() {
                    Ok(ControlMessage::Exited) => {
                        info!(stream = stream.name, "Stream worker exited");
                        return false;
                    }
                    Ok(message) => {
                        debug!(
                            stream = stream.name,
                            message = message.to_string(),
                            "Ignoring control message"
                        )
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!(stream = stream.name, "Control channel closed");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn read_into(&mut self, values: &mut Vec<Value>) -> Result<()> {
        for stream in self.streams.iter() {
            match stream.block.as_ref() {
                Some(block) => block.snapshot_into(values),
                None => {
                    return Err(Error::Protocol(
                        stream.name.clone(),
                        "no shared block".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        for stream in self.streams.iter() {
            send_stop(&stream.name, &stream.control);
        }
    }
}
