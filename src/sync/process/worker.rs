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
    io::{self, Write},
    path::Path,
    time::{Duration, SystemTime},
};

use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, error, info, span, Level};

use crate::{
    error::{Error, Result},
    streams::StreamSpec,
    sync::{tag, Session},
};

use super::{
    channel::{spawn_reader, ControlMessage, ControlSender},
    shm::SharedBlock,
};

/// Converts seconds since the unix epoch into a system time.
pub fn start_from_epoch(seconds: f64) -> Result<SystemTime> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .and_then(|offset| SystemTime::UNIX_EPOCH.checked_add(offset))
        .ok_or_else(|| Error::Parse {
            field: "start".to_string(),
            value: seconds.to_string(),
        })
}

/// Seconds since the unix epoch.
pub fn epoch_seconds(at: SystemTime) -> f64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The entry point of a stream worker process: control messages come in on stdin and go out
/// on stdout. Logs must go to stderr.
pub fn worker_main(spec: &StreamSpec, block: &Path, start: SystemTime) -> Result<()> {
    let control = spawn_reader(&spec.name, io::stdin())?;
    run_worker(spec, block, start, control, io::stdout())
}

/// Runs one stream into its shared block until the source ends or a stop arrives.
/// `Exited` is sent on every exit path.
pub fn run_worker<W: Write>(
    spec: &StreamSpec,
    block: &Path,
    start: SystemTime,
    control: Receiver<ControlMessage>,
    out: W,
) -> Result<()> {
    let span = span!(Level::INFO, "stream worker", stream = spec.name);
    let _enter = span.enter();
    info!(pid = std::process::id(), "Stream worker process started");

    let mut sender = ControlSender::new(out);
    let result = stream_loop(spec, block, start, &control, &mut sender);

    if let Err(e) = sender.send(&ControlMessage::Exited) {
        debug!(err = e.to_string(), "Parent is gone, exit not sent");
    }
    match result.as_ref() {
        Ok(()) => info!("Stream worker process ended"),
        Err(e) => error!(err = e.to_string(), "Stream worker process failed"),
    }
    result
}

fn elapsed(start: SystemTime) -> f64 {
    SystemTime::now()
        .duration_since(start)
        .unwrap_or_default()
        .as_secs_f64()
}

fn stream_loop<W: Write>(
    spec: &StreamSpec,
    block: &Path,
    start: SystemTime,
    control: &Receiver<ControlMessage>,
    sender: &mut ControlSender<W>,
) -> Result<()> {
    let stream = spec.build();
    let mut session = Session::open(&stream)?;
    let header = session.tagged_header()?;

    // The dtype is only known once the first sample arrived, so the header follows it.
    let first = match session.next_sample()? {
        Some(sample) => sample,
        None => {
            info!("Stream ended before its first sample");
            return Ok(());
        }
    };
    let dtype = first.dtype();
    let mut shared = SharedBlock::create(block, first.len(), dtype)?;
    shared.write(elapsed(start), first.values())?;
    sender.send(&ControlMessage::Header {
        fields: header.names().to_vec(),
        dtype,
    })?;
    sender.send(&ControlMessage::Started)?;

    loop {
        loop {
            match control.try_recv() {
                Ok(ControlMessage::Stop) => {
                    info!("Stop received");
                    return Ok(());
                }
                Ok(message) => debug!(message = message.to_string(), "Ignoring control message"),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Control channel closed");
                    return Ok(());
                }
            }
        }

        let sample = match session.next_sample()? {
            Some(sample) => sample,
            None => {
                info!("Stream exhausted");
                return Ok(());
            }
        };
        let values = tag(elapsed(start), sample);
        shared.write(values[0].as_f64(), &values[1..])?;
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::{self, Write},
        sync::Arc,
        thread,
        time::{Duration, SystemTime},
    };

    use parking_lot::Mutex;

    use crate::{
        error::Error,
        sample::DType,
        sync::process::{channel::ControlMessage, shm::SharedBlock},
        testutil::ramp_spec,
    };

    use super::{epoch_seconds, run_worker, start_from_epoch};

    #[test]
    fn test_start_from_epoch() {
        let now = SystemTime::now();
        let start = start_from_epoch(epoch_seconds(now)).unwrap();
        let drift = match start.duration_since(now) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        assert!(drift < Duration::from_millis(1));
        for bad in [-1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(matches!(start_from_epoch(bad), Err(Error::Parse { .. })));
        }
    }

    #[derive(Clone, Default)]
    struct Out(Arc<Mutex<Vec<u8>>>);

    impl Write for Out {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Out {
        fn messages(&self) -> Vec<ControlMessage> {
            String::from_utf8(self.0.lock().clone())
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_worker_handshake_and_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        let (_tx, rx) = crossbeam_channel::unbounded();
        let out = Out::default();

        run_worker(
            &ramp_spec("r", 1000.0, &["a", "b"], Some(4), None),
            &path,
            SystemTime::now(),
            rx,
            out.clone(),
        )
        .unwrap();

        assert_eq!(
            vec![
                ControlMessage::Header {
                    fields: vec!["r_timestamp".into(), "a".into(), "b".into()],
                    dtype: DType::F64,
                },
                ControlMessage::Started,
                ControlMessage::Exited,
            ],
            out.messages()
        );
        let block = SharedBlock::open(&path, 2, DType::F64).unwrap();
        let (elapsed, values) = block.snapshot();
        assert!(elapsed >= 0.0);
        assert_eq!(3.0, values[1].as_f64());
    }

    #[test]
    fn test_worker_stops_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        let (tx, rx) = crossbeam_channel::unbounded();
        let out = Out::default();

        let join = {
            let out = out.clone();
            thread::spawn(move || {
                run_worker(
                    &ramp_spec("r", 100.0, &["a"], None, None),
                    &path,
                    SystemTime::now(),
                    rx,
                    out,
                )
            })
        };

        thread::sleep(Duration::from_millis(50));
        tx.send(ControlMessage::Started).unwrap();
        tx.send(ControlMessage::Stop).unwrap();
        join.join().unwrap().unwrap();
        assert_eq!(Some(&ControlMessage::Exited), out.messages().last());
    }

    #[test]
    fn test_worker_failure_still_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block");
        let (_tx, rx) = crossbeam_channel::unbounded();
        let out = Out::default();

        let result = run_worker(
            &ramp_spec("r", 1000.0, &["a"], None, Some(2)),
            &path,
            SystemTime::now(),
            rx,
            out.clone(),
        );
        assert!(result.is_err());
        assert_eq!(Some(&ControlMessage::Exited), out.messages().last());
    }
}
