// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
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
    path::{Path, PathBuf},
    time::Duration,
};

use ::config::{Config, Environment, File, Source};
use duration_string::DurationString;
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{Error, Result},
    pacing::TickStats,
    player::Player,
    preprocess::PreprocessorSpec,
    sonification::Dispatcher,
    streams::StreamSpec,
    sync::{ProcessSynchronizer, ThreadSynchronizer},
};

mod transport;

pub use self::transport::{dispatcher, SonificationConfig, TransportConfig};

/// Prefix of environment variables overriding configuration, e.g. `SONISYNC__TICK_RATE=20`.
const ENV_PREFIX: &str = "SONISYNC";

/// How streams are isolated from each other.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One stream, read and dispatched by a single worker.
    Single,
    /// One thread per stream.
    #[default]
    Threads,
    /// One process per stream.
    Processes,
}

/// A YAML representation of a synchronizer run.
#[derive(Deserialize, Clone, Debug)]
pub struct SyncConfig {
    #[serde(default)]
    mode: Mode,

    /// Merged records per second. Inferred from the fastest stream if unset.
    tick_rate: Option<f64>,

    #[serde(default)]
    streams: Vec<StreamSpec>,

    /// Applied to every merged record.
    preprocessor: Option<PreprocessorSpec>,

    /// CSV log of every dispatched record.
    log: Option<PathBuf>,

    /// Replace existing log files.
    #[serde(default)]
    overwrite_logs: bool,

    #[serde(default)]
    transport: TransportConfig,

    #[serde(default)]
    sonification: SonificationConfig,

    /// How long to run, e.g. `10s`. Runs until interrupted or a source ends if unset.
    duration: Option<String>,
}

impl SyncConfig {
    /// Loads the configuration from a YAML file, with environment overrides.
    pub fn load(path: &Path) -> Result<SyncConfig> {
        let config = SyncConfig::from_sources(
            File::from(path),
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )?;
        info!(
            path = path.display().to_string(),
            mode = format!("{:?}", config.mode),
            streams = config.streams.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn from_sources<F, E>(file: F, environment: E) -> Result<SyncConfig>
    where
        F: Source + Send + Sync + 'static,
        E: Source + Send + Sync + 'static,
    {
        Ok(Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize::<SyncConfig>()?)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tick_rate(&self) -> Option<f64> {
        self.tick_rate
    }

    pub fn streams(&self) -> &[StreamSpec] {
        &self.streams
    }

    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn sonification(&self) -> &SonificationConfig {
        &self.sonification
    }

    /// The run duration, if any.
    pub fn duration(&self) -> Result<Option<Duration>> {
        match &self.duration {
            Some(duration) => Ok(Some(
                DurationString::from_string(duration.clone())
                    .map_err(|_| Error::Parse {
                        field: "duration".to_string(),
                        value: duration.clone(),
                    })?
                    .into(),
            )),
            None => Ok(None),
        }
    }

    pub fn dispatcher(&self) -> Result<Dispatcher> {
        dispatcher(&self.sonification, &self.transport)
    }

    /// Builds the configured player or synchronizer and starts its log, if any.
    pub fn build(&self) -> Result<Runner> {
        let dispatcher = self.dispatcher()?;
        let runner = match self.mode {
            Mode::Single => {
                let spec = match self.streams.as_slice() {
                    [] => return Err(Error::NoStreams),
                    [spec] => spec,
                    _ => {
                        return Err(Error::Other(format!(
                            "single mode takes one stream, got {}",
                            self.streams.len()
                        )))
                    }
                };
                Runner::Single(Player::new(spec.build(), dispatcher))
            }
            Mode::Threads => {
                let streams = self.streams.iter().map(StreamSpec::build).collect();
                let mut sync = ThreadSynchronizer::new(streams, dispatcher, self.tick_rate)?;
                if let Some(preprocessor) = self.preprocessor.as_ref() {
                    sync = sync.with_preprocessor(preprocessor.factory());
                }
                Runner::Threads(sync)
            }
            Mode::Processes => {
                let mut sync =
                    ProcessSynchronizer::new(self.streams.clone(), dispatcher, self.tick_rate)?;
                if let Some(preprocessor) = self.preprocessor.as_ref() {
                    sync = sync.with_preprocessor(preprocessor.factory());
                }
                Runner::Processes(sync)
            }
        };

        if let Some(log) = self.log.as_ref() {
            runner.log_start(log, self.overwrite_logs)?;
        }
        Ok(runner)
    }
}

/// A configured player or synchronizer.
pub enum Runner {
    Single(Player),
    Threads(ThreadSynchronizer),
    Processes(ProcessSynchronizer),
}

impl Runner {
    pub fn listen(&self) -> Result<()> {
        match self {
            Runner::Single(player) => player.listen(),
            Runner::Threads(sync) => sync.listen(),
            Runner::Processes(sync) => sync.listen(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Runner::Single(player) => player.close(),
            Runner::Threads(sync) => sync.close(),
            Runner::Processes(sync) => sync.close(),
        }
    }

    pub fn wait(&self) {
        match self {
            Runner::Single(player) => player.wait(),
            Runner::Threads(sync) => sync.wait(),
            Runner::Processes(sync) => sync.wait(),
        }
    }

    pub fn is_listening(&self) -> bool {
        match self {
            Runner::Single(player) => player.is_listening(),
            Runner::Threads(sync) => sync.is_listening(),
            Runner::Processes(sync) => sync.is_listening(),
        }
    }

    pub fn log_start(&self, path: &Path, overwrite: bool) -> Result<()> {
        match self {
            Runner::Single(player) => player.log_start(path, overwrite),
            Runner::Threads(sync) => sync.log_start(path, overwrite),
            Runner::Processes(sync) => sync.log_start(path, overwrite),
        }
    }

    pub fn log_stop(&self) -> Result<()> {
        match self {
            Runner::Single(player) => player.log_stop(),
            Runner::Threads(sync) => sync.log_stop(),
            Runner::Processes(sync) => sync.log_stop(),
        }
    }

    pub fn stats(&self) -> &TickStats {
        match self {
            Runner::Single(player) => player.stats(),
            Runner::Threads(sync) => sync.stats(),
            Runner::Processes(sync) => sync.stats(),
        }
    }

    pub fn take_failure(&self) -> Option<Error> {
        match self {
            Runner::Single(player) => player.take_failure(),
            Runner::Threads(sync) => sync.take_failure(),
            Runner::Processes(sync) => sync.take_failure(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, time::Duration};

    use ::config::{Environment, File, FileFormat};

    use crate::{preprocess::PreprocessorSpec, streams::SourceSpec};

    use super::*;

    const YAML: &str = r#"
        mode: threads
        streams:
          - name: wave
            source:
              kind: sine
              fps: 20
          - name: counter
            source:
              kind: ramp
              fps: 5
              fields: [n]
              dtype: i32
        preprocessor:
          kind: moving_average
          window: 4
        transport:
          kind: osc
          address: 127.0.0.1:57110
        sonification:
          synth: pulse
        duration: 2s
    "#;

    fn parse(yaml: &str, env: HashMap<String, String>) -> Result<SyncConfig> {
        SyncConfig::from_sources(
            File::from_str(yaml, FileFormat::Yaml),
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(Some(env)),
        )
    }

    #[test]
    fn test_sync_config_deserialize() {
        let config = parse(YAML, HashMap::new()).unwrap();
        assert_eq!(Mode::Threads, config.mode());
        assert_eq!(None, config.tick_rate());
        assert_eq!(2, config.streams().len());
        assert_eq!("wave", config.streams()[0].name);
        assert!(matches!(
            config.streams()[1].source,
            SourceSpec::Ramp { fps, .. } if fps == 5.0
        ));
        assert_eq!(
            Some(PreprocessorSpec::MovingAverage { window: 4 }),
            config.preprocessor
        );
        assert_eq!(
            &TransportConfig::Osc {
                address: "127.0.0.1:57110".to_string()
            },
            config.transport()
        );
        assert_eq!("pulse", config.sonification().synth());
        assert_eq!(Some(Duration::from_secs(2)), config.duration().unwrap());
    }

    #[test]
    fn test_environment_overrides() {
        let config = parse(
            YAML,
            HashMap::from([
                ("SONISYNC__TICK_RATE".to_string(), "50".to_string()),
                ("SONISYNC__MODE".to_string(), "processes".to_string()),
                ("SONISYNC_THREAD_PRIORITY".to_string(), "10".to_string()),
            ]),
        )
        .unwrap();
        assert_eq!(Some(50.0), config.tick_rate());
        assert_eq!(Mode::Processes, config.mode());
    }

    #[test]
    fn test_defaults_and_errors() {
        let config = parse("duration: soon", HashMap::new()).unwrap();
        assert_eq!(Mode::Threads, config.mode());
        assert_eq!(&TransportConfig::Log, config.transport());
        assert!(config.duration().is_err());
        assert!(matches!(config.build(), Err(Error::NoStreams)));

        let config = parse(
            r#"
            mode: single
            streams:
              - name: a
                source: {kind: sine}
              - name: b
                source: {kind: sine}
            "#,
            HashMap::new(),
        )
        .unwrap();
        assert!(matches!(config.build(), Err(Error::Other(_))));
    }

    #[test]
    fn test_build_runner() {
        let config = parse(
            r#"
            mode: single
            streams:
              - name: a
                source: {kind: sine, fps: 10}
            "#,
            HashMap::new(),
        )
        .unwrap();
        let runner = config.build().unwrap();
        assert!(matches!(runner, Runner::Single(_)));
        assert!(!runner.is_listening());

        let runner = parse(YAML, HashMap::new()).unwrap().build().unwrap();
        match runner {
            Runner::Threads(sync) => assert_eq!(20.0, sync.tick_rate()),
            _ => panic!("expected a thread synchronizer"),
        }
    }
}
