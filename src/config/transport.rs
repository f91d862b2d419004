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
use std::{net::SocketAddr, sync::Arc};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    sonification::{Dispatcher, FieldMapping},
    transport::{osc::OscTransport, LogTransport, Transport},
};

const DEFAULT_SYNTH: &str = "default";
const DEFAULT_NODE: i32 = 1000;

/// Where bundles are sent.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Only log the bundles.
    #[default]
    Log,
    /// Send OSC over UDP to the given address, e.g. `127.0.0.1:57110`.
    Osc { address: String },
}

impl TransportConfig {
    pub fn build(&self) -> Result<Arc<dyn Transport>> {
        match self {
            TransportConfig::Log => Ok(Arc::new(LogTransport)),
            TransportConfig::Osc { address } => {
                let target: SocketAddr = address.parse().map_err(|_| Error::Parse {
                    field: "transport.address".to_string(),
                    value: address.clone(),
                })?;
                Ok(Arc::new(OscTransport::new(target)?))
            }
        }
    }
}

/// A field mapping sonification: one synth, one control per field.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SonificationConfig {
    synth: Option<String>,
    node: Option<i32>,
    /// Only these fields are mapped. All fields if unset.
    fields: Option<Vec<String>>,
}

impl SonificationConfig {
    pub fn synth(&self) -> &str {
        self.synth.as_deref().unwrap_or(DEFAULT_SYNTH)
    }

    pub fn node(&self) -> i32 {
        self.node.unwrap_or(DEFAULT_NODE)
    }

    pub fn build(&self) -> FieldMapping {
        FieldMapping::new(self.synth(), self.node(), self.fields.clone())
    }
}

/// Builds the dispatcher for the given sonification and transport.
pub fn dispatcher(
    sonification: &SonificationConfig,
    transport: &TransportConfig,
) -> Result<Dispatcher> {
    Ok(Dispatcher::new(
        Box::new(sonification.build()),
        transport.build()?,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transport_build() {
        assert_eq!("log", TransportConfig::Log.build().unwrap().to_string());
        assert!(TransportConfig::Osc {
            address: "127.0.0.1:57110".to_string()
        }
        .build()
        .is_ok());
        assert!(matches!(
            TransportConfig::Osc {
                address: "nowhere".to_string()
            }
            .build(),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_sonification_defaults() {
        let sonification = SonificationConfig::default();
        assert_eq!("default", sonification.synth());
        assert_eq!(1000, sonification.node());
    }
}
