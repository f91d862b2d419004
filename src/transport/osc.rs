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
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::SystemTime,
};

use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::{
    error::{Error, Result},
    sonification::{Arg, Bundle},
};

/// The OSC time tag meaning "immediately".
const IMMEDIATELY: OscTime = OscTime {
    seconds: 0,
    fractional: 1,
};

/// Sends every bundle as one OSC bundle over UDP.
pub struct OscTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscTransport {
    /// Binds an ephemeral local port and targets the given address.
    pub fn new(target: SocketAddr) -> Result<OscTransport> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
        Ok(OscTransport { socket, target })
    }

    /// Encodes a bundle into an OSC packet.
    pub fn encode(bundle: &Bundle, at: Option<SystemTime>) -> Result<Vec<u8>> {
        let timetag = match at {
            Some(at) => OscTime::try_from(at).map_err(|e| Error::Other(format!("{:?}", e)))?,
            None => IMMEDIATELY,
        };
        let packet = OscPacket::Bundle(OscBundle {
            timetag,
            content: bundle
                .commands
                .iter()
                .map(|command| {
                    OscPacket::Message(OscMessage {
                        addr: command.address.clone(),
                        args: command.args.iter().map(to_osc).collect(),
                    })
                })
                .collect(),
        });
        encoder::encode(&packet).map_err(|e| Error::Other(format!("{:?}", e)))
    }
}

fn to_osc(arg: &Arg) -> OscType {
    match arg {
        Arg::Int(v) => OscType::Int(*v),
        Arg::Long(v) => OscType::Long(*v),
        Arg::Float(v) => OscType::Float(*v),
        Arg::Double(v) => OscType::Double(*v),
        Arg::Bool(v) => OscType::Bool(*v),
        Arg::String(v) => OscType::String(v.clone()),
    }
}

impl super::Transport for OscTransport {
    fn send(&self, bundle: &Bundle, at: Option<SystemTime>) -> Result<()> {
        if bundle.is_empty() {
            return Ok(());
        }
        let packet = OscTransport::encode(bundle, at)?;
        self.socket.send_to(&packet, self.target)?;
        Ok(())
    }
}

impl fmt::Display for OscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "osc://{}", self.target)
    }
}

#[cfg(test)]
mod test {
    use std::{net::UdpSocket, time::Duration};

    use rosc::{decoder, OscPacket, OscType};

    use crate::{
        sonification::{Arg, Bundle, Command},
        transport::Transport,
    };

    use super::OscTransport;

    #[test]
    fn test_osc_send() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        let transport = OscTransport::new(receiver.local_addr().unwrap()).unwrap();

        let bundle = Bundle::new(vec![Command::new(
            "/n_set",
            vec![Arg::Int(1000), Arg::String("freq".into()), Arg::Float(440.0)],
        )]);
        transport.send(&bundle, None).unwrap();

        let mut buf = [0u8; rosc::decoder::MTU];
        let (size, _) = receiver.recv_from(&mut buf).unwrap();
        let (_, packet) = decoder::decode_udp(&buf[..size]).unwrap();
        match packet {
            OscPacket::Bundle(bundle) => match &bundle.content[0] {
                OscPacket::Message(message) => {
                    assert_eq!("/n_set", message.addr);
                    assert_eq!(OscType::Float(440.0), message.args[2]);
                }
                p => panic!("unexpected packet {:?}", p),
            },
            p => panic!("unexpected packet {:?}", p),
        }
    }
}
