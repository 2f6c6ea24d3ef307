//! Raw register / command access for diagnostics and scripts.

use crate::error::{Result, TouchError};
use crate::native::InterfaceKind;
use crate::protocol::{tcm_exchange, TCM_HEADER_LEN};
use crate::session::DeviceSession;
use std::fmt;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOp {
    /// RMI: `len` bytes from register `addr`. TCM: `addr` is ignored and
    /// `len` bytes of the response stream are read.
    Read { addr: u16, len: usize },
    /// RMI: bytes written at register `target`. TCM: `target` is the command
    /// code and `data` its payload.
    Write { target: u16, data: Vec<u8> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelResponse {
    /// Present for TouchComm writes only.
    pub header: Option<[u8; TCM_HEADER_LEN]>,
    pub data: Vec<u8>,
}

impl fmt::Display for ChannelResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(h) = self.header {
            write!(f, "[{}] ", hex_bytes(&h))?;
        }
        if self.data.is_empty() {
            write!(f, "ok")
        } else {
            write!(f, "{}", hex_bytes(&self.data))
        }
    }
}

pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Borrowed view of a session whose node is already open.
pub struct RawCommandChannel<'a> {
    session: &'a mut DeviceSession,
}

impl<'a> RawCommandChannel<'a> {
    pub fn new(session: &'a mut DeviceSession) -> Self {
        Self { session }
    }

    pub fn execute(&mut self, op: &ChannelOp) -> Result<ChannelResponse> {
        let kind = self.session.kind();
        let res = self.dispatch(kind, op);
        if let Err(e) = &res {
            log::warn!("{}: {:?} failed: {}", self.session.describe(), op, e);
        }
        res
    }

    fn dispatch(&mut self, kind: InterfaceKind, op: &ChannelOp) -> Result<ChannelResponse> {
        let device = self.session.device("execute")?;
        match (kind, op) {
            (_, ChannelOp::Read { addr, len }) => {
                let mut data = vec![0u8; *len];
                let n = device.read(*addr, &mut data).map_err(TouchError::io("read"))?;
                if n != *len {
                    return Err(TouchError::Io {
                        op: "read",
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{} of {} bytes", n, len),
                        ),
                    });
                }
                Ok(ChannelResponse { header: None, data })
            }
            (InterfaceKind::Rmi, ChannelOp::Write { target, data }) => {
                device
                    .write(*target, data, &mut [])
                    .map_err(TouchError::io("write"))?;
                Ok(ChannelResponse::default())
            }
            (InterfaceKind::Tcm, ChannelOp::Write { target, data }) => {
                let command = u8::try_from(*target).map_err(|_| {
                    TouchError::InvalidState(format!("0x{:X} is not a TouchComm command", target))
                })?;
                let resp = tcm_exchange(device, command, data)?;
                Ok(ChannelResponse {
                    header: Some(resp.header),
                    data: resp.payload,
                })
            }
        }
    }
}
