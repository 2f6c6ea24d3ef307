//! Line-oriented read/write/wait scripts.
//!
//! ```text
//! rmi
//! # read the F01 product id
//! read 0x00A8 10
//! write 0x0050 0x04
//! wait 100
//! ```
//!
//! The first non-blank, non-comment line names the interface. Any line with
//! a `#` in it is a comment. One malformed line rejects the whole file.

use crate::channel::{ChannelOp, RawCommandChannel};
use crate::error::{Result, TouchError};
use crate::native::InterfaceKind;
use crate::session::DeviceSession;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOp {
    /// `register` is `None` on TouchComm, where reads drain the stream.
    Read { register: Option<u16>, len: usize },
    Write { target: u16, data: Vec<u8> },
    Wait { ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub interface: InterfaceKind,
    pub op: CommandOp,
}

impl RawCommand {
    /// Canonical script line; parses back to an equal command.
    pub fn to_line(&self) -> String {
        match (&self.op, self.interface) {
            (CommandOp::Read { register: Some(reg), len }, _) => format!("read 0x{:04X} {}", reg, len),
            (CommandOp::Read { register: None, len }, _) => format!("read {}", len),
            (CommandOp::Write { target, data }, kind) => {
                let mut line = match kind {
                    InterfaceKind::Rmi => format!("write 0x{:04X}", target),
                    InterfaceKind::Tcm => format!("write 0x{:02X}", target),
                };
                for b in data {
                    let _ = write!(line, " 0x{:02X}", b);
                }
                line
            }
            (CommandOp::Wait { ms }, _) => format!("wait {}", ms),
        }
    }

    fn channel_op(&self) -> Option<ChannelOp> {
        match &self.op {
            CommandOp::Read { register, len } => Some(ChannelOp::Read {
                addr: register.unwrap_or(0),
                len: *len,
            }),
            CommandOp::Write { target, data } => Some(ChannelOp::Write {
                target: *target,
                data: data.clone(),
            }),
            CommandOp::Wait { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandScript {
    pub interface: InterfaceKind,
    pub commands: Vec<RawCommand>,
}

impl CommandScript {
    pub fn to_text(&self) -> String {
        let mut text = match self.interface {
            InterfaceKind::Rmi => String::from("rmi\n"),
            InterfaceKind::Tcm => String::from("tcm\n"),
        };
        for cmd in &self.commands {
            text.push_str(&cmd.to_line());
            text.push('\n');
        }
        text
    }
}

/// `0x1A` and `1A` both decode to 26.
pub fn parse_hex(token: &str) -> Option<u32> {
    let lower = token.trim().to_ascii_lowercase();
    let normalized = if lower.starts_with("0x") {
        lower
    } else {
        format!("0x{}", lower)
    };
    u32::from_str_radix(&normalized[2..], 16).ok()
}

pub fn parse_file(path: &Path) -> Result<CommandScript> {
    let text = fs::read_to_string(path).map_err(|e| TouchError::parse(path, 0, e.to_string()))?;
    parse_str(&text, path)
}

/// `origin` only labels errors.
pub fn parse_str(text: &str, origin: &Path) -> Result<CommandScript> {
    let mut interface = None;
    let mut commands = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.contains('#') {
            continue;
        }
        match interface {
            None => {
                let lower = trimmed.to_ascii_lowercase();
                interface = Some(if lower.contains("rmi") {
                    InterfaceKind::Rmi
                } else if lower.contains("tcm") {
                    InterfaceKind::Tcm
                } else {
                    return Err(TouchError::parse(
                        origin,
                        line_no,
                        format!("first line must name rmi or tcm, got {:?}", trimmed),
                    ));
                });
            }
            Some(kind) => {
                let tokens: Vec<&str> = trimmed.split_whitespace().collect();
                let op = parse_tokens(kind, &tokens)
                    .map_err(|msg| TouchError::parse(origin, line_no, msg))?;
                commands.push(RawCommand { interface: kind, op });
            }
        }
    }

    let interface =
        interface.ok_or_else(|| TouchError::parse(origin, 0, "script is empty"))?;
    log::debug!("script {}: {} commands", origin.display(), commands.len());
    Ok(CommandScript {
        interface,
        commands,
    })
}

/// One command from its whitespace-split tokens.
pub fn parse_tokens(kind: InterfaceKind, tokens: &[&str]) -> std::result::Result<CommandOp, String> {
    let Some((verb, args)) = tokens.split_first() else {
        return Err("empty command".into());
    };
    let byte = |t: &str| {
        parse_hex(t)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| format!("{:?} is not a hex byte", t))
    };
    let register = |t: &str| {
        parse_hex(t)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| format!("{:?} is not a 16-bit hex register", t))
    };
    let decimal = |t: &str| {
        t.parse::<u64>()
            .map_err(|_| format!("{:?} is not a decimal number", t))
    };

    match (verb.to_ascii_lowercase().as_str(), kind, args) {
        ("read", InterfaceKind::Rmi, [reg, len]) => Ok(CommandOp::Read {
            register: Some(register(*reg)?),
            len: read_len(decimal(*len)?)?,
        }),
        ("read", InterfaceKind::Tcm, [len]) => Ok(CommandOp::Read {
            register: None,
            len: read_len(decimal(*len)?)?,
        }),
        ("write", InterfaceKind::Rmi, [reg, data @ ..]) if !data.is_empty() => Ok(CommandOp::Write {
            target: register(*reg)?,
            data: data.iter().map(|t| byte(*t)).collect::<std::result::Result<_, _>>()?,
        }),
        ("write", InterfaceKind::Tcm, [cmd, data @ ..]) => Ok(CommandOp::Write {
            target: u16::from(byte(*cmd)?),
            data: data.iter().map(|t| byte(*t)).collect::<std::result::Result<_, _>>()?,
        }),
        ("wait", _, [ms]) => Ok(CommandOp::Wait { ms: decimal(*ms)? }),
        ("read" | "write" | "wait", _, _) => Err(format!(
            "wrong number of arguments for {} on {}",
            verb, kind
        )),
        (other, _, _) => Err(format!("unknown command {:?}", other)),
    }
}

fn read_len(len: u64) -> std::result::Result<usize, String> {
    match usize::try_from(len) {
        Ok(0) | Err(_) => Err(format!("bad read length {}", len)),
        Ok(n) => Ok(n),
    }
}

/// Replay `script` with the node held open for the whole run. A failing
/// command is noted in the transcript and the run goes on.
pub fn run(script: &CommandScript, session: &mut DeviceSession) -> Result<String> {
    if script.interface != session.kind() {
        return Err(TouchError::InvalidState(format!(
            "script targets {} but the device is {}",
            script.interface,
            session.kind()
        )));
    }

    session.with_connection("script", |session| {
        let mut transcript = String::new();
        let mut channel = RawCommandChannel::new(session);
        for cmd in &script.commands {
            let _ = writeln!(transcript, "> {}", cmd.to_line());
            match cmd.channel_op() {
                None => {
                    if let CommandOp::Wait { ms } = cmd.op {
                        thread::sleep(Duration::from_millis(ms));
                    }
                    let _ = writeln!(transcript, "  ok");
                }
                Some(op) => match channel.execute(&op) {
                    Ok(resp) => {
                        let _ = writeln!(transcript, "  {}", resp);
                    }
                    Err(e) => {
                        let _ = writeln!(transcript, "  error: {}", e);
                    }
                },
            }
        }
        Ok(transcript)
    })
}

pub fn save_transcript(path: &Path, transcript: &str) -> Result<()> {
    fs::write(path, transcript).map_err(TouchError::io("save transcript"))
}
