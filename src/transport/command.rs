//! Textual command vocabulary.
//!
//! Commands are UTF-8 text frames of the form `NAME <integer>`. The
//! vocabulary is closed; unrecognized command text is ignored by both sides
//! rather than treated as a protocol violation, which lets old peers talk to
//! newer ones.

use tracing::debug;

/// A recognized command with its parsed argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the server to push timestamps as UDP datagrams to the sender's
    /// address at this port.
    SendTimestamps { port: u16 },
    /// Ask the server to throttle data frames to at most one per this many
    /// milliseconds on this connection. Zero restores the native rate.
    LimitRate { millis: u32 },
}

impl Command {
    /// Parse command text; `None` for unknown or malformed commands (which
    /// callers ignore).
    pub fn parse(text: &str) -> Option<Command> {
        let mut parts = text.split_whitespace();
        let name = parts.next()?;
        let argument = parts.next()?.parse::<i64>().ok()?;
        if parts.next().is_some() {
            debug!(text, "ignoring command with trailing tokens");
            return None;
        }
        match name {
            "SEND_TIMESTAMPS" => {
                let port = u16::try_from(argument).ok()?;
                Some(Command::SendTimestamps { port })
            }
            "LIMIT_RATE" => {
                let millis = u32::try_from(argument).ok()?;
                Some(Command::LimitRate { millis })
            }
            _ => {
                debug!(name, "ignoring unrecognized command");
                None
            }
        }
    }

    /// Render as wire text.
    pub fn format(&self) -> String {
        match self {
            Command::SendTimestamps { port } => format!("SEND_TIMESTAMPS {port}"),
            Command::LimitRate { millis } => format!("LIMIT_RATE {millis}"),
        }
    }
}
