//! Line-oriented command surface
//!
//! The input task queues one [`Command`] at a time and waits for the
//! coordinator to acknowledge it before reading the next line, so at most
//! one command is ever in flight.

use crate::error::{GrapevineError, Result};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Capacity of the command queue
pub const COMMAND_QUEUE_CAPACITY: usize = 8;

/// Largest accepted difficulty exponent for `like`; work values never
/// exceed 2^255
pub const MAX_LIKE_EXPONENT: u32 = 255;

/// Command names with a short description, as shown by `help`
pub const COMMANDS: &[(&str, &str)] = &[
    ("send", "send a message: send hello world"),
    ("messages", "list messages in the database"),
    ("peers", "list peer nodes"),
    ("like", "like a message in the database: like 123 5"),
    ("drop", "drop a message in the database: drop 123"),
    ("help", "list commands"),
    ("exit", "exit the application"),
];

/// A raw command line plus the signal that releases the input task
#[derive(Debug)]
pub struct Command {
    pub line: String,
    pub processed: oneshot::Sender<()>,
}

impl Command {
    pub fn new(line: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (processed, rx) = oneshot::channel();
        (
            Self {
                line: line.into(),
                processed,
            },
            rx,
        )
    }

    /// Let the input task read the next line
    pub fn acknowledge(self) {
        // The input task may already be gone during shutdown
        let _ = self.processed.send(());
    }
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Send(String),
    Messages,
    Peers,
    Like { id: u64, exponent: Option<u32> },
    Drop { id: u64 },
    Help,
    Exit,
}

fn parse_id(token: &str, usage: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|_| GrapevineError::usage(format!("invalid message id {token:?}: {usage}")))
}

impl FromStr for CommandKind {
    type Err = GrapevineError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let name = tokens.next().unwrap_or("");
        let args: Vec<&str> = tokens.collect();

        match name {
            "send" => {
                let text = line["send".len()..].trim();
                if text.is_empty() {
                    return Err(GrapevineError::usage(
                        "send requires a message: send hello world",
                    ));
                }
                Ok(CommandKind::Send(text.to_string()))
            },
            "messages" => Ok(CommandKind::Messages),
            "peers" => Ok(CommandKind::Peers),
            "like" => {
                const USAGE: &str = "like requires a message id parameter: like 123\n\
                                     adding a proof of work is also allowed: like 123 6";
                let (id, exponent) = match args.as_slice() {
                    [id] => (parse_id(id, USAGE)?, None),
                    [id, exponent] => {
                        let exponent: u32 = exponent
                            .parse()
                            .ok()
                            .filter(|e| *e <= MAX_LIKE_EXPONENT)
                            .ok_or_else(|| {
                                GrapevineError::usage(format!(
                                    "invalid difficulty {exponent:?}, expected 0..={MAX_LIKE_EXPONENT}"
                                ))
                            })?;
                        (parse_id(id, USAGE)?, Some(exponent))
                    },
                    _ => return Err(GrapevineError::usage(USAGE)),
                };
                Ok(CommandKind::Like { id, exponent })
            },
            "drop" => {
                const USAGE: &str = "drop requires a message id: drop 123";
                match args.as_slice() {
                    [id] => Ok(CommandKind::Drop {
                        id: parse_id(id, USAGE)?,
                    }),
                    _ => Err(GrapevineError::usage(USAGE)),
                }
            },
            "help" => Ok(CommandKind::Help),
            "exit" => Ok(CommandKind::Exit),
            other => Err(GrapevineError::UnknownCommand(other.to_string())),
        }
    }
}

/// Read command lines from `input` and queue them one at a time.
///
/// Writes `prompt` to `output` before each line. Returns at end of input,
/// or once the coordinator stops accepting commands.
pub async fn read_commands<R, W>(
    input: R,
    mut output: W,
    prompt: &str,
    commands: mpsc::Sender<Command>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        output.write_all(prompt.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            debug!("Command input closed");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let (command, processed) = Command::new(line);
        if commands.send(command).await.is_err() {
            return Ok(());
        }
        if processed.await.is_err() {
            return Ok(());
        }
    }
}
