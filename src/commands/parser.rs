//! Command parser.

use std::fmt;

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Closing acknowledgement. Advisory only, the connection stays open.
    Quit,
    /// Current UTC time.
    Time,
    /// Platform and server identification.
    Info,
    /// Look up `<dir>/<name>` and report its metadata.
    Find { name: String, dir: String },
    /// Anything we don't recognise.
    Unknown,
}

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Wrong number of arguments for a known command.
    Arguments {
        command: &'static str,
        usage: &'static str,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Arguments { usage, .. } => {
                write!(f, "Invalid arguments: usage: {}", usage)
            }
        }
    }
}

impl std::error::Error for CommandError {}

const FIND_USAGE: &str = "find <name> <dir>";

impl Command {
    /// Parse a single request.
    ///
    /// `quit`, `time` and `info` must match exactly. `find` must be the
    /// first whitespace-separated token and take exactly two arguments.
    pub fn parse(input: &str) -> Result<Command, CommandError> {
        match input {
            "quit" => return Ok(Command::Quit),
            "time" => return Ok(Command::Time),
            "info" => return Ok(Command::Info),
            _ => {}
        }

        let mut parts = input.split_ascii_whitespace();
        if parts.next() != Some("find") {
            return Ok(Command::Unknown);
        }

        let args: Vec<&str> = parts.collect();
        match args.as_slice() {
            [name, dir] => Ok(Command::Find {
                name: name.to_string(),
                dir: dir.to_string(),
            }),
            _ => Err(CommandError::Arguments {
                command: "find",
                usage: FIND_USAGE,
            }),
        }
    }
}
