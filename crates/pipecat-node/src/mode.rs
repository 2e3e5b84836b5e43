use std::fmt;
use std::io::IsTerminal;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Which loop the bridge runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Input lines -> queue.
    Publish,
    /// Queue -> output lines, with tracked acknowledgments.
    Consume,
}

/// Requested mode; `Auto` infers it from the input stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeSelection {
    #[default]
    Auto,
    Publish,
    Consume,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown mode `{0}` (expected auto, publish or consume)")]
pub struct ModeParseError(String);

impl ModeSelection {
    /// An interactive terminal has no lines to publish, so it consumes.
    pub fn resolve(self, input_is_terminal: bool) -> Mode {
        match self {
            ModeSelection::Publish => Mode::Publish,
            ModeSelection::Consume => Mode::Consume,
            ModeSelection::Auto if input_is_terminal => Mode::Consume,
            ModeSelection::Auto => Mode::Publish,
        }
    }

    /// Resolves against the process's standard input.
    pub fn resolve_for_stdin(self) -> Mode {
        self.resolve(std::io::stdin().is_terminal())
    }
}

impl FromStr for ModeSelection {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(ModeSelection::Auto),
            "publish" | "pub" => Ok(ModeSelection::Publish),
            "consume" | "sub" => Ok(ModeSelection::Consume),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Publish => f.write_str("publish"),
            Mode::Consume => f.write_str("consume"),
        }
    }
}
