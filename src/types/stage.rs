use std::fmt::Display;

use serde::Serialize;

/// Where an acquisition job stands.
///
/// `Resolving → Downloading → (Merging) → Streaming → Complete`, with
/// `Error` reachable from any step and `Cancelled` from the steps where a
/// subprocess or a client transfer is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Downloading,
    Merging,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error | Stage::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;

        match (self, next) {
            (Resolving, Downloading) => true,
            (Downloading, Merging | Streaming) => true,
            (Merging, Streaming) => true,
            (Streaming, Complete) => true,
            (Downloading | Merging | Streaming, Cancelled) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Downloading => "downloading",
            Stage::Merging => "merging",
            Stage::Streaming => "streaming",
            Stage::Complete => "complete",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
