pub mod command;
pub mod driver;
pub mod manager;
pub mod mode;
pub mod negotiate;

pub use mode::{parse_mode_line, Mode, ModeOverride, ModeParseError, ModeRequest, ModeSource, OverrideTable};
pub use negotiate::{negotiate, AchievedMode, NegotiationReason, NoAchievableMode, REFRESH_LADDER};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// A display query result where "nothing to talk to" is a normal answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability<T> {
    Available(T),
    NotAvailable { reason: String },
}

impl<T> Availability<T> {
    pub fn not_available(reason: impl Into<String>) -> Self {
        Self::NotAvailable {
            reason: reason.into(),
        }
    }

    pub fn available(self) -> Option<T> {
        match self {
            Self::Available(v) => Some(v),
            Self::NotAvailable { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display tool failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("display tool exited with code {code:?}: {stderr}")]
    Tool { code: Option<i32>, stderr: String },
    #[error("display tool produced no recognisable mode")]
    UnrecognisedOutput,
}

/// Trait for platform-specific display mode control.
pub trait DisplayPort: Send {
    /// Every mode the display reports it can show.
    fn supported_modes(&mut self, display: &str) -> Result<Availability<Vec<Mode>>, DisplayError>;
    /// The mode currently applied.
    fn current_mode(&mut self, display: &str) -> Result<Availability<Mode>, DisplayError>;
    /// Switch the display to `mode`.
    fn apply_mode(&mut self, display: &str, mode: Mode) -> Result<Availability<()>, DisplayError>;
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver tool failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("driver tool exited with code {exit_code:?}: {output}")]
    Tool { exit_code: Option<i32>, output: String },
    #[error("driver tool did not report a published name")]
    MissingPublishedName,
}

impl DriverError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Tool { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Trait for registering the virtual display driver package with the OS.
pub trait DriverPort: Send {
    /// Install the package; returns its published id.
    fn register(&mut self, package: &Path) -> Result<String, DriverError>;
    /// Remove a previously registered package by id.
    fn deregister(&mut self, id: &str) -> Result<(), DriverError>;
    /// Published id of the registered package installed from `package`, if any.
    fn find_registered(&mut self, package: &Path) -> Result<Option<String>, DriverError>;
}
