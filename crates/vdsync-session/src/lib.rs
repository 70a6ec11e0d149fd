//! Per-stream connect/disconnect: fetch the resolution tool, negotiate the
//! client's mode, apply it, and put things back afterwards.

pub mod coordinator;
pub mod fetch;
pub mod request;
pub mod workspace;

pub use coordinator::{ConnectReport, DisconnectReport, DisplayFactory, SessionCoordinator, SessionError};
pub use fetch::{FetchError, HttpFetcher, ToolCache, ToolFetcher};
pub use request::request_from;
pub use workspace::{SessionRecord, SessionWorkspace};
