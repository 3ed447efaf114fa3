//! Auction scenario driver library
//!
//! Replays a timed scenario file against a real auction server and its
//! bidder clients: launches the server, starts bidders on schedule, feeds
//! them command lines and waits for them to finish.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod process;
pub mod readiness;
pub mod scenario;

// Re-exports
pub use config::{CommandSpec, DriverConfig};
pub use dispatcher::{delay_between, DispatchRecord, Dispatcher, RunSummary};
pub use error::{DriverError, DriverResult};
pub use process::{ClientExit, ClientState, ProcessRegistry};
pub use readiness::Readiness;
pub use scenario::{Action, Event, PortTable, Scenario};
