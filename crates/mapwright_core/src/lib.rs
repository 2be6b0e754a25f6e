#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Open-time snapshots used as save baselines
pub mod backup;

/// The `.dmm` map format (parser, writer, in-memory model)
pub mod dmm;

/// Environment digest shared by the shell
pub mod environment;

/// Error (common error types)
pub mod error;

/// Session events and the bus that delivers them
pub mod events;

/// Filesystem abstraction
pub mod fs;

/// Save-time preferences
pub mod preferences;

/// Map session (open documents, selection, close negotiation)
pub mod session;
