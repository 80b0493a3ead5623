//! Process-wide tracing setup for the backup daemon.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
