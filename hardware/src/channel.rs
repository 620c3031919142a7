//! Process-control channel abstraction
//!
//! Provides a narrow interface over named control-system endpoints (setpoints,
//! readbacks, monitor values) that can be backed by a scripted mock (for
//! testing), a simulated linac (for dry runs) or a real channel-access client.

use thiserror::Error;

/// Error type for channel operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The backend does not know a channel with this name
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The channel exists but is not connected
    #[error("channel {name} is not connected")]
    Disconnected {
        /// Channel name
        name: String,
    },

    /// A read did not complete in time
    #[error("read from {name} timed out")]
    ReadTimeout {
        /// Channel name
        name: String,
    },

    /// A write was refused by the server
    #[error("write of {value} to {name} was rejected")]
    PutRejected {
        /// Channel name
        name: String,
        /// Value that was written
        value: f64,
    },

    /// A commanded setpoint never showed up on its readback
    #[error(
        "{name} did not settle at {target:.2} after {attempts} attempts \
         (last readback {last:.2})"
    )]
    SettleTimeout {
        /// Readback channel name
        name: String,
        /// Commanded value
        target: f64,
        /// Last value read back
        last: f64,
        /// Number of put/confirm cycles attempted
        attempts: usize,
    },

    /// Client context could not be created
    #[error("channel context error: {0}")]
    Context(String),
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A single named process-control endpoint.
///
/// `get` returns the latest sampled value, which may be a cached value if the
/// server has not published a newer one. `put` is fire-and-forget: a successful
/// return only means the command was issued, not that the device reached it.
pub trait HardwareChannel: Send {
    /// Channel name as known to the control system
    fn name(&self) -> &str;

    /// Read the latest value
    fn get(&mut self) -> ChannelResult<f64>;

    /// Issue a setpoint command
    fn put(&mut self, value: f64) -> ChannelResult<()>;
}

/// A live client context that hands out channels.
///
/// Dropping the session releases the context. Channels opened from a session
/// must not be used after the session is dropped.
pub trait ChannelSession: Send {
    /// Open (connect) a channel by name
    fn open(&mut self, name: &str) -> ChannelResult<Box<dyn HardwareChannel>>;
}

/// Factory for channel sessions.
///
/// One backend is shared by every scan run; each run creates its own session
/// on the worker thread and drops it on exit.
pub trait ChannelBackend: Send + Sync {
    /// Create a client context
    fn connect(&self) -> ChannelResult<Box<dyn ChannelSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_timeout_message() {
        let err = ChannelError::SettleTimeout {
            name: "SCRF:CAV1:PHASE:READBACK".to_string(),
            target: 10.0,
            last: 42.5,
            attempts: 20,
        };
        assert_eq!(
            err.to_string(),
            "SCRF:CAV1:PHASE:READBACK did not settle at 10.00 after 20 attempts \
             (last readback 42.50)"
        );
    }
}
