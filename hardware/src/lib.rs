//! Hardware access for the phase-scan controller
//!
//! - [`channel`] - Channel, session and backend traits plus the error type
//! - [`mock`] - Scripted backend used by tests
//! - [`linac_sim`] - Simulated linac used for dry runs

pub mod channel;
pub mod linac_sim;
pub mod mock;

pub use channel::{ChannelBackend, ChannelError, ChannelResult, ChannelSession, HardwareChannel};
pub use linac_sim::{SimCavity, SimulatedLinac};
pub use mock::{ChannelOp, MockBackend, ReadbackMode};
