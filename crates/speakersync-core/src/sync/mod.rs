//! Clock synchronization against a remote reference
//!
//! - [`clock`]: two-state Kalman filter over NTP-style time exchanges
//! - [`protocol`]: JSON messages exchanged with the reference server

pub mod clock;
pub mod protocol;

pub use clock::{ClockEstimate, ClockSyncConfig, ClockSynchronizer, MeasurementOutcome, TimeExchangeSample};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
