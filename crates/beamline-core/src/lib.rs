//! Core types and traits for beamline instrument control.
//!
//! - [`control`]: the hardware communication boundary and timeout policy
//! - [`signal`]: single PV-backed control points
//! - [`capabilities`]: the `Device` trait plus `Movable`/`Triggerable`
//! - [`document`]: run documents (start, descriptor, event, stop)
//! - [`settings`]: layered instrument configuration
//! - [`error`]: the shared `BeamlineError`

pub mod capabilities;
pub mod control;
pub mod document;
pub mod error;
pub mod settings;
pub mod signal;
pub mod value;

pub use capabilities::{downcast_device, Device, Movable, Triggerable};
pub use control::{ChannelAccess, ControlContext, ControlTimeouts};
pub use error::{AppResult, BeamlineError};
pub use signal::{Signal, SignalKind};
pub use value::{PvValue, ValueKind};
