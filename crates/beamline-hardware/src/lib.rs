//! Beamline hardware: device definitions, the device registry and the
//! simulated soft IOC.
//!
//! # Startup
//!
//! ```text
//! Settings ──▶ ControlContext (timeouts) ──▶ DevicesFile::build_into ──▶ DeviceRegistry
//!                                              │
//!                                        FactoryTable
//! ```
//!
//! Devices take a [`ControlContext`](beamline_core::control::ControlContext)
//! in their constructors, so the control timeouts are always configured
//! before the first device exists.

pub mod config;
pub mod devices;
pub mod factory;
pub mod namespace;
pub mod registry;
pub mod sim_ioc;

pub use config::{DeviceSpec, DevicesFile};
pub use factory::{BuiltDevice, DeviceFactory, FactoryTable};
pub use namespace::{Namespace, NamespaceEntry};
pub use registry::{DeviceInfo, DeviceRegistry, FindAll};
pub use sim_ioc::SoftIoc;
