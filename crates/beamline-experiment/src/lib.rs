//! Experiment orchestration for the beamline.
//!
//! - **Plans**: state machines that yield commands ([`plans`])
//! - **RunEngine**: executes plans and emits documents ([`run_engine`])
//! - **Setup plans**: provisioning of the local controls ([`setup`])
//! - **Simulation plans**: randomized simulated signals ([`simulation`])
//! - **Instrument**: session startup that wires it all together ([`instrument`])
//!
//! # Example
//!
//! ```rust,ignore
//! use beamline_experiment::{setup::setup_devices, Instrument};
//!
//! let instrument = Instrument::load(settings, access, Metadata::new())?;
//! let result = instrument.engine.run(Box::new(setup_devices())).await?;
//! println!("{}", result.exit_status);
//! ```

pub mod instrument;
pub mod plans;
pub mod run_engine;
pub mod setup;
pub mod simulation;

pub use beamline_core::document::{DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
pub use instrument::Instrument;
pub use plans::{Plan, PlanCommand, PlanContext, PlanSequence};
pub use run_engine::{EngineState, RunEngine, RunResult};
