//! Device definitions.
//!
//! Each type binds a group of correlated PVs under one name. Composite
//! devices own their motors as `Arc<EpicsMotor>` so plans can target the
//! individual axes directly.

pub mod area_detector;
pub mod calcs;
pub mod diffractometer;
pub mod ioc_stats;
pub mod monochromator;
pub mod motor;
pub mod scaler;
pub mod shutter;
pub mod signal_device;
pub mod temperature;

pub use area_detector::SimDetector;
pub use calcs::{
    setup_lorentzian_swait, SwaitRecord, TransformRecord, UserCalcouts, UserCalcs, UserSseqs,
    UserTransforms,
};
pub use diffractometer::{Diffractometer, Geometry};
pub use ioc_stats::IocStats;
pub use monochromator::{ControlRange, DcmAxis, KohzuDcm};
pub use motor::{motors, EpicsMotor, MotorClass, MotorRange};
pub use scaler::ScalerCh;
pub use shutter::SimShutter;
pub use signal_device::SignalDevice;
pub use temperature::{TemperatureLoop, TemperaturePositioner};
