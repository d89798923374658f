//! Four- and six-circle diffractometers.
//!
//! Only the hardware binding is modelled here: the axes are motor records and
//! the X-ray energy is read (read-only) from the monochromator. Reciprocal
//! space calculations are out of scope; the in-process calculation state
//! keeps the energy and wavelength the geometry engine would use.

use async_trait::async_trait;
use beamline_core::capabilities::{Device, Movable};
use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::Signal;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::motor::EpicsMotor;

/// h·c in keV·Å
const HC_KEV_ANGSTROM: f64 = 12.398_419_843_320_026;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Eulerian 4-circle, vertical scattering plane.
    FourCircle,
    /// Eulerian 6-circle.
    SixCircle,
}

impl Geometry {
    pub fn axis_names(self) -> &'static [&'static str] {
        match self {
            Geometry::FourCircle => &["omega", "chi", "phi", "tth"],
            Geometry::SixCircle => &["mu", "omega", "chi", "phi", "gamma", "delta"],
        }
    }
}

/// Energy and wavelength used by the geometry calculation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalcEnergy {
    pub energy_kev: f64,
    pub wavelength_angstrom: f64,
}

/// Axis-to-motor assignment. Each value is the motor PV suffix appended to
/// the diffractometer prefix (`"m30"` → `"gp:m30"`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AxisPvs {
    pub m_mu: String,
    #[serde(alias = "m_th")]
    pub m_omega: String,
    pub m_chi: String,
    pub m_phi: String,
    pub m_gamma: String,
    pub m_delta: String,
    pub m_tth: String,
}

impl AxisPvs {
    fn for_axis(&self, axis: &str) -> &str {
        match axis {
            "mu" => &self.m_mu,
            "omega" => &self.m_omega,
            "chi" => &self.m_chi,
            "phi" => &self.m_phi,
            "gamma" => &self.m_gamma,
            "delta" => &self.m_delta,
            _ => &self.m_tth,
        }
    }
}

#[derive(Debug)]
pub struct Diffractometer {
    name: String,
    geometry: Geometry,
    axes: Vec<(&'static str, Arc<EpicsMotor>)>,
    pub energy: Signal,
    pub energy_units: Signal,
    calc: Mutex<CalcEnergy>,
}

impl Diffractometer {
    pub fn new(
        ctx: &ControlContext,
        name: &str,
        prefix: &str,
        geometry: Geometry,
        pvs: &AxisPvs,
    ) -> AppResult<Self> {
        let mut axes = Vec::new();
        for axis in geometry.axis_names() {
            let suffix = pvs.for_axis(axis);
            if suffix.is_empty() {
                return Err(BeamlineError::Configuration(format!(
                    "{name}: no motor assigned to axis '{axis}'"
                )));
            }
            let motor = EpicsMotor::new(ctx, &format!("{prefix}{suffix}"), &format!("{name}_{axis}"));
            axes.push((*axis, Arc::new(motor)));
        }
        Ok(Self {
            name: name.to_string(),
            geometry,
            axes,
            energy: Signal::ro(ctx, format!("{name}_energy"), format!("{prefix}BraggERdbkAO")).hinted(),
            energy_units: Signal::ro(ctx, format!("{name}_energy_units"), format!("{prefix}BraggERdbkAO.EGU"))
                .text()
                .config(),
            calc: Mutex::new(CalcEnergy::default()),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn axis(&self, name: &str) -> Option<&Arc<EpicsMotor>> {
        self.axes.iter().find(|(n, _)| *n == name).map(|(_, m)| m)
    }

    pub fn axes(&self) -> impl Iterator<Item = &Arc<EpicsMotor>> {
        self.axes.iter().map(|(_, m)| m)
    }

    pub fn calc_energy(&self) -> CalcEnergy {
        *self.calc.lock()
    }

    /// Apply an energy reading to the calculation state.
    ///
    /// Non-positive energies leave the state unchanged (the monochromator is
    /// not yet in its control range).
    pub fn apply_energy(&self, value: f64, units: &str) -> AppResult<CalcEnergy> {
        let kev = match units.trim() {
            "" | "keV" | "kev" | "KeV" => value,
            "eV" | "ev" => value / 1000.0,
            other => {
                return Err(BeamlineError::Configuration(format!(
                    "{}: unsupported energy units '{other}'",
                    self.name
                )))
            }
        };
        let mut calc = self.calc.lock();
        if kev <= 0.0 {
            warn!(diffractometer = %self.name, kev, "Ignoring non-positive energy");
            return Ok(*calc);
        }
        *calc = CalcEnergy {
            energy_kev: kev,
            wavelength_angstrom: HC_KEV_ANGSTROM / kev,
        };
        debug!(diffractometer = %self.name, ?calc, "Calculation energy updated");
        Ok(*calc)
    }

    /// Read the monochromator energy and update the calculation state.
    pub async fn update_calc_energy(&self) -> AppResult<CalcEnergy> {
        let value = self.energy.get_f64().await?;
        let units = self.energy_units.get().await?;
        self.apply_energy(value, &units.to_string())
    }
}

#[async_trait]
impl Device for Diffractometer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn halt(&self) -> anyhow::Result<()> {
        debug!(diffractometer = %self.name, "Stopping every axis");
        try_join_all(self.axes.iter().map(|(_, motor)| motor.stop())).await?;
        Ok(())
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = Vec::new();
        for (axis, motor) in &self.axes {
            for (path, signal) in motor.signals() {
                signals.push((format!("{axis}.{path}"), signal));
            }
        }
        signals.push(("energy".to_string(), self.energy.clone()));
        signals.push(("energy_units".to_string(), self.energy_units.clone()));
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;

    fn pvs() -> AxisPvs {
        AxisPvs {
            m_omega: "m30".into(),
            m_chi: "m31".into(),
            m_phi: "m32".into(),
            m_tth: "m29".into(),
            ..Default::default()
        }
    }

    #[test]
    fn four_circle_binds_formatted_motor_pvs() {
        let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
        let fourc = Diffractometer::new(&ctx, "fourc", "gp:", Geometry::FourCircle, &pvs()).unwrap();
        assert_eq!(fourc.axis("omega").unwrap().prefix(), "gp:m30");
        assert_eq!(fourc.axis("tth").unwrap().prefix(), "gp:m29");
        assert!(fourc.component("chi.user_setpoint").is_some());
        assert_eq!(fourc.energy.read_pv(), "gp:BraggERdbkAO");
    }

    #[test]
    fn six_circle_requires_every_axis() {
        let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
        let err = Diffractometer::new(&ctx, "sixc", "gp:", Geometry::SixCircle, &pvs()).unwrap_err();
        assert!(err.to_string().contains("mu"));
    }

    #[tokio::test]
    async fn energy_update_sets_wavelength() {
        let ioc = Arc::new(SoftIoc::new());
        ioc.insert("gp:BraggERdbkAO", 8.0);
        ioc.insert("gp:BraggERdbkAO.EGU", "keV");
        let ctx = ControlContext::configure(ioc, ControlTimeouts::default());
        let fourc = Diffractometer::new(&ctx, "fourc", "gp:", Geometry::FourCircle, &pvs()).unwrap();
        let calc = fourc.update_calc_energy().await.unwrap();
        assert_eq!(calc.energy_kev, 8.0);
        assert!((calc.wavelength_angstrom - 1.5498).abs() < 1e-4);

        let unchanged = fourc.apply_energy(0.0, "keV").unwrap();
        assert_eq!(unchanged, calc);
    }
}
