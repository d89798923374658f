//! Kohzu double-crystal monochromator (sequencer-controlled).
//!
//! The Kohzu sequence program only drives energy when the theta, y and z
//! motors start inside its control range. [`ControlRange::required_moves`]
//! decides which axes must be brought in; the plan that performs the batched
//! move lives with the other plan stubs.

use anyhow::Result;
use async_trait::async_trait;
use beamline_core::capabilities::{Device, Movable};
use beamline_core::control::ControlContext;
use beamline_core::signal::Signal;
use futures::future::try_join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::motor::EpicsMotor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcmAxis {
    Theta,
    Y,
    Z,
}

/// Acceptable starting region for the Kohzu sequencer.
///
/// In range means `theta >= theta_min`, `y <= y_max` and `z >= z_min`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ControlRange {
    pub theta_min: f64,
    pub y_max: f64,
    pub z_min: f64,
}

impl Default for ControlRange {
    fn default() -> Self {
        Self {
            theta_min: 2.0,
            y_max: -15.0,
            z_min: 90.0,
        }
    }
}

impl ControlRange {
    pub fn new(theta_min: f64, y_max: f64, z_min: f64) -> Self {
        Self {
            theta_min,
            y_max,
            z_min,
        }
    }

    /// Axes outside the range, each with the boundary to move it to.
    /// Empty when every axis is already in range.
    pub fn required_moves(&self, theta: f64, y: f64, z: f64) -> Vec<(DcmAxis, f64)> {
        let mut moves = Vec::new();
        if theta < self.theta_min {
            moves.push((DcmAxis::Theta, self.theta_min));
        }
        if y > self.y_max {
            moves.push((DcmAxis::Y, self.y_max));
        }
        if z < self.z_min {
            moves.push((DcmAxis::Z, self.z_min));
        }
        moves
    }

    pub fn contains(&self, theta: f64, y: f64, z: f64) -> bool {
        self.required_moves(theta, y, z).is_empty()
    }
}

/// Motor PV suffixes, appended to the monochromator prefix.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DcmMotorPvs {
    pub m_th: String,
    pub m_y: String,
    pub m_z: String,
}

#[derive(Debug)]
pub struct KohzuDcm {
    name: String,
    pub wavelength: Signal,
    pub energy: Signal,
    pub theta: Signal,
    pub y1: Signal,
    pub z2: Signal,
    pub message2: Signal,
    pub operator_acknowledge: Signal,
    pub use_set: Signal,
    pub mode: Signal,
    pub y_offset: Signal,
    pub m_theta: Arc<EpicsMotor>,
    pub m_y: Arc<EpicsMotor>,
    pub m_z: Arc<EpicsMotor>,
}

impl KohzuDcm {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str, motors: &DcmMotorPvs) -> Self {
        let sig = |s: &str| format!("{name}_{s}");
        let pv = |s: &str| format!("{prefix}{s}");
        let motor = |suffix: &str, axis: &str| {
            Arc::new(EpicsMotor::new(ctx, &pv(suffix), &sig(axis)))
        };
        Self {
            name: name.to_string(),
            wavelength: Signal::with_setpoint(ctx, sig("wavelength"), pv("BraggLambdaRdbkAO"), pv("BraggLambdaAO")),
            energy: Signal::with_setpoint(ctx, sig("energy"), pv("BraggERdbkAO"), pv("BraggEAO")).hinted(),
            theta: Signal::with_setpoint(ctx, sig("theta"), pv("BraggThetaRdbkAO"), pv("BraggThetaAO")),
            y1: Signal::ro(ctx, sig("y1"), pv("KohzuYRdbkAI")),
            z2: Signal::ro(ctx, sig("z2"), pv("KohzuZRdbkAI")),
            message2: Signal::ro(ctx, sig("message2"), pv("KohzuSeqMsg2SI")).text().omitted(),
            operator_acknowledge: Signal::rw(ctx, sig("operator_acknowledge"), pv("KohzuOperAckBO"))
                .long()
                .omitted(),
            use_set: Signal::rw(ctx, sig("use_set"), pv("KohzuUseSetBO")).long().omitted(),
            mode: Signal::rw(ctx, sig("mode"), pv("KohzuModeBO")).text().config(),
            y_offset: Signal::rw(ctx, sig("y_offset"), pv("Kohzu_yOffsetAO")).config(),
            m_theta: motor(&motors.m_th, "m_theta"),
            m_y: motor(&motors.m_y, "m_y"),
            m_z: motor(&motors.m_z, "m_z"),
        }
    }

    pub fn motor(&self, axis: DcmAxis) -> &Arc<EpicsMotor> {
        match axis {
            DcmAxis::Theta => &self.m_theta,
            DcmAxis::Y => &self.m_y,
            DcmAxis::Z => &self.m_z,
        }
    }

    /// Current (theta, y, z) motor positions.
    pub async fn positions(&self) -> Result<(f64, f64, f64)> {
        let (theta, y, z) = tokio::try_join!(
            self.m_theta.position(),
            self.m_y.position(),
            self.m_z.position()
        )?;
        Ok((theta, y, z))
    }

    /// Tell all three motors to stop.
    pub async fn stop(&self) -> Result<()> {
        info!(dcm = %self.name, "Stopping monochromator motors");
        try_join_all([&self.m_theta, &self.m_y, &self.m_z].map(|m| m.stop())).await?;
        Ok(())
    }
}

#[async_trait]
impl Device for KohzuDcm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn halt(&self) -> Result<()> {
        self.stop().await
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals: Vec<(String, Signal)> = [
            ("wavelength", &self.wavelength),
            ("energy", &self.energy),
            ("theta", &self.theta),
            ("y1", &self.y1),
            ("z2", &self.z2),
            ("message2", &self.message2),
            ("operator_acknowledge", &self.operator_acknowledge),
            ("use_set", &self.use_set),
            ("mode", &self.mode),
            ("y_offset", &self.y_offset),
        ]
        .into_iter()
        .map(|(p, s)| (p.to_string(), s.clone()))
        .collect();
        for (axis, motor) in [("m_theta", &self.m_theta), ("m_y", &self.m_y), ("m_z", &self.m_z)] {
            for (path, signal) in motor.signals() {
                signals.push((format!("{axis}.{path}"), signal));
            }
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;

    #[test]
    fn only_out_of_range_axes_move() {
        let range = ControlRange::new(2.0, -5.0, 5.0);
        assert!(range.required_moves(10.0, -10.0, 20.0).is_empty());
        assert_eq!(
            range.required_moves(0.0, -10.0, 20.0),
            vec![(DcmAxis::Theta, 2.0)]
        );
        assert_eq!(
            range.required_moves(0.0, 0.0, 0.0),
            vec![(DcmAxis::Theta, 2.0), (DcmAxis::Y, -5.0), (DcmAxis::Z, 5.0)]
        );
        // boundaries are in range
        assert!(range.contains(2.0, -5.0, 5.0));
    }

    #[tokio::test]
    async fn stop_writes_every_motor_stop_field() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let dcm = KohzuDcm::new(
            &ctx,
            "dcm",
            "gp:",
            &DcmMotorPvs {
                m_th: "m45".into(),
                m_y: "m46".into(),
                m_z: "m47".into(),
            },
        );
        dcm.wait_for_connection(None).await.unwrap();
        dcm.stop().await.unwrap();
        for m in ["gp:m45", "gp:m46", "gp:m47"] {
            assert_eq!(ioc.puts_to(&format!("{m}.STOP")).len(), 1);
        }
        assert_eq!(dcm.positions().await.unwrap(), (0.0, 0.0, 0.0));
    }
}
