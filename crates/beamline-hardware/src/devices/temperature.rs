//! Simulated temperature controller built on an `swait` record.
//!
//! The record relaxes its value toward the setpoint in channel `B`, at most
//! `D` per scan period, with uniform noise of amplitude `C`:
//!
//! ```text
//! VAL = A + max(-D, min(D, B - A)) + C*(RNDM - 0.5)      (A = VAL, fed back)
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use beamline_core::capabilities::{Device, Movable};
use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::Signal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use super::calcs::{scan_rate, SwaitRecord};

pub const TEMPERATURE_CALC: &str = "A+max(-D,min(D,(B-A)))+C*(RNDM-0.5)";

const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Parameters of the simulated loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureLoop {
    pub setpoint: f64,
    pub noise: f64,
    /// Index into the record `SCAN` menu.
    pub rate: usize,
    pub tolerance: f64,
    pub max_change: f64,
    pub report_dmov_changes: bool,
}

impl Default for TemperatureLoop {
    fn default() -> Self {
        Self {
            setpoint: 25.0,
            noise: 1.0,
            rate: 5,
            tolerance: 1.0,
            max_change: 2.0,
            report_dmov_changes: false,
        }
    }
}

#[derive(Debug)]
pub struct TemperaturePositioner {
    name: String,
    record: SwaitRecord,
    tolerance: Mutex<f64>,
    report_dmov_changes: AtomicBool,
}

impl TemperaturePositioner {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            record: SwaitRecord::new(ctx, name, prefix),
            tolerance: Mutex::new(1.0),
            report_dmov_changes: AtomicBool::new(false),
        }
    }

    pub fn record(&self) -> &SwaitRecord {
        &self.record
    }

    pub fn tolerance(&self) -> f64 {
        *self.tolerance.lock()
    }

    pub fn reports_dmov_changes(&self) -> bool {
        self.report_dmov_changes.load(Ordering::SeqCst)
    }

    fn setpoint_signal(&self) -> AppResult<&Signal> {
        Ok(&self.record.require('B')?.input_value)
    }

    /// Program the record as a first-order temperature loop.
    pub async fn setup_temperature(&self, params: &TemperatureLoop) -> AppResult<()> {
        let rate = scan_rate(params.rate).ok_or_else(|| {
            BeamlineError::Configuration(format!("{}: invalid scan rate index {}", self.name, params.rate))
        })?;
        let record = &self.record;
        record.reset().await?;
        record.description.put(self.name.as_str()).await?;
        record
            .require('A')?
            .input_pv
            .put(record.calculated_value.read_pv())
            .await?;
        self.setpoint_signal()?.put(params.setpoint).await?;
        record.require('C')?.input_value.put(params.noise).await?;
        record.require('D')?.input_value.put(params.max_change).await?;
        record.calculation.put(TEMPERATURE_CALC).await?;
        record.scanning_rate.put(rate).await?;
        *self.tolerance.lock() = params.tolerance;
        self.report_dmov_changes
            .store(params.report_dmov_changes, Ordering::SeqCst);
        info!(
            temperature = %self.name,
            setpoint = params.setpoint,
            rate,
            tolerance = params.tolerance,
            "Temperature loop configured"
        );
        Ok(())
    }

    async fn in_position(&self) -> Result<bool> {
        let target = self.setpoint_signal()?.get_f64().await?;
        let readback = self.record.calculated_value.get_f64().await?;
        Ok((readback - target).abs() <= self.tolerance())
    }
}

#[async_trait]
impl Device for TemperaturePositioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        self.record.signals()
    }

    fn movable(&self) -> Option<&dyn Movable> {
        Some(self)
    }

    fn setpoint(&self) -> Option<Signal> {
        self.setpoint_signal().ok().cloned()
    }
}

#[async_trait]
impl Movable for TemperaturePositioner {
    /// Resolves once the readback is within tolerance of the new setpoint.
    async fn move_abs(&self, position: f64) -> Result<()> {
        self.setpoint_signal()?
            .put(position)
            .await
            .with_context(|| format!("setting {} setpoint", self.name))?;
        while !self.in_position().await? {
            sleep(SETTLE_POLL).await;
        }
        if self.reports_dmov_changes() {
            info!(temperature = %self.name, position, "done moving");
        }
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.record.calculated_value.get_f64().await?)
    }

    async fn stop(&self) -> Result<()> {
        let here = self.position().await?;
        debug!(temperature = %self.name, here, "stop at current value");
        self.setpoint_signal()?.put(here).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use beamline_core::value::PvValue;
    use std::sync::Arc;

    #[tokio::test]
    async fn setup_programs_relaxation_loop() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let temperature = TemperaturePositioner::new(&ctx, "temperature", "gp:userCalc8");
        temperature
            .setup_temperature(&TemperatureLoop::default())
            .await
            .unwrap();

        assert_eq!(ioc.value("gp:userCalc8.B"), Some(PvValue::Double(25.0)));
        assert_eq!(ioc.value("gp:userCalc8.INAN"), Some(PvValue::from("gp:userCalc8.VAL")));
        assert_eq!(ioc.value("gp:userCalc8.SCAN"), Some(PvValue::from("2 second")));
        assert_eq!(ioc.value("gp:userCalc8.CALC"), Some(PvValue::from(TEMPERATURE_CALC)));
        assert_eq!(temperature.tolerance(), 1.0);
        assert!(!temperature.reports_dmov_changes());
    }

    #[tokio::test]
    async fn move_settles_within_tolerance() {
        let ioc = Arc::new(SoftIoc::new());
        ioc.insert("gp:userCalc8.VAL", 24.5);
        let ctx = ControlContext::configure(ioc, ControlTimeouts::default());
        let temperature = TemperaturePositioner::new(&ctx, "temperature", "gp:userCalc8");
        temperature.move_abs(25.0).await.unwrap();
        assert_eq!(temperature.position().await.unwrap(), 24.5);
    }

    #[tokio::test]
    async fn bad_rate_index_is_rejected() {
        let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
        let temperature = TemperaturePositioner::new(&ctx, "temperature", "gp:userCalc8");
        let params = TemperatureLoop {
            rate: 42,
            ..Default::default()
        };
        assert!(temperature.setup_temperature(&params).await.is_err());
    }
}
