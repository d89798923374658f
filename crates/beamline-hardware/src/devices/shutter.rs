//! Simulated PSS shutter.
//!
//! No PVs: the shutter state lives in-process and every operation waits
//! `delay` to mimic the mechanical response.

use anyhow::Result;
use async_trait::async_trait;
use beamline_core::capabilities::Device;
use beamline_core::signal::Signal;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    Open,
    Close,
    Unknown,
}

#[derive(Debug)]
pub struct SimShutter {
    name: String,
    delay: Mutex<Duration>,
    state: Mutex<ShutterState>,
}

impl SimShutter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(ShutterState::Unknown),
        }
    }

    pub fn delay(&self) -> Duration {
        *self.delay.lock()
    }

    pub fn set_delay(&self, delay: Duration) {
        debug!(shutter = %self.name, ?delay, "set delay");
        *self.delay.lock() = delay;
    }

    pub fn state(&self) -> ShutterState {
        *self.state.lock()
    }

    pub async fn open(&self) -> Result<()> {
        self.actuate(ShutterState::Open).await
    }

    pub async fn close(&self) -> Result<()> {
        self.actuate(ShutterState::Close).await
    }

    async fn actuate(&self, target: ShutterState) -> Result<()> {
        if self.state() == target {
            return Ok(());
        }
        sleep(self.delay()).await;
        *self.state.lock() = target;
        info!(shutter = %self.name, state = ?target, "Shutter actuated");
        Ok(())
    }
}

#[async_trait]
impl Device for SimShutter {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_and_close_honour_delay() {
        let shutter = SimShutter::new("shutter");
        shutter.set_delay(Duration::from_millis(5));
        assert_eq!(shutter.state(), ShutterState::Unknown);
        shutter.open().await.unwrap();
        assert_eq!(shutter.state(), ShutterState::Open);
        shutter.close().await.unwrap();
        assert_eq!(shutter.state(), ShutterState::Close);
        assert!(shutter.is_connected());
    }
}
