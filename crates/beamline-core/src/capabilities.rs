//! Device abstraction and hardware capabilities.
//!
//! Every registered object implements [`Device`]: a name plus a tree of
//! [`Signal`]s addressed by dotted component paths (`"channels.chan01.chname"`).
//! Positioners additionally expose [`Movable`], counters [`Triggerable`].
//!
//! # Design
//!
//! Capability traits follow the same rules throughout:
//! - async via `#[async_trait]`
//! - `Send + Sync`
//! - `anyhow::Result` for errors
//!
//! Concrete device types are recovered from a registry handle with
//! [`downcast_device`].

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;
use crate::signal::Signal;
use crate::value::PvValue;

/// Type-erasure helper implemented for every `'static` type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A named proxy for one or more hardware control points.
#[async_trait]
pub trait Device: AsAny {
    /// Unique device name.
    fn name(&self) -> &str;

    /// Every leaf signal with its dotted component path, in declaration order.
    fn signals(&self) -> Vec<(String, Signal)>;

    /// Look up a leaf signal by dotted path.
    fn component(&self, path: &str) -> Option<Signal> {
        self.signals()
            .into_iter()
            .find(|(p, _)| p == path)
            .map(|(_, s)| s)
    }

    /// Positioner interface, if the device moves.
    fn movable(&self) -> Option<&dyn Movable> {
        None
    }

    /// Counter/detector interface, if the device can be triggered.
    fn triggerable(&self) -> Option<&dyn Triggerable> {
        None
    }

    /// The signal written when the device itself is the target of a set.
    fn setpoint(&self) -> Option<Signal> {
        None
    }

    fn is_connected(&self) -> bool {
        self.signals().iter().all(|(_, s)| s.is_connected())
    }

    /// Prepare for a run. Called once before the first command.
    async fn stage(&self) -> Result<()> {
        Ok(())
    }

    /// Undo [`Device::stage`]. Called when the run ends, however it ends.
    async fn unstage(&self) -> Result<()> {
        Ok(())
    }

    /// Stop any motion this device drives. Composite devices stop every
    /// positioner they own.
    async fn halt(&self) -> Result<()> {
        match self.movable() {
            Some(positioner) => positioner.stop().await,
            None => Ok(()),
        }
    }

    /// Wait for every signal to connect, concurrently.
    async fn wait_for_connection(&self, timeout: Option<Duration>) -> AppResult<()> {
        let signals = self.signals();
        let results = join_all(signals.iter().map(|(_, s)| s.wait_for_connection(timeout))).await;
        results.into_iter().collect()
    }

    /// Read every hinted/normal signal. Keys are `name_path` with dots
    /// replaced by underscores.
    async fn read(&self) -> AppResult<BTreeMap<String, PvValue>> {
        let mut reading = BTreeMap::new();
        for (path, signal) in self.signals() {
            if !signal.signal_kind().is_read() {
                continue;
            }
            let key = if path.is_empty() {
                self.name().to_string()
            } else {
                format!("{}_{}", self.name(), path.replace('.', "_"))
            };
            reading.insert(key, signal.get().await?);
        }
        Ok(reading)
    }
}

/// Recover the concrete type behind a registry handle.
pub fn downcast_device<T: Device>(device: Arc<dyn Device>) -> Option<Arc<T>> {
    device.into_any().downcast::<T>().ok()
}

/// Capability: motion control.
///
/// `move_abs` resolves when the motion is complete.
#[async_trait]
pub trait Movable: Send + Sync {
    async fn move_abs(&self, position: f64) -> Result<()>;

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Current readback position.
    async fn position(&self) -> Result<f64>;

    async fn stop(&self) -> Result<()>;
}

/// Capability: software-triggered acquisition.
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Start an acquisition and resolve when it completes.
    async fn trigger(&self) -> Result<()>;
}
