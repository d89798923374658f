//! Single control points.
//!
//! A [`Signal`] is one readback PV and an optional setpoint PV. Signals are
//! cheap to clone (the definition is shared) and carry the
//! [`ControlContext`] they were built with, so timeouts are fixed at
//! construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::control::ControlContext;
use crate::error::{AppResult, BeamlineError};
use crate::value::{PvValue, ValueKind};

/// How a signal participates in readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Read and suggested for plotting.
    Hinted,
    /// Read in every reading.
    Normal,
    /// Configuration: read once per stream.
    Config,
    /// Never read automatically.
    Omitted,
}

impl SignalKind {
    /// Whether the signal is included in a device reading.
    pub fn is_read(self) -> bool {
        matches!(self, SignalKind::Hinted | SignalKind::Normal)
    }
}

#[derive(Clone)]
struct SignalDef {
    name: String,
    read_pv: String,
    write_pv: Option<String>,
    value_kind: ValueKind,
    kind: SignalKind,
    ctx: ControlContext,
}

/// A named readback PV with an optional setpoint PV.
#[derive(Clone)]
pub struct Signal {
    def: Arc<SignalDef>,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.def.name)
            .field("read_pv", &self.def.read_pv)
            .field("write_pv", &self.def.write_pv)
            .finish()
    }
}

impl Signal {
    /// Read-write signal on one PV.
    pub fn rw(ctx: &ControlContext, name: impl Into<String>, pv: impl Into<String>) -> Self {
        let pv = pv.into();
        Self::build(ctx, name.into(), pv.clone(), Some(pv))
    }

    /// Read-only signal.
    pub fn ro(ctx: &ControlContext, name: impl Into<String>, pv: impl Into<String>) -> Self {
        Self::build(ctx, name.into(), pv.into(), None)
    }

    /// Separate readback and setpoint PVs.
    pub fn with_setpoint(
        ctx: &ControlContext,
        name: impl Into<String>,
        read_pv: impl Into<String>,
        write_pv: impl Into<String>,
    ) -> Self {
        Self::build(ctx, name.into(), read_pv.into(), Some(write_pv.into()))
    }

    fn build(ctx: &ControlContext, name: String, read_pv: String, write_pv: Option<String>) -> Self {
        Self {
            def: Arc::new(SignalDef {
                name,
                read_pv,
                write_pv,
                value_kind: ValueKind::Double,
                kind: SignalKind::Normal,
                ctx: ctx.clone(),
            }),
        }
    }

    pub fn kind(mut self, kind: SignalKind) -> Self {
        Arc::make_mut(&mut self.def).kind = kind;
        self
    }

    pub fn config(self) -> Self {
        self.kind(SignalKind::Config)
    }

    pub fn omitted(self) -> Self {
        self.kind(SignalKind::Omitted)
    }

    pub fn hinted(self) -> Self {
        self.kind(SignalKind::Hinted)
    }

    pub fn value_kind(mut self, value_kind: ValueKind) -> Self {
        Arc::make_mut(&mut self.def).value_kind = value_kind;
        self
    }

    pub fn text(self) -> Self {
        self.value_kind(ValueKind::Text)
    }

    pub fn long(self) -> Self {
        self.value_kind(ValueKind::Long)
    }

    /// Same control points under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut def = (*self.def).clone();
        def.name = name.into();
        Self { def: Arc::new(def) }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn read_pv(&self) -> &str {
        &self.def.read_pv
    }

    pub fn write_pv(&self) -> Option<&str> {
        self.def.write_pv.as_deref()
    }

    pub fn signal_kind(&self) -> SignalKind {
        self.def.kind
    }

    pub fn native_kind(&self) -> ValueKind {
        self.def.value_kind
    }

    pub fn is_writable(&self) -> bool {
        self.def.write_pv.is_some()
    }

    /// True if both signals address the same PVs.
    pub fn same_source(&self, other: &Signal) -> bool {
        self.def.read_pv == other.def.read_pv && self.def.write_pv == other.def.write_pv
    }

    fn pvs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.def.read_pv.as_str())
            .chain(self.def.write_pv.as_deref().filter(|w| *w != self.def.read_pv))
    }

    fn open_channels(&self) {
        for pv in self.pvs() {
            self.def.ctx.access().create_channel(pv, self.def.value_kind);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pvs().all(|pv| self.def.ctx.access().is_connected(pv))
    }

    /// Wait for every PV of this signal to connect.
    pub async fn wait_for_connection(&self, timeout: Option<Duration>) -> AppResult<()> {
        self.open_channels();
        for pv in self.pvs() {
            self.def.ctx.wait_for_pv(pv, timeout).await?;
        }
        Ok(())
    }

    pub async fn get(&self) -> AppResult<PvValue> {
        self.open_channels();
        self.def.ctx.get(&self.def.read_pv).await
    }

    pub async fn get_f64(&self) -> AppResult<f64> {
        self.get().await?.expect_f64(&self.def.name)
    }

    /// Write through the setpoint PV, coercing to the signal's native type.
    pub async fn put(&self, value: impl Into<PvValue>) -> AppResult<()> {
        let pv = self
            .def
            .write_pv
            .as_deref()
            .ok_or_else(|| BeamlineError::ReadOnly(self.def.name.clone()))?;
        self.open_channels();
        let value = value.into().coerce(self.def.value_kind);
        debug!(signal = %self.def.name, pv, %value, "put");
        self.def.ctx.put(pv, value).await
    }
}
