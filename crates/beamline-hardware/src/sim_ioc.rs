//! In-process soft IOC.
//!
//! `SoftIoc` implements [`ChannelAccess`] over an in-memory PV table. It is the
//! control layer for simulated beamlines and for tests: every device in this
//! crate can be exercised end to end without a network.
//!
//! # Record processing
//!
//! A put is stored verbatim and then a few record conventions are applied so
//! that readbacks behave like the real IOC:
//!
//! | Put to        | Side effect                                        |
//! |---------------|----------------------------------------------------|
//! | `X.VAL`       | `X.RBV` follows, `X.DMOV` set to 1 (move complete) |
//! | `X.STOP`      | `X.DMOV` set to 1                                  |
//! | `X.CNT`       | count completes immediately (`X.CNT` back to 0)    |
//! | `X`           | `X_RBV` follows, when `X_RBV` is served            |
//!
//! # Connection model
//!
//! With `auto_serve` enabled (the default) any channel a client creates is
//! served with a zero value of its native type. With `auto_serve` disabled
//! only PVs inserted explicitly exist; everything else stays disconnected,
//! which is how tests exercise connection timeouts.

use async_trait::async_trait;
use beamline_core::control::ChannelAccess;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::value::{PvValue, ValueKind};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct PvRecord {
    value: PvValue,
    connected: bool,
}

/// In-memory process variable server.
#[derive(Debug)]
pub struct SoftIoc {
    pvs: DashMap<String, PvRecord>,
    auto_serve: AtomicBool,
    put_log: Mutex<Vec<(String, PvValue)>>,
}

impl Default for SoftIoc {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftIoc {
    /// Soft IOC that serves every channel a client creates.
    pub fn new() -> Self {
        Self {
            pvs: DashMap::new(),
            auto_serve: AtomicBool::new(true),
            put_log: Mutex::new(Vec::new()),
        }
    }

    /// Soft IOC that only serves explicitly inserted PVs.
    pub fn strict() -> Self {
        let ioc = Self::new();
        ioc.auto_serve.store(false, Ordering::SeqCst);
        ioc
    }

    pub fn set_auto_serve(&self, enabled: bool) {
        self.auto_serve.store(enabled, Ordering::SeqCst);
    }

    /// Serve `pv` with an initial value (overwrites any current value).
    pub fn insert(&self, pv: impl Into<String>, value: impl Into<PvValue>) {
        self.pvs.insert(
            pv.into(),
            PvRecord {
                value: value.into(),
                connected: true,
            },
        );
    }

    /// Current value, without going through the client API.
    pub fn value(&self, pv: &str) -> Option<PvValue> {
        self.pvs.get(pv).map(|r| r.value.clone())
    }

    pub fn contains(&self, pv: &str) -> bool {
        self.pvs.contains_key(pv)
    }

    /// Simulate the IOC dropping (or restoring) a single channel.
    pub fn set_connected(&self, pv: &str, connected: bool) {
        if let Some(mut record) = self.pvs.get_mut(pv) {
            record.connected = connected;
        }
    }

    /// Every put received, in order.
    pub fn put_log(&self) -> Vec<(String, PvValue)> {
        self.put_log.lock().clone()
    }

    /// Values put to one PV, in order.
    pub fn puts_to(&self, pv: &str) -> Vec<PvValue> {
        self.put_log
            .lock()
            .iter()
            .filter(|(p, _)| p == pv)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn clear_put_log(&self) {
        self.put_log.lock().clear();
    }

    pub fn pv_count(&self) -> usize {
        self.pvs.len()
    }

    fn store(&self, pv: &str, value: PvValue) {
        match self.pvs.get_mut(pv) {
            Some(mut record) => record.value = value,
            None => {
                self.pvs.insert(
                    pv.to_string(),
                    PvRecord {
                        value,
                        connected: true,
                    },
                );
            }
        }
    }

    fn process(&self, pv: &str, value: &PvValue) {
        if let Some(base) = pv.strip_suffix(".VAL") {
            self.store(&format!("{base}.RBV"), value.clone());
            self.store(&format!("{base}.DMOV"), PvValue::Long(1));
        } else if let Some(base) = pv.strip_suffix(".STOP") {
            self.store(&format!("{base}.DMOV"), PvValue::Long(1));
        } else if pv.ends_with(".CNT") {
            self.store(pv, PvValue::Long(0));
        } else {
            let rbv = format!("{pv}_RBV");
            if self.pvs.contains_key(&rbv) {
                self.store(&rbv, value.clone());
            }
        }
    }

    fn record(&self, pv: &str) -> AppResult<PvRecord> {
        match self.pvs.get(pv) {
            Some(record) if record.connected => Ok(record.clone()),
            _ => Err(BeamlineError::Disconnected(pv.to_string())),
        }
    }
}

#[async_trait]
impl ChannelAccess for SoftIoc {
    fn create_channel(&self, pv: &str, kind: ValueKind) {
        if self.auto_serve.load(Ordering::SeqCst) && !self.pvs.contains_key(pv) {
            trace!(pv, ?kind, "Serving new channel");
            self.pvs.insert(
                pv.to_string(),
                PvRecord {
                    value: PvValue::zero(kind),
                    connected: true,
                },
            );
        }
    }

    async fn connect(&self, pv: &str) -> AppResult<()> {
        self.record(pv).map(|_| ())
    }

    fn is_connected(&self, pv: &str) -> bool {
        self.pvs.get(pv).map(|r| r.connected).unwrap_or(false)
    }

    async fn get(&self, pv: &str) -> AppResult<PvValue> {
        self.record(pv).map(|r| r.value)
    }

    async fn put(&self, pv: &str, value: PvValue) -> AppResult<()> {
        let current = self.record(pv)?;
        let value = value.coerce(current.value.kind());
        debug!(pv, %value, "soft IOC put");
        self.put_log.lock().push((pv.to_string(), value.clone()));
        self.store(pv, value.clone());
        self.process(pv, &value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn motor_setpoint_updates_readback_and_done_flag() {
        let ioc = SoftIoc::new();
        ioc.create_channel("ioc:m1.VAL", ValueKind::Double);
        ioc.put("ioc:m1.VAL", PvValue::Double(1.25)).await.unwrap();
        assert_eq!(ioc.get("ioc:m1.RBV").await.unwrap(), PvValue::Double(1.25));
        assert_eq!(ioc.get("ioc:m1.DMOV").await.unwrap(), PvValue::Long(1));
    }

    #[tokio::test]
    async fn area_detector_readback_follows_setpoint() {
        let ioc = SoftIoc::new();
        ioc.insert("ad:cam1:Gain", 1.0);
        ioc.insert("ad:cam1:Gain_RBV", 1.0);
        ioc.put("ad:cam1:Gain", PvValue::Double(150.0)).await.unwrap();
        assert_eq!(ioc.value("ad:cam1:Gain_RBV"), Some(PvValue::Double(150.0)));
    }

    #[tokio::test]
    async fn strict_ioc_leaves_unknown_channels_disconnected() {
        let ioc = SoftIoc::strict();
        ioc.create_channel("ioc:missing", ValueKind::Double);
        assert!(!ioc.is_connected("ioc:missing"));
        assert!(matches!(
            ioc.get("ioc:missing").await,
            Err(BeamlineError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn puts_keep_native_type_and_are_logged() {
        let ioc = SoftIoc::new();
        ioc.insert("vsc:scaler1.NM1", "");
        ioc.put("vsc:scaler1.NM1", PvValue::from("timebase")).await.unwrap();
        ioc.insert("gp:SREV", 200.0);
        ioc.put("gp:SREV", PvValue::Long(2000)).await.unwrap();
        assert_eq!(ioc.value("gp:SREV"), Some(PvValue::Double(2000.0)));
        assert_eq!(ioc.puts_to("vsc:scaler1.NM1"), vec![PvValue::from("timebase")]);
    }

    #[tokio::test]
    async fn dropped_channel_rejects_puts() {
        let ioc = SoftIoc::new();
        ioc.insert("gp:int20", 0);
        ioc.set_connected("gp:int20", false);
        assert!(ioc.put("gp:int20", PvValue::Long(3)).await.is_err());
        assert!(ioc.put_log().is_empty());
    }
}
