//! Scaler record with named channels (`ScalerCH` style).
//!
//! Channel `n` has a name field `.NMn` and a count `.Sn`. Once names are
//! assigned in the IOC, [`ScalerCh::select_channels`] restricts readings to
//! the named channels and keys them by name.

use anyhow::Result;
use async_trait::async_trait;
use beamline_core::capabilities::{Device, Triggerable};
use beamline_core::control::ControlContext;
use beamline_core::error::AppResult;
use beamline_core::signal::Signal;
use beamline_core::value::PvValue;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Channels provided by the simulated scaler.
pub const NUM_CHANNELS: usize = 16;

#[derive(Debug, Clone)]
pub struct ScalerChannel {
    pub number: usize,
    pub chname: Signal,
    pub s: Signal,
    pub preset: Signal,
    pub gate: Signal,
}

impl ScalerChannel {
    fn new(ctx: &ControlContext, scaler: &str, prefix: &str, number: usize) -> Self {
        let sig = |field: &str| format!("{scaler}_chan{number:02}_{field}");
        Self {
            number,
            chname: Signal::rw(ctx, sig("chname"), format!("{prefix}.NM{number}"))
                .text()
                .config(),
            s: Signal::ro(ctx, sig("s"), format!("{prefix}.S{number}")),
            preset: Signal::rw(ctx, sig("preset"), format!("{prefix}.PR{number}")).config(),
            gate: Signal::rw(ctx, sig("gate"), format!("{prefix}.G{number}")).long().config(),
        }
    }

    /// Component path prefix, e.g. `channels.chan02`.
    pub fn path(&self) -> String {
        format!("channels.chan{:02}", self.number)
    }
}

#[derive(Debug)]
pub struct ScalerCh {
    name: String,
    pub count: Signal,
    pub count_mode: Signal,
    pub preset_time: Signal,
    pub elapsed: Signal,
    channels: Vec<ScalerChannel>,
    /// (channel number, name) of the channels chosen by `select_channels`.
    selected: RwLock<Vec<(usize, String)>>,
}

impl ScalerCh {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            count: Signal::rw(ctx, format!("{name}_count"), format!("{prefix}.CNT")).long().omitted(),
            count_mode: Signal::rw(ctx, format!("{name}_count_mode"), format!("{prefix}.CONT"))
                .long()
                .config(),
            preset_time: Signal::rw(ctx, format!("{name}_preset_time"), format!("{prefix}.TP")).config(),
            elapsed: Signal::ro(ctx, format!("{name}_time"), format!("{prefix}.T")),
            channels: (1..=NUM_CHANNELS)
                .map(|n| ScalerChannel::new(ctx, name, prefix, n))
                .collect(),
            selected: RwLock::new(Vec::new()),
        }
    }

    /// Channel by 1-based number.
    pub fn channel(&self, number: usize) -> Option<&ScalerChannel> {
        number.checked_sub(1).and_then(|i| self.channels.get(i))
    }

    pub fn channels(&self) -> &[ScalerChannel] {
        &self.channels
    }

    /// Read every channel name and keep the channels that have one.
    pub async fn select_channels(&self) -> AppResult<Vec<String>> {
        let mut selected = Vec::new();
        for channel in &self.channels {
            let name = channel.chname.get().await?.to_string();
            if !name.trim().is_empty() {
                selected.push((channel.number, name.trim().to_string()));
            }
        }
        debug!(scaler = %self.name, channels = ?selected, "Selected named channels");
        let names = selected.iter().map(|(_, n)| n.clone()).collect();
        *self.selected.write() = selected;
        Ok(names)
    }

    pub fn selected_channels(&self) -> Vec<(usize, String)> {
        self.selected.read().clone()
    }
}

#[async_trait]
impl Device for ScalerCh {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = vec![
            ("count".to_string(), self.count.clone()),
            ("count_mode".to_string(), self.count_mode.clone()),
            ("preset_time".to_string(), self.preset_time.clone()),
            ("time".to_string(), self.elapsed.clone()),
        ];
        for channel in &self.channels {
            let base = channel.path();
            signals.push((format!("{base}.chname"), channel.chname.clone()));
            signals.push((format!("{base}.s"), channel.s.clone()));
            signals.push((format!("{base}.preset"), channel.preset.clone()));
            signals.push((format!("{base}.gate"), channel.gate.clone()));
        }
        signals
    }

    fn triggerable(&self) -> Option<&dyn Triggerable> {
        Some(self)
    }

    /// Selected channels keyed by channel name; all counts when none are selected.
    async fn read(&self) -> AppResult<BTreeMap<String, PvValue>> {
        let selected = self.selected_channels();
        let mut reading = BTreeMap::new();
        if selected.is_empty() {
            for channel in &self.channels {
                reading.insert(channel.s.name().to_string(), channel.s.get().await?);
            }
        } else {
            for (number, name) in selected {
                if let Some(channel) = self.channel(number) {
                    reading.insert(name, channel.s.get().await?);
                }
            }
        }
        Ok(reading)
    }
}

#[async_trait]
impl Triggerable for ScalerCh {
    async fn trigger(&self) -> Result<()> {
        self.count.put(1).await?;
        while self.count.get_f64().await? != 0.0 {
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use std::sync::Arc;

    #[tokio::test]
    async fn select_channels_keeps_named_channels() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let scaler = ScalerCh::new(&ctx, "scaler1", "vsc:scaler1");
        scaler.wait_for_connection(None).await.unwrap();

        ioc.insert("vsc:scaler1.NM1", "timebase");
        ioc.insert("vsc:scaler1.NM3", "scint");
        ioc.insert("vsc:scaler1.S3", 1234.0);

        let names = scaler.select_channels().await.unwrap();
        assert_eq!(names, vec!["timebase", "scint"]);

        let reading = scaler.read().await.unwrap();
        assert_eq!(reading.len(), 2);
        assert_eq!(reading["scint"], PvValue::Double(1234.0));
    }

    #[tokio::test]
    async fn trigger_counts_through_soft_ioc() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let scaler = ScalerCh::new(&ctx, "scaler1", "vsc:scaler1");
        scaler.trigger().await.unwrap();
        assert_eq!(ioc.puts_to("vsc:scaler1.CNT"), vec![PvValue::Long(1)]);
        assert_eq!(scaler.channel(2).unwrap().path(), "channels.chan02");
        assert!(scaler.channel(0).is_none());
    }
}
