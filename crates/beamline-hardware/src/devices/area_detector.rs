//! ADSimDetector: simulated camera with image and HDF5 file plugins.
//!
//! ```text
//! {prefix}cam1:   driver (acquire, peak simulation parameters)
//! {prefix}image1: image plugin (viewer)
//! {prefix}HDF1:   HDF5 file writer
//! ```
//!
//! Staging writes the `stage_sigs` values and remembers the originals;
//! unstaging restores them in reverse order.

use anyhow::Result;
use async_trait::async_trait;
use beamline_core::capabilities::{Device, Triggerable};
use beamline_core::control::ControlContext;
use beamline_core::error::AppResult;
use beamline_core::signal::Signal;
use beamline_core::value::PvValue;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

fn pair(ctx: &ControlContext, name: String, prefix: &str, field: &str) -> Signal {
    Signal::with_setpoint(ctx, name, format!("{prefix}{field}_RBV"), format!("{prefix}{field}"))
}

/// Simulated camera driver (`cam1:`).
#[derive(Debug)]
pub struct SimCam {
    pub acquire: Signal,
    pub acquire_time: Signal,
    pub image_mode: Signal,
    pub num_images: Signal,
    pub array_counter: Signal,
    pub reset: Signal,
    pub sim_mode: Signal,
    pub gain: Signal,
    pub offset: Signal,
    pub noise: Signal,
    pub peak_start_x: Signal,
    pub peak_start_y: Signal,
    pub peak_width_x: Signal,
    pub peak_width_y: Signal,
    pub peak_variation: Signal,
    pub max_size_x: Signal,
    pub max_size_y: Signal,
    pub wait_for_plugins: Signal,
}

impl SimCam {
    fn new(ctx: &ControlContext, det: &str, prefix: &str) -> Self {
        let p = format!("{prefix}cam1:");
        let n = |s: &str| format!("{det}_cam_{s}");
        Self {
            acquire: pair(ctx, n("acquire"), &p, "Acquire").long().omitted(),
            acquire_time: pair(ctx, n("acquire_time"), &p, "AcquireTime").config(),
            image_mode: pair(ctx, n("image_mode"), &p, "ImageMode").text().config(),
            num_images: pair(ctx, n("num_images"), &p, "NumImages").long().config(),
            array_counter: pair(ctx, n("array_counter"), &p, "ArrayCounter").long(),
            reset: Signal::rw(ctx, n("reset"), format!("{p}Reset")).long().omitted(),
            sim_mode: pair(ctx, n("sim_mode"), &p, "SimMode").text().config(),
            gain: pair(ctx, n("gain"), &p, "Gain").config(),
            offset: pair(ctx, n("offset"), &p, "Offset").config(),
            noise: pair(ctx, n("noise"), &p, "Noise").config(),
            peak_start_x: pair(ctx, n("peak_start_x"), &p, "PeakStartX").long().config(),
            peak_start_y: pair(ctx, n("peak_start_y"), &p, "PeakStartY").long().config(),
            peak_width_x: pair(ctx, n("peak_width_x"), &p, "PeakWidthX").long().config(),
            peak_width_y: pair(ctx, n("peak_width_y"), &p, "PeakWidthY").long().config(),
            peak_variation: pair(ctx, n("peak_variation"), &p, "PeakVariation").config(),
            max_size_x: Signal::ro(ctx, n("max_size_x"), format!("{p}MaxSizeX_RBV")).long().config(),
            max_size_y: Signal::ro(ctx, n("max_size_y"), format!("{p}MaxSizeY_RBV")).long().config(),
            wait_for_plugins: Signal::rw(ctx, n("wait_for_plugins"), format!("{p}WaitForPlugins"))
                .text()
                .config(),
        }
    }

    fn signals(&self) -> Vec<(&'static str, &Signal)> {
        vec![
            ("acquire", &self.acquire),
            ("acquire_time", &self.acquire_time),
            ("image_mode", &self.image_mode),
            ("num_images", &self.num_images),
            ("array_counter", &self.array_counter),
            ("reset", &self.reset),
            ("sim_mode", &self.sim_mode),
            ("gain", &self.gain),
            ("offset", &self.offset),
            ("noise", &self.noise),
            ("peak_start.peak_start_x", &self.peak_start_x),
            ("peak_start.peak_start_y", &self.peak_start_y),
            ("peak_width.peak_width_x", &self.peak_width_x),
            ("peak_width.peak_width_y", &self.peak_width_y),
            ("peak_variation", &self.peak_variation),
            ("max_size.max_size_x", &self.max_size_x),
            ("max_size.max_size_y", &self.max_size_y),
            ("wait_for_plugins", &self.wait_for_plugins),
        ]
    }
}

/// Fields shared by every NDPlugin.
#[derive(Debug)]
pub struct PluginBase {
    pub enable: Signal,
    pub blocking_callbacks: Signal,
    pub array_size0: Signal,
    pub array_size1: Signal,
}

impl PluginBase {
    fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            enable: pair(ctx, format!("{name}_enable"), prefix, "EnableCallbacks").text().config(),
            blocking_callbacks: pair(ctx, format!("{name}_blocking_callbacks"), prefix, "BlockingCallbacks")
                .text()
                .config(),
            array_size0: Signal::ro(ctx, format!("{name}_array_size0"), format!("{prefix}ArraySize0_RBV"))
                .long()
                .omitted(),
            array_size1: Signal::ro(ctx, format!("{name}_array_size1"), format!("{prefix}ArraySize1_RBV"))
                .long()
                .omitted(),
        }
    }

    fn signals(&self) -> Vec<(&'static str, &Signal)> {
        vec![
            ("enable", &self.enable),
            ("blocking_callbacks", &self.blocking_callbacks),
            ("array_size.array_size0", &self.array_size0),
            ("array_size.array_size1", &self.array_size1),
        ]
    }
}

/// HDF5 file-writer plugin.
#[derive(Debug)]
pub struct Hdf5Plugin {
    pub base: PluginBase,
    pub file_path: Signal,
    pub file_name: Signal,
    pub file_template: Signal,
    pub file_write_mode: Signal,
    pub create_directory: Signal,
    pub capture: Signal,
    pub compression: Signal,
}

impl Hdf5Plugin {
    fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        let n = |s: &str| format!("{name}_{s}");
        Self {
            base: PluginBase::new(ctx, name, prefix),
            file_path: pair(ctx, n("file_path"), prefix, "FilePath").text().config(),
            file_name: pair(ctx, n("file_name"), prefix, "FileName").text().config(),
            file_template: pair(ctx, n("file_template"), prefix, "FileTemplate").text().config(),
            file_write_mode: pair(ctx, n("file_write_mode"), prefix, "FileWriteMode").text().config(),
            create_directory: Signal::rw(ctx, n("create_directory"), format!("{prefix}CreateDirectory"))
                .long()
                .config(),
            capture: pair(ctx, n("capture"), prefix, "Capture").long().omitted(),
            compression: pair(ctx, n("compression"), prefix, "Compression").text().config(),
        }
    }

    fn signals(&self) -> Vec<(&'static str, &Signal)> {
        let mut signals = self.base.signals();
        signals.extend([
            ("file_path", &self.file_path),
            ("file_name", &self.file_name),
            ("file_template", &self.file_template),
            ("file_write_mode", &self.file_write_mode),
            ("create_directory", &self.create_directory),
            ("capture", &self.capture),
            ("compression", &self.compression),
        ]);
        signals
    }
}

/// ADSimDetector with `cam`, `image` and `hdf1` components.
#[derive(Debug)]
pub struct SimDetector {
    name: String,
    prefix: String,
    pub cam: SimCam,
    pub image: PluginBase,
    pub hdf1: Hdf5Plugin,
    stage_sigs: Mutex<Vec<(Signal, PvValue)>>,
    /// Originals saved by `stage`, restored by `unstage`.
    staged: Mutex<Option<Vec<(Signal, PvValue)>>>,
}

impl SimDetector {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        let cam = SimCam::new(ctx, name, prefix);
        let stage_sigs = vec![
            (cam.acquire.clone(), PvValue::Long(0)),
            (cam.image_mode.clone(), PvValue::from("Single")),
            (cam.num_images.clone(), PvValue::Long(1)),
        ];
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            cam,
            image: PluginBase::new(ctx, &format!("{name}_image"), &format!("{prefix}image1:")),
            hdf1: Hdf5Plugin::new(ctx, &format!("{name}_hdf1"), &format!("{prefix}HDF1:")),
            stage_sigs: Mutex::new(stage_sigs),
            staged: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Add (or replace) a value written at stage time.
    pub fn set_stage_sig(&self, signal: &Signal, value: impl Into<PvValue>) {
        let value = value.into();
        let mut sigs = self.stage_sigs.lock();
        match sigs.iter_mut().find(|(s, _)| s.same_source(signal)) {
            Some(entry) => entry.1 = value,
            None => sigs.push((signal.clone(), value)),
        }
    }

    pub fn stage_sigs(&self) -> Vec<(String, PvValue)> {
        self.stage_sigs
            .lock()
            .iter()
            .map(|(s, v)| (s.name().to_string(), v.clone()))
            .collect()
    }

    pub fn is_staged(&self) -> bool {
        self.staged.lock().is_some()
    }

    /// The HDF5 plugin has seen a frame since the IOC started.
    pub async fn is_primed(&self) -> AppResult<bool> {
        let x = self.hdf1.base.array_size0.get_f64().await?;
        let y = self.hdf1.base.array_size1.get_f64().await?;
        Ok(x > 0.0 && y > 0.0)
    }

    /// Push one frame through the HDF5 plugin so it learns the frame shape.
    pub async fn prime(&self) -> AppResult<()> {
        info!(detector = %self.name, "Priming HDF5 plugin");
        let acquire_time = self.cam.acquire_time.get_f64().await?;
        self.hdf1.base.enable.put("Enable").await?;
        self.cam.image_mode.put("Single").await?;
        self.cam.acquire.put(1).await?;
        sleep(Duration::from_secs_f64(acquire_time.max(0.0))).await;
        self.cam.acquire.put(0).await?;
        Ok(())
    }
}

#[async_trait]
impl Device for SimDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = Vec::new();
        for (base, group) in [
            ("cam", self.cam.signals()),
            ("image", self.image.signals()),
            ("hdf1", self.hdf1.signals()),
        ] {
            signals.extend(group.into_iter().map(|(p, s)| (format!("{base}.{p}"), s.clone())));
        }
        signals
    }

    fn triggerable(&self) -> Option<&dyn Triggerable> {
        Some(self)
    }

    /// Write every stage value, remembering the originals. Staging twice is a no-op.
    async fn stage(&self) -> Result<()> {
        if self.is_staged() {
            return Ok(());
        }
        let sigs = self.stage_sigs.lock().clone();
        let mut originals = Vec::with_capacity(sigs.len());
        for (signal, value) in sigs {
            originals.push((signal.clone(), signal.get().await?));
            signal.put(value).await?;
        }
        debug!(detector = %self.name, count = originals.len(), "staged");
        *self.staged.lock() = Some(originals);
        Ok(())
    }

    async fn unstage(&self) -> Result<()> {
        let originals = self.staged.lock().take();
        if let Some(originals) = originals {
            for (signal, value) in originals.into_iter().rev() {
                signal.put(value).await?;
            }
            debug!(detector = %self.name, "unstaged");
        }
        Ok(())
    }
}

#[async_trait]
impl Triggerable for SimDetector {
    /// Software-timed single frame.
    async fn trigger(&self) -> Result<()> {
        let acquire_time = self.cam.acquire_time.get_f64().await?;
        self.cam.acquire.put(1).await?;
        sleep(Duration::from_secs_f64(acquire_time.max(0.0))).await;
        self.cam.acquire.put(0).await?;
        let frames = self.cam.array_counter.get_f64().await?;
        self.cam.array_counter.put(frames + 1.0).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use std::sync::Arc;

    fn detector() -> (Arc<SoftIoc>, SimDetector) {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        (ioc, SimDetector::new(&ctx, "adsimdet", "ad:"))
    }

    #[tokio::test]
    async fn stage_writes_and_unstage_restores() {
        let (ioc, det) = detector();
        det.wait_for_connection(None).await.unwrap();
        ioc.insert("ad:cam1:ImageMode", "Continuous");
        det.set_stage_sig(&det.hdf1.file_template, "%s%s_%4.4d.h5");

        det.stage().await.unwrap();
        assert!(det.is_staged());
        assert_eq!(ioc.value("ad:cam1:ImageMode"), Some(PvValue::from("Single")));
        assert_eq!(ioc.value("ad:HDF1:FileTemplate_RBV"), Some(PvValue::from("%s%s_%4.4d.h5")));

        det.unstage().await.unwrap();
        assert!(!det.is_staged());
        assert_eq!(ioc.value("ad:cam1:ImageMode"), Some(PvValue::from("Continuous")));
    }

    #[tokio::test]
    async fn priming_state_follows_plugin_array_size() {
        let (ioc, det) = detector();
        assert!(!det.is_primed().await.unwrap());
        ioc.insert("ad:HDF1:ArraySize0_RBV", 1024);
        ioc.insert("ad:HDF1:ArraySize1_RBV", 1024);
        assert!(det.is_primed().await.unwrap());
    }

    #[tokio::test]
    async fn trigger_counts_frames() {
        let (ioc, det) = detector();
        det.trigger().await.unwrap();
        det.trigger().await.unwrap();
        assert_eq!(ioc.value("ad:cam1:ArrayCounter"), Some(PvValue::Long(2)));
        assert!(det.component("cam.peak_start.peak_start_x").is_some());
    }
}
