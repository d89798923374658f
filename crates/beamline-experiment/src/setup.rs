//! Setup plans for the local controls.
//!
//! ```rust,ignore
//! engine.run(Box::new(setup_devices())).await?;
//! ```
//!
//! `setup_devices` runs the steps strictly in order: later steps configure
//! records that earlier steps enable. Each step looks its devices up in the
//! registry (a missing device fails the run), waits for them to connect and
//! then issues batched moves.

use beamline_core::capabilities::{downcast_device, Device};
use beamline_core::value::PvValue;
use beamline_hardware::devices::{
    ControlRange, DcmAxis, Diffractometer, KohzuDcm, ScalerCh, SimDetector, SimShutter,
    TemperatureLoop, TemperaturePositioner, TransformRecord,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::plans::{component, Plan, PlanCommand, PlanContext, PlanSequence, Provision, Recover, SetPoint};
use crate::simulation::{
    change_ad_simulated_image_parameters, change_noisy_signal_parameters, dither_ad_peak_position,
    AdPeakSimulation,
};

/// Names assigned to scaler channels 1-6 when the scaler has none.
pub const SCALER1_CHANNEL_NAMES: [&str; 6] = ["timebase", "I0", "scint", "diode", "I000", "I00"];

/// Labels carried by the scaler channel aliases.
pub const CHANNEL_LABELS: [&str; 2] = ["channel", "counter"];

pub const DEFAULT_SREV: i64 = 2000;
pub const DEFAULT_SHUTTER_DELAY: f64 = 0.05;

/// Starting region the Kohzu sequencer accepts on this beamline.
pub fn dcm_control_range() -> ControlRange {
    ControlRange::new(2.0, -5.0, 5.0)
}

/// All local controls, in dependency order.
pub fn setup_devices() -> PlanSequence {
    PlanSequence::new("setup_devices", "Setup devices")
        .then(setup_scan_id())
        .then(enable_user_calcs())
        .then(change_motor_srev(DEFAULT_SREV))
        .then(SetupScaler1::new())
        .then(change_noisy_signal_parameters(0.15, 10_000.0, 0.08))
        .then(setup_shutter(DEFAULT_SHUTTER_DELAY))
        .then(SetupMonochromator::new(dcm_control_range()))
        .then(setup_diffractometers())
        .then(setup_temperature_positioner())
        .then(SetupAreaDetectors::new())
}

/// Set the scan-id PV to the number of runs in the catalog.
pub fn setup_scan_id() -> Provision {
    Provision::new("setup_scan_id", "Setup scan id", |ctx| {
        let scan_id = ctx.registry.find("scan_id_epics")?;
        Ok(vec![
            PlanCommand::wait_for([scan_id.clone()]),
            PlanCommand::mv([SetPoint::device(&scan_id, ctx.catalog_len)]),
        ])
    })
}

/// Enable the user calcs, calcouts, sseqs and transforms.
pub fn enable_user_calcs() -> Provision {
    Provision::new("enable_user_calcs", "Enable user calcs", |ctx| {
        let mut commands = Vec::new();
        for key in ["user_calcouts", "user_calcs", "user_sseqs", "user_transforms"] {
            let bank = ctx.registry.find(key)?;
            let enable = component(bank.as_ref(), "enable")?;
            debug!(bank = key, "Enable");
            commands.push(PlanCommand::wait_for([bank]));
            commands.push(PlanCommand::mv([SetPoint::signal(&enable, 1)]));
        }
        Ok(commands)
    })
}

/// Set steps-per-revolution on every motor that has the field.
pub fn change_motor_srev(srev: i64) -> Provision {
    Provision::new("change_motor_srev", "Change motor SREV", move |ctx| {
        let mut commands = Vec::new();
        for motor in ctx.registry.findall("motor") {
            let Some(field) = motor.component("steps_per_revolution") else {
                continue;
            };
            debug!(motor = %motor.name(), srev, "Set SREV");
            commands.push(PlanCommand::wait_for([motor]));
            commands.push(PlanCommand::mv([SetPoint::signal(&field, srev)]));
        }
        Ok(commands)
    })
    .with_arg("srev", srev)
}

/// Give the shutter a finite recovery time after moving.
pub fn setup_shutter(delay: f64) -> Provision {
    Provision::new("setup_shutter", "Setup shutter", move |ctx| {
        let shutter = ctx.registry.find_as::<SimShutter>("shutter")?;
        let device: Arc<dyn Device> = shutter.clone();
        Ok(vec![
            PlanCommand::wait_for([device]),
            PlanCommand::call("shutter delay", move || async move {
                shutter.set_delay(Duration::from_secs_f64(delay.max(0.0)));
                Ok(())
            }),
        ])
    })
    .with_arg("delay", delay)
}

/// Refresh the energy used for reciprocal-space calculations on `fourc`
/// and `sixc`, when configured.
pub fn setup_diffractometers() -> Provision {
    Provision::new("setup_diffractometers", "Setup diffractometers", |ctx| {
        let mut commands = Vec::new();
        for key in ["fourc", "sixc"] {
            let Some(device) = ctx.registry.find_optional(key) else {
                debug!("No {key:?} diffractometer.");
                continue;
            };
            let diffractometer = downcast_device::<Diffractometer>(device.clone())
                .ok_or_else(|| anyhow::anyhow!("{key} is not a diffractometer"))?;
            commands.push(PlanCommand::wait_for([device]));
            commands.push(PlanCommand::call(format!("{key} energy"), move || async move {
                diffractometer.update_calc_energy().await?;
                Ok(())
            }));
        }
        Ok(commands)
    })
}

/// Program the simulated temperature loop.
pub fn setup_temperature_positioner() -> Provision {
    Provision::new("setup_temperature_positioner", "Setup temperature positioner", |ctx| {
        let temperature = ctx.registry.find_as::<TemperaturePositioner>("temperature")?;
        let device: Arc<dyn Device> = temperature.clone();
        Ok(vec![
            PlanCommand::wait_for([device]),
            PlanCommand::call("setup_temperature", move || async move {
                temperature.setup_temperature(&TemperatureLoop::default()).await?;
                Ok(())
            }),
        ])
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScalerStep {
    Lookup,
    Assign,
    Alias,
    Done,
}

/// Name scaler channels 1-6 (only when channel 1 has no name) and publish
/// the named counters as aliases.
pub struct SetupScaler1 {
    scaler: String,
    names: Vec<String>,
    resolved: Option<Arc<ScalerCh>>,
    step: ScalerStep,
    queue: VecDeque<PlanCommand>,
}

impl SetupScaler1 {
    pub fn new() -> Self {
        Self {
            scaler: "scaler1".to_string(),
            names: SCALER1_CHANNEL_NAMES.iter().map(|s| s.to_string()).collect(),
            resolved: None,
            step: ScalerStep::Lookup,
            queue: VecDeque::new(),
        }
    }

    fn scaler(&self) -> anyhow::Result<Arc<ScalerCh>> {
        self.resolved
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{} used before lookup", self.scaler))
    }

    fn chname_signals(&self, scaler: &ScalerCh) -> anyhow::Result<Vec<beamline_core::signal::Signal>> {
        (1..=self.names.len())
            .map(|n| {
                scaler
                    .channel(n)
                    .map(|c| c.chname.clone())
                    .ok_or_else(|| anyhow::anyhow!("{} has no channel {n}", self.scaler))
            })
            .collect()
    }
}

impl Default for SetupScaler1 {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan for SetupScaler1 {
    fn plan_type(&self) -> &str {
        "setup_scaler1"
    }

    fn plan_name(&self) -> &str {
        "Setup scaler1"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("names".to_string(), self.names.join(","))])
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        loop {
            if let Some(cmd) = self.queue.pop_front() {
                return Ok(Some(cmd));
            }
            match self.step {
                ScalerStep::Lookup => {
                    info!("setup_scaler1()");
                    let scaler = ctx.registry.find_as::<ScalerCh>(&self.scaler)?;
                    let first = self.chname_signals(&scaler)?.remove(0);
                    let device: Arc<dyn Device> = scaler.clone();
                    self.queue.push_back(PlanCommand::wait_for([device]));
                    self.queue.push_back(PlanCommand::Read { signals: vec![first] });
                    self.resolved = Some(scaler);
                    self.step = ScalerStep::Assign;
                }
                ScalerStep::Assign => {
                    let scaler = self.scaler()?;
                    let chnames = self.chname_signals(&scaler)?;
                    let unnamed = ctx
                        .reading(chnames[0].name())
                        .map_or(true, |v| v.to_string().trim().is_empty());
                    if unnamed {
                        info!("{} has no channel names.  Assigning channel names.", self.scaler);
                        self.queue.push_back(PlanCommand::mv(
                            chnames
                                .iter()
                                .zip(&self.names)
                                .map(|(signal, name)| SetPoint::signal(signal, name.as_str())),
                        ));
                        // wait for the IOC
                        self.queue.push_back(PlanCommand::wait(1.0));
                        let select = scaler.clone();
                        self.queue.push_back(PlanCommand::call("select_channels", move || async move {
                            select.select_channels().await?;
                            Ok(())
                        }));
                    }
                    self.queue.push_back(PlanCommand::Read { signals: chnames });
                    self.step = ScalerStep::Alias;
                }
                ScalerStep::Alias => {
                    let scaler = self.scaler()?;
                    for (n, chname) in self.chname_signals(&scaler)?.iter().enumerate() {
                        let alias = ctx
                            .reading(chname.name())
                            .map(PvValue::to_string)
                            .unwrap_or_default();
                        let alias = alias.trim();
                        if alias.is_empty() {
                            continue;
                        }
                        let Some(channel) = scaler.channel(n + 1) else {
                            continue;
                        };
                        debug!("Custom scaler channel {alias:?}");
                        self.queue.push_back(PlanCommand::RegisterAlias {
                            name: alias.to_string(),
                            signal: channel.s.clone(),
                            labels: CHANNEL_LABELS.iter().map(|s| s.to_string()).collect(),
                        });
                    }
                    self.step = ScalerStep::Done;
                }
                ScalerStep::Done => return Ok(None),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DcmStep {
    Lookup,
    Decide,
    Done,
}

/// Bring the Kohzu monochromator motors into the sequencer's control
/// range, then hand control back to the sequencer.
pub struct SetupMonochromator {
    dcm: String,
    range: ControlRange,
    resolved: Option<Arc<KohzuDcm>>,
    step: DcmStep,
    queue: VecDeque<PlanCommand>,
}

impl SetupMonochromator {
    pub fn new(range: ControlRange) -> Self {
        Self {
            dcm: "dcm".to_string(),
            range,
            resolved: None,
            step: DcmStep::Lookup,
            queue: VecDeque::new(),
        }
    }

    fn readback(dcm: &KohzuDcm, axis: DcmAxis) -> anyhow::Result<beamline_core::signal::Signal> {
        component(dcm.motor(axis).as_ref(), "user_readback")
    }
}

impl Plan for SetupMonochromator {
    fn plan_type(&self) -> &str {
        "setup_monochromator"
    }

    fn plan_name(&self) -> &str {
        "Setup monochromator"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("p_theta".to_string(), self.range.theta_min.to_string()),
            ("p_y".to_string(), self.range.y_max.to_string()),
            ("p_z".to_string(), self.range.z_min.to_string()),
        ])
    }

    fn movers(&self) -> Vec<String> {
        vec![self.dcm.clone()]
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        loop {
            if let Some(cmd) = self.queue.pop_front() {
                return Ok(Some(cmd));
            }
            match self.step {
                DcmStep::Lookup => {
                    info!("setup_monochromator()");
                    let dcm = ctx.registry.find_as::<KohzuDcm>(&self.dcm)?;
                    let device: Arc<dyn Device> = dcm.clone();
                    self.queue.push_back(PlanCommand::wait_for([device]));
                    self.queue.push_back(PlanCommand::Read {
                        signals: [DcmAxis::Theta, DcmAxis::Y, DcmAxis::Z]
                            .into_iter()
                            .map(|axis| Self::readback(&dcm, axis))
                            .collect::<anyhow::Result<_>>()?,
                    });
                    self.resolved = Some(dcm);
                    self.step = DcmStep::Decide;
                }
                DcmStep::Decide => {
                    let Some(dcm) = self.resolved.clone() else {
                        anyhow::bail!("{} used before lookup", self.dcm);
                    };
                    let position = |axis| -> anyhow::Result<f64> {
                        ctx.reading_f64(Self::readback(&dcm, axis)?.name())
                    };
                    let moves = self.range.required_moves(
                        position(DcmAxis::Theta)?,
                        position(DcmAxis::Y)?,
                        position(DcmAxis::Z)?,
                    );
                    if moves.is_empty() {
                        debug!(dcm = %self.dcm, "Already in control range");
                    } else {
                        info!(dcm = %self.dcm, ?moves, "Moving into control range");
                        self.queue.push_back(PlanCommand::mv(moves.iter().map(|(axis, target)| {
                            let motor: Arc<dyn Device> = dcm.motor(*axis).clone();
                            SetPoint::device(&motor, *target)
                        })));
                        self.queue.push_back(PlanCommand::wait(1.0));
                        self.queue.push_back(PlanCommand::mv([
                            SetPoint::signal(&dcm.operator_acknowledge, 1),
                            SetPoint::signal(&dcm.mode, "Auto"),
                        ]));
                    }
                    self.step = DcmStep::Done;
                }
                DcmStep::Done => return Ok(None),
            }
        }
    }
}

/// Randomize the simulated image and start the peak dithering. Failures
/// past the device lookup are logged and do not fail the run.
pub struct SetupAreaDetectors {
    detector: String,
    transform: String,
    seed: Option<u64>,
    inner: Option<Recover>,
    queue: VecDeque<PlanCommand>,
    looked_up: bool,
    delegating: bool,
}

impl SetupAreaDetectors {
    pub fn new() -> Self {
        Self {
            detector: "adsimdet".to_string(),
            transform: "ad_transform".to_string(),
            seed: None,
            inner: None,
            queue: VecDeque::new(),
            looked_up: false,
            delegating: false,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Recovered dithering failure, if any.
    pub fn failure(&self) -> Option<&str> {
        self.inner.as_ref().and_then(Recover::failure)
    }

    fn peak_dithering(&self) -> PlanSequence {
        let mut simulation = AdPeakSimulation::new(&self.detector, &self.transform);
        if let Some(seed) = self.seed {
            simulation = simulation.with_seed(seed);
        }
        PlanSequence::new("peak_dithering", "Peak dithering")
            .then(change_ad_simulated_image_parameters(&self.detector, self.seed))
            .then(dither_ad_peak_position(&self.detector, 40.0))
            .then(simulation)
    }
}

impl Default for SetupAreaDetectors {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan for SetupAreaDetectors {
    fn plan_type(&self) -> &str {
        "setup_area_detectors"
    }

    fn plan_name(&self) -> &str {
        "Setup area detectors"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("det".to_string(), self.detector.clone()),
            ("transform".to_string(), self.transform.clone()),
        ])
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        if !self.looked_up {
            info!("setup_area_detectors()");
            let transform = ctx.registry.find_as::<TransformRecord>(&self.transform)?;
            let detector = ctx.registry.find_as::<SimDetector>(&self.detector)?;
            let devices: [Arc<dyn Device>; 2] = [transform, detector];
            for device in &devices {
                debug!("Setup {:?}", device.name());
            }
            self.queue.push_back(PlanCommand::wait_for(devices));
            self.inner = Some(Recover::new("Peak Dithering setup", self.peak_dithering()));
            self.looked_up = true;
        }
        if let Some(cmd) = self.queue.pop_front() {
            return Ok(Some(cmd));
        }
        self.delegating = true;
        match self.inner.as_mut() {
            Some(inner) => inner.next_command(ctx),
            None => Ok(None),
        }
    }

    fn handle_error(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        match self.inner.as_mut() {
            Some(inner) if self.delegating => inner.handle_error(error),
            _ => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::control::{ControlContext, ControlTimeouts};
    use beamline_core::settings::Settings;
    use beamline_hardware::devices::{EpicsMotor, MotorClass, SignalDevice};
    use beamline_hardware::{DeviceRegistry, Namespace, SoftIoc};

    fn context() -> (Arc<SoftIoc>, PlanContext) {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let registry = DeviceRegistry::new();
        registry
            .register(
                Arc::new(EpicsMotor::with_class(&ctx, "gp:m1", "m1", MotorClass::EpicsMotorSrev)),
                ["motor"],
            )
            .unwrap();
        registry
            .register(Arc::new(EpicsMotor::new(&ctx, "gp:m2", "m2")), ["motor"])
            .unwrap();
        registry
            .register(
                Arc::new(SignalDevice::new(
                    "scan_id_epics",
                    beamline_core::signal::Signal::rw(&ctx, "scan_id_epics", "gp:gp:int20").long(),
                )),
                Vec::<String>::new(),
            )
            .unwrap();
        registry
            .register(Arc::new(ScalerCh::new(&ctx, "scaler1", "vsc:scaler1")), ["scalers"])
            .unwrap();
        let mut plan_ctx =
            PlanContext::new(Arc::new(registry), Arc::new(Namespace::new()), Arc::new(Settings::default()));
        plan_ctx.catalog_len = 7;
        (ioc, plan_ctx)
    }

    fn drain(plan: &mut dyn Plan, ctx: &PlanContext) -> Vec<PlanCommand> {
        let mut commands = Vec::new();
        while let Some(cmd) = plan.next_command(ctx).unwrap() {
            commands.push(cmd);
        }
        commands
    }

    #[test]
    fn setup_devices_step_order() {
        assert_eq!(
            setup_devices().steps(),
            [
                "setup_scan_id",
                "enable_user_calcs",
                "change_motor_srev",
                "setup_scaler1",
                "change_noisy_signal_parameters",
                "setup_shutter",
                "setup_monochromator",
                "setup_diffractometers",
                "setup_temperature_positioner",
                "setup_area_detectors",
            ]
        );
    }

    #[test]
    fn scan_id_follows_catalog_size() {
        let (_, ctx) = context();
        let commands = drain(&mut setup_scan_id(), &ctx);
        let PlanCommand::Mv { moves } = &commands[1] else {
            panic!("expected a move, got {:?}", commands[1]);
        };
        assert_eq!(moves[0].value, PvValue::from(7usize));
    }

    #[test]
    fn srev_only_for_motors_with_the_field() {
        let (_, ctx) = context();
        let commands = drain(&mut change_motor_srev(2000), &ctx);
        let targets: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::Mv { moves } => Some(moves[0].target.name().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].starts_with("m1"));
    }

    #[test]
    fn diffractometers_are_optional() {
        let (_, ctx) = context();
        assert!(drain(&mut setup_diffractometers(), &ctx).is_empty());
    }

    #[test]
    fn missing_shutter_fails_lookup() {
        let (_, ctx) = context();
        let err = setup_shutter(0.05).next_command(&ctx).unwrap_err();
        assert!(err.to_string().contains("shutter"));
    }

    #[test]
    fn scaler_names_assigned_when_empty() {
        let (_, mut ctx) = context();
        let mut plan = SetupScaler1::new();
        // wait, read chan01 name
        plan.next_command(&ctx).unwrap();
        plan.next_command(&ctx).unwrap();
        ctx.readings
            .insert("scaler1_chan01_chname".into(), PvValue::from(""));

        let Some(PlanCommand::Mv { moves }) = plan.next_command(&ctx).unwrap() else {
            panic!("expected channel names to be assigned");
        };
        let names: Vec<_> = moves.iter().map(|m| m.value.to_string()).collect();
        assert_eq!(names, SCALER1_CHANNEL_NAMES);
    }

    #[test]
    fn scaler_names_kept_when_present() {
        let (_, mut ctx) = context();
        let mut plan = SetupScaler1::new();
        plan.next_command(&ctx).unwrap();
        plan.next_command(&ctx).unwrap();
        ctx.readings
            .insert("scaler1_chan01_chname".into(), PvValue::from("clock"));
        ctx.readings
            .insert("scaler1_chan02_chname".into(), PvValue::from("I0"));

        assert!(matches!(
            plan.next_command(&ctx).unwrap(),
            Some(PlanCommand::Read { .. })
        ));
        let aliases: Vec<_> = drain(&mut plan, &ctx)
            .into_iter()
            .filter_map(|c| match c {
                PlanCommand::RegisterAlias { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(aliases, ["clock", "I0"]);
    }
}
