//! Simulation plans.
//!
//! These plans drive the simulated IOC so that detectors produce something
//! worth looking at: a noisy Lorentzian on `user_calcs.calc1` that follows
//! `m1`, and a drifting peak on the simulated area detector. Every
//! invocation redraws its random parameters; pass a seed for repeatable
//! runs.

use beamline_core::capabilities::Device;
use beamline_hardware::devices::calcs::scan_rate;
use beamline_hardware::devices::{setup_lorentzian_swait, SimDetector, TransformRecord, UserCalcs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::plans::{component, Plan, PlanCommand, PlanContext, Provision, SetPoint};

/// `SCAN` menu index for a 1 second period.
pub const DITHER_ON_RATE: usize = 6;
/// `SCAN` menu index for Passive.
pub const DITHER_OFF_RATE: usize = 0;

/// Random draws for the simulation plans.
#[derive(Debug)]
pub struct SimRng(StdRng);

impl SimRng {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    /// Uniform in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        self.0.gen::<f64>()
    }

    /// `0.5 + scale * N(0, 1)`
    pub fn randn(&mut self, scale: f64) -> f64 {
        // Box-Muller; 1 - u keeps the log argument in (0, 1].
        let u1 = 1.0 - self.random();
        let u2 = self.random();
        let normal = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        0.5 + scale * normal
    }
}

fn rng_for(seed: Option<u64>) -> SimRng {
    seed.map_or_else(SimRng::from_entropy, SimRng::seeded)
}

fn scan_rate_name(index: usize) -> anyhow::Result<&'static str> {
    scan_rate(index).ok_or_else(|| anyhow::anyhow!("invalid scan rate index {index}"))
}

/// Configure the simulated `noisy` detector: a Lorentzian of the `m1`
/// readback with random center, width, scale and noise.
pub fn change_noisy_signal_parameters(fwhm: f64, peak: f64, noise: f64) -> Provision {
    noisy_signal_parameters(fwhm, peak, noise, None)
}

/// [`change_noisy_signal_parameters`] with a fixed random seed.
pub fn change_noisy_signal_parameters_seeded(fwhm: f64, peak: f64, noise: f64, seed: u64) -> Provision {
    noisy_signal_parameters(fwhm, peak, noise, Some(seed))
}

fn noisy_signal_parameters(fwhm: f64, peak: f64, noise: f64, seed: Option<u64>) -> Provision {
    Provision::new(
        "change_noisy_signal_parameters",
        "Change noisy signal parameters",
        move |ctx| {
            let m1 = ctx.registry.find("m1")?;
            let user_calcs = ctx.registry.find_as::<UserCalcs>("user_calcs")?;
            let calc1 = user_calcs.require(1)?.clone();
            let ref_pv = component(m1.as_ref(), "user_readback")?.read_pv().to_string();

            let mut rng = rng_for(seed);
            let center = 2.0 * rng.random() - 1.0;
            let width = fwhm * rng.random();
            let scale = peak * (9.0 + rng.random());
            let noise = noise * (0.01 + rng.random());

            let reset = calc1.clone();
            let bank: Arc<dyn Device> = user_calcs.clone();
            Ok(vec![
                PlanCommand::wait_for([m1, bank]),
                PlanCommand::mv([SetPoint::signal(&user_calcs.enable, 1)]),
                PlanCommand::call("reset calc1", move || async move { Ok(reset.reset().await?) }),
                PlanCommand::call("setup_lorentzian_swait", move || async move {
                    setup_lorentzian_swait(&calc1, &ref_pv, center, width, scale, noise).await?;
                    Ok(())
                }),
            ])
        },
    )
    .with_arg("fwhm", fwhm)
    .with_arg("peak", peak)
    .with_arg("noise", noise)
}

/// Stop acquisition, pause for the IOC, then reset the camera.
fn stop_and_reset(det: &SimDetector, acquire_time: f64) -> Vec<PlanCommand> {
    let cam = &det.cam;
    vec![
        PlanCommand::mv([SetPoint::signal(&cam.acquire, 0)]),
        PlanCommand::wait(0.25),
        PlanCommand::mv([SetPoint::signal(&cam.reset, 1)]),
        PlanCommand::mv([SetPoint::signal(&cam.acquire_time, acquire_time)]),
    ]
}

/// Make the image a randomly placed peak with random gain, offset and noise.
pub fn change_ad_simulated_image_parameters(det: &str, seed: Option<u64>) -> Provision {
    let name = det.to_string();
    Provision::new(
        "change_ad_simulated_image_parameters",
        "Change simulated image parameters",
        move |ctx| {
            let det = ctx.registry.find_as::<SimDetector>(&name)?;
            let mut rng = rng_for(seed);
            let cam = &det.cam;

            let mut commands = stop_and_reset(&det, 0.01 * (1.0 - 0.5 * rng.random()));
            commands.push(PlanCommand::mv([
                SetPoint::signal(&cam.sim_mode, "Peaks"),
                SetPoint::signal(&cam.gain, 100.0 * (1.0 + rng.random())),
                SetPoint::signal(&cam.offset, 10.0 * rng.random()),
                SetPoint::signal(&cam.noise, 20.0 * rng.random()),
            ]));
            commands.push(PlanCommand::mv([
                SetPoint::signal(&cam.peak_start_x, (200.0 + 500.0 * rng.random()).round() as i64),
                SetPoint::signal(&cam.peak_start_y, (200.0 + 500.0 * rng.random()).round() as i64),
            ]));
            commands.push(PlanCommand::mv([
                SetPoint::signal(&cam.peak_width_x, (10.0 + 100.0 * rng.random()).round() as i64),
                SetPoint::signal(&cam.peak_width_y, (10.0 + 100.0 * rng.random()).round() as i64),
                SetPoint::signal(&cam.peak_variation, 0.5 + 20.0 * rng.random()),
            ]));
            Ok(commands)
        },
    )
    .with_arg("det", det)
}

fn dither_rate_moves(ctx: &PlanContext, rate: usize) -> anyhow::Result<PlanCommand> {
    let user_calcs = ctx.registry.find_as::<UserCalcs>("user_calcs")?;
    let rate = scan_rate_name(rate)?;
    Ok(PlanCommand::mv([
        SetPoint::signal(&user_calcs.require(9)?.scanning_rate, rate),
        SetPoint::signal(&user_calcs.require(10)?.scanning_rate, rate),
    ]))
}

/// Start processing the peak dither records at `rate` (a `SCAN` menu index).
pub fn dither_ad_on(rate: usize) -> Provision {
    Provision::new("dither_ad_on", "Dither on", move |ctx| {
        Ok(vec![dither_rate_moves(ctx, rate)?])
    })
    .with_arg("rate", rate)
}

/// Stop the peak dither records.
pub fn dither_ad_off() -> Provision {
    Provision::new("dither_ad_off", "Dither off", |ctx| {
        Ok(vec![dither_rate_moves(ctx, DITHER_OFF_RATE)?])
    })
}

/// Program `calc9`/`calc10` to move the peak start by up to `magnitude`
/// pixels each period, bounded to `[100, 900]`, then switch them on.
pub fn dither_ad_peak_position(det: &str, magnitude: f64) -> Provision {
    let name = det.to_string();
    Provision::new("dither_ad_peak_position", "Dither peak position", move |ctx| {
        let det = ctx.registry.find_as::<SimDetector>(&name)?;
        let user_calcs = ctx.registry.find_as::<UserCalcs>("user_calcs")?;
        let formula = format!("min(B,max(C,A+{magnitude}*(RNDM-0.5)))");

        let mut commands = Vec::new();
        for (axis, record, peak) in [
            ("X", user_calcs.require(9)?, &det.cam.peak_start_x),
            ("Y", user_calcs.require(10)?, &det.cam.peak_start_y),
        ] {
            let output = peak.write_pv().unwrap_or(peak.read_pv());
            commands.push(PlanCommand::mv([
                SetPoint::signal(&record.description, format!("{name} peak {axis} dither")),
                SetPoint::signal(&record.calculation, formula.as_str()),
                SetPoint::signal(&record.require('A')?.input_pv, peak.read_pv()),
                SetPoint::signal(&record.require('B')?.input_value, 900.0),
                SetPoint::signal(&record.require('C')?.input_value, 100.0),
                SetPoint::signal(&record.output_link_pv, output),
            ]));
        }
        commands.push(dither_rate_moves(ctx, DITHER_ON_RATE)?);
        Ok(commands)
    })
    .with_arg("det", det)
    .with_arg("magnitude", magnitude)
}

/// Parameters of [`AdPeakSimulation`]. `None` fields are drawn at random
/// from the detector size when the plan runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSimulation {
    pub gain: Option<f64>,
    pub offset: Option<f64>,
    pub noise: Option<f64>,
    pub x0: Option<f64>,
    pub y0: Option<f64>,
    pub pos_step: Option<f64>,
    pub sigma_x: Option<f64>,
    pub sigma_y: Option<f64>,
    pub sigma_step: Option<f64>,
    pub variation: Option<f64>,
    /// Bias of the random walk; 0.5 is unbiased.
    pub balance: f64,
    /// Pixels kept clear at the image edge.
    pub border: f64,
}

impl Default for PeakSimulation {
    fn default() -> Self {
        Self {
            gain: None,
            offset: None,
            noise: None,
            x0: None,
            y0: None,
            pos_step: None,
            sigma_x: None,
            sigma_y: None,
            sigma_step: None,
            variation: None,
            balance: 0.45,
            border: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PeakStep {
    Lookup,
    Program,
    Done,
}

/// Program a transform record to random-walk the simulated peak position
/// and width, keeping both inside the image.
pub struct AdPeakSimulation {
    det: String,
    transform: String,
    params: PeakSimulation,
    rng: SimRng,
    step: PeakStep,
    resolved: Option<(Arc<SimDetector>, Arc<TransformRecord>)>,
    queue: VecDeque<PlanCommand>,
}

impl AdPeakSimulation {
    pub fn new(det: &str, transform: &str) -> Self {
        Self {
            det: det.to_string(),
            transform: transform.to_string(),
            params: PeakSimulation::default(),
            rng: SimRng::from_entropy(),
            step: PeakStep::Lookup,
            resolved: None,
            queue: VecDeque::new(),
        }
    }

    pub fn with_params(mut self, params: PeakSimulation) -> Self {
        self.params = params;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SimRng::seeded(seed);
        self
    }

    fn lookup(&mut self, ctx: &PlanContext) -> anyhow::Result<()> {
        let det = ctx.registry.find_as::<SimDetector>(&self.det)?;
        let tr = ctx.registry.find_as::<TransformRecord>(&self.transform)?;

        let reset = tr.clone();
        self.queue.push_back(PlanCommand::call("reset transform", move || async move {
            Ok(reset.reset().await?)
        }));
        let acquire_time = 0.02 * (1.0 - 0.5 * self.rng.random());
        self.queue.extend(stop_and_reset(&det, acquire_time));
        self.queue.push_back(PlanCommand::Read {
            signals: vec![det.cam.max_size_x.clone(), det.cam.max_size_y.clone()],
        });
        self.resolved = Some((det, tr));
        Ok(())
    }

    fn program(&mut self, ctx: &PlanContext) -> anyhow::Result<()> {
        let Some((det, tr)) = self.resolved.clone() else {
            anyhow::bail!("{} used before lookup", self.det);
        };
        let cam = &det.cam;
        let max_x = ctx.reading_f64(cam.max_size_x.name())?;
        let max_y = ctx.reading_f64(cam.max_size_y.name())?;
        let max_pixel = max_x.min(max_y);

        let p = self.params.clone();
        let rng = &mut self.rng;
        let gain = p.gain.unwrap_or_else(|| 50.0 + 150.0 * rng.randn(0.3));
        let offset = p.offset.unwrap_or_else(|| 10.0 * rng.random());
        let noise = p.noise.unwrap_or_else(|| 20.0 * rng.random());
        let x0 = p.x0.unwrap_or_else(|| max_x * rng.randn(0.3));
        let y0 = p.y0.unwrap_or_else(|| max_y * rng.randn(0.3));
        let pos_step = p.pos_step.unwrap_or(max_pixel / 40.0);
        let sigma_x = p.sigma_x.unwrap_or_else(|| 0.15 * max_pixel * rng.randn(0.3));
        let sigma_y = p.sigma_y.unwrap_or_else(|| 0.15 * max_pixel * rng.randn(0.3));
        let sigma_step = p.sigma_step.unwrap_or(max_pixel / 40.0);
        let variation = p.variation.unwrap_or_else(|| 0.5 + 20.0 * rng.random());
        debug!(detector = %self.det, max_pixel, gain, x0, y0, sigma_x, sigma_y, "Peak simulation");

        self.queue.push_back(PlanCommand::mv([
            SetPoint::signal(&cam.peak_start_x, x0.round() as i64),
            SetPoint::signal(&cam.peak_start_y, y0.round() as i64),
            SetPoint::signal(&cam.peak_width_x, sigma_x.round() as i64),
            SetPoint::signal(&cam.peak_width_y, sigma_y.round() as i64),
            SetPoint::signal(&cam.peak_variation, variation.max(0.0)),
            SetPoint::signal(&tr.description, format!("{} peak dither", det.prefix())),
        ]));
        self.queue.push_back(PlanCommand::mv([
            SetPoint::signal(&cam.sim_mode, "Peaks"),
            SetPoint::signal(&cam.gain, gain),
            SetPoint::signal(&cam.offset, offset),
            SetPoint::signal(&cam.noise, noise),
        ]));

        let expression = |v: char, lo: char, hi: char, step: char| {
            format!("min(max({v},{lo}),{hi})+{step}*(rndm-{:.3})", p.balance)
        };
        let link = |signal: &beamline_core::signal::Signal, write: bool| {
            let pv = if write {
                signal.write_pv().unwrap_or(signal.read_pv())
            } else {
                signal.read_pv()
            };
            format!("{pv} NPP NMS")
        };

        let mut moves = Vec::new();
        for (letter, comment, value) in [
            ('A', "position minimum", p.border),
            ('B', "position maximum", max_pixel - p.border - 1.0),
            ('C', "position step", pos_step),
            ('F', "width minimum", max_pixel / 100.0),
            ('G', "width maximum", max_pixel / 6.0),
            ('H', "width step", sigma_step),
        ] {
            let chan = tr.require(letter)?;
            moves.push(SetPoint::signal(&chan.comment, comment));
            moves.push(SetPoint::signal(&chan.current_value, value));
        }
        for (letter, comment, signal, bounds) in [
            ('D', "position X", &cam.peak_start_x, ('a', 'b', 'c')),
            ('E', "position Y", &cam.peak_start_y, ('a', 'b', 'c')),
            ('I', "width X", &cam.peak_width_x, ('f', 'g', 'h')),
            ('J', "width Y", &cam.peak_width_y, ('f', 'g', 'h')),
        ] {
            let chan = tr.require(letter)?;
            let own = letter.to_ascii_lowercase();
            moves.push(SetPoint::signal(&chan.comment, comment));
            moves.push(SetPoint::signal(&chan.input_pv, link(signal, false)));
            moves.push(SetPoint::signal(&chan.expression, expression(own, bounds.0, bounds.1, bounds.2)));
            moves.push(SetPoint::signal(&chan.output_pv, link(signal, true)));
        }
        moves.push(SetPoint::signal(&tr.calc_option, "Always"));
        moves.push(SetPoint::signal(&tr.scanning_rate, scan_rate_name(DITHER_ON_RATE)?));
        self.queue.push_back(PlanCommand::mv(moves));
        Ok(())
    }
}

impl Plan for AdPeakSimulation {
    fn plan_type(&self) -> &str {
        "ad_peak_simulation"
    }

    fn plan_name(&self) -> &str {
        "Area detector peak simulation"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("det".to_string(), self.det.clone()),
            ("transform".to_string(), self.transform.clone()),
            ("balance".to_string(), self.params.balance.to_string()),
            ("border".to_string(), self.params.border.to_string()),
        ])
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        loop {
            if let Some(cmd) = self.queue.pop_front() {
                return Ok(Some(cmd));
            }
            match self.step {
                PeakStep::Lookup => {
                    self.lookup(ctx)?;
                    self.step = PeakStep::Program;
                }
                PeakStep::Program => {
                    self.program(ctx)?;
                    self.step = PeakStep::Done;
                }
                PeakStep::Done => return Ok(None),
            }
        }
    }
}

/// Stage the area detector the standard way: plugins never block, the cam
/// waits for them, and HDF5 files follow the configured template.
pub fn ad_setup(det: &str) -> Provision {
    let name = det.to_string();
    Provision::new("ad_setup", "Area detector setup", move |ctx| {
        let det = ctx.registry.find_as::<SimDetector>(&name)?;
        let config = ctx.settings.area_detector.clone();

        let staging = det.clone();
        let mut commands = vec![
            PlanCommand::call("plugin stage values", move || async move {
                staging.set_stage_sig(&staging.image.blocking_callbacks, "No");
                staging.set_stage_sig(&staging.hdf1.base.blocking_callbacks, "No");
                staging.set_stage_sig(&staging.cam.wait_for_plugins, "Yes");
                Ok(())
            }),
            PlanCommand::mv([
                SetPoint::signal(&det.hdf1.create_directory, -5),
                SetPoint::signal(&det.hdf1.file_template, config.hdf5_file_template.as_str()),
            ]),
        ];
        let hdf = det.clone();
        commands.push(PlanCommand::call("hdf1 stage values", move || async move {
            hdf.set_stage_sig(&hdf.hdf1.compression, "zlib");
            // capture is written last when staging
            hdf.set_stage_sig(&hdf.hdf1.capture, 1);
            Ok(())
        }));
        if config.allow_plugin_warmup {
            let warm = det.clone();
            commands.push(PlanCommand::call("hdf1 warm-up", move || async move {
                if !warm.is_primed().await? {
                    warm.prime().await?;
                } else {
                    info!(detector = %warm.name(), "HDF5 plugin already primed");
                }
                Ok(())
            }));
        }
        Ok(commands)
    })
    .with_arg("det", det)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::control::{ControlContext, ControlTimeouts};
    use beamline_core::settings::Settings;
    use beamline_core::value::PvValue;
    use beamline_hardware::devices::SimShutter;
    use beamline_hardware::{DeviceRegistry, Namespace, SoftIoc};

    fn context(ioc: &Arc<SoftIoc>) -> PlanContext {
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        let registry = DeviceRegistry::new();
        registry
            .register(Arc::new(SimDetector::new(&ctx, "adsimdet", "ad:")), ["area_detector"])
            .unwrap();
        registry
            .register(Arc::new(TransformRecord::new(&ctx, "ad_transform", "gp:userTran10")), ["calcs"])
            .unwrap();
        registry
            .register(Arc::new(UserCalcs::new(&ctx, "user_calcs", "gp:")), ["calcs"])
            .unwrap();
        registry.register(Arc::new(SimShutter::new("shutter")), ["shutters"]).unwrap();
        PlanContext::new(Arc::new(registry), Arc::new(Namespace::new()), Arc::new(Settings::default()))
    }

    fn drain(plan: &mut dyn Plan, ctx: &PlanContext) -> Vec<PlanCommand> {
        let mut commands = Vec::new();
        while let Some(cmd) = plan.next_command(ctx).unwrap() {
            commands.push(cmd);
        }
        commands
    }

    fn moves(commands: &[PlanCommand]) -> Vec<(String, PvValue)> {
        commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::Mv { moves } => Some(moves),
                _ => None,
            })
            .flatten()
            .map(|m| (m.target.name().to_string(), m.value.clone()))
            .collect()
    }

    #[test]
    fn randn_is_centred_on_one_half() {
        let mut rng = SimRng::seeded(7);
        let mean: f64 = (0..2000).map(|_| rng.randn(0.3)).sum::<f64>() / 2000.0;
        assert!((mean - 0.5).abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn image_parameters_stay_in_range() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = context(&ioc);
        let mut plan = change_ad_simulated_image_parameters("adsimdet", Some(3));
        let commands = drain(&mut plan, &ctx);
        assert!(matches!(commands[1], PlanCommand::Wait { seconds } if seconds == 0.25));

        let set: BTreeMap<_, _> = moves(&commands).into_iter().collect();
        assert_eq!(set["adsimdet_cam_acquire"], PvValue::Long(0));
        assert_eq!(set["adsimdet_cam_sim_mode"], PvValue::from("Peaks"));
        let gain = set["adsimdet_cam_gain"].as_f64().unwrap();
        assert!((100.0..200.0).contains(&gain));
        for axis in ["x", "y"] {
            let start = set[format!("adsimdet_cam_peak_start_{axis}").as_str()].as_f64().unwrap();
            assert!((200.0..=700.0).contains(&start));
            let width = set[format!("adsimdet_cam_peak_width_{axis}").as_str()].as_f64().unwrap();
            assert!((10.0..=110.0).contains(&width));
        }
    }

    #[test]
    fn dither_programs_calc9_and_calc10() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = context(&ioc);
        let mut plan = dither_ad_peak_position("adsimdet", 40.0);
        let set = moves(&drain(&mut plan, &ctx));

        let calc = set
            .iter()
            .find(|(name, _)| name.starts_with("user_calcs_calc9") && name.ends_with("calculation"))
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_eq!(calc, "min(B,max(C,A+40*(RNDM-0.5)))");
        assert!(set.iter().any(|(_, v)| v.to_string() == "ad:cam1:PeakStartY"));
        let rates: Vec<_> = set
            .iter()
            .filter(|(name, _)| name.ends_with("scanning_rate"))
            .map(|(_, v)| v.to_string())
            .collect();
        assert_eq!(rates, ["1 second", "1 second"]);
    }

    #[test]
    fn dither_off_is_passive() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = context(&ioc);
        let set = moves(&drain(&mut dither_ad_off(), &ctx));
        assert!(set.iter().all(|(_, v)| v.to_string() == "Passive"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn peak_simulation_uses_detector_size() {
        let ioc = Arc::new(SoftIoc::new());
        let mut ctx = context(&ioc);
        let mut plan = AdPeakSimulation::new("adsimdet", "ad_transform")
            .with_seed(11)
            .with_params(PeakSimulation {
                x0: Some(512.0),
                ..PeakSimulation::default()
            });

        // reset, acquire, sleep, reset, acquire_time, read sizes
        let mut lookup = Vec::new();
        for _ in 0..6 {
            lookup.push(plan.next_command(&ctx).unwrap().unwrap());
        }
        assert!(matches!(lookup[5], PlanCommand::Read { .. }));
        ctx.readings.insert("adsimdet_cam_max_size_x".into(), PvValue::Long(1024));
        ctx.readings.insert("adsimdet_cam_max_size_y".into(), PvValue::Long(1024));

        let set = moves(&drain(&mut plan, &ctx));
        let value = |suffix: &str| {
            set.iter()
                .find(|(name, _)| name.ends_with(suffix))
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(value("peak_start_x"), PvValue::Long(512));
        assert_eq!(value("_A_current_value").as_f64(), Some(100.0));
        assert_eq!(value("_B_current_value").as_f64(), Some(923.0));
        assert_eq!(value("_C_current_value").as_f64(), Some(25.6));
        assert_eq!(value("_D_expression").to_string(), "min(max(d,a),b)+c*(rndm-0.450)");
        assert_eq!(value("_D_input_pv").to_string(), "ad:cam1:PeakStartX_RBV NPP NMS");
        assert_eq!(value("_D_output_pv").to_string(), "ad:cam1:PeakStartX NPP NMS");
        assert_eq!(value("calc_option").to_string(), "Always");
    }

    #[test]
    fn missing_transform_fails_lookup() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = context(&ioc);
        let mut plan = AdPeakSimulation::new("adsimdet", "nope");
        assert!(plan.next_command(&ctx).is_err());
    }

    #[test]
    fn ad_setup_writes_template() {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = context(&ioc);
        let set = moves(&drain(&mut ad_setup("adsimdet"), &ctx));
        assert_eq!(set[0].1, PvValue::Long(-5));
        assert_eq!(
            set[1].1.to_string(),
            Settings::default().area_detector.hdf5_file_template
        );
    }
}
