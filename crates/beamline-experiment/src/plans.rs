//! Plan protocol.
//!
//! Plans are state machines that yield commands for the RunEngine to
//! execute. A plan never touches hardware itself: it describes what should
//! happen, and the engine performs each command, awaiting it before asking
//! for the next one.
//!
//! # Plan Commands
//!
//! - `Mv` - batched moves, executed concurrently and awaited together
//! - `Read` / `ReadDevice` - read values into the context and the pending event
//! - `Trigger` - trigger a detector
//! - `Wait` - sleep (interruptible by abort)
//! - `WaitForConnection` - wait for devices using the configured timeout
//! - `Checkpoint` - safe point for pause/resume
//! - `EmitEvent` - bundle pending readings into an event document
//! - `RegisterAlias` - add a signal to the registry and operator namespace
//! - `Call` - run one async device operation
//!
//! # Example Plan
//!
//! ```rust,ignore
//! let plan = LineScan::new("m1", -1.0, 1.0, 21).with_detector("scaler1");
//!
//! // Plan yields commands like:
//! // Mv [m1 -> -1.0]
//! // Checkpoint
//! // Trigger(scaler1)
//! // Read [m1]
//! // ReadDevice(scaler1)
//! // EmitEvent("primary")
//! // Mv [m1 -> -0.9]
//! // ...
//! ```
//!
//! Plans that need a value from the hardware yield a `Read` and pick the
//! result up from [`PlanContext::readings`] on the following call to
//! `next_command`.

use beamline_core::capabilities::Device;
use beamline_core::settings::Settings;
use beamline_core::signal::Signal;
use beamline_core::value::PvValue;
use beamline_hardware::{DeviceRegistry, Namespace};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the stream that carries the measured points.
pub const PRIMARY_STREAM: &str = "primary";

/// One-shot async operation carried by [`PlanCommand::Call`].
pub type DeviceOp = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// What a move addresses.
#[derive(Clone)]
pub enum MoveTarget {
    /// A registered device: moved with its positioner if it has one,
    /// otherwise its setpoint signal is written.
    Device(Arc<dyn Device>),
    /// A single control point.
    Signal(Signal),
}

impl MoveTarget {
    pub fn name(&self) -> &str {
        match self {
            MoveTarget::Device(device) => device.name(),
            MoveTarget::Signal(signal) => signal.name(),
        }
    }
}

impl fmt::Debug for MoveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveTarget::Device(device) => write!(f, "Device({})", device.name()),
            MoveTarget::Signal(signal) => write!(f, "Signal({})", signal.name()),
        }
    }
}

/// One element of a batched move.
#[derive(Debug, Clone)]
pub struct SetPoint {
    pub target: MoveTarget,
    pub value: PvValue,
}

impl SetPoint {
    pub fn device(device: &Arc<dyn Device>, value: impl Into<PvValue>) -> Self {
        Self {
            target: MoveTarget::Device(device.clone()),
            value: value.into(),
        }
    }

    pub fn signal(signal: &Signal, value: impl Into<PvValue>) -> Self {
        Self {
            target: MoveTarget::Signal(signal.clone()),
            value: value.into(),
        }
    }
}

/// Commands that plans yield for the RunEngine to execute
pub enum PlanCommand {
    /// Move every target, concurrently, and wait for all of them
    Mv { moves: Vec<SetPoint> },
    /// Read signals; values land in the context and the pending event
    Read { signals: Vec<Signal> },
    /// Read every hinted/normal signal of a device
    ReadDevice { device: Arc<dyn Device> },
    /// Trigger a detector and wait for the acquisition to finish
    Trigger { device: Arc<dyn Device> },
    /// Wait for a duration in seconds
    Wait { seconds: f64 },
    /// Wait until every device is connected
    WaitForConnection { devices: Vec<Arc<dyn Device>> },
    /// Checkpoint - safe point for pause/resume
    Checkpoint { label: String },
    /// Emit an event document from the readings collected since the last one
    EmitEvent { stream: String },
    /// Register a signal under a new name in the registry and the namespace
    RegisterAlias {
        name: String,
        signal: Signal,
        labels: Vec<String>,
    },
    /// Run an async device operation
    Call { label: String, op: DeviceOp },
}

impl PlanCommand {
    pub fn mv(moves: impl IntoIterator<Item = SetPoint>) -> Self {
        PlanCommand::Mv {
            moves: moves.into_iter().collect(),
        }
    }

    pub fn wait(seconds: f64) -> Self {
        PlanCommand::Wait { seconds }
    }

    pub fn checkpoint(label: impl Into<String>) -> Self {
        PlanCommand::Checkpoint {
            label: label.into(),
        }
    }

    pub fn wait_for(devices: impl IntoIterator<Item = Arc<dyn Device>>) -> Self {
        PlanCommand::WaitForConnection {
            devices: devices.into_iter().collect(),
        }
    }

    /// Wrap an async operation. `op` runs when the engine reaches the command.
    pub fn call<F, Fut>(label: impl Into<String>, op: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        PlanCommand::Call {
            label: label.into(),
            op: Box::new(move || op().boxed()),
        }
    }

    /// Short command name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PlanCommand::Mv { .. } => "mv",
            PlanCommand::Read { .. } => "read",
            PlanCommand::ReadDevice { .. } => "read_device",
            PlanCommand::Trigger { .. } => "trigger",
            PlanCommand::Wait { .. } => "wait",
            PlanCommand::WaitForConnection { .. } => "wait_for_connection",
            PlanCommand::Checkpoint { .. } => "checkpoint",
            PlanCommand::EmitEvent { .. } => "emit_event",
            PlanCommand::RegisterAlias { .. } => "register_alias",
            PlanCommand::Call { .. } => "call",
        }
    }
}

impl fmt::Debug for PlanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanCommand::Mv { moves } => f.debug_struct("Mv").field("moves", moves).finish(),
            PlanCommand::Read { signals } => {
                let names: Vec<_> = signals.iter().map(Signal::name).collect();
                f.debug_struct("Read").field("signals", &names).finish()
            }
            PlanCommand::ReadDevice { device } => {
                f.debug_tuple("ReadDevice").field(&device.name()).finish()
            }
            PlanCommand::Trigger { device } => f.debug_tuple("Trigger").field(&device.name()).finish(),
            PlanCommand::Wait { seconds } => f.debug_struct("Wait").field("seconds", seconds).finish(),
            PlanCommand::WaitForConnection { devices } => {
                let names: Vec<_> = devices.iter().map(|d| d.name()).collect();
                f.debug_struct("WaitForConnection").field("devices", &names).finish()
            }
            PlanCommand::Checkpoint { label } => {
                f.debug_struct("Checkpoint").field("label", label).finish()
            }
            PlanCommand::EmitEvent { stream } => {
                f.debug_struct("EmitEvent").field("stream", stream).finish()
            }
            PlanCommand::RegisterAlias { name, signal, labels } => f
                .debug_struct("RegisterAlias")
                .field("name", name)
                .field("signal", &signal.name())
                .field("labels", labels)
                .finish(),
            PlanCommand::Call { label, .. } => {
                f.debug_struct("Call").field("label", label).finish_non_exhaustive()
            }
        }
    }
}

/// What a plan can see while it decides its next command.
#[derive(Clone)]
pub struct PlanContext {
    pub registry: Arc<DeviceRegistry>,
    pub namespace: Arc<Namespace>,
    pub settings: Arc<Settings>,
    /// Number of runs in the catalog when this run started.
    pub catalog_len: usize,
    /// Values produced by `Read`/`ReadDevice`, keyed by signal name.
    pub readings: BTreeMap<String, PvValue>,
}

impl PlanContext {
    pub fn new(registry: Arc<DeviceRegistry>, namespace: Arc<Namespace>, settings: Arc<Settings>) -> Self {
        Self {
            registry,
            namespace,
            settings,
            catalog_len: 0,
            readings: BTreeMap::new(),
        }
    }

    pub fn reading(&self, name: &str) -> Option<&PvValue> {
        self.readings.get(name)
    }

    /// Numeric reading, failing if the signal was never read.
    pub fn reading_f64(&self, name: &str) -> anyhow::Result<f64> {
        let value = self
            .reading(name)
            .ok_or_else(|| anyhow::anyhow!("no reading for '{name}'"))?;
        Ok(value.expect_f64(name)?)
    }
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send {
    /// Plan type identifier (e.g., "line_scan", "setup_scaler1")
    fn plan_type(&self) -> &str;

    /// Human-readable plan name
    fn plan_name(&self) -> &str;

    /// Plan arguments recorded in the start document
    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Devices that will be moved (for hints)
    fn movers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Devices that will be read (for hints)
    fn detectors(&self) -> Vec<String> {
        Vec::new()
    }

    /// Total number of points, when known
    fn num_points(&self) -> usize {
        0
    }

    /// Generate the next command, returning `Ok(None)` when complete.
    ///
    /// An error ends the run with exit status `fail`.
    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>>;

    /// Offered the error of a command this plan yielded. Returning `Ok`
    /// recovers and execution continues with the next command.
    fn handle_error(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        Err(error)
    }
}

/// Runs plans one after another, with a checkpoint labelled by each plan's
/// type before it starts.
pub struct PlanSequence {
    plan_type: String,
    plan_name: String,
    pending: VecDeque<Box<dyn Plan>>,
    current: Option<Box<dyn Plan>>,
}

impl PlanSequence {
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            pending: VecDeque::new(),
            current: None,
        }
    }

    pub fn then(mut self, plan: impl Plan + 'static) -> Self {
        self.pending.push_back(Box::new(plan));
        self
    }

    pub fn then_boxed(mut self, plan: Box<dyn Plan>) -> Self {
        self.pending.push_back(plan);
        self
    }

    /// Step types in execution order.
    pub fn steps(&self) -> Vec<String> {
        self.pending.iter().map(|p| p.plan_type().to_string()).collect()
    }
}

impl Plan for PlanSequence {
    fn plan_type(&self) -> &str {
        &self.plan_type
    }

    fn plan_name(&self) -> &str {
        &self.plan_name
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("steps".to_string(), self.steps().join(","))])
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        if let Some(plan) = self.current.as_mut() {
            match plan.next_command(ctx) {
                Ok(Some(cmd)) => return Ok(Some(cmd)),
                Ok(None) => self.current = None,
                Err(e) => {
                    let step = plan.plan_type().to_string();
                    return Err(e.context(format!("{step} failed")));
                }
            }
        }
        let Some(next) = self.pending.pop_front() else {
            return Ok(None);
        };
        let label = next.plan_type().to_string();
        info!(sequence = %self.plan_type, step = %label, "Starting step");
        self.current = Some(next);
        Ok(Some(PlanCommand::Checkpoint { label }))
    }

    fn handle_error(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        match self.current.as_mut() {
            Some(plan) => {
                let step = plan.plan_type().to_string();
                plan.handle_error(error)
                    .map_err(|e| e.context(format!("{step} failed")))
            }
            None => Err(error),
        }
    }
}

/// Runs a plan and turns any failure into a warning. After a failure the
/// remaining commands of the inner plan are skipped.
pub struct Recover {
    what: String,
    inner: Option<Box<dyn Plan>>,
    failure: Option<String>,
}

impl Recover {
    pub fn new(what: &str, plan: impl Plan + 'static) -> Self {
        Self {
            what: what.to_string(),
            inner: Some(Box::new(plan)),
            failure: None,
        }
    }

    /// The recovered error, if the inner plan failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn recovered(&mut self, error: anyhow::Error) {
        warn!("{} failed: {error:#}", self.what);
        self.failure = Some(format!("{error:#}"));
        self.inner = None;
    }
}

impl Plan for Recover {
    fn plan_type(&self) -> &str {
        self.inner.as_ref().map_or("recover", |p| p.plan_type())
    }

    fn plan_name(&self) -> &str {
        &self.what
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        match inner.next_command(ctx) {
            Ok(Some(cmd)) => Ok(Some(cmd)),
            Ok(None) => {
                self.inner = None;
                Ok(None)
            }
            Err(e) => {
                self.recovered(e);
                Ok(None)
            }
        }
    }

    fn handle_error(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(error);
        };
        if let Err(e) = inner.handle_error(error) {
            self.recovered(e);
        }
        Ok(())
    }
}

/// Builds its commands from the context the first time it is asked, then
/// yields them in order. Lookup errors raised by the builder fail the run.
pub struct Provision {
    plan_type: String,
    plan_name: String,
    args: BTreeMap<String, String>,
    build: Option<ProvisionFn>,
    queue: VecDeque<PlanCommand>,
}

type ProvisionFn = Box<dyn FnOnce(&PlanContext) -> anyhow::Result<Vec<PlanCommand>> + Send>;

impl Provision {
    pub fn new<F>(plan_type: &str, plan_name: &str, build: F) -> Self
    where
        F: FnOnce(&PlanContext) -> anyhow::Result<Vec<PlanCommand>> + Send + 'static,
    {
        Self {
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            args: BTreeMap::new(),
            build: Some(Box::new(build)),
            queue: VecDeque::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }
}

impl Plan for Provision {
    fn plan_type(&self) -> &str {
        &self.plan_type
    }

    fn plan_name(&self) -> &str {
        &self.plan_name
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        self.args.clone()
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        if let Some(build) = self.build.take() {
            info!("{}()", self.plan_type);
            self.queue = build(ctx)?.into();
        }
        Ok(self.queue.pop_front())
    }
}

/// Signal that reports where a device is: the motor readback, else the
/// setpoint, else the device's first signal.
pub fn position_signal(device: &dyn Device) -> Option<Signal> {
    device
        .component("user_readback")
        .or_else(|| device.setpoint())
        .or_else(|| device.signals().into_iter().map(|(_, s)| s).next())
}

/// Named component of a device, or an error naming both.
pub fn component(device: &dyn Device, path: &str) -> anyhow::Result<Signal> {
    device
        .component(path)
        .ok_or_else(|| anyhow::anyhow!("{} has no component '{path}'", device.name()))
}

/// Count - read detectors repeatedly without moving anything
pub struct Count {
    num_points: usize,
    detectors: Vec<String>,
    delay: f64,

    // Execution state
    resolved: Vec<Arc<dyn Device>>,
    current_point: usize,
    current_step: CountStep,
    queue: VecDeque<PlanCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CountStep {
    Lookup,
    Point,
    Done,
}

impl Count {
    pub fn new(num_points: usize) -> Self {
        Self {
            num_points,
            detectors: Vec::new(),
            delay: 0.0,
            resolved: Vec::new(),
            current_point: 0,
            current_step: CountStep::Lookup,
            queue: VecDeque::new(),
        }
    }

    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    pub fn with_detectors(mut self, detectors: &[&str]) -> Self {
        self.detectors.extend(detectors.iter().map(|s| s.to_string()));
        self
    }

    /// Delay between points in seconds
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds;
        self
    }
}

impl Plan for Count {
    fn plan_type(&self) -> &str {
        "count"
    }

    fn plan_name(&self) -> &str {
        "Count"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("num_points".to_string(), self.num_points.to_string()),
            ("detectors".to_string(), self.detectors.join(",")),
            ("delay".to_string(), self.delay.to_string()),
        ])
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        loop {
            if let Some(cmd) = self.queue.pop_front() {
                return Ok(Some(cmd));
            }
            match self.current_step {
                CountStep::Lookup => {
                    self.resolved = self
                        .detectors
                        .iter()
                        .map(|name| ctx.registry.find(name))
                        .collect::<Result<_, _>>()?;
                    self.queue.push_back(PlanCommand::wait_for(self.resolved.iter().cloned()));
                    self.current_step = CountStep::Point;
                }
                CountStep::Point => {
                    if self.current_point >= self.num_points {
                        self.current_step = CountStep::Done;
                        continue;
                    }
                    if self.current_point > 0 && self.delay > 0.0 {
                        self.queue.push_back(PlanCommand::wait(self.delay));
                    }
                    self.queue
                        .push_back(PlanCommand::checkpoint(format!("point_{}", self.current_point)));
                    for det in &self.resolved {
                        self.queue.push_back(PlanCommand::Trigger { device: det.clone() });
                    }
                    for det in &self.resolved {
                        self.queue.push_back(PlanCommand::ReadDevice { device: det.clone() });
                    }
                    self.queue.push_back(PlanCommand::EmitEvent {
                        stream: PRIMARY_STREAM.to_string(),
                    });
                    self.current_point += 1;
                }
                CountStep::Done => return Ok(None),
            }
        }
    }
}

/// Line scan - step one positioner with one or more detectors, either
/// between absolute positions or relative to where the positioner starts.
pub struct LineScan {
    axis: String,
    start: f64,
    stop: f64,
    num_points: usize,
    detectors: Vec<String>,
    settle_time: f64,
    relative: bool,

    // Execution state
    motor: Option<Arc<dyn Device>>,
    readback: Option<Signal>,
    resolved: Vec<Arc<dyn Device>>,
    origin: f64,
    current_point: usize,
    current_step: LineScanStep,
    queue: VecDeque<PlanCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineScanStep {
    Lookup,
    Origin,
    Point,
    Return,
    Done,
}

impl LineScan {
    pub fn new(axis: &str, start: f64, stop: f64, num_points: usize) -> Self {
        Self {
            axis: axis.to_string(),
            start,
            stop,
            num_points,
            detectors: Vec::new(),
            settle_time: 0.0,
            relative: false,
            motor: None,
            readback: None,
            resolved: Vec::new(),
            origin: 0.0,
            current_point: 0,
            current_step: LineScanStep::Lookup,
            queue: VecDeque::new(),
        }
    }

    /// Positions are offsets from the starting position; the positioner
    /// returns there when the scan ends.
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detectors.push(detector.to_string());
        self
    }

    pub fn with_detectors(mut self, detectors: &[&str]) -> Self {
        self.detectors.extend(detectors.iter().map(|s| s.to_string()));
        self
    }

    /// Set settle time in seconds
    pub fn with_settle_time(mut self, seconds: f64) -> Self {
        self.settle_time = seconds;
        self
    }

    fn position_at(&self, point: usize) -> f64 {
        if self.num_points <= 1 {
            self.start
        } else {
            let step = (self.stop - self.start) / (self.num_points - 1) as f64;
            self.start + step * point as f64
        }
    }
}

impl Plan for LineScan {
    fn plan_type(&self) -> &str {
        if self.relative {
            "rel_scan"
        } else {
            "line_scan"
        }
    }

    fn plan_name(&self) -> &str {
        if self.relative {
            "Relative Line Scan"
        } else {
            "Line Scan"
        }
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("axis".to_string(), self.axis.clone()),
            ("start".to_string(), self.start.to_string()),
            ("stop".to_string(), self.stop.to_string()),
            ("num_points".to_string(), self.num_points.to_string()),
            ("detectors".to_string(), self.detectors.join(",")),
            ("relative".to_string(), self.relative.to_string()),
        ])
    }

    fn movers(&self) -> Vec<String> {
        vec![self.axis.clone()]
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors.clone()
    }

    fn num_points(&self) -> usize {
        self.num_points
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        loop {
            if let Some(cmd) = self.queue.pop_front() {
                return Ok(Some(cmd));
            }
            match self.current_step {
                LineScanStep::Lookup => {
                    let motor = ctx.registry.find(&self.axis)?;
                    let readback = position_signal(motor.as_ref())
                        .ok_or_else(|| anyhow::anyhow!("{} has no position signal", self.axis))?;
                    self.resolved = self
                        .detectors
                        .iter()
                        .map(|name| ctx.registry.find(name))
                        .collect::<Result<_, _>>()?;
                    let mut devices = vec![motor.clone()];
                    devices.extend(self.resolved.iter().cloned());
                    self.queue.push_back(PlanCommand::wait_for(devices));
                    if self.relative {
                        self.queue.push_back(PlanCommand::Read {
                            signals: vec![readback.clone()],
                        });
                        self.current_step = LineScanStep::Origin;
                    } else {
                        self.current_step = LineScanStep::Point;
                    }
                    self.motor = Some(motor);
                    self.readback = Some(readback);
                }
                LineScanStep::Origin => {
                    if let Some(readback) = &self.readback {
                        self.origin = ctx.reading_f64(readback.name())?;
                    }
                    self.current_step = LineScanStep::Point;
                }
                LineScanStep::Point => {
                    if self.current_point >= self.num_points {
                        self.current_step = if self.relative {
                            LineScanStep::Return
                        } else {
                            LineScanStep::Done
                        };
                        continue;
                    }
                    let (Some(motor), Some(readback)) = (&self.motor, &self.readback) else {
                        anyhow::bail!("{} was not resolved", self.axis);
                    };
                    let target = self.origin + self.position_at(self.current_point);
                    self.queue.push_back(PlanCommand::mv([SetPoint::device(motor, target)]));
                    if self.settle_time > 0.0 {
                        self.queue.push_back(PlanCommand::wait(self.settle_time));
                    }
                    self.queue
                        .push_back(PlanCommand::checkpoint(format!("point_{}", self.current_point)));
                    for det in &self.resolved {
                        self.queue.push_back(PlanCommand::Trigger { device: det.clone() });
                    }
                    self.queue.push_back(PlanCommand::Read {
                        signals: vec![readback.clone()],
                    });
                    for det in &self.resolved {
                        self.queue.push_back(PlanCommand::ReadDevice { device: det.clone() });
                    }
                    self.queue.push_back(PlanCommand::EmitEvent {
                        stream: PRIMARY_STREAM.to_string(),
                    });
                    self.current_point += 1;
                }
                LineScanStep::Return => {
                    if let Some(motor) = &self.motor {
                        self.queue.push_back(PlanCommand::mv([SetPoint::device(motor, self.origin)]));
                    }
                    self.current_step = LineScanStep::Done;
                }
                LineScanStep::Done => return Ok(None),
            }
        }
    }
}

/// Logs one message; produces no data.
pub struct PrintPlan {
    message: String,
    done: bool,
}

impl PrintPlan {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            done: false,
        }
    }
}

impl Plan for PrintPlan {
    fn plan_type(&self) -> &str {
        "print"
    }

    fn plan_name(&self) -> &str {
        "Print"
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("message".to_string(), self.message.clone())])
    }

    fn next_command(&mut self, ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let message = self.message.clone();
        let runs = ctx.catalog_len;
        Ok(Some(PlanCommand::call("print", move || async move {
            info!(catalog_runs = runs, "{message}");
            Ok(())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::control::{ControlContext, ControlTimeouts};
    use beamline_hardware::devices::{EpicsMotor, SignalDevice};
    use beamline_hardware::SoftIoc;

    fn context() -> PlanContext {
        let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
        let registry = DeviceRegistry::new();
        registry
            .register(Arc::new(EpicsMotor::new(&ctx, "gp:m1", "m1")), ["motor"])
            .unwrap();
        registry
            .register(
                Arc::new(SignalDevice::new("det", Signal::ro(&ctx, "det", "gp:det"))),
                ["detectors"],
            )
            .unwrap();
        PlanContext::new(
            Arc::new(registry),
            Arc::new(Namespace::new()),
            Arc::new(Settings::default()),
        )
    }

    fn drain(plan: &mut dyn Plan, ctx: &PlanContext) -> Vec<PlanCommand> {
        let mut commands = Vec::new();
        while let Some(cmd) = plan.next_command(ctx).unwrap() {
            commands.push(cmd);
        }
        commands
    }

    fn move_targets(commands: &[PlanCommand]) -> Vec<f64> {
        commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::Mv { moves } => moves[0].value.as_f64(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_line_scan_positions() {
        let ctx = context();
        let mut scan = LineScan::new("m1", 0.0, 10.0, 11).with_detector("det");
        let commands = drain(&mut scan, &ctx);
        let positions = move_targets(&commands);
        assert_eq!(positions.len(), 11);
        assert!((positions[0] - 0.0).abs() < 1e-12);
        assert!((positions[5] - 5.0).abs() < 1e-12);
        assert!((positions[10] - 10.0).abs() < 1e-12);
        let events = commands
            .iter()
            .filter(|c| matches!(c, PlanCommand::EmitEvent { .. }))
            .count();
        assert_eq!(events, 11);
    }

    #[test]
    fn test_relative_scan_offsets_from_readback_and_returns() {
        let mut ctx = context();
        let mut scan = LineScan::new("m1", -1.0, 1.0, 3).relative();
        assert_eq!(scan.plan_type(), "rel_scan");

        assert!(matches!(
            scan.next_command(&ctx).unwrap(),
            Some(PlanCommand::WaitForConnection { .. })
        ));
        assert!(matches!(scan.next_command(&ctx).unwrap(), Some(PlanCommand::Read { .. })));
        ctx.readings.insert("m1".to_string(), PvValue::Double(5.0));

        let commands = drain(&mut scan, &ctx);
        assert_eq!(move_targets(&commands), [4.0, 5.0, 6.0, 5.0]);
    }

    #[test]
    fn test_count_plan() {
        let ctx = context();
        let mut count = Count::new(3).with_detector("det").with_delay(0.5);
        let commands = drain(&mut count, &ctx);
        let kinds: Vec<_> = commands.iter().map(PlanCommand::kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == "emit_event").count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == "wait").count(), 2);
        assert_eq!(kinds[0], "wait_for_connection");
    }

    #[test]
    fn test_unknown_detector_fails_plan() {
        let ctx = context();
        let mut count = Count::new(1).with_detector("nope");
        assert!(count.next_command(&ctx).is_err());
    }

    #[test]
    fn test_sequence_checkpoints_each_step() {
        let ctx = context();
        let mut seq = PlanSequence::new("demo", "Demo")
            .then(PrintPlan::new("one"))
            .then(Count::new(1).with_detector("det"));
        assert_eq!(seq.steps(), ["print", "count"]);
        let commands = drain(&mut seq, &ctx);
        let labels: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                PlanCommand::Checkpoint { label } if !label.starts_with("point_") => Some(label.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, ["print", "count"]);
    }

    struct Failing;

    impl Plan for Failing {
        fn plan_type(&self) -> &str {
            "failing"
        }

        fn plan_name(&self) -> &str {
            "Failing"
        }

        fn next_command(&mut self, _ctx: &PlanContext) -> anyhow::Result<Option<PlanCommand>> {
            anyhow::bail!("no such record")
        }
    }

    #[test]
    fn test_recover_swallows_failures() {
        let ctx = context();
        let mut seq = PlanSequence::new("demo", "Demo")
            .then(Recover::new("Peak Dithering setup", Failing))
            .then(PrintPlan::new("after"));
        let commands = drain(&mut seq, &ctx);
        assert!(commands
            .iter()
            .any(|c| matches!(c, PlanCommand::Checkpoint { label } if label == "print")));

        let mut unguarded = PlanSequence::new("demo", "Demo").then(Failing);
        unguarded.next_command(&ctx).unwrap();
        let err = unguarded.next_command(&ctx).unwrap_err();
        assert!(format!("{err:#}").contains("failing failed"));
    }

    #[test]
    fn test_recover_handles_command_errors() {
        let mut recover = Recover::new("Peak Dithering setup", PrintPlan::new("x"));
        assert!(recover.handle_error(anyhow::anyhow!("put failed")).is_ok());
        assert_eq!(recover.failure(), Some("put failed"));
        assert!(recover.handle_error(anyhow::anyhow!("again")).is_err());
    }
}
