//! RunEngine - State machine for plan execution
//!
//! The RunEngine executes plans, manages pause/resume, and emits documents.
//! Plans describe what should happen; the engine performs every command
//! against the registered devices and records the results.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │
//!    │  completed           │ pause() at checkpoint
//!    │                      ▼
//!    │                 ┌────────┐
//!    │◀────resume()────│ Paused │
//!    │                 └────────┘
//!    │
//!    │  abort()/halt()
//!    └────────────────────────────
//! ```
//!
//! # Per-run services
//!
//! - `scan_id` is incremented in the run metadata (or taken from a bound
//!   scan-id PV) before the Start document is emitted.
//! - Baseline devices are read into a `baseline` stream at start and end.
//! - The plan's movers and detectors are staged before its first command
//!   and unstaged when it ends, whatever the exit status.
//! - Monitor devices are read into `{name}_monitor` streams after every
//!   primary event.
//! - Every document goes to the registered callbacks (catalog, summary
//!   collector) and to the broadcast channel.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new(registry).with_catalog(catalog.clone());
//! engine.subscribe_callback("catalog", move |doc| Ok(catalog.ingest(doc)?));
//!
//! let result = engine.run(Box::new(setup_devices())).await?;
//! assert_eq!(result.exit_status, "success");
//! ```

use anyhow::Context;
use beamline_core::capabilities::Device;
use beamline_core::document::{new_uid, now_ns, DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use beamline_core::settings::Settings;
use beamline_core::signal::Signal;
use beamline_core::value::PvValue;
use beamline_hardware::{DeviceRegistry, Namespace};
use beamline_storage::{merge_metadata, Catalog, Metadata, RunMetadata};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::plans::{MoveTarget, Plan, PlanCommand, PlanContext, SetPoint, PRIMARY_STREAM};

/// Stream filled from baseline devices at the start and end of a run.
pub const BASELINE_STREAM: &str = "baseline";

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No plan running, ready to accept new plans
    Idle,
    /// Executing a plan
    Running,
    /// Paused at a checkpoint, can resume or abort
    Paused,
    /// Aborting current plan (will return to Idle)
    Aborting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Aborting => write!(f, "aborting"),
        }
    }
}

/// Document subscriber. Errors are logged; they never end a run.
pub type DocumentCallback = Box<dyn Fn(&Document) -> anyhow::Result<()> + Send + Sync>;

/// Reports long-running waits (batched moves and sleeps).
pub trait ProgressReporter: Send + Sync {
    fn started(&self, what: &str, targets: &[String]);
    fn finished(&self, what: &str, elapsed: Duration);
}

/// Progress reporter that writes to the log.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn started(&self, what: &str, targets: &[String]) {
        info!(targets = ?targets, "{what} ...");
    }

    fn finished(&self, what: &str, elapsed: Duration) {
        info!(elapsed_ms = elapsed.as_millis() as u64, "{what} done");
    }
}

/// Devices read alongside every run. Names are resolved when a run starts,
/// so supplemental data can be configured before the devices exist.
#[derive(Debug, Clone, Default)]
pub struct SupplementalData {
    /// Devices carrying this label form the baseline.
    pub baseline_label: Option<String>,
    /// Devices read after every primary event.
    pub monitors: Vec<String>,
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_uid: String,
    pub scan_id: u64,
    /// "success", "abort" or "fail"
    pub exit_status: String,
    pub reason: String,
    /// Data of the last primary event
    pub data: BTreeMap<String, Value>,
    /// Events emitted per stream
    pub num_events: BTreeMap<String, u32>,
    /// Checkpoint labels in the order they were reached
    pub checkpoints: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.exit_status == "success"
    }
}

/// A queued plan waiting to be executed
struct QueuedPlan {
    plan: Box<dyn Plan>,
    metadata: Metadata,
    run_uid: String,
}

struct Reading {
    value: Value,
    source: String,
    timestamp: u64,
}

struct StreamState {
    descriptor_uid: String,
    seq_num: u32,
}

/// Run context for the currently executing plan
struct RunContext {
    run_uid: String,
    streams: BTreeMap<String, StreamState>,
    pending: BTreeMap<String, Reading>,
    last_primary: BTreeMap<String, Value>,
    checkpoints: Vec<String>,
}

impl RunContext {
    fn new(run_uid: &str) -> Self {
        Self {
            run_uid: run_uid.to_string(),
            streams: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_primary: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }

    fn num_events(&self) -> BTreeMap<String, u32> {
        self.streams
            .iter()
            .map(|(name, s)| (name.clone(), s.seq_num))
            .collect()
    }
}

/// The RunEngine orchestrates plan execution
pub struct RunEngine {
    /// Current engine state
    state: RwLock<EngineState>,

    registry: Arc<DeviceRegistry>,
    namespace: Arc<Namespace>,
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,

    /// Session metadata merged into every start document
    md: parking_lot::Mutex<RunMetadata>,

    /// Queue of plans to execute
    plan_queue: Mutex<Vec<QueuedPlan>>,

    /// Document broadcast channel
    doc_sender: broadcast::Sender<Document>,

    callbacks: parking_lot::RwLock<Vec<(String, DocumentCallback)>>,
    supplemental: parking_lot::RwLock<SupplementalData>,
    scan_id_signal: parking_lot::RwLock<Option<Signal>>,
    progress: parking_lot::RwLock<Option<Arc<dyn ProgressReporter>>>,

    /// Pause request flag
    pause_requested: RwLock<bool>,

    /// Abort request flag
    abort_requested: RwLock<bool>,

    /// Current run context (when running)
    run_context: Mutex<Option<RunContext>>,

    /// Last checkpoint label (for resume)
    last_checkpoint: RwLock<Option<String>>,
}

impl RunEngine {
    /// Create a RunEngine with a temp catalog, in-memory metadata and
    /// default settings.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (doc_sender, _) = broadcast::channel(1024);

        Self {
            state: RwLock::new(EngineState::Idle),
            registry,
            namespace: Arc::new(Namespace::new()),
            settings: Arc::new(Settings::default()),
            catalog: Arc::new(Catalog::temp()),
            md: parking_lot::Mutex::new(RunMetadata::in_memory()),
            plan_queue: Mutex::new(Vec::new()),
            doc_sender,
            callbacks: parking_lot::RwLock::new(Vec::new()),
            supplemental: parking_lot::RwLock::new(SupplementalData::default()),
            scan_id_signal: parking_lot::RwLock::new(None),
            progress: parking_lot::RwLock::new(None),
            pause_requested: RwLock::new(false),
            abort_requested: RwLock::new(false),
            run_context: Mutex::new(None),
            last_checkpoint: RwLock::new(None),
        }
    }

    pub fn with_namespace(mut self, namespace: Arc<Namespace>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = settings;
        self
    }

    /// Catalog whose size plans see as `catalog_len`.
    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_metadata(self, md: RunMetadata) -> Self {
        *self.md.lock() = md;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Snapshot of the session metadata.
    pub fn metadata(&self) -> Metadata {
        self.md.lock().entries().clone()
    }

    pub fn metadata_is_persistent(&self) -> bool {
        self.md.lock().is_persistent()
    }

    /// Merge programmatic fields, then configured defaults.
    pub fn update_metadata(&self, programmatic: Metadata, defaults: &Metadata) {
        merge_metadata(&mut self.md.lock(), programmatic, defaults);
    }

    pub fn insert_metadata(&self, key: &str, value: impl Into<Value>) {
        self.md.lock().insert(key, value);
    }

    /// Subscribe to document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Call `callback` with every document, in emission order.
    pub fn subscribe_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        debug!(subscriber = name, "Document callback subscribed");
        self.callbacks.write().push((name.to_string(), Box::new(callback)));
    }

    pub fn callback_names(&self) -> Vec<String> {
        self.callbacks.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn set_supplemental(&self, supplemental: SupplementalData) {
        info!(
            baseline = ?supplemental.baseline_label,
            monitors = ?supplemental.monitors,
            "Supplemental data installed"
        );
        *self.supplemental.write() = supplemental;
    }

    pub fn supplemental(&self) -> SupplementalData {
        self.supplemental.read().clone()
    }

    /// Keep `signal` in step with the scan id: each run takes the PV value
    /// plus one and writes it back.
    pub fn bind_scan_id_signal(&self, signal: Signal) {
        info!(pv = %signal.read_pv(), "scan_id bound to PV");
        *self.scan_id_signal.write() = Some(signal);
    }

    pub fn set_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        *self.progress.write() = Some(reporter);
    }

    pub fn has_progress_reporter(&self) -> bool {
        self.progress.read().is_some()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn current_run_uid(&self) -> Option<String> {
        self.run_context
            .lock()
            .await
            .as_ref()
            .map(|ctx| ctx.run_uid.clone())
    }

    pub async fn last_checkpoint(&self) -> Option<String> {
        self.last_checkpoint.read().await.clone()
    }

    pub async fn queue_len(&self) -> usize {
        self.plan_queue.lock().await.len()
    }

    /// Queue a plan for execution
    pub async fn queue(&self, plan: Box<dyn Plan>) -> String {
        self.queue_with_metadata(plan, Metadata::new()).await
    }

    /// Queue a plan with per-run metadata
    pub async fn queue_with_metadata(&self, plan: Box<dyn Plan>, metadata: Metadata) -> String {
        let run_uid = new_uid();
        info!(run_uid = %run_uid, plan_type = %plan.plan_type(), "Queueing plan");

        let mut queue = self.plan_queue.lock().await;
        queue.push(QueuedPlan {
            plan,
            metadata,
            run_uid: run_uid.clone(),
        });

        run_uid
    }

    /// Execute the next queued plan to completion
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> anyhow::Result<RunResult> {
        let current_state = *self.state.read().await;
        if current_state != EngineState::Idle {
            anyhow::bail!("Cannot start: engine is {}", current_state);
        }

        // Reset flags
        *self.pause_requested.write().await = false;
        *self.abort_requested.write().await = false;

        let queued = {
            let mut queue = self.plan_queue.lock().await;
            if queue.is_empty() {
                anyhow::bail!("No plans in queue");
            }
            queue.remove(0)
        };

        *self.state.write().await = EngineState::Running;
        info!("Engine started");

        self.execute_plan(queued).await
    }

    /// Queue `plan` and run it.
    pub async fn run(&self, plan: Box<dyn Plan>) -> anyhow::Result<RunResult> {
        self.queue(plan).await;
        self.start().await
    }

    /// Queue `plan` and run it, aborting if it takes longer than `timeout`.
    pub async fn queue_and_execute(
        &self,
        plan: Box<dyn Plan>,
        timeout: Duration,
    ) -> anyhow::Result<RunResult> {
        self.queue(plan).await;
        let run = self.start();
        tokio::pin!(run);
        match tokio::time::timeout(timeout, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?timeout, "Plan timed out, aborting");
                self.abort("timeout").await?;
                run.await
            }
        }
    }

    /// Request pause at next checkpoint
    #[instrument(skip(self), err)]
    pub async fn pause(&self) -> anyhow::Result<()> {
        let current_state = *self.state.read().await;
        if current_state != EngineState::Running {
            anyhow::bail!("Cannot pause: engine is {}", current_state);
        }

        info!("Pause requested");
        *self.pause_requested.write().await = true;
        Ok(())
    }

    /// Resume from paused state
    #[instrument(skip(self), err)]
    pub async fn resume(&self) -> anyhow::Result<()> {
        let current_state = *self.state.read().await;
        if current_state != EngineState::Paused {
            anyhow::bail!("Cannot resume: engine is {}", current_state);
        }

        info!(checkpoint = ?self.last_checkpoint().await, "Resuming from pause");
        *self.pause_requested.write().await = false;
        *self.state.write().await = EngineState::Running;
        Ok(())
    }

    /// Abort the current plan
    #[instrument(skip(self), err)]
    pub async fn abort(&self, reason: &str) -> anyhow::Result<()> {
        self.abort_run(None, reason).await
    }

    /// Abort a specific run by run_uid, or the current run if None/empty.
    /// A queued run is removed from the queue.
    #[instrument(skip(self), err)]
    pub async fn abort_run(&self, run_uid: Option<&str>, reason: &str) -> anyhow::Result<()> {
        let target_uid = run_uid.filter(|s| !s.is_empty());

        match target_uid {
            None => {
                let current_state = *self.state.read().await;
                match current_state {
                    EngineState::Running | EngineState::Paused => {
                        info!(reason = %reason, "Abort requested for current run");
                        *self.abort_requested.write().await = true;
                        *self.state.write().await = EngineState::Aborting;
                        Ok(())
                    }
                    _ => anyhow::bail!("Cannot abort: engine is {}", current_state),
                }
            }
            Some(uid) => {
                if self.current_run_uid().await.as_deref() == Some(uid) {
                    info!(run_uid = %uid, reason = %reason, "Abort requested for current run");
                    *self.abort_requested.write().await = true;
                    *self.state.write().await = EngineState::Aborting;
                    return Ok(());
                }

                let mut queue = self.plan_queue.lock().await;
                if let Some(pos) = queue.iter().position(|q| q.run_uid == uid) {
                    let removed = queue.remove(pos);
                    info!(
                        run_uid = %uid,
                        plan_type = %removed.plan.plan_type(),
                        reason = %reason,
                        "Removed queued plan"
                    );
                    return Ok(());
                }

                anyhow::bail!("Run '{}' not found (not current and not queued)", uid)
            }
        }
    }

    /// Halt immediately: abort the current run, if any, and tell every
    /// device to stop moving.
    pub async fn halt(&self) -> anyhow::Result<()> {
        warn!("HALT requested - emergency stop");
        {
            let mut state = self.state.write().await;
            if matches!(*state, EngineState::Running | EngineState::Paused) {
                *self.abort_requested.write().await = true;
                *state = EngineState::Aborting;
            }
        }
        let devices: Vec<_> = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| self.registry.find(&name).ok())
            .collect();
        let results = join_all(devices.iter().map(|device| device.halt())).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!(device = %device.name(), error = %e, "Stop failed");
            }
        }
        Ok(())
    }

    /// Take the next scan id from the bound PV, else from the metadata.
    async fn allocate_scan_id(&self) -> u64 {
        let bound = self.scan_id_signal.read().clone();
        if let Some(signal) = bound {
            match signal.get().await {
                Ok(value) => {
                    let next = value.as_f64().unwrap_or(0.0).max(0.0) as u64 + 1;
                    if let Err(e) = signal.put(next as i64).await {
                        warn!(pv = %signal.read_pv(), error = %e, "Could not write scan_id PV");
                    }
                    self.md.lock().insert("scan_id", next);
                    return next;
                }
                Err(e) => {
                    warn!(pv = %signal.read_pv(), error = %e, "scan_id PV unreadable, using metadata")
                }
            }
        }
        self.md.lock().next_scan_id()
    }

    /// Baseline and monitor devices for this run. Missing monitors are
    /// skipped with a warning.
    fn resolve_supplemental(&self) -> (Vec<Arc<dyn Device>>, Vec<Arc<dyn Device>>) {
        let supplemental = self.supplemental.read().clone();
        let baseline = supplemental
            .baseline_label
            .as_deref()
            .map(|label| self.registry.findall(label).collect())
            .unwrap_or_default();
        let monitors = supplemental
            .monitors
            .iter()
            .filter_map(|name| match self.registry.find(name) {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!(monitor = %name, error = %e, "Monitor not available");
                    None
                }
            })
            .collect();
        (baseline, monitors)
    }

    /// Stage the named devices in order. Devices staged before a failure are
    /// left in `staged` so they get unstaged. Names the registry does not
    /// know are left for the plan to report.
    async fn stage_devices(
        &self,
        names: &[String],
        staged: &mut Vec<Arc<dyn Device>>,
    ) -> anyhow::Result<()> {
        for name in names {
            let Some(device) = self.registry.find_optional(name) else {
                continue;
            };
            if staged.iter().any(|d| d.name() == device.name()) {
                continue;
            }
            device
                .stage()
                .await
                .with_context(|| format!("staging {}", device.name()))?;
            staged.push(device);
        }
        Ok(())
    }

    async fn unstage_devices(&self, staged: Vec<Arc<dyn Device>>) {
        for device in staged.into_iter().rev() {
            if let Err(e) = device.unstage().await {
                warn!(device = %device.name(), error = %format!("{e:#}"), "Unstage failed");
            }
        }
    }

    /// Execute a single plan
    #[instrument(skip(self, queued), fields(run_uid = %queued.run_uid, plan_type = %queued.plan.plan_type()), err)]
    async fn execute_plan(&self, queued: QueuedPlan) -> anyhow::Result<RunResult> {
        let QueuedPlan {
            mut plan,
            metadata,
            run_uid,
        } = queued;

        let scan_id = self.allocate_scan_id().await;
        let mut start_doc = StartDoc::new(plan.plan_type(), plan.plan_name());
        start_doc.uid = run_uid.clone();
        start_doc.scan_id = scan_id;
        start_doc.plan_args = plan.plan_args();
        start_doc.metadata = self.metadata();
        start_doc.metadata.extend(metadata);
        start_doc.hints = plan.movers();

        *self.run_context.lock().await = Some(RunContext::new(&run_uid));
        self.emit_document(Document::Start(start_doc));

        let mut ctx = PlanContext {
            registry: self.registry.clone(),
            namespace: self.namespace.clone(),
            settings: self.settings.clone(),
            catalog_len: self.catalog.len(),
            readings: BTreeMap::new(),
        };
        let (baseline, monitors) = self.resolve_supplemental();
        self.read_baseline(&baseline).await;

        let mut exit_status = "success";
        let mut reason = String::new();

        let mut staged = Vec::new();
        let to_stage: Vec<String> = plan.movers().into_iter().chain(plan.detectors()).collect();
        if let Err(e) = self.stage_devices(&to_stage, &mut staged).await {
            error!(error = %format!("{e:#}"), "Staging failed");
            exit_status = "fail";
            reason = format!("{e:#}");
        }

        while exit_status == "success" {
            if *self.abort_requested.read().await {
                exit_status = "abort";
                reason = "User requested abort".to_string();
                break;
            }

            // Wait here while paused
            while *self.state.read().await == EngineState::Paused {
                sleep(Duration::from_millis(100)).await;
                if *self.abort_requested.read().await {
                    break;
                }
            }
            if *self.abort_requested.read().await {
                continue;
            }

            let cmd = match plan.next_command(&ctx) {
                Ok(Some(cmd)) => cmd,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Plan execution failed");
                    exit_status = "fail";
                    reason = format!("{e:#}");
                    break;
                }
            };

            let kind = cmd.kind();
            if let Err(e) = self.process_command(cmd, &mut ctx, &monitors).await {
                match plan.handle_error(e.context(format!("{kind} failed"))) {
                    Ok(()) => continue,
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "Plan execution failed");
                        exit_status = "fail";
                        reason = format!("{e:#}");
                        break;
                    }
                }
            }
        }

        self.unstage_devices(staged).await;
        if exit_status != "abort" {
            self.read_baseline(&baseline).await;
        }

        let run = self
            .run_context
            .lock()
            .await
            .take()
            .unwrap_or_else(|| RunContext::new(&run_uid));
        let num_events = run.num_events();
        let stop_doc = match exit_status {
            "success" => StopDoc::success(&run_uid, num_events.clone()),
            "abort" => StopDoc::abort(&run_uid, &reason, num_events.clone()),
            _ => StopDoc::fail(&run_uid, &reason, num_events.clone()),
        };
        self.emit_document(Document::Stop(stop_doc));

        *self.state.write().await = EngineState::Idle;
        *self.abort_requested.write().await = false;
        *self.pause_requested.write().await = false;
        info!(scan_id, exit_status, "Plan execution complete");

        Ok(RunResult {
            run_uid,
            scan_id,
            exit_status: exit_status.to_string(),
            reason,
            data: run.last_primary,
            num_events,
            checkpoints: run.checkpoints,
        })
    }

    async fn process_command(
        &self,
        cmd: PlanCommand,
        ctx: &mut PlanContext,
        monitors: &[Arc<dyn Device>],
    ) -> anyhow::Result<()> {
        debug!(command = ?cmd, "Processing command");
        match cmd {
            PlanCommand::Mv { moves } => {
                let targets: Vec<String> = moves.iter().map(|m| m.target.name().to_string()).collect();
                let started = Instant::now();
                self.report_started("mv", &targets);
                let results = join_all(moves.into_iter().map(apply_setpoint)).await;
                self.report_finished("mv", started.elapsed());
                results.into_iter().collect::<anyhow::Result<Vec<()>>>()?;
            }
            PlanCommand::Read { signals } => {
                for signal in signals {
                    let value = signal
                        .get()
                        .await
                        .with_context(|| format!("reading {}", signal.name()))?;
                    self.collect(signal.name(), &value, &format!("PV:{}", signal.read_pv()))
                        .await;
                    ctx.readings.insert(signal.name().to_string(), value);
                }
            }
            PlanCommand::ReadDevice { device } => {
                let reading = device
                    .read()
                    .await
                    .with_context(|| format!("reading {}", device.name()))?;
                for (key, value) in reading {
                    self.collect(&key, &value, device.name()).await;
                    ctx.readings.insert(key, value);
                }
            }
            PlanCommand::Trigger { device } => match device.triggerable() {
                Some(detector) => detector
                    .trigger()
                    .await
                    .with_context(|| format!("triggering {}", device.name()))?,
                None => debug!(device = %device.name(), "Not triggerable, skipping"),
            },
            PlanCommand::Wait { seconds } => {
                let started = Instant::now();
                self.report_started("sleep", &[format!("{seconds}s")]);
                self.sleep_interruptibly(seconds).await;
                self.report_finished("sleep", started.elapsed());
            }
            PlanCommand::WaitForConnection { devices } => {
                let timeout = self.settings.control.connection;
                let results = join_all(devices.iter().map(|d| d.wait_for_connection(timeout))).await;
                for (device, result) in devices.iter().zip(results) {
                    result.with_context(|| format!("connecting {}", device.name()))?;
                }
            }
            PlanCommand::Checkpoint { label } => {
                debug!(label = %label, "Checkpoint");
                if let Some(run) = self.run_context.lock().await.as_mut() {
                    run.checkpoints.push(label.clone());
                }
                *self.last_checkpoint.write().await = Some(label);

                if *self.pause_requested.read().await {
                    info!("Pausing at checkpoint");
                    *self.state.write().await = EngineState::Paused;
                }
            }
            PlanCommand::EmitEvent { stream } => {
                self.emit_pending(&stream).await?;
                if stream == PRIMARY_STREAM {
                    for monitor in monitors {
                        match monitor.read().await {
                            Ok(reading) => {
                                let data = reading
                                    .into_iter()
                                    .map(|(k, v)| (k, Value::from(v)))
                                    .collect();
                                let name = format!("{}_monitor", monitor.name());
                                self.emit_event(&name, data, monitor.name()).await?;
                            }
                            Err(e) => warn!(monitor = %monitor.name(), error = %e, "Monitor read failed"),
                        }
                    }
                }
            }
            PlanCommand::RegisterAlias {
                name,
                signal,
                labels,
            } => {
                ctx.registry.register_alias(&name, &signal, labels)?;
                ctx.namespace.insert_signal(name.clone(), signal.renamed(name.as_str()));
            }
            PlanCommand::Call { label, op } => {
                debug!(label = %label, "call");
                op().await.with_context(|| label.clone())?;
            }
        }

        Ok(())
    }

    /// Chunked sleep that returns early on abort.
    async fn sleep_interruptibly(&self, seconds: f64) {
        const CHECK_INTERVAL: Duration = Duration::from_millis(100);
        let total = Duration::from_secs_f64(seconds.max(0.0));
        let mut remaining = total;

        while remaining > Duration::ZERO {
            if *self.abort_requested.read().await {
                debug!("Wait interrupted by abort");
                return;
            }
            let chunk = remaining.min(CHECK_INTERVAL);
            sleep(chunk).await;
            remaining = remaining.saturating_sub(chunk);
        }
    }

    fn report_started(&self, what: &str, targets: &[String]) {
        if let Some(progress) = self.progress.read().as_ref() {
            progress.started(what, targets);
        }
    }

    fn report_finished(&self, what: &str, elapsed: Duration) {
        if let Some(progress) = self.progress.read().as_ref() {
            progress.finished(what, elapsed);
        }
    }

    /// Add one reading to the pending event.
    async fn collect(&self, key: &str, value: &PvValue, source: &str) {
        if let Some(run) = self.run_context.lock().await.as_mut() {
            run.pending.insert(
                key.to_string(),
                Reading {
                    value: value.clone().into(),
                    source: source.to_string(),
                    timestamp: now_ns(),
                },
            );
        }
    }

    async fn read_baseline(&self, devices: &[Arc<dyn Device>]) {
        if devices.is_empty() {
            return;
        }
        let mut data = BTreeMap::new();
        for device in devices {
            match device.read().await {
                Ok(reading) => data.extend(reading.into_iter().map(|(k, v)| (k, Value::from(v)))),
                Err(e) => warn!(device = %device.name(), error = %e, "Baseline read failed"),
            }
        }
        if let Err(e) = self.emit_event(BASELINE_STREAM, data, "baseline").await {
            warn!(error = %e, "Baseline event not emitted");
        }
    }

    /// Turn the pending readings into an event on `stream`.
    async fn emit_pending(&self, stream: &str) -> anyhow::Result<()> {
        let docs = {
            let mut guard = self.run_context.lock().await;
            let run = guard.as_mut().context("no run in progress")?;
            let pending = std::mem::take(&mut run.pending);
            let keys = pending
                .iter()
                .map(|(k, r)| (k.clone(), DataKey::for_value(&r.value, &r.source)))
                .collect();
            let (descriptor, seq_num, descriptor_uid) = next_seq(run, stream, keys);
            let mut event = EventDoc::new(&run.run_uid, &descriptor_uid, seq_num);
            for (key, reading) in pending {
                event.timestamps.insert(key.clone(), reading.timestamp);
                event.data.insert(key, reading.value);
            }
            if stream == PRIMARY_STREAM {
                run.last_primary = event.data.clone();
            }
            descriptor
                .into_iter()
                .map(Document::Descriptor)
                .chain(std::iter::once(Document::Event(event)))
                .collect::<Vec<_>>()
        };
        for doc in docs {
            self.emit_document(doc);
        }
        Ok(())
    }

    async fn emit_event(
        &self,
        stream: &str,
        data: BTreeMap<String, Value>,
        source: &str,
    ) -> anyhow::Result<()> {
        let docs = {
            let mut guard = self.run_context.lock().await;
            let run = guard.as_mut().context("no run in progress")?;
            let keys = data
                .iter()
                .map(|(k, v)| (k.clone(), DataKey::for_value(v, source)))
                .collect();
            let (descriptor, seq_num, descriptor_uid) = next_seq(run, stream, keys);
            let mut event = EventDoc::new(&run.run_uid, &descriptor_uid, seq_num);
            for (key, value) in data {
                event = event.with_datum(&key, value);
            }
            descriptor
                .into_iter()
                .map(Document::Descriptor)
                .chain(std::iter::once(Document::Event(event)))
                .collect::<Vec<_>>()
        };
        for doc in docs {
            self.emit_document(doc);
        }
        Ok(())
    }

    /// Deliver a document to every callback, then broadcast it.
    fn emit_document(&self, doc: Document) {
        for (name, callback) in self.callbacks.read().iter() {
            if let Err(e) = callback(&doc) {
                warn!(subscriber = %name, document = doc.name(), error = %e, "Subscriber failed");
            }
        }
        let _ = self.doc_sender.send(doc);
    }
}

/// Next sequence number on `stream`, creating its descriptor on first use.
fn next_seq(
    run: &mut RunContext,
    stream: &str,
    data_keys: BTreeMap<String, DataKey>,
) -> (Option<DescriptorDoc>, u32, String) {
    let mut descriptor = None;
    if !run.streams.contains_key(stream) {
        let mut doc = DescriptorDoc::new(&run.run_uid, stream);
        doc.data_keys = data_keys;
        run.streams.insert(
            stream.to_string(),
            StreamState {
                descriptor_uid: doc.uid.clone(),
                seq_num: 0,
            },
        );
        descriptor = Some(doc);
    }
    let state = run
        .streams
        .entry(stream.to_string())
        .or_insert_with(|| StreamState {
            descriptor_uid: new_uid(),
            seq_num: 0,
        });
    state.seq_num += 1;
    (descriptor, state.seq_num, state.descriptor_uid.clone())
}

/// Move one target: positioners move and wait, anything else has its
/// setpoint written.
async fn apply_setpoint(set: SetPoint) -> anyhow::Result<()> {
    let SetPoint { target, value } = set;
    match target {
        MoveTarget::Device(device) => {
            if let Some(positioner) = device.movable() {
                let position = value.expect_f64(device.name())?;
                positioner
                    .move_abs(position)
                    .await
                    .with_context(|| format!("moving {}", device.name()))?;
            } else if let Some(setpoint) = device.setpoint() {
                setpoint
                    .put(value)
                    .await
                    .with_context(|| format!("setting {}", device.name()))?;
            } else {
                anyhow::bail!("{} cannot be moved", device.name());
            }
        }
        MoveTarget::Signal(signal) => {
            signal
                .put(value)
                .await
                .with_context(|| format!("setting {}", signal.name()))?;
        }
    }
    Ok(())
}
