//! Device factory table.
//!
//! Maps the `type` identifier of a devices-file entry to the code that builds
//! it. The table is fixed at startup; entries naming an unknown type are
//! rejected when the devices file is validated, before anything is built.
//!
//! ```text
//! [[devices]]                FactoryTable                 DeviceRegistry
//! type = "kohzu_dcm"  ──▶  "kohzu_dcm" → KohzuDcmFactory ──▶  dcm (monochromator)
//! name = "dcm"
//! prefix = "gp:"
//! ```

use beamline_core::capabilities::Device;
use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::{Signal, SignalKind};
use beamline_core::value::ValueKind;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::DeviceSpec;
use crate::devices::calcs::{
    CalcoutRecord, Record, RecordBank, SseqRecord, SwaitRecord, TransformRecord,
};
use crate::devices::diffractometer::AxisPvs;
use crate::devices::monochromator::DcmMotorPvs;
use crate::devices::{
    motors, Diffractometer, EpicsMotor, Geometry, IocStats, KohzuDcm, MotorClass, MotorRange,
    ScalerCh, SignalDevice, SimDetector, SimShutter, TemperaturePositioner,
};

/// A constructed device and the labels to register it under.
pub struct BuiltDevice {
    pub device: Arc<dyn Device>,
    pub labels: Vec<String>,
}

impl BuiltDevice {
    fn new<D: Device>(device: D, spec: &DeviceSpec, default_labels: &[&str]) -> Self {
        Self {
            device: Arc::new(device),
            labels: spec.labels_or(default_labels),
        }
    }
}

/// Builds devices of one type from devices-file entries.
pub trait DeviceFactory: Send + Sync {
    /// Identifier used in the `type` field.
    fn device_type(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Check an entry without building anything.
    fn validate(&self, spec: &DeviceSpec) -> AppResult<()>;

    /// Build the devices described by `spec` (ranged types yield several).
    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>>;
}

// =============================================================================
// Factory table
// =============================================================================

pub struct FactoryTable {
    factories: HashMap<&'static str, Box<dyn DeviceFactory>>,
}

impl Default for FactoryTable {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl FactoryTable {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Table with every device type this crate provides.
    pub fn with_builtin() -> Self {
        let mut table = Self::empty();
        table.register(MotorFactory(MotorClass::EpicsMotor));
        table.register(MotorFactory(MotorClass::EpicsMotorSrev));
        table.register(MotorsFactory);
        table.register(DiffractometerFactory(Geometry::FourCircle));
        table.register(DiffractometerFactory(Geometry::SixCircle));
        table.register(KohzuDcmFactory);
        table.register(ScalerFactory);
        table.register(BankFactory::<SwaitRecord>::new("user_calcs", "synApps user calcs (swait)"));
        table.register(BankFactory::<CalcoutRecord>::new("user_calcouts", "synApps user calcouts"));
        table.register(BankFactory::<SseqRecord>::new("user_sseqs", "synApps user string sequences"));
        table.register(BankFactory::<TransformRecord>::new("user_transforms", "synApps user transforms"));
        table.register(TransformFactory);
        table.register(SignalFactory);
        table.register(SimShutterFactory);
        table.register(TemperatureFactory);
        table.register(AdSimDetectorFactory);
        table.register(IocStatsFactory);
        table
    }

    pub fn register<F: DeviceFactory + 'static>(&mut self, factory: F) {
        debug!(device_type = factory.device_type(), "register factory");
        self.factories.insert(factory.device_type(), Box::new(factory));
    }

    pub fn get(&self, device_type: &str) -> AppResult<&dyn DeviceFactory> {
        self.factories
            .get(device_type)
            .map(|f| f.as_ref())
            .ok_or_else(|| BeamlineError::UnknownDeviceType(device_type.to_string()))
    }

    pub fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        self.get(&spec.device_type)?.validate(spec)
    }

    pub fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        self.get(&spec.device_type)?.build(ctx, spec)
    }

    /// Known type identifiers, sorted.
    pub fn device_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

// =============================================================================
// Built-in factories
// =============================================================================

fn check<T: DeserializeOwned>(spec: &DeviceSpec, fields: &[&str]) -> AppResult<()> {
    for field in fields {
        spec.required(field)?;
    }
    spec.params::<T>().map(|_| ())
}

#[derive(Debug, Default, Deserialize)]
struct NoParams {}

struct MotorFactory(MotorClass);

impl DeviceFactory for MotorFactory {
    fn device_type(&self) -> &'static str {
        match self.0 {
            MotorClass::EpicsMotor => "motor",
            MotorClass::EpicsMotorSrev => "motor_srev",
        }
    }

    fn name(&self) -> &'static str {
        match self.0 {
            MotorClass::EpicsMotor => "EPICS motor record",
            MotorClass::EpicsMotorSrev => "EPICS motor record with steps per revolution",
        }
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let motor = EpicsMotor::with_class(ctx, spec.required("prefix")?, spec.required("name")?, self.0);
        Ok(vec![BuiltDevice::new(motor, spec, &["motor"])])
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MotorsParams {
    names: String,
    first: i64,
    last: i64,
    class: String,
}

impl Default for MotorsParams {
    fn default() -> Self {
        Self {
            names: "m{}".to_string(),
            first: 0,
            last: 0,
            class: "EpicsMotor".to_string(),
        }
    }
}

struct MotorsFactory;

impl MotorsFactory {
    fn range(spec: &DeviceSpec) -> AppResult<MotorRange> {
        let params: MotorsParams = spec.params()?;
        Ok(MotorRange {
            prefix: spec.prefix.clone(),
            names: params.names,
            first: params.first,
            last: params.last,
            class: params.class.parse()?,
        })
    }
}

impl DeviceFactory for MotorsFactory {
    fn device_type(&self) -> &'static str {
        "motors"
    }

    fn name(&self) -> &'static str {
        "Ranged bank of motor records"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        let range = Self::range(spec)?;
        if range.prefix.is_none() {
            return Err(BeamlineError::Configuration(
                "Must define a string value for 'prefix'".to_string(),
            ));
        }
        Ok(())
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        Ok(motors(ctx, Self::range(spec)?)?
            .map(|m| BuiltDevice::new(m, spec, &["motor"]))
            .collect())
    }
}

struct DiffractometerFactory(Geometry);

impl DeviceFactory for DiffractometerFactory {
    fn device_type(&self) -> &'static str {
        match self.0 {
            Geometry::FourCircle => "four_circle",
            Geometry::SixCircle => "six_circle",
        }
    }

    fn name(&self) -> &'static str {
        match self.0 {
            Geometry::FourCircle => "Eulerian 4-circle diffractometer",
            Geometry::SixCircle => "Eulerian 6-circle diffractometer",
        }
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<AxisPvs>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let diffractometer = Diffractometer::new(
            ctx,
            spec.required("name")?,
            spec.required("prefix")?,
            self.0,
            &spec.params::<AxisPvs>()?,
        )?;
        Ok(vec![BuiltDevice::new(diffractometer, spec, &["diffractometer"])])
    }
}

struct KohzuDcmFactory;

impl DeviceFactory for KohzuDcmFactory {
    fn device_type(&self) -> &'static str {
        "kohzu_dcm"
    }

    fn name(&self) -> &'static str {
        "Kohzu double-crystal monochromator"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<DcmMotorPvs>(spec, &["name", "prefix"])?;
        let pvs: DcmMotorPvs = spec.params()?;
        if pvs.m_th.is_empty() || pvs.m_y.is_empty() || pvs.m_z.is_empty() {
            return Err(BeamlineError::Configuration(format!(
                "{}: m_th, m_y and m_z are required",
                spec.describe()
            )));
        }
        Ok(())
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let dcm = KohzuDcm::new(
            ctx,
            spec.required("name")?,
            spec.required("prefix")?,
            &spec.params::<DcmMotorPvs>()?,
        );
        Ok(vec![BuiltDevice::new(dcm, spec, &["monochromator"])])
    }
}

struct ScalerFactory;

impl DeviceFactory for ScalerFactory {
    fn device_type(&self) -> &'static str {
        "scaler"
    }

    fn name(&self) -> &'static str {
        "Scaler with named channels"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let scaler = ScalerCh::new(ctx, spec.required("name")?, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(scaler, spec, &["scalers", "detectors"])])
    }
}

struct BankFactory<R> {
    device_type: &'static str,
    name: &'static str,
    _record: std::marker::PhantomData<fn() -> R>,
}

impl<R> BankFactory<R> {
    fn new(device_type: &'static str, name: &'static str) -> Self {
        Self {
            device_type,
            name,
            _record: std::marker::PhantomData,
        }
    }
}

impl<R: Record> DeviceFactory for BankFactory<R> {
    fn device_type(&self) -> &'static str {
        self.device_type
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let name = spec.name.as_deref().unwrap_or(self.device_type);
        let bank = RecordBank::<R>::new(ctx, name, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(bank, spec, &["calcs"])])
    }
}

/// A single transform record (`ad_transform`).
struct TransformFactory;

impl DeviceFactory for TransformFactory {
    fn device_type(&self) -> &'static str {
        "transform"
    }

    fn name(&self) -> &'static str {
        "synApps transform record"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let record = TransformRecord::new(ctx, spec.required("name")?, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(record, spec, &["calcs"])])
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SignalParams {
    pv: Option<String>,
    write_pv: Option<String>,
    read_only: bool,
    value_kind: ValueKind,
    kind: SignalKind,
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            pv: None,
            write_pv: None,
            read_only: false,
            value_kind: ValueKind::Double,
            kind: SignalKind::Normal,
        }
    }
}

struct SignalFactory;

impl DeviceFactory for SignalFactory {
    fn device_type(&self) -> &'static str {
        "signal"
    }

    fn name(&self) -> &'static str {
        "Single PV signal"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<SignalParams>(spec, &["name"])?;
        if spec.params::<SignalParams>()?.pv.is_none() {
            return Err(BeamlineError::Configuration(format!(
                "{}: missing 'pv'",
                spec.describe()
            )));
        }
        Ok(())
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let name = spec.required("name")?;
        let params: SignalParams = spec.params()?;
        let pv = params
            .pv
            .ok_or_else(|| BeamlineError::Configuration(format!("{}: missing 'pv'", spec.describe())))?;
        let signal = match (params.read_only, params.write_pv) {
            (true, _) => Signal::ro(ctx, name, pv),
            (false, Some(write)) => Signal::with_setpoint(ctx, name, pv, write),
            (false, None) => Signal::rw(ctx, name, pv),
        }
        .value_kind(params.value_kind)
        .kind(params.kind);
        Ok(vec![BuiltDevice::new(SignalDevice::new(name, signal), spec, &[])])
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShutterParams {
    delay_s: f64,
}

struct SimShutterFactory;

impl DeviceFactory for SimShutterFactory {
    fn device_type(&self) -> &'static str {
        "sim_shutter"
    }

    fn name(&self) -> &'static str {
        "Simulated PSS shutter"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<ShutterParams>(spec, &["name"])?;
        if spec.params::<ShutterParams>()?.delay_s < 0.0 {
            return Err(BeamlineError::Configuration(format!(
                "{}: delay_s must not be negative",
                spec.describe()
            )));
        }
        Ok(())
    }

    fn build(&self, _ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let shutter = SimShutter::new(spec.required("name")?);
        shutter.set_delay(Duration::from_secs_f64(spec.params::<ShutterParams>()?.delay_s.max(0.0)));
        Ok(vec![BuiltDevice::new(shutter, spec, &["shutters"])])
    }
}

struct TemperatureFactory;

impl DeviceFactory for TemperatureFactory {
    fn device_type(&self) -> &'static str {
        "temperature"
    }

    fn name(&self) -> &'static str {
        "Simulated temperature positioner (swait)"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let temperature =
            TemperaturePositioner::new(ctx, spec.required("name")?, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(temperature, spec, &["heaters"])])
    }
}

struct AdSimDetectorFactory;

impl DeviceFactory for AdSimDetectorFactory {
    fn device_type(&self) -> &'static str {
        "ad_sim_detector"
    }

    fn name(&self) -> &'static str {
        "ADSimDetector with HDF5 plugin"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let detector = SimDetector::new(ctx, spec.required("name")?, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(detector, spec, &["area_detector", "detectors"])])
    }
}

struct IocStatsFactory;

impl DeviceFactory for IocStatsFactory {
    fn device_type(&self) -> &'static str {
        "ioc_stats"
    }

    fn name(&self) -> &'static str {
        "synApps iocStats"
    }

    fn validate(&self, spec: &DeviceSpec) -> AppResult<()> {
        check::<NoParams>(spec, &["name", "prefix"])
    }

    fn build(&self, ctx: &ControlContext, spec: &DeviceSpec) -> AppResult<Vec<BuiltDevice>> {
        let stats = IocStats::new(ctx, spec.required("name")?, spec.required("prefix")?);
        Ok(vec![BuiltDevice::new(stats, spec, &["iocstats"])])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;

    fn ctx() -> ControlContext {
        ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default())
    }

    fn spec(toml_src: &str) -> DeviceSpec {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn builtin_table_knows_every_type() {
        let types = FactoryTable::with_builtin().device_types();
        for expected in [
            "ad_sim_detector",
            "four_circle",
            "ioc_stats",
            "kohzu_dcm",
            "motor",
            "motor_srev",
            "motors",
            "scaler",
            "signal",
            "sim_shutter",
            "six_circle",
            "temperature",
            "transform",
            "user_calcouts",
            "user_calcs",
            "user_sseqs",
            "user_transforms",
        ] {
            assert!(types.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let table = FactoryTable::with_builtin();
        let err = table
            .validate(&spec("type = \"ophyd.Nonsense\"\nname = \"x\""))
            .unwrap_err();
        assert!(matches!(err, BeamlineError::UnknownDeviceType(_)));
    }

    #[test]
    fn ranged_motors_build_with_default_label() {
        let table = FactoryTable::with_builtin();
        let entry = spec("type = \"motors\"\nprefix = \"gp:m\"\nfirst = 3\nlast = 1\nclass = \"EpicsMotor_SREV\"");
        table.validate(&entry).unwrap();
        let built = table.build(&ctx(), &entry).unwrap();
        let names: Vec<_> = built.iter().map(|b| b.device.name().to_string()).collect();
        assert_eq!(names, ["m1", "m2", "m3"]);
        assert_eq!(built[0].labels, ["motor"]);
        assert!(built[0].device.component("steps_per_revolution").is_some());
    }

    #[test]
    fn motors_without_prefix_fail_validation() {
        let table = FactoryTable::with_builtin();
        let err = table.validate(&spec("type = \"motors\"\nfirst = 1\nlast = 2")).unwrap_err();
        assert!(matches!(err, BeamlineError::Configuration(_)));
    }

    #[test]
    fn signal_entry_honours_kind_and_labels() {
        let table = FactoryTable::with_builtin();
        let entry = spec(
            "type = \"signal\"\nname = \"scan_id_epics\"\npv = \"gp:gp:int20\"\nvalue_kind = \"long\"\nlabels = [\"baseline\"]",
        );
        let built = table.build(&ctx(), &entry).unwrap();
        assert_eq!(built[0].labels, ["baseline"]);
        let signal = built[0].device.setpoint().unwrap();
        assert_eq!(signal.native_kind(), ValueKind::Long);
    }
}
