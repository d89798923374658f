//! synApps user calculation records.
//!
//! Banks of numbered records share one enable PV:
//!
//! | Bank               | Enable PV                      | Records                 |
//! |--------------------|--------------------------------|-------------------------|
//! | `user_calcs`       | `{prefix}userCalcEnable`       | swait `userCalc1..10`   |
//! | `user_calcouts`    | `{prefix}userCalcOutEnable`    | calcout `userCalcOut1..10` |
//! | `user_sseqs`       | `{prefix}userStringSeqEnable`  | sseq `userStringSeq1..10` |
//! | `user_transforms`  | `{prefix}userTranEnable`       | transform `userTran1..10` |

use async_trait::async_trait;
use beamline_core::capabilities::Device;
use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::Signal;
use std::sync::Arc;
use tracing::debug;

/// Records per bank.
pub const BANK_SIZE: usize = 10;

/// Record `SCAN` menu, indexed by menu position.
pub const SCAN_RATES: [&str; 10] = [
    "Passive",
    "Event",
    "I/O Intr",
    "10 second",
    "5 second",
    "2 second",
    "1 second",
    ".5 second",
    ".2 second",
    ".1 second",
];

/// `SCAN` menu string for a menu index.
pub fn scan_rate(index: usize) -> Option<&'static str> {
    SCAN_RATES.get(index).copied()
}

const SWAIT_CHANNELS: &str = "ABCDEFGHIJKL";
const TRANSFORM_CHANNELS: &str = "ABCDEFGHIJKLMNOP";

/// A record kind that can live in a [`RecordBank`].
pub trait Record: Device + Sized {
    /// Bank attribute prefix (`calc`, `calcout`, `sseq`, `transform`).
    const MEMBER: &'static str;
    /// Record PV stem (`userCalc`, `userCalcOut`, ...).
    const PV_STEM: &'static str;
    /// Enable PV suffix of the bank.
    const ENABLE: &'static str;

    fn build(ctx: &ControlContext, name: &str, prefix: &str) -> Self;
}

fn nested(base: &str, device: &dyn Device) -> Vec<(String, Signal)> {
    device
        .signals()
        .into_iter()
        .map(|(p, s)| (format!("{base}.{p}"), s))
        .collect()
}

// =============================================================================
// swait
// =============================================================================

#[derive(Debug, Clone)]
pub struct SwaitChannel {
    pub letter: char,
    pub input_value: Signal,
    pub input_pv: Signal,
}

/// synApps `swait` record.
#[derive(Debug)]
pub struct SwaitRecord {
    name: String,
    prefix: String,
    pub description: Signal,
    pub scanning_rate: Signal,
    pub calculation: Signal,
    pub calculated_value: Signal,
    pub output_link_pv: Signal,
    pub precision: Signal,
    channels: Vec<SwaitChannel>,
}

impl SwaitRecord {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        let sig = |s: &str| format!("{name}_{s}");
        let pv = |f: &str| format!("{prefix}.{f}");
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            description: Signal::rw(ctx, sig("description"), pv("DESC")).text().config(),
            scanning_rate: Signal::rw(ctx, sig("scanning_rate"), pv("SCAN")).text().config(),
            calculation: Signal::rw(ctx, sig("calculation"), pv("CALC")).text().config(),
            calculated_value: Signal::rw(ctx, name, pv("VAL")).hinted(),
            output_link_pv: Signal::rw(ctx, sig("output_link_pv"), pv("OUTN")).text().config(),
            precision: Signal::rw(ctx, sig("precision"), pv("PREC")).long().config(),
            channels: SWAIT_CHANNELS
                .chars()
                .map(|c| SwaitChannel {
                    letter: c,
                    input_value: Signal::rw(ctx, sig(&format!("channels_{c}_input_value")), pv(&c.to_string())),
                    input_pv: Signal::rw(ctx, sig(&format!("channels_{c}_input_pv")), pv(&format!("IN{c}N")))
                        .text()
                        .config(),
                })
                .collect(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn channel(&self, letter: char) -> Option<&SwaitChannel> {
        self.channels.iter().find(|c| c.letter == letter)
    }

    /// Channel by letter, or a configuration error naming the record.
    pub fn require(&self, letter: char) -> AppResult<&SwaitChannel> {
        self.channel(letter).ok_or_else(|| {
            BeamlineError::Configuration(format!("{}: no channel {letter}", self.name))
        })
    }

    /// Return the record to a passive, empty state.
    pub async fn reset(&self) -> AppResult<()> {
        debug!(record = %self.name, "reset swait");
        self.description.put(self.name.as_str()).await?;
        self.scanning_rate.put("Passive").await?;
        self.calculation.put("0").await?;
        self.precision.put(5).await?;
        self.output_link_pv.put("").await?;
        for channel in &self.channels {
            channel.input_pv.put("").await?;
            channel.input_value.put(0.0).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for SwaitRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = vec![
            ("description".to_string(), self.description.clone()),
            ("scanning_rate".to_string(), self.scanning_rate.clone()),
            ("calculation".to_string(), self.calculation.clone()),
            ("calculated_value".to_string(), self.calculated_value.clone()),
            ("output_link_pv".to_string(), self.output_link_pv.clone()),
            ("precision".to_string(), self.precision.clone()),
        ];
        for c in &self.channels {
            signals.push((format!("channels.{}.input_value", c.letter), c.input_value.clone()));
            signals.push((format!("channels.{}.input_pv", c.letter), c.input_pv.clone()));
        }
        signals
    }
}

impl Record for SwaitRecord {
    const MEMBER: &'static str = "calc";
    const PV_STEM: &'static str = "userCalc";
    const ENABLE: &'static str = "userCalcEnable";

    fn build(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self::new(ctx, name, prefix)
    }
}

/// Lorentzian peak: `D*(1+E*(RNDM-0.5))/(1+((A-B)/(C/2))^2)`, where `A` is
/// the reference signal (usually a motor readback).
pub const LORENTZIAN_CALC: &str = "D*(1+E*(RNDM-0.5))/(1+((A-B)/(C/2))^2)";

/// Program `swait` to compute a noisy Lorentzian of `ref_pv`.
pub async fn setup_lorentzian_swait(
    swait: &SwaitRecord,
    ref_pv: &str,
    center: f64,
    width: f64,
    scale: f64,
    noise: f64,
) -> AppResult<()> {
    if width <= 0.0 {
        return Err(BeamlineError::Configuration(format!(
            "Lorentzian width must be positive, got {width}"
        )));
    }
    swait.reset().await?;
    swait.scanning_rate.put("I/O Intr").await?;
    swait.description.put("Lorentzian").await?;
    swait.require('A')?.input_pv.put(ref_pv).await?;
    swait.require('B')?.input_value.put(center).await?;
    swait.require('C')?.input_value.put(width).await?;
    swait.require('D')?.input_value.put(scale).await?;
    swait.require('E')?.input_value.put(noise).await?;
    swait.calculation.put(LORENTZIAN_CALC).await?;
    debug!(record = %swait.name(), ref_pv, center, width, scale, noise, "Lorentzian installed");
    Ok(())
}

// =============================================================================
// transform
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransformChannel {
    pub letter: char,
    pub comment: Signal,
    pub input_pv: Signal,
    pub expression: Signal,
    pub output_pv: Signal,
    pub current_value: Signal,
}

/// synApps `transform` record.
#[derive(Debug)]
pub struct TransformRecord {
    name: String,
    pub description: Signal,
    pub scanning_rate: Signal,
    pub calc_option: Signal,
    channels: Vec<TransformChannel>,
}

impl TransformRecord {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        let sig = |s: &str| format!("{name}_{s}");
        let pv = |f: &str| format!("{prefix}.{f}");
        Self {
            name: name.to_string(),
            description: Signal::rw(ctx, sig("description"), pv("DESC")).text().config(),
            scanning_rate: Signal::rw(ctx, sig("scanning_rate"), pv("SCAN")).text().config(),
            calc_option: Signal::rw(ctx, sig("calc_option"), pv("COPT")).text().config(),
            channels: TRANSFORM_CHANNELS
                .chars()
                .map(|c| TransformChannel {
                    letter: c,
                    comment: Signal::rw(ctx, sig(&format!("channels_{c}_comment")), pv(&format!("CMT{c}")))
                        .text()
                        .config(),
                    input_pv: Signal::rw(ctx, sig(&format!("channels_{c}_input_pv")), pv(&format!("INP{c}")))
                        .text()
                        .config(),
                    expression: Signal::rw(ctx, sig(&format!("channels_{c}_expression")), pv(&format!("CLC{c}")))
                        .text()
                        .config(),
                    output_pv: Signal::rw(ctx, sig(&format!("channels_{c}_output_pv")), pv(&format!("OUT{c}")))
                        .text()
                        .config(),
                    current_value: Signal::rw(ctx, sig(&format!("channels_{c}_current_value")), pv(&c.to_string())),
                })
                .collect(),
        }
    }

    pub fn channel(&self, letter: char) -> Option<&TransformChannel> {
        self.channels.iter().find(|c| c.letter == letter)
    }

    /// Channel by letter, or a configuration error naming the record.
    pub fn require(&self, letter: char) -> AppResult<&TransformChannel> {
        self.channel(letter).ok_or_else(|| {
            BeamlineError::Configuration(format!("{}: no channel {letter}", self.name))
        })
    }

    pub async fn reset(&self) -> AppResult<()> {
        debug!(record = %self.name, "reset transform");
        self.description.put(self.name.as_str()).await?;
        self.scanning_rate.put("Passive").await?;
        self.calc_option.put("Conditional").await?;
        for c in &self.channels {
            c.comment.put("").await?;
            c.input_pv.put("").await?;
            c.expression.put("").await?;
            c.output_pv.put("").await?;
            c.current_value.put(0.0).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for TransformRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = vec![
            ("description".to_string(), self.description.clone()),
            ("scanning_rate".to_string(), self.scanning_rate.clone()),
            ("calc_option".to_string(), self.calc_option.clone()),
        ];
        for c in &self.channels {
            let base = format!("channels.{}", c.letter);
            signals.push((format!("{base}.comment"), c.comment.clone()));
            signals.push((format!("{base}.input_pv"), c.input_pv.clone()));
            signals.push((format!("{base}.expression"), c.expression.clone()));
            signals.push((format!("{base}.output_pv"), c.output_pv.clone()));
            signals.push((format!("{base}.current_value"), c.current_value.clone()));
        }
        signals
    }
}

impl Record for TransformRecord {
    const MEMBER: &'static str = "transform";
    const PV_STEM: &'static str = "userTran";
    const ENABLE: &'static str = "userTranEnable";

    fn build(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self::new(ctx, name, prefix)
    }
}

// =============================================================================
// calcout / sseq (only the fields the setup touches)
// =============================================================================

#[derive(Debug)]
pub struct CalcoutRecord {
    name: String,
    pub description: Signal,
    pub calculation: Signal,
    pub calculated_value: Signal,
}

#[async_trait]
impl Device for CalcoutRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        vec![
            ("description".to_string(), self.description.clone()),
            ("calculation".to_string(), self.calculation.clone()),
            ("calculated_value".to_string(), self.calculated_value.clone()),
        ]
    }
}

impl Record for CalcoutRecord {
    const MEMBER: &'static str = "calcout";
    const PV_STEM: &'static str = "userCalcOut";
    const ENABLE: &'static str = "userCalcOutEnable";

    fn build(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Signal::rw(ctx, format!("{name}_description"), format!("{prefix}.DESC"))
                .text()
                .config(),
            calculation: Signal::rw(ctx, format!("{name}_calculation"), format!("{prefix}.CALC"))
                .text()
                .config(),
            calculated_value: Signal::rw(ctx, name, format!("{prefix}.VAL")),
        }
    }
}

#[derive(Debug)]
pub struct SseqRecord {
    name: String,
    pub description: Signal,
    pub process: Signal,
}

#[async_trait]
impl Device for SseqRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        vec![
            ("description".to_string(), self.description.clone()),
            ("process_record".to_string(), self.process.clone()),
        ]
    }
}

impl Record for SseqRecord {
    const MEMBER: &'static str = "sseq";
    const PV_STEM: &'static str = "userStringSeq";
    const ENABLE: &'static str = "userStringSeqEnable";

    fn build(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Signal::rw(ctx, format!("{name}_description"), format!("{prefix}.DESC"))
                .text()
                .config(),
            process: Signal::rw(ctx, format!("{name}_process_record"), format!("{prefix}.PROC"))
                .long()
                .omitted(),
        }
    }
}

// =============================================================================
// Banks
// =============================================================================

/// A bank of numbered records sharing one enable switch.
#[derive(Debug)]
pub struct RecordBank<R: Record> {
    name: String,
    pub enable: Signal,
    members: Vec<Arc<R>>,
}

pub type UserCalcs = RecordBank<SwaitRecord>;
pub type UserCalcouts = RecordBank<CalcoutRecord>;
pub type UserSseqs = RecordBank<SseqRecord>;
pub type UserTransforms = RecordBank<TransformRecord>;

impl<R: Record> RecordBank<R> {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            enable: Signal::rw(ctx, format!("{name}_enable"), format!("{prefix}{}", R::ENABLE))
                .long()
                .config(),
            members: (1..=BANK_SIZE)
                .map(|n| {
                    Arc::new(R::build(
                        ctx,
                        &format!("{name}_{}{n}", R::MEMBER),
                        &format!("{prefix}{}{n}", R::PV_STEM),
                    ))
                })
                .collect(),
        }
    }

    /// Record by 1-based number (`calc9` is `member(9)`).
    pub fn member(&self, number: usize) -> Option<&Arc<R>> {
        number.checked_sub(1).and_then(|i| self.members.get(i))
    }

    /// Record by number, or a configuration error naming the bank.
    pub fn require(&self, number: usize) -> AppResult<&Arc<R>> {
        self.member(number).ok_or_else(|| {
            BeamlineError::Configuration(format!("{} has no {}{number}", self.name, R::MEMBER))
        })
    }
}

#[async_trait]
impl<R: Record> Device for RecordBank<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = vec![("enable".to_string(), self.enable.clone())];
        for (i, member) in self.members.iter().enumerate() {
            signals.extend(nested(&format!("{}{}", R::MEMBER, i + 1), member.as_ref()));
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use beamline_core::value::PvValue;

    fn setup() -> (Arc<SoftIoc>, ControlContext) {
        let ioc = Arc::new(SoftIoc::new());
        let ctx = ControlContext::configure(ioc.clone(), ControlTimeouts::default());
        (ioc, ctx)
    }

    #[test]
    fn bank_members_follow_pv_stem() {
        let (_, ctx) = setup();
        let calcs = UserCalcs::new(&ctx, "user_calcs", "gp:");
        assert_eq!(calcs.enable.read_pv(), "gp:userCalcEnable");
        assert_eq!(calcs.member(9).unwrap().prefix(), "gp:userCalc9");
        assert!(calcs.member(11).is_none());
        assert!(calcs.component("calc10.channels.A.input_pv").is_some());

        let transforms = UserTransforms::new(&ctx, "user_transforms", "gp:");
        assert_eq!(transforms.enable.read_pv(), "gp:userTranEnable");
        assert!(transforms.component("transform1.channels.P.expression").is_some());
    }

    #[tokio::test]
    async fn lorentzian_programs_the_record() {
        let (ioc, ctx) = setup();
        let calc1 = SwaitRecord::new(&ctx, "user_calcs_calc1", "gp:userCalc1");
        setup_lorentzian_swait(&calc1, "gp:m1.RBV", 0.25, 0.1, 95000.0, 0.05)
            .await
            .unwrap();
        assert_eq!(ioc.value("gp:userCalc1.INAN"), Some(PvValue::from("gp:m1.RBV")));
        assert_eq!(ioc.value("gp:userCalc1.B"), Some(PvValue::Double(0.25)));
        assert_eq!(ioc.value("gp:userCalc1.CALC"), Some(PvValue::from(LORENTZIAN_CALC)));
        assert_eq!(ioc.value("gp:userCalc1.DESC"), Some(PvValue::from("Lorentzian")));
    }

    #[tokio::test]
    async fn lorentzian_rejects_non_positive_width() {
        let (_, ctx) = setup();
        let calc1 = SwaitRecord::new(&ctx, "calc1", "gp:userCalc1");
        assert!(setup_lorentzian_swait(&calc1, "gp:m1.RBV", 0.0, 0.0, 1.0, 0.0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn transform_reset_clears_channels() {
        let (ioc, ctx) = setup();
        let tr = TransformRecord::new(&ctx, "ad_transform", "gp:userTran10");
        tr.reset().await.unwrap();
        assert_eq!(ioc.value("gp:userTran10.CLCA"), Some(PvValue::from("")));
        assert_eq!(ioc.value("gp:userTran10.SCAN"), Some(PvValue::from("Passive")));
    }
}
