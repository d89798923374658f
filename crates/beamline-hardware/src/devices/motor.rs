//! EPICS motor records and the ranged motor factory.
//!
//! ```text
//! prefix "gp:m{}", names "m{}", first 3, last 1
//!     → m1 (gp:m1), m2 (gp:m2), m3 (gp:m3)
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use beamline_core::capabilities::{Device, Movable};
use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::Signal;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

const DONE_POLL: Duration = Duration::from_millis(10);

/// Motor record flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorClass {
    /// Standard motor record fields.
    EpicsMotor,
    /// Adds the steps-per-revolution (`.SREV`) configuration field.
    EpicsMotorSrev,
}

impl FromStr for MotorClass {
    type Err = BeamlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EpicsMotor" | "ophyd.EpicsMotor" | "motor" => Ok(MotorClass::EpicsMotor),
            "EpicsMotor_SREV" | "EpicsMotorSrev" | "motor_srev" => Ok(MotorClass::EpicsMotorSrev),
            other => Err(BeamlineError::UnknownDeviceType(other.to_string())),
        }
    }
}

/// An EPICS motor record.
#[derive(Debug)]
pub struct EpicsMotor {
    name: String,
    prefix: String,
    pub user_readback: Signal,
    pub user_setpoint: Signal,
    pub motor_done_move: Signal,
    pub motor_stop: Signal,
    pub velocity: Signal,
    pub motor_egu: Signal,
    /// Present only on the `EpicsMotorSrev` flavour.
    pub steps_per_revolution: Option<Signal>,
}

impl EpicsMotor {
    pub fn new(ctx: &ControlContext, prefix: &str, name: &str) -> Self {
        Self::with_class(ctx, prefix, name, MotorClass::EpicsMotor)
    }

    pub fn with_class(ctx: &ControlContext, prefix: &str, name: &str, class: MotorClass) -> Self {
        let sig = |suffix: &str| format!("{name}_{suffix}");
        let pv = |field: &str| format!("{prefix}.{field}");
        let steps_per_revolution = (class == MotorClass::EpicsMotorSrev)
            .then(|| Signal::rw(ctx, sig("steps_per_revolution"), pv("SREV")).config());
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            user_readback: Signal::ro(ctx, name, pv("RBV")).hinted(),
            user_setpoint: Signal::rw(ctx, sig("user_setpoint"), pv("VAL")),
            motor_done_move: Signal::ro(ctx, sig("motor_done_move"), pv("DMOV"))
                .long()
                .omitted(),
            motor_stop: Signal::rw(ctx, sig("motor_stop"), pv("STOP")).long().omitted(),
            velocity: Signal::rw(ctx, sig("velocity"), pv("VELO")).config(),
            motor_egu: Signal::ro(ctx, sig("motor_egu"), pv("EGU")).text().config(),
            steps_per_revolution,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn has_srev(&self) -> bool {
        self.steps_per_revolution.is_some()
    }

    async fn wait_done(&self) -> Result<()> {
        loop {
            let done = self.motor_done_move.get_f64().await?;
            if done != 0.0 {
                return Ok(());
            }
            sleep(DONE_POLL).await;
        }
    }
}

#[async_trait]
impl Device for EpicsMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        let mut signals = vec![
            ("user_readback".to_string(), self.user_readback.clone()),
            ("user_setpoint".to_string(), self.user_setpoint.clone()),
            ("motor_done_move".to_string(), self.motor_done_move.clone()),
            ("motor_stop".to_string(), self.motor_stop.clone()),
            ("velocity".to_string(), self.velocity.clone()),
            ("motor_egu".to_string(), self.motor_egu.clone()),
        ];
        if let Some(srev) = &self.steps_per_revolution {
            signals.push(("steps_per_revolution".to_string(), srev.clone()));
        }
        signals
    }

    fn movable(&self) -> Option<&dyn Movable> {
        Some(self)
    }

    fn setpoint(&self) -> Option<Signal> {
        Some(self.user_setpoint.clone())
    }
}

#[async_trait]
impl Movable for EpicsMotor {
    async fn move_abs(&self, position: f64) -> Result<()> {
        debug!(motor = %self.name, position, "move");
        self.user_setpoint
            .put(position)
            .await
            .with_context(|| format!("moving {}", self.name))?;
        self.wait_done().await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.user_readback.get_f64().await?)
    }

    async fn stop(&self) -> Result<()> {
        self.motor_stop.put(1).await?;
        Ok(())
    }
}

// =============================================================================
// Ranged factory
// =============================================================================

/// Parameters of a ranged motor declaration.
#[derive(Debug, Clone)]
pub struct MotorRange {
    /// PV prefix template; `{}` (or `{:02d}`) is replaced by the index. Required.
    pub prefix: Option<String>,
    /// Name template, default `"m{}"`.
    pub names: String,
    pub first: i64,
    pub last: i64,
    pub class: MotorClass,
}

impl Default for MotorRange {
    fn default() -> Self {
        Self {
            prefix: None,
            names: "m{}".to_string(),
            first: 0,
            last: 0,
            class: MotorClass::EpicsMotor,
        }
    }
}

/// A name or PV template with one index field: `{}`, or an integer format
/// such as `{:02d}` (zero padded) or `{:3}` (space padded).
#[derive(Debug, Clone, PartialEq)]
struct IndexTemplate {
    head: String,
    tail: String,
    width: usize,
    zero_pad: bool,
}

impl IndexTemplate {
    /// Templates without a field get `{}` appended.
    fn parse(template: &str) -> AppResult<Self> {
        let invalid = |why: &str| {
            BeamlineError::Configuration(format!("Invalid index template '{template}': {why}"))
        };
        let Some(open) = template.find('{') else {
            if template.contains('}') {
                return Err(invalid("unmatched '}'"));
            }
            return Ok(Self {
                head: template.to_string(),
                tail: String::new(),
                width: 0,
                zero_pad: false,
            });
        };
        let rest = &template[open + 1..];
        let close = rest.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
        let (head, field, tail) = (&template[..open], &rest[..close], &rest[close + 1..]);
        if head.contains('}') || tail.contains(|c: char| c == '{' || c == '}') {
            return Err(invalid("expected exactly one index field"));
        }

        let spec = match field.strip_prefix(':') {
            Some(spec) => spec,
            None if field.is_empty() => "",
            None => return Err(invalid("field must be '{}' or '{:<width>d}'")),
        };
        let spec = spec.strip_suffix('d').unwrap_or(spec);
        let zero_pad = spec.starts_with('0');
        let width = if spec.is_empty() {
            0
        } else {
            spec.parse::<usize>()
                .map_err(|_| invalid("only integer widths are supported"))?
        };
        Ok(Self {
            head: head.to_string(),
            tail: tail.to_string(),
            width,
            zero_pad,
        })
    }

    fn render(&self, index: i64) -> String {
        let width = self.width;
        let index = if self.zero_pad {
            format!("{index:0width$}")
        } else {
            format!("{index:width$}")
        };
        format!("{}{index}{}", self.head, self.tail)
    }
}

/// Create one motor per index in `first..=last` (bounds in either order).
///
/// Fails immediately if no prefix template is given or a template cannot be
/// parsed. Templates without an index field get `{}` appended. Motors are
/// built lazily as the iterator is consumed.
pub fn motors(
    ctx: &ControlContext,
    range: MotorRange,
) -> AppResult<impl Iterator<Item = EpicsMotor>> {
    let prefix = range.prefix.as_deref().ok_or_else(|| {
        BeamlineError::Configuration("Must define a string value for 'prefix'".to_string())
    })?;
    let prefix = IndexTemplate::parse(prefix)?;
    let names = IndexTemplate::parse(&range.names)?;
    let (first, last) = if range.first <= range.last {
        (range.first, range.last)
    } else {
        (range.last, range.first)
    };
    let ctx = ctx.clone();
    let class = range.class;
    Ok((first..=last).map(move |i| {
        EpicsMotor::with_class(&ctx, &prefix.render(i), &names.render(i), class)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use std::sync::Arc;

    fn ctx() -> ControlContext {
        ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default())
    }

    fn summary(ctx: &ControlContext, range: MotorRange) -> Vec<(String, String)> {
        motors(ctx, range)
            .unwrap()
            .map(|m| (m.name().to_string(), m.prefix().to_string()))
            .collect()
    }

    #[test]
    fn swapped_bounds_yield_identical_inclusive_sequence() {
        let ctx = ctx();
        let forward = summary(
            &ctx,
            MotorRange {
                prefix: Some("gp:m{}".into()),
                first: 1,
                last: 4,
                ..Default::default()
            },
        );
        let backward = summary(
            &ctx,
            MotorRange {
                prefix: Some("gp:m{}".into()),
                first: 4,
                last: 1,
                ..Default::default()
            },
        );
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 4);
        assert_eq!(forward[0], ("m1".to_string(), "gp:m1".to_string()));
        assert_eq!(forward[3], ("m4".to_string(), "gp:m4".to_string()));
    }

    #[test]
    fn missing_placeholder_is_appended() {
        let ctx = ctx();
        let plain = summary(
            &ctx,
            MotorRange {
                prefix: Some("gp:m".into()),
                names: "motor".into(),
                first: 7,
                last: 8,
                ..Default::default()
            },
        );
        let explicit = summary(
            &ctx,
            MotorRange {
                prefix: Some("gp:m{}".into()),
                names: "motor{}".into(),
                first: 7,
                last: 8,
                ..Default::default()
            },
        );
        assert_eq!(plain, explicit);
        assert_eq!(plain[1], ("motor8".to_string(), "gp:m8".to_string()));
    }

    #[test]
    fn formatted_index_fields_are_padded() {
        let ctx = ctx();
        let padded = summary(
            &ctx,
            MotorRange {
                prefix: Some("gp:m{:02d}".into()),
                names: "axis{:03}".into(),
                first: 9,
                last: 10,
                ..Default::default()
            },
        );
        assert_eq!(padded[0], ("axis009".to_string(), "gp:m09".to_string()));
        assert_eq!(padded[1], ("axis010".to_string(), "gp:m10".to_string()));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for prefix in ["gp:m{:x}", "gp:m{0}", "gp:m{}_{}", "gp:m{", "gp:m}", "gp:{name}"] {
            let err = motors(
                &ctx(),
                MotorRange {
                    prefix: Some(prefix.into()),
                    ..Default::default()
                },
            )
            .err()
            .unwrap_or_else(|| panic!("{prefix} accepted"));
            assert!(matches!(err, BeamlineError::Configuration(_)), "{prefix}");
        }
    }

    #[test]
    fn missing_prefix_is_a_configuration_error() {
        let err = motors(&ctx(), MotorRange::default()).err().unwrap();
        assert!(matches!(err, BeamlineError::Configuration(_)));
    }

    #[test]
    fn unknown_class_is_rejected() {
        assert!("ophyd.EpicsMotor".parse::<MotorClass>().is_ok());
        assert!(matches!(
            "ophyd.Nonsense".parse::<MotorClass>(),
            Err(BeamlineError::UnknownDeviceType(_))
        ));
    }

    #[tokio::test]
    async fn move_completes_through_soft_ioc() {
        let ctx = ctx();
        let m1 = EpicsMotor::with_class(&ctx, "gp:m1", "m1", MotorClass::EpicsMotorSrev);
        m1.wait_for_connection(None).await.unwrap();
        m1.move_abs(2.5).await.unwrap();
        assert_eq!(m1.position().await.unwrap(), 2.5);
        assert!(m1.component("steps_per_revolution").is_some());
        assert!(EpicsMotor::new(&ctx, "gp:m2", "m2")
            .component("steps_per_revolution")
            .is_none());
    }
}
