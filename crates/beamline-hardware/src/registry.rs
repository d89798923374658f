//! Device Registry
//!
//! Central directory of constructed device handles, keyed by name and by
//! label (capability tag such as `motor`, `detector`, `baseline`).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                         │
//! │   names:  m1 ─┐   dcm ─┐   scaler1 ─┐   I0 ─┐                │
//! │               ▼        ▼            ▼       ▼                │
//! │        Arc<dyn Device> (registration order preserved)       │
//! │   labels: motor → {m1, m2, ...}   counter → {I0, diode, ...} │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! The registry is an explicit object shared by `Arc`. It is populated at
//! startup from the devices file; the only later writer is the scaler alias
//! provisioning step. Lookups take a read lock and never block each other.
//!
//! # Lookup semantics
//!
//! - [`DeviceRegistry::find`]: an exact name wins; otherwise a label must
//!   match exactly one device. Absent devices are a `Lookup` error.
//! - [`DeviceRegistry::find_optional`]: the absent-allowed form, never fails.
//! - [`DeviceRegistry::findall`]: lazy iterator over a label, registration order.

use beamline_core::capabilities::{downcast_device, Device};
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::signal::Signal;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::devices::signal_device::SignalDevice;

/// A device and the labels it was registered with.
#[derive(Clone)]
pub struct RegisteredDevice {
    pub device: Arc<dyn Device>,
    pub labels: BTreeSet<String>,
}

/// Summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub labels: Vec<String>,
    pub connected: bool,
    pub num_signals: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// Names in registration order.
    order: Vec<String>,
    devices: HashMap<String, RegisteredDevice>,
}

/// Directory of devices keyed by name and label.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under its name and every label.
    ///
    /// Fails with `DuplicateName` (leaving the registry unchanged) if the name
    /// is taken.
    pub fn register<I, S>(&self, device: Arc<dyn Device>, labels: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = device.name().to_string();
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();

        let mut inner = self.inner.write();
        if inner.devices.contains_key(&name) {
            return Err(BeamlineError::DuplicateName(name));
        }
        debug!(device = %name, ?labels, "Registering device");
        inner.order.push(name.clone());
        inner
            .devices
            .insert(name, RegisteredDevice { device, labels });
        Ok(())
    }

    /// Register a single signal as a device named `name`.
    ///
    /// Re-registering the same name for the same control points is a no-op,
    /// so provisioning steps can run more than once. Returns whether a new
    /// entry was added.
    pub fn register_alias<I, S>(&self, name: &str, signal: &Signal, labels: I) -> AppResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(existing) = self.get(name) {
            let same = existing
                .device
                .setpoint()
                .or_else(|| existing.device.component(""))
                .map(|s| s.same_source(signal))
                .unwrap_or(false);
            if same {
                debug!(alias = %name, "Alias already registered");
                return Ok(false);
            }
            return Err(BeamlineError::DuplicateName(name.to_string()));
        }
        let alias = Arc::new(SignalDevice::new(name, signal.renamed(name)));
        self.register(alias, labels)?;
        info!(alias = %name, pv = %signal.read_pv(), "Registered alias");
        Ok(true)
    }

    fn get(&self, name: &str) -> Option<RegisteredDevice> {
        self.inner.read().devices.get(name).cloned()
    }

    /// Exactly one device by name, or by a label carried by one device.
    pub fn find(&self, key: &str) -> AppResult<Arc<dyn Device>> {
        let inner = self.inner.read();
        if let Some(entry) = inner.devices.get(key) {
            return Ok(entry.device.clone());
        }
        let matches: Vec<&RegisteredDevice> = inner
            .order
            .iter()
            .filter_map(|n| inner.devices.get(n))
            .filter(|d| d.labels.contains(key))
            .collect();
        match matches.as_slice() {
            [] => Err(BeamlineError::Lookup(key.to_string())),
            [one] => Ok(one.device.clone()),
            many => Err(BeamlineError::Ambiguous {
                key: key.to_string(),
                count: many.len(),
                names: many.iter().map(|d| d.device.name().to_string()).collect(),
            }),
        }
    }

    /// Absent-allowed lookup: `None` instead of an error.
    pub fn find_optional(&self, key: &str) -> Option<Arc<dyn Device>> {
        match self.find(key) {
            Ok(device) => Some(device),
            Err(BeamlineError::Lookup(_)) => None,
            Err(e) => {
                warn!(key, error = %e, "Lookup did not resolve to one device");
                None
            }
        }
    }

    /// Look up a device and recover its concrete type.
    pub fn find_as<T: Device>(&self, key: &str) -> AppResult<Arc<T>> {
        let device = self.find(key)?;
        let name = device.name().to_string();
        downcast_device::<T>(device).ok_or_else(|| {
            BeamlineError::Configuration(format!(
                "device '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Every device carrying `label`, lazily, in registration order.
    pub fn findall<'a>(&'a self, label: &'a str) -> FindAll<'a> {
        FindAll {
            registry: self,
            label,
            position: 0,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().devices.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn labels_of(&self, name: &str) -> Option<BTreeSet<String>> {
        self.get(name).map(|d| d.labels)
    }

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|n| inner.devices.get(n))
            .map(|d| DeviceInfo {
                name: d.device.name().to_string(),
                labels: d.labels.iter().cloned().collect(),
                connected: d.device.is_connected(),
                num_signals: d.device.signals().len(),
            })
            .collect()
    }
}

/// Lazy label query. Each step takes the read lock briefly, so devices
/// registered while iterating are still visited.
pub struct FindAll<'a> {
    registry: &'a DeviceRegistry,
    label: &'a str,
    position: usize,
}

impl Iterator for FindAll<'_> {
    type Item = Arc<dyn Device>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.registry.inner.read();
        while self.position < inner.order.len() {
            let name = &inner.order[self.position];
            self.position += 1;
            if let Some(entry) = inner.devices.get(name) {
                if entry.labels.contains(self.label) {
                    return Some(entry.device.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::{ControlContext, ControlTimeouts};

    fn ctx() -> ControlContext {
        ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default())
    }

    fn signal_device(ctx: &ControlContext, name: &str, pv: &str) -> Arc<dyn Device> {
        Arc::new(SignalDevice::new(name, Signal::rw(ctx, name, pv)))
    }

    #[test]
    fn find_by_name_and_unique_label() {
        let ctx = ctx();
        let registry = DeviceRegistry::new();
        registry
            .register(signal_device(&ctx, "scan_id_epics", "gp:int20"), ["scan_id"])
            .unwrap();
        assert_eq!(registry.find("scan_id_epics").unwrap().name(), "scan_id_epics");
        assert_eq!(registry.find("scan_id").unwrap().name(), "scan_id_epics");
    }

    #[test]
    fn ambiguous_label_is_an_error() {
        let ctx = ctx();
        let registry = DeviceRegistry::new();
        registry
            .register(signal_device(&ctx, "a", "gp:a"), ["counter"])
            .unwrap();
        registry
            .register(signal_device(&ctx, "b", "gp:b"), ["counter"])
            .unwrap();
        let Err(err) = registry.find("counter") else {
            panic!("expected an error for ambiguous label");
        };
        assert!(matches!(err, BeamlineError::Ambiguous { count: 2, .. }));
        assert!(registry.find_optional("counter").is_none());
    }

    #[test]
    fn findall_is_lazy_and_ordered() {
        let ctx = ctx();
        let registry = DeviceRegistry::new();
        for name in ["c", "a", "b"] {
            registry
                .register(signal_device(&ctx, name, &format!("gp:{name}")), ["counter"])
                .unwrap();
        }
        let mut iter = registry.findall("counter");
        assert_eq!(iter.next().unwrap().name(), "c");
        // Registered after the query started, still visited.
        registry
            .register(signal_device(&ctx, "d", "gp:d"), ["counter"])
            .unwrap();
        let rest: Vec<String> = iter.map(|d| d.name().to_string()).collect();
        assert_eq!(rest, vec!["a", "b", "d"]);
    }

    #[test]
    fn alias_registration_is_idempotent() {
        let ctx = ctx();
        let registry = DeviceRegistry::new();
        let s = Signal::ro(&ctx, "scaler1_chan02_s", "vsc:scaler1.S2");
        assert!(registry.register_alias("I0", &s, ["channel", "counter"]).unwrap());
        assert!(!registry.register_alias("I0", &s, ["channel", "counter"]).unwrap());
        assert_eq!(registry.len(), 1);

        let other = Signal::ro(&ctx, "scaler1_chan03_s", "vsc:scaler1.S3");
        assert!(matches!(
            registry.register_alias("I0", &other, ["counter"]),
            Err(BeamlineError::DuplicateName(_))
        ));
    }
}
