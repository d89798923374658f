//! synApps iocStats: IOC wall clock and uptime.

use async_trait::async_trait;
use beamline_core::capabilities::Device;
use beamline_core::control::ControlContext;
use beamline_core::signal::Signal;

#[derive(Debug)]
pub struct IocStats {
    name: String,
    pub iso8601: Signal,
    pub uptime: Signal,
}

impl IocStats {
    pub fn new(ctx: &ControlContext, name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            iso8601: Signal::ro(ctx, format!("{name}_iso8601"), format!("{prefix}iso8601")).text(),
            uptime: Signal::ro(ctx, format!("{name}_uptime"), format!("{prefix}UPTIME")).text(),
        }
    }
}

#[async_trait]
impl Device for IocStats {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        vec![
            ("iso8601".into(), self.iso8601.clone()),
            ("uptime".into(), self.uptime.clone()),
        ]
    }
}
