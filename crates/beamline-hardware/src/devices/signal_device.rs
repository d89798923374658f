//! A single signal registered as a device (`scan_id_epics`, scaler aliases).

use async_trait::async_trait;
use beamline_core::capabilities::Device;
use beamline_core::signal::Signal;

#[derive(Debug)]
pub struct SignalDevice {
    name: String,
    signal: Signal,
}

impl SignalDevice {
    pub fn new(name: impl Into<String>, signal: Signal) -> Self {
        Self {
            name: name.into(),
            signal,
        }
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

#[async_trait]
impl Device for SignalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn signals(&self) -> Vec<(String, Signal)> {
        vec![(String::new(), self.signal.clone())]
    }

    fn setpoint(&self) -> Option<Signal> {
        self.signal.is_writable().then(|| self.signal.clone())
    }
}
