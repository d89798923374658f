//! Hardware communication boundary.
//!
//! Every device operation ends in a read or write of a named process
//! variable through [`ChannelAccess`]. The protocol itself is not part of
//! this workspace: the in-process soft IOC in `beamline-hardware` is the
//! implementation used for simulation and tests.
//!
//! # Timeout ordering
//!
//! Signals capture their [`ControlContext`] when they are constructed, and a
//! `ControlContext` can only be built from explicit [`ControlTimeouts`].
//! Configuring timeouts is therefore a precondition of constructing any
//! device: there is no global default that a device could race.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::error::{AppResult, BeamlineError};
use crate::value::{PvValue, ValueKind};

/// Poll interval while waiting for a channel to connect.
const CONNECT_POLL: Duration = Duration::from_millis(25);

/// Read/write access to named process variables.
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    /// Announce that a client intends to use `pv` with the given native type.
    ///
    /// Real transports open the channel here; the default does nothing.
    fn create_channel(&self, _pv: &str, _kind: ValueKind) {}

    /// Attempt to connect once. Returns `Disconnected` if the PV is unreachable.
    async fn connect(&self, pv: &str) -> AppResult<()>;

    /// Current connection state without blocking.
    fn is_connected(&self, pv: &str) -> bool;

    async fn get(&self, pv: &str) -> AppResult<PvValue>;

    async fn put(&self, pv: &str, value: PvValue) -> AppResult<()>;
}

/// Communication timeouts applied to every signal.
///
/// `connection = None` keeps connection waits unbounded. In configuration
/// files a connection timeout of `0` (or `null`) selects unbounded waits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTimeouts {
    #[serde(with = "opt_secs")]
    pub connection: Option<Duration>,
    #[serde(with = "secs")]
    pub read: Duration,
    #[serde(with = "secs")]
    pub write: Duration,
}

impl Default for ControlTimeouts {
    fn default() -> Self {
        Self {
            connection: Some(Duration::from_secs(5)),
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
        }
    }
}

/// Handle to the control layer plus the timeouts every signal will use.
#[derive(Clone)]
pub struct ControlContext {
    access: Arc<dyn ChannelAccess>,
    timeouts: ControlTimeouts,
}

impl std::fmt::Debug for ControlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlContext")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ControlContext {
    /// Configure the control layer. Devices can only be built afterwards.
    pub fn configure(access: Arc<dyn ChannelAccess>, timeouts: ControlTimeouts) -> Self {
        debug!(
            connection = ?timeouts.connection,
            read = ?timeouts.read,
            write = ?timeouts.write,
            "Control timeouts configured"
        );
        Self { access, timeouts }
    }

    pub fn access(&self) -> &Arc<dyn ChannelAccess> {
        &self.access
    }

    pub fn timeouts(&self) -> ControlTimeouts {
        self.timeouts
    }

    /// Block until `pv` connects or `timeout` elapses (`None` waits forever).
    pub async fn wait_for_pv(&self, pv: &str, timeout: Option<Duration>) -> AppResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.access.connect(pv).await {
                Ok(()) => return Ok(()),
                Err(BeamlineError::Disconnected(_)) => {
                    trace!(pv, "Channel not yet connected");
                }
                Err(e) => return Err(e),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(BeamlineError::ConnectionTimeout {
                        name: pv.to_string(),
                        timeout: timeout.unwrap_or_default(),
                    });
                }
            }
            sleep(CONNECT_POLL).await;
        }
    }

    /// Read with the configured read timeout.
    pub async fn get(&self, pv: &str) -> AppResult<PvValue> {
        match tokio::time::timeout(self.timeouts.read, self.access.get(pv)).await {
            Ok(result) => result,
            Err(_) => Err(BeamlineError::ConnectionTimeout {
                name: pv.to_string(),
                timeout: self.timeouts.read,
            }),
        }
    }

    /// Write with the configured write timeout.
    pub async fn put(&self, pv: &str, value: PvValue) -> AppResult<()> {
        match tokio::time::timeout(self.timeouts.write, self.access.put(pv, value)).await {
            Ok(result) => result,
            Err(_) => Err(BeamlineError::ConnectionTimeout {
                name: pv.to_string(),
                timeout: self.timeouts.write,
            }),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(secs) if secs <= 0.0 => Ok(None),
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connects only after a fixed number of attempts.
    struct SlowLink {
        attempts: AtomicUsize,
        connect_after: usize,
    }

    #[async_trait]
    impl ChannelAccess for SlowLink {
        async fn connect(&self, pv: &str) -> AppResult<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.connect_after {
                Ok(())
            } else {
                Err(BeamlineError::Disconnected(pv.to_string()))
            }
        }

        fn is_connected(&self, _pv: &str) -> bool {
            self.attempts.load(Ordering::SeqCst) >= self.connect_after
        }

        async fn get(&self, _pv: &str) -> AppResult<PvValue> {
            Ok(PvValue::Double(1.0))
        }

        async fn put(&self, _pv: &str, _value: PvValue) -> AppResult<()> {
            Ok(())
        }
    }

    fn context(connect_after: usize, timeouts: ControlTimeouts) -> ControlContext {
        ControlContext::configure(
            Arc::new(SlowLink {
                attempts: AtomicUsize::new(0),
                connect_after,
            }),
            timeouts,
        )
    }

    #[tokio::test]
    async fn waits_until_connected() {
        let ctx = context(3, ControlTimeouts::default());
        ctx.wait_for_pv("ioc:m1.RBV", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(ctx.access().is_connected("ioc:m1.RBV"));
    }

    #[tokio::test]
    async fn bounded_wait_fails_with_connection_timeout() {
        let ctx = context(usize::MAX, ControlTimeouts::default());
        let err = ctx
            .wait_for_pv("ioc:gone", Some(Duration::from_millis(80)))
            .await
            .unwrap_err();
        assert!(matches!(err, BeamlineError::ConnectionTimeout { .. }));
    }

    #[test]
    fn timeouts_deserialize_null_connection_as_unbounded() {
        let t: ControlTimeouts =
            serde_json::from_str(r#"{"connection": null, "read": 1.5, "write": 2}"#).unwrap();
        assert_eq!(t.connection, None);
        assert_eq!(t.read, Duration::from_millis(1500));

        let t: ControlTimeouts = serde_json::from_str(r#"{"connection": 0}"#).unwrap();
        assert_eq!(t.connection, None);
        assert_eq!(t.write, Duration::from_secs(5));
    }
}
