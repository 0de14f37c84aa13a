// src/core/telemetry.rs

//! Hook points for external trace/metric exporters.
//!
//! The core emits one span per request plus reconnect and latency signals
//! through the `TelemetryHook` trait. Nothing is recorded unless a hook is
//! installed, and hooks never receive reply bodies, so an exporter cannot
//! retain them.

use crate::core::errors::CitrineError;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Implemented by exporters (e.g. an OpenTelemetry adapter crate).
pub trait TelemetryHook: Send + Sync {
    /// A sampled request began. `name` is the command or batch span name
    /// (`GET`, `SET`, `Batch`, ...).
    fn on_request_started(&self, _name: &str) {}

    /// A sampled request finished, successfully or not.
    fn on_request_finished(&self, _name: &str, _latency: Duration, _success: bool) {}

    /// A connection was re-established after a failure.
    fn on_reconnect(&self, _addr: &str) {}
}

/// The installable hook slot plus the runtime-tunable sampling gate.
pub struct Telemetry {
    hook: RwLock<Option<Arc<dyn TelemetryHook>>>,
    sample_percentage: AtomicU32,
    rng: Mutex<SmallRng>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            hook: RwLock::new(None),
            sample_percentage: AtomicU32::new(100),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Installs (or replaces) the exporter hook.
    pub fn install(&self, hook: Arc<dyn TelemetryHook>) {
        *self.hook.write() = Some(hook);
    }

    pub fn uninstall(&self) {
        *self.hook.write() = None;
    }

    /// Sets the percentage of requests that emit spans. Tunable at runtime.
    pub fn set_sample_percentage(&self, percentage: u32) -> Result<(), CitrineError> {
        if percentage > 100 {
            return Err(CitrineError::Configuration(format!(
                "Sample percentage must be within 0..=100, got {percentage}"
            )));
        }
        self.sample_percentage.store(percentage, Ordering::Relaxed);
        Ok(())
    }

    pub fn sample_percentage(&self) -> u32 {
        self.sample_percentage.load(Ordering::Relaxed)
    }

    /// Begins a span for one request if a hook is installed and the sampling
    /// gate passes. The returned guard reports completion on finish.
    pub fn request_span(&self, name: &str) -> Option<RequestSpan> {
        let hook = self.hook.read().clone()?;
        let pct = self.sample_percentage.load(Ordering::Relaxed);
        if pct == 0 {
            return None;
        }
        if pct < 100 && self.rng.lock().gen_range(0..100) >= pct {
            return None;
        }
        hook.on_request_started(name);
        Some(RequestSpan {
            hook,
            name: name.to_string(),
            started_at: Instant::now(),
        })
    }

    pub fn record_reconnect(&self, addr: &str) {
        if let Some(hook) = self.hook.read().clone() {
            hook.on_reconnect(addr);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("installed", &self.hook.read().is_some())
            .field("sample_percentage", &self.sample_percentage)
            .finish()
    }
}

/// Guard for one emitted request span.
pub struct RequestSpan {
    hook: Arc<dyn TelemetryHook>,
    name: String,
    started_at: Instant,
}

impl RequestSpan {
    pub fn finish(self, success: bool) {
        self.hook
            .on_request_finished(&self.name, self.started_at.elapsed(), success);
    }
}
