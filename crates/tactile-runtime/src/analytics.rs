//! Optional analytics forwarding
//!
//! The runtime never depends on an analytics backend. A host may plug one in
//! through [`AnalyticsSink`]; registrations and events are forwarded to it and
//! the per-hour budget declared at registration is enforced here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use tactile_core::InputTime;

const WINDOW: Duration = Duration::from_secs(3600);

/// Analytics backend
pub trait AnalyticsSink: Send + Sync {
    fn register_event(&self, name: &str, max_per_hour: u32, max_properties: u32);

    fn send_event(&self, name: &str, payload: &Value);
}

/// What happened to an analytics event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalyticsOutcome {
    Sent,
    /// No sink installed
    NoSink,
    /// The event name was never registered
    Unregistered,
    /// The hourly budget for this name is used up
    RateLimited,
    /// The payload has more properties than registered
    TooManyProperties,
}

#[derive(Debug)]
struct Registration {
    max_per_hour: u32,
    max_properties: u32,
    window_start: InputTime,
    sent_in_window: u32,
}

/// Forwards analytics to an optional sink with per-event budgets
#[derive(Default)]
pub struct Analytics {
    sink: RwLock<Option<Box<dyn AnalyticsSink>>>,
    registrations: Mutex<HashMap<String, Registration>>,
    sent: AtomicU64,
    rejected: AtomicU64,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: impl AnalyticsSink + 'static) {
        *self.sink.write() = Some(Box::new(sink));
    }

    pub fn clear_sink(&self) -> bool {
        self.sink.write().take().is_some()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Declare an event name and its limits. Re-registering updates the
    /// limits and keeps the current window.
    pub fn register(&self, name: &str, max_per_hour: u32, max_properties: u32, now: InputTime) {
        {
            let mut registrations = self.registrations.lock();
            registrations
                .entry(name.to_string())
                .and_modify(|registration| {
                    registration.max_per_hour = max_per_hour;
                    registration.max_properties = max_properties;
                })
                .or_insert(Registration {
                    max_per_hour,
                    max_properties,
                    window_start: now,
                    sent_in_window: 0,
                });
        }
        if let Some(sink) = self.sink.read().as_ref() {
            sink.register_event(name, max_per_hour, max_properties);
        }
        debug!(name, max_per_hour, max_properties, "analytics event registered");
    }

    /// Forward an event if it is registered and within budget
    pub fn send(&self, name: &str, payload: &Value, now: InputTime) -> AnalyticsOutcome {
        let sink = self.sink.read();
        let Some(sink) = sink.as_ref() else {
            return AnalyticsOutcome::NoSink;
        };

        let outcome = {
            let mut registrations = self.registrations.lock();
            match registrations.get_mut(name) {
                None => AnalyticsOutcome::Unregistered,
                Some(registration) => registration.admit(payload, now),
            }
        };

        if outcome == AnalyticsOutcome::Sent {
            sink.send_event(name, payload);
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(name, ?outcome, "analytics event not sent");
        }
        outcome
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Registration {
    fn admit(&mut self, payload: &Value, now: InputTime) -> AnalyticsOutcome {
        if let Value::Object(properties) = payload {
            if properties.len() > self.max_properties as usize {
                return AnalyticsOutcome::TooManyProperties;
            }
        }
        if now - self.window_start >= WINDOW {
            self.window_start = now;
            self.sent_in_window = 0;
        }
        if self.sent_in_window >= self.max_per_hour {
            return AnalyticsOutcome::RateLimited;
        }
        self.sent_in_window += 1;
        AnalyticsOutcome::Sent
    }
}

impl std::fmt::Debug for Analytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analytics")
            .field("sink", &self.has_sink())
            .field("registered", &self.registrations.lock().len())
            .field("sent", &self.sent_count())
            .field("rejected", &self.rejected_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        registered: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl AnalyticsSink for Arc<Recorder> {
        fn register_event(&self, name: &str, _max_per_hour: u32, _max_properties: u32) {
            self.registered.lock().push(name.to_string());
        }

        fn send_event(&self, name: &str, payload: &Value) {
            self.sent.lock().push((name.to_string(), payload.clone()));
        }
    }

    fn at(secs: f64) -> InputTime {
        InputTime::from_secs_f64(secs)
    }

    #[test]
    fn test_without_sink_nothing_is_sent() {
        let analytics = Analytics::new();
        analytics.register("startup", 10, 4, at(0.0));
        assert_eq!(analytics.send("startup", &json!({}), at(1.0)), AnalyticsOutcome::NoSink);
        assert_eq!(analytics.rejected_count(), 0);
    }

    #[test]
    fn test_forwarding_and_registration() {
        let recorder = Arc::new(Recorder::default());
        let analytics = Analytics::new();
        analytics.set_sink(Arc::clone(&recorder));

        analytics.register("device_connected", 10, 2, at(0.0));
        let payload = json!({ "interface": "HID", "product": "Pad" });
        assert_eq!(analytics.send("device_connected", &payload, at(1.0)), AnalyticsOutcome::Sent);
        assert_eq!(analytics.send("other", &payload, at(1.0)), AnalyticsOutcome::Unregistered);

        assert_eq!(*recorder.registered.lock(), vec!["device_connected".to_string()]);
        assert_eq!(recorder.sent.lock().len(), 1);
        assert_eq!(analytics.sent_count(), 1);
        assert_eq!(analytics.rejected_count(), 1);
    }

    #[test]
    fn test_hourly_budget() {
        let recorder = Arc::new(Recorder::default());
        let analytics = Analytics::new();
        analytics.set_sink(Arc::clone(&recorder));
        analytics.register("tick", 2, 8, at(0.0));

        assert_eq!(analytics.send("tick", &json!(1), at(10.0)), AnalyticsOutcome::Sent);
        assert_eq!(analytics.send("tick", &json!(2), at(20.0)), AnalyticsOutcome::Sent);
        assert_eq!(analytics.send("tick", &json!(3), at(30.0)), AnalyticsOutcome::RateLimited);

        // A new window opens an hour after the last one started
        assert_eq!(analytics.send("tick", &json!(4), at(3600.0)), AnalyticsOutcome::Sent);
        assert_eq!(recorder.sent.lock().len(), 3);
    }

    #[test]
    fn test_property_limit() {
        let analytics = Analytics::new();
        analytics.set_sink(Arc::new(Recorder::default()));
        analytics.register("config", 10, 1, at(0.0));

        let payload = json!({ "a": 1, "b": 2 });
        assert_eq!(
            analytics.send("config", &payload, at(0.0)),
            AnalyticsOutcome::TooManyProperties
        );
    }
}
