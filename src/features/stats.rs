//! Traffic counters
//!
//! Named atomic counters registered on demand. The dispatcher accounts
//! per-user traffic under the fixed schema
//! `user>>>{email}>>>traffic>>>{uplink|downlink}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use super::Feature;
use crate::error::{Error, Result};

pub trait Counter: Send + Sync {
    /// Add a delta and return the new value.
    fn add(&self, delta: i64) -> i64;
    fn value(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl Counter for AtomicCounter {
    fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

pub trait StatsManager: Feature {
    /// Register a new counter. Fails when the name already exists.
    fn register_counter(&self, name: &str) -> Result<Arc<dyn Counter>>;

    fn get_counter(&self, name: &str) -> Option<Arc<dyn Counter>>;

    /// Existing counter, or a freshly registered one. `None` means this
    /// manager does not account traffic at all.
    fn get_or_register_counter(&self, name: &str) -> Option<Arc<dyn Counter>> {
        if let Some(c) = self.get_counter(name) {
            return Some(c);
        }
        self.register_counter(name).ok()
    }
}

/// Counter name for a user's uplink traffic.
pub fn user_uplink_counter_name(email: &str) -> String {
    format!("user>>>{}>>>traffic>>>uplink", email)
}

/// Counter name for a user's downlink traffic.
pub fn user_downlink_counter_name(email: &str) -> String {
    format!("user>>>{}>>>traffic>>>downlink", email)
}

/// In-memory stats manager: lock-protected name map, atomic counters.
#[derive(Default)]
pub struct InMemoryStatsManager {
    counters: Mutex<HashMap<String, Arc<AtomicCounter>>>,
}

impl InMemoryStatsManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feature for InMemoryStatsManager {}

impl StatsManager for InMemoryStatsManager {
    fn register_counter(&self, name: &str) -> Result<Arc<dyn Counter>> {
        let mut counters = self.counters.lock().unwrap();
        if counters.contains_key(name) {
            return Err(Error::Config(format!("counter {} already registered", name)));
        }
        let counter = Arc::new(AtomicCounter::default());
        counters.insert(name.to_string(), Arc::clone(&counter));
        Ok(counter)
    }

    fn get_counter(&self, name: &str) -> Option<Arc<dyn Counter>> {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn Counter>)
    }
}

/// Essential default: accounts nothing.
#[derive(Debug, Default)]
pub struct NoopStatsManager;

impl Feature for NoopStatsManager {}

impl StatsManager for NoopStatsManager {
    fn register_counter(&self, name: &str) -> Result<Arc<dyn Counter>> {
        Err(Error::Config(format!(
            "noop stats manager cannot register {}",
            name
        )))
    }

    fn get_counter(&self, _name: &str) -> Option<Arc<dyn Counter>> {
        None
    }
}
