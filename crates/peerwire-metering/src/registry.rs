//! Meter registries
//!
//! [`MeterRegistry`] registers named counters in a `prometheus::Registry`
//! and keeps them addressable by their dash-separated names.
//! [`PeerMeterVec`] holds the per-peer meters of one direction as children
//! of an `IntCounterVec`, one child per `"<addr>/<id>"` label value, all
//! reported under a fixed prefix such as `inbound-traffic/`.

use std::collections::BTreeMap;
use std::fmt;

use peerwire_common::{PeerwireError, Result};
use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::meter::Meter;

/// Label carrying the peer key on per-peer counters
pub const PEER_LABEL: &str = "peer";

const NAMESPACE: &str = "peerwire";

/// Prometheus-safe form of a dash-separated meter name
pub fn metric_name(name: &str) -> String {
    name.trim_end_matches('/').replace('-', "_")
}

fn registration_error(name: &str, err: prometheus::Error) -> PeerwireError {
    PeerwireError::Internal(format!("Failed to register {}: {}", name, err))
}

/// Named counters registered in a prometheus registry
pub struct MeterRegistry {
    registry: Registry,
    meters: BTreeMap<String, Meter>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            meters: BTreeMap::new(),
        }
    }

    /// Register a counter under `name`, or return the one already there
    pub fn register(&mut self, name: &str, help: &str) -> Result<Meter> {
        if let Some(meter) = self.meters.get(name) {
            return Ok(meter.clone());
        }
        let counter = IntCounter::with_opts(Opts::new(metric_name(name), help).namespace(NAMESPACE))
            .map_err(|e| registration_error(name, e))?;
        self.registry
            .register(Box::new(counter.clone()))
            .map_err(|e| registration_error(name, e))?;
        let meter = Meter::from_counter(counter);
        self.meters.insert(name.to_string(), meter.clone());
        Ok(meter)
    }

    pub fn get(&self, name: &str) -> Option<&Meter> {
        self.meters.get(name)
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Current count of every registered meter, ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.count()))
            .collect()
    }

    /// The prometheus registry the counters live in
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for MeterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MeterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterRegistry")
            .field("meters", &self.meters)
            .finish()
    }
}

/// Per-peer meters of one direction, labelled by peer key
#[derive(Clone)]
pub struct PeerMeterVec {
    prefix: String,
    vec: IntCounterVec,
}

impl PeerMeterVec {
    /// Build the vector for `prefix` and register it in `registry`
    pub fn new(prefix: impl Into<String>, help: &str, registry: &Registry) -> Result<Self> {
        let prefix = prefix.into();
        let opts = Opts::new(metric_name(&prefix), help)
            .namespace(NAMESPACE)
            .subsystem("peer");
        let vec = IntCounterVec::new(opts, &[PEER_LABEL])
            .map_err(|e| registration_error(&prefix, e))?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|e| registration_error(&prefix, e))?;
        Ok(Self { prefix, vec })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Meter for `key`, created on first use
    pub fn get_or_register(&self, key: &str) -> Meter {
        Meter::from_counter(self.vec.with_label_values(&[key]))
    }

    /// Current count for `key`, if it is registered
    pub fn get(&self, key: &str) -> Option<u64> {
        self.children()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, count)| count)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove the meter for `key`; unknown keys are ignored
    pub fn unregister(&self, key: &str) {
        let _ = self.vec.remove_label_values(&[key]);
    }

    pub fn len(&self) -> usize {
        self.children().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counts keyed without the prefix
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.children().into_iter().collect()
    }

    fn children(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for family in self.vec.collect() {
            for metric in family.get_metric() {
                let key = metric
                    .get_label()
                    .iter()
                    .find(|label| label.get_name() == PEER_LABEL);
                if let Some(label) = key {
                    out.push((
                        label.get_value().to_string(),
                        metric.get_counter().get_value() as u64,
                    ));
                }
            }
        }
        out
    }
}

impl fmt::Debug for PeerMeterVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMeterVec")
            .field("prefix", &self.prefix)
            .field("len", &self.len())
            .finish()
    }
}
