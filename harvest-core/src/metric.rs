//! The metric model.
//!
//! A metric is a named sample of one of two kinds: a `gauge` holding the most
//! recent float value, or a `counter` holding an integer delta that the store
//! accumulates. The kind and payload are a single sum type, so a metric can
//! never carry the wrong payload; the JSON wire form keeps the legacy
//! optional-field convention (`{id, type, delta?, value?}`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HarvestError, Result};

/// Metric kind tag, `gauge` or `counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(HarvestError::malformed(format!("bad metric type: {other}"))),
        }
    }
}

/// Metric payload, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parse a plain-text value for the given kind (the legacy URL form).
    pub fn parse(kind: MetricKind, text: &str) -> Result<Self> {
        match kind {
            MetricKind::Gauge => text
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(MetricValue::Gauge)
                .ok_or_else(|| HarvestError::malformed(format!("bad gauge value: {text}"))),
            MetricKind::Counter => text
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| HarvestError::malformed(format!("bad counter value: {text}"))),
        }
    }

    /// Render the value as a decimal string (shortest round-trippable form
    /// for gauges).
    pub fn render(&self) -> String {
        match self {
            MetricValue::Gauge(v) => format!("{v}"),
            MetricValue::Counter(d) => format!("{d}"),
        }
    }
}

/// A named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetric", into = "WireMetric")]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self { id: id.into(), value: MetricValue::Gauge(value) }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self { id: id.into(), value: MetricValue::Counter(delta) }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// The counter delta, if this is a counter.
    pub fn delta(&self) -> Option<i64> {
        match self.value {
            MetricValue::Counter(d) => Some(d),
            MetricValue::Gauge(_) => None,
        }
    }

    /// The gauge value, if this is a gauge.
    pub fn gauge_value(&self) -> Option<f64> {
        match self.value {
            MetricValue::Gauge(v) => Some(v),
            MetricValue::Counter(_) => None,
        }
    }
}

/// A read request body, `{id, type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}

/// The legacy JSON wire form. Exactly one of `delta`/`value` must be present,
/// consistent with `type`; anything else is rejected on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMetric {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl TryFrom<WireMetric> for Metric {
    type Error = HarvestError;

    fn try_from(wire: WireMetric) -> Result<Self> {
        let value = match (wire.kind, wire.delta, wire.value) {
            (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
            (MetricKind::Gauge, None, Some(value)) if value.is_finite() => {
                MetricValue::Gauge(value)
            }
            (MetricKind::Gauge, None, Some(_)) => {
                return Err(HarvestError::malformed(format!("gauge {} is not finite", wire.id)))
            }
            _ => {
                return Err(HarvestError::malformed(format!(
                    "metric {} has no payload matching type {}",
                    wire.id,
                    wire.kind.as_str()
                )))
            }
        };

        Ok(Metric { id: wire.id, value })
    }
}

impl From<Metric> for WireMetric {
    fn from(m: Metric) -> Self {
        let (delta, value) = match m.value {
            MetricValue::Counter(d) => (Some(d), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        WireMetric { id: m.id, kind: m.value.kind(), delta, value }
    }
}
