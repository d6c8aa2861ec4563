//! Readout of registered metrics for the end-of-run summary.

/// Current value of one counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Counter(u64),
    Gauge(i64),
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reading::Counter(v) => write!(f, "{}", v),
            Reading::Gauge(v) => write!(f, "{}", v),
        }
    }
}

/// Every registered counter and gauge whose name starts with `prefix`,
/// sorted by name.
pub fn snapshot(prefix: &str) -> Vec<(String, Reading)> {
    let mut readings = Vec::new();

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if name.is_empty() || !name.starts_with(prefix) {
            continue;
        }
        let reading = match metric.value() {
            Some(metriken::Value::Counter(v)) => Reading::Counter(v),
            Some(metriken::Value::Gauge(v)) => Reading::Gauge(v),
            _ => continue,
        };
        readings.push((name.to_string(), reading));
    }

    readings.sort_by(|a, b| a.0.cmp(&b.0));
    readings
}
