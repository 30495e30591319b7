use std::collections::BTreeMap;

pub mod influx;
pub mod json;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// One measurement line. Tags and fields are kept sorted so output is
/// stable.
#[derive(Debug, Clone, Default)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait MetricsEncoder: Send + Sync {
    fn encode(&self, point: &Point) -> String;
}

/// `json` selects the JSON encoder, anything else InfluxDB line protocol.
pub fn create_encoder(format: &str) -> Box<dyn MetricsEncoder> {
    match format.to_ascii_lowercase().as_str() {
        "json" => Box::new(json::JsonEncoder),
        _ => Box::new(influx::InfluxEncoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Point {
        Point::new("tf_cpu_manager", 1_700_000_000_000)
            .tag("node", "worker-1")
            .field("allocation_attempts", 3u64)
    }

    #[test]
    fn unknown_format_falls_back_to_influx() {
        let line = create_encoder("prometheus").encode(&sample());
        assert!(line.starts_with("tf_cpu_manager,node=worker-1 "), "{line}");
    }

    #[test]
    fn json_format_is_selected_case_insensitively() {
        let line = create_encoder("JSON").encode(&sample());
        assert!(line.starts_with('{'), "{line}");
    }
}
