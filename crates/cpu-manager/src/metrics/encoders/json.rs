use serde_json::json;

use super::MetricsEncoder;
use super::Point;

/// One JSON object per line: `{"measure", "ts", "tag", "field"}`.
pub struct JsonEncoder;

impl MetricsEncoder for JsonEncoder {
    fn encode(&self, point: &Point) -> String {
        let line = json!({
            "measure": point.measurement,
            "ts": point.timestamp,
            "tag": point.tags,
            "field": point.fields,
        });
        line.to_string() + "\n"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn encodes_point_as_json_line() {
        let point = Point::new("tf_cpu_manager", 42)
            .tag("node", "worker-1")
            .field("exclusive_cpus", 4u64)
            .field("ratio", 0.5)
            .field("static_policy", true);

        let line = JsonEncoder.encode(&point);
        assert!(line.ends_with('\n'));

        let parsed: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(parsed["measure"], "tf_cpu_manager");
        assert_eq!(parsed["ts"], 42);
        assert_eq!(parsed["tag"]["node"], "worker-1");
        assert_eq!(parsed["field"]["exclusive_cpus"], 4);
        assert_eq!(parsed["field"]["ratio"], 0.5);
        assert_eq!(parsed["field"]["static_policy"], true);
    }
}
