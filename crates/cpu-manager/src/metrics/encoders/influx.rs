use influxdb_line_protocol::LineProtocolBuilder;

use super::FieldValue;
use super::MetricsEncoder;
use super::Point;

/// InfluxDB line protocol.
pub struct InfluxEncoder;

impl MetricsEncoder for InfluxEncoder {
    fn encode(&self, point: &Point) -> String {
        let mut builder = LineProtocolBuilder::new().measurement(&point.measurement);
        for (key, value) in &point.tags {
            builder = builder.tag(key, value);
        }

        let mut fields = point.fields.iter();
        // A line needs at least one field.
        let mut line = match fields.next() {
            Some((key, FieldValue::String(s))) => builder.field(key, s.as_str()),
            Some((key, FieldValue::Integer(i))) => builder.field(key, *i),
            Some((key, FieldValue::UnsignedInteger(u))) => builder.field(key, *u),
            Some((key, FieldValue::Float(f))) => builder.field(key, *f),
            Some((key, FieldValue::Boolean(b))) => builder.field(key, *b),
            None => builder.field("_empty", true),
        };
        for (key, value) in fields {
            line = match value {
                FieldValue::String(s) => line.field(key, s.as_str()),
                FieldValue::Integer(i) => line.field(key, *i),
                FieldValue::UnsignedInteger(u) => line.field(key, *u),
                FieldValue::Float(f) => line.field(key, *f),
                FieldValue::Boolean(b) => line.field(key, *b),
            };
        }

        let bytes = line.timestamp(point.timestamp).close_line().build();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn encodes_sorted_tags_and_typed_fields() {
        let point = Point::new("tf_cpu_manager", 1_609_459_200_000)
            .tag("node", "worker-1")
            .tag("cluster", "c1")
            .field("shared_cpus", 6u64)
            .field("policy", "static")
            .field("reconcile_failures", 0u64);

        assert_eq!(
            InfluxEncoder.encode(&point),
            "tf_cpu_manager,cluster=c1,node=worker-1 policy=\"static\",reconcile_failures=0u,shared_cpus=6u 1609459200000\n"
        );
    }

    #[test]
    fn point_without_fields_gets_placeholder() {
        let line = InfluxEncoder.encode(&Point::new("empty", 1).tag("node", "n"));
        assert_eq!(line, "empty,node=n _empty=true 1\n");
    }
}
