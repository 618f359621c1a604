//! Influx line-protocol rendering of probe results.

use std::fmt::Write;
use std::time::UNIX_EPOCH;

use super::identity::NodeIdentity;
use crate::model::Measurement;

/// Tag keys every line carries, in order. Caller tags may not reuse them.
const FIXED_TAGS: [&str; 7] = [
    "source_ip",
    "source_node",
    "source_host",
    "target_ip",
    "target_node",
    "target_host",
    "ip_version",
];

/// One line per measurement, in input order.
pub fn format_lines(
    metric: &str,
    source: &NodeIdentity,
    measurements: &[Measurement],
) -> Vec<String> {
    measurements
        .iter()
        .map(|m| format_line(metric, source, m))
        .collect()
}

pub fn format_line(metric: &str, source: &NodeIdentity, m: &Measurement) -> String {
    let mut line = String::with_capacity(256);

    escape_into(&mut line, metric, &[',', ' ']);

    let fixed = [
        m.source_ip.as_str(),
        source.node_name.as_str(),
        source.host_name.as_str(),
        m.target.ip.as_str(),
        m.target.node_name.as_str(),
        m.target.host_name.as_str(),
        m.ip_version.as_str(),
    ];
    for (key, value) in FIXED_TAGS.iter().zip(fixed) {
        push_tag(&mut line, key, value);
    }

    for (key, value) in &m.target.tags {
        if key.is_empty() || value.is_empty() || FIXED_TAGS.contains(&key.as_str()) {
            continue;
        }
        push_tag(&mut line, key, value);
    }

    let _ = write!(
        line,
        " packets_sent={}i,packets_recv={}i,packets_loss={}i,rtt_min={:.6},rtt_max={:.6},rtt_avg={:.6},rtt_std_dev={:.6}",
        m.packets_sent,
        m.packets_recv,
        m.packets_lost(),
        m.rtt_min,
        m.rtt_max,
        m.rtt_avg,
        m.rtt_std_dev,
    );

    if let Some(error) = &m.error {
        line.push_str(",error=\"");
        escape_field_into(&mut line, error);
        line.push('"');
    }

    let nanos = m
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let _ = write!(line, " {nanos}");

    line
}

fn push_tag(line: &mut String, key: &str, value: &str) {
    line.push(',');
    escape_into(line, key, &[',', '=', ' ']);
    line.push('=');
    escape_into(line, value, &[',', '=', ' ']);
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// String field values may not break the line, so newlines are written as
/// `\n` and `\r` escapes.
fn escape_field_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::model::{IpVersion, PingTarget};

    fn source() -> NodeIdentity {
        NodeIdentity {
            node_name: "bj01".to_string(),
            host_name: "cdnbj01-host".to_string(),
        }
    }

    fn measurement() -> Measurement {
        Measurement {
            target: PingTarget {
                ip: "10.0.0.1".to_string(),
                node_name: "sh02".to_string(),
                host_name: "cdnsh02-host".to_string(),
                tags: Default::default(),
            },
            source_ip: "10.0.0.9".to_string(),
            ip_version: IpVersion::V4,
            packets_sent: 10,
            packets_recv: 9,
            rtt_min: 1.0,
            rtt_max: 2.5,
            rtt_avg: 1.25,
            rtt_std_dev: 0.5,
            error: None,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    #[test]
    fn test_format_line() {
        let line = format_line("ping_mesh", &source(), &measurement());
        assert_eq!(
            line,
            "ping_mesh,source_ip=10.0.0.9,source_node=bj01,source_host=cdnbj01-host,\
             target_ip=10.0.0.1,target_node=sh02,target_host=cdnsh02-host,ip_version=IPv4 \
             packets_sent=10i,packets_recv=9i,packets_loss=1i,\
             rtt_min=1.000000,rtt_max=2.500000,rtt_avg=1.250000,rtt_std_dev=0.500000 \
             1700000000000000000"
        );
    }

    #[test]
    fn test_error_field_is_quoted() {
        let mut m =
            Measurement::failed(PingTarget::from_ip("10.0.0.2"), "host \"gw\" unreachable");
        m.timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1);

        let line = format_line("ping", &source(), &m);
        assert!(line.contains(
            "packets_sent=0i,packets_recv=0i,packets_loss=0i,rtt_min=0.000000"
        ));
        assert!(line.contains(r#",error="host \"gw\" unreachable" 1000000000"#));
    }

    #[test]
    fn test_error_field_stays_on_one_line() {
        let mut m = Measurement::failed(
            PingTarget::from_ip("10.0.0.2"),
            "sendto failed\r\nC:\\ping: network is unreachable\n",
        );
        m.timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1);

        let line = format_line("ping", &source(), &m);
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert!(line.ends_with(
            r#",error="sendto failed\r\nC:\\ping: network is unreachable\n" 1000000000"#
        ));

        let batch = format_lines("ping", &source(), &[m.clone(), m]).join("\n");
        assert_eq!(batch.lines().count(), 2);
    }

    #[test]
    fn test_tags_are_escaped_and_sorted() {
        let mut m = measurement();
        m.target.tags.insert("zone".to_string(), "north east".to_string());
        m.target.tags.insert("isp".to_string(), "a,b=c".to_string());
        m.target.tags.insert("source_ip".to_string(), "spoofed".to_string());
        m.target.tags.insert("empty".to_string(), String::new());

        let line = format_line("ping", &source(), &m);
        assert!(line.contains(r"ip_version=IPv4,isp=a\,b\=c,zone=north\ east packets_sent="));
        assert!(!line.contains("spoofed"));
        assert!(!line.contains("empty="));
    }

    #[test]
    fn test_measurement_name_escaped() {
        let line = format_line("ping mesh,v2", &source(), &measurement());
        assert!(line.starts_with(r"ping\ mesh\,v2,source_ip="));
    }

    #[test]
    fn test_format_lines_preserves_order() {
        let mut second = measurement();
        second.target.ip = "10.0.0.3".to_string();

        let lines = format_lines("ping", &source(), &[measurement(), second]);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("target_ip=10.0.0.1"));
        assert!(lines[1].contains("target_ip=10.0.0.3"));
    }
}
