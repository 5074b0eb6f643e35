//! Sample printers: text, compact JSON and pretty JSON, with an optional
//! case-insensitive field filter.
//!
//! The filter is a semicolon-delimited list; a field is shown when the
//! lowercased filter string contains the lowercased field name, or when the
//! filter is empty.

use std::io::{self, Write};

use serde::Serialize;

use crate::cli::Request;
use crate::probe::stats::{Stats, FIELDS};

fn matches(filter: &str, name: &str) -> bool {
    filter.is_empty() || filter.contains(&name.to_lowercase())
}

/// The IP portion of an `ip:port` / `[ip]:port` address string.
fn ip_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

/// Write one sample in the format selected by the request flags.
pub fn print<W: Write>(
    w: &mut W,
    target: &str,
    addr: &str,
    timestamp: i64,
    seq: u64,
    stats: &Stats,
    req: &Request,
) -> io::Result<()> {
    if req.quiet {
        return Ok(());
    }

    if req.json {
        print_json(w, target, addr, timestamp, seq, stats, &req.filter, false)
    } else if req.json_pretty {
        print_json(w, target, addr, timestamp, seq, stats, &req.filter, true)
    } else {
        print_text(w, target, addr, timestamp, seq, stats, &req.filter)
    }
}

fn print_text<W: Write>(
    w: &mut W,
    target: &str,
    addr: &str,
    timestamp: i64,
    seq: u64,
    stats: &Stats,
    filter: &str,
) -> io::Result<()> {
    let filter = filter.to_lowercase();

    writeln!(
        w,
        "Target:{} IP:{} Timestamp:{} Seq:{}",
        target,
        ip_of(addr),
        timestamp,
        seq
    )?;
    for field in FIELDS {
        if matches(&filter, field.name) {
            write!(w, "{}:{} ", field.name, (field.get)(stats))?;
        }
    }
    writeln!(w)
}

#[allow(clippy::too_many_arguments)]
fn print_json<W: Write>(
    w: &mut W,
    target: &str,
    addr: &str,
    timestamp: i64,
    seq: u64,
    stats: &Stats,
    filter: &str,
    pretty: bool,
) -> io::Result<()> {
    let filter = filter.to_lowercase();
    let mut map = serde_json::Map::new();

    // with no filter the header fields are part of the record
    if filter.is_empty() {
        map.insert("Target".to_string(), target.into());
        map.insert("IP".to_string(), ip_of(addr).into());
        map.insert("Timestamp".to_string(), timestamp.into());
        map.insert("Seq".to_string(), seq.into());
    }
    for field in FIELDS {
        if matches(&filter, field.name) {
            map.insert(field.name.to_string(), (field.get)(stats).to_json());
        }
    }

    if pretty {
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut ser = serde_json::Serializer::with_formatter(&mut *w, fmt);
        map.serialize(&mut ser).map_err(io::Error::other)?;
    } else {
        serde_json::to_writer(&mut *w, &map).map_err(io::Error::other)?;
    }
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(filter: &str) -> Request {
        Request {
            filter: filter.to_string(),
            ..Default::default()
        }
    }

    fn render(req: &Request, stats: &Stats) -> String {
        let mut buf = Vec::new();
        print(&mut buf, "127.0.0.1", "127.0.0.1:80", 1609558015, 0, stats, req)
            .expect("print");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn text_with_filter() {
        let mut stats = Stats::default();
        stats.tcp.rtt = 5;

        let out = render(&request_with("rtt"), &stats);
        assert!(out.contains("Rtt:5"));
        assert!(out.contains("Target:127.0.0.1"));
        assert!(!out.contains("Rttvar"));
    }

    #[test]
    fn text_without_filter_lists_every_field() {
        let out = render(&request_with(""), &Stats::default());
        for field in FIELDS {
            assert!(out.contains(&format!("{}:", field.name)), "{} missing", field.name);
        }
    }

    #[test]
    fn json_with_filter_is_exact() {
        let req = Request {
            json: true,
            filter: "rtt".to_string(),
            ..Default::default()
        };
        let out = render(&req, &Stats::default());
        assert_eq!(out, "{\"Rtt\":0}\n");
    }

    #[test]
    fn json_pretty_with_filter_is_exact() {
        let req = Request {
            json_pretty: true,
            filter: "rtt".to_string(),
            ..Default::default()
        };
        let out = render(&req, &Stats::default());
        assert_eq!(out, "{\n \"Rtt\": 0\n}\n");
        assert_eq!(out.len(), 14);
    }

    #[test]
    fn quiet_writes_nothing() {
        let req = Request {
            quiet: true,
            ..Default::default()
        };
        let out = render(&req, &Stats::default());
        assert!(out.is_empty());
    }

    #[test]
    fn ip_of_strips_port_and_brackets() {
        assert_eq!(ip_of("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(ip_of("[::1]:443"), "::1");
        assert_eq!(ip_of("192.168.0.1"), "192.168.0.1");
    }
}
