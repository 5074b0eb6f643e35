//! Probe sample record and its field descriptor table
//!
//! `TcpInfo` mirrors the kernel's `struct tcp_info` byte-for-byte up to
//! `tcpi_snd_wnd`, so the TCP_INFO getsockopt can write straight into it.
//! `FIELDS` is the single source of truth for everything that walks the
//! record: metric registration, RPC encoding, the printers and the
//! `--metrics` listing.

use std::fmt;

/// Kernel per-socket TCP statistics vector.
///
/// Field order and widths must match `struct tcp_info`
/// (include/uapi/linux/tcp.h). Fields past kernel support stay zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    // wscale and app-limited bitfields, kept for layout only
    pad: [u8; 2],
    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
    pub pacing_rate: u64,
    // kernel reports it, nothing downstream consumes it
    max_pacing_rate: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub segs_out: u32,
    pub segs_in: u32,
    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,
    pub delivery_rate: u64,
    pub busy_time: u64,
    pub rwnd_limited: u64,
    pub sndbuf_limited: u64,
    pub delivered: u32,
    pub delivered_ce: u32,
    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub dsack_dups: u32,
    pub reord_seen: u32,
    pub rcv_ooopack: u32,
    pub snd_wnd: u32,
}

pub const TCP_INFO_SIZE: usize = std::mem::size_of::<TcpInfo>();

const _: () = {
    assert!(
        TCP_INFO_SIZE == 232,
        "TcpInfo must match the kernel tcp_info layout"
    );
    assert!(std::mem::align_of::<TcpInfo>() == 8);
};

/// One probe sample: the kernel vector plus application-layer timings
/// (microseconds) and cumulative error counters.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub tcp: TcpInfo,
    pub congestion_alg: String,
    pub http_status_code: i64,
    pub http_rcvd_bytes: i64,
    pub http_request: i64,
    pub http_response: i64,
    pub dns_resolve: i64,
    pub tcp_connect: i64,
    pub tls_handshake: i64,
    pub tcp_connect_error: i64,
    pub dns_resolve_error: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Gauge,
    Counter,
}

/// Value of a single stats field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue<'a> {
    Uint(u64),
    Int(i64),
    Text(&'a str),
}

impl FieldValue<'_> {
    /// Numeric reading for the metrics backend; text fields have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Uint(v) => Some(*v as f64),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Uint(v) => serde_json::Value::from(*v),
            FieldValue::Int(v) => serde_json::Value::from(*v),
            FieldValue::Text(v) => serde_json::Value::from(*v),
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Schema entry for one exported stats field.
pub struct FieldDesc {
    /// Record field name, used as the text/JSON/RPC key.
    pub name: &'static str,
    /// Exposed metric name (without the `tp_` prefix).
    pub metric: &'static str,
    pub help: &'static str,
    pub kind: FieldKind,
    pub get: for<'a> fn(&'a Stats) -> FieldValue<'a>,
}

impl FieldDesc {
    /// Whether the field carries a number the metrics backend can expose.
    pub fn is_numeric(&self) -> bool {
        !matches!((self.get)(&Stats::default()), FieldValue::Text(_))
    }
}

macro_rules! tcp_gauge {
    ($name:literal, $metric:literal, $help:literal, $field:ident) => {
        FieldDesc {
            name: $name,
            metric: $metric,
            help: $help,
            kind: FieldKind::Gauge,
            get: |s| FieldValue::Uint(s.tcp.$field as u64),
        }
    };
}

macro_rules! app_field {
    ($name:literal, $metric:literal, $help:literal, $kind:expr, $field:ident) => {
        FieldDesc {
            name: $name,
            metric: $metric,
            help: $help,
            kind: $kind,
            get: |s| FieldValue::Int(s.$field),
        }
    };
}

/// Exported fields in declaration order. Padding bytes and the kernel's
/// max pacing rate are deliberately absent.
pub static FIELDS: &[FieldDesc] = &[
    tcp_gauge!("State", "tcpinfo_state", "TCP state", state),
    tcp_gauge!("CaState", "tcpinfo_ca_state", "state of congestion avoidance", ca_state),
    tcp_gauge!("Retransmits", "tcpinfo_retransmits", "number of retranmissions on timeout invoked", retransmits),
    tcp_gauge!("Probes", "tcpinfo_probes", "consecutive zero window probes that have gone unanswered", probes),
    tcp_gauge!("Backoff", "tcpinfo_backoff", "used for exponential backoff re-transmission", backoff),
    tcp_gauge!("Options", "tcpinfo_options", "number of requesting options", options),
    tcp_gauge!("Rto", "tcpinfo_rto", "tcp re-transmission timeout value, the unit is microsecond", rto),
    tcp_gauge!("Ato", "tcpinfo_ato", "ack timeout, unit is microsecond", ato),
    tcp_gauge!("SndMss", "tcpinfo_snd_mss", "current maximum segment size", snd_mss),
    tcp_gauge!("RcvMss", "tcpinfo_rcv_mss", "maximum observed segment size from the remote host", rcv_mss),
    tcp_gauge!("Unacked", "tcpinfo_unacked", "number of unack'd segments", unacked),
    tcp_gauge!("Sacked", "tcpinfo_sacked", "scoreboard segment marked SACKED by sack blocks accounting for the pipe algorithm", sacked),
    tcp_gauge!("Lost", "tcpinfo_lost", "scoreboard segments marked lost by loss detection heuristics accounting for the pipe algorithm", lost),
    tcp_gauge!("Retrans", "tcpinfo_retrans", "how many times the retran occurs", retrans),
    tcp_gauge!("Fackets", "tcpinfo_fackets", "forward acknowledgement segments", fackets),
    tcp_gauge!("LastDataSent", "tcpinfo_last_data_sent", "time since last data segment was sent", last_data_sent),
    tcp_gauge!("LastAckSent", "tcpinfo_last_ack_sent", "how long time since the last ack sent", last_ack_sent),
    tcp_gauge!("LastDataRecv", "tcpinfo_last_data_recv", "time since last data segment was received", last_data_recv),
    tcp_gauge!("LastAckRecv", "tcpinfo_last_ack_recv", "how long time since the last ack received", last_ack_recv),
    tcp_gauge!("Pmtu", "tcpinfo_path_mtu", "path MTU", pmtu),
    tcp_gauge!("RcvSsthresh", "tcpinfo_rev_ss_thresh", "tcp congestion window slow start threshold", rcv_ssthresh),
    tcp_gauge!("Rtt", "tcpinfo_rtt", "smoothed round trip time", rtt),
    tcp_gauge!("Rttvar", "tcpinfo_rtt_var", "RTT variance", rttvar),
    tcp_gauge!("SndSsthresh", "tcpinfo_snd_ss_thresh", "slow start threshold", snd_ssthresh),
    tcp_gauge!("SndCwnd", "tcpinfo_snd_cwnd", "congestion window size", snd_cwnd),
    tcp_gauge!("Advmss", "tcpinfo_adv_mss", "advertised maximum segment size", advmss),
    tcp_gauge!("Reordering", "tcpinfo_reordering", "number of reordered segments allowed", reordering),
    tcp_gauge!("RcvRtt", "tcpinfo_rcv_rtt", "receiver side RTT estimate", rcv_rtt),
    tcp_gauge!("RcvSpace", "tcpinfo_rcv_space", "space reserved for the receive queue", rcv_space),
    tcp_gauge!("TotalRetrans", "tcpinfo_total_retrans", "total number of segments containing retransmitted data", total_retrans),
    tcp_gauge!("PacingRate", "tcpinfo_pacing_rate", "the pacing rate", pacing_rate),
    tcp_gauge!("BytesAcked", "tcpinfo_bytes_acked", "bytes acked", bytes_acked),
    tcp_gauge!("BytesReceived", "tcpinfo_bytes_received", "bytes received", bytes_received),
    tcp_gauge!("SegsOut", "tcpinfo_segs_out", "segments sent out", segs_out),
    tcp_gauge!("SegsIn", "tcpinfo_segs_in", "segments received", segs_in),
    tcp_gauge!("NotsentBytes", "tcpinfo_notsent_bytes", "bytes not yet sent", notsent_bytes),
    tcp_gauge!("MinRtt", "tcpinfo_min_rtt", "minimum observed round trip time", min_rtt),
    tcp_gauge!("DataSegsIn", "tcpinfo_data_segs_in", "RFC4898 tcpEStatsDataSegsIn", data_segs_in),
    tcp_gauge!("DataSegsOut", "tcpinfo_data_segs_out", "RFC4898 tcpEStatsDataSegsOut", data_segs_out),
    tcp_gauge!("DeliveryRate", "tcpinfo_delivery_rate", "most recent goodput estimate", delivery_rate),
    tcp_gauge!("BusyTime", "tcpinfo_busy_time", "time (usec) busy sending data", busy_time),
    tcp_gauge!("RwndLimited", "tcpinfo_rwnd_limited", "time (usec) limited by receive window", rwnd_limited),
    tcp_gauge!("SndbufLimited", "tcpinfo_sndbuf_limited", "time (usec) limited by send buffer", sndbuf_limited),
    tcp_gauge!("Delivered", "tcpinfo_delivered", "segments delivered to the receiver", delivered),
    tcp_gauge!("DeliveredCe", "tcpinfo_delivered_ce", "delivered segments with CE marks", delivered_ce),
    tcp_gauge!("BytesSent", "tcpinfo_bytes_sent", "RFC4898 tcpEStatsPerfHCDataOctetsOut", bytes_sent),
    tcp_gauge!("BytesRetrans", "tcpinfo_bytes_retrans", "RFC4898 tcpEStatsPerfOctetsRetrans", bytes_retrans),
    tcp_gauge!("DsackDups", "tcpinfo_dsack_dups", "RFC4898 tcpEStatsStackDSACKDups", dsack_dups),
    tcp_gauge!("ReordSeen", "tcpinfo_reord_seen", "reordering events seen", reord_seen),
    tcp_gauge!("RcvOoopack", "tcpinfo_rcv_ooopack", "out-of-order packets received", rcv_ooopack),
    tcp_gauge!("SndWnd", "tcpinfo_snd_wnd", "peer advertised receive window", snd_wnd),
    FieldDesc {
        name: "TCPCongesAlg",
        metric: "",
        help: "TCP network congestion-avoidance algorithm",
        kind: FieldKind::Gauge,
        get: |s| FieldValue::Text(&s.congestion_alg),
    },
    app_field!("HTTPStatusCode", "http_status_code", "HTTP 1xx-5xx status code", FieldKind::Gauge, http_status_code),
    app_field!("HTTPRcvdBytes", "http_rcvd_bytes", "HTTP bytes received", FieldKind::Gauge, http_rcvd_bytes),
    app_field!("HTTPRequest", "http_request", "HTTP request, the unit is microsecond", FieldKind::Gauge, http_request),
    app_field!("HTTPResponse", "http_response", "HTTP response, the unit is microsecond", FieldKind::Gauge, http_response),
    app_field!("DNSResolve", "dns_resolve", "domain lookup, the unit is microsecond", FieldKind::Gauge, dns_resolve),
    app_field!("TCPConnect", "tcp_connect", "TCP connect, the unit is microsecond", FieldKind::Gauge, tcp_connect),
    app_field!("TLSHandshake", "tls_handshake", "TLS handshake, the unit is microsecond", FieldKind::Gauge, tls_handshake),
    app_field!("TCPConnectError", "tcp_connect_error", "total TCP connect error", FieldKind::Counter, tcp_connect_error),
    app_field!("DNSResolveError", "dns_resolve_error", "total DNS resolve error", FieldKind::Counter, dns_resolve_error),
];
