//! Command-line surface and the immutable per-process `Request` bundle.

use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::probe::stats::FIELDS;

#[derive(Parser)]
#[command(name = "tcpprobe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "TCP/HTTP probe engine exposing kernel socket statistics", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(after_help = "examples:
   tcpprobe --json -c 0 https://www.google.com
   tcpprobe --filter \"Rtt;TCPConnect\" https://www.yahoo.com
   tcpprobe smtp.gmail.com:587")]
pub struct Cli {
    #[arg(short = '6', long, help = "connect only to IPv6 address")]
    pub ipv6: bool,

    #[arg(short = '4', long, help = "connect only to IPv4 address")]
    pub ipv4: bool,

    #[arg(short, long, default_value_t = 0, help = "stop after sending count requests [0 is unlimited]")]
    pub count: u64,

    #[arg(long, help = "force to use HTTP version 2")]
    pub http2: bool,

    #[arg(long, help = "disable prometheus")]
    pub prom_disabled: bool,

    #[arg(long, help = "don't validate the server's certificate")]
    pub insecure: bool,

    #[arg(short = 'n', long, help = "server name is used to verify the hostname (TLS)")]
    pub server_name: Option<String>,

    #[arg(short = 'S', long, help = "source address in outgoing request")]
    pub source_addr: Option<String>,

    #[arg(short = 'p', long, default_value = ":8081", help = "specify prometheus exporter IP and port")]
    pub prom_addr: String,

    #[arg(short, long, help = "given metric(s) with semicolon delimited")]
    pub filter: Option<String>,

    #[arg(short, long, default_value = "5s", value_parser = humantime::parse_duration, help = "specify a timeout for dialing to targets")]
    pub timeout: Duration,

    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration, help = "specify a timeout for HTTP")]
    pub http_timeout: Duration,

    #[arg(short, long, default_value = "1s", value_parser = humantime::parse_duration, help = "time to wait after each request")]
    pub interval: Duration,

    #[arg(short = 'z', long, default_value_t = 0, help = "set the IP type of service or traffic class")]
    pub tos: i32,

    #[arg(short = 'm', long, default_value_t = 0, help = "set the IP time to live or hop limit")]
    pub ttl: i32,

    #[arg(short = 'r', long, default_value_t = 0, help = "set queuing discipline")]
    pub socket_priority: i32,

    #[arg(short = 'M', long, default_value_t = 0, help = "TCP maximum segment size")]
    pub mss: i32,

    #[arg(long, help = "TCP congestion control algorithm")]
    pub congestion_alg: Option<String>,

    #[arg(long, default_value_t = 0, help = "maximum socket send buffer in bytes")]
    pub send_buffer: i32,

    #[arg(long, default_value_t = 0, help = "maximum socket receive buffer in bytes")]
    pub rcvd_buffer: i32,

    #[arg(short = 'o', long, help = "disable Nagle's algorithm")]
    pub tcp_nodelay_disabled: bool,

    #[arg(short = 'k', long, help = "disable quickack mode")]
    pub tcp_quickack_disabled: bool,

    #[arg(long, help = "enable k8s")]
    pub k8s: bool,

    #[arg(long, default_value = "default", help = "kubernetes namespace")]
    pub namespace: String,

    #[arg(short, long, help = "turn off tcpprobe output")]
    pub quiet: bool,

    #[arg(long, help = "print in json format")]
    pub json: bool,

    #[arg(long, help = "pretty print in json format")]
    pub json_pretty: bool,

    #[arg(long, help = "enable grpc")]
    pub grpc: bool,

    #[arg(short = 'g', long, default_value = ":8082", help = "specify grpc server IP and port")]
    pub grpc_addr: String,

    #[arg(long, help = "show metrics descriptions")]
    pub metrics: bool,

    #[arg(long, help = "yaml config file")]
    pub config: Option<String>,

    #[arg(long, help = "check for update")]
    pub check_update: bool,

    #[arg(help = "target(s) to probe")]
    pub targets: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "add target through grpc")]
    Add(CmdArgs),
    #[command(about = "delete target through grpc")]
    Del(CmdArgs),
}

#[derive(clap::Args)]
pub struct CmdArgs {
    #[arg(short, long, default_value = "5s", help = "time to wait after each request")]
    pub interval: String,

    #[arg(short = 'd', long, default_value = "localhost:8082", help = "tcpprobe grpc server address")]
    pub addr: String,

    #[arg(short, long, help = "set labels")]
    pub labels: Option<String>,

    #[arg(long, default_value_t = true, help = "don't validate the server's certificate")]
    pub insecure: bool,

    #[arg(required = true, help = "target(s)")]
    pub targets: Vec<String>,
}

/// Immutable probe parameters shared by every control plane.
#[derive(Debug, Clone)]
pub struct Request {
    pub count: u64,
    pub ipv4: bool,
    pub ipv6: bool,
    pub http2: bool,
    pub k8s: bool,
    pub json: bool,
    pub json_pretty: bool,
    pub grpc: bool,
    pub quiet: bool,
    pub insecure: bool,
    pub prom_disabled: bool,
    pub grpc_addr: String,
    pub namespace: String,
    pub prom_addr: String,
    pub server_name: String,
    pub src_addr: String,
    pub filter: String,
    pub config: String,

    pub so_tos: i32,
    pub so_ttl: i32,
    pub so_priority: i32,
    pub so_maxseg: i32,
    pub so_sndbuf: i32,
    pub so_rcvbuf: i32,
    pub so_congestion: String,
    pub tcp_nodelay_disabled: bool,
    pub tcp_quickack_disabled: bool,

    pub timeout: Duration,
    pub http_timeout: Duration,
    pub interval: Duration,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            count: 0,
            ipv4: false,
            ipv6: false,
            http2: false,
            k8s: false,
            json: false,
            json_pretty: false,
            grpc: false,
            quiet: false,
            insecure: false,
            prom_disabled: false,
            grpc_addr: ":8082".to_string(),
            namespace: "default".to_string(),
            prom_addr: ":8081".to_string(),
            server_name: String::new(),
            src_addr: String::new(),
            filter: String::new(),
            config: String::new(),
            so_tos: 0,
            so_ttl: 0,
            so_priority: 0,
            so_maxseg: 0,
            so_sndbuf: 0,
            so_rcvbuf: 0,
            so_congestion: String::new(),
            tcp_nodelay_disabled: false,
            tcp_quickack_disabled: false,
            timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(30),
            interval: Duration::from_secs(1),
        }
    }
}

impl Cli {
    pub fn to_request(&self) -> Request {
        Request {
            count: self.count,
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            http2: self.http2,
            k8s: self.k8s,
            json: self.json,
            json_pretty: self.json_pretty,
            grpc: self.grpc,
            quiet: self.quiet,
            insecure: self.insecure,
            prom_disabled: self.prom_disabled,
            grpc_addr: self.grpc_addr.clone(),
            namespace: self.namespace.clone(),
            prom_addr: self.prom_addr.clone(),
            server_name: self.server_name.clone().unwrap_or_default(),
            src_addr: self.source_addr.clone().unwrap_or_default(),
            filter: self.filter.clone().unwrap_or_default(),
            config: self.config.clone().unwrap_or_default(),
            so_tos: self.tos,
            so_ttl: self.ttl,
            so_priority: self.socket_priority,
            so_maxseg: self.mss,
            so_sndbuf: self.send_buffer,
            so_rcvbuf: self.rcvd_buffer,
            so_congestion: self.congestion_alg.clone().unwrap_or_default(),
            tcp_nodelay_disabled: self.tcp_nodelay_disabled,
            tcp_quickack_disabled: self.tcp_quickack_disabled,
            timeout: self.timeout,
            http_timeout: self.http_timeout,
            interval: self.interval,
        }
    }
}

/// Parse a listen address from the flag surface, accepting the `:port`
/// shorthand for all interfaces.
pub fn listen_addr(addr: &str) -> crate::Result<std::net::SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| crate::TcpProbeError::Config(format!("invalid listen address: {}", addr)))
}

/// Print every exported field with its help text (`--metrics`).
pub fn print_metrics<W: Write>(w: &mut W) -> std::io::Result<()> {
    writeln!(w, "metrics:")?;
    for field in FIELDS {
        writeln!(w, "{} {}", field.name, field.help)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_target() {
        let cli = Cli::try_parse_from(["tcpprobe", "127.0.0.1"]).expect("parse");
        assert_eq!(cli.targets, vec!["127.0.0.1"]);
        assert!(cli.command.is_none());

        let req = cli.to_request();
        assert_eq!(req.timeout, Duration::from_secs(5));
        assert_eq!(req.http_timeout, Duration::from_secs(30));
        assert_eq!(req.interval, Duration::from_secs(1));
        assert_eq!(req.prom_addr, ":8081");
    }

    #[test]
    fn parses_add_subcommand() {
        let cli = Cli::try_parse_from(["tcpprobe", "add", "127.0.0.2:8080"]).expect("parse");
        match cli.command {
            Some(Commands::Add(args)) => {
                assert_eq!(args.targets, vec!["127.0.0.2:8080"]);
                assert_eq!(args.interval, "5s");
                assert_eq!(args.addr, "localhost:8082");
                assert!(args.insecure);
            }
            _ => panic!("expected add subcommand"),
        }
    }

    #[test]
    fn add_without_target_fails() {
        assert!(Cli::try_parse_from(["tcpprobe", "add"]).is_err());
        assert!(Cli::try_parse_from(["tcpprobe", "del"]).is_err());
    }

    #[test]
    fn duration_flags_parse() {
        let cli = Cli::try_parse_from(["tcpprobe", "-t", "2s", "-i", "300ms", "x:80"])
            .expect("parse");
        let req = cli.to_request();
        assert_eq!(req.timeout, Duration::from_secs(2));
        assert_eq!(req.interval, Duration::from_millis(300));
    }

    #[test]
    fn metrics_listing_has_all_fields() {
        let mut buf = Vec::new();
        print_metrics(&mut buf).expect("print");
        let out = String::from_utf8(buf).expect("utf8");
        assert!(out.starts_with("metrics:"));
        assert!(out.contains("Rtt smoothed round trip time"));
        assert!(out.contains("DNSResolveError"));
    }
}
