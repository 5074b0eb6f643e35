//! Per-target probe client.
//!
//! One `Client` owns the measurement loop for a single target: resolve,
//! dial with the configured socket options, optional TLS + HTTP GET over
//! the same socket, TCP_INFO sampling, then snapshot publication to the
//! metric adapter, the subscriber fan-out and the printer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http::uri::Uri;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::Request;
use crate::error::{Result, TcpProbeError};
use crate::output;
use crate::probe::sockopt;
use crate::probe::stats::Stats;

#[derive(Clone, Default)]
struct Meta {
    addr: String,
    timestamp: i64,
}

/// Keeps the HTTP connection (and with it the probed socket) alive while
/// TCP_INFO is sampled.
#[allow(dead_code)]
enum ConnGuard {
    Http1(hyper::client::conn::http1::SendRequest<Empty<Bytes>>),
    Http2(hyper::client::conn::http2::SendRequest<Empty<Bytes>>),
}

pub struct Client {
    target: String,
    uri: Option<Uri>,
    req: Arc<Request>,
    meta: Mutex<Meta>,
    stats: Arc<Mutex<Stats>>,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<Stats>)>>,
    next_sub_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Build a client for one target. The target is parsed as a URI best
    /// effort; anything without a host is treated as raw `host[:port]`.
    pub fn new(req: Arc<Request>, target: &str) -> Self {
        let uri = target.parse::<Uri>().ok().filter(|u| u.host().is_some());

        Self {
            target: target.to_string(),
            uri,
            req,
            meta: Mutex::new(Meta::default()),
            stats: Arc::new(Mutex::new(Stats::default())),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Shared snapshot read by the metric adapter at scrape time.
    pub fn stats_handle(&self) -> Arc<Mutex<Stats>> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> Stats {
        lock(&self.stats).clone()
    }

    fn store(&self, stats: &Stats) {
        *lock(&self.stats) = stats.clone();
    }

    fn https(&self) -> bool {
        self.uri
            .as_ref()
            .map(|u| u.scheme_str() == Some("https"))
            .unwrap_or(false)
    }

    fn default_port(&self) -> u16 {
        if self.https() {
            443
        } else {
            80
        }
    }

    fn host_port(&self) -> Result<(String, u16)> {
        if let Some(uri) = &self.uri {
            let host = uri
                .host()
                .ok_or_else(|| TcpProbeError::InvalidTarget(self.target.clone()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            return Ok((host, uri.port_u16().unwrap_or_else(|| self.default_port())));
        }

        let (host, port) = split_host_port(&self.target)?;
        Ok((host, port.unwrap_or_else(|| self.default_port())))
    }

    /// Hostname presented during the TLS handshake.
    fn server_name(&self) -> String {
        if !self.req.server_name.is_empty() {
            return self.req.server_name.clone();
        }

        match self.host_port() {
            Ok((host, _)) => host,
            Err(_) => self.target.clone(),
        }
    }

    async fn resolve(&self, stats: &mut Stats) -> Result<SocketAddr> {
        let (host, port) = self.host_port()?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let started = Instant::now();
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                stats.dns_resolve_error += 1;
                return Err(TcpProbeError::Resolve(err.to_string()));
            }
        };
        stats.dns_resolve = started.elapsed().as_micros() as i64;

        choose_addr(&addrs, self.req.ipv4, self.req.ipv6).ok_or(TcpProbeError::AddrNotAvailable)
    }

    /// Open a fresh TCP connection to the target, applying the socket
    /// options before the handshake.
    async fn connect(
        &self,
        token: &CancellationToken,
        stats: &mut Stats,
    ) -> Result<tokio::net::TcpStream> {
        lock(&self.meta).timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let addr = self.resolve(stats).await?;
        lock(&self.meta).addr = addr.to_string();

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sockopt::apply(socket.as_raw_fd(), &self.req, addr.is_ipv4())?;

        if !self.req.src_addr.is_empty() {
            match self.req.src_addr.parse::<IpAddr>() {
                Ok(ip) => socket.bind(&SocketAddr::new(ip, 0).into())?,
                Err(_) => warn!("invalid source address: {}", self.req.src_addr),
            }
        }

        socket.set_nonblocking(true)?;
        let tcp_socket = TcpSocket::from_std_stream(socket.into());

        let started = Instant::now();
        let stream = tokio::select! {
            _ = token.cancelled() => return Err(TcpProbeError::Cancelled),
            result = tokio::time::timeout(self.req.timeout, tcp_socket.connect(addr)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        stats.tcp_connect_error += 1;
                        return Err(err.into());
                    }
                    Err(_) => {
                        stats.tcp_connect_error += 1;
                        return Err(TcpProbeError::ConnectTimeout);
                    }
                }
            }
        };
        stats.tcp_connect = started.elapsed().as_micros() as i64;

        Ok(stream)
    }

    fn tls_connector(&self) -> TlsConnector {
        let config = if self.req.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        TlsConnector::from(Arc::new(config))
    }

    fn build_request(&self) -> Result<http::Request<Empty<Bytes>>> {
        let (host, port) = self.host_port()?;

        if self.req.http2 {
            // h2 carries scheme and authority in the request pseudo headers
            return http::Request::builder()
                .method(http::Method::GET)
                .uri(self.target.clone())
                .body(Empty::new())
                .map_err(|err| TcpProbeError::Http(err.to_string()));
        }

        let path = self
            .uri
            .as_ref()
            .and_then(|u| u.path_and_query())
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/")
            .to_string();

        let host_header = if port == self.default_port() {
            host
        } else {
            format!("{}:{}", host, port)
        };

        http::Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .header(http::header::HOST, host_header)
            .body(Empty::new())
            .map_err(|err| TcpProbeError::Http(err.to_string()))
    }

    /// Issue a GET over the already-opened socket, recording request and
    /// response-drain timings, status code and received bytes. The returned
    /// guard keeps the connection established until sampling is done.
    async fn http_get(
        &self,
        stream: tokio::net::TcpStream,
        stats: &mut Stats,
    ) -> Result<ConnGuard> {
        let deadline = self.req.http_timeout;
        let exchange = async {
            if self.https() {
                let connector = self.tls_connector();
                let name = ServerName::try_from(self.server_name())
                    .map_err(|err| TcpProbeError::Tls(err.to_string()))?;

                let started = Instant::now();
                let handshake = connector.connect(name, stream).await;
                stats.tls_handshake = started.elapsed().as_micros() as i64;
                let tls = handshake.map_err(|err| TcpProbeError::Tls(err.to_string()))?;

                self.exchange(TokioIo::new(tls), stats).await
            } else {
                self.exchange(TokioIo::new(stream), stats).await
            }
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TcpProbeError::Http("request timeout".to_string())),
        }
    }

    async fn exchange<T>(&self, io: TokioIo<T>, stats: &mut Stats) -> Result<ConnGuard>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let request = self.build_request()?;

        let started = Instant::now();
        let (response, guard) = if self.req.http2 {
            let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|err| TcpProbeError::Http(err.to_string()))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });
            let response = sender
                .send_request(request)
                .await
                .map_err(|err| TcpProbeError::Http(err.to_string()))?;
            (response, ConnGuard::Http2(sender))
        } else {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|err| TcpProbeError::Http(err.to_string()))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });
            let response = sender
                .send_request(request)
                .await
                .map_err(|err| TcpProbeError::Http(err.to_string()))?;
            (response, ConnGuard::Http1(sender))
        };

        if response.status().is_redirection() {
            return Err(TcpProbeError::Redirected(self.target.clone()));
        }
        stats.http_request = started.elapsed().as_micros() as i64;

        let status = response.status();
        let started = Instant::now();
        let mut body = response.into_body();
        let mut received: i64 = 0;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| TcpProbeError::Http(err.to_string()))?;
            if let Some(data) = frame.data_ref() {
                received += data.len() as i64;
            }
        }
        stats.http_response = started.elapsed().as_micros() as i64;

        stats.http_status_code = status.as_u16() as i64;
        stats.http_rcvd_bytes = received;

        Ok(guard)
    }

    /// Long-running probe loop: at most `count` iterations (0 = unbounded),
    /// the first immediately, then interval-or-cancellation between them.
    pub async fn probe(&self, token: CancellationToken, interval_override: Option<Duration>) {
        let interval = interval_override.unwrap_or(self.req.interval);
        let mut stats = Stats::default();
        let mut seq: u64 = 0;

        loop {
            if self.req.count != 0 && seq >= self.req.count {
                return;
            }

            if seq > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => return,
                }
            }

            self.iteration(&token, &mut stats, seq).await;
            seq += 1;
        }
    }

    async fn iteration(&self, token: &CancellationToken, stats: &mut Stats, seq: u64) {
        let stream = match self.connect(token, stats).await {
            Ok(stream) => stream,
            Err(err) => {
                if !token.is_cancelled() {
                    warn!("{}: {}", self.target, err);
                }
                // connect failures still refresh the snapshot so the error
                // counters are scrapeable
                self.store(stats);
                return;
            }
        };

        let sample_fd = match sockopt::dup(stream.as_raw_fd()) {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!("{}: dup: {}", self.target, err);
                None
            }
        };

        // the HTTP layer consumes the stream; either way the connection
        // stays open until sampling is done
        let mut _http_conn = None;
        let _raw = if self.target.starts_with("http") {
            match self.http_get(stream, stats).await {
                Ok(guard) => _http_conn = Some(guard),
                Err(err) => warn!("{}: {}", self.target, err),
            }
            None
        } else {
            Some(stream)
        };

        if let Some(fd) = &sample_fd {
            match sockopt::tcp_info(fd.as_raw_fd()) {
                Ok(info) => stats.tcp = info,
                Err(err) => warn!("{}: {}", self.target, err),
            }
            match sockopt::congestion_alg(fd.as_raw_fd()) {
                Ok(alg) => stats.congestion_alg = alg,
                Err(err) => warn!("{}: {}", self.target, err),
            }
        }

        self.store(stats);

        if self.req.grpc {
            self.publish();
        }

        self.print(seq);
        // stream and sample fd drop here, closing the socket
    }

    fn print(&self, seq: u64) {
        let meta = lock(&self.meta).clone();
        let stats = self.snapshot();
        let mut stdout = io::stdout().lock();
        if let Err(err) = output::print(
            &mut stdout,
            &self.target,
            &meta.addr,
            meta.timestamp,
            seq,
            &stats,
            &self.req,
        ) {
            warn!("print: {}", err);
        }
    }

    /// Register a subscriber channel; the returned id is the handle for
    /// `unsubscribe`.
    pub fn subscribe(&self, tx: mpsc::Sender<Stats>) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, tx));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).retain(|(sub_id, _)| *sub_id != id);
    }

    /// Non-blocking fan-out of the current snapshot; slow receivers miss
    /// samples.
    pub fn publish(&self) {
        let stats = self.snapshot();
        for (_, tx) in lock(&self.subscribers).iter() {
            let _ = tx.try_send(stats.clone());
        }
    }

    /// Drop every subscriber sender so receivers observe end-of-stream.
    pub fn close_subscribers(&self) {
        lock(&self.subscribers).clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Go-style address family selection over the resolved set.
fn choose_addr(addrs: &[SocketAddr], ipv4_only: bool, ipv6: bool) -> Option<SocketAddr> {
    for addr in addrs {
        if !ipv6 {
            if addr.is_ipv4() {
                return Some(*addr);
            }
            if ipv4_only {
                continue;
            }
        }
        if addr.is_ipv6() {
            return Some(*addr);
        }
    }
    None
}

/// Split a raw `host[:port]` / `[v6][:port]` target. Bare IPv6 without
/// brackets (more than one colon) is rejected.
fn split_host_port(target: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| TcpProbeError::InvalidTarget(target.to_string()))?;
        if tail.is_empty() {
            return Ok((host.to_string(), None));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| TcpProbeError::InvalidTarget(target.to_string()))?;
        return Ok((host.to_string(), Some(port)));
    }

    match target.matches(':').count() {
        0 => Ok((target.to_string(), None)),
        1 => {
            let (host, port) = target
                .split_once(':')
                .ok_or_else(|| TcpProbeError::InvalidTarget(target.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| TcpProbeError::InvalidTarget(target.to_string()))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Err(TcpProbeError::InvalidTarget(target.to_string())),
    }
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn client_for(target: &str) -> Client {
        Client::new(Arc::new(Request::default()), target)
    }

    #[test]
    fn url_targets_get_scheme_default_ports() {
        let (host, port) = client_for("https://www.google.com").host_port().expect("ok");
        assert_eq!(host, "www.google.com");
        assert_eq!(port, 443);

        let (host, port) = client_for("http://example.com/health").host_port().expect("ok");
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);

        let (_, port) = client_for("https://example.com:8443").host_port().expect("ok");
        assert_eq!(port, 8443);
    }

    #[test]
    fn raw_targets_split_host_and_port() {
        let (host, port) = client_for("smtp.gmail.com:587").host_port().expect("ok");
        assert_eq!(host, "smtp.gmail.com");
        assert_eq!(port, 587);

        // no port falls back to 80
        let (host, port) = client_for("example.com").host_port().expect("ok");
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);

        let (host, port) = client_for("[::1]:5050").host_port().expect("ok");
        assert_eq!(host, "::1");
        assert_eq!(port, 5050);

        assert!(client_for(":::").host_port().is_err());
    }

    #[test]
    fn server_name_prefers_request_override() {
        let req = Request {
            server_name: "myserver".to_string(),
            ..Default::default()
        };
        let client = Client::new(Arc::new(req), "target");
        assert_eq!(client.server_name(), "myserver");

        let client = client_for("target");
        assert_eq!(client.server_name(), "target");

        let client = client_for("https://www.example.com:8443");
        assert_eq!(client.server_name(), "www.example.com");
    }

    #[test]
    fn address_family_selection() {
        let v4: SocketAddr = (Ipv4Addr::new(192, 0, 2, 1), 80).into();
        let v6: SocketAddr = (Ipv6Addr::LOCALHOST, 80).into();

        assert_eq!(choose_addr(&[v6, v4], false, false), Some(v6));
        assert_eq!(choose_addr(&[v4, v6], false, false), Some(v4));
        assert_eq!(choose_addr(&[v6, v4], true, false), Some(v4));
        assert_eq!(choose_addr(&[v6], true, false), None);
        assert_eq!(choose_addr(&[v4, v6], false, true), Some(v6));
        assert_eq!(choose_addr(&[v4], false, true), None);
        assert_eq!(choose_addr(&[], false, false), None);
    }

    #[tokio::test]
    async fn subscribe_publish_unsubscribe() {
        let client = client_for("127.0.0.1:9");

        let (tx, mut rx) = mpsc::channel(1);
        let id = client.subscribe(tx);
        assert_eq!(client.subscriber_count(), 1);

        let mut stats = Stats::default();
        stats.tcp.rcv_mss = 1460;
        client.store(&stats);
        client.publish();

        let sample = rx.try_recv().expect("sample");
        assert_eq!(sample.tcp.rcv_mss, 1460);

        // a full channel drops the sample instead of blocking
        client.publish();
        client.publish();

        client.unsubscribe(id);
        assert_eq!(client.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_subscribers_end_the_stream() {
        let client = client_for("127.0.0.1:9");
        let (tx, mut rx) = mpsc::channel(1);
        client.subscribe(tx);

        client.close_subscribers();
        assert_eq!(client.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_error_counts() {
        let req = Request {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let client = Client::new(Arc::new(req), "127.0.0.0");
        let token = CancellationToken::new();
        let mut stats = Stats::default();

        assert!(client.connect(&token, &mut stats).await.is_err());
        assert_eq!(stats.tcp_connect_error, 1);
        assert_eq!(stats.dns_resolve_error, 0);
    }

    #[tokio::test]
    async fn resolve_error_counts() {
        let req = Request {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let client = Client::new(Arc::new(req), "tcpprobeunknowndomain.invalid");
        let token = CancellationToken::new();
        let mut stats = Stats::default();

        assert!(client.connect(&token, &mut stats).await.is_err());
        assert_eq!(stats.dns_resolve_error, 1);
    }
}
