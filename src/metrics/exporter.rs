//! Prometheus exposition endpoint.
//!
//! Serves the shared registry in text format on `/metrics`; everything
//! else is 404. The accept loop runs until the root token is cancelled.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli;
use crate::error::Result;

async fn handle(req: Request<hyper::body::Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        let mut resp = Response::new(Full::new(Bytes::from("Not Found")));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }

    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        warn!("metrics encode: {}", err);
        let mut resp = Response::new(Full::new(Bytes::from("Internal Server Error")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(resp);
    }

    let resp = Response::builder()
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buf)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
    Ok(resp)
}

/// Serve `/metrics` on the configured address until cancellation.
pub async fn serve(addr: &str, token: CancellationToken) -> Result<()> {
    let addr = cli::listen_addr(addr)?;
    let listener = TcpListener::bind(addr).await?;

    info!("prometheus exporter listening on {}", addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("metrics accept: {}", err);
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder
                        .serve_connection(TokioIo::new(stream), service_fn(handle))
                        .await
                    {
                        warn!(?peer, "metrics serve_connection: {}", err);
                    }
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{register, StatsCollector};
    use crate::probe::stats::Stats;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn scrape_over_http() {
        let stats = Arc::new(Mutex::new(Stats::default()));
        stats.lock().expect("lock").tcp.snd_cwnd = 10;
        let collector = StatsCollector::new("exporter-test:1", None, stats);
        register(&collector);

        // bind on an ephemeral port, then point the exporter at it
        let probe_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = probe_listener.local_addr().expect("addr");
        drop(probe_listener);

        let token = CancellationToken::new();
        let server_token = token.clone();
        let addr_str = addr.to_string();
        tokio::spawn(async move {
            let _ = serve(&addr_str, server_token).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut body = String::new();
        stream.read_to_string(&mut body).await.expect("read");

        assert!(body.contains("200 OK"));
        assert!(body.contains("tp_tcpinfo_snd_cwnd"));
        assert!(body.contains("exporter-test:1"));

        token.cancel();
    }

    #[test]
    fn listen_addr_shorthand() {
        assert_eq!(
            cli::listen_addr(":8081").expect("parse").to_string(),
            "0.0.0.0:8081"
        );
        assert!(cli::listen_addr("not an addr").is_err());
    }
}
