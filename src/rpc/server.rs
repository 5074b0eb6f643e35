//! gRPC control plane: add, delete and stream targets at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use prost_types::value::Kind;
use prost_types::Value;
use tcpprobe_proto::{Response as PbResponse, Stats as PbStats, Target, TcpProbe, TcpProbeServer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::cli::{self, Request as ProbeRequest};
use crate::error::Result;
use crate::probe::stats::{FieldValue, Stats, FIELDS};
use crate::supervisor::{CleanupGuard, Overrides, Supervisor};

pub struct ProbeService {
    tp: Arc<Supervisor>,
    req: Arc<ProbeRequest>,
    root: CancellationToken,
}

impl ProbeService {
    pub fn new(tp: Arc<Supervisor>, req: Arc<ProbeRequest>, root: CancellationToken) -> Self {
        Self { tp, req, root }
    }
}

#[tonic::async_trait]
impl TcpProbe for ProbeService {
    async fn add(
        &self,
        request: Request<Target>,
    ) -> std::result::Result<Response<PbResponse>, Status> {
        let target = request.into_inner();

        if self.tp.exists(&target.addr) {
            return Ok(Response::new(PbResponse {
                message: "the target already exist".to_string(),
                code: 400,
            }));
        }

        let tp = Arc::clone(&self.tp);
        let req = Arc::clone(&self.req);
        let root = self.root.clone();
        tokio::spawn(async move {
            let overrides = Overrides {
                interval: Some(target.interval.clone()),
                labels: serde_json::to_string(&target.labels).ok(),
            };
            let _cleanup = CleanupGuard::new(Arc::clone(&tp), target.addr.as_str());
            tp.start(&root, &target.addr, req, overrides).await;
        });

        Ok(Response::new(PbResponse {
            message: "target has been added".to_string(),
            code: 200,
        }))
    }

    async fn delete(
        &self,
        request: Request<Target>,
    ) -> std::result::Result<Response<PbResponse>, Status> {
        let target = request.into_inner();

        if !self.tp.exists(&target.addr) {
            return Ok(Response::new(PbResponse {
                message: "target is not exist".to_string(),
                code: 404,
            }));
        }

        self.tp.stop(&target.addr);

        Ok(Response::new(PbResponse {
            message: "target has been deleted".to_string(),
            code: 200,
        }))
    }

    type GetStream = ReceiverStream<std::result::Result<PbStats, Status>>;

    async fn get(
        &self,
        request: Request<Target>,
    ) -> std::result::Result<Response<Self::GetStream>, Status> {
        let target = request.into_inner();

        let client = self
            .tp
            .client(&target.addr)
            .ok_or_else(|| Status::not_found(format!("target: {} not exist", target.addr)))?;

        let (sub_tx, mut sub_rx) = mpsc::channel::<Stats>(1);
        let id = client.subscribe(sub_tx);

        let (out_tx, out_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // ends when cleanup drops the sender or the peer goes away
            while let Some(stats) = sub_rx.recv().await {
                let message = PbStats {
                    metrics: stats_to_metrics(&stats),
                };
                if out_tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            client.unsubscribe(id);
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

/// Encode a sample into the schema map, keyed by field name. Numbers go
/// out as doubles, the congestion algorithm as a string; unexported fields
/// are not in the table and therefore absent.
pub fn stats_to_metrics(stats: &Stats) -> HashMap<String, Value> {
    FIELDS
        .iter()
        .map(|field| {
            let kind = match (field.get)(stats) {
                FieldValue::Uint(v) => Kind::NumberValue(v as f64),
                FieldValue::Int(v) => Kind::NumberValue(v as f64),
                FieldValue::Text(v) => Kind::StringValue(v.to_string()),
            };
            (field.name.to_string(), Value { kind: Some(kind) })
        })
        .collect()
}

/// Bind the gRPC listener and serve in the background until cancellation.
pub async fn serve(
    tp: Arc<Supervisor>,
    req: Arc<ProbeRequest>,
    root: CancellationToken,
) -> Result<()> {
    let addr = cli::listen_addr(&req.grpc_addr)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("grpc server listening on {}", addr);

    let service = ProbeService::new(tp, req, root.clone());
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(TcpProbeServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), root.cancelled())
            .await;
        if let Err(err) = result {
            error!("grpc server: {}", err);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CmdArgs;
    use crate::rpc::client;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn quiet_request(grpc_addr: &str) -> Arc<ProbeRequest> {
        Arc::new(ProbeRequest {
            grpc: true,
            grpc_addr: grpc_addr.to_string(),
            quiet: true,
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(50),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn add_and_delete_over_the_wire() {
        let tp = Supervisor::new();
        let root = CancellationToken::new();
        let addr = "127.0.0.1:8085";

        serve(Arc::clone(&tp), quiet_request(addr), root.clone())
            .await
            .expect("serve");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let add = CmdArgs {
            interval: "5s".to_string(),
            addr: addr.to_string(),
            labels: None,
            insecure: true,
            targets: vec![addr.to_string()],
        };
        client::run(&add, false).await.expect("add");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(tp.exists(addr));

        let del = CmdArgs {
            interval: "5s".to_string(),
            addr: addr.to_string(),
            labels: None,
            insecure: true,
            targets: vec![addr.to_string()],
        };
        client::run(&del, true).await.expect("del");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!tp.exists(addr));

        root.cancel();
    }

    #[tokio::test]
    async fn add_rejects_duplicates_with_400() {
        let tp = Supervisor::new();
        let root = CancellationToken::new();
        let service = ProbeService::new(
            Arc::clone(&tp),
            quiet_request("127.0.0.1:18085"),
            root.clone(),
        );

        let target = Target {
            addr: "127.0.0.1:19".to_string(),
            interval: String::new(),
            labels: HashMap::new(),
        };

        let first = service
            .add(Request::new(target.clone()))
            .await
            .expect("add")
            .into_inner();
        assert_eq!(first.code, 200);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = service
            .add(Request::new(target.clone()))
            .await
            .expect("add")
            .into_inner();
        assert_eq!(second.code, 400);
        assert_eq!(second.message, "the target already exist");

        let missing = service
            .delete(Request::new(Target {
                addr: "nowhere:1".to_string(),
                ..Default::default()
            }))
            .await
            .expect("delete")
            .into_inner();
        assert_eq!(missing.code, 404);

        let deleted = service
            .delete(Request::new(target))
            .await
            .expect("delete")
            .into_inner();
        assert_eq!(deleted.code, 200);
        root.cancel();
    }

    #[tokio::test]
    async fn get_streams_samples_until_cleanup() {
        let tp = Supervisor::new();
        let root = CancellationToken::new();
        let service = ProbeService::new(
            Arc::clone(&tp),
            quiet_request("127.0.0.1:18086"),
            root.clone(),
        );

        let unknown = service
            .get(Request::new(Target {
                addr: "nope:1".to_string(),
                ..Default::default()
            }))
            .await;
        assert!(unknown.is_err());

        // a live listener so iterations get past connect and publish
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let local = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let target = Target {
            addr: local.to_string(),
            ..Default::default()
        };
        let added = service
            .add(Request::new(target.clone()))
            .await
            .expect("add")
            .into_inner();
        assert_eq!(added.code, 200);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = service
            .get(Request::new(target.clone()))
            .await
            .expect("get")
            .into_inner();

        // the probe loop publishes on every iteration in grpc mode
        let sample = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream alive")
            .expect("sample")
            .expect("status");
        assert!(sample.metrics.contains_key("State"));
        assert!(sample.metrics.contains_key("TCPConnectError"));

        tp.stop(&target.addr);
        // drain until cleanup closes the fan-out
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while stream.next().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
        root.cancel();
    }

    #[test]
    fn stats_round_trip_through_the_metrics_map() {
        let mut stats = Stats::default();
        stats.tcp.state = 1;
        stats.tcp.rtt = 55;
        stats.congestion_alg = "reno".to_string();

        let metrics = stats_to_metrics(&stats);
        assert_eq!(
            metrics.get("State").and_then(|v| v.kind.clone()),
            Some(Kind::NumberValue(1.0))
        );
        assert_eq!(
            metrics.get("Rtt").and_then(|v| v.kind.clone()),
            Some(Kind::NumberValue(55.0))
        );
        assert_eq!(
            metrics.get("TCPCongesAlg").and_then(|v| v.kind.clone()),
            Some(Kind::StringValue("reno".to_string()))
        );
        assert_eq!(metrics.len(), FIELDS.len());
    }
}
