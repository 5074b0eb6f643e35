//! gRPC client mode for the `add` / `del` subcommands.

use std::collections::HashMap;
use std::time::Duration;

use tcpprobe_proto::{Target, TcpProbeClient};
use tonic::transport::Endpoint;
use tracing::{info, warn};

use crate::cli::CmdArgs;
use crate::error::{Result, TcpProbeError};

/// Send every target to a running tcpprobe instance; `delete` selects the
/// Del operation. Dialing uses a fixed 5s timeout.
pub async fn run(cmd: &CmdArgs, delete: bool) -> Result<()> {
    let scheme = if cmd.insecure { "http" } else { "https" };

    let channel = Endpoint::from_shared(format!("{}://{}", scheme, cmd.addr))
        .map_err(|err| TcpProbeError::Rpc(err.to_string()))?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
        .map_err(|err| TcpProbeError::Rpc(err.to_string()))?;

    let mut client = TcpProbeClient::new(channel);

    let labels: HashMap<String, String> = cmd
        .labels
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    for target in &cmd.targets {
        let request = Target {
            addr: target.clone(),
            interval: cmd.interval.clone(),
            labels: labels.clone(),
        };

        let result = if delete {
            client.delete(request).await
        } else {
            client.add(request).await
        };

        match result {
            Ok(response) => {
                let response = response.into_inner();
                info!("message: {}, code: {}", response.message, response.code);
            }
            Err(err) => warn!("{}", err),
        }
    }

    Ok(())
}
