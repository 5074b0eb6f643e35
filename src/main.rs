use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tcpprobe::cli::{Cli, Commands};
use tcpprobe::k8s::Informer;
use tcpprobe::supervisor::{CleanupGuard, Overrides, Supervisor};
use tcpprobe::{cli, config, metrics, rpc, update, TcpProbeError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if let Err(err) = run(cli).await {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> tcpprobe::Result<()> {
    // grpc client mode
    if let Some(command) = &cli.command {
        return match command {
            Commands::Add(args) => rpc::client::run(args, false).await,
            Commands::Del(args) => rpc::client::run(args, true).await,
        };
    }

    if cli.metrics {
        let mut stdout = std::io::stdout().lock();
        cli::print_metrics(&mut stdout)?;
        return Ok(());
    }

    if cli.check_update {
        let (update, latest) = update::check_update(tcpprobe::RELEASE_URL, tcpprobe::VERSION).await;
        if update {
            println!("the new version: {} available", latest);
        } else {
            println!("there is currently no update available");
        }
        return Ok(());
    }

    let req = Arc::new(cli.to_request());
    let targets = cli.targets.clone();

    if targets.is_empty() && req.config.is_empty() && !req.k8s && !req.grpc {
        return Err(TcpProbeError::Config(
            "configuration not specified".to_string(),
        ));
    }

    let cfg = config::load(&req.config)?;

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                root.cancel();
            }
        });
    }

    let tp = Supervisor::new();
    let mut static_tasks = JoinSet::new();

    // command line targets
    for target in targets {
        if tp.exists(&target) {
            warn!("{}: {}", TcpProbeError::TargetExist, target);
            continue;
        }
        let tp = Arc::clone(&tp);
        let req = Arc::clone(&req);
        let root = root.clone();
        static_tasks.spawn(async move {
            let _cleanup = CleanupGuard::new(Arc::clone(&tp), target.as_str());
            tp.start(&root, &target, req, Overrides::default()).await;
        });
    }

    // config file targets
    for spec in cfg.targets {
        if tp.exists(&spec.addr) {
            warn!("{}: {}", TcpProbeError::TargetExist, spec.addr);
            continue;
        }
        let overrides = Overrides {
            interval: Some(spec.interval).filter(|s| !s.is_empty()),
            labels: serde_json::to_string(&spec.labels).ok(),
        };
        let tp = Arc::clone(&tp);
        let req = Arc::clone(&req);
        let root = root.clone();
        static_tasks.spawn(async move {
            let _cleanup = CleanupGuard::new(Arc::clone(&tp), spec.addr.as_str());
            tp.start(&root, &spec.addr, req, overrides).await;
        });
    }

    // kubernetes
    if req.k8s {
        Informer::new()
            .start(root.clone(), Arc::clone(&tp), Arc::clone(&req))
            .await?;
    }

    // grpc server
    if req.grpc {
        rpc::serve(Arc::clone(&tp), Arc::clone(&req), root.clone()).await?;
    }

    // prometheus
    if !req.prom_disabled {
        let addr = req.prom_addr.clone();
        let token = root.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::exporter::serve(&addr, token).await {
                error!("prometheus exporter: {}", err);
            }
        });
    }

    // static probes first; online control planes hold the process until
    // the shutdown signal
    while static_tasks.join_next().await.is_some() {}
    if req.k8s || req.grpc {
        root.cancelled().await;
    }

    Ok(())
}
