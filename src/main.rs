use anyhow::Result;
use aprsgate::acl::AccessControl;
use aprsgate::aprsis;
use aprsgate::beacon::BeaconService;
use aprsgate::config::Config;
use aprsgate::history::HistoryBuffer;
use aprsgate::peer;
use aprsgate::rf;
use aprsgate::router::Router;
use aprsgate::server::{self, ClientRegistry};
use aprsgate::stats::{self, Stats};
use aprsgate::udp;
use clap::Parser;
use log::info;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, RwLock};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/aprsgate.conf")]
    config: PathBuf,

    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.debug {
        "debug"
    } else {
        "info"
    }))
    .init();

    info!("Starting aprsgate daemon...");

    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded configuration from {:?}", args.config);

    let history = Arc::new(RwLock::new(HistoryBuffer::new(config.history.size)));
    let registry: ClientRegistry = Arc::new(RwLock::new(HashMap::new()));
    let acl = Arc::new(RwLock::new(AccessControl::new(config.acl.clone())));
    let stats = Arc::new(Stats::new());

    let (event_tx, event_rx) = mpsc::channel(1000);

    let (router, channels) = Router::new(
        &config,
        event_rx,
        history.clone(),
        registry.clone(),
        stats.clone(),
    );

    let mut handles = vec![];

    handles.push(tokio::spawn(router.run()));

    for rf_config in &config.rf {
        let tx = event_tx.clone();
        let rf_rx = channels.rf_tx.subscribe();
        handles.push(tokio::spawn(rf::run_rf_interface(
            rf_config.clone(),
            tx,
            rf_rx,
        )));
    }

    if let Some(aprsis_config) = &config.aprsis {
        let tx = event_tx.clone();
        let is_rx = channels.is_tx.subscribe();
        handles.push(tokio::spawn(aprsis::run_aprsis_client(
            aprsis_config.clone(),
            tx,
            is_rx,
        )));
    }

    if let Some(server_config) = &config.server {
        handles.push(tokio::spawn(server::run_server(
            server_config.clone(),
            config.server_call.clone(),
            acl.clone(),
            history.clone(),
            registry.clone(),
            event_tx.clone(),
        )));
    }

    for peer_config in &config.peers {
        handles.push(tokio::spawn(peer::run_peer_link(
            peer_config.clone(),
            config.server_call.clone(),
            event_tx.clone(),
            channels.peer_tx.subscribe(),
        )));
    }

    if let Some(udp_config) = &config.udp {
        handles.push(tokio::spawn(udp::run_udp_listener(
            udp_config.clone(),
            event_tx.clone(),
        )));
    }

    if let Some(beacon_config) = &config.beacon {
        if beacon_config.enabled {
            let beacon = BeaconService::new(beacon_config.clone());
            handles.push(tokio::spawn(beacon.run(event_tx.clone())));
        }
    }

    if let Some(status_config) = &config.status {
        if status_config.enabled {
            handles.push(tokio::spawn(stats::run_status_reporter(
                status_config.clone(),
                config.server_call.clone(),
                stats.clone(),
                event_tx.clone(),
            )));
        }
    }

    // Expired bans and flood windows are pruned off the accept path
    let acl_sweep = acl.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            acl_sweep.write().await.sweep();
        }
    });

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    Ok(())
}
