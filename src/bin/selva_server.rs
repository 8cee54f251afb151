//! `selva-server` (§6): binds the TCP listener, starts the core actor, and
//! waits for SIGINT/SIGTERM to snapshot and exit.

use std::thread;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use selva::config::Config;
use selva::server;

#[tokio::main]
async fn main() {
    let cfg = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(cfg.log_filter.clone())
        .init();

    let addr = ("0.0.0.0", cfg.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = cfg.port, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(port = cfg.port, data_dir = ?cfg.data_dir, "selva-server listening");

    let data_dir = cfg.data_dir.clone();
    let handle = match server::serve(cfg, listener).await {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "server failed to start");
            std::process::exit(1);
        }
    };

    let (sig_tx, sig_rx) = oneshot::channel();
    let mut signals = signal_hook::iterator::Signals::new(&[
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .expect("failed to register signal handlers");
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = sig_tx.send(());
        }
    });

    let _ = sig_rx.await;
    tracing::info!("shutdown requested, snapshotting");
    let snapshot_path = data_dir.join("shutdown.sdb");
    if let Err(e) = handle.shutdown(snapshot_path).await {
        tracing::error!(error = %e, "shutdown snapshot failed");
    }
    tracing::info!("exiting");
}
