//! Channel Access repeater entry point.
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML file + EPICS_CA_REPEATER_PORT
//!  └─ bind discovery port    -- failure means a repeater already runs here
//!  └─ RepeaterService::run() -- until Ctrl-C
//! ```

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ca_repeater::{bind, load_config, RepeaterService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.repeater.log_level)),
        )
        .init();

    let addr = config.discovery_addr()?;
    let socket = match bind(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            info!("{e}; assuming another repeater owns the port, exiting");
            return Ok(());
        }
    };

    let mut service = RepeaterService::new(&config);
    if let Some(upstream) = config.upstream_addr() {
        match bind(upstream).await {
            Ok(socket) => {
                info!("relaying beacons received on UDP {upstream}");
                service = service.with_upstream(socket);
            }
            Err(e) => warn!("upstream beacon socket disabled: {e}"),
        }
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            on_signal.cancel();
        }
    });

    service.run(socket, cancel).await;
    Ok(())
}
