// lifx-lan daemon: discover bulbs on the local network and log the roster as it changes.

use anyhow::Context;
use lifx_lan::{config, Device, Discovery, RequestOptions, RosterEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lifx-lan {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load().context("load config")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (roster_tx, roster_rx) = mpsc::unbounded_channel();
        let discovery = Discovery::start(cfg, Some(roster_tx))
            .await
            .context("start discovery")?;
        let local = discovery.local_addr().await.ok();
        info!(?local, "discovery running");
        let roster = tokio::spawn(log_roster(roster_rx));

        let result = tokio::select! {
            r = shutdown_signal() => r,
            r = discovery.join() => r.context("discovery socket"),
        };
        roster.abort();
        discovery.close().await;
        result
    })
}

async fn log_roster(mut events: mpsc::UnboundedReceiver<RosterEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RosterEvent::Registered(device) => {
                tokio::spawn(describe(device));
            }
            RosterEvent::Unregistered(device) => {
                info!(mac = %device.mac(), "device offline");
            }
        }
    }
}

async fn describe(device: Device) {
    let opts = RequestOptions::default();
    let fetched = tokio::try_join!(device.get_label(opts), device.get_group(opts));
    let endpoint = device.endpoint().await;
    match fetched {
        Ok((label, group)) => info!(
            mac = %device.mac(),
            %endpoint,
            %label,
            %group,
            "device online"
        ),
        Err(e) => warn!(mac = %device.mac(), error = %e, "device online, metadata unavailable"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutting down");
    Ok(())
}
