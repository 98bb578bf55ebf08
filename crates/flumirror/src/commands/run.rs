//! `flumirror run`: start the broker link and the bridge, then supervise
//! the manager connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flumirror_api::{Broker, ManagerClient, StompBroker};
use flumirror_core::{Bridge, ConnectionState};

use crate::cli::RunArgs;
use crate::config::{RunSettings, resolve_run_settings};
use crate::error::CliError;

pub async fn handle(args: RunArgs) -> Result<(), CliError> {
    let RunSettings {
        profile,
        manager,
        broker,
        bridge,
    } = resolve_run_settings(&args)?;
    let manager_url = manager.url.to_string();

    info!(
        profile = %profile,
        manager = %manager_url,
        broker = %broker.url,
        prefix = %bridge.prefix,
        "starting bridge"
    );

    let cancel = CancellationToken::new();
    let broker: Arc<StompBroker> = Arc::new(StompBroker::connect(broker, cancel.child_token()));
    let upstream = Arc::new(ManagerClient::new(manager));
    let bridge = Bridge::start(bridge, upstream, Arc::clone(&broker) as Arc<dyn Broker>);

    // The first connection is never retried.
    let outcome = match bridge.connect().await {
        Ok(()) => {
            info!(components = bridge.components().len(), "mirroring");
            supervise(&bridge, args.reconnect_after.map(Duration::from_secs)).await
        }
        Err(e) => Err(CliError::from_connect(e, &profile, &manager_url)),
    };

    bridge.shutdown().await;
    broker.shutdown().await;
    cancel.cancel();
    outcome
}

/// Wait for Ctrl-C, reconnecting after upstream loss when `reconnect_after`
/// is set and failing with [`CliError::UpstreamLost`] otherwise.
async fn supervise(bridge: &Bridge, reconnect_after: Option<Duration>) -> Result<(), CliError> {
    let mut state = bridge.state_changes();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            lost = wait_for_loss(&mut state) => {
                if !lost {
                    return Ok(());
                }
            }
        }

        let Some(delay) = reconnect_after else {
            warn!("manager connection lost");
            return Err(CliError::UpstreamLost);
        };

        loop {
            warn!(delay_secs = delay.as_secs(), "manager connection lost, reconnecting");
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
            match bridge.connect().await {
                Ok(()) => {
                    info!(components = bridge.components().len(), "reconnected");
                    break;
                }
                Err(e) => warn!(error = %e, "reconnect failed"),
            }
        }
    }
}

/// `false` when the bridge went away instead.
async fn wait_for_loss(state: &mut watch::Receiver<ConnectionState>) -> bool {
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .is_ok()
}
