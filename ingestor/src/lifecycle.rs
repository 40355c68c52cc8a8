//! Startup and shutdown sequencing.
//!
//! Startup: pool, schema, storage workers, MQTT bridge, HTTP. Shutdown runs in
//! reverse: refuse new messages, drain queued units of work, disconnect from
//! the broker, stop HTTP, close the pool.

use crate::config::Config;
use crate::db;
use crate::dispatch::{Dispatcher, Workers};
use crate::errors::Result;
use crate::metrics;
use crate::mqtt::{BridgeSettings, BridgeState, BusBridge};
use crate::rest;
use crate::schema;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

pub async fn run(config: Config) -> Result<()> {
    config.validate()?;
    metrics::init_metrics()?;

    let pool = db::make_pool(&config.database).await?;
    if let Err(e) = schema::ensure_schema(&pool).await {
        pool.close().await;
        return Err(e);
    }

    let (dispatcher, receivers) =
        Dispatcher::new(config.dispatch_workers, config.queue_high_watermark);
    let workers = Workers::spawn(&dispatcher, receivers, pool.clone());

    let bridge = match BridgeSettings::from_config(&config.mqtt).await {
        Ok(settings) => BusBridge::start(settings, dispatcher.clone()).await,
        Err(e) => Err(e),
    };
    let bridge = match bridge {
        Ok(bridge) => bridge,
        Err(e) => {
            abort_startup(&config, dispatcher, workers, &pool).await;
            return Err(e);
        }
    };

    let listener = match TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            bridge.stop();
            abort_startup(&config, dispatcher, workers, &pool).await;
            bridge.disconnect().await;
            return Err(e.into());
        }
    };
    info!("HTTP server listening on {}", config.http_addr);

    let app = rest::create_router(pool.clone(), bridge.state());
    let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = http_stop_rx.await;
            })
            .await
    });

    let mut server_done = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        res = &mut server => {
            server_done = true;
            error!("HTTP server terminated: {:?}", res);
        }
        _ = bridge_stopped(bridge.state()) => {
            error!("MQTT bridge terminated");
        }
    }

    info!("Shutting down, refusing new messages");
    bridge.stop();
    dispatcher.close();

    info!("Draining {} in-flight messages", dispatcher.pending());
    if workers.drain(config.shutdown_timeout()).await {
        info!("All dispatched messages processed");
    } else {
        warn!(
            "Drain bound of {}s reached, abandoning {} queued messages",
            config.shutdown_timeout_secs,
            dispatcher.pending()
        );
    }

    bridge.disconnect().await;

    let _ = http_stop_tx.send(());
    if !server_done {
        match server.await {
            Ok(Ok(())) => info!("HTTP server stopped"),
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
        }
    }

    pool.close().await;
    info!("Database pool closed");
    Ok(())
}

async fn abort_startup(config: &Config, dispatcher: Dispatcher, workers: Workers, pool: &PgPool) {
    dispatcher.close();
    workers.drain(config.shutdown_timeout()).await;
    pool.close().await;
}

async fn bridge_stopped(mut state: watch::Receiver<BridgeState>) {
    while *state.borrow_and_update() != BridgeState::Stopped {
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_stopped_resolves_on_stop() {
        let (tx, rx) = watch::channel(BridgeState::Receiving);
        let waiter = tokio::spawn(bridge_stopped(rx));

        tx.send(BridgeState::Disconnected).unwrap();
        tx.send(BridgeState::Stopped).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bridge_stopped_pending_while_running() {
        let (_tx, rx) = watch::channel(BridgeState::Subscribed);
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), bridge_stopped(rx)).await;
        assert!(result.is_err());
    }
}
