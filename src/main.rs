//! Operator location relay service

use operator_relay::{
    build_router,
    config::AppConfig,
    follow,
    mqtt::{MqttClient, MqttClientBuilder},
    spawn_relay, AppState, LiveMapView, LocationRelay, RelayError, RelayHandle, SceneSurface,
};
use tokio::{net::TcpListener, signal, sync::oneshot};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration, preferring environment variables and config files
    let config = AppConfig::load()?;
    config.validate()?;

    let (relay, _relay_task) = spawn_relay(
        LocationRelay::with_trail_limit(config.relay.trail_limit),
        config.relay.command_buffer,
    );

    // Live map rendered server side for polling viewers
    let (surface, scene) = SceneSurface::new();
    let (stop_map, map_stopped) = oneshot::channel::<()>();
    let map_task = tokio::spawn(follow(
        LiveMapView::new(surface),
        relay.clone(),
        config.server.ws_buffer,
        async {
            let _ = map_stopped.await;
        },
    ));

    let ingest_task = if config.mqtt.enabled {
        let mqtt_client = MqttClientBuilder::new(&config.mqtt)?.connect(&config.mqtt.topics);
        Some(tokio::spawn(run_mqtt_ingest(mqtt_client, relay.clone())))
    } else {
        info!("MQTT ingest disabled");
        None
    };

    let app = build_router(AppState::new(relay, scene, config.server.ws_buffer));
    let listener = TcpListener::bind(&config.server.bind).await?;
    info!("Operator relay listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_map.send(());
    match map_task.await {
        Ok(Err(e)) => warn!("Map view stopped with error: {}", e),
        Err(e) => warn!("Map view task failed: {}", e),
        Ok(Ok(_)) => {}
    }
    if let Some(task) = ingest_task {
        task.abort();
    }

    info!("Operator relay stopped");
    Ok(())
}

async fn run_mqtt_ingest(mut mqtt_client: MqttClient, relay: RelayHandle) {
    while let Some(update) = mqtt_client.recv().await {
        if let Err(e) = relay.apply(update).await {
            error!("Relay unavailable, stopping MQTT ingest: {}", e);
            break;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
