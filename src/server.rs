//! HTTP and WebSocket surface of the relay
//!
//! - `GET  /health`                   liveness plus operator and subscriber counts
//! - `GET  /api/operators`            snapshot of every tracked operator
//! - `GET  /api/operators/by-id/{id}` one operator
//! - `POST /api/operators/update`     push a partial update
//! - `GET  /api/operators/map`        rendered live map scene
//! - `GET  /ws/operators`             WebSocket relay

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method, StatusCode,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    errors::RelayError,
    map::Scene,
    models::{OperatorId, OperatorLocation, OperatorUpdate},
    service::RelayHandle,
};

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    relay: RelayHandle,
    scene: watch::Receiver<Scene>,
    ws_buffer: usize,
}

impl AppState {
    pub fn new(relay: RelayHandle, scene: watch::Receiver<Scene>, ws_buffer: usize) -> Self {
        Self {
            relay,
            scene,
            ws_buffer,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/operators", get(snapshot_handler))
        .route("/api/operators/update", post(update_handler))
        .route("/api/operators/map", get(map_handler))
        .route("/api/operators/by-id/{id}", get(operator_handler))
        .route("/ws/operators", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let stats = state.relay.stats().await?;
    Ok(Json(json!({
        "status": "ok",
        "operators": stats.operators,
        "subscribers": stats.subscribers,
    })))
}

async fn snapshot_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<OperatorLocation>>, RelayError> {
    let mut operators = state.relay.snapshot().await?;
    operators.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(operators))
}

async fn operator_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperatorLocation>, RelayError> {
    let id = OperatorId::try_from(id)?;
    match state.relay.get(id.clone()).await? {
        Some(operator) => Ok(Json(operator)),
        None => Err(RelayError::OperatorNotFound(id.to_string())),
    }
}

async fn update_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, RelayError> {
    let update: OperatorUpdate = serde_json::from_slice(&body)?;
    let applied = state.relay.apply(update).await?;
    let status = if applied {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "applied": applied }))))
}

async fn map_handler(State(state): State<AppState>) -> Json<Scene> {
    let scene = state.scene.borrow().clone();
    Json(scene)
}

/// Frames sent by WebSocket clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "operator:update")]
    Update(OperatorUpdate),
    #[serde(rename = "operator:getAll")]
    GetAll,
}

/// Frames sent to WebSocket clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "operator:update")]
    Update(OperatorLocation),
    #[serde(rename = "operator:all")]
    All(Vec<OperatorLocation>),
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Relay loop of one WebSocket connection.
///
/// Every connection receives every applied update, including its own.
/// The feed is dropped, and with it the subscription, when the socket closes.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut feed = match state.relay.subscribe(state.ws_buffer).await {
        Ok(feed) => feed,
        Err(e) => {
            warn!("Cannot attach WebSocket client: {}", e);
            return;
        }
    };
    info!("WS client connected");

    loop {
        tokio::select! {
            record = feed.recv() => {
                let Some(record) = record else {
                    break;
                };
                if send_event(&mut socket, &ServerEvent::Update(record)).await.is_err() {
                    break;
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_frame(&state.relay, text.as_str()).await {
                            if send_event(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WS receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!("WS client disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), RelayError> {
    let text = serde_json::to_string(event)?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Handle one text frame, returning the reply for the sender if any
pub async fn handle_frame(relay: &RelayHandle, text: &str) -> Option<ServerEvent> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Ignoring WS frame: {}", e);
            return None;
        }
    };

    match event {
        ClientEvent::Update(update) => {
            if let Err(e) = relay.apply(update).await {
                warn!("Failed to apply WS update: {}", e);
            }
            None
        }
        ClientEvent::GetAll => match relay.snapshot().await {
            Ok(operators) => Some(ServerEvent::All(operators)),
            Err(e) => {
                warn!("Failed to read snapshot: {}", e);
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::OperatorStatus, relay::LocationRelay, service::spawn_relay};

    #[test]
    fn parse_client_events() {
        let update: ClientEvent = serde_json::from_str(
            r#"{"event":"operator:update","data":{"id":"OP-1","lat":43.65,"lng":-79.38}}"#,
        )
        .unwrap();
        assert_eq!(
            update,
            ClientEvent::Update(OperatorUpdate::for_operator("OP-1").with_position(43.65, -79.38))
        );

        let get_all: ClientEvent = serde_json::from_str(r#"{"event":"operator:getAll"}"#).unwrap();
        assert_eq!(get_all, ClientEvent::GetAll);

        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"operator:delete"}"#).is_err());
    }

    #[tokio::test]
    async fn frames_drive_relay() {
        let (relay, _task) = spawn_relay(LocationRelay::new(), 16);
        let mut feed = relay.subscribe(4).await.unwrap();

        let reply = handle_frame(
            &relay,
            r#"{"event":"operator:update","data":{"id":"OP-1","status":"online"}}"#,
        )
        .await;
        assert_eq!(reply, None);
        assert_eq!(feed.recv().await.unwrap().status, OperatorStatus::Online);

        let reply = handle_frame(&relay, r#"{"event":"operator:getAll"}"#).await;
        let Some(ServerEvent::All(operators)) = reply else {
            panic!("expected snapshot reply");
        };
        assert_eq!(operators.len(), 1);

        assert_eq!(handle_frame(&relay, "garbage").await, None);
    }

    #[test]
    fn server_event_shape() {
        let event = ServerEvent::All(Vec::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "operator:all");
        assert!(json["data"].as_array().unwrap().is_empty());
    }
}
