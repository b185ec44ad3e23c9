//! Operator location relay
//!
//! Keeps the last known position, status and trail of every field operator,
//! fans changes out to connected admin viewers and renders a live map scene.
//! State is held in memory only.

pub mod config;
pub mod errors;
pub mod map;
pub mod models;
pub mod mqtt;
pub mod relay;
pub mod server;
pub mod service;

pub use errors::RelayError;
pub use map::{follow, LiveMapView, MapSurface, SceneSurface};
pub use relay::{LocationRelay, Subscription};
pub use server::{build_router, AppState};
pub use service::{spawn_relay, Feed, RelayHandle, RelayStats};
