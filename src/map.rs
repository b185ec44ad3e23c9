//! Live operator map view model
//!
//! [`LiveMapView`] turns relay records into marker, accuracy circle and
//! breadcrumb layers and pushes them to a [`MapSurface`]. The surface is the
//! seam to whatever actually draws the map; it is initialized once per view
//! and afterwards only receives per-operator layer replacements.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    errors::RelayError,
    models::{OperatorId, OperatorLocation, OperatorStatus, Position, DEFAULT_ACCURACY_METERS},
    service::RelayHandle,
};

/// Center used when no operator has a fix (Toronto)
pub const DEFAULT_CENTER: Position = Position {
    lat: 43.6532,
    lng: -79.3832,
};

pub const DEFAULT_ZOOM: u8 = 14;

/// Marker color for an operator status
pub fn status_color(status: OperatorStatus) -> &'static str {
    match status {
        OperatorStatus::Online => "#22c55e",
        OperatorStatus::Busy => "#eab308",
        OperatorStatus::Offline => "#64748b",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub south_west: Position,
    pub north_east: Position,
}

impl Bounds {
    /// Smallest box containing all positions, None for an empty input
    pub fn enclosing<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Option<Self> {
        positions.into_iter().fold(None, |bounds, p| {
            Some(match bounds {
                None => Bounds {
                    south_west: *p,
                    north_east: *p,
                },
                Some(Bounds {
                    south_west,
                    north_east,
                }) => Bounds {
                    south_west: Position {
                        lat: south_west.lat.min(p.lat),
                        lng: south_west.lng.min(p.lng),
                    },
                    north_east: Position {
                        lat: north_east.lat.max(p.lat),
                        lng: north_east.lng.max(p.lng),
                    },
                },
            })
        })
    }
}

/// Map viewport
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Camera {
    Center { center: Position, zoom: u8 },
    Fit { bounds: Bounds },
}

impl Default for Camera {
    fn default() -> Self {
        Camera::Center {
            center: DEFAULT_CENTER,
            zoom: DEFAULT_ZOOM,
        }
    }
}

impl Camera {
    /// Camera showing every given position
    pub fn covering(positions: &[Position]) -> Self {
        match positions {
            [] => Camera::default(),
            [only] => Camera::Center {
                center: *only,
                zoom: DEFAULT_ZOOM,
            },
            many => Bounds::enclosing(many)
                .map(|bounds| Camera::Fit { bounds })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub position: Position,
    /// Icon rotation in degrees
    pub heading: f64,
    pub color: &'static str,
    pub label: String,
    pub status: OperatorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyCircle {
    pub center: Position,
    /// Meters
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polyline {
    pub points: Vec<Position>,
}

/// Everything drawn for one operator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorLayer {
    pub marker: Marker,
    pub accuracy: AccuracyCircle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail: Option<Polyline>,
}

impl OperatorLayer {
    /// Layer for a record, None when the operator has no position yet
    pub fn from_record(record: &OperatorLocation) -> Option<Self> {
        let position = record.position?;
        let trail = (record.trail.len() >= 2).then(|| Polyline {
            points: record.trail.iter().copied().collect(),
        });

        Some(Self {
            marker: Marker {
                position,
                heading: record.heading.unwrap_or(0.0),
                color: status_color(record.status),
                label: record.name.clone(),
                status: record.status,
            },
            accuracy: AccuracyCircle {
                center: position,
                radius: record.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS),
            },
            trail,
        })
    }
}

/// Drawing backend for [`LiveMapView`]
pub trait MapSurface {
    /// Create the underlying map widget. Called exactly once per view.
    fn init(&mut self, camera: &Camera);

    /// Add or replace the layer of one operator
    fn upsert_layer(&mut self, id: &OperatorId, layer: &OperatorLayer);

    fn remove_layer(&mut self, id: &OperatorId);

    fn set_camera(&mut self, camera: &Camera);
}

/// Outcome of rendering one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerChange {
    Added,
    Updated,
    Removed,
    Unchanged,
}

pub struct LiveMapView<S: MapSurface> {
    surface: S,
    layers: HashMap<OperatorId, OperatorLayer>,
}

impl<S: MapSurface> LiveMapView<S> {
    pub fn new(mut surface: S) -> Self {
        surface.init(&Camera::default());
        Self {
            surface,
            layers: HashMap::new(),
        }
    }

    /// Render a full snapshot and fit the camera to it
    pub fn seed(&mut self, records: impl IntoIterator<Item = OperatorLocation>) {
        for record in records {
            self.apply(&record);
        }
        self.fit();
    }

    /// Re-render a single operator, leaving every other layer alone
    pub fn apply(&mut self, record: &OperatorLocation) -> LayerChange {
        match OperatorLayer::from_record(record) {
            Some(layer) => match self.layers.get(&record.id) {
                Some(current) if *current == layer => LayerChange::Unchanged,
                current => {
                    let change = if current.is_some() {
                        LayerChange::Updated
                    } else {
                        LayerChange::Added
                    };
                    self.surface.upsert_layer(&record.id, &layer);
                    self.layers.insert(record.id.clone(), layer);
                    change
                }
            },
            None => {
                if self.layers.remove(&record.id).is_some() {
                    self.surface.remove_layer(&record.id);
                    LayerChange::Removed
                } else {
                    LayerChange::Unchanged
                }
            }
        }
    }

    /// Camera covering every rendered operator
    pub fn camera(&self) -> Camera {
        let positions: Vec<Position> = self
            .layers
            .values()
            .map(|layer| layer.marker.position)
            .collect();
        Camera::covering(&positions)
    }

    pub fn fit(&mut self) {
        let camera = self.camera();
        self.surface.set_camera(&camera);
    }

    pub fn layer(&self, id: &OperatorId) -> Option<&OperatorLayer> {
        self.layers.get(id)
    }

    pub fn rendered_count(&self) -> usize {
        self.layers.len()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

/// Keep a view in sync with the relay until `shutdown` resolves.
///
/// The feed is opened before the snapshot is taken so no update falls in
/// between; replaying a record the snapshot already contains is harmless.
/// The camera is refitted whenever an operator appears or disappears.
pub async fn follow<S, F>(
    mut view: LiveMapView<S>,
    relay: RelayHandle,
    buffer: usize,
    shutdown: F,
) -> Result<LiveMapView<S>, RelayError>
where
    S: MapSurface,
    F: Future<Output = ()>,
{
    let mut feed = relay.subscribe(buffer).await?;
    view.seed(relay.snapshot().await?);
    info!("Map view seeded with {} operators", view.rendered_count());

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            record = feed.recv() => {
                let Some(record) = record else {
                    break;
                };
                match view.apply(&record) {
                    LayerChange::Added | LayerChange::Removed => view.fit(),
                    LayerChange::Updated | LayerChange::Unchanged => {}
                }
            }
            _ = &mut shutdown => {
                debug!("Map view shutting down");
                break;
            }
        }
    }

    Ok(view)
}

/// Serializable state of a rendered map
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Scene {
    pub camera: Camera,
    pub operators: BTreeMap<OperatorId, OperatorLayer>,
}

/// Surface that keeps the rendered scene as data and publishes every change
/// on a watch channel
pub struct SceneSurface {
    tx: watch::Sender<Scene>,
}

impl SceneSurface {
    pub fn new() -> (Self, watch::Receiver<Scene>) {
        let (tx, rx) = watch::channel(Scene::default());
        (Self { tx }, rx)
    }
}

impl MapSurface for SceneSurface {
    fn init(&mut self, camera: &Camera) {
        self.tx.send_replace(Scene {
            camera: *camera,
            operators: BTreeMap::new(),
        });
    }

    fn upsert_layer(&mut self, id: &OperatorId, layer: &OperatorLayer) {
        self.tx.send_modify(|scene| {
            scene.operators.insert(id.clone(), layer.clone());
        });
    }

    fn remove_layer(&mut self, id: &OperatorId) {
        self.tx.send_modify(|scene| {
            scene.operators.remove(id);
        });
    }

    fn set_camera(&mut self, camera: &Camera) {
        self.tx.send_modify(|scene| scene.camera = *camera);
    }
}
