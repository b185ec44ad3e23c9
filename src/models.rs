//! Data models.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RelayError;
use serde_helpers::*;

/// Number of past positions kept per operator.
pub const TRAIL_LIMIT: usize = 50;

/// Accuracy radius shown when an operator never reported one, in meters.
pub const DEFAULT_ACCURACY_METERS: f64 = 12.0;

/// Operator identifier
///
/// Assigned by the operator identity system. Never empty, surrounding
/// whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId(String);

impl TryFrom<&str> for OperatorId {
    type Error = RelayError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RelayError::InvalidOperatorId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for OperatorId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<OperatorId> for String {
    fn from(value: OperatorId) -> Self {
        value.0
    }
}

impl OperatorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operator availability as reported by the operator app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Online,
    Busy,
    #[default]
    Offline,
}

impl OperatorStatus {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// WGS84 coordinate pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    /// Build a position, None if either coordinate is not a usable value.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }
}

/// Partial operator state pushed by an operator client
///
/// Every field is optional. Fields that are absent leave the stored
/// record untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        deserialize_with = "deserialize_coordinate",
        skip_serializing_if = "Option::is_none"
    )]
    pub lat: Option<f64>,
    #[serde(
        deserialize_with = "deserialize_coordinate",
        skip_serializing_if = "Option::is_none"
    )]
    pub lng: Option<f64>,
    /// Unrecognized status strings are treated as absent
    #[serde(
        deserialize_with = "deserialize_status",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<OperatorStatus>,
    /// Compass bearing in degrees, folded into [0, 360) on merge
    #[serde(
        deserialize_with = "deserialize_heading",
        skip_serializing_if = "Option::is_none"
    )]
    pub heading: Option<f64>,
    /// Uncertainty radius in meters, None if negative or not finite
    #[serde(
        deserialize_with = "deserialize_accuracy",
        skip_serializing_if = "Option::is_none"
    )]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail: Option<Vec<Position>>,
}

impl OperatorUpdate {
    /// Update carrying only an identifier
    pub fn for_operator(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    pub fn with_status(mut self, status: OperatorStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Operator id of this update, None if missing or blank
    pub fn operator_id(&self) -> Option<OperatorId> {
        self.id
            .as_deref()
            .and_then(|id| OperatorId::try_from(id).ok())
    }

    /// Reported position, present only when both coordinates are valid
    pub fn position(&self) -> Option<Position> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Position::new(lat, lng),
            _ => None,
        }
    }
}

/// Latest known state of one operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorLocation {
    pub id: OperatorId,
    #[serde(default)]
    pub name: String,
    /// Serialized as top level `lat` / `lng`, absent means no fix yet
    #[serde(flatten)]
    pub position: Option<Position>,
    #[serde(default)]
    pub status: OperatorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Chronological, oldest first
    #[serde(default)]
    pub trail: VecDeque<Position>,
    pub updated_at: DateTime<Utc>,
}

impl OperatorLocation {
    /// Empty record for an operator seen for the first time
    pub fn new(id: OperatorId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: String::new(),
            position: None,
            status: OperatorStatus::default(),
            heading: None,
            accuracy: None,
            trail: VecDeque::new(),
            updated_at: now,
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Only fields present in `update` overwrite stored values. A reported
    /// position is appended to the trail, which is then cut down to the
    /// newest `trail_limit` entries.
    pub fn merge(&mut self, update: &OperatorUpdate, trail_limit: usize, now: DateTime<Utc>) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(heading) = update.heading.and_then(normalize_heading) {
            self.heading = Some(heading);
        }
        if let Some(accuracy) = update.accuracy {
            self.accuracy = Some(accuracy);
        }
        if let Some(trail) = &update.trail {
            self.trail = trail
                .iter()
                .filter_map(|p| Position::new(p.lat, p.lng))
                .collect();
        }
        if let Some(position) = update.position() {
            self.position = Some(position);
            self.trail.push_back(position);
        }
        while self.trail.len() > trail_limit {
            self.trail.pop_front();
        }
        self.updated_at = now;
    }
}

/// Fold a bearing into [0, 360), None if not finite
pub fn normalize_heading(heading: f64) -> Option<f64> {
    if !heading.is_finite() {
        return None;
    }
    // rem_euclid rounds tiny negative inputs up to 360.0
    let heading = heading.rem_euclid(360.0);
    Some(if heading >= 360.0 { 0.0 } else { heading })
}

/// Custom deserializers
mod serde_helpers {
    use super::OperatorStatus;
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize_coordinate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.filter(|v| v.is_finite()))
    }

    pub fn deserialize_status<'de, D>(deserializer: D) -> Result<Option<OperatorStatus>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.as_deref().and_then(OperatorStatus::parse))
    }

    pub fn deserialize_heading<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.filter(|v| v.is_finite()))
    }

    pub fn deserialize_accuracy<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.filter(|v| v.is_finite() && *v >= 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_733_000_000, 0).unwrap()
    }

    #[test]
    fn operator_id_rejects_blank() {
        assert!(OperatorId::try_from("").is_err());
        assert!(OperatorId::try_from("   ").is_err());
        assert_eq!(OperatorId::try_from(" OP-1 ").unwrap().as_str(), "OP-1");
    }

    #[test]
    fn parse_update() {
        let s = r#"{
            "id": "OP-1",
            "name": "Alex Martin",
            "lat": 43.6532,
            "lng": -79.3832,
            "status": "busy",
            "heading": 450,
            "accuracy": 8.5
        }"#;
        let update: OperatorUpdate = serde_json::from_str(s).unwrap();
        let expected = OperatorUpdate {
            id: Some("OP-1".to_string()),
            name: Some("Alex Martin".to_string()),
            lat: Some(43.6532),
            lng: Some(-79.3832),
            status: Some(OperatorStatus::Busy),
            heading: Some(450.0),
            accuracy: Some(8.5),
            trail: None,
        };

        assert_eq!(update, expected);
    }

    #[test]
    fn parse_update_garbage_fields() {
        let s = r#"{
            "id": "OP-2",
            "lat": 43.65,
            "status": "sleeping",
            "heading": null,
            "accuracy": -3
        }"#;
        let update: OperatorUpdate = serde_json::from_str(s).unwrap();

        assert_eq!(update.status, None);
        assert_eq!(update.heading, None);
        assert_eq!(update.accuracy, None);
        // Only one coordinate, no fix
        assert_eq!(update.position(), None);
    }

    #[test]
    fn position_out_of_range() {
        assert!(Position::new(91.0, 0.0).is_none());
        assert!(Position::new(0.0, -180.5).is_none());
        assert!(Position::new(f64::NAN, 0.0).is_none());
        assert!(Position::new(-90.0, 180.0).is_some());
    }

    #[test]
    fn merge_keeps_omitted_fields() {
        let id = OperatorId::try_from("OP-1").unwrap();
        let mut record = OperatorLocation::new(id, now());

        let first = OperatorUpdate::for_operator("OP-1")
            .with_position(43.65, -79.38)
            .with_status(OperatorStatus::Online);
        record.merge(&first, TRAIL_LIMIT, now());

        let second = OperatorUpdate::for_operator("OP-1").with_heading(90.0);
        record.merge(&second, TRAIL_LIMIT, now());

        assert_eq!(record.position, Position::new(43.65, -79.38));
        assert_eq!(record.status, OperatorStatus::Online);
        assert_eq!(record.heading, Some(90.0));
        assert_eq!(record.trail.len(), 1);
    }

    #[test]
    fn merge_folds_heading_into_range() {
        let id = OperatorId::try_from("OP-1").unwrap();
        let mut record = OperatorLocation::new(id, now());

        record.merge(
            &OperatorUpdate::for_operator("OP-1").with_heading(450.0),
            TRAIL_LIMIT,
            now(),
        );
        assert_eq!(record.heading, Some(90.0));

        let wire: OperatorUpdate =
            serde_json::from_str(r#"{"id":"OP-1","heading":-1e-20}"#).unwrap();
        record.merge(&wire, TRAIL_LIMIT, now());
        assert_eq!(record.heading, Some(0.0));

        record.merge(
            &OperatorUpdate::for_operator("OP-1").with_heading(-90.0),
            TRAIL_LIMIT,
            now(),
        );
        assert_eq!(record.heading, Some(270.0));

        // Non-finite headings leave the stored value alone
        record.merge(
            &OperatorUpdate::for_operator("OP-1").with_heading(f64::INFINITY),
            TRAIL_LIMIT,
            now(),
        );
        assert_eq!(record.heading, Some(270.0));
    }

    #[test]
    fn explicit_trail_replaces_history() {
        let id = OperatorId::try_from("OP-1").unwrap();
        let mut record = OperatorLocation::new(id, now());
        record.merge(
            &OperatorUpdate::for_operator("OP-1").with_position(1.0, 1.0),
            TRAIL_LIMIT,
            now(),
        );

        let update = OperatorUpdate {
            trail: Some(vec![
                Position { lat: 2.0, lng: 2.0 },
                Position { lat: 99.0, lng: 0.0 },
            ]),
            ..OperatorUpdate::for_operator("OP-1").with_position(3.0, 3.0)
        };
        record.merge(&update, TRAIL_LIMIT, now());

        let trail: Vec<_> = record.trail.iter().map(|p| (p.lat, p.lng)).collect();
        assert_eq!(trail, vec![(2.0, 2.0), (3.0, 3.0)]);
    }

    #[test]
    fn location_wire_shape() {
        let id = OperatorId::try_from("OP-1").unwrap();
        let mut record = OperatorLocation::new(id.clone(), now());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("lat").is_none());
        assert_eq!(json["status"], "offline");

        record.merge(
            &OperatorUpdate::for_operator("OP-1").with_position(43.65, -79.38),
            TRAIL_LIMIT,
            now(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "OP-1");
        assert_eq!(json["lat"], 43.65);
        assert_eq!(json["lng"], -79.38);
        assert_eq!(json["trail"][0]["lat"], 43.65);
        assert!(json.get("updatedAt").is_some());

        let back: OperatorLocation = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
