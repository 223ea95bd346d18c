//! Tile, field and snapshot types shared by every component
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

/// Milliseconds since the Unix epoch, as stamped by the shared resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// Timestamp for the next accepted write: wall clock, but always strictly
    /// after `previous`.
    pub fn next_after(previous: Option<Timestamp>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if now <= prev => Timestamp(prev.0.saturating_add(1)),
            _ => now,
        }
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one hangar slot. Ids up to 100 live in the primary grid,
/// 101 and above in the secondary grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u32);

impl CellId {
    pub const SECONDARY_START: u32 = 101;

    pub fn container(self) -> Container {
        if self.0 >= Self::SECONDARY_START {
            Container::Secondary
        } else {
            Container::Primary
        }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two disjoint tile groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Primary,
    Secondary,
}

impl Container {
    pub const ALL: [Container; 2] = [Container::Primary, Container::Secondary];

    /// Element id of the grid that renders this container.
    pub fn dom_id(self) -> &'static str {
        match self {
            Container::Primary => "hangarGrid",
            Container::Secondary => "secondaryHangarGrid",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dom_id())
    }
}

/// Editable fields of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Aircraft,
    ArrivalTime,
    DepartureTime,
    Position,
    HangarPosition,
    Status,
    TowStatus,
    Notes,
}

impl FieldKind {
    pub const ALL: [FieldKind; 8] = [
        FieldKind::Aircraft,
        FieldKind::ArrivalTime,
        FieldKind::DepartureTime,
        FieldKind::Position,
        FieldKind::HangarPosition,
        FieldKind::Status,
        FieldKind::TowStatus,
        FieldKind::Notes,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            FieldKind::Aircraft => "aircraft",
            FieldKind::ArrivalTime => "arrival-time",
            FieldKind::DepartureTime => "departure-time",
            FieldKind::Position => "position",
            FieldKind::HangarPosition => "hangar-position",
            FieldKind::Status => "status",
            FieldKind::TowStatus => "tow-status",
            FieldKind::Notes => "notes",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Fields the user types prose into; their server flush waits for typing to settle.
    pub fn is_free_text(self) -> bool {
        matches!(self, FieldKind::Aircraft | FieldKind::Notes)
    }

    pub fn is_datetime(self) -> bool {
        matches!(self, FieldKind::ArrivalTime | FieldKind::DepartureTime)
    }

    /// Value an empty field shows. Status selects fall back to "neutral".
    pub fn default_value(self) -> &'static str {
        match self {
            FieldKind::Status | FieldKind::TowStatus => "neutral",
            _ => "",
        }
    }
}

/// Structured element id `{field-kind}-{cellId}`, e.g. `hangar-position-112`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId {
    pub kind: FieldKind,
    pub cell: CellId,
}

impl FieldId {
    pub fn new(kind: FieldKind, cell: CellId) -> Self {
        Self { kind, cell }
    }

    /// Container this field is authoritative in.
    pub fn container(&self) -> Container {
        self.cell.container()
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.cell.0)
    }
}

impl FromStr for FieldId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || SyncError::UnknownField(s.to_string());
        let (prefix, digits) = s.rsplit_once('-').ok_or_else(unknown)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(unknown());
        }
        let cell: u32 = digits.parse().map_err(|_| unknown())?;
        if cell == 0 {
            return Err(unknown());
        }
        let kind = FieldKind::from_prefix(prefix).ok_or_else(unknown)?;
        Ok(FieldId::new(kind, CellId(cell)))
    }
}

impl Serialize for FieldId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One aircraft slot. Absent fields mean "no information", never "clear".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileState {
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aircraft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hangar_position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tow_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TileState {
    pub fn new(cell_id: CellId) -> Self {
        Self {
            cell_id,
            aircraft_id: None,
            arrival_iso: None,
            departure_iso: None,
            hangar_position: None,
            position_info: None,
            status: None,
            tow_status: None,
            notes: None,
        }
    }

    pub fn field(&self, kind: FieldKind) -> Option<&str> {
        let value = match kind {
            FieldKind::Aircraft => &self.aircraft_id,
            FieldKind::ArrivalTime => &self.arrival_iso,
            FieldKind::DepartureTime => &self.departure_iso,
            FieldKind::Position => &self.position_info,
            FieldKind::HangarPosition => &self.hangar_position,
            FieldKind::Status => &self.status,
            FieldKind::TowStatus => &self.tow_status,
            FieldKind::Notes => &self.notes,
        };
        value.as_deref()
    }

    pub fn set_field(&mut self, kind: FieldKind, value: impl Into<String>) {
        let slot = match kind {
            FieldKind::Aircraft => &mut self.aircraft_id,
            FieldKind::ArrivalTime => &mut self.arrival_iso,
            FieldKind::DepartureTime => &mut self.departure_iso,
            FieldKind::Position => &mut self.position_info,
            FieldKind::HangarPosition => &mut self.hangar_position,
            FieldKind::Status => &mut self.status,
            FieldKind::TowStatus => &mut self.tow_status,
            FieldKind::Notes => &mut self.notes,
        };
        *slot = Some(value.into());
    }

    pub fn with_field(mut self, kind: FieldKind, value: impl Into<String>) -> Self {
        self.set_field(kind, value);
        self
    }

    /// Present fields with their element ids.
    pub fn present_fields(&self) -> impl Iterator<Item = (FieldId, &str)> + '_ {
        FieldKind::ALL.into_iter().filter_map(move |kind| {
            self.field(kind)
                .map(|value| (FieldId::new(kind, self.cell_id), value))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_writer: Option<String>,
}

/// Full shared state blob: every tile, free-form settings and the write timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    #[serde(default)]
    pub tiles: Vec<TileState>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

impl ServerSnapshot {
    pub fn new(tiles: Vec<TileState>, timestamp: Timestamp) -> Self {
        Self {
            tiles,
            settings: serde_json::Map::new(),
            metadata: SnapshotMetadata {
                timestamp,
                last_writer: None,
            },
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.metadata.timestamp
    }

    pub fn tile(&self, cell: CellId) -> Option<&TileState> {
        self.tiles.iter().find(|tile| tile.cell_id == cell)
    }
}

/// Canonical ISO local form (`YYYY-MM-DDTHH:MM`) of an arrival/departure value.
///
/// Accepts ISO itself and the compact `dd.mm.yy,HH:MM` entry form (years
/// 2000-2099). Returns `None` for anything else.
pub fn canonicalize_datetime(raw: &str) -> Option<String> {
    const ISO: &str = "%Y-%m-%dT%H:%M";
    let raw = raw.trim();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, ISO) {
        return Some(parsed.format(ISO).to_string());
    }

    let (date, time) = raw.split_once(',')?;
    let mut date_parts = date.split('.');
    let day: u32 = date_parts.next()?.parse().ok()?;
    let month: u32 = date_parts.next()?.parse().ok()?;
    let year: i32 = date_parts.next()?.parse().ok()?;
    if date_parts.next().is_some() || !(0..100).contains(&year) {
        return None;
    }
    let (hour, minute) = time.split_once(':')?;
    let date = NaiveDate::from_ymd_opt(2000 + year, month, day)?;
    let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
    Some(NaiveDateTime::new(date, time).format(ISO).to_string())
}
