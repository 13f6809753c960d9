//! Core data models for annolink.
//!
//! These types are shared across all annolink crates. A [`LinkingAnnotation`]
//! groups several primary annotations (recognized text, classified icons)
//! into one place mention, optionally enriched with a map point and a geotag.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::fmt;

use crate::defaults;
use crate::error::{Error, Result};
use crate::ids::AnnotationId;

// =============================================================================
// AGENTS
// =============================================================================

/// Creator of an annotation or body entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Agent {
    pub fn person(id: Option<String>, label: Option<String>) -> Self {
        Self {
            id,
            kind: "Person".to_string(),
            label,
        }
    }

    /// Sentinel creator for records that never recorded one.
    pub fn unknown_person() -> Self {
        Self::person(None, Some(defaults::UNKNOWN_CREATOR_LABEL.to_string()))
    }

    pub fn is_unknown(&self) -> bool {
        self.id.is_none() && self.label.as_deref() == Some(defaults::UNKNOWN_CREATOR_LABEL)
    }
}

// =============================================================================
// BODY ENTRIES
// =============================================================================

/// Pixel point on the source map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSelector {
    #[serde(rename = "type")]
    pub kind: String,
    pub x: f64,
    pub y: f64,
}

impl PointSelector {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            kind: defaults::POINT_SELECTOR.to_string(),
            x,
            y,
        }
    }
}

/// `selecting` body: where on the map the place mention sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSelection {
    #[serde(rename = "type")]
    pub kind: String,
    /// Canvas the point refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<JsonValue>,
    pub selector: PointSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl PointSelection {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            kind: defaults::SPECIFIC_RESOURCE.to_string(),
            source: None,
            selector: PointSelector::new(x, y),
            creator: None,
            created: None,
        }
    }

    /// Whether two selections point at the same pixel within `tolerance`.
    pub fn same_point(&self, other: &PointSelection, tolerance: f64) -> bool {
        (self.selector.x - other.selector.x).abs() <= tolerance
            && (self.selector.y - other.selector.y).abs() <= tolerance
    }
}

/// GeoJSON-like geometry of a geotag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: JsonValue,
}

/// Geotag source: a feature with geometry and descriptive properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
}

/// `geotagging` body: real-world location of the place mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geotag {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: GeoSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Geotag {
    /// Point geotag at `[lon, lat]` with a display label.
    pub fn point(lon: f64, lat: f64, label: &str) -> Self {
        let mut properties = Map::new();
        properties.insert("title".to_string(), JsonValue::String(label.to_string()));
        Self {
            kind: defaults::SPECIFIC_RESOURCE.to_string(),
            source: GeoSource {
                id: None,
                kind: "Feature".to_string(),
                geometry: Geometry {
                    kind: defaults::DEFAULT_GEOMETRY_TYPE.to_string(),
                    coordinates: serde_json::json!([lon, lat]),
                },
                properties,
            },
            creator: None,
            created: None,
        }
    }
}

/// `identifying` body: reference to an external place concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Agent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Purpose tag of a body entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Selecting,
    Geotagging,
    Identifying,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Selecting => "selecting",
            Purpose::Geotagging => "geotagging",
            Purpose::Identifying => "identifying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "selecting" => Some(Purpose::Selecting),
            "geotagging" => Some(Purpose::Geotagging),
            "identifying" => Some(Purpose::Identifying),
            _ => None,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One body entry of a linking annotation, tagged by purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "lowercase")]
pub enum BodyEntry {
    Selecting(PointSelection),
    Geotagging(Geotag),
    Identifying(PlaceReference),
}

impl BodyEntry {
    pub fn purpose(&self) -> Purpose {
        match self {
            BodyEntry::Selecting(_) => Purpose::Selecting,
            BodyEntry::Geotagging(_) => Purpose::Geotagging,
            BodyEntry::Identifying(_) => Purpose::Identifying,
        }
    }

    /// `selecting` and `geotagging` entries give a single-target annotation
    /// value of its own.
    pub fn is_enhancement(&self) -> bool {
        matches!(self, BodyEntry::Selecting(_) | BodyEntry::Geotagging(_))
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        match self {
            BodyEntry::Selecting(b) => b.created,
            BodyEntry::Geotagging(b) => b.created,
            BodyEntry::Identifying(b) => b.created,
        }
    }
}

// =============================================================================
// CONTENT TYPES
// =============================================================================

/// Kind of content a linking annotation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Groups two or more targets.
    Linking,
    /// Carries a geotag body.
    Geotagging,
    /// Carries a map point body.
    PointSelection,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Linking => "linking",
            ContentType::Geotagging => "geotagging",
            ContentType::PointSelection => "point_selection",
        }
    }

    pub fn is_enhancement(&self) -> bool {
        !matches!(self, ContentType::Linking)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// LINKING ANNOTATION
// =============================================================================

/// A record grouping primary annotations into one place mention.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkingAnnotation {
    /// Assigned by the store on creation.
    pub id: Option<AnnotationId>,
    /// Ordered targets; order is the reading sequence.
    pub targets: Vec<AnnotationId>,
    pub body: Vec<BodyEntry>,
    /// Body entries that could not be classified, written back verbatim.
    pub unclassified_body: Vec<JsonValue>,
    pub creator: Agent,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Top-level JSON-LD keys the engine does not interpret.
    pub extra: Map<String, JsonValue>,
}

impl LinkingAnnotation {
    pub fn new(targets: Vec<AnnotationId>, body: Vec<BodyEntry>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            targets,
            body,
            unclassified_body: Vec::new(),
            creator: Agent::unknown_person(),
            created: now,
            modified: now,
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: AnnotationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_creator(mut self, creator: Agent) -> Self {
        self.creator = creator;
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self.modified = created;
        self
    }

    /// Id for logs and error messages; new annotations have none yet.
    pub fn display_id(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "(unsaved)".to_string())
    }

    pub fn has_enhancement(&self) -> bool {
        self.body.iter().any(BodyEntry::is_enhancement)
    }

    pub fn point_selection(&self) -> Option<&PointSelection> {
        self.body.iter().find_map(|b| match b {
            BodyEntry::Selecting(p) => Some(p),
            _ => None,
        })
    }

    pub fn geotag(&self) -> Option<&Geotag> {
        self.body.iter().find_map(|b| match b {
            BodyEntry::Geotagging(g) => Some(g),
            _ => None,
        })
    }

    pub fn content_types(&self) -> BTreeSet<ContentType> {
        let mut types = BTreeSet::new();
        if self.targets.len() > 1 {
            types.insert(ContentType::Linking);
        }
        for entry in &self.body {
            match entry {
                BodyEntry::Geotagging(_) => {
                    types.insert(ContentType::Geotagging);
                }
                BodyEntry::Selecting(_) => {
                    types.insert(ContentType::PointSelection);
                }
                BodyEntry::Identifying(_) => {}
            }
        }
        types
    }

    pub fn target_set(&self) -> BTreeSet<&AnnotationId> {
        self.targets.iter().collect()
    }

    pub fn targets_include(&self, id: &AnnotationId) -> bool {
        self.targets.contains(id)
    }

    /// Check the structural invariants every persisted record must satisfy.
    pub fn check_invariants(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::InvalidAnnotation(format!(
                "{} has no targets",
                self.display_id()
            )));
        }
        if self.target_set().len() != self.targets.len() {
            return Err(Error::InvalidAnnotation(format!(
                "{} lists a target more than once",
                self.display_id()
            )));
        }
        if self.targets.len() < 2 && !self.has_enhancement() {
            return Err(Error::InvalidAnnotation(format!(
                "{} has a single target and no point or geotag body",
                self.display_id()
            )));
        }
        let selecting = self
            .body
            .iter()
            .filter(|b| b.purpose() == Purpose::Selecting)
            .count();
        if selecting > 1 {
            return Err(Error::InvalidAnnotation(format!(
                "{} carries {} point selections",
                self.display_id(),
                selecting
            )));
        }
        Ok(())
    }

    /// Serialize to the store's JSON-LD shape.
    ///
    /// A single target is written as a bare reference rather than a
    /// one-element list; the store and older clients expect that form.
    pub fn to_document(&self) -> Result<JsonValue> {
        let mut doc = self.extra.clone();
        doc.entry("@context".to_string())
            .or_insert_with(|| JsonValue::String(defaults::ANNOTATION_CONTEXT.to_string()));
        doc.insert(
            "type".to_string(),
            JsonValue::String("Annotation".to_string()),
        );
        if let Some(id) = &self.id {
            doc.insert("id".to_string(), JsonValue::String(id.to_string()));
        }
        doc.insert(
            "motivation".to_string(),
            JsonValue::String(defaults::LINKING_MOTIVATION.to_string()),
        );

        let target = match self.targets.as_slice() {
            [single] => JsonValue::String(single.to_string()),
            many => JsonValue::Array(
                many.iter()
                    .map(|t| JsonValue::String(t.to_string()))
                    .collect(),
            ),
        };
        doc.insert("target".to_string(), target);

        let mut body = Vec::with_capacity(self.body.len() + self.unclassified_body.len());
        for entry in &self.body {
            body.push(serde_json::to_value(entry)?);
        }
        body.extend(self.unclassified_body.iter().cloned());
        doc.insert("body".to_string(), JsonValue::Array(body));

        doc.insert("creator".to_string(), serde_json::to_value(&self.creator)?);
        doc.insert("created".to_string(), JsonValue::String(format_timestamp(&self.created)));
        doc.insert(
            "modified".to_string(),
            JsonValue::String(format_timestamp(&self.modified)),
        );

        Ok(JsonValue::Object(doc))
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// STORE RECORDS
// =============================================================================

/// Opaque optimistic-concurrency token (the store's ETag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw annotation as returned by the store, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAnnotation {
    pub id: AnnotationId,
    pub document: JsonValue,
    /// Present on single-item reads; query and listing results carry none.
    pub version: Option<VersionToken>,
}

impl StoredAnnotation {
    pub fn motivation(&self) -> Option<&str> {
        self.document.get("motivation").and_then(JsonValue::as_str)
    }

    /// Whether the record is a linking annotation, including legacy
    /// geotag-only records.
    pub fn is_linking(&self) -> bool {
        matches!(
            self.motivation(),
            Some(defaults::LINKING_MOTIVATION) | Some(defaults::LEGACY_GEOTAGGING_MOTIVATION)
        )
    }

    /// The version token, or an error naming the record when absent.
    pub fn require_version(&self) -> Result<&VersionToken> {
        self.version.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("no version token returned for {}", self.id))
        })
    }
}

/// One page of the store's bulk listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<StoredAnnotation>,
    pub has_next: bool,
}
