//! Structural normalization of raw linking annotations.
//!
//! Store documents come from several generations of editors: bodies without
//! a `purpose`, a bare object instead of a list, geotags without a geometry
//! type, coordinates typed as strings, relative target ids. [`normalize`]
//! reads any of these into a [`LinkingAnnotation`] and lists every repair it
//! made. It never performs I/O; callers persist the repaired form.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use annolink_core::document::{raw_id, raw_targets};
use annolink_core::{
    defaults, Agent, BodyEntry, Error, GeoSource, Geometry, Geotag, IdCanonicalizer,
    LinkingAnnotation, PlaceReference, PointSelection, PointSelector, Purpose, Result,
    StoredAnnotation,
};

/// Top-level keys the model interprets; everything else lands in `extra`.
const MODELED_KEYS: &[&str] = &[
    "id", "@id", "type", "motivation", "target", "body", "creator", "created", "modified",
];

/// Result of normalizing one raw annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAnnotation {
    pub annotation: LinkingAnnotation,
    /// Human-readable description of each repair.
    pub issues: Vec<String>,
    pub needs_repair: bool,
    /// Entries removed from the body (superseded point selections).
    pub dropped: Vec<JsonValue>,
}

/// Total classification of one raw body entry.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyClassification {
    Selecting(PointSelection),
    Geotagging(Geotag),
    Identifying(PlaceReference),
    Unclassifiable(String),
}

impl BodyClassification {
    pub fn into_entry(self) -> std::result::Result<BodyEntry, String> {
        match self {
            BodyClassification::Selecting(p) => Ok(BodyEntry::Selecting(p)),
            BodyClassification::Geotagging(g) => Ok(BodyEntry::Geotagging(g)),
            BodyClassification::Identifying(r) => Ok(BodyEntry::Identifying(r)),
            BodyClassification::Unclassifiable(reason) => Err(reason),
        }
    }
}

/// Classify a body entry, returning the repairs applied along the way.
pub fn classify_body(entry: &JsonValue) -> (BodyClassification, Vec<String>) {
    let mut issues = Vec::new();
    let Some(map) = entry.as_object() else {
        return (
            BodyClassification::Unclassifiable("body entry is not an object".to_string()),
            issues,
        );
    };

    let purpose = match map.get("purpose").and_then(JsonValue::as_str) {
        Some(raw) => match Purpose::parse(raw) {
            Some(p) => p,
            None => {
                return (
                    BodyClassification::Unclassifiable(format!("unsupported purpose '{}'", raw)),
                    issues,
                )
            }
        },
        None => match infer_purpose(map) {
            Some(p) => {
                issues.push(format!("purpose inferred as {}", p));
                p
            }
            None => {
                return (
                    BodyClassification::Unclassifiable(
                        "no purpose, point selector or source".to_string(),
                    ),
                    issues,
                )
            }
        },
    };

    let kind = match map.get("type").and_then(JsonValue::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            issues.push(format!("type inferred as {}", defaults::SPECIFIC_RESOURCE));
            defaults::SPECIFIC_RESOURCE.to_string()
        }
    };
    let creator = map.get("creator").and_then(parse_agent);
    let created = parse_time(map.get("created"));

    let classification = match purpose {
        Purpose::Selecting => selecting(map, kind, creator, created, &mut issues),
        Purpose::Geotagging => geotagging(map, kind, creator, created, &mut issues),
        Purpose::Identifying => match map.get("source") {
            Some(source) if !source.is_null() => {
                BodyClassification::Identifying(PlaceReference {
                    kind,
                    source: source.clone(),
                    creator,
                    created,
                })
            }
            _ => BodyClassification::Unclassifiable("identifying entry without source".to_string()),
        },
    };
    (classification, issues)
}

fn infer_purpose(map: &Map<String, JsonValue>) -> Option<Purpose> {
    if map.get("selector").map_or(false, looks_like_point) {
        return Some(Purpose::Selecting);
    }
    let source = map.get("source")?;
    if source.get("geometry").is_some() || source.get("coordinates").is_some() {
        Some(Purpose::Geotagging)
    } else {
        Some(Purpose::Identifying)
    }
}

fn looks_like_point(selector: &JsonValue) -> bool {
    selector.get("type").and_then(JsonValue::as_str) == Some(defaults::POINT_SELECTOR)
        || (selector.get("x").is_some() && selector.get("y").is_some())
}

fn selecting(
    map: &Map<String, JsonValue>,
    kind: String,
    creator: Option<Agent>,
    created: Option<DateTime<Utc>>,
    issues: &mut Vec<String>,
) -> BodyClassification {
    let Some(selector) = map.get("selector").and_then(JsonValue::as_object) else {
        return BodyClassification::Unclassifiable("selecting entry without selector".to_string());
    };

    match selector.get("type").and_then(JsonValue::as_str) {
        Some(defaults::POINT_SELECTOR) => {}
        other => issues.push(format!(
            "selector type {} forced to {}",
            other.unwrap_or("(missing)"),
            defaults::POINT_SELECTOR
        )),
    }

    let (Some((x, coerced_x)), Some((y, coerced_y))) =
        (coerce_number(selector.get("x")), coerce_number(selector.get("y")))
    else {
        let reason = "point selector without numeric x/y".to_string();
        issues.push(reason.clone());
        return BodyClassification::Unclassifiable(reason);
    };
    if coerced_x || coerced_y {
        issues.push("point coordinates coerced from strings".to_string());
    }

    BodyClassification::Selecting(PointSelection {
        kind,
        source: map.get("source").cloned(),
        selector: PointSelector::new(x, y),
        creator,
        created,
    })
}

fn geotagging(
    map: &Map<String, JsonValue>,
    kind: String,
    creator: Option<Agent>,
    created: Option<DateTime<Utc>>,
    issues: &mut Vec<String>,
) -> BodyClassification {
    let Some(source) = map.get("source").and_then(JsonValue::as_object) else {
        return BodyClassification::Unclassifiable("geotagging entry without source".to_string());
    };

    let geometry = match source.get("geometry") {
        Some(JsonValue::Object(g)) => {
            let geometry_kind = match g.get("type").and_then(JsonValue::as_str) {
                Some(t) => t.to_string(),
                None => {
                    issues.push(format!(
                        "geometry type set to {}",
                        defaults::DEFAULT_GEOMETRY_TYPE
                    ));
                    defaults::DEFAULT_GEOMETRY_TYPE.to_string()
                }
            };
            g.get("coordinates").cloned().map(|coordinates| Geometry {
                kind: geometry_kind,
                coordinates,
            })
        }
        _ => source.get("coordinates").cloned().map(|coordinates| {
            issues.push("coordinates moved into a geometry block".to_string());
            Geometry {
                kind: defaults::DEFAULT_GEOMETRY_TYPE.to_string(),
                coordinates,
            }
        }),
    };
    let Some(geometry) = geometry else {
        return BodyClassification::Unclassifiable("geotag without coordinates".to_string());
    };

    let properties = match source.get("properties") {
        Some(JsonValue::Object(p)) => p.clone(),
        _ => {
            issues.push("geotag properties synthesized".to_string());
            let label = ["label", "title", "preferredTerm"]
                .iter()
                .find_map(|key| source.get(*key).or_else(|| map.get(*key)))
                .cloned();
            let mut properties = Map::new();
            if let Some(label) = label {
                properties.insert("title".to_string(), label);
            }
            properties
        }
    };

    BodyClassification::Geotagging(Geotag {
        kind,
        source: GeoSource {
            id: source
                .get("id")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            kind: source
                .get("type")
                .and_then(JsonValue::as_str)
                .unwrap_or("Feature")
                .to_string(),
            geometry,
            properties,
        },
        creator,
        created,
    })
}

/// Numeric value of `value`, and whether it had to be parsed from a string.
fn coerce_number(value: Option<&JsonValue>) -> Option<(f64, bool)> {
    match value? {
        JsonValue::Number(n) => n.as_f64().map(|f| (f, false)),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| (f, true)),
        _ => None,
    }
}

fn parse_agent(value: &JsonValue) -> Option<Agent> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(Agent::person(Some(s.clone()), None)),
        JsonValue::Object(map) => {
            let id = map
                .get("id")
                .or_else(|| map.get("@id"))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let label = map
                .get("label")
                .or_else(|| map.get("name"))
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            if id.is_none() && label.is_none() {
                return None;
            }
            Some(Agent {
                id,
                kind: map
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("Person")
                    .to_string(),
                label,
            })
        }
        _ => None,
    }
}

fn parse_time(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    value
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Normalize a raw annotation document using the current time for missing
/// timestamps.
pub fn normalize(raw: &JsonValue, ids: &IdCanonicalizer) -> Result<NormalizedAnnotation> {
    normalize_at(raw, ids, Utc::now())
}

/// Normalize a store record; the record id wins when the document has none.
pub fn normalize_stored(
    stored: &StoredAnnotation,
    ids: &IdCanonicalizer,
) -> Result<NormalizedAnnotation> {
    let mut normalized = normalize(&stored.document, ids)?;
    if normalized.annotation.id.is_none() {
        normalized.annotation.id = Some(stored.id.clone());
    }
    Ok(normalized)
}

/// Normalize with an explicit clock.
pub fn normalize_at(
    raw: &JsonValue,
    ids: &IdCanonicalizer,
    now: DateTime<Utc>,
) -> Result<NormalizedAnnotation> {
    let Some(doc) = raw.as_object() else {
        return Err(Error::InvalidAnnotation(
            "annotation is not a JSON object".to_string(),
        ));
    };
    let mut issues = Vec::new();

    if doc.get("type").and_then(JsonValue::as_str) != Some("Annotation") {
        issues.push("type set to Annotation".to_string());
    }
    match doc.get("motivation") {
        Some(JsonValue::String(m)) if m == defaults::LINKING_MOTIVATION => {}
        Some(JsonValue::String(m)) if m == defaults::LEGACY_GEOTAGGING_MOTIVATION => {
            issues.push("legacy geotagging motivation rewritten to linking".to_string())
        }
        Some(other) => issues.push(format!("motivation {} rewritten to linking", other)),
        None => issues.push("missing motivation set to linking".to_string()),
    }

    let id = raw_id(raw).and_then(|r| ids.canonicalize(r));

    let mut targets = Vec::new();
    let mut canonicalized = 0usize;
    for raw_target in raw_targets(raw) {
        match ids.canonicalize(&raw_target) {
            Some(target) if targets.contains(&target) => {
                issues.push(format!("duplicate target {} removed", target))
            }
            Some(target) => {
                if target.as_str() != raw_target {
                    canonicalized += 1;
                }
                targets.push(target);
            }
            None => issues.push("blank target reference removed".to_string()),
        }
    }
    if canonicalized > 0 {
        issues.push(format!("{} target id(s) canonicalized", canonicalized));
    }
    if targets.is_empty() {
        issues.push("annotation has no targets".to_string());
    }

    let entries: Vec<JsonValue> = match doc.get("body") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items.clone(),
        Some(single) => {
            issues.push("body wrapped into a list".to_string());
            vec![single.clone()]
        }
    };

    let mut classified: Vec<(BodyEntry, &JsonValue)> = Vec::new();
    let mut unclassified_body = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        let (classification, entry_issues) = classify_body(entry);
        issues.extend(entry_issues.into_iter().map(|m| format!("body[{}]: {}", i, m)));
        match classification.into_entry() {
            Ok(body_entry) => classified.push((body_entry, entry)),
            Err(reason) => {
                debug!(index = i, reason = %reason, "Keeping unclassifiable body entry verbatim");
                unclassified_body.push(entry.clone());
            }
        }
    }

    let last_selecting = classified
        .iter()
        .rposition(|(entry, _)| entry.purpose() == Purpose::Selecting);
    let mut body = Vec::with_capacity(classified.len());
    let mut dropped = Vec::new();
    for (i, (entry, raw_entry)) in classified.into_iter().enumerate() {
        if entry.purpose() == Purpose::Selecting && Some(i) != last_selecting {
            issues.push("superseded point selection removed".to_string());
            dropped.push(raw_entry.clone());
        } else {
            body.push(entry);
        }
    }

    let creator = match doc.get("creator").and_then(parse_agent) {
        Some(agent) => agent,
        None => {
            issues.push("missing creator set to unknown person".to_string());
            Agent::unknown_person()
        }
    };
    let created = parse_time(doc.get("created")).unwrap_or_else(|| {
        issues.push("missing created timestamp set to now".to_string());
        now
    });
    let modified = parse_time(doc.get("modified")).unwrap_or_else(|| {
        issues.push("missing modified timestamp set to now".to_string());
        now
    });

    let extra: Map<String, JsonValue> = doc
        .iter()
        .filter(|(key, _)| !MODELED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let annotation = LinkingAnnotation {
        id,
        targets,
        body,
        unclassified_body,
        creator,
        created,
        modified,
        extra,
    };

    Ok(NormalizedAnnotation {
        needs_repair: !issues.is_empty(),
        annotation,
        issues,
        dropped,
    })
}
