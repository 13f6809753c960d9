//! Accessors for raw JSON-LD annotation documents.
//!
//! Store documents are loosely shaped: `target` may be a bare string, an
//! object with an `id` or `source`, or a list mixing both; collections wrap
//! their items in `items` or `first.items`. These helpers read them without
//! interpreting anything else.

use serde_json::Value as JsonValue;

/// Raw `id` of a document (`id` or JSON-LD `@id`).
pub fn raw_id(doc: &JsonValue) -> Option<&str> {
    doc.get("id")
        .or_else(|| doc.get("@id"))
        .and_then(JsonValue::as_str)
}

/// Raw target references, in document order.
pub fn raw_targets(doc: &JsonValue) -> Vec<String> {
    match doc.get("target") {
        Some(JsonValue::Array(items)) => items.iter().filter_map(target_ref).collect(),
        Some(single) => target_ref(single).into_iter().collect(),
        None => Vec::new(),
    }
}

fn target_ref(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Object(map) => map
            .get("id")
            .or_else(|| map.get("@id"))
            .or_else(|| map.get("source"))
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Whether `motivation` (string or list) or any body `purpose` equals `m`.
pub fn has_motivation_or_purpose(doc: &JsonValue, m: &str) -> bool {
    let motivated = match doc.get("motivation") {
        Some(JsonValue::String(s)) => s == m,
        Some(JsonValue::Array(items)) => items.iter().any(|v| v.as_str() == Some(m)),
        _ => false,
    };
    if motivated {
        return true;
    }
    match doc.get("body") {
        Some(JsonValue::Array(items)) => items
            .iter()
            .any(|b| b.get("purpose").and_then(JsonValue::as_str) == Some(m)),
        Some(body) => body.get("purpose").and_then(JsonValue::as_str) == Some(m),
        None => false,
    }
}

/// Items of a list response: a bare array, `items`, or `first.items`.
pub fn collection_items(doc: &JsonValue) -> Vec<JsonValue> {
    if let Some(items) = doc.as_array() {
        return items.clone();
    }
    if let Some(items) = doc.get("items").and_then(JsonValue::as_array) {
        return items.clone();
    }
    doc.get("first")
        .and_then(|f| f.get("items"))
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Whether a page announces a following page.
pub fn has_next_page(doc: &JsonValue) -> bool {
    let next = doc
        .get("next")
        .or_else(|| doc.get("first").and_then(|f| f.get("next")));
    matches!(next, Some(JsonValue::String(s)) if !s.is_empty())
        || matches!(next, Some(JsonValue::Object(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_targets_shapes() {
        assert_eq!(raw_targets(&json!({"target": "a"})), vec!["a"]);
        assert_eq!(
            raw_targets(&json!({"target": ["a", {"id": "b"}, {"source": "c"}, 7]})),
            vec!["a", "b", "c"]
        );
        assert!(raw_targets(&json!({})).is_empty());
    }

    #[test]
    fn test_motivation_or_purpose() {
        let doc = json!({"motivation": "linking", "body": [{"purpose": "geotagging"}]});
        assert!(has_motivation_or_purpose(&doc, "linking"));
        assert!(has_motivation_or_purpose(&doc, "geotagging"));
        assert!(!has_motivation_or_purpose(&doc, "iconography"));
        let listed = json!({"motivation": ["commenting", "linking"]});
        assert!(has_motivation_or_purpose(&listed, "linking"));
    }

    #[test]
    fn test_collection_items_and_next() {
        let page = json!({"items": [{"id": "a"}], "next": "https://s/c?page=1"});
        assert_eq!(collection_items(&page).len(), 1);
        assert!(has_next_page(&page));

        let collection = json!({"first": {"items": [{"id": "a"}, {"id": "b"}]}});
        assert_eq!(collection_items(&collection).len(), 2);
        assert!(!has_next_page(&collection));

        assert_eq!(collection_items(&json!([1, 2, 3])).len(), 3);
    }
}
