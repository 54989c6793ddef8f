//! Decomposition of composite input documents into per-kind records

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use stratum_ir::Record;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Input is not a JSON object")]
    NotAnObject,

    #[error("Object has no 'type'")]
    MissingType,

    #[error("Observation '{envelope}' has malformed objects: {reason}")]
    MalformedObjects { envelope: String, reason: String },
}

/// Turns one composite document into `(kind, record)` pairs
pub trait RecordSplitter: Send + Sync {
    fn decompose(&self, document: &Json) -> Result<Vec<(String, Record)>, SplitError>;
}

const TIMESTAMP_FIELDS: &[&str] = &["first_observed", "last_observed", "created", "modified"];

/// Splitter for bundles and observation envelopes.
///
/// An `observed-data` envelope yields one record per contained observable
/// plus one for the envelope itself. Observables inherit the envelope's
/// observation window, point back at it through `x_contained_by_ref`, and
/// get a content-derived id when they have none. Index references
/// (`src_ref: "0"`) are rewritten to the referenced observable's id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObservationSplitter;

impl ObservationSplitter {
    pub fn new() -> Self {
        Self
    }

    fn split_into(&self, document: &Json, out: &mut Vec<(String, Record)>) -> Result<(), SplitError> {
        let object = document.as_object().ok_or(SplitError::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(Json::as_str)
            .ok_or(SplitError::MissingType)?;

        match kind {
            "bundle" => {
                if let Some(objects) = object.get("objects").and_then(Json::as_array) {
                    for item in objects {
                        self.split_into(item, out)?;
                    }
                }
                Ok(())
            }
            "observed-data" => self.split_observation(object, out),
            _ => {
                out.push((kind.to_string(), to_record(object)));
                Ok(())
            }
        }
    }

    fn split_observation(
        &self,
        envelope: &Map<String, Json>,
        out: &mut Vec<(String, Record)>,
    ) -> Result<(), SplitError> {
        let envelope_id = match envelope.get("id").and_then(Json::as_str) {
            Some(id) => id.to_string(),
            None => deterministic_id("observed-data", envelope),
        };

        let observables = indexed_objects(&envelope_id, envelope.get("objects"))?;

        // index -> id, needed before any reference can be resolved
        let mut ids = Vec::with_capacity(observables.len());
        for (index, object) in &observables {
            let kind = object
                .get("type")
                .and_then(Json::as_str)
                .ok_or(SplitError::MissingType)?;
            let id = match object.get("id").and_then(Json::as_str) {
                Some(id) => id.to_string(),
                None => deterministic_id(kind, &without_refs(object)),
            };
            ids.push((index.clone(), kind.to_string(), id));
        }
        let id_of = |index: &str| {
            ids.iter()
                .find(|(i, _, _)| i == index)
                .map(|(_, _, id)| id.clone())
        };

        for ((_, object), (_, kind, id)) in observables.iter().zip(&ids) {
            let mut resolved = Map::new();
            for (field, value) in object.iter() {
                resolved.insert(field.clone(), resolve_refs(field, value, &id_of));
            }
            resolved.insert("id".to_string(), Json::String(id.clone()));
            for field in ["first_observed", "last_observed", "number_observed"] {
                if let Some(value) = envelope.get(field) {
                    resolved.insert(field.to_string(), value.clone());
                }
            }
            resolved.insert(
                "x_contained_by_ref".to_string(),
                Json::String(envelope_id.clone()),
            );
            out.push((kind.clone(), to_record(&resolved)));
        }

        let mut header: Map<String, Json> = envelope
            .iter()
            .filter(|(field, _)| field.as_str() != "objects")
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        header.insert("id".to_string(), Json::String(envelope_id));
        out.push(("observed-data".to_string(), to_record(&header)));
        Ok(())
    }
}

impl RecordSplitter for ObservationSplitter {
    fn decompose(&self, document: &Json) -> Result<Vec<(String, Record)>, SplitError> {
        let mut out = Vec::new();
        self.split_into(document, &mut out)?;
        Ok(out)
    }
}

/// Observables keyed by their index, accepting the map and list encodings
fn indexed_objects(
    envelope_id: &str,
    objects: Option<&Json>,
) -> Result<Vec<(String, Map<String, Json>)>, SplitError> {
    let malformed = |reason: &str| SplitError::MalformedObjects {
        envelope: envelope_id.to_string(),
        reason: reason.to_string(),
    };

    let entries: Vec<(String, &Json)> = match objects {
        None => Vec::new(),
        Some(Json::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Some(Json::Array(list)) => list
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        Some(_) => return Err(malformed("expected an object or a list")),
    };

    entries
        .into_iter()
        .map(|(index, value)| match value {
            Json::Object(object) => Ok((index, object.clone())),
            _ => Err(malformed("observable is not an object")),
        })
        .collect()
}

fn is_ref_field(field: &str) -> bool {
    field.ends_with("_ref") || field.ends_with("_refs")
}

fn without_refs(object: &Map<String, Json>) -> Map<String, Json> {
    object
        .iter()
        .filter(|(field, _)| !is_ref_field(field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

fn resolve_refs(field: &str, value: &Json, id_of: &dyn Fn(&str) -> Option<String>) -> Json {
    if field.ends_with("_ref") {
        if let Some(id) = value.as_str().and_then(id_of) {
            return Json::String(id);
        }
    } else if field.ends_with("_refs") {
        if let Some(items) = value.as_array() {
            return Json::Array(
                items
                    .iter()
                    .map(|item| match item.as_str().and_then(id_of) {
                        Some(id) => Json::String(id),
                        None => item.clone(),
                    })
                    .collect(),
            );
        }
    }
    value.clone()
}

/// `kind--<hash>` over the canonical JSON of `object`
fn deterministic_id(kind: &str, object: &Map<String, Json>) -> String {
    // serde_json maps are sorted, so the text is canonical
    let canonical = Json::Object(object.clone()).to_string();
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}--{}", kind, &digest[..32])
}

/// Normalise a timestamp to RFC 3339 UTC with millisecond precision
pub fn normalize_timestamp(text: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn to_record(object: &Map<String, Json>) -> Record {
    let mut normalized = object.clone();
    for field in TIMESTAMP_FIELDS {
        if let Some(Json::String(text)) = normalized.get(*field) {
            if let Some(ts) = normalize_timestamp(text) {
                normalized.insert(field.to_string(), Json::String(ts));
            }
        }
    }
    Record::from_json(&Json::Object(normalized)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratum_ir::Value;

    fn observation() -> Json {
        json!({
            "type": "observed-data",
            "id": "observed-data--aaaa",
            "first_observed": "2024-03-01T10:00:00+02:00",
            "last_observed": "2024-03-01T09:00:05Z",
            "number_observed": 2,
            "objects": {
                "0": {"type": "ipv4-addr", "value": "10.0.0.1"},
                "1": {"type": "ipv4-addr", "value": "10.0.0.2"},
                "2": {
                    "type": "network-traffic",
                    "src_ref": "0",
                    "dst_ref": "1",
                    "dst_port": 443,
                    "protocols": ["tcp"],
                    "extensions": {"http-request-ext": {"request_method": "get"}}
                }
            }
        })
    }

    #[test]
    fn test_observation_is_split() {
        let records = ObservationSplitter.decompose(&observation()).unwrap();
        let kinds: Vec<&str> = records.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["ipv4-addr", "ipv4-addr", "network-traffic", "observed-data"]
        );

        let (_, addr) = &records[0];
        assert!(addr.id().unwrap().starts_with("ipv4-addr--"));
        assert_eq!(
            addr.get("first_observed"),
            Some(&Value::from("2024-03-01T08:00:00.000Z"))
        );
        assert_eq!(addr.get("number_observed"), Some(&Value::Int(2)));
        assert_eq!(
            addr.get("x_contained_by_ref"),
            Some(&Value::from("observed-data--aaaa"))
        );

        let (_, traffic) = &records[2];
        assert_eq!(
            traffic.get("src_ref").and_then(Value::as_str),
            records[0].1.id()
        );
        assert_eq!(
            traffic.get("dst_ref").and_then(Value::as_str),
            records[1].1.id()
        );
        assert_eq!(
            traffic.get("extensions.http-request-ext.request_method"),
            Some(&Value::from("get"))
        );

        let (_, envelope) = &records[3];
        assert_eq!(envelope.id(), Some("observed-data--aaaa"));
        assert!(!envelope.contains("objects"));
    }

    #[test]
    fn test_ids_are_deterministic() {
        let a = ObservationSplitter.decompose(&observation()).unwrap();
        let b = ObservationSplitter.decompose(&observation()).unwrap();
        assert_eq!(a[2].1.id(), b[2].1.id());
        assert_ne!(a[0].1.id(), a[1].1.id());
    }

    #[test]
    fn test_bundle_and_list_objects() {
        let bundle = json!({
            "type": "bundle",
            "id": "bundle--1",
            "objects": [
                {"type": "identity", "id": "identity--1", "name": "sensor"},
                {
                    "type": "observed-data",
                    "id": "observed-data--b",
                    "number_observed": 1,
                    "objects": [{"type": "domain-name", "value": "example.com", "resolves_to_refs": ["1"]},
                                {"type": "ipv4-addr", "id": "ipv4-addr--fixed", "value": "1.2.3.4"}]
                }
            ]
        });

        let records = ObservationSplitter.decompose(&bundle).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].0, "identity");
        let (_, domain) = &records[1];
        assert_eq!(
            domain.get("resolves_to_refs"),
            Some(&Value::Array(vec![Value::from("ipv4-addr--fixed")]))
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            ObservationSplitter.decompose(&json!("text")),
            Err(SplitError::NotAnObject)
        ));
        assert!(matches!(
            ObservationSplitter.decompose(&json!({"value": 1})),
            Err(SplitError::MissingType)
        ));
        assert!(matches!(
            ObservationSplitter.decompose(&json!({"type": "observed-data", "objects": 5})),
            Err(SplitError::MalformedObjects { .. })
        ));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2024-03-01T10:00:00.5+01:00").as_deref(),
            Some("2024-03-01T09:00:00.500Z")
        );
        assert_eq!(normalize_timestamp("yesterday"), None);
    }
}
