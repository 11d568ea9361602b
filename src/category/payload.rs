//! Normalization of record-shaped JSON payloads.

use serde_json::Value;
use std::sync::Arc;

use super::filter::CategoricalRecord;
use super::normalize::{normalize, RawCategories};
use super::vocabulary::Vocabulary;

/// Object members that commonly wrap a record list in API responses.
const ENVELOPE_KEYS: [&str; 4] = ["data", "items", "records", "results"];

/// Rewrites the categorical field of every record in a payload.
///
/// A payload is either a list of record objects or an object whose envelope
/// member holds that list. Other payloads pass through unchanged.
#[derive(Debug, Clone)]
pub struct PayloadNormalizer {
  vocabulary: Arc<Vocabulary>,
  field: String,
  id_field: String,
}

impl PayloadNormalizer {
  pub fn new(vocabulary: Arc<Vocabulary>, field: &str) -> Self {
    Self {
      vocabulary,
      field: field.to_string(),
      id_field: "id".to_string(),
    }
  }

  pub fn with_id_field(mut self, id_field: &str) -> Self {
    self.id_field = id_field.to_string();
    self
  }

  pub fn vocabulary(&self) -> &Vocabulary {
    &self.vocabulary
  }

  /// Replace each record's categorical field with its cleaned list.
  pub fn normalize(&self, mut payload: Value) -> Value {
    if let Some(records) = record_list_mut(&mut payload) {
      for record in records.iter_mut() {
        if let Value::Object(fields) = record {
          let raw = RawCategories::from_json(fields.get(&self.field));
          let cleaned = normalize(&raw, &self.vocabulary);
          fields.insert(
            self.field.clone(),
            Value::Array(cleaned.into_iter().map(Value::String).collect()),
          );
        }
      }
    }
    payload
  }

  /// Extract cleaned records from a payload. Records without an id are
  /// identified by their position.
  pub fn records(&self, payload: &Value) -> Vec<CategoricalRecord> {
    let Some(records) = record_list(payload) else {
      return Vec::new();
    };

    records
      .iter()
      .enumerate()
      .filter_map(|(position, record)| {
        let fields = record.as_object()?;
        let id = match fields.get(&self.id_field) {
          Some(Value::String(s)) => s.clone(),
          Some(Value::Number(n)) => n.to_string(),
          _ => position.to_string(),
        };
        let raw = RawCategories::from_json(fields.get(&self.field));
        Some(CategoricalRecord::new(id, &raw, &self.vocabulary))
      })
      .collect()
  }
}

fn record_list(payload: &Value) -> Option<&Vec<Value>> {
  match payload {
    Value::Array(records) => Some(records),
    Value::Object(fields) => ENVELOPE_KEYS
      .iter()
      .find_map(|key| fields.get(*key).and_then(Value::as_array)),
    _ => None,
  }
}

fn record_list_mut(payload: &mut Value) -> Option<&mut Vec<Value>> {
  match payload {
    Value::Array(records) => Some(records),
    Value::Object(fields) => {
      let key = ENVELOPE_KEYS
        .iter()
        .find(|key| fields.get(**key).is_some_and(Value::is_array))?;
      fields.get_mut(*key).and_then(Value::as_array_mut)
    }
    _ => None,
  }
}
