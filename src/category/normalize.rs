//! Cleaning of raw categorical values into vocabulary members.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::vocabulary::Vocabulary;

/// A categorical field as it arrives from upstream.
///
/// Upstream data may carry a single string, a list, nothing at all, or a
/// corrupted concatenation of several values in one string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RawCategories {
  #[default]
  Missing,
  One(String),
  Many(Vec<String>),
}

impl RawCategories {
  /// Interpret an optional JSON value. Anything that is not a string or a list
  /// of strings is treated as missing; non-string list elements are skipped.
  pub fn from_json(value: Option<&Value>) -> Self {
    match value {
      Some(Value::String(s)) => Self::One(s.clone()),
      Some(Value::Array(items)) => Self::Many(
        items
          .iter()
          .filter_map(|item| item.as_str().map(String::from))
          .collect(),
      ),
      _ => Self::Missing,
    }
  }
}

impl From<&str> for RawCategories {
  fn from(value: &str) -> Self {
    Self::One(value.to_string())
  }
}

impl From<String> for RawCategories {
  fn from(value: String) -> Self {
    Self::One(value)
  }
}

impl From<Vec<String>> for RawCategories {
  fn from(values: Vec<String>) -> Self {
    Self::Many(values)
  }
}

impl From<Vec<&str>> for RawCategories {
  fn from(values: Vec<&str>) -> Self {
    Self::Many(values.into_iter().map(String::from).collect())
  }
}

impl<T> From<Option<T>> for RawCategories
where
  T: Into<RawCategories>,
{
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or_default()
  }
}

impl<'de> Deserialize<'de> for RawCategories {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(Self::from_json(value.as_ref()))
  }
}

impl Serialize for RawCategories {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    match self {
      Self::Missing => serializer.serialize_none(),
      Self::One(s) => serializer.serialize_str(s),
      Self::Many(items) => items.serialize(serializer),
    }
  }
}

/// Clean a raw categorical value.
///
/// The result is never empty, contains only canonical vocabulary spellings,
/// has no duplicates, and keeps discovery order. List elements must resolve as
/// whole values; a string that does not resolve is scanned for embedded
/// members. The sentinel is only kept when nothing else was recognized.
pub fn normalize(raw: &RawCategories, vocabulary: &Vocabulary) -> Vec<String> {
  let mut found: Vec<&str> = Vec::new();

  match raw {
    RawCategories::Missing => {}
    RawCategories::One(value) => match vocabulary.resolve(value) {
      Some(resolved) => push_unique(&mut found, resolved),
      None => {
        for member in vocabulary.embedded_in(value) {
          push_unique(&mut found, member);
        }
      }
    },
    RawCategories::Many(values) => {
      for value in values {
        if let Some(resolved) = vocabulary.resolve(value) {
          push_unique(&mut found, resolved);
        }
      }
    }
  }

  if found.len() > 1 {
    found.retain(|c| *c != vocabulary.sentinel());
  }
  if found.is_empty() {
    return vec![vocabulary.sentinel().to_string()];
  }
  found.into_iter().map(String::from).collect()
}

fn push_unique<'a>(found: &mut Vec<&'a str>, value: &'a str) {
  if !found.contains(&value) {
    found.push(value);
  }
}
