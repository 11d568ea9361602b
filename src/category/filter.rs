//! Aggregate queries over categorized records: unique values, filtering, counts.

use serde::Serialize;

use super::normalize::{normalize, RawCategories};
use super::vocabulary::Vocabulary;

/// A record whose categories have been cleaned against a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoricalRecord {
  pub id: String,
  pub categories: Vec<String>,
}

impl CategoricalRecord {
  /// Build a record, cleaning the raw categories.
  pub fn new(id: impl Into<String>, raw: &RawCategories, vocabulary: &Vocabulary) -> Self {
    Self {
      id: id.into(),
      categories: normalize(raw, vocabulary),
    }
  }
}

/// Anything that carries a categorical field.
pub trait Categorized {
  fn raw_categories(&self) -> RawCategories;
}

impl Categorized for CategoricalRecord {
  fn raw_categories(&self) -> RawCategories {
    RawCategories::Many(self.categories.clone())
  }
}

/// Number of records per category, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
  entries: Vec<CategoryCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
  pub category: String,
  pub count: usize,
}

impl CategoryCounts {
  pub fn get(&self, category: &str) -> usize {
    self
      .entries
      .iter()
      .find(|e| e.category == category)
      .map(|e| e.count)
      .unwrap_or(0)
  }

  pub fn iter(&self) -> impl Iterator<Item = &CategoryCount> {
    self.entries.iter()
  }

  /// Sum over all counters. Equals the total number of memberships, not records.
  pub fn total(&self) -> usize {
    self.entries.iter().map(|e| e.count).sum()
  }
}

/// Aggregate queries over records with a multi-valued categorical field.
///
/// Every query cleans each record's categories first, so callers may pass
/// records straight from upstream.
#[derive(Debug, Clone, Copy)]
pub struct CategoryFilter<'v> {
  vocabulary: &'v Vocabulary,
}

impl<'v> CategoryFilter<'v> {
  pub fn new(vocabulary: &'v Vocabulary) -> Self {
    Self { vocabulary }
  }

  fn cleaned<T: Categorized>(&self, item: &T) -> Vec<String> {
    normalize(&item.raw_categories(), self.vocabulary)
  }

  /// Categories that occur in `items`, in canonical order.
  pub fn unique_values<T: Categorized>(&self, items: &[T]) -> Vec<String> {
    let mut seen = vec![false; self.vocabulary.canonical().count()];
    for item in items {
      for category in self.cleaned(item) {
        if let Some(i) = self.vocabulary.position(&category) {
          seen[i] = true;
        }
      }
    }

    self
      .vocabulary
      .canonical()
      .zip(seen)
      .filter(|(_, seen)| *seen)
      .map(|(category, _)| category.to_string())
      .collect()
  }

  /// Filter items by a category.
  /// - `None`, empty, or the "All" selector returns every item
  /// - anything else keeps items whose cleaned categories contain it
  pub fn filter<'a, T: Categorized>(&self, items: &'a [T], selected: Option<&str>) -> Vec<&'a T> {
    let selected = match selected {
      Some(s) if !self.vocabulary.is_all(s) => s,
      _ => return items.iter().collect(),
    };
    let Some(selected) = self.vocabulary.resolve(selected) else {
      return Vec::new();
    };

    items
      .iter()
      .filter(|item| self.cleaned(*item).iter().any(|c| c == selected))
      .collect()
  }

  /// Count records per category. A record in k categories adds one to each of
  /// k counters.
  pub fn counts<T: Categorized>(&self, items: &[T]) -> CategoryCounts {
    let mut entries: Vec<CategoryCount> = self
      .vocabulary
      .canonical()
      .map(|category| CategoryCount {
        category: category.to_string(),
        count: 0,
      })
      .collect();

    for item in items {
      for category in self.cleaned(item) {
        if let Some(i) = self.vocabulary.position(&category) {
          entries[i].count += 1;
        }
      }
    }

    CategoryCounts { entries }
  }
}
