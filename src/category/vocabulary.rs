//! Closed vocabulary of category values.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;

/// Fallback category for records with no recognizable value.
pub const DEFAULT_SENTINEL: &str = "Others";

/// Selector meaning "no filtering".
pub const DEFAULT_ALL: &str = "All";

/// Region names used by the job board.
pub const DEFAULT_REGIONS: [&str; 7] = ["UK", "EU", "US", "Canada", "Asia", "Australia", "Remote"];

/// A fixed, ordered set of category values plus the sentinel and "All" selector.
///
/// Canonical order is the member order followed by the sentinel. Aliases map
/// alternate spellings onto members and are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
  members: Vec<String>,
  sentinel: String,
  all: String,
  aliases: HashMap<String, usize>,
}

impl Vocabulary {
  /// Create a vocabulary from members in canonical order.
  pub fn new<I, S>(members: I, sentinel: &str, all: &str) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let members: Vec<String> = members
      .into_iter()
      .map(|m| m.into().trim().to_string())
      .collect();

    if members.is_empty() {
      return Err(eyre!("Vocabulary must have at least one member"));
    }
    for (i, member) in members.iter().enumerate() {
      if member.is_empty() {
        return Err(eyre!("Vocabulary member {} is empty", i));
      }
      if members[..i].contains(member) {
        return Err(eyre!("Duplicate vocabulary member '{}'", member));
      }
    }

    let sentinel = sentinel.trim();
    if sentinel.is_empty() || members.iter().any(|m| m == sentinel) {
      return Err(eyre!(
        "Sentinel '{}' must be non-empty and not a vocabulary member",
        sentinel
      ));
    }
    let all = all.trim();
    if all == sentinel || members.iter().any(|m| m == all) {
      return Err(eyre!("'All' selector '{}' collides with a category", all));
    }

    Ok(Self {
      members,
      sentinel: sentinel.to_string(),
      all: all.to_string(),
      aliases: HashMap::new(),
    })
  }

  /// The seven job-board regions with the default sentinel.
  pub fn regions() -> Self {
    Self {
      members: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
      sentinel: DEFAULT_SENTINEL.to_string(),
      all: DEFAULT_ALL.to_string(),
      aliases: HashMap::new(),
    }
  }

  /// Map an alternate spelling onto an existing member.
  pub fn with_alias(mut self, alias: &str, member: &str) -> Result<Self> {
    let index = self
      .members
      .iter()
      .position(|m| m == member)
      .ok_or_else(|| eyre!("Alias '{}' targets unknown member '{}'", alias, member))?;

    let alias = alias.trim().to_lowercase();
    if alias.is_empty() {
      return Err(eyre!("Alias for '{}' is empty", member));
    }
    self.aliases.insert(alias, index);
    Ok(self)
  }

  pub fn members(&self) -> &[String] {
    &self.members
  }

  pub fn sentinel(&self) -> &str {
    &self.sentinel
  }

  pub fn all(&self) -> &str {
    &self.all
  }

  /// Members followed by the sentinel.
  pub fn canonical(&self) -> impl Iterator<Item = &str> {
    self
      .members
      .iter()
      .map(String::as_str)
      .chain(std::iter::once(self.sentinel.as_str()))
  }

  /// Position in canonical order.
  pub fn position(&self, value: &str) -> Option<usize> {
    self.canonical().position(|c| c == value)
  }

  /// Resolve a whole value to its canonical spelling.
  ///
  /// Exact members and the sentinel match first, then aliases. Substring
  /// recovery is not attempted here.
  pub fn resolve(&self, value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() {
      return None;
    }
    if let Some(member) = self.members.iter().find(|m| *m == value) {
      return Some(member.as_str());
    }
    if value == self.sentinel {
      return Some(self.sentinel.as_str());
    }
    self
      .aliases
      .get(&value.to_lowercase())
      .map(|&i| self.members[i].as_str())
  }

  /// Members whose text occurs inside `value`, in canonical order.
  pub fn embedded_in<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .members
      .iter()
      .filter(move |m| value.contains(m.as_str()))
      .map(String::as_str)
  }

  /// Whether a selector means "every record".
  pub fn is_all(&self, selector: &str) -> bool {
    let selector = selector.trim();
    selector.is_empty() || selector == self.all
  }
}

impl Default for Vocabulary {
  fn default() -> Self {
    Self::regions()
  }
}
