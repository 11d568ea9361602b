//! Normalization of multi-valued categorical fields.
//!
//! Upstream records carry a categorical field (e.g. a job's region) that may be
//! a string, a list, missing, or several values corrupted into one string. This
//! module cleans such values into a closed vocabulary and provides the
//! aggregate queries built on top:
//! - unique values in canonical order
//! - filtering by a selected category
//! - per-category counts with multi-membership

mod filter;
mod normalize;
mod payload;
mod vocabulary;

pub use filter::{CategoricalRecord, Categorized, CategoryCount, CategoryCounts, CategoryFilter};
pub use normalize::{normalize, RawCategories};
pub use payload::PayloadNormalizer;
pub use vocabulary::{Vocabulary, DEFAULT_ALL, DEFAULT_REGIONS, DEFAULT_SENTINEL};
