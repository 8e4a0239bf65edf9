//! Named collections held by the local store and the typed records they accept.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// A named partition of records in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Disease,
  Location,
  Feed,
  Yield,
  Buyer,
  Stocking,
  Seed,
  Market,
  Predictions,
  Meta,
}

impl Collection {
  /// Every collection the application schema requires.
  pub const ALL: &'static [Collection] = &[
    Collection::Disease,
    Collection::Location,
    Collection::Feed,
    Collection::Yield,
    Collection::Buyer,
    Collection::Stocking,
    Collection::Seed,
    Collection::Predictions,
    Collection::Market,
    Collection::Meta,
  ];

  /// Reference datasets refreshed in bulk from the dataset provider.
  pub const REFERENCE: &'static [Collection] = &[
    Collection::Disease,
    Collection::Location,
    Collection::Feed,
    Collection::Yield,
    Collection::Buyer,
    Collection::Stocking,
    Collection::Seed,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Self::Disease => "disease",
      Self::Location => "location",
      Self::Feed => "feed",
      Self::Yield => "yield",
      Self::Buyer => "buyer",
      Self::Stocking => "stocking",
      Self::Seed => "seed",
      Self::Market => "market",
      Self::Predictions => "predictions",
      Self::Meta => "meta",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.iter().copied().find(|c| c.name() == name)
  }

  /// The metadata collection is keyed by caller-supplied strings; every other
  /// collection gets monotonically assigned identifiers.
  pub fn is_keyed(&self) -> bool {
    matches!(self, Self::Meta)
  }

  pub fn is_reference(&self) -> bool {
    Self::REFERENCE.contains(self)
  }
}

impl Serialize for Collection {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.name())
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Trait for values that can live in an auto-identifier collection.
///
/// The store checks `accepts` and `validate` before any write, so a record
/// type can never land in a collection whose callers expect another shape.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
  /// Whether this record type belongs in `collection`.
  fn accepts(collection: Collection) -> bool;

  /// Shape check run at the store boundary.
  fn validate(&self) -> Result<(), String> {
    Ok(())
  }
}

/// A record together with the identifier the store assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
  pub id: u64,
  #[serde(flatten)]
  pub record: T,
}

/// One row of a reference dataset, as served by `/api/dataset/{name}`.
///
/// Dataset rows come from CSV files on the server, so field names vary per
/// dataset; the only requirement is a non-empty JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetRow(pub serde_json::Map<String, serde_json::Value>);

impl DatasetRow {
  #[cfg(test)]
  pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
    self.0.get(field)
  }
}

impl Record for DatasetRow {
  fn accepts(collection: Collection) -> bool {
    collection.is_reference() || collection == Collection::Market
  }

  fn validate(&self) -> Result<(), String> {
    if self.0.is_empty() {
      return Err("dataset row has no fields".to_string());
    }
    if self.0.contains_key("id") {
      return Err("dataset rows must not carry their own id".to_string());
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_names_round_trip() {
    for c in Collection::ALL {
      assert_eq!(Collection::from_name(c.name()), Some(*c));
    }
    assert_eq!(Collection::from_name("nope"), None);
  }

  #[test]
  fn test_only_meta_is_keyed() {
    let keyed: Vec<_> = Collection::ALL.iter().filter(|c| c.is_keyed()).collect();
    assert_eq!(keyed, vec![&Collection::Meta]);
  }

  #[test]
  fn test_dataset_row_rejects_empty_object() {
    let row = DatasetRow(serde_json::Map::new());
    assert!(row.validate().is_err());
    assert!(DatasetRow::accepts(Collection::Feed));
    assert!(!DatasetRow::accepts(Collection::Predictions));
  }

  #[test]
  fn test_stored_flattens_record() {
    let mut fields = serde_json::Map::new();
    fields.insert("species".into(), "Salmon".into());
    let value = serde_json::to_value(Stored {
      id: 3,
      record: DatasetRow(fields),
    })
    .unwrap();
    assert_eq!(value["id"], 3);
    assert_eq!(value["species"], "Salmon");
  }
}
