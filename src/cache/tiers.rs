//! Tier naming and cache generations.

use std::fmt;

use crate::error::LifecycleError;

/// One of the three cache partitions of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
  /// Critical assets, provisioned at install
  Static,
  /// Application routes, pre-warmed at install and refreshed in the background
  Pages,
  /// Scratch tier for dynamic responses
  Runtime,
}

impl Tier {
  pub const ALL: [Tier; 3] = [Tier::Static, Tier::Pages, Tier::Runtime];

  pub fn name(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Pages => "pages",
      Self::Runtime => "runtime",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// The versioned set of tiers currently in use.
///
/// Tags follow `{version}-{tier}`. A generation owns exactly the tags that
/// start with `{version}-`, so a version must not contain `-` itself or it
/// could claim another version's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  version: String,
}

impl Generation {
  pub fn new(version: impl Into<String>) -> Result<Self, LifecycleError> {
    let version = version.into();
    if version.is_empty() || version.contains('-') {
      return Err(LifecycleError::InvalidVersion(version));
    }
    Ok(Self { version })
  }

  pub fn tag(&self, tier: Tier) -> String {
    format!("{}-{}", self.version, tier.name())
  }

  pub fn owns(&self, tag: &str) -> bool {
    tag
      .strip_prefix(self.version.as_str())
      .is_some_and(|rest| rest.starts_with('-'))
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tags() {
    let generation = Generation::new("aquav4").unwrap();
    assert_eq!(generation.tag(Tier::Static), "aquav4-static");
    assert_eq!(generation.tag(Tier::Runtime), "aquav4-runtime");
  }

  #[test]
  fn test_rejects_versions_that_could_collide() {
    assert!(matches!(
      Generation::new("aqua-offline-v4"),
      Err(LifecycleError::InvalidVersion(_))
    ));
    assert!(Generation::new("").is_err());
  }

  #[test]
  fn test_owns_matches_prefix_and_separator() {
    let generation = Generation::new("v4").unwrap();
    assert!(generation.owns("v4-static"));
    assert!(generation.owns("v4-pages"));
    assert!(!generation.owns("v40-static"));
    assert!(!generation.owns("v3-static"));
    assert!(!generation.owns("v4"));
  }
}
