//! Identifiers: stable item ids and mutable hierarchical names.
//!
//! Everything that is stored on disk or cached in memory is keyed by
//! [`ResourceId`]. A [`FullName`] is only a lookup key into the item
//! registry and may change at any time through a rename or a move.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// A unique identifier for any resource in the system.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Slash-separated name of an item, e.g. `folder/sub/project`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct FullName(String);

impl FullName {
    /// Parse a full name, validating every segment.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim_matches('/');
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("item name must not be empty".to_string()));
        }
        for segment in trimmed.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Name of the item itself, without its containers.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Full name of the containing folder, `None` for top-level items.
    pub fn parent(&self) -> Option<FullName> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| FullName(parent.to_string()))
    }

    /// Name of a direct child of this item.
    pub fn child(&self, name: &str) -> Result<FullName> {
        validate_segment(name)?;
        Ok(FullName(format!("{}/{}", self.0, name)))
    }

    /// Join an optional parent with a segment.
    pub fn within(parent: Option<&FullName>, name: &str) -> Result<FullName> {
        match parent {
            Some(parent) => parent.child(name),
            None => {
                validate_segment(name)?;
                Ok(FullName(name.to_string()))
            }
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// True when `self` equals `other` or lives somewhere below it.
    pub fn is_within(&self, other: &FullName) -> bool {
        self.0 == other.0
            || (self.0.starts_with(other.0.as_str())
                && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    /// Replace the `from` prefix with `to`, if `self` is within `from`.
    pub fn rebase(&self, from: &FullName, to: &FullName) -> Option<FullName> {
        if !self.is_within(from) {
            return None;
        }
        Some(FullName(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FullName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        FullName::parse(&value)
    }
}

impl From<FullName> for String {
    fn from(name: FullName) -> Self {
        name.0
    }
}

impl std::str::FromStr for FullName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FullName::parse(s)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidInput("item name must not be empty".to_string()));
    }
    if segment == "." || segment == ".." {
        return Err(Error::InvalidInput(format!("'{segment}' is not an allowed name")));
    }
    if segment.trim() != segment {
        return Err(Error::InvalidInput(format!(
            "'{segment}' has leading or trailing whitespace"
        )));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| c.is_control() || matches!(c, '/' | '\\' | '?' | '*' | '%' | '<' | '>' | '|' | ':' | '"'))
    {
        return Err(Error::InvalidInput(format!(
            "'{c}' is an unsafe character in '{segment}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name_parts() {
        let name = FullName::parse("d/sub/edited").unwrap();
        assert_eq!(name.name(), "edited");
        assert_eq!(name.parent().unwrap().as_str(), "d/sub");
        assert_eq!(name.segments().count(), 3);
        assert!(FullName::parse("top").unwrap().parent().is_none());
    }

    #[test]
    fn test_full_name_rejects_bad_segments() {
        assert!(FullName::parse("").is_err());
        assert!(FullName::parse("a//b").is_err());
        assert!(FullName::parse("a/../b").is_err());
        assert!(FullName::parse("a/b*c").is_err());
        assert!(FullName::parse(" padded").is_err());
    }

    #[test]
    fn test_is_within_respects_segment_boundaries() {
        let folder = FullName::parse("d").unwrap();
        assert!(FullName::parse("d/x").unwrap().is_within(&folder));
        assert!(folder.is_within(&folder));
        assert!(!FullName::parse("d2/x").unwrap().is_within(&folder));
    }

    #[test]
    fn test_rebase_moves_descendants() {
        let from = FullName::parse("d").unwrap();
        let to = FullName::parse("d2").unwrap();
        let rebased = FullName::parse("d/edited").unwrap().rebase(&from, &to).unwrap();
        assert_eq!(rebased.as_str(), "d2/edited");
        assert!(FullName::parse("other").unwrap().rebase(&from, &to).is_none());
    }

    #[test]
    fn test_resource_id_round_trips_through_string() {
        let id = ResourceId::new();
        let parsed: ResourceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
