//! Hierarchical datastore identifiers.
//!
//! An [`InstanceIdentifier`] addresses a record in the structured datastore
//! as a path of typed segments, e.g.
//! `/vpn-instance-op-data/vpn-instance-op-data-entry[vpn1]`.
//!
//! A list segment without a key (`[*]`) is a wildcard: the identifier then
//! denotes a whole class of records and is used as a subscription pattern.

use crate::error::{DeferError, Result};
use std::fmt;
use std::str::FromStr;

/// One segment of an identifier path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathArgument {
    /// A container node (`/vpn-instances`)
    Node(String),
    /// A list entry; `key == None` is a wildcard over every entry of the list
    Item { list: String, key: Option<String> },
}

impl PathArgument {
    /// Returns the schema name of this segment.
    pub fn name(&self) -> &str {
        match self {
            PathArgument::Node(name) => name,
            PathArgument::Item { list, .. } => list,
        }
    }

    /// Returns true if this segment is a list segment with no key.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PathArgument::Item { key: None, .. })
    }

    fn matches(&self, concrete: &PathArgument) -> bool {
        match (self, concrete) {
            (PathArgument::Node(a), PathArgument::Node(b)) => a == b,
            (
                PathArgument::Item { list: a, key: None },
                PathArgument::Item { list: b, .. },
            ) => a == b,
            (
                PathArgument::Item { list: a, key: Some(ka) },
                PathArgument::Item { list: b, key: Some(kb) },
            ) => a == b && ka == kb,
            _ => false,
        }
    }
}

impl fmt::Display for PathArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathArgument::Node(name) => write!(f, "{}", name),
            PathArgument::Item { list, key: Some(key) } => write!(f, "{}[{}]", list, key),
            PathArgument::Item { list, key: None } => write!(f, "{}[*]", list),
        }
    }
}

/// Structured path into the datastore. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIdentifier {
    path: Vec<PathArgument>,
}

impl InstanceIdentifier {
    /// Starts a builder rooted at the given top-level container.
    pub fn builder(root: impl Into<String>) -> InstanceIdentifierBuilder {
        InstanceIdentifierBuilder {
            path: vec![PathArgument::Node(root.into())],
        }
    }

    /// Returns the path segments.
    pub fn path(&self) -> &[PathArgument] {
        &self.path
    }

    /// Returns true if any segment is a wildcard.
    pub fn is_wildcarded(&self) -> bool {
        self.path.iter().any(PathArgument::is_wildcard)
    }

    /// Returns the key of the last keyed list segment, if any.
    pub fn last_key(&self) -> Option<&str> {
        self.path.iter().rev().find_map(|arg| match arg {
            PathArgument::Item { key: Some(key), .. } => Some(key.as_str()),
            _ => None,
        })
    }

    /// Returns a copy with every list key replaced by a wildcard.
    pub fn to_wildcard(&self) -> InstanceIdentifier {
        let path = self
            .path
            .iter()
            .map(|arg| match arg {
                PathArgument::Item { list, .. } => PathArgument::Item {
                    list: list.clone(),
                    key: None,
                },
                node => node.clone(),
            })
            .collect();
        InstanceIdentifier { path }
    }

    /// Returns true if `concrete` is covered by this identifier used as a
    /// pattern. A concrete identifier matches itself.
    pub fn matches(&self, concrete: &InstanceIdentifier) -> bool {
        self.path.len() == concrete.path.len()
            && self
                .path
                .iter()
                .zip(concrete.path.iter())
                .all(|(pattern, arg)| pattern.matches(arg))
    }
}

impl fmt::Display for InstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for arg in &self.path {
            write!(f, "/{}", arg)?;
        }
        Ok(())
    }
}

impl FromStr for InstanceIdentifier {
    type Err = DeferError;

    /// Parses the `Display` form: `/node/list[key]/list[*]`.
    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| DeferError::invalid_identifier(s, "must start with '/'"))?;

        let mut path = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(DeferError::invalid_identifier(s, "empty path segment"));
            }
            let arg = match segment.split_once('[') {
                Some((list, key)) => {
                    let key = key
                        .strip_suffix(']')
                        .ok_or_else(|| DeferError::invalid_identifier(s, "unterminated key"))?;
                    if list.is_empty() || key.is_empty() {
                        return Err(DeferError::invalid_identifier(s, "empty list name or key"));
                    }
                    PathArgument::Item {
                        list: list.to_string(),
                        key: (key != "*").then(|| key.to_string()),
                    }
                }
                None => PathArgument::Node(segment.to_string()),
            };
            path.push(arg);
        }

        Ok(InstanceIdentifier { path })
    }
}

/// Builder for [`InstanceIdentifier`].
#[derive(Debug, Clone)]
pub struct InstanceIdentifierBuilder {
    path: Vec<PathArgument>,
}

impl InstanceIdentifierBuilder {
    /// Appends a container node.
    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.path.push(PathArgument::Node(name.into()));
        self
    }

    /// Appends a keyed list entry.
    pub fn child(mut self, list: impl Into<String>, key: impl Into<String>) -> Self {
        self.path.push(PathArgument::Item {
            list: list.into(),
            key: Some(key.into()),
        });
        self
    }

    /// Appends a wildcard over every entry of a list.
    pub fn any(mut self, list: impl Into<String>) -> Self {
        self.path.push(PathArgument::Item {
            list: list.into(),
            key: None,
        });
        self
    }

    pub fn build(self) -> InstanceIdentifier {
        InstanceIdentifier { path: self.path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpn_op(vpn: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("vpn-instance-op-data")
            .child("vpn-instance-op-data-entry", vpn)
            .build()
    }

    #[test]
    fn test_display_and_parse() {
        let id = vpn_op("vpn1");
        assert_eq!(
            id.to_string(),
            "/vpn-instance-op-data/vpn-instance-op-data-entry[vpn1]"
        );

        let parsed: InstanceIdentifier = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let wildcard: InstanceIdentifier = "/vpn-instance-op-data/vpn-instance-op-data-entry[*]"
            .parse()
            .unwrap();
        assert!(wildcard.is_wildcarded());
        assert_eq!(wildcard, id.to_wildcard());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("vpn-instances".parse::<InstanceIdentifier>().is_err());
        assert!("/vpn-instances//x".parse::<InstanceIdentifier>().is_err());
        assert!("/vpn-instances/vpn-instance[vpn1".parse::<InstanceIdentifier>().is_err());
        assert!("/vpn-instances/vpn-instance[]".parse::<InstanceIdentifier>().is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let pattern = vpn_op("vpn1").to_wildcard();

        assert!(pattern.matches(&vpn_op("vpn1")));
        assert!(pattern.matches(&vpn_op("vpn2")));
        assert!(vpn_op("vpn1").matches(&vpn_op("vpn1")));
        assert!(!vpn_op("vpn1").matches(&vpn_op("vpn2")));

        let deeper = InstanceIdentifier::builder("vpn-instance-op-data")
            .child("vpn-instance-op-data-entry", "vpn1")
            .node("state")
            .build();
        assert!(!pattern.matches(&deeper));

        let other_list = InstanceIdentifier::builder("vpn-instance-op-data")
            .child("vpn-to-dpn-list", "1")
            .build();
        assert!(!pattern.matches(&other_list));
    }

    #[test]
    fn test_last_key() {
        let id = InstanceIdentifier::builder("vpn-interfaces")
            .child("vpn-interface", "tap0")
            .node("adjacencies")
            .build();
        assert_eq!(id.last_key(), Some("tap0"));
        assert_eq!(id.to_wildcard().last_key(), None);
    }
}
