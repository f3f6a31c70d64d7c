//! Link specifications.
//!
//! A link pairs a human-readable tag with a TCP port reachable through an
//! SSH local-port-forward. Operators configure links as a single string:
//!
//! ```text
//! CI:9001,BUILDBOX:9002
//! ```
//!
//! The canonical string form of a [`LinkSet`] doubles as the identity of a
//! running daemon (it names the PID file).

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Separator between entries of a link set string.
pub const LINK_SEPARATOR: char = ',';

/// Separator between tag and port inside one entry.
pub const TAG_PORT_SEPARATOR: char = ':';

// ============================================================================
// Tag
// ============================================================================

/// Label identifying which remote source a link's messages come from.
///
/// Shown in notification titles (`"TAG: sender"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Creates a validated tag.
    ///
    /// Tags must be non-empty and must not contain `:`, `,` or whitespace,
    /// since those would make the link set string ambiguous. Path separators
    /// and NUL are rejected too: the link set names the PID file.
    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(DomainError::InvalidTag {
                tag,
                reason: "tag is empty".to_string(),
            });
        }
        if let Some(c) = tag
            .chars()
            .find(|c| {
                matches!(*c, LINK_SEPARATOR | TAG_PORT_SEPARATOR | '/' | '\\' | '\0')
                    || c.is_whitespace()
            })
        {
            return Err(DomainError::InvalidTag {
                reason: format!("contains reserved character {c:?}"),
                tag,
            });
        }
        Ok(Self(tag))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Tag {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

// ============================================================================
// LinkSpec
// ============================================================================

/// One configured link: a tag and the local port it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkSpec {
    pub tag: Tag,
    pub port: u16,
}

impl LinkSpec {
    /// Creates a link spec without port validation.
    ///
    /// Port `0` asks the OS for any free port; it is only reachable through
    /// this constructor, never through [`FromStr`].
    pub fn new(tag: Tag, port: u16) -> Self {
        Self { tag, port }
    }
}

impl FromStr for LinkSpec {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entry = s.trim();
        let invalid = |reason: &str| DomainError::InvalidLink {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (tag, port) = entry
            .split_once(TAG_PORT_SEPARATOR)
            .ok_or_else(|| invalid("expected TAG:PORT"))?;

        let tag = Tag::new(tag.trim())?;
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| invalid("port must be a number between 1 and 65535"))?;
        if port == 0 {
            return Err(invalid("port must be a number between 1 and 65535"));
        }

        Ok(Self { tag, port })
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.tag, TAG_PORT_SEPARATOR, self.port)
    }
}

// ============================================================================
// LinkSet
// ============================================================================

/// Non-empty, ordered set of links with unique tags and unique ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkSet(Vec<LinkSpec>);

impl LinkSet {
    /// Builds a link set, rejecting empty input and duplicate tags or ports.
    pub fn new(links: Vec<LinkSpec>) -> DomainResult<Self> {
        if links.is_empty() {
            return Err(DomainError::EmptyLinkSet);
        }

        let mut tags = HashSet::new();
        let mut ports = HashSet::new();
        for link in &links {
            if !tags.insert(&link.tag) {
                return Err(DomainError::DuplicateTag {
                    tag: link.tag.to_string(),
                });
            }
            // Port 0 is "any free port" and never collides
            if link.port != 0 && !ports.insert(link.port) {
                return Err(DomainError::DuplicatePort { port: link.port });
            }
        }

        Ok(Self(links))
    }

    /// Returns the links in configuration order.
    pub fn links(&self) -> &[LinkSpec] {
        &self.0
    }

    /// Number of configured links.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed set; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a link by tag.
    pub fn get(&self, tag: &str) -> Option<&LinkSpec> {
        self.0.iter().find(|l| l.tag.as_str() == tag)
    }

    /// Canonical identity of a daemon serving this set.
    ///
    /// Used as the PID file stem, so two daemons started with the same
    /// `--link` value collide while different link sets do not.
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl FromStr for LinkSet {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let links = s
            .split(LINK_SEPARATOR)
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(LinkSpec::from_str)
            .collect::<DomainResult<Vec<_>>>()?;
        Self::new(links)
    }
}

impl fmt::Display for LinkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for link in &self.0 {
            if !first {
                write!(f, "{LINK_SEPARATOR}")?;
            }
            write!(f, "{link}")?;
            first = false;
        }
        Ok(())
    }
}

impl TryFrom<String> for LinkSet {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LinkSet> for String {
    fn from(set: LinkSet) -> Self {
        set.to_string()
    }
}

impl<'a> IntoIterator for &'a LinkSet {
    type Item = &'a LinkSpec;
    type IntoIter = std::slice::Iter<'a, LinkSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
