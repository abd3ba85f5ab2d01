//! Data models for marksync
//!
//! Defines the normalized `Record` stored in every storage tier, the
//! additive `Tags` set, and the entries a source reader hands to the engine.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Delimiter used to encode a tag set into a single column
pub const TAG_SEP: &str = ",";

/// Replacement for the delimiter when it appears inside a tag name
const TAG_SEP_ESCAPE: &str = "--";

/// An ordered, duplicate-free set of tags
///
/// Ordering is lexical so that the stored encoding of a given set is always
/// the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub const EMPTY: Tags = Tags(BTreeSet::new());

    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag, returning true if it was not already present
    ///
    /// Surrounding whitespace is trimmed and empty names are ignored. The
    /// storage delimiter inside a name is replaced, so a set reads back from
    /// storage exactly as it was written.
    pub fn insert(&mut self, tag: impl AsRef<str>) -> bool {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            return false;
        }
        self.0.insert(tag.replace(TAG_SEP, TAG_SEP_ESCAPE))
    }

    /// Set union in place, returning true if anything was added
    pub fn merge(&mut self, other: &Tags) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() != before
    }

    /// Set union into a new value
    pub fn union(&self, other: &Tags) -> Tags {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_superset(&self, other: &Tags) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Encode for storage as a delimiter-wrapped list: `,a,b,`
    ///
    /// An empty set encodes as a lone delimiter.
    pub fn to_stored(&self) -> String {
        if self.0.is_empty() {
            return TAG_SEP.to_string();
        }
        let joined = self.iter().collect::<Vec<_>>().join(TAG_SEP);
        format!("{TAG_SEP}{joined}{TAG_SEP}")
    }

    /// Decode the storage encoding produced by [`Tags::to_stored`]
    pub fn from_stored(s: &str) -> Self {
        s.split(TAG_SEP).collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Tags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for tag in iter {
            tags.insert(tag);
        }
        tags
    }
}

impl<S: AsRef<str>> Extend<S> for Tags {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for tag in iter {
            self.insert(tag);
        }
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(", ");
        f.write_str(&joined)
    }
}

/// The normalized unit stored in any storage tier
///
/// `url` is the unique key in every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The bookmarked URL
    pub url: String,
    /// Title or other display metadata
    pub title: String,
    /// Tags, including folder names the bookmark was filed under
    pub tags: Tags,
    /// Free-form description
    pub description: String,
    /// Last time this record changed in the tier it was read from
    pub modified: DateTime<Utc>,
    /// Reserved bit flags
    pub flags: i64,
    /// Source kind that first produced this record
    pub module: String,
}

impl Record {
    /// Create a record with the URL doubling as title
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            title: url.clone(),
            url,
            tags: Tags::new(),
            description: String::new(),
            modified: now_secs(),
            flags: 0,
            module: String::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_tags<S: AsRef<str>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }
}

/// One bookmark as reported by a source reader
///
/// `folders` is the folder path from the source's root down to the bookmark.
/// `tags` are the source's own tags for it, if the source has any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub folders: Vec<String>,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn tagged<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn in_folder<S: Into<String>>(mut self, path: impl IntoIterator<Item = S>) -> Self {
        self.folders = path.into_iter().map(Into::into).collect();
        self
    }
}

/// The result of one pull from a source reader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePull {
    /// Bookmarks returned by the reader
    pub entries: Vec<SourceEntry>,
    /// True when `entries` is the source's whole bookmark set rather than
    /// only what changed since the watermark
    pub complete: bool,
}

impl SourcePull {
    /// A full snapshot of the source
    pub fn full(entries: Vec<SourceEntry>) -> Self {
        Self {
            entries,
            complete: true,
        }
    }

    /// Only the entries changed since the requested watermark
    pub fn changes(entries: Vec<SourceEntry>) -> Self {
        Self {
            entries,
            complete: false,
        }
    }
}

/// Current time truncated to whole seconds, the resolution stored in the tiers
pub fn now_secs() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}
