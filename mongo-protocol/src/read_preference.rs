//! Read preference - the caller-declared read intent used during server
//! selection and forwarded to the server as `$readPreference`.
use bson::{doc, Bson, Document};
use derive_more::Display;
use std::collections::HashMap;
use std::time::Duration;

/// How reads should be routed among replica set members.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadMode {
    /// Wire-level mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        }
    }
}

/// One tag set; a server matches when it carries every tag in the set.
pub type TagSet = HashMap<String, String>;

/// Caller-declared read intent: a mode plus optional tag sets and staleness
/// bound. Tag sets are tried in order; the first set with any matching
/// server wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPreference {
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        ReadPreference {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadMode::Primary)
    }

    pub fn secondary() -> Self {
        Self::new(ReadMode::Secondary)
    }

    pub fn nearest() -> Self {
        Self::new(ReadMode::Nearest)
    }

    /// Sets tag sets. Tag sets cannot be combined with `Primary` mode; the
    /// combination is rejected at selection time.
    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    #[inline]
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    #[inline]
    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    #[inline]
    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }

    #[inline]
    pub fn is_primary(&self) -> bool {
        self.mode == ReadMode::Primary && self.tag_sets.is_empty()
    }

    /// Renders the `$readPreference` document attached to outgoing commands.
    pub fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };

        if !self.tag_sets.is_empty() {
            let tags = self
                .tag_sets
                .iter()
                .map(|tag_set| {
                    let mut tags = Document::new();
                    for (key, value) in tag_set {
                        tags.insert(key.clone(), value.clone());
                    }
                    Bson::Document(tags)
                })
                .collect::<Vec<_>>();
            document.insert("tags", tags);
        }

        if let Some(max_staleness) = self.max_staleness {
            document.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }

        document
    }
}
