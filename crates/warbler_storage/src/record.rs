//! Status update records and the validated boundary they cross to get in.
//!
//! The embedding system hands over a [`StatusDraft`] (loosely typed, fields
//! may be missing). [`StatusDraft::validate`] is the only way to obtain a
//! [`StatusUpdate`], so everything past the container API is well-formed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use warbler_common::clock::Clock;
use warbler_common::error::StorageError;
use warbler_common::types::StatusId;

/// A validated status update.
///
/// Fields are private: the identifier may only be changed by the store's
/// allocator, and author/tags must stay in sync with the secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    id: StatusId,
    author: String,
    tags: BTreeSet<String>,
    context: Option<String>,
    payload: Vec<u8>,
}

impl StatusUpdate {
    pub fn id(&self) -> StatusId {
        self.id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8 text, if it is text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub(crate) fn set_id(&mut self, id: StatusId) {
        self.id = id;
    }
}

/// Unvalidated input from the embedding system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDraft {
    /// Requested identifier; defaults to "now" in microseconds.
    pub id: Option<u64>,
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub context: Option<String>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl StatusDraft {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: Some(author.into()),
            payload: text.into().into_bytes(),
            ..Self::default()
        }
    }

    /// Like [`StatusDraft::new`], tagging the update with every `#hashtag`
    /// found in the text.
    pub fn from_text(author: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let tags = extract_hashtags(&text);
        Self::new(author, text).with_tags(tags)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn in_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Check the draft is a status update and turn it into one.
    ///
    /// Rejects a missing or blank author, blank tags and a blank context.
    /// Duplicate tags collapse. A missing id is seeded from `clock`.
    pub fn validate(self, clock: &dyn Clock) -> Result<StatusUpdate, StorageError> {
        let author = match self.author {
            Some(a) if !a.trim().is_empty() => a,
            Some(_) => return Err(StorageError::Validation("author is blank".into())),
            None => return Err(StorageError::Validation("author is missing".into())),
        };

        let mut tags = BTreeSet::new();
        for tag in self.tags {
            if tag.trim().is_empty() {
                return Err(StorageError::Validation(format!(
                    "blank tag on update by '{}'",
                    author
                )));
            }
            tags.insert(tag);
        }

        if let Some(ctx) = &self.context {
            if ctx.trim().is_empty() {
                return Err(StorageError::Validation("context is blank".into()));
            }
        }

        let id = StatusId(self.id.unwrap_or_else(|| clock.now_micros()));

        Ok(StatusUpdate {
            id,
            author,
            tags,
            context: self.context,
            payload: self.payload,
        })
    }
}

/// Collect `#tag` words from free text. Trailing punctuation is dropped.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|word| word.strip_prefix('#'))
        .map(|rest| {
            rest.chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|tag| !tag.is_empty())
        .collect()
}
