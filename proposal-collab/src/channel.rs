//! Channel identifiers for document pub/sub topics.
//!
//! A channel name is derived from the project (and optionally document) id
//! and stays fixed for the lifetime of a shared document:
//!
//! ```text
//! project:<projectId>
//! project:<projectId>:doc:<documentId>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a channel name in bytes.
pub const MAX_CHANNEL_LEN: usize = 255;

const PROJECT_PREFIX: &str = "project";
const DOCUMENT_SEGMENT: &str = "doc";

/// Channel validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel name is empty")]
    Empty,
    #[error("channel name is {0} bytes, limit is {max}", max = MAX_CHANNEL_LEN)]
    TooLong(usize),
    #[error("channel name contains an empty segment: {0:?}")]
    EmptySegment(String),
    #[error("invalid character {ch:?} in channel name {name:?}")]
    InvalidCharacter { name: String, ch: char },
}

/// A validated publish/subscribe topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    /// Channel for all edits of a project: `project:<projectId>`.
    pub fn for_project(project_id: impl AsRef<str>) -> Result<Self, ChannelError> {
        Self::parse(format!("{PROJECT_PREFIX}:{}", project_id.as_ref()))
    }

    /// Channel scoped to one document inside a project.
    pub fn for_project_document(
        project_id: impl AsRef<str>,
        document_id: impl AsRef<str>,
    ) -> Result<Self, ChannelError> {
        Self::parse(format!(
            "{PROJECT_PREFIX}:{}:{DOCUMENT_SEGMENT}:{}",
            project_id.as_ref(),
            document_id.as_ref()
        ))
    }

    /// Validate a raw channel name.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ChannelError> {
        let name = raw.into();
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        if name.len() > MAX_CHANNEL_LEN {
            return Err(ChannelError::TooLong(name.len()));
        }
        for segment in name.split(':') {
            if segment.is_empty() {
                return Err(ChannelError::EmptySegment(name.clone()));
            }
            if let Some(ch) = segment.chars().find(|c| !is_segment_char(*c)) {
                return Err(ChannelError::InvalidCharacter { name: name.clone(), ch });
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}
