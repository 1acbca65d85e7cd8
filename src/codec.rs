//! Message codec: the closed set of actions and their wire encoding.
//!
//! An [`Action`] travels as an [`Envelope`]: the entity key (partition key),
//! the action tag (a message header) and a JSON payload. The tag alone
//! selects the payload schema, so a record is decodable in isolation:
//!
//! | Tag | Payload |
//! |-----|---------|
//! | `create` | full [`Skill`] |
//! | `update` | full [`Skill`] |
//! | `update_name` | `{"key", "name"}` |
//! | `update_desc` | `{"key", "description"}` |
//! | `update_logo` | `{"key", "logo"}` |
//! | `update_tags` | `{"key", "tags"}` |
//! | `delete` | `{"key"}` |
//!
//! Decoding is strict about the key (present and non-empty) and lenient
//! about the optional attributes of a full skill, which default to empty.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{
    ACTION_HEADER, TAG_CREATE, TAG_DELETE, TAG_REPLACE, TAG_UPDATE_DESCRIPTION, TAG_UPDATE_LOGO,
    TAG_UPDATE_NAME, TAG_UPDATE_TAGS,
};
use crate::error::{DecodeError, EncodeError};
use crate::log::LogRecord;
use crate::types::{Skill, nullable_tags};

// =============================================================================
// Action Kinds
// =============================================================================

/// Discriminant of an [`Action`], carried on the wire as a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Replace,
    UpdateName,
    UpdateDescription,
    UpdateLogo,
    UpdateTags,
    Delete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Create,
        ActionKind::Replace,
        ActionKind::UpdateName,
        ActionKind::UpdateDescription,
        ActionKind::UpdateLogo,
        ActionKind::UpdateTags,
        ActionKind::Delete,
    ];

    /// Wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => TAG_CREATE,
            ActionKind::Replace => TAG_REPLACE,
            ActionKind::UpdateName => TAG_UPDATE_NAME,
            ActionKind::UpdateDescription => TAG_UPDATE_DESCRIPTION,
            ActionKind::UpdateLogo => TAG_UPDATE_LOGO,
            ActionKind::UpdateTags => TAG_UPDATE_TAGS,
            ActionKind::Delete => TAG_DELETE,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownAction(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameUpdate {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionUpdate {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Description")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoUpdate {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Logo")]
    pub logo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsUpdate {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(alias = "Tags", deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRef {
    #[serde(alias = "Key")]
    pub key: String,
}

// =============================================================================
// Actions
// =============================================================================

/// A state-changing intent for one skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create(Skill),
    /// Overwrite every non-key attribute.
    Replace(Skill),
    UpdateName(NameUpdate),
    UpdateDescription(DescriptionUpdate),
    UpdateLogo(LogoUpdate),
    UpdateTags(TagsUpdate),
    Delete(SkillRef),
}

impl Action {
    pub fn update_name(key: impl Into<String>, name: impl Into<String>) -> Self {
        Action::UpdateName(NameUpdate {
            key: key.into(),
            name: name.into(),
        })
    }

    pub fn update_description(key: impl Into<String>, description: impl Into<String>) -> Self {
        Action::UpdateDescription(DescriptionUpdate {
            key: key.into(),
            description: description.into(),
        })
    }

    pub fn update_logo(key: impl Into<String>, logo: impl Into<String>) -> Self {
        Action::UpdateLogo(LogoUpdate {
            key: key.into(),
            logo: logo.into(),
        })
    }

    pub fn update_tags<I, S>(key: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Action::UpdateTags(TagsUpdate {
            key: key.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        })
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Action::Delete(SkillRef { key: key.into() })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Create(_) => ActionKind::Create,
            Action::Replace(_) => ActionKind::Replace,
            Action::UpdateName(_) => ActionKind::UpdateName,
            Action::UpdateDescription(_) => ActionKind::UpdateDescription,
            Action::UpdateLogo(_) => ActionKind::UpdateLogo,
            Action::UpdateTags(_) => ActionKind::UpdateTags,
            Action::Delete(_) => ActionKind::Delete,
        }
    }

    /// Key of the entity this action targets.
    pub fn key(&self) -> &str {
        match self {
            Action::Create(skill) | Action::Replace(skill) => &skill.key,
            Action::UpdateName(u) => &u.key,
            Action::UpdateDescription(u) => &u.key,
            Action::UpdateLogo(u) => &u.key,
            Action::UpdateTags(u) => &u.key,
            Action::Delete(r) => &r.key,
        }
    }
}

/// Serialize the payload of `action`.
pub fn encode(action: &Action) -> Result<Bytes, EncodeError> {
    let encoded = match action {
        Action::Create(skill) | Action::Replace(skill) => serde_json::to_vec(skill),
        Action::UpdateName(u) => serde_json::to_vec(u),
        Action::UpdateDescription(u) => serde_json::to_vec(u),
        Action::UpdateLogo(u) => serde_json::to_vec(u),
        Action::UpdateTags(u) => serde_json::to_vec(u),
        Action::Delete(r) => serde_json::to_vec(r),
    };

    encoded.map(Bytes::from).map_err(|source| EncodeError::Serialize {
        kind: action.kind(),
        source,
    })
}

/// Parse a payload according to its tag.
pub fn decode(kind: ActionKind, payload: &[u8]) -> Result<Action, DecodeError> {
    let action = match kind {
        ActionKind::Create => Action::Create(parse(kind, payload)?),
        ActionKind::Replace => Action::Replace(parse(kind, payload)?),
        ActionKind::UpdateName => Action::UpdateName(parse(kind, payload)?),
        ActionKind::UpdateDescription => Action::UpdateDescription(parse(kind, payload)?),
        ActionKind::UpdateLogo => Action::UpdateLogo(parse(kind, payload)?),
        ActionKind::UpdateTags => Action::UpdateTags(parse(kind, payload)?),
        ActionKind::Delete => Action::Delete(parse(kind, payload)?),
    };

    if action.key().is_empty() {
        return Err(DecodeError::EmptyKey { kind });
    }
    Ok(action)
}

fn parse<T: DeserializeOwned>(kind: ActionKind, payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed { kind, source })
}

// =============================================================================
// Envelopes
// =============================================================================

/// The unit placed on the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Entity key; all actions for one entity land in one partition.
    pub partition_key: String,
    pub kind: ActionKind,
    pub payload: Bytes,
}

impl Envelope {
    pub fn seal(action: &Action) -> Result<Self, EncodeError> {
        Ok(Self {
            partition_key: action.key().to_string(),
            kind: action.kind(),
            payload: encode(action)?,
        })
    }

    pub fn open(&self) -> Result<Action, DecodeError> {
        decode(self.kind, &self.payload)
    }
}

/// Decode a delivered record.
///
/// The tag is read from the [`ACTION_HEADER`] header. Records written by
/// producers that carried the tag in the record key instead are still
/// understood.
pub fn decode_record(record: &LogRecord) -> Result<Action, DecodeError> {
    let kind = match record.header(ACTION_HEADER) {
        Some(tag) => std::str::from_utf8(tag)
            .map_err(|_| DecodeError::UnknownAction(String::from_utf8_lossy(tag).into_owned()))?
            .parse()?,
        None => record
            .key
            .as_deref()
            .and_then(|key| std::str::from_utf8(key).ok())
            .and_then(|key| key.parse().ok())
            .ok_or(DecodeError::MissingTag)?,
    };
    decode(kind, &record.payload)
}
