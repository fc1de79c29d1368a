//! Migration engine for Haasteikko document data.
//!
//! Documents fetched from the document store are parsed into typed records ([`parse`]),
//! filtered and repaired into a [`MigrationPlan`] ([`plan`]) that a relational writer can
//! persist in one transaction, or copied under a new owner by the [`rekey`] engine.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod parse;
pub mod plan;
pub mod rekey;
pub mod source;

pub use parse::{
    parse_answer_batch, parse_answer_batches, parse_challenge, parse_challenges,
    parse_library_item, parse_library_items,
};
pub use plan::{
    filter_by_challenge, filter_by_question, find_replacement_item, plan_migration, FilterOutcome,
    MigrationPlan, MigrationScope, PlanStats, Repair,
};
pub use rekey::{
    IdGenerator, IdentifierMap, RekeyEngine, RekeyReport, UlidGenerator, UnresolvedReference,
};
pub use source::{
    fetch_all, Document, DocumentStore, StoreError, ANSWERS_CONTAINER, CHALLENGES_CONTAINER,
    LIBRARY_CONTAINER, OWNER_FIELD,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Challenge,
    Question,
    LibraryItem,
    Answer,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Challenge => "challenge",
            Self::Question => "question",
            Self::LibraryItem => "library item",
            Self::Answer => "answer",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the source document an error was raised for.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordRef {
    pub record: RecordKind,
    pub id: Option<String>,
    pub kind: Option<String>,
}

impl RecordRef {
    #[must_use]
    pub fn new(record: RecordKind, id: Option<&str>) -> Self {
        Self { record, id: id.map(str::to_string), kind: None }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: Option<&str>) -> Self {
        self.kind = kind.map(str::to_string);
        self
    }
}

impl Display for RecordRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} '{id}'", self.record)?,
            None => write!(f, "{} <unknown id>", self.record)?,
        }
        if let Some(kind) = &self.kind {
            write!(f, " (kind {kind})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("{at} is missing required field(s): {}", .fields.join(", "))]
    MissingField { at: RecordRef, fields: Vec<String> },
    #[error("{at}: field `{field}` must be {expected}")]
    InvalidField { at: RecordRef, field: String, expected: &'static str },
    #[error(
        "cannot repair reference to library item '{item_id}' (title {title:?}): expected exactly one item with that title for the target user, found {candidates}"
    )]
    AmbiguousRepair { item_id: String, title: String, candidates: usize },
    #[error("library item '{item_id}' is referenced but does not exist in the source")]
    UnknownLibraryItem { item_id: String },
    #[error("failed to persist {record} '{id}': {message}")]
    Persistence { record: RecordKind, id: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub kind: String,
    pub question: String,
    pub id: String,
    pub number: i64,
    pub question_cluster_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub name: String,
    pub status: String,
    pub target_media: String,
    pub questions: Vec<Question>,
}

/// The source sub-object that supplied a library item's title and author.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LibraryVariant {
    Book { title: String, author: String, translator: String },
    Game { title: String, creator: String },
}

impl LibraryVariant {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book { .. } => "book",
            Self::Game { .. } => "game",
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Book { title, .. } | Self::Game { title, .. } => title,
        }
    }

    #[must_use]
    pub fn author(&self) -> &str {
        match self {
            Self::Book { author, .. } => author,
            Self::Game { creator, .. } => creator,
        }
    }

    /// Empty for games.
    #[must_use]
    pub fn translator(&self) -> &str {
        match self {
            Self::Book { translator, .. } => translator,
            Self::Game { .. } => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub kind: String,
    pub id: String,
    pub user_id: String,
    #[serde(rename = "addDate")]
    pub added_at: String,
    pub activated_challenge_ids: Vec<String>,
    pub favorite: bool,
    #[serde(flatten)]
    pub variant: LibraryVariant,
}

impl LibraryItem {
    #[must_use]
    pub fn title(&self) -> &str {
        self.variant.title()
    }

    #[must_use]
    pub fn author(&self) -> &str {
        self.variant.author()
    }

    #[must_use]
    pub fn translator(&self) -> &str {
        self.variant.translator()
    }
}

/// One answer entry, carrying the owner and challenge of the envelope it came from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub kind: String,
    pub id: String,
    pub question_id: String,
    pub answered: bool,
    pub answer: String,
    pub item_id: String,
    pub user_id: String,
    pub challenge_id: String,
}
