//! Re-keying: copy a user's library items and answers under a new owner.
//!
//! Runs in two phases. The copy phase clones every library item of the old user with a
//! fresh id and records old id -> new id. The rewrite phase clones every answer of the old
//! user, pointing its item references through that map. Both phases are best-effort per
//! document; originals are never modified or removed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::source::{
    fetch_all, Document, DocumentStore, ANSWERS_CONTAINER, LIBRARY_CONTAINER, OWNER_FIELD,
};

const ID_FIELD: &str = "id";
const ITEM_REFERENCE_FIELD: &str = "itemId";
const ANSWER_ENTRIES_FIELD: &str = "answers";

pub trait IdGenerator {
    fn next_id(&mut self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn next_id(&mut self) -> String {
        Ulid::new().to_string()
    }
}

/// Old library item id -> id of its copy, for items copied in this run only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifierMap(BTreeMap<String, String>);

impl IdentifierMap {
    pub fn insert(&mut self, old_id: String, new_id: String) {
        self.0.insert(old_id, new_id);
    }

    #[must_use]
    pub fn get(&self, old_id: &str) -> Option<&str> {
        self.0.get(old_id).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(old, new)| (old.as_str(), new.as_str()))
    }
}

/// An answer copied with item references the map could not resolve. `item_ids` is
/// empty when the answer carried no reference at all.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnresolvedReference {
    pub answer_id: String,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RekeyReport {
    pub items_copied: usize,
    pub items_failed: usize,
    pub answers_migrated: usize,
    pub answers_failed: usize,
    pub unresolved: Vec<UnresolvedReference>,
    pub id_map: IdentifierMap,
}

pub struct RekeyEngine<'a, S: DocumentStore + ?Sized, G: IdGenerator> {
    store: &'a mut S,
    ids: G,
}

impl<'a, S: DocumentStore + ?Sized> RekeyEngine<'a, S, UlidGenerator> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store, ids: UlidGenerator }
    }
}

impl<'a, S: DocumentStore + ?Sized, G: IdGenerator> RekeyEngine<'a, S, G> {
    pub fn with_generator(store: &'a mut S, ids: G) -> Self {
        Self { store, ids }
    }

    /// Copy phase, then rewrite phase. Rewriting only starts once every item copy has
    /// been attempted, since it depends on the finished map.
    pub fn run(&mut self, old_user: &str, new_user: &str) -> RekeyReport {
        let mut report = RekeyReport::default();
        self.copy_library_items(old_user, new_user, &mut report);
        self.rewrite_answers(old_user, new_user, &mut report);
        tracing::info!(
            items_copied = report.items_copied,
            answers_migrated = report.answers_migrated,
            unresolved = report.unresolved.len(),
            "re-keying finished"
        );
        report
    }

    fn copy_library_items(&mut self, old_user: &str, new_user: &str, report: &mut RekeyReport) {
        for item in fetch_all(&*self.store, LIBRARY_CONTAINER, Some(old_user)) {
            let Some(old_id) = document_id(&item) else {
                tracing::error!("skipping library item without an id for user {old_user}");
                report.items_failed += 1;
                continue;
            };

            let new_id = self.ids.next_id();
            let mut copy = item.clone();
            copy.insert(ID_FIELD.to_string(), Value::String(new_id.clone()));
            copy.insert(OWNER_FIELD.to_string(), Value::String(new_user.to_string()));

            match self.store.create(LIBRARY_CONTAINER, &copy) {
                Ok(()) => {
                    tracing::info!(item_id = %old_id, new_id = %new_id, "copied library item");
                    report.id_map.insert(old_id, new_id);
                    report.items_copied += 1;
                }
                Err(err) => {
                    tracing::error!(item_id = %old_id, "failed to copy library item: {err}");
                    report.items_failed += 1;
                }
            }
        }
    }

    fn rewrite_answers(&mut self, old_user: &str, new_user: &str, report: &mut RekeyReport) {
        for answer in fetch_all(&*self.store, ANSWERS_CONTAINER, Some(old_user)) {
            let old_id = document_id(&answer).unwrap_or_default();
            let mut copy = answer.clone();

            if let Some(item_ids) = rewrite_item_references(&mut copy, &report.id_map) {
                tracing::warn!(
                    answer_id = %old_id,
                    item_ids = ?item_ids,
                    "answer references a library item that is not in the migration map"
                );
                report.unresolved.push(UnresolvedReference { answer_id: old_id.clone(), item_ids });
            }

            let new_id = self.ids.next_id();
            copy.insert(ID_FIELD.to_string(), Value::String(new_id.clone()));
            copy.insert(OWNER_FIELD.to_string(), Value::String(new_user.to_string()));

            match self.store.create(ANSWERS_CONTAINER, &copy) {
                Ok(()) => {
                    tracing::info!(answer_id = %old_id, new_id = %new_id, "migrated answer");
                    report.answers_migrated += 1;
                }
                Err(err) => {
                    tracing::error!(answer_id = %old_id, "failed to migrate answer: {err}");
                    report.answers_failed += 1;
                }
            }
        }
    }
}

fn document_id(document: &Document) -> Option<String> {
    document.get(ID_FIELD).and_then(Value::as_str).map(str::to_string)
}

/// Rewrite the top-level and per-entry `itemId` references of an answer document.
/// Returns the distinct references the map could not resolve, or `Some` of an empty
/// list when the document carries no reference at all.
fn rewrite_item_references(document: &mut Document, id_map: &IdentifierMap) -> Option<Vec<String>> {
    let mut unresolved: Vec<String> = Vec::new();
    let mut seen_reference = false;

    let mut rewrite = |slot: &mut Value| {
        seen_reference = true;
        let mapped = slot.as_str().and_then(|old| id_map.get(old)).map(str::to_string);
        if let Some(new_id) = mapped {
            *slot = Value::String(new_id);
            return;
        }
        let old = match slot {
            Value::String(old) => old.clone(),
            other => other.to_string(),
        };
        if !unresolved.contains(&old) {
            unresolved.push(old);
        }
    };

    if let Some(slot) = document.get_mut(ITEM_REFERENCE_FIELD) {
        rewrite(slot);
    }
    if let Some(Value::Array(entries)) = document.get_mut(ANSWER_ENTRIES_FIELD) {
        for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(slot) = entry.get_mut(ITEM_REFERENCE_FIELD) {
                rewrite(slot);
            }
        }
    }

    if seen_reference && unresolved.is_empty() {
        None
    } else {
        Some(unresolved)
    }
}
