//! Reference filtering and repair, producing the record set a destination writer persists.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Answer, Challenge, LibraryItem, MigrationError};

/// Users whose data is migrated, and the account dangling item references are
/// repaired towards. The target user is always part of the valid set.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationScope {
    pub target_user: String,
    pub valid_users: BTreeSet<String>,
}

impl MigrationScope {
    #[must_use]
    pub fn new(
        target_user: impl Into<String>,
        valid_users: impl IntoIterator<Item = String>,
    ) -> Self {
        let target_user = target_user.into();
        let mut valid_users = valid_users
            .into_iter()
            .map(|user| user.trim().to_string())
            .filter(|user| !user.is_empty())
            .collect::<BTreeSet<_>>();
        valid_users.insert(target_user.clone());
        Self { target_user, valid_users }
    }

    #[must_use]
    pub fn includes(&self, user_id: &str) -> bool {
        self.valid_users.contains(user_id)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FilterOutcome {
    pub kept: Vec<Answer>,
    pub removed: usize,
}

/// Keep answers whose challenge is still known. Order-preserving.
#[must_use]
pub fn filter_by_challenge(
    valid_challenge_ids: &BTreeSet<String>,
    answers: Vec<Answer>,
) -> FilterOutcome {
    retain(answers, |answer| valid_challenge_ids.contains(&answer.challenge_id))
}

/// Keep answers whose question belongs to a known challenge. Order-preserving.
#[must_use]
pub fn filter_by_question(
    valid_question_ids: &BTreeSet<String>,
    answers: Vec<Answer>,
) -> FilterOutcome {
    retain(answers, |answer| valid_question_ids.contains(&answer.question_id))
}

fn retain(answers: Vec<Answer>, keep: impl Fn(&Answer) -> bool) -> FilterOutcome {
    let total = answers.len();
    let kept = answers.into_iter().filter(|answer| keep(answer)).collect::<Vec<_>>();
    FilterOutcome { removed: total - kept.len(), kept }
}

/// Find the item that replaces dangling reference `item_id`: the single other item
/// owned by `target_user` with the same title.
///
/// # Errors
/// Returns [`MigrationError::UnknownLibraryItem`] when `item_id` is not among `items`,
/// and [`MigrationError::AmbiguousRepair`] unless exactly one candidate exists.
pub fn find_replacement_item<'a>(
    item_id: &str,
    items: &'a [LibraryItem],
    target_user: &str,
) -> Result<&'a LibraryItem, MigrationError> {
    let current = items
        .iter()
        .find(|item| item.id == item_id)
        .ok_or_else(|| MigrationError::UnknownLibraryItem { item_id: item_id.to_string() })?;

    let candidates = items
        .iter()
        .filter(|item| {
            item.id != current.id && item.user_id == target_user && item.title() == current.title()
        })
        .collect::<Vec<_>>();

    match candidates.as_slice() {
        [replacement] => Ok(replacement),
        _ => Err(MigrationError::AmbiguousRepair {
            item_id: current.id.clone(),
            title: current.title().to_string(),
            candidates: candidates.len(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Repair {
    pub answer_id: String,
    pub from_item_id: String,
    pub to_item_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanStats {
    pub fetched_answers: usize,
    pub stale_challenge_answers: usize,
    pub unknown_question_answers: usize,
    pub out_of_scope_answers: usize,
    pub out_of_scope_items: usize,
    pub unknown_challenge_associations: usize,
    pub repairs: Vec<Repair>,
}

/// Everything the destination writer needs, already filtered and repaired.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigrationPlan {
    pub challenges: Vec<Challenge>,
    pub items: Vec<LibraryItem>,
    pub answers: Vec<Answer>,
    pub stats: PlanStats,
}

impl MigrationPlan {
    #[must_use]
    pub fn question_count(&self) -> usize {
        self.challenges.iter().map(|challenge| challenge.questions.len()).sum()
    }

    #[must_use]
    pub fn association_count(&self) -> usize {
        self.items.iter().map(|item| item.activated_challenge_ids.len()).sum()
    }
}

/// Filter stale answers, restrict to the scope's users and repair dangling item
/// references. Pure: a repair failure aborts before anything is written.
///
/// # Errors
/// Returns the first [`MigrationError::AmbiguousRepair`] or
/// [`MigrationError::UnknownLibraryItem`] raised while repairing.
pub fn plan_migration(
    challenges: Vec<Challenge>,
    items: Vec<LibraryItem>,
    answers: Vec<Answer>,
    scope: &MigrationScope,
) -> Result<MigrationPlan, MigrationError> {
    let mut stats = PlanStats { fetched_answers: answers.len(), ..PlanStats::default() };

    let challenge_ids =
        challenges.iter().map(|challenge| challenge.id.clone()).collect::<BTreeSet<_>>();
    let question_ids = challenges
        .iter()
        .flat_map(|challenge| challenge.questions.iter().map(|question| question.id.clone()))
        .collect::<BTreeSet<_>>();

    let by_challenge = filter_by_challenge(&challenge_ids, answers);
    stats.stale_challenge_answers = by_challenge.removed;
    let by_question = filter_by_question(&question_ids, by_challenge.kept);
    stats.unknown_question_answers = by_question.removed;

    let mut valid_items = Vec::new();
    for item in items.iter().filter(|item| scope.includes(&item.user_id)) {
        let mut item = item.clone();
        let before = item.activated_challenge_ids.len();
        item.activated_challenge_ids.retain(|challenge_id| challenge_ids.contains(challenge_id));
        stats.unknown_challenge_associations += before - item.activated_challenge_ids.len();
        valid_items.push(item);
    }
    stats.out_of_scope_items = items.len() - valid_items.len();

    let valid_item_ids = valid_items.iter().map(|item| item.id.clone()).collect::<BTreeSet<_>>();
    let mut replacements: BTreeMap<String, String> = BTreeMap::new();
    let mut planned_answers = Vec::with_capacity(by_question.kept.len());

    for mut answer in by_question.kept {
        if !scope.includes(&answer.user_id) {
            stats.out_of_scope_answers += 1;
            continue;
        }

        if !valid_item_ids.contains(&answer.item_id) {
            let to_item_id = match replacements.get(&answer.item_id) {
                Some(id) => id.clone(),
                None => {
                    let replacement =
                        find_replacement_item(&answer.item_id, &items, &scope.target_user)?;
                    replacements.insert(answer.item_id.clone(), replacement.id.clone());
                    replacement.id.clone()
                }
            };
            tracing::info!(
                answer_id = %answer.id,
                from = %answer.item_id,
                to = %to_item_id,
                "repaired dangling library item reference"
            );
            stats.repairs.push(Repair {
                answer_id: answer.id.clone(),
                from_item_id: std::mem::replace(&mut answer.item_id, to_item_id.clone()),
                to_item_id,
            });
        }

        planned_answers.push(answer);
    }

    Ok(MigrationPlan { challenges, items: valid_items, answers: planned_answers, stats })
}
