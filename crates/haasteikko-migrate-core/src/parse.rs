//! Record parser: raw documents in, typed records out.
//!
//! Every parser first checks that all required fields are present (absent and `null`
//! both count as missing) and reports the complete list in one
//! [`MigrationError::MissingField`]. Only then are values extracted, so no partially
//! populated record is ever returned.

use serde_json::Value;

use crate::source::{Document, OWNER_FIELD};
use crate::{
    Answer, Challenge, LibraryItem, LibraryVariant, MigrationError, Question, RecordKind, RecordRef,
};

const CHALLENGE_FIELDS: [&str; 5] = ["id", "name", "status", "targetMedia", "questions"];
const QUESTION_FIELDS: [&str; 5] = ["kind", "question", "id", "number", "questionClusterSize"];
const LIBRARY_FIELDS: [&str; 6] =
    ["kind", "id", OWNER_FIELD, "addDate", "activatedChallengeIds", "favorite"];
const BOOK_FIELDS: [&str; 2] = ["title", "author"];
const GAME_FIELDS: [&str; 2] = ["title", "creator"];
const ANSWER_BATCH_FIELDS: [&str; 3] = [OWNER_FIELD, "challengeId", "answers"];
const ANSWER_ENTRY_FIELDS: [&str; 6] = ["kind", "id", "questionId", "answered", "answer", "itemId"];

/// Accumulates absent required fields across a document and its sub-objects.
#[derive(Default)]
struct RequiredFields {
    missing: Vec<String>,
}

impl RequiredFields {
    fn check(mut self, document: &Document, prefix: Option<&str>, fields: &[&str]) -> Self {
        for field in fields {
            if is_absent(document.get(*field)) {
                self.missing.push(match prefix {
                    Some(prefix) => format!("{prefix}.{field}"),
                    None => (*field).to_string(),
                });
            }
        }
        self
    }

    fn add(mut self, field: &str) -> Self {
        self.missing.push(field.to_string());
        self
    }

    fn finish(self, at: &RecordRef) -> Result<(), MigrationError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::MissingField { at: at.clone(), fields: self.missing })
        }
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn raw_str<'a>(document: &'a Document, field: &str) -> Option<&'a str> {
    document.get(field).and_then(Value::as_str)
}

fn invalid(at: &RecordRef, field: &str, expected: &'static str) -> MigrationError {
    MigrationError::InvalidField { at: at.clone(), field: field.to_string(), expected }
}

fn text(document: &Document, field: &str, at: &RecordRef) -> Result<String, MigrationError> {
    raw_str(document, field).map(str::to_string).ok_or_else(|| invalid(at, field, "a string"))
}

fn integer(document: &Document, field: &str, at: &RecordRef) -> Result<i64, MigrationError> {
    let value = match document.get(field) {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        _ => None,
    };
    value.ok_or_else(|| invalid(at, field, "an integer"))
}

fn boolean(document: &Document, field: &str, at: &RecordRef) -> Result<bool, MigrationError> {
    document.get(field).and_then(Value::as_bool).ok_or_else(|| invalid(at, field, "a boolean"))
}

fn text_list(
    document: &Document,
    field: &str,
    at: &RecordRef,
) -> Result<Vec<String>, MigrationError> {
    let Some(Value::Array(values)) = document.get(field) else {
        return Err(invalid(at, field, "an array of strings"));
    };
    values
        .iter()
        .map(|value| value.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid(at, field, "an array of strings"))
}

fn objects<'a>(
    document: &'a Document,
    field: &str,
    at: &RecordRef,
) -> Result<Vec<&'a Document>, MigrationError> {
    let Some(Value::Array(values)) = document.get(field) else {
        return Err(invalid(at, field, "an array of objects"));
    };
    values
        .iter()
        .map(Value::as_object)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid(at, field, "an array of objects"))
}

/// Optional sub-object; `null` is treated as absent.
fn sub_object<'a>(
    document: &'a Document,
    field: &str,
    at: &RecordRef,
) -> Result<Option<&'a Document>, MigrationError> {
    match document.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(object)) => Ok(Some(object)),
        Some(_) => Err(invalid(at, field, "an object")),
    }
}

/// Answer payloads are free-form; anything but a string is kept as compact JSON text.
fn payload(document: &Document, field: &str) -> String {
    match document.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Parse one question sub-document.
///
/// # Errors
/// Returns [`MigrationError::MissingField`] or [`MigrationError::InvalidField`].
pub fn parse_question(document: &Document) -> Result<Question, MigrationError> {
    let at = RecordRef::new(RecordKind::Question, raw_str(document, "id"));
    RequiredFields::default().check(document, None, &QUESTION_FIELDS).finish(&at)?;

    Ok(Question {
        kind: text(document, "kind", &at)?,
        question: text(document, "question", &at)?,
        id: text(document, "id", &at)?,
        number: integer(document, "number", &at)?,
        question_cluster_size: integer(document, "questionClusterSize", &at)?,
    })
}

/// Parse one challenge document including its ordered questions.
///
/// # Errors
/// Returns [`MigrationError::MissingField`] or [`MigrationError::InvalidField`] for the
/// challenge or the first malformed question.
pub fn parse_challenge(document: &Document) -> Result<Challenge, MigrationError> {
    let at = RecordRef::new(RecordKind::Challenge, raw_str(document, "id"));
    RequiredFields::default().check(document, None, &CHALLENGE_FIELDS).finish(&at)?;

    let questions = objects(document, "questions", &at)?
        .into_iter()
        .map(parse_question)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Challenge {
        id: text(document, "id", &at)?,
        name: text(document, "name", &at)?,
        status: text(document, "status", &at)?,
        target_media: text(document, "targetMedia", &at)?,
        questions,
    })
}

/// Parse one library document, dispatching on its `book` or `game` sub-object.
///
/// # Errors
/// Returns [`MigrationError::MissingField`] when a required field is absent, including
/// when neither variant sub-object is present, and [`MigrationError::InvalidField`] when
/// both are present or a value has the wrong type.
pub fn parse_library_item(document: &Document) -> Result<LibraryItem, MigrationError> {
    let at = RecordRef::new(RecordKind::LibraryItem, raw_str(document, "id"));
    let book = sub_object(document, "book", &at)?;
    let game = sub_object(document, "game", &at)?;

    let required = RequiredFields::default().check(document, None, &LIBRARY_FIELDS);
    let required = match (book, game) {
        (Some(book), None) => required.check(book, Some("book"), &BOOK_FIELDS),
        (None, Some(game)) => required.check(game, Some("game"), &GAME_FIELDS),
        (None, None) => required.add("book or game"),
        (Some(_), Some(_)) => {
            return Err(invalid(&at, "book/game", "exactly one of `book` or `game`"));
        }
    };
    required.finish(&at)?;

    let variant = match (book, game) {
        (Some(book), _) => LibraryVariant::Book {
            title: text(book, "title", &at)?,
            author: text(book, "author", &at)?,
            translator: match book.get("translator") {
                None | Some(Value::Null) => String::new(),
                Some(_) => text(book, "translator", &at)?,
            },
        },
        (None, Some(game)) => LibraryVariant::Game {
            title: text(game, "title", &at)?,
            creator: text(game, "creator", &at)?,
        },
        (None, None) => return Err(invalid(&at, "book/game", "exactly one of `book` or `game`")),
    };

    Ok(LibraryItem {
        kind: text(document, "kind", &at)?,
        id: text(document, "id", &at)?,
        user_id: text(document, OWNER_FIELD, &at)?,
        added_at: text(document, "addDate", &at)?,
        activated_challenge_ids: text_list(document, "activatedChallengeIds", &at)?,
        favorite: boolean(document, "favorite", &at)?,
        variant,
    })
}

/// Parse an answer envelope into its individual answers.
///
/// The first malformed entry aborts the whole batch.
///
/// # Errors
/// Returns [`MigrationError::MissingField`] or [`MigrationError::InvalidField`] naming
/// the envelope or the offending entry's kind and id.
pub fn parse_answer_batch(document: &Document) -> Result<Vec<Answer>, MigrationError> {
    let envelope = RecordRef::new(RecordKind::Answer, raw_str(document, "id"));
    RequiredFields::default().check(document, None, &ANSWER_BATCH_FIELDS).finish(&envelope)?;

    let user_id = text(document, OWNER_FIELD, &envelope)?;
    let challenge_id = text(document, "challengeId", &envelope)?;

    objects(document, "answers", &envelope)?
        .into_iter()
        .map(|entry| -> Result<Answer, MigrationError> {
            let at = RecordRef::new(RecordKind::Answer, raw_str(entry, "id"))
                .with_kind(raw_str(entry, "kind"));
            RequiredFields::default().check(entry, None, &ANSWER_ENTRY_FIELDS).finish(&at)?;

            Ok(Answer {
                kind: text(entry, "kind", &at)?,
                id: text(entry, "id", &at)?,
                question_id: text(entry, "questionId", &at)?,
                answered: boolean(entry, "answered", &at)?,
                answer: payload(entry, "answer"),
                item_id: text(entry, "itemId", &at)?,
                user_id: user_id.clone(),
                challenge_id: challenge_id.clone(),
            })
        })
        .collect()
}

/// # Errors
/// Fails on the first malformed challenge.
pub fn parse_challenges(documents: &[Document]) -> Result<Vec<Challenge>, MigrationError> {
    documents.iter().map(parse_challenge).collect()
}

/// # Errors
/// Fails on the first malformed library item.
pub fn parse_library_items(documents: &[Document]) -> Result<Vec<LibraryItem>, MigrationError> {
    documents.iter().map(parse_library_item).collect()
}

/// Flatten every answer envelope into one answer sequence, preserving order.
///
/// # Errors
/// Fails on the first malformed envelope or entry.
pub fn parse_answer_batches(documents: &[Document]) -> Result<Vec<Answer>, MigrationError> {
    let mut answers = Vec::new();
    for document in documents {
        answers.extend(parse_answer_batch(document)?);
    }
    Ok(answers)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(object) => object,
            other => panic!("fixture must be a JSON object, got {other}"),
        }
    }

    fn challenge_doc() -> Value {
        json!({
            "id": "c1",
            "name": "Reading challenge",
            "status": "published",
            "targetMedia": "book",
            "questions": [
                {"kind": "text", "question": "Read a classic", "id": "q1", "number": 1, "questionClusterSize": 1},
                {"kind": "choice", "question": "Read a poem", "id": "q2", "number": "2", "questionClusterSize": 3}
            ]
        })
    }

    fn book_doc() -> Value {
        json!({
            "kind": "book",
            "id": "i1",
            "userId": "u1",
            "addDate": "2024-05-01T10:00:00Z",
            "activatedChallengeIds": ["c1"],
            "favorite": true,
            "book": {"title": "Foo", "author": "Ann Author"}
        })
    }

    fn without(mut value: Value, key: &str) -> Value {
        if let Some(object) = value.as_object_mut() {
            object.remove(key);
        }
        value
    }

    fn missing_fields(result: Result<impl std::fmt::Debug, MigrationError>) -> Vec<String> {
        match result {
            Err(MigrationError::MissingField { fields, .. }) => fields,
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn parses_challenge_with_ordered_questions() -> Result<(), MigrationError> {
        let challenge = parse_challenge(&doc(challenge_doc()))?;

        assert_eq!(challenge.id, "c1");
        assert_eq!(challenge.target_media, "book");
        assert_eq!(
            challenge.questions.iter().map(|q| q.id.as_str()).collect::<Vec<_>>(),
            vec!["q1", "q2"]
        );
        assert_eq!(challenge.questions[1].number, 2);
        assert_eq!(challenge.questions[1].question_cluster_size, 3);
        Ok(())
    }

    #[test]
    fn challenge_reports_all_missing_fields_at_once() {
        let fields = missing_fields(parse_challenge(&doc(json!({"id": "c1", "status": null}))));
        assert_eq!(fields, vec!["name", "status", "targetMedia", "questions"]);
    }

    #[test]
    fn malformed_question_fails_the_challenge() {
        let mut value = challenge_doc();
        value["questions"][1]["number"] = json!("two");

        let err = parse_challenge(&doc(value));
        assert!(matches!(
            err,
            Err(MigrationError::InvalidField { ref at, ref field, .. })
                if at.record == RecordKind::Question
                    && at.id.as_deref() == Some("q2")
                    && field == "number"
        ));
    }

    #[test]
    fn parses_book_with_default_translator() -> Result<(), MigrationError> {
        let item = parse_library_item(&doc(book_doc()))?;

        assert_eq!(item.title(), "Foo");
        assert_eq!(item.author(), "Ann Author");
        assert_eq!(item.translator(), "");
        assert_eq!(item.activated_challenge_ids, vec!["c1"]);
        assert!(item.favorite);
        Ok(())
    }

    #[test]
    fn parses_game_author_from_creator() -> Result<(), MigrationError> {
        let mut value = without(book_doc(), "book");
        value["kind"] = json!("game");
        value["game"] = json!({"title": "Quest", "creator": "Studio"});

        let item = parse_library_item(&doc(value))?;
        assert_eq!(
            item.variant,
            LibraryVariant::Game { title: "Quest".to_string(), creator: "Studio".to_string() }
        );
        assert_eq!(item.translator(), "");
        Ok(())
    }

    #[test]
    fn library_item_without_variant_is_missing_field() {
        let mut value = without(book_doc(), "book");

        assert_eq!(missing_fields(parse_library_item(&doc(value))), vec!["book or game"]);
    }

    #[test]
    fn library_item_reports_nested_and_top_level_fields_together() {
        let mut value = without(book_doc(), "favorite");
        value["book"] = json!({"title": "Foo"});

        assert_eq!(
            missing_fields(parse_library_item(&doc(value))),
            vec!["favorite", "book.author"]
        );
    }

    #[test]
    fn game_without_creator_is_missing_field() {
        let mut value = without(book_doc(), "book");
        value["game"] = json!({"title": "Quest"});

        assert_eq!(missing_fields(parse_library_item(&doc(value))), vec!["game.creator"]);
    }

    #[test]
    fn library_item_with_both_variants_is_rejected() {
        let mut value = book_doc();
        value["game"] = json!({"title": "Quest", "creator": "Studio"});

        assert!(matches!(
            parse_library_item(&doc(value)),
            Err(MigrationError::InvalidField { ref field, .. }) if field == "book/game"
        ));
    }

    #[test]
    fn answer_batch_carries_envelope_owner_and_challenge() -> Result<(), MigrationError> {
        let answers = parse_answer_batch(&doc(json!({
            "id": "set-1",
            "userId": "u1",
            "challengeId": "c1",
            "answers": [
                {"kind": "text", "id": "a1", "questionId": "q1", "answered": true, "answer": "Dune", "itemId": "i1"},
                {"kind": "multi", "id": "a2", "questionId": "q2", "answered": false, "answer": ["x", 1], "itemId": "i1"}
            ]
        })))?;

        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].user_id, "u1");
        assert_eq!(answers[1].challenge_id, "c1");
        assert_eq!(answers[1].answer, r#"["x",1]"#);
        Ok(())
    }

    #[test]
    fn first_invalid_answer_entry_aborts_batch_with_kind_and_id() {
        let err = parse_answer_batch(&doc(json!({
            "userId": "u1",
            "challengeId": "c1",
            "answers": [
                {"kind": "text", "id": "a1", "questionId": "q1", "answered": true, "answer": "ok", "itemId": "i1"},
                {"kind": "text", "id": "a2", "answered": true, "answer": "no question"},
                {"kind": "text", "id": "a3"}
            ]
        })));

        match err {
            Err(MigrationError::MissingField { at, fields }) => {
                assert_eq!(at.id.as_deref(), Some("a2"));
                assert_eq!(at.kind.as_deref(), Some("text"));
                assert_eq!(fields, vec!["questionId", "itemId"]);
            }
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn parse_answer_batches_flattens_in_order() -> Result<(), MigrationError> {
        let batch = |user: &str, id: &str| {
            doc(json!({
                "userId": user,
                "challengeId": "c1",
                "answers": [{"kind": "text", "id": id, "questionId": "q1", "answered": true, "answer": "", "itemId": "i1"}]
            }))
        };

        let answers = parse_answer_batches(&[batch("u1", "a1"), batch("u2", "a2")])?;
        assert_eq!(answers.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["a1", "a2"]);
        assert_eq!(answers[1].user_id, "u2");
        Ok(())
    }

    fn field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 _-]{1,16}"
    }

    proptest! {
        #[test]
        fn property_library_round_trip_recovers_required_fields(
            id in field(),
            user in field(),
            title in field(),
            author in field(),
            favorite in any::<bool>(),
            is_book in any::<bool>(),
        ) {
            let mut value = json!({
                "kind": if is_book { "book" } else { "game" },
                "id": id,
                "userId": user,
                "addDate": "2024-01-01T00:00:00Z",
                "activatedChallengeIds": ["c1", "c2"],
                "favorite": favorite,
            });
            if is_book {
                value["book"] = json!({"title": title, "author": author, "translator": ""});
            } else {
                value["game"] = json!({"title": title, "creator": author});
            }

            let item = parse_library_item(&doc(value.clone()))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let reserialized = serde_json::to_value(&item)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(reserialized, value);
        }

        #[test]
        fn property_library_without_variant_always_fails(
            id in field(),
            extra in proptest::option::of(field()),
        ) {
            let mut value = json!({
                "kind": "book",
                "id": id,
                "userId": "u1",
                "addDate": "2024-01-01T00:00:00Z",
                "activatedChallengeIds": [],
                "favorite": false,
                "book": null,
            });
            if let Some(extra) = extra {
                value["note"] = json!(extra);
            }

            let is_missing_field = matches!(
                parse_library_item(&doc(value)),
                Err(MigrationError::MissingField { .. })
            );
            prop_assert!(is_missing_field);
        }

        #[test]
        fn property_question_round_trip_recovers_required_fields(
            id in field(),
            text in field(),
            number in 0_i64..500,
            cluster in 1_i64..10,
        ) {
            let value = json!({
                "kind": "text",
                "question": text,
                "id": id,
                "number": number,
                "questionClusterSize": cluster,
            });

            let question = parse_question(&doc(value.clone()))
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            let reserialized = serde_json::to_value(&question)
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
            prop_assert_eq!(reserialized, value);
        }
    }
}
