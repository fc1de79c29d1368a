use std::path::Path;

use anyhow::{anyhow, Context, Result};
use haasteikko_migrate_core::{
    Answer, Challenge, LibraryItem, MigrationError, MigrationPlan, Question, RecordKind,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Challenge rows migrated from the document store are shared, not user-authored.
const MIGRATED_CHALLENGE_KIND: &str = "shared";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS challenge (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  status TEXT NOT NULL,
  target_media TEXT NOT NULL,
  kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS question (
  id TEXT PRIMARY KEY,
  challenge_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  question TEXT NOT NULL,
  question_cluster_size INTEGER NOT NULL,
  number INTEGER NOT NULL,
  FOREIGN KEY (challenge_id) REFERENCES challenge(id)
);

CREATE TABLE IF NOT EXISTS library (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  title TEXT NOT NULL,
  author TEXT NOT NULL,
  added_at TEXT NOT NULL,
  completed_at TEXT,
  favorite INTEGER NOT NULL CHECK (favorite IN (0, 1)),
  translator TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS activated_item_challenge (
  item_id TEXT NOT NULL,
  challenge_id TEXT NOT NULL,
  PRIMARY KEY (item_id, challenge_id),
  FOREIGN KEY (item_id) REFERENCES library(id),
  FOREIGN KEY (challenge_id) REFERENCES challenge(id)
);

CREATE TABLE IF NOT EXISTS answer (
  id TEXT PRIMARY KEY,
  question_id TEXT NOT NULL,
  challenge_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  answer TEXT NOT NULL,
  answered INTEGER NOT NULL CHECK (answered IN (0, 1)),
  item_id TEXT NOT NULL,
  FOREIGN KEY (question_id) REFERENCES question(id),
  FOREIGN KEY (challenge_id) REFERENCES challenge(id),
  FOREIGN KEY (item_id) REFERENCES library(id)
);

CREATE INDEX IF NOT EXISTS idx_question_challenge ON question(challenge_id);
CREATE INDEX IF NOT EXISTS idx_library_user ON library(user_id);
CREATE INDEX IF NOT EXISTS idx_answer_user ON answer(user_id);
CREATE INDEX IF NOT EXISTS idx_answer_item ON answer(item_id);
";

/// Destination tables with the columns that order their rows, parents first.
const TABLES: [(&str, &str); 5] = [
    ("challenge", "id"),
    ("question", "id"),
    ("library", "id"),
    ("activated_item_challenge", "item_id, challenge_id"),
    ("answer", "id"),
];

pub struct SqliteDestination {
    conn: Connection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteSummary {
    pub challenges: usize,
    pub questions: usize,
    pub library_items: usize,
    pub associations: usize,
    pub answers: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts {
    pub challenge: i64,
    pub question: i64,
    pub library: i64,
    pub activated_item_challenge: i64,
    pub answer: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_version: i64,
}

impl SqliteDestination {
    /// Open the destination database and enable foreign-key enforcement.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create the destination schema if it is not there yet.
    ///
    /// # Errors
    /// Returns an error when schema bootstrapping fails or the recorded version is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to create destination tables")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        Ok(())
    }

    /// Upsert every record of `plan` inside one transaction.
    ///
    /// Challenges are written with their questions, then library items with their
    /// activated-challenge associations, then answers. Nothing is committed unless
    /// every statement succeeds.
    ///
    /// # Errors
    /// Returns an error wrapping [`MigrationError::Persistence`] for the first failed
    /// write; the transaction is rolled back.
    pub fn write_plan(&mut self, plan: &MigrationPlan) -> Result<WriteSummary> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        let mut summary = WriteSummary::default();

        for challenge in &plan.challenges {
            upsert_challenge(&tx, challenge)?;
            summary.challenges += 1;
            for question in &challenge.questions {
                upsert_question(&tx, &challenge.id, question)?;
                summary.questions += 1;
            }
        }

        for item in &plan.items {
            upsert_library_item(&tx, item)?;
            summary.library_items += 1;
            for challenge_id in &item.activated_challenge_ids {
                link_activated_challenge(&tx, &item.id, challenge_id)?;
                summary.associations += 1;
            }
        }

        for answer in &plan.answers {
            upsert_answer(&tx, answer)?;
            summary.answers += 1;
        }

        tx.commit().context("failed to commit migration transaction")?;
        tracing::info!(
            challenges = summary.challenges,
            library_items = summary.library_items,
            answers = summary.answers,
            "committed migration transaction"
        );
        Ok(summary)
    }

    /// Row count of every destination table.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn table_counts(&self) -> Result<TableCounts> {
        let count = |table: &str| -> Result<i64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count rows in {table}"))
        };

        Ok(TableCounts {
            challenge: count("challenge")?,
            question: count("question")?,
            library: count("library")?,
            activated_item_challenge: count("activated_item_challenge")?,
            answer: count("answer")?,
        })
    }

    /// SHA-256 over every destination row in primary-key order. Two databases with the
    /// same rows produce the same digest.
    ///
    /// # Errors
    /// Returns an error when a table cannot be read.
    pub fn content_digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();

        for (table, order_by) in TABLES {
            hasher.update(table.as_bytes());
            hasher.update(b"\n");

            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY {order_by}"))
                .with_context(|| format!("failed to read {table} for digest"))?;
            let columns = stmt.column_count();
            let mut rows = stmt.query([])?;

            while let Some(row) = rows.next()? {
                for index in 0..columns {
                    hash_value(&mut hasher, row.get_ref(index)?);
                }
                hasher.update(b"\n");
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Run quick-check and foreign-key-check health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_version: current_schema_version(&self.conn)?,
        })
    }
}

fn persistence(record: RecordKind, id: &str, err: &rusqlite::Error) -> anyhow::Error {
    anyhow::Error::new(MigrationError::Persistence {
        record,
        id: id.to_string(),
        message: err.to_string(),
    })
}

fn upsert_challenge(tx: &Transaction<'_>, challenge: &Challenge) -> Result<()> {
    tx.execute(
        "INSERT INTO challenge(id, name, status, target_media, kind)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           status = excluded.status,
           target_media = excluded.target_media,
           kind = excluded.kind",
        params![
            challenge.id,
            challenge.name,
            challenge.status,
            challenge.target_media,
            MIGRATED_CHALLENGE_KIND
        ],
    )
    .map_err(|err| persistence(RecordKind::Challenge, &challenge.id, &err))?;
    Ok(())
}

fn upsert_question(tx: &Transaction<'_>, challenge_id: &str, question: &Question) -> Result<()> {
    tx.execute(
        "INSERT INTO question(id, challenge_id, kind, question, question_cluster_size, number)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
           challenge_id = excluded.challenge_id,
           kind = excluded.kind,
           question = excluded.question,
           question_cluster_size = excluded.question_cluster_size,
           number = excluded.number",
        params![
            question.id,
            challenge_id,
            question.kind,
            question.question,
            question.question_cluster_size,
            question.number
        ],
    )
    .map_err(|err| persistence(RecordKind::Question, &question.id, &err))?;
    Ok(())
}

fn upsert_library_item(tx: &Transaction<'_>, item: &LibraryItem) -> Result<()> {
    tx.execute(
        "INSERT INTO library(
           id, user_id, kind, title, author, added_at, completed_at, favorite, translator
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
           user_id = excluded.user_id,
           kind = excluded.kind,
           title = excluded.title,
           author = excluded.author,
           added_at = excluded.added_at,
           completed_at = excluded.completed_at,
           favorite = excluded.favorite,
           translator = excluded.translator",
        params![
            item.id,
            item.user_id,
            item.kind,
            item.title(),
            item.author(),
            item.added_at,
            // The document store has no completion date; items count as completed when added.
            item.added_at,
            item.favorite,
            item.translator()
        ],
    )
    .map_err(|err| persistence(RecordKind::LibraryItem, &item.id, &err))?;
    Ok(())
}

fn link_activated_challenge(tx: &Transaction<'_>, item_id: &str, challenge_id: &str) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO activated_item_challenge(item_id, challenge_id) VALUES (?1, ?2)",
        params![item_id, challenge_id],
    )
    .map_err(|err| persistence(RecordKind::LibraryItem, item_id, &err))?;
    Ok(())
}

fn upsert_answer(tx: &Transaction<'_>, answer: &Answer) -> Result<()> {
    tx.execute(
        "INSERT INTO answer(id, question_id, challenge_id, user_id, kind, answer, answered, item_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
           question_id = excluded.question_id,
           challenge_id = excluded.challenge_id,
           user_id = excluded.user_id,
           kind = excluded.kind,
           answer = excluded.answer,
           answered = excluded.answered,
           item_id = excluded.item_id",
        params![
            answer.id,
            answer.question_id,
            answer.challenge_id,
            answer.user_id,
            answer.kind,
            answer.answer,
            answer.answered,
            answer.item_id
        ],
    )
    .map_err(|err| persistence(RecordKind::Answer, &answer.id, &err))?;
    Ok(())
}

fn hash_value(hasher: &mut Sha256, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => hasher.update(b"N;"),
        ValueRef::Integer(number) => hasher.update(format!("I{number};").as_bytes()),
        ValueRef::Real(number) => hasher.update(format!("R{number};").as_bytes()),
        ValueRef::Text(text) => {
            hasher.update(format!("T{}:", text.len()).as_bytes());
            hasher.update(text);
        }
        ValueRef::Blob(blob) => {
            hasher.update(format!("B{}:", blob.len()).as_bytes());
            hasher.update(blob);
        }
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
