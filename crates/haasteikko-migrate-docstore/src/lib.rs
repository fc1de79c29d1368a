//! File-backed document store: one newline-delimited JSON file per container under
//! `<root>/<database>/`. Documents are append-only and ids are unique per container.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use haasteikko_migrate_core::{Document, DocumentStore, StoreError, OWNER_FIELD};
use serde_json::Value;

const CONTAINER_EXTENSION: &str = "ndjson";

#[derive(Debug, Clone)]
pub struct NdjsonDocumentStore {
    database_dir: PathBuf,
}

impl NdjsonDocumentStore {
    /// Open database `database` under `root`.
    ///
    /// # Errors
    /// Returns an error when the database directory does not exist.
    pub fn open(root: &Path, database: &str) -> Result<Self> {
        let database_dir = root.join(database);
        if !database_dir.is_dir() {
            return Err(anyhow!("document database not found at {}", database_dir.display()));
        }
        tracing::debug!(path = %database_dir.display(), "opened document database");
        Ok(Self { database_dir })
    }

    #[must_use]
    pub fn container_path(&self, container: &str) -> PathBuf {
        self.database_dir.join(format!("{container}.{CONTAINER_EXTENSION}"))
    }

    fn append(&self, container: &str, document: &Document) -> Result<()> {
        let path = self.container_path(container);
        let line = serde_json::to_string(document).context("failed to serialize document")?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open container file {}", path.display()))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .with_context(|| format!("failed to append to container file {}", path.display()))?;
        Ok(())
    }
}

impl DocumentStore for NdjsonDocumentStore {
    fn query(&self, container: &str, owner: Option<&str>) -> Result<Vec<Document>, StoreError> {
        let documents = read_container(&self.container_path(container)).map_err(|err| {
            StoreError::ContainerUnavailable {
                container: container.to_string(),
                message: format!("{err:#}"),
            }
        })?;

        Ok(match owner {
            Some(owner) => documents
                .into_iter()
                .filter(|document| document.get(OWNER_FIELD).and_then(Value::as_str) == Some(owner))
                .collect(),
            None => documents,
        })
    }

    fn create(&mut self, container: &str, document: &Document) -> Result<(), StoreError> {
        let id = document.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let write_error = |err: anyhow::Error| StoreError::Write {
            container: container.to_string(),
            id: id.clone(),
            message: format!("{err:#}"),
        };

        if id.is_empty() {
            return Err(write_error(anyhow!("document has no string id")));
        }

        let existing = read_container(&self.container_path(container)).map_err(write_error)?;
        let duplicate = existing
            .iter()
            .any(|document| document.get("id").and_then(Value::as_str) == Some(id.as_str()));
        if duplicate {
            return Err(StoreError::Conflict { container: container.to_string(), id: id.clone() });
        }

        self.append(container, document).map_err(write_error)
    }
}

fn read_container(path: &Path) -> Result<Vec<Document>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open container file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut documents = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse document {} from {}", index + 1, path.display())
        })?;
        match value {
            Value::Object(document) => documents.push(document),
            _ => {
                return Err(anyhow!(
                    "document {} in {} is not a JSON object",
                    index + 1,
                    path.display()
                ))
            }
        }
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use haasteikko_migrate_core::LIBRARY_CONTAINER;
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Document {
        match value {
            Value::Object(document) => document,
            other => panic!("expected object, got {other}"),
        }
    }

    fn seeded_store(lines: &str) -> Result<(tempfile::TempDir, NdjsonDocumentStore)> {
        let dir = tempfile::tempdir()?;
        let database = dir.path().join("testdb");
        fs::create_dir_all(&database)?;
        fs::write(database.join("library.ndjson"), lines)?;
        let store = NdjsonDocumentStore::open(dir.path(), "testdb")?;
        Ok((dir, store))
    }

    #[test]
    fn open_rejects_missing_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(NdjsonDocumentStore::open(dir.path(), "absent").is_err());
        Ok(())
    }

    #[test]
    fn query_filters_by_owner_and_skips_blank_lines() -> Result<()> {
        let (_dir, store) = seeded_store(
            "{\"id\":\"i1\",\"userId\":\"u1\"}\n\n{\"id\":\"i2\",\"userId\":\"u2\"}\n",
        )?;

        let all = store.query(LIBRARY_CONTAINER, None)?;
        assert_eq!(all.len(), 2);

        let owned = store.query(LIBRARY_CONTAINER, Some("u2"))?;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0]["id"], "i2");
        Ok(())
    }

    #[test]
    fn missing_container_is_unavailable() -> Result<()> {
        let (_dir, store) = seeded_store("")?;
        match store.query("answers", None) {
            Err(StoreError::ContainerUnavailable { container, .. }) => {
                assert_eq!(container, "answers");
            }
            other => panic!("expected unavailable container, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn malformed_line_makes_container_unavailable() -> Result<()> {
        let (_dir, store) = seeded_store("{\"id\":\"i1\"}\n[1,2]\n")?;
        assert!(matches!(
            store.query(LIBRARY_CONTAINER, None),
            Err(StoreError::ContainerUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn create_appends_and_rejects_duplicate_ids() -> Result<()> {
        let (_dir, mut store) = seeded_store("{\"id\":\"i1\",\"userId\":\"u1\"}\n")?;

        store.create(LIBRARY_CONTAINER, &object(json!({"id": "i2", "userId": "u9"})))?;
        assert_eq!(store.query(LIBRARY_CONTAINER, Some("u9"))?.len(), 1);

        match store.create(LIBRARY_CONTAINER, &object(json!({"id": "i1", "userId": "u9"}))) {
            Err(StoreError::Conflict { id, .. }) => assert_eq!(id, "i1"),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(store.query(LIBRARY_CONTAINER, None)?.len(), 2);
        Ok(())
    }

    #[test]
    fn create_requires_existing_container_and_id() -> Result<()> {
        let (_dir, mut store) = seeded_store("")?;

        assert!(matches!(
            store.create("answers", &object(json!({"id": "a1"}))),
            Err(StoreError::Write { .. })
        ));
        assert!(matches!(
            store.create(LIBRARY_CONTAINER, &object(json!({"userId": "u1"}))),
            Err(StoreError::Write { .. })
        ));
        Ok(())
    }
}
