use serde_json::{Map, Value};

/// A raw, schema-less document as held by the document store.
pub type Document = Map<String, Value>;

pub const CHALLENGES_CONTAINER: &str = "challenges";
pub const LIBRARY_CONTAINER: &str = "library";
pub const ANSWERS_CONTAINER: &str = "answers";

/// Field holding the owning user id on library and answer documents.
pub const OWNER_FIELD: &str = "userId";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("container {container} is unavailable: {message}")]
    ContainerUnavailable { container: String, message: String },
    #[error("document '{id}' already exists in container {container}")]
    Conflict { container: String, id: String },
    #[error("failed to write document '{id}' to container {container}: {message}")]
    Write { container: String, id: String, message: String },
}

/// Source-side collaborator: a document database with create-only writes.
pub trait DocumentStore {
    /// Return every document in `container`, optionally only those whose
    /// [`OWNER_FIELD`] equals `owner`.
    ///
    /// # Errors
    /// Returns [`StoreError::ContainerUnavailable`] when the container cannot be read.
    fn query(&self, container: &str, owner: Option<&str>) -> Result<Vec<Document>, StoreError>;

    /// Persist `document` as a new document in `container`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write is rejected or fails.
    fn create(&mut self, container: &str, document: &Document) -> Result<(), StoreError>;
}

/// Fetch a whole container. An unreadable container is logged and treated as empty.
pub fn fetch_all<S: DocumentStore + ?Sized>(
    store: &S,
    container: &str,
    owner: Option<&str>,
) -> Vec<Document> {
    tracing::info!(container, owner = owner.unwrap_or("*"), "fetching documents");
    match store.query(container, owner) {
        Ok(documents) => {
            tracing::info!(container, count = documents.len(), "fetched documents");
            documents
        }
        Err(err) => {
            tracing::warn!(container, "could not read container: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::*;

    type WriteFilter = Box<dyn Fn(&str, &Document) -> bool>;

    fn owned_by(document: &Document, owner: &str) -> bool {
        document.get(OWNER_FIELD).and_then(Value::as_str) == Some(owner)
    }

    /// In-memory store for engine tests; `reject` decides which creates fail.
    #[derive(Default)]
    pub(crate) struct MemoryDocumentStore {
        pub(crate) containers: BTreeMap<String, Vec<Document>>,
        reject: Option<WriteFilter>,
    }

    impl MemoryDocumentStore {
        pub(crate) fn with_container(mut self, container: &str, documents: Vec<Value>) -> Self {
            let documents = documents
                .into_iter()
                .filter_map(|value| match value {
                    Value::Object(object) => Some(object),
                    _ => None,
                })
                .collect();
            self.containers.insert(container.to_string(), documents);
            self
        }

        pub(crate) fn rejecting(
            mut self,
            reject: impl Fn(&str, &Document) -> bool + 'static,
        ) -> Self {
            self.reject = Some(Box::new(reject));
            self
        }

        pub(crate) fn documents(&self, container: &str) -> &[Document] {
            self.containers.get(container).map_or(&[], Vec::as_slice)
        }
    }

    impl DocumentStore for MemoryDocumentStore {
        fn query(&self, container: &str, owner: Option<&str>) -> Result<Vec<Document>, StoreError> {
            let documents = self.containers.get(container).ok_or_else(|| {
                StoreError::ContainerUnavailable {
                    container: container.to_string(),
                    message: "no such container".to_string(),
                }
            })?;
            Ok(documents
                .iter()
                .filter(|document| match owner {
                    Some(owner) => owned_by(document, owner),
                    None => true,
                })
                .cloned()
                .collect())
        }

        fn create(&mut self, container: &str, document: &Document) -> Result<(), StoreError> {
            let id = document.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            if self.reject.as_ref().is_some_and(|reject| reject(container, document)) {
                return Err(StoreError::Write {
                    container: container.to_string(),
                    id,
                    message: "rejected by test store".to_string(),
                });
            }
            self.containers.entry(container.to_string()).or_default().push(document.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::MemoryDocumentStore;
    use super::*;

    #[test]
    fn fetch_all_treats_missing_container_as_empty() {
        let store = MemoryDocumentStore::default();
        assert!(fetch_all(&store, CHALLENGES_CONTAINER, None).is_empty());
    }

    #[test]
    fn fetch_all_applies_owner_predicate() {
        let store = MemoryDocumentStore::default().with_container(
            LIBRARY_CONTAINER,
            vec![
                json!({"id": "i1", "userId": "u1"}),
                json!({"id": "i2", "userId": "u2"}),
                json!({"id": "i3"}),
            ],
        );

        let owned = fetch_all(&store, LIBRARY_CONTAINER, Some("u1"));
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0]["id"], "i1");
        assert_eq!(fetch_all(&store, LIBRARY_CONTAINER, None).len(), 3);
    }
}
