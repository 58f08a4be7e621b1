/*!
 * @file backend.rs
 * @brief Storage backend abstraction shared by PostgreSQL and SQLite
 */

use std::collections::VecDeque;

use async_trait::async_trait;
use bson::{doc, Bson, Document};

use crate::error::CommandError;
use crate::filter::PushdownFilter;
use crate::ordering;

/// Forward-only stream of documents produced by a backend query.
///
/// The position token is monotonic and used only to log continuity; a stream
/// cannot be rewound at the cursor layer.
#[async_trait]
pub trait ResultStream: Send {
    async fn next(&mut self) -> Result<Option<Document>, CommandError>;
    fn position(&self) -> u64;
    async fn close(&mut self) {}
}

/// In-memory stream; backends use it for materialized result sets and the
/// engine tests feed pipelines with it directly.
pub struct VecStream {
    docs: VecDeque<Document>,
    pos: u64,
}

impl VecStream {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs: docs.into(),
            pos: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ResultStream for VecStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        match self.docs.pop_front() {
            Some(doc) => {
                self.pos += 1;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }
}

/// What a query hands to the backend. When `pushdown` is set the plan covers
/// the entire filter/sort and no residual evaluation is needed; otherwise the
/// backend scans and the engine filters the stream.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub filter: PushdownFilter,
    pub sort: Option<(String, i8)>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub pushdown: bool,
}

impl QueryPlan {
    pub fn full_scan() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CappedSpec {
    pub size: i64,
    pub max: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub capped: Option<CappedSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
    pub sparse: bool,
    pub expire_after_seconds: Option<i64>,
}

impl IndexSpec {
    /// The implicit `_id_` index every collection carries.
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: vec![("_id".to_string(), 1)],
            unique: false,
            sparse: false,
            expire_after_seconds: None,
        }
    }

    pub fn key_document(&self) -> Document {
        let mut key = Document::new();
        for (field, dir) in &self.keys {
            key.insert(field.clone(), Bson::Int32(*dir));
        }
        key
    }

    pub fn to_document(&self, ns: &str) -> Document {
        let mut out = doc! {
            "v": 2,
            "key": self.key_document(),
            "name": self.name.clone(),
            "ns": ns,
        };
        if self.unique {
            out.insert("unique", true);
        }
        if self.sparse {
            out.insert("sparse", true);
        }
        if let Some(ttl) = self.expire_after_seconds {
            out.insert("expireAfterSeconds", Bson::Int64(ttl));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionStats {
    pub count: i64,
    pub size_bytes: i64,
    pub capped: Option<CappedSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub collections: i64,
    pub objects: i64,
    pub data_size: i64,
}

/// Uniform storage interface. Writes with per-document semantics (batching,
/// error accumulation, upserts) are driven by the write coordinator on top of
/// the single-document operations here.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_databases(&self) -> Result<Vec<String>, CommandError>;
    async fn create_database(&self, db: &str) -> Result<(), CommandError>;
    async fn drop_database(&self, db: &str) -> Result<bool, CommandError>;

    /// Returns false when the collection already existed.
    async fn create_collection(
        &self,
        db: &str,
        coll: &str,
        capped: Option<CappedSpec>,
    ) -> Result<bool, CommandError>;
    async fn collection_exists(&self, db: &str, coll: &str) -> Result<bool, CommandError>;
    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool, CommandError>;
    async fn rename_collection(
        &self,
        db: &str,
        from: &str,
        to_db: &str,
        to: &str,
    ) -> Result<(), CommandError>;
    async fn list_collections(&self, db: &str) -> Result<Vec<CollectionInfo>, CommandError>;

    async fn insert_one(&self, db: &str, coll: &str, doc: &Document) -> Result<(), CommandError>;
    async fn query(
        &self,
        db: &str,
        coll: &str,
        plan: &QueryPlan,
    ) -> Result<Box<dyn ResultStream>, CommandError>;
    async fn replace_by_id(
        &self,
        db: &str,
        coll: &str,
        id: &Bson,
        doc: &Document,
    ) -> Result<bool, CommandError>;
    async fn delete_by_id(&self, db: &str, coll: &str, id: &Bson) -> Result<bool, CommandError>;
    /// Removes the n oldest documents in insertion order; the capped janitor's
    /// eviction primitive.
    async fn delete_oldest(&self, db: &str, coll: &str, n: i64) -> Result<i64, CommandError>;

    async fn create_index(
        &self,
        db: &str,
        coll: &str,
        spec: &IndexSpec,
    ) -> Result<bool, CommandError>;
    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<bool, CommandError>;
    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<IndexSpec>, CommandError>;

    async fn collection_stats(&self, db: &str, coll: &str)
        -> Result<CollectionStats, CommandError>;
    async fn database_stats(&self, db: &str) -> Result<DatabaseStats, CommandError>;

    /// Whether the backend can execute this plan natively. Consulted by
    /// `explain` so pushdown reporting reflects what actually ran.
    fn supports_pushdown(&self, plan: &QueryPlan) -> bool;
}

/// Canonical text key for `_id` uniqueness enforcement in relational storage.
pub fn id_key(id: &Bson) -> String {
    ordering::canonical_key(id)
}

/// Collection and database name validation shared by every backend.
pub fn validate_namespace(db: &str, coll: &str) -> Result<(), CommandError> {
    if db.is_empty() {
        return Err(CommandError::invalid_namespace("database name cannot be empty"));
    }
    if coll.is_empty() {
        return Err(CommandError::invalid_namespace(
            "Collection names cannot be empty",
        ));
    }
    if db.contains(|c: char| c == '/' || c == '\\' || c == '.' || c == '"' || c == '\0')
        || db.contains(' ')
    {
        return Err(CommandError::invalid_namespace(format!(
            "Invalid database name: '{}'",
            db
        )));
    }
    if coll.starts_with("system.") || coll.contains('$') || coll.contains('\0') {
        return Err(CommandError::invalid_namespace(format!(
            "Invalid collection name: {}",
            coll
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vec_stream_pumps_in_order() {
        let mut s = VecStream::new(vec![doc! {"i": 1}, doc! {"i": 2}]);
        assert_eq!(s.next().await.unwrap(), Some(doc! {"i": 1}));
        assert_eq!(s.position(), 1);
        assert_eq!(s.next().await.unwrap(), Some(doc! {"i": 2}));
        assert_eq!(s.next().await.unwrap(), None);
    }

    #[test]
    fn namespace_validation() {
        assert!(validate_namespace("db", "coll").is_ok());
        assert!(validate_namespace("db", "").is_err());
        assert!(validate_namespace("", "coll").is_err());
        assert!(validate_namespace("db", "a$b").is_err());
    }
}
