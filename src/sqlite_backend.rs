/*!
 * @file sqlite_backend.rs
 * @brief SQLite-family storage backend
 */

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::{
    id_key, validate_namespace, Backend, CappedSpec, CollectionInfo, CollectionStats,
    DatabaseStats, IndexSpec, QueryPlan, ResultStream, VecStream,
};
use crate::error::CommandError;

/// Everything lives in one SQLite database: a catalog table, one shared
/// documents table keyed by (db, coll), and an index-spec table. BSON bytes
/// are authoritative; the JSON column exists for pushdown predicates.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    db TEXT NOT NULL,
    coll TEXT NOT NULL,
    uuid TEXT NOT NULL,
    capped_size INTEGER,
    capped_max INTEGER,
    PRIMARY KEY (db, coll)
);
CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    db TEXT NOT NULL,
    coll TEXT NOT NULL,
    id_key TEXT NOT NULL,
    body BLOB NOT NULL,
    json TEXT NOT NULL,
    UNIQUE (db, coll, id_key)
);
CREATE INDEX IF NOT EXISTS documents_ns ON documents (db, coll, seq);
CREATE TABLE IF NOT EXISTS indexes (
    db TEXT NOT NULL,
    coll TEXT NOT NULL,
    name TEXT NOT NULL,
    spec TEXT NOT NULL,
    PRIMARY KEY (db, coll, name)
);
";

impl SqliteBackend {
    pub fn open(url: &str) -> Result<Self, CommandError> {
        let conn = match url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
        {
            Some(":memory:") | Some("") => Connection::open_in_memory(),
            Some(path) => Connection::open(path),
            None => Connection::open(url),
        }
        .map_err(|e| CommandError::internal(format!("sqlite open failed: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CommandError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CommandError::internal(format!("sqlite open failed: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, CommandError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| CommandError::internal(format!("sqlite schema setup failed: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn ensure_collection(&self, conn: &Connection, db: &str, coll: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO collections (db, coll, uuid) VALUES (?1, ?2, ?3)",
            params![db, coll, uuid::Uuid::new_v4().to_string()],
        )?;
        Ok(())
    }

    /// Synchronous create used by registry unit tests.
    pub fn create_collection_sync(&self, db: &str, coll: &str) -> Result<(), CommandError> {
        let conn = self.conn.lock();
        self.ensure_collection(&conn, db, coll)
            .map_err(map_sqlite_error)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> CommandError {
    CommandError::internal(format!("sqlite error: {}", e))
}

fn document_json(doc: &Document) -> Result<String, CommandError> {
    let value = Bson::Document(doc.clone()).into_relaxed_extjson();
    serde_json::to_string(&value)
        .map_err(|e| CommandError::internal(format!("json encoding failed: {}", e)))
}

fn document_bytes(doc: &Document) -> Result<Vec<u8>, CommandError> {
    bson::to_vec(doc).map_err(|e| CommandError::internal(format!("bson encoding failed: {}", e)))
}

fn parse_body(bytes: &[u8]) -> Result<Document, CommandError> {
    bson::from_slice(bytes)
        .map_err(|e| CommandError::internal(format!("stored document is corrupt: {}", e)))
}

/// Scalars SQLite can compare through json_extract. Booleans extract as 0/1,
/// which is what a bound bool becomes as well.
fn bind_scalar(v: &Bson) -> Option<Box<dyn rusqlite::ToSql>> {
    match v {
        Bson::String(s) => Some(Box::new(s.clone())),
        Bson::Int32(i) => Some(Box::new(*i as i64)),
        Bson::Int64(i) => Some(Box::new(*i)),
        Bson::Double(d) if d.is_finite() => Some(Box::new(*d)),
        Bson::Boolean(b) => Some(Box::new(*b)),
        _ => None,
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn list_databases(&self) -> Result<Vec<String>, CommandError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT db FROM collections ORDER BY db")
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(map_sqlite_error)
    }

    async fn create_database(&self, db: &str) -> Result<(), CommandError> {
        validate_namespace(db, "placeholder")?;
        Ok(())
    }

    async fn drop_database(&self, db: &str) -> Result<bool, CommandError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM documents WHERE db = ?1", params![db])
            .map_err(map_sqlite_error)?;
        conn.execute("DELETE FROM indexes WHERE db = ?1", params![db])
            .map_err(map_sqlite_error)?;
        let n = conn
            .execute("DELETE FROM collections WHERE db = ?1", params![db])
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn create_collection(
        &self,
        db: &str,
        coll: &str,
        capped: Option<CappedSpec>,
    ) -> Result<bool, CommandError> {
        validate_namespace(db, coll)?;
        let conn = self.conn.lock();
        let (size, max) = match &capped {
            Some(c) => (Some(c.size), c.max),
            None => (None, None),
        };
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO collections (db, coll, uuid, capped_size, capped_max)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![db, coll, uuid::Uuid::new_v4().to_string(), size, max],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn collection_exists(&self, db: &str, coll: &str) -> Result<bool, CommandError> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collections WHERE db = ?1 AND coll = ?2",
                params![db, coll],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_error)?;
        Ok(found.is_some())
    }

    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool, CommandError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM documents WHERE db = ?1 AND coll = ?2",
            params![db, coll],
        )
        .map_err(map_sqlite_error)?;
        conn.execute(
            "DELETE FROM indexes WHERE db = ?1 AND coll = ?2",
            params![db, coll],
        )
        .map_err(map_sqlite_error)?;
        let n = conn
            .execute(
                "DELETE FROM collections WHERE db = ?1 AND coll = ?2",
                params![db, coll],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn rename_collection(
        &self,
        db: &str,
        from: &str,
        to_db: &str,
        to: &str,
    ) -> Result<(), CommandError> {
        validate_namespace(to_db, to)?;
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collections WHERE db = ?1 AND coll = ?2",
                params![to_db, to],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite_error)?;
        if exists.is_some() {
            return Err(CommandError::namespace_exists(&format!("{}.{}", to_db, to)));
        }
        let n = conn
            .execute(
                "UPDATE collections SET db = ?1, coll = ?2 WHERE db = ?3 AND coll = ?4",
                params![to_db, to, db, from],
            )
            .map_err(map_sqlite_error)?;
        if n == 0 {
            return Err(CommandError::namespace_not_found(format!(
                "Source collection {}.{} does not exist",
                db, from
            )));
        }
        conn.execute(
            "UPDATE documents SET db = ?1, coll = ?2 WHERE db = ?3 AND coll = ?4",
            params![to_db, to, db, from],
        )
        .map_err(map_sqlite_error)?;
        conn.execute(
            "UPDATE indexes SET db = ?1, coll = ?2 WHERE db = ?3 AND coll = ?4",
            params![to_db, to, db, from],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    async fn list_collections(&self, db: &str) -> Result<Vec<CollectionInfo>, CommandError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT coll, uuid, capped_size, capped_max FROM collections
                 WHERE db = ?1 ORDER BY coll",
            )
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![db], |row| {
                let name: String = row.get(0)?;
                let uuid: String = row.get(1)?;
                let capped_size: Option<i64> = row.get(2)?;
                let capped_max: Option<i64> = row.get(3)?;
                Ok((name, uuid, capped_size, capped_max))
            })
            .map_err(map_sqlite_error)?;

        let mut out = Vec::new();
        for row in rows {
            let (name, uuid, capped_size, capped_max) = row.map_err(map_sqlite_error)?;
            out.push(CollectionInfo {
                name,
                uuid: uuid.parse().unwrap_or_else(|_| uuid::Uuid::new_v4()),
                capped: capped_size.map(|size| CappedSpec {
                    size,
                    max: capped_max,
                }),
            });
        }
        Ok(out)
    }

    async fn insert_one(&self, db: &str, coll: &str, doc: &Document) -> Result<(), CommandError> {
        validate_namespace(db, coll)?;
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        let body = document_bytes(doc)?;
        let json = document_json(doc)?;

        let conn = self.conn.lock();
        self.ensure_collection(&conn, db, coll)
            .map_err(map_sqlite_error)?;
        match conn.execute(
            "INSERT INTO documents (db, coll, id_key, body, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![db, coll, id_key(&id), body, json],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CommandError::duplicate_key(
                    &format!("{}.{}", db, coll),
                    &format!("{{ _id: {} }}", id),
                ))
            }
            Err(e) => Err(map_sqlite_error(e)),
        }
    }

    async fn query(
        &self,
        db: &str,
        coll: &str,
        plan: &QueryPlan,
    ) -> Result<Box<dyn ResultStream>, CommandError> {
        let conn = self.conn.lock();

        let mut sql = String::from("SELECT body FROM documents WHERE db = ?1 AND coll = ?2");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(db.to_string()),
            Box::new(coll.to_string()),
        ];

        for (field, value) in &plan.filter.equalities {
            let Some(bound) = bind_scalar(value) else {
                return Err(CommandError::internal(format!(
                    "unpushable equality on '{}' reached the sqlite backend",
                    field
                )));
            };
            binds.push(bound);
            sql.push_str(&format!(
                " AND json_extract(json, '{}') = ?{}",
                json_path(field),
                binds.len()
            ));
        }

        match &plan.sort {
            Some((field, dir)) => {
                sql.push_str(&format!(
                    " ORDER BY json_extract(json, '{}') {}, seq",
                    json_path(field),
                    if *dir < 0 { "DESC" } else { "ASC" }
                ));
            }
            None => sql.push_str(" ORDER BY seq"),
        }
        if let Some(limit) = plan.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
            if let Some(skip) = plan.skip {
                sql.push_str(&format!(" OFFSET {}", skip));
            }
        } else if let Some(skip) = plan.skip {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip));
        }

        let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
        let params: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| row.get::<_, Vec<u8>>(0))
            .map_err(map_sqlite_error)?;

        let mut docs = Vec::new();
        for row in rows {
            let bytes = row.map_err(map_sqlite_error)?;
            docs.push(parse_body(&bytes)?);
        }
        Ok(Box::new(VecStream::new(docs)))
    }

    async fn replace_by_id(
        &self,
        db: &str,
        coll: &str,
        id: &Bson,
        doc: &Document,
    ) -> Result<bool, CommandError> {
        let body = document_bytes(doc)?;
        let json = document_json(doc)?;
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE documents SET body = ?1, json = ?2
                 WHERE db = ?3 AND coll = ?4 AND id_key = ?5",
                params![body, json, db, coll, id_key(id)],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn delete_by_id(&self, db: &str, coll: &str, id: &Bson) -> Result<bool, CommandError> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "DELETE FROM documents WHERE db = ?1 AND coll = ?2 AND id_key = ?3",
                params![db, coll, id_key(id)],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn delete_oldest(&self, db: &str, coll: &str, n: i64) -> Result<i64, CommandError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM documents WHERE seq IN (
                     SELECT seq FROM documents WHERE db = ?1 AND coll = ?2
                     ORDER BY seq LIMIT ?3
                 )",
                params![db, coll, n],
            )
            .map_err(map_sqlite_error)?;
        Ok(deleted as i64)
    }

    async fn create_index(
        &self,
        db: &str,
        coll: &str,
        spec: &IndexSpec,
    ) -> Result<bool, CommandError> {
        let json = serde_json::to_string(spec)
            .map_err(|e| CommandError::internal(format!("index spec encoding failed: {}", e)))?;
        let conn = self.conn.lock();
        self.ensure_collection(&conn, db, coll)
            .map_err(map_sqlite_error)?;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO indexes (db, coll, name, spec) VALUES (?1, ?2, ?3, ?4)",
                params![db, coll, spec.name, json],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<bool, CommandError> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "DELETE FROM indexes WHERE db = ?1 AND coll = ?2 AND name = ?3",
                params![db, coll, name],
            )
            .map_err(map_sqlite_error)?;
        Ok(n > 0)
    }

    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<IndexSpec>, CommandError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT spec FROM indexes WHERE db = ?1 AND coll = ?2 ORDER BY name")
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![db, coll], |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?;

        let mut out = vec![IndexSpec::id_index()];
        for row in rows {
            let json = row.map_err(map_sqlite_error)?;
            let spec: IndexSpec = serde_json::from_str(&json)
                .map_err(|e| CommandError::internal(format!("corrupt index spec: {}", e)))?;
            if spec.name != "_id_" {
                out.push(spec);
            }
        }
        Ok(out)
    }

    async fn collection_stats(
        &self,
        db: &str,
        coll: &str,
    ) -> Result<CollectionStats, CommandError> {
        let conn = self.conn.lock();
        let (count, size): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(LENGTH(body)) FROM documents WHERE db = ?1 AND coll = ?2",
                params![db, coll],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(map_sqlite_error)?;
        let capped: Option<CappedSpec> = conn
            .query_row(
                "SELECT capped_size, capped_max FROM collections WHERE db = ?1 AND coll = ?2",
                params![db, coll],
                |row| {
                    let size: Option<i64> = row.get(0)?;
                    let max: Option<i64> = row.get(1)?;
                    Ok(size.map(|size| CappedSpec { size, max }))
                },
            )
            .optional()
            .map_err(map_sqlite_error)?
            .flatten();
        Ok(CollectionStats {
            count,
            size_bytes: size.unwrap_or(0),
            capped,
        })
    }

    async fn database_stats(&self, db: &str) -> Result<DatabaseStats, CommandError> {
        let conn = self.conn.lock();
        let collections: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM collections WHERE db = ?1",
                params![db],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;
        let (objects, data_size): (i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(LENGTH(body)) FROM documents WHERE db = ?1",
                params![db],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(map_sqlite_error)?;
        Ok(DatabaseStats {
            collections,
            objects,
            data_size: data_size.unwrap_or(0),
        })
    }

    fn supports_pushdown(&self, plan: &QueryPlan) -> bool {
        let scalars_ok = plan
            .filter
            .equalities
            .iter()
            .all(|(field, value)| !field.contains('.') && bind_scalar(value).is_some());
        let sort_ok = plan
            .sort
            .as_ref()
            .map(|(field, _)| !field.contains('.'))
            .unwrap_or(true);
        scalars_ok && sort_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::PushdownFilter;
    use bson::doc;

    #[tokio::test]
    async fn insert_query_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .insert_one("db", "c", &doc! {"_id": 1, "v": "x"})
            .await
            .unwrap();
        backend
            .insert_one("db", "c", &doc! {"_id": 2, "v": "y"})
            .await
            .unwrap();

        let mut stream = backend
            .query("db", "c", &QueryPlan::full_scan())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap(), Some(doc! {"_id": 1, "v": "x"}));
        assert_eq!(stream.next().await.unwrap(), Some(doc! {"_id": 2, "v": "y"}));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_id_maps_to_11000() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .insert_one("db", "c", &doc! {"_id": 1})
            .await
            .unwrap();
        let err = backend
            .insert_one("db", "c", &doc! {"_id": 1})
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::code::DUPLICATE_KEY);
        assert!(err.message.starts_with("E11000 duplicate key error"));
    }

    #[tokio::test]
    async fn equality_pushdown_filters_rows() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for i in 0..10 {
            backend
                .insert_one("db", "c", &doc! {"_id": i, "v": if i % 2 == 0 { "even" } else { "odd" }})
                .await
                .unwrap();
        }
        let plan = QueryPlan {
            filter: PushdownFilter {
                equalities: vec![("v".to_string(), Bson::String("even".to_string()))],
            },
            pushdown: true,
            ..Default::default()
        };
        assert!(backend.supports_pushdown(&plan));
        let stream = backend.query("db", "c", &plan).await.unwrap();
        let docs = crate::aggregation::collect(stream).await.unwrap();
        assert_eq!(docs.len(), 5);
    }

    #[tokio::test]
    async fn capped_eviction_deletes_oldest() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for i in 0..10 {
            backend
                .insert_one("db", "c", &doc! {"_id": i})
                .await
                .unwrap();
        }
        assert_eq!(backend.delete_oldest("db", "c", 3).await.unwrap(), 3);
        let stream = backend
            .query("db", "c", &QueryPlan::full_scan())
            .await
            .unwrap();
        let docs = crate::aggregation::collect(stream).await.unwrap();
        assert_eq!(docs[0], doc! {"_id": 3});
    }
}
