/*!
 * @file postgres_backend.rs
 * @brief PostgreSQL-family storage backend (JSONB per collection)
 */

use async_trait::async_trait;
use bson::{Bson, Document};
use deadpool_postgres::{Manager, Pool};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::backend::{
    id_key, validate_namespace, Backend, CappedSpec, CollectionInfo, CollectionStats,
    DatabaseStats, IndexSpec, QueryPlan, ResultStream, VecStream,
};
use crate::error::CommandError;

const SCHEMA_PREFIX: &str = "doppel_";
const METADATA_TABLE: &str = "_doppel_metadata";
const INDEX_TABLE: &str = "_doppel_indexes";

/// One schema per logical database, one table per collection. BSON bytes are
/// the authoritative representation; the JSONB column carries the same
/// document for native predicates and ordering.
pub struct PostgresBackend {
    pool: Pool,
}

impl PostgresBackend {
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, CommandError> {
        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| CommandError::internal(format!("invalid PostgreSQL URL: {}", e)))?;
        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| CommandError::internal(format!("failed to build pool: {}", e)))?;

        // One round trip up front so a bad DSN fails at startup, not on the
        // first client command.
        let client = pool
            .get()
            .await
            .map_err(|e| CommandError::internal(format!("failed to connect: {}", e)))?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(map_pg_error)?;
        drop(client);

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, CommandError> {
        self.pool
            .get()
            .await
            .map_err(|e| CommandError::internal(format!("connection pool exhausted: {}", e)))
    }

    async fn ensure_collection(
        &self,
        client: &deadpool_postgres::Object,
        db: &str,
        coll: &str,
        capped: Option<&CappedSpec>,
    ) -> Result<bool, CommandError> {
        let schema = schema_name(db);
        client
            .execute(
                &*format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema)),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        client
            .execute(
                &*format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (
                         coll TEXT PRIMARY KEY,
                         uuid TEXT NOT NULL,
                         capped_size BIGINT,
                         capped_max BIGINT
                     )",
                    quote_ident(&schema),
                    METADATA_TABLE
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        client
            .execute(
                &*format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (
                         coll TEXT NOT NULL,
                         name TEXT NOT NULL,
                         spec JSONB NOT NULL,
                         PRIMARY KEY (coll, name)
                     )",
                    quote_ident(&schema),
                    INDEX_TABLE
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        client
            .execute(
                &*format!(
                    "CREATE TABLE IF NOT EXISTS {}.{} (
                         seq BIGSERIAL PRIMARY KEY,
                         id_key TEXT NOT NULL UNIQUE,
                         document JSONB NOT NULL,
                         body BYTEA NOT NULL
                     )",
                    quote_ident(&schema),
                    quote_ident(coll)
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;

        let (size, max) = match capped {
            Some(c) => (Some(c.size), c.max),
            None => (None, None),
        };
        let inserted = client
            .execute(
                &*format!(
                    "INSERT INTO {}.{} (coll, uuid, capped_size, capped_max)
                     VALUES ($1, $2, $3, $4) ON CONFLICT (coll) DO NOTHING",
                    quote_ident(&schema),
                    METADATA_TABLE
                ),
                &[
                    &coll,
                    &uuid::Uuid::new_v4().to_string(),
                    &size,
                    &max,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(inserted > 0)
    }
}

fn schema_name(db: &str) -> String {
    format!("{}{}", SCHEMA_PREFIX, db)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn map_pg_error(e: tokio_postgres::Error) -> CommandError {
    // Message kept generic; DSNs and file paths never reach clients.
    CommandError::internal(format!("backend error: {}", e))
}

fn document_json(doc: &Document) -> serde_json::Value {
    Bson::Document(doc.clone()).into_relaxed_extjson()
}

fn parse_body(bytes: &[u8]) -> Result<Document, CommandError> {
    bson::from_slice(bytes)
        .map_err(|e| CommandError::internal(format!("stored document is corrupt: {}", e)))
}

fn is_undefined_table(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(state)
            if *state == SqlState::UNDEFINED_TABLE || *state == SqlState::INVALID_SCHEMA_NAME
    )
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    async fn list_databases(&self) -> Result<Vec<String>, CommandError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT schema_name FROM information_schema.schemata
                 WHERE schema_name LIKE $1 ORDER BY schema_name",
                &[&format!("{}%", SCHEMA_PREFIX)],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                name.trim_start_matches(SCHEMA_PREFIX).to_string()
            })
            .collect())
    }

    async fn create_database(&self, db: &str) -> Result<(), CommandError> {
        validate_namespace(db, "placeholder")?;
        let client = self.client().await?;
        client
            .execute(
                &*format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema_name(db))),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn drop_database(&self, db: &str) -> Result<bool, CommandError> {
        let client = self.client().await?;
        let existed = client
            .query_opt(
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1",
                &[&schema_name(db)],
            )
            .await
            .map_err(map_pg_error)?
            .is_some();
        client
            .execute(
                &*format!(
                    "DROP SCHEMA IF EXISTS {} CASCADE",
                    quote_ident(&schema_name(db))
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(existed)
    }

    async fn create_collection(
        &self,
        db: &str,
        coll: &str,
        capped: Option<CappedSpec>,
    ) -> Result<bool, CommandError> {
        validate_namespace(db, coll)?;
        let client = self.client().await?;
        self.ensure_collection(&client, db, coll, capped.as_ref())
            .await
    }

    async fn collection_exists(&self, db: &str, coll: &str) -> Result<bool, CommandError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &*format!(
                    "SELECT 1 FROM {}.{} WHERE coll = $1",
                    quote_ident(&schema_name(db)),
                    METADATA_TABLE
                ),
                &[&coll],
            )
            .await;
        match row {
            Ok(row) => Ok(row.is_some()),
            Err(e) if is_undefined_table(&e) => Ok(false),
            Err(e) => Err(map_pg_error(e)),
        }
    }

    async fn drop_collection(&self, db: &str, coll: &str) -> Result<bool, CommandError> {
        let client = self.client().await?;
        let schema = schema_name(db);
        let removed = client
            .execute(
                &*format!(
                    "DELETE FROM {}.{} WHERE coll = $1",
                    quote_ident(&schema),
                    METADATA_TABLE
                ),
                &[&coll],
            )
            .await;
        let removed = match removed {
            Ok(n) => n > 0,
            Err(e) if is_undefined_table(&e) => return Ok(false),
            Err(e) => return Err(map_pg_error(e)),
        };
        client
            .execute(
                &*format!(
                    "DELETE FROM {}.{} WHERE coll = $1",
                    quote_ident(&schema),
                    INDEX_TABLE
                ),
                &[&coll],
            )
            .await
            .map_err(map_pg_error)?;
        client
            .execute(
                &*format!(
                    "DROP TABLE IF EXISTS {}.{}",
                    quote_ident(&schema),
                    quote_ident(coll)
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(removed)
    }

    async fn rename_collection(
        &self,
        db: &str,
        from: &str,
        to_db: &str,
        to: &str,
    ) -> Result<(), CommandError> {
        validate_namespace(to_db, to)?;
        if self.collection_exists(to_db, to).await? {
            return Err(CommandError::namespace_exists(&*format!("{}.{}", to_db, to)));
        }
        if !self.collection_exists(db, from).await? {
            return Err(CommandError::namespace_not_found(format!(
                "Source collection {}.{} does not exist",
                db, from
            )));
        }
        let client = self.client().await?;
        if db == to_db {
            let schema = schema_name(db);
            client
                .execute(
                    &*format!(
                        "ALTER TABLE {}.{} RENAME TO {}",
                        quote_ident(&schema),
                        quote_ident(from),
                        quote_ident(to)
                    ),
                    &[],
                )
                .await
                .map_err(map_pg_error)?;
            client
                .execute(
                    &*format!(
                        "UPDATE {}.{} SET coll = $1 WHERE coll = $2",
                        quote_ident(&schema),
                        METADATA_TABLE
                    ),
                    &[&to, &from],
                )
                .await
                .map_err(map_pg_error)?;
            client
                .execute(
                    &*format!(
                        "UPDATE {}.{} SET coll = $1 WHERE coll = $2",
                        quote_ident(&schema),
                        INDEX_TABLE
                    ),
                    &[&to, &from],
                )
                .await
                .map_err(map_pg_error)?;
            return Ok(());
        }

        // Cross-database rename: move rows, then drop the source.
        self.create_collection(to_db, to, None).await?;
        client
            .execute(
                &*format!(
                    "INSERT INTO {}.{} (id_key, document, body)
                     SELECT id_key, document, body FROM {}.{} ORDER BY seq",
                    quote_ident(&schema_name(to_db)),
                    quote_ident(to),
                    quote_ident(&schema_name(db)),
                    quote_ident(from)
                ),
                &[],
            )
            .await
            .map_err(map_pg_error)?;
        self.drop_collection(db, from).await?;
        Ok(())
    }

    async fn list_collections(&self, db: &str) -> Result<Vec<CollectionInfo>, CommandError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT coll, uuid, capped_size, capped_max FROM {}.{} ORDER BY coll",
                    quote_ident(&schema_name(db)),
                    METADATA_TABLE
                ),
                &[],
            )
            .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(map_pg_error(e)),
        };
        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let uuid: String = row.get(1);
                let capped_size: Option<i64> = row.get(2);
                let capped_max: Option<i64> = row.get(3);
                CollectionInfo {
                    name,
                    uuid: uuid.parse().unwrap_or_else(|_| uuid::Uuid::new_v4()),
                    capped: capped_size.map(|size| CappedSpec {
                        size,
                        max: capped_max,
                    }),
                }
            })
            .collect())
    }

    async fn insert_one(&self, db: &str, coll: &str, doc: &Document) -> Result<(), CommandError> {
        validate_namespace(db, coll)?;
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        let body = bson::to_vec(doc)
            .map_err(|e| CommandError::internal(format!("bson encoding failed: {}", e)))?;
        let json = document_json(doc);

        let client = self.client().await?;
        self.ensure_collection(&client, db, coll, None).await?;
        let result = client
            .execute(
                &*format!(
                    "INSERT INTO {}.{} (id_key, document, body) VALUES ($1, $2, $3)",
                    quote_ident(&schema_name(db)),
                    quote_ident(coll)
                ),
                &[&id_key(&id), &json, &body],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Err(
                CommandError::duplicate_key(&*format!("{}.{}", db, coll), &*format!("{{ _id: {} }}", id)),
            ),
            Err(e) => Err(map_pg_error(e)),
        }
    }

    async fn query(
        &self,
        db: &str,
        coll: &str,
        plan: &QueryPlan,
    ) -> Result<Box<dyn ResultStream>, CommandError> {
        let client = self.client().await?;

        let mut sql = format!(
            "SELECT body FROM {}.{}",
            quote_ident(&schema_name(db)),
            quote_ident(coll)
        );
        let mut predicates: Vec<serde_json::Value> = Vec::new();
        for (field, value) in &plan.filter.equalities {
            let mut object = serde_json::Map::new();
            object.insert(field.clone(), value.clone().into_relaxed_extjson());
            predicates.push(serde_json::Value::Object(object));
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        for (i, predicate) in predicates.iter().enumerate() {
            if i == 0 {
                sql.push_str(" WHERE ");
            } else {
                sql.push_str(" AND ");
            }
            sql.push_str(&*format!("document @> ${}::jsonb", i + 1));
            params.push(predicate);
        }

        match &plan.sort {
            Some((field, dir)) => sql.push_str(&*format!(
                " ORDER BY document->{} {}, seq",
                quote_literal(field),
                if *dir < 0 { "DESC" } else { "ASC" }
            )),
            None => sql.push_str(" ORDER BY seq"),
        }
        if let Some(limit) = plan.limit {
            sql.push_str(&*format!(" LIMIT {}", limit));
        }
        if let Some(skip) = plan.skip {
            sql.push_str(&*format!(" OFFSET {}", skip));
        }

        let rows = client.query(sql.as_str(), params.as_slice()).await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) => return Ok(Box::new(VecStream::empty())),
            Err(e) => return Err(map_pg_error(e)),
        };

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes: Vec<u8> = row.get(0);
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
        let body = bson::to_vec(doc)
            .map_err(|e| CommandError::internal(format!("bson encoding failed: {}", e)))?;
        let json = document_json(doc);
        let client = self.client().await?;
        let n = client
            .execute(
                &*format!(
                    "UPDATE {}.{} SET document = $1, body = $2 WHERE id_key = $3",
                    quote_ident(&schema_name(db)),
                    quote_ident(coll)
                ),
                &[&json, &body, &id_key(id)],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(n > 0)
    }

    async fn delete_by_id(&self, db: &str, coll: &str, id: &Bson) -> Result<bool, CommandError> {
        let client = self.client().await?;
        let n = client
            .execute(
                &*format!(
                    "DELETE FROM {}.{} WHERE id_key = $1",
                    quote_ident(&schema_name(db)),
                    quote_ident(coll)
                ),
                &[&id_key(id)],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(n > 0)
    }

    async fn delete_oldest(&self, db: &str, coll: &str, n: i64) -> Result<i64, CommandError> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                &*format!(
                    "DELETE FROM {}.{} WHERE seq IN (
                         SELECT seq FROM {}.{} ORDER BY seq LIMIT $1
                     )",
                    quote_ident(&schema_name(db)),
                    quote_ident(coll),
                    quote_ident(&schema_name(db)),
                    quote_ident(coll)
                ),
                &[&n],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(deleted as i64)
    }

    async fn create_index(
        &self,
        db: &str,
        coll: &str,
        spec: &IndexSpec,
    ) -> Result<bool, CommandError> {
        let json = serde_json::to_value(spec)
            .map_err(|e| CommandError::internal(format!("index spec encoding failed: {}", e)))?;
        let client = self.client().await?;
        self.ensure_collection(&client, db, coll, None).await?;
        let n = client
            .execute(
                &*format!(
                    "INSERT INTO {}.{} (coll, name, spec) VALUES ($1, $2, $3)
                     ON CONFLICT (coll, name) DO NOTHING",
                    quote_ident(&schema_name(db)),
                    INDEX_TABLE
                ),
                &[&coll, &spec.name, &json],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(n > 0)
    }

    async fn drop_index(&self, db: &str, coll: &str, name: &str) -> Result<bool, CommandError> {
        let client = self.client().await?;
        let result = client
            .execute(
                &*format!(
                    "DELETE FROM {}.{} WHERE coll = $1 AND name = $2",
                    quote_ident(&schema_name(db)),
                    INDEX_TABLE
                ),
                &[&coll, &name],
            )
            .await;
        match result {
            Ok(n) => Ok(n > 0),
            Err(e) if is_undefined_table(&e) => Ok(false),
            Err(e) => Err(map_pg_error(e)),
        }
    }

    async fn list_indexes(&self, db: &str, coll: &str) -> Result<Vec<IndexSpec>, CommandError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &*format!(
                    "SELECT spec FROM {}.{} WHERE coll = $1 ORDER BY name",
                    quote_ident(&schema_name(db)),
                    INDEX_TABLE
                ),
                &[&coll],
            )
            .await;
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_undefined_table(&e) => return Ok(vec![IndexSpec::id_index()]),
            Err(e) => return Err(map_pg_error(e)),
        };
        let mut out = vec![IndexSpec::id_index()];
        for row in rows {
            let json: serde_json::Value = row.get(0);
            let spec: IndexSpec = serde_json::from_value(json)
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
        let client = self.client().await?;
        let row = client
            .query_one(
                &*format!(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(body)), 0) FROM {}.{}",
                    quote_ident(&schema_name(db)),
                    quote_ident(coll)
                ),
                &[],
            )
            .await;
        let (count, size) = match row {
            Ok(row) => {
                let count: i64 = row.get(0);
                let size: i64 = row.get(1);
                (count, size)
            }
            Err(e) if is_undefined_table(&e) => (0, 0),
            Err(e) => return Err(map_pg_error(e)),
        };

        let capped = client
            .query_opt(
                &*format!(
                    "SELECT capped_size, capped_max FROM {}.{} WHERE coll = $1",
                    quote_ident(&schema_name(db)),
                    METADATA_TABLE
                ),
                &[&coll],
            )
            .await;
        let capped = match capped {
            Ok(Some(row)) => {
                let size: Option<i64> = row.get(0);
                let max: Option<i64> = row.get(1);
                size.map(|size| CappedSpec { size, max })
            }
            Ok(None) => None,
            Err(e) if is_undefined_table(&e) => None,
            Err(e) => return Err(map_pg_error(e)),
        };

        Ok(CollectionStats {
            count,
            size_bytes: size,
            capped,
        })
    }

    async fn database_stats(&self, db: &str) -> Result<DatabaseStats, CommandError> {
        let collections = self.list_collections(db).await?;
        let mut stats = DatabaseStats {
            collections: collections.len() as i64,
            ..Default::default()
        };
        for info in collections {
            let coll_stats = self.collection_stats(db, &info.name).await?;
            stats.objects += coll_stats.count;
            stats.data_size += coll_stats.size_bytes;
        }
        Ok(stats)
    }

    fn supports_pushdown(&self, plan: &QueryPlan) -> bool {
        let fields_ok = plan
            .filter
            .equalities
            .iter()
            .all(|(field, _)| !field.contains('.'));
        let sort_ok = plan
            .sort
            .as_ref()
            .map(|(field, _)| !field.contains('.'))
            .unwrap_or(true);
        fields_ok && sort_ok
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
