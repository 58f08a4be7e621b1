/*!
 * @file index_commands.rs
 * @brief createIndexes / dropIndexes / listIndexes
 */

use std::sync::Arc;

use bson::{doc, Bson, Document};

use crate::backend::IndexSpec;
use crate::command_processor::{collection_name, cursor_reply, ServerContext};
use crate::error::{code, CommandError, CommandResult};
use crate::ordering::{numeric_value, type_name};

fn parse_index_spec(index: &Document, position: usize) -> Result<IndexSpec, CommandError> {
    let key = match index.get("key") {
        Some(Bson::Document(d)) if !d.is_empty() => d,
        Some(Bson::Document(_)) => {
            return Err(CommandError::bad_value(
                "Index keys cannot be empty.",
            ))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'createIndexes.indexes.{}.key' is the wrong type '{}', expected type 'object'",
                position,
                type_name(other)
            )))
        }
        None => {
            return Err(CommandError::location(
                40414,
                format!(
                    "BSON field 'createIndexes.indexes.{}.key' is missing but a required field",
                    position
                ),
            ))
        }
    };
    let name = match index.get("name") {
        Some(Bson::String(s)) if !s.is_empty() => s.clone(),
        Some(Bson::String(_)) => {
            return Err(CommandError::bad_value("index name cannot be empty"))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'createIndexes.indexes.{}.name' is the wrong type '{}', expected type 'string'",
                position,
                type_name(other)
            )))
        }
        None => {
            return Err(CommandError::location(
                40414,
                format!(
                    "BSON field 'createIndexes.indexes.{}.name' is missing but a required field",
                    position
                ),
            ))
        }
    };

    let mut keys = Vec::with_capacity(key.len());
    for (field, direction) in key {
        let dir = match numeric_value(direction) {
            Some(n) if n == 1.0 => 1,
            Some(n) if n == -1.0 => -1,
            _ => {
                return Err(CommandError::bad_value(format!(
                    "Values in the index key pattern must be 1 or -1, got {} for field '{}'",
                    direction, field
                )))
            }
        };
        keys.push((field.clone(), dir));
    }

    let expire_after_seconds = index
        .get("expireAfterSeconds")
        .and_then(numeric_value)
        .map(|n| n as i64);

    Ok(IndexSpec {
        name,
        keys,
        unique: index.get_bool("unique").unwrap_or(false),
        sparse: index.get_bool("sparse").unwrap_or(false),
        expire_after_seconds,
    })
}

pub async fn create_indexes(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "createIndexes")?;
    crate::backend::validate_namespace(db, &coll)?;
    let indexes = match cmd.get("indexes") {
        None => return Err(CommandError::missing_field("createIndexes", "indexes")),
        Some(Bson::Array(a)) if !a.is_empty() => a,
        Some(Bson::Array(_)) => {
            return Err(CommandError::bad_value(
                "Must specify at least one index to create",
            ))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'createIndexes.indexes' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };

    let existed = ctx.backend.collection_exists(db, &coll).await?;
    let before = ctx.backend.list_indexes(db, &coll).await?.len();

    let mut created = 0;
    for (position, element) in indexes.iter().enumerate() {
        let Bson::Document(index) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'createIndexes.indexes.{}' is the wrong type '{}', expected type 'object'",
                position,
                type_name(element)
            )));
        };
        let spec = parse_index_spec(index, position)?;
        if spec.name == "_id_" {
            // The implicit _id index always exists; recreating it is a no-op
            // unless the key pattern disagrees.
            if spec.keys != vec![("_id".to_string(), 1)] {
                return Err(CommandError::bad_value(
                    "The index name '_id_' is reserved for the _id index",
                ));
            }
            continue;
        }
        if ctx.backend.create_index(db, &coll, &spec).await? {
            created += 1;
        }
    }

    Ok(doc! {
        "numIndexesBefore": before as i32,
        "numIndexesAfter": (before + created) as i32,
        "createdCollectionAutomatically": !existed,
        "ok": 1.0,
    })
}

pub async fn drop_indexes(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "dropIndexes")?;
    if !ctx.backend.collection_exists(db, &coll).await? {
        return Err(CommandError::namespace_not_found(format!(
            "ns not found {}.{}",
            db, coll
        )));
    }
    let existing = ctx.backend.list_indexes(db, &coll).await?;
    let before = existing.len();

    match cmd.get("index") {
        Some(Bson::String(name)) if name == "*" => {
            for spec in &existing {
                if spec.name != "_id_" {
                    ctx.backend.drop_index(db, &coll, &spec.name).await?;
                }
            }
            Ok(doc! {
                "nIndexesWas": before as i32,
                "msg": "non-_id indexes dropped for collection",
                "ok": 1.0,
            })
        }
        Some(Bson::String(name)) => {
            if name == "_id_" {
                return Err(CommandError::new(
                    code::INVALID_OPTIONS,
                    "cannot drop _id index",
                ));
            }
            if !ctx.backend.drop_index(db, &coll, name).await? {
                return Err(CommandError::new(
                    code::INDEX_NOT_FOUND,
                    format!("index not found with name [{}]", name),
                ));
            }
            Ok(doc! {"nIndexesWas": before as i32, "ok": 1.0})
        }
        Some(Bson::Document(key)) => {
            let target = existing
                .iter()
                .find(|spec| spec.key_document() == *key && spec.name != "_id_");
            match target {
                Some(spec) => {
                    ctx.backend.drop_index(db, &coll, &spec.name).await?;
                    Ok(doc! {"nIndexesWas": before as i32, "ok": 1.0})
                }
                None => Err(CommandError::new(
                    code::INDEX_NOT_FOUND,
                    format!("can't find index with key: {}", key),
                )),
            }
        }
        Some(other) => Err(CommandError::type_mismatch(format!(
            "BSON field 'dropIndexes.index' is the wrong type '{}', expected types '[string, object]'",
            type_name(other)
        ))),
        None => Err(CommandError::missing_field("dropIndexes", "index")),
    }
}

pub async fn list_indexes(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "listIndexes")?;
    if !ctx.backend.collection_exists(db, &coll).await? {
        return Err(CommandError::namespace_not_found(format!(
            "ns does not exist: {}.{}",
            db, coll
        )));
    }
    let ns = format!("{}.{}", db, coll);
    let docs: Vec<Document> = ctx
        .backend
        .list_indexes(db, &coll)
        .await?
        .iter()
        .map(|spec| spec.to_document(&ns))
        .collect();
    let cursor_ns = format!("{}.$cmd.listIndexes.{}", db, coll);
    Ok(cursor_reply(&cursor_ns, 0, docs, true))
}
