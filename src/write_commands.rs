/*!
 * @file write_commands.rs
 * @brief insert / update / delete / findAndModify with batch error semantics
 */

use std::sync::Arc;

use bson::{doc, Bson, Document};

use crate::aggregation::{self, sort_documents, Stage};
use crate::command_processor::{collection_name, optional_document, ServerContext};
use crate::error::{code, CommandError, CommandResult};
use crate::ordering::{get_path, numeric_value, remove_path, set_path, type_name, SortStyle};
use crate::query_commands::plan_query;
use crate::wire_protocol::{MAX_BSON_OBJECT_SIZE, MAX_WRITE_BATCH_SIZE};

fn write_error(index: usize, err: &CommandError) -> Document {
    doc! {
        "index": index as i32,
        "code": err.code,
        "errmsg": err.message.clone(),
    }
}

fn check_batch_size(n: usize) -> Result<(), CommandError> {
    if n == 0 || n > MAX_WRITE_BATCH_SIZE as usize {
        return Err(CommandError::bad_value(format!(
            "Write batch sizes must be between 1 and {}. Got {} operations.",
            MAX_WRITE_BATCH_SIZE, n
        )));
    }
    Ok(())
}

/// Validates a document for storage and guarantees `_id` exists and leads.
fn prepare_insert(doc: &Document) -> Result<Document, CommandError> {
    for key in doc.keys() {
        if key.is_empty() {
            return Err(CommandError::bad_value("document field names cannot be empty"));
        }
        if key.contains('\0') {
            return Err(CommandError::bad_value(
                "document field names cannot contain the NUL byte",
            ));
        }
        if key.starts_with('$') {
            return Err(CommandError::new(
                code::DOLLAR_PREFIXED_FIELD_NAME,
                format!("The dollar ($) prefixed field '{}' is not allowed", key),
            ));
        }
    }

    let prepared = if doc.contains_key("_id") {
        doc.clone()
    } else {
        let mut out = Document::new();
        out.insert("_id", bson::oid::ObjectId::new());
        for (k, v) in doc {
            out.insert(k.clone(), v.clone());
        }
        out
    };

    let size = bson::to_vec(&prepared)
        .map_err(|e| CommandError::internal(format!("bson encoding failed: {}", e)))?
        .len();
    if size > MAX_BSON_OBJECT_SIZE as usize {
        return Err(CommandError::bad_value(format!(
            "object to insert too large. size in bytes: {}, max size: {}",
            size, MAX_BSON_OBJECT_SIZE
        )));
    }
    Ok(prepared)
}

pub async fn insert(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "insert")?;
    crate::backend::validate_namespace(db, &coll)?;
    let documents = match cmd.get("documents") {
        None => return Err(CommandError::missing_field("insert", "documents")),
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'insert.documents' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };
    let ordered = match cmd.get("ordered") {
        None => true,
        Some(Bson::Boolean(b)) => *b,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'insert.ordered' is the wrong type '{}', expected type 'bool'",
                type_name(other)
            )))
        }
    };
    check_batch_size(documents.len())?;

    let mut n: i64 = 0;
    let mut write_errors: Vec<Bson> = Vec::new();
    for (index, element) in documents.iter().enumerate() {
        let Bson::Document(document) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'insert.documents.{}' is the wrong type '{}', expected type 'object'",
                index,
                type_name(element)
            )));
        };
        let outcome = match prepare_insert(document) {
            Ok(prepared) => ctx.backend.insert_one(db, &coll, &prepared).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => n += 1,
            Err(e) => {
                write_errors.push(Bson::Document(write_error(index, &e)));
                if ordered {
                    break;
                }
            }
        }
    }

    let mut reply = doc! {"n": n as i32, "ok": 1.0};
    if !write_errors.is_empty() {
        reply.insert("writeErrors", Bson::Array(write_errors));
    }
    Ok(reply)
}

/// Fetches every document matching `filter`, optionally sorted with the find
/// comparator. Drives updates, deletes and findAndModify.
async fn matching_docs(
    ctx: &Arc<ServerContext>,
    db: &str,
    coll: &str,
    filter: &Document,
    sort: Option<&[(String, i8)]>,
) -> Result<Vec<Document>, CommandError> {
    let planned = plan_query(ctx.backend.as_ref(), Some(filter), None, None, None);
    let mut stream = ctx.backend.query(db, coll, &planned.plan).await?;
    if let Some(residual) = planned.residual_filter {
        stream = aggregation::build_stream(stream, vec![Stage::Match(residual)]);
    }
    let mut docs = aggregation::collect(stream).await?;
    if let Some(keys) = sort {
        sort_documents(&mut docs, keys, SortStyle::Find);
    }
    Ok(docs)
}

fn is_operator_update(update: &Document) -> bool {
    update.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

/// Applies `$set` / `$unset` / `$inc` to a copy of `original`.
fn apply_update_operators(
    original: &Document,
    update: &Document,
) -> Result<Document, CommandError> {
    let mut out = original.clone();
    for (op, arg) in update {
        let arg = match arg {
            Bson::Document(d) => d,
            other => {
                return Err(CommandError::failed_to_parse(format!(
                    "Modifiers operate on fields but we found type {} instead",
                    type_name(other)
                )))
            }
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in arg {
                    set_path(&mut out, path, value.clone())?;
                }
            }
            "$unset" => {
                for (path, _) in arg {
                    remove_path(&mut out, path);
                }
            }
            "$inc" => {
                for (path, value) in arg {
                    let delta = numeric_value(value).ok_or_else(|| {
                        CommandError::type_mismatch(format!(
                            "Cannot increment with non-numeric argument: {{{}: {}}}",
                            path, value
                        ))
                    })?;
                    match get_path(&out, path) {
                        None => set_path(&mut out, path, value.clone())?,
                        Some(existing) => {
                            let base = numeric_value(&existing).ok_or_else(|| {
                                CommandError::type_mismatch(format!(
                                    "Cannot apply $inc to a value of non-numeric type. The field '{}' has type {}",
                                    path,
                                    type_name(&existing)
                                ))
                            })?;
                            let incremented = match (&existing, value) {
                                (Bson::Double(_), _) | (_, Bson::Double(_)) => {
                                    Bson::Double(base + delta)
                                }
                                (Bson::Int64(_), _) | (_, Bson::Int64(_)) => {
                                    Bson::Int64(base as i64 + delta as i64)
                                }
                                _ => {
                                    let sum = base as i64 + delta as i64;
                                    if sum >= i32::MIN as i64 && sum <= i32::MAX as i64 {
                                        Bson::Int32(sum as i32)
                                    } else {
                                        Bson::Int64(sum)
                                    }
                                }
                            };
                            set_path(&mut out, path, incremented)?;
                        }
                    }
                }
            }
            other if other.starts_with('$') => {
                return Err(CommandError::failed_to_parse(format!(
                    "Unknown modifier: {}. Expected a valid update modifier or pipeline-style update specified as an array",
                    other
                )))
            }
            _ => {
                return Err(CommandError::failed_to_parse(
                    "Unknown modifier. Update documents may not mix update operators and fields",
                ))
            }
        }
    }

    if out.get("_id") != original.get("_id") {
        return Err(CommandError::new(
            code::IMMUTABLE_FIELD,
            "After applying the update, the (immutable) field '_id' was found to have been altered",
        ));
    }
    Ok(out)
}

/// Builds the replacement document for a replace-style update, keeping the
/// matched document's `_id`.
fn apply_replacement(
    original: &Document,
    replacement: &Document,
) -> Result<Document, CommandError> {
    if let (Some(old), Some(new)) = (original.get("_id"), replacement.get("_id")) {
        if !crate::ordering::values_equal(old, new) {
            return Err(CommandError::new(
                code::IMMUTABLE_FIELD,
                "After applying the update, the (immutable) field '_id' was found to have been altered",
            ));
        }
    }
    let mut out = Document::new();
    if let Some(id) = original.get("_id") {
        out.insert("_id", id.clone());
    }
    for (k, v) in replacement {
        if k != "_id" {
            out.insert(k.clone(), v.clone());
        }
    }
    Ok(out)
}

/// The document an upsert inserts: the filter's plain equalities, then the
/// update applied on top; `_id` comes from the filter or is generated.
fn build_upsert(filter: &Document, update: &Document) -> Result<Document, CommandError> {
    let mut base = Document::new();
    for (k, v) in filter {
        if k.starts_with('$') || k.contains('.') {
            continue;
        }
        if matches!(v, Bson::Document(d) if d.keys().next().map(|key| key.starts_with('$')).unwrap_or(false))
        {
            continue;
        }
        base.insert(k.clone(), v.clone());
    }

    let mut built = if is_operator_update(update) {
        apply_update_operators(&base, update)?
    } else {
        let mut out = update.clone();
        if let Some(id) = base.get("_id") {
            if !out.contains_key("_id") {
                out.insert("_id", id.clone());
            }
        }
        out
    };

    if !built.contains_key("_id") {
        let mut with_id = Document::new();
        with_id.insert("_id", bson::oid::ObjectId::new());
        for (k, v) in &built {
            with_id.insert(k.clone(), v.clone());
        }
        built = with_id;
    }
    Ok(built)
}

pub async fn update(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "update")?;
    crate::backend::validate_namespace(db, &coll)?;
    let updates = match cmd.get("updates") {
        None => return Err(CommandError::missing_field("update", "updates")),
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'update.updates' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };
    let ordered = cmd.get_bool("ordered").unwrap_or(true);
    check_batch_size(updates.len())?;

    let mut n: i64 = 0;
    let mut n_modified: i64 = 0;
    let mut upserted: Vec<Bson> = Vec::new();
    let mut write_errors: Vec<Bson> = Vec::new();

    for (index, element) in updates.iter().enumerate() {
        let Bson::Document(op) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'update.updates.{}' is the wrong type '{}', expected type 'object'",
                index,
                type_name(element)
            )));
        };
        let outcome = apply_one_update(ctx, db, &coll, op).await;
        match outcome {
            Ok(result) => {
                n += result.matched + i64::from(result.upserted_id.is_some());
                n_modified += result.modified;
                if let Some(id) = result.upserted_id {
                    upserted.push(Bson::Document(doc! {"index": index as i32, "_id": id}));
                }
            }
            Err(e) => {
                write_errors.push(Bson::Document(write_error(index, &e)));
                if ordered {
                    break;
                }
            }
        }
    }

    let mut reply = doc! {"n": n as i32, "nModified": n_modified as i32, "ok": 1.0};
    if !upserted.is_empty() {
        reply.insert("upserted", Bson::Array(upserted));
    }
    if !write_errors.is_empty() {
        reply.insert("writeErrors", Bson::Array(write_errors));
    }
    Ok(reply)
}

struct UpdateOutcome {
    matched: i64,
    modified: i64,
    upserted_id: Option<Bson>,
}

async fn apply_one_update(
    ctx: &Arc<ServerContext>,
    db: &str,
    coll: &str,
    op: &Document,
) -> Result<UpdateOutcome, CommandError> {
    let filter = op
        .get_document("q")
        .map_err(|_| CommandError::missing_field("update.updates", "q"))?;
    let update = match op.get("u") {
        Some(Bson::Document(d)) => d,
        Some(Bson::Array(_)) => {
            return Err(CommandError::failed_to_parse(
                "pipeline-style updates are not supported",
            ))
        }
        _ => return Err(CommandError::missing_field("update.updates", "u")),
    };
    let multi = op.get_bool("multi").unwrap_or(false);
    let upsert = op.get_bool("upsert").unwrap_or(false);

    let operator_style = is_operator_update(update);
    if !operator_style && multi {
        return Err(CommandError::bad_value(
            "multi update is not supported for replacement-style update",
        ));
    }

    let mut matched_docs = matching_docs(ctx, db, coll, filter, None).await?;
    if !multi {
        matched_docs.truncate(1);
    }

    if matched_docs.is_empty() {
        if !upsert {
            return Ok(UpdateOutcome {
                matched: 0,
                modified: 0,
                upserted_id: None,
            });
        }
        let new_doc = build_upsert(filter, update)?;
        ctx.backend.insert_one(db, coll, &new_doc).await?;
        return Ok(UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted_id: new_doc.get("_id").cloned(),
        });
    }

    let mut modified = 0;
    let matched = matched_docs.len() as i64;
    for original in matched_docs {
        let updated = if operator_style {
            apply_update_operators(&original, update)?
        } else {
            apply_replacement(&original, update)?
        };
        if updated != original {
            let id = updated.get("_id").cloned().unwrap_or(Bson::Null);
            ctx.backend.replace_by_id(db, coll, &id, &updated).await?;
            modified += 1;
        }
    }
    Ok(UpdateOutcome {
        matched,
        modified,
        upserted_id: None,
    })
}

pub async fn delete(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "delete")?;
    crate::backend::validate_namespace(db, &coll)?;
    let deletes = match cmd.get("deletes") {
        None => return Err(CommandError::missing_field("delete", "deletes")),
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'delete.deletes' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };
    let ordered = cmd.get_bool("ordered").unwrap_or(true);
    check_batch_size(deletes.len())?;

    let mut n: i64 = 0;
    let mut write_errors: Vec<Bson> = Vec::new();
    for (index, element) in deletes.iter().enumerate() {
        let Bson::Document(op) = element else {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'delete.deletes.{}' is the wrong type '{}', expected type 'object'",
                index,
                type_name(element)
            )));
        };
        match apply_one_delete(ctx, db, &coll, op).await {
            Ok(count) => n += count,
            Err(e) => {
                write_errors.push(Bson::Document(write_error(index, &e)));
                if ordered {
                    break;
                }
            }
        }
    }

    let mut reply = doc! {"n": n as i32, "ok": 1.0};
    if !write_errors.is_empty() {
        reply.insert("writeErrors", Bson::Array(write_errors));
    }
    Ok(reply)
}

async fn apply_one_delete(
    ctx: &Arc<ServerContext>,
    db: &str,
    coll: &str,
    op: &Document,
) -> Result<i64, CommandError> {
    let filter = op
        .get_document("q")
        .map_err(|_| CommandError::missing_field("delete.deletes", "q"))?;
    let limit = match op.get("limit") {
        Some(v) => match numeric_value(v) {
            Some(n) if n == 0.0 || n == 1.0 => n as i64,
            _ => {
                return Err(CommandError::failed_to_parse(format!(
                    "The limit field in delete objects must be 0 or 1. Got {}",
                    v
                )))
            }
        },
        None => return Err(CommandError::missing_field("delete.deletes", "limit")),
    };

    let mut docs = matching_docs(ctx, db, coll, filter, None).await?;
    if limit == 1 {
        docs.truncate(1);
    }
    let mut deleted = 0;
    for doc in docs {
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        if ctx.backend.delete_by_id(db, coll, &id).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

pub async fn find_and_modify(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "findAndModify")?;
    crate::backend::validate_namespace(db, &coll)?;
    let filter = optional_document(cmd, "findAndModify", "query")?
        .cloned()
        .unwrap_or_default();
    let sort = match cmd.get("sort") {
        None => None,
        Some(value @ Bson::Document(d)) if !d.is_empty() => {
            Some(aggregation::parse_sort(value)?)
        }
        Some(Bson::Document(_)) => None,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'findAndModify.sort' is the wrong type '{}', expected type 'object'",
                type_name(other)
            )))
        }
    };
    let remove = cmd.get_bool("remove").unwrap_or(false);
    let return_new = cmd.get_bool("new").unwrap_or(false);
    let upsert = cmd.get_bool("upsert").unwrap_or(false);
    let update_doc = optional_document(cmd, "findAndModify", "update")?.cloned();
    let fields = match optional_document(cmd, "findAndModify", "fields")? {
        Some(p) if !p.is_empty() => Some(crate::projection::Projection::parse(p, false)?),
        _ => None,
    };

    if remove && update_doc.is_some() {
        return Err(CommandError::failed_to_parse(
            "Either an update or remove=true must be specified",
        ));
    }
    if !remove && update_doc.is_none() {
        return Err(CommandError::failed_to_parse(
            "Either an update or remove=true must be specified",
        ));
    }

    let mut docs = matching_docs(ctx, db, &coll, &filter, sort.as_deref()).await?;
    let target = if docs.is_empty() { None } else { Some(docs.remove(0)) };

    let project = |doc: Document| -> Result<Bson, CommandError> {
        match &fields {
            Some(p) => Ok(Bson::Document(p.apply(&doc)?)),
            None => Ok(Bson::Document(doc)),
        }
    };

    if remove {
        return match target {
            Some(doc) => {
                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                ctx.backend.delete_by_id(db, &coll, &id).await?;
                Ok(doc! {
                    "lastErrorObject": {"n": 1, "updatedExisting": false},
                    "value": project(doc)?,
                    "ok": 1.0,
                })
            }
            None => Ok(doc! {
                "lastErrorObject": {"n": 0, "updatedExisting": false},
                "value": Bson::Null,
                "ok": 1.0,
            }),
        };
    }

    let update_doc = update_doc.unwrap();
    match target {
        Some(original) => {
            let updated = if is_operator_update(&update_doc) {
                apply_update_operators(&original, &update_doc)?
            } else {
                apply_replacement(&original, &update_doc)?
            };
            if updated != original {
                let id = updated.get("_id").cloned().unwrap_or(Bson::Null);
                ctx.backend.replace_by_id(db, &coll, &id, &updated).await?;
            }
            let value = if return_new { updated } else { original };
            Ok(doc! {
                "lastErrorObject": {"n": 1, "updatedExisting": true},
                "value": project(value)?,
                "ok": 1.0,
            })
        }
        None if upsert => {
            let new_doc = build_upsert(&filter, &update_doc)?;
            ctx.backend.insert_one(db, &coll, &new_doc).await?;
            let id = new_doc.get("_id").cloned().unwrap_or(Bson::Null);
            let value = if return_new {
                project(new_doc)?
            } else {
                Bson::Null
            };
            Ok(doc! {
                "lastErrorObject": {"n": 1, "updatedExisting": false, "upserted": id},
                "value": value,
                "ok": 1.0,
            })
        }
        None => Ok(doc! {
            "lastErrorObject": {"n": 0, "updatedExisting": false},
            "value": Bson::Null,
            "ok": 1.0,
        }),
    }
}
