/*!
 * @file query_commands.rs
 * @brief find / getMore / killCursors / count / distinct / aggregate / explain
 */

use std::sync::Arc;

use bson::{doc, Bson, Document};

use crate::aggregation::{self, SortStream, Stage};
use crate::backend::{Backend, QueryPlan, ResultStream};
use crate::command_processor::{
    collection_name, cursor_reply, deadline_from, optional_document, parse_batch_size,
    parse_max_time_ms, ConnectionState, ServerContext,
};
use crate::cursor_registry::{pull_batch, KillOutcome};
use crate::error::{CommandError, CommandResult};
use crate::filter::{analyze_pushdown, PushdownFilter};
use crate::ordering::{self, numeric_value, type_name, values_equal, SortStyle};
use crate::projection::Projection;

const DEFAULT_FIRST_BATCH: i64 = 101;

/// A query split between what the backend executes natively and what the
/// engine evaluates against the stream.
pub(crate) struct PlannedQuery {
    pub plan: QueryPlan,
    pub residual_filter: Option<Document>,
    pub residual_sort: Option<Vec<(String, i8)>>,
    pub residual_skip: Option<i64>,
    pub residual_limit: Option<i64>,
    /// Whether the filter was handed to the backend whole; `explain` reports
    /// this.
    pub pushdown: bool,
}

pub(crate) fn plan_query(
    backend: &dyn Backend,
    filter: Option<&Document>,
    sort: Option<&[(String, i8)]>,
    limit: Option<i64>,
    skip: Option<i64>,
) -> PlannedQuery {
    let pushable_filter: Option<PushdownFilter> = match filter {
        None => Some(PushdownFilter::default()),
        Some(f) => analyze_pushdown(f),
    };
    let pushable_sort: Option<Option<(String, i8)>> = match sort {
        None => Some(None),
        Some([]) => Some(None),
        Some([(field, dir)]) if !field.contains('.') => Some(Some((field.clone(), *dir))),
        Some(_) => None,
    };

    if let (Some(pf), Some(ps)) = (&pushable_filter, &pushable_sort) {
        let plan = QueryPlan {
            filter: pf.clone(),
            sort: ps.clone(),
            limit,
            skip,
            pushdown: true,
        };
        if backend.supports_pushdown(&plan) {
            return PlannedQuery {
                plan,
                residual_filter: None,
                residual_sort: None,
                residual_skip: None,
                residual_limit: None,
                pushdown: true,
            };
        }
    }

    if let Some(pf) = &pushable_filter {
        let plan = QueryPlan {
            filter: pf.clone(),
            sort: None,
            limit: None,
            skip: None,
            pushdown: true,
        };
        if backend.supports_pushdown(&plan) {
            return PlannedQuery {
                plan,
                residual_filter: None,
                residual_sort: sort.map(|s| s.to_vec()).filter(|s| !s.is_empty()),
                residual_skip: skip,
                residual_limit: limit,
                pushdown: true,
            };
        }
    }

    PlannedQuery {
        plan: QueryPlan::full_scan(),
        residual_filter: filter.filter(|f| !f.is_empty()).cloned(),
        residual_sort: sort.map(|s| s.to_vec()).filter(|s| !s.is_empty()),
        residual_skip: skip,
        residual_limit: limit,
        pushdown: false,
    }
}

fn parse_find_sort(cmd: &Document) -> Result<Option<Vec<(String, i8)>>, CommandError> {
    match cmd.get("sort") {
        None => Ok(None),
        Some(value @ Bson::Document(d)) => {
            if d.is_empty() {
                return Ok(None);
            }
            aggregation::parse_sort(value).map(Some)
        }
        Some(other) => Err(CommandError::type_mismatch(format!(
            "BSON field 'find.sort' is the wrong type '{}', expected type 'object'",
            type_name(other)
        ))),
    }
}

fn non_negative_i64(
    cmd: &Document,
    command: &str,
    field: &str,
) -> Result<Option<i64>, CommandError> {
    match cmd.get(field) {
        None => Ok(None),
        Some(v) => match numeric_value(v) {
            Some(n) if n.fract() == 0.0 && n >= 0.0 => Ok(Some(n as i64)),
            Some(_) => Err(CommandError::bad_value(format!(
                "BSON field '{}.{}' value must be >= 0",
                command, field
            ))),
            None => Err(CommandError::type_mismatch(format!(
                "BSON field '{}.{}' is the wrong type '{}', expected types '[long, int, decimal, double]'",
                command,
                field,
                type_name(v)
            ))),
        },
    }
}

pub async fn find(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let coll = collection_name(cmd, "find")?;
    crate::backend::validate_namespace(db, &coll)?;

    let filter = optional_document(cmd, "find", "filter")?.cloned();
    let sort = parse_find_sort(cmd)?;
    let projection = match optional_document(cmd, "find", "projection")? {
        Some(p) if !p.is_empty() => Some(Projection::parse(p, false)?),
        _ => None,
    };
    let skip = non_negative_i64(cmd, "find", "skip")?;

    let mut single_batch = matches!(cmd.get("singleBatch"), Some(Bson::Boolean(true)));
    let limit = match cmd.get("limit") {
        None => None,
        Some(v) => match numeric_value(v) {
            Some(n) if n.fract() == 0.0 => {
                let n = n as i64;
                if n < 0 {
                    // A negative limit is a single-batch request.
                    single_batch = true;
                    Some(-n)
                } else if n == 0 {
                    None
                } else {
                    Some(n)
                }
            }
            _ => {
                return Err(CommandError::bad_value(
                    "BSON field 'find.limit' value must be an integer",
                ))
            }
        },
    };

    let batch_size = parse_batch_size(cmd, "find", DEFAULT_FIRST_BATCH)?;
    let deadline = deadline_from(parse_max_time_ms(cmd)?);

    let planned = plan_query(
        ctx.backend.as_ref(),
        filter.as_ref(),
        sort.as_deref(),
        limit,
        skip,
    );
    let mut stream = ctx.backend.query(db, &coll, &planned.plan).await?;

    if let Some(residual) = planned.residual_filter {
        stream = aggregation::build_stream(stream, vec![Stage::Match(residual)]);
    }
    if let Some(keys) = planned.residual_sort {
        // find sorts with its own comparator; see ordering::SortStyle.
        stream = Box::new(SortStream::new(stream, keys, SortStyle::Find));
    }
    let mut post = Vec::new();
    if let Some(n) = planned.residual_skip {
        post.push(Stage::Skip(n));
    }
    if let Some(n) = planned.residual_limit {
        post.push(Stage::Limit(n));
    }
    if let Some(p) = projection {
        post.push(Stage::Project(p));
    }
    if !post.is_empty() {
        stream = aggregation::build_stream(stream, post);
    }

    let ns = format!("{}.{}", db, coll);
    finish_cursor_command(ctx, conn, db, &coll, &ns, stream, batch_size, single_batch, deadline)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn finish_cursor_command(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    coll: &str,
    ns: &str,
    mut stream: Box<dyn ResultStream>,
    batch_size: i64,
    single_batch: bool,
    deadline: Option<std::time::Instant>,
) -> CommandResult {
    let batch = pull_batch(&mut stream, batch_size, deadline).await?;
    let cursor_id = if batch.exhausted || single_batch {
        stream.close().await;
        0
    } else {
        ctx.cursors.create(
            stream,
            db,
            coll,
            conn.session,
            conn.user.clone(),
            conn.id,
        )
    };
    Ok(cursor_reply(ns, cursor_id, batch.docs, true))
}

pub async fn get_more(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let cursor_id = match cmd.get("getMore") {
        Some(Bson::Int64(id)) => *id,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'getMore.getMore' is the wrong type '{}', expected type 'long'",
                type_name(other)
            )))
        }
        None => return Err(CommandError::missing_field("getMore", "getMore")),
    };

    let coll = match cmd.get("collection") {
        None => return Err(CommandError::missing_field("getMore", "collection")),
        Some(Bson::String(s)) if s.is_empty() => {
            return Err(CommandError::invalid_namespace(
                "Collection names cannot be empty",
            ))
        }
        Some(Bson::String(s)) => s.clone(),
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'getMore.collection' is the wrong type '{}', expected type 'string'",
                type_name(other)
            )))
        }
    };

    let batch_size = parse_batch_size(cmd, "getMore", 0)?;
    let deadline = deadline_from(parse_max_time_ms(cmd)?);

    let (docs, id, ns) = ctx
        .cursors
        .get_more(
            cursor_id,
            db,
            &coll,
            batch_size,
            conn.user.as_ref(),
            ctx.backend.as_ref(),
            deadline,
        )
        .await?;
    Ok(cursor_reply(&ns, id, docs, false))
}

pub async fn kill_cursors(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    _db: &str,
    cmd: &Document,
) -> CommandResult {
    let _coll = collection_name(cmd, "killCursors")?;
    let ids = match cmd.get("cursors") {
        None => return Err(CommandError::missing_field("killCursors", "cursors")),
        Some(Bson::Array(a)) => a,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'killCursors.cursors' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };

    let mut killed = Vec::new();
    let mut not_found = Vec::new();
    let mut alive = Vec::new();
    for id in ids {
        let Bson::Int64(id) = id else {
            return Err(CommandError::type_mismatch(
                "BSON field 'killCursors.cursors' entries must be of type 'long'",
            ));
        };
        match ctx.cursors.kill(*id, conn.user.as_ref()) {
            KillOutcome::Killed => killed.push(Bson::Int64(*id)),
            KillOutcome::NotFound => not_found.push(Bson::Int64(*id)),
            KillOutcome::Unauthorized => alive.push(Bson::Int64(*id)),
        }
    }

    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "cursorsAlive": alive,
        "cursorsUnknown": Bson::Array(vec![]),
        "ok": 1.0,
    })
}

pub async fn count(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "count")?;
    let filter = optional_document(cmd, "count", "query")?.cloned();
    let limit = non_negative_i64(cmd, "count", "limit")?;
    let skip = non_negative_i64(cmd, "count", "skip")?;
    let deadline = deadline_from(parse_max_time_ms(cmd)?);

    let planned = plan_query(ctx.backend.as_ref(), filter.as_ref(), None, None, None);
    let mut stream = ctx.backend.query(db, &coll, &planned.plan).await?;
    if let Some(residual) = planned.residual_filter {
        stream = aggregation::build_stream(stream, vec![Stage::Match(residual)]);
    }

    let mut matched: i64 = 0;
    loop {
        if let Some(deadline) = deadline {
            if std::time::Instant::now() > deadline {
                return Err(CommandError::max_time_expired());
            }
        }
        match stream.next().await? {
            Some(_) => matched += 1,
            None => break,
        }
    }

    let mut n = matched - skip.unwrap_or(0);
    if n < 0 {
        n = 0;
    }
    if let Some(limit) = limit {
        if limit > 0 && n > limit {
            n = limit;
        }
    }
    Ok(doc! {"n": n as i32, "ok": 1.0})
}

pub async fn distinct(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let coll = collection_name(cmd, "distinct")?;
    let key = match cmd.get("key") {
        None => return Err(CommandError::missing_field("distinct", "key")),
        Some(Bson::String(s)) if !s.is_empty() => s.clone(),
        Some(Bson::String(_)) => {
            return Err(CommandError::bad_value("distinct key cannot be empty"))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'distinct.key' is the wrong type '{}', expected type 'string'",
                type_name(other)
            )))
        }
    };
    let filter = optional_document(cmd, "distinct", "query")?.cloned();

    let planned = plan_query(ctx.backend.as_ref(), filter.as_ref(), None, None, None);
    let mut stream = ctx.backend.query(db, &coll, &planned.plan).await?;
    if let Some(residual) = planned.residual_filter {
        stream = aggregation::build_stream(stream, vec![Stage::Match(residual)]);
    }

    let mut values: Vec<Bson> = Vec::new();
    while let Some(doc) = stream.next().await? {
        let (raw, _) = ordering::raw_path_values(&doc, &key);
        for value in raw {
            // distinct reports array elements, not the arrays themselves.
            let candidates: Vec<Bson> = match value {
                Bson::Array(elements) => elements,
                other => vec![other],
            };
            for candidate in candidates {
                if !values.iter().any(|v| values_equal(v, &candidate)) {
                    values.push(candidate);
                }
            }
        }
    }

    Ok(doc! {"values": values, "ok": 1.0})
}

pub async fn aggregate(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionState,
    db: &str,
    cmd: &Document,
) -> CommandResult {
    let coll = collection_name(cmd, "aggregate")?;
    let pipeline = match cmd.get("pipeline") {
        None => return Err(CommandError::missing_field("aggregate", "pipeline")),
        Some(Bson::Array(a)) => a.clone(),
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field 'aggregate.pipeline' is the wrong type '{}', expected type 'array'",
                type_name(other)
            )))
        }
    };
    let cursor_options = optional_document(cmd, "aggregate", "cursor")?
        .cloned()
        .unwrap_or_default();
    let batch_size = parse_batch_size(&cursor_options, "aggregate", DEFAULT_FIRST_BATCH)?;
    let deadline = deadline_from(parse_max_time_ms(cmd)?);

    let mut stages = aggregation::parse_pipeline(&pipeline)?;

    // A fully pushable leading $match becomes the backend query itself.
    let (plan, skip_first) = match aggregation::leading_match(&stages) {
        Some(filter) => {
            let planned = plan_query(ctx.backend.as_ref(), Some(filter), None, None, None);
            if planned.pushdown && planned.residual_filter.is_none() {
                (planned.plan, true)
            } else {
                (QueryPlan::full_scan(), false)
            }
        }
        None => (QueryPlan::full_scan(), false),
    };
    if skip_first {
        stages.remove(0);
    }

    let input = ctx.backend.query(db, &coll, &plan).await?;
    let stream = aggregation::build_stream(input, stages);

    let ns = format!("{}.{}", db, coll);
    finish_cursor_command(ctx, conn, db, &coll, &ns, stream, batch_size, false, deadline).await
}

pub async fn explain(ctx: &Arc<ServerContext>, db: &str, cmd: &Document) -> CommandResult {
    let inner = match cmd.get("explain") {
        Some(Bson::Document(d)) => d.clone(),
        _ => {
            return Err(CommandError::failed_to_parse(
                "explain command requires a nested command to explain",
            ))
        }
    };
    let Some(inner_name) = inner.keys().next().cloned() else {
        return Err(CommandError::bad_value("explain's nested command is empty"));
    };

    let (coll, filter, sort) = match inner_name.as_str() {
        "find" => (
            collection_name(&inner, "find")?,
            optional_document(&inner, "find", "filter")?.cloned(),
            parse_find_sort(&inner)?,
        ),
        "count" => (
            collection_name(&inner, "count")?,
            optional_document(&inner, "count", "query")?.cloned(),
            None,
        ),
        "aggregate" => {
            let coll = collection_name(&inner, "aggregate")?;
            let pipeline = inner.get_array("pipeline").ok().cloned().unwrap_or_default();
            let stages = aggregation::parse_pipeline(&pipeline)?;
            let filter = aggregation::leading_match(&stages).cloned();
            // Only a leading $match can reach the backend.
            let filter = match (filter, stages.first()) {
                (Some(f), Some(Stage::Match(_))) => Some(f),
                _ => Some(doc! {"$nor": [{}]}), // unpushable marker
            };
            (coll, filter, None)
        }
        other => return Err(CommandError::command_not_found(other)),
    };

    let planned = plan_query(
        ctx.backend.as_ref(),
        filter.as_ref(),
        sort.as_deref(),
        None,
        None,
    );
    let pushdown = planned.pushdown && planned.residual_filter.is_none();

    Ok(doc! {
        "queryPlanner": {
            "namespace": format!("{}.{}", db, coll),
            "parsedQuery": filter.unwrap_or_default(),
            "winningPlan": {
                "stage": if pushdown { "PUSHDOWN" } else { "COLLSCAN" },
                "pushdown": pushdown,
            },
        },
        "explainVersion": "1",
        "command": inner,
        "serverInfo": {
            "name": "doppeldb",
            "backend": ctx.backend.name(),
        },
        "ok": 1.0,
    })
}
