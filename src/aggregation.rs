/*!
 * @file aggregation.rs
 * @brief Aggregation pipeline parsing and pull-based stage execution
 */

use std::collections::VecDeque;

use async_trait::async_trait;
use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::backend::ResultStream;
use crate::error::CommandError;
use crate::expression::{self, sum_values, EvalContext, Expr};
use crate::filter;
use crate::ordering::{self, compare, get_path, numeric_value, values_equal, SortStyle};
use crate::projection::Projection;

pub enum Stage {
    Match(Document),
    Sort(Vec<(String, i8)>),
    Project(Projection),
    Group(GroupSpec),
    AddFields(Vec<(String, Expr)>),
    Unset(Vec<String>),
    Count(String),
    Limit(i64),
    Skip(i64),
    Unwind(UnwindSpec),
}

pub struct GroupSpec {
    pub id: Expr,
    pub accumulators: Vec<(String, AccOp, Expr)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
}

pub struct UnwindSpec {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

/// Parses a pipeline array into executable stages. All validation happens
/// here; a pipeline that parses will not fail on shape later.
pub fn parse_pipeline(stages: &[Bson]) -> Result<Vec<Stage>, CommandError> {
    let mut out = Vec::with_capacity(stages.len());
    for element in stages {
        let doc = match element {
            Bson::Document(d) => d,
            _ => {
                return Err(CommandError::type_mismatch(
                    "Each element of the 'pipeline' array must be an object",
                ))
            }
        };
        if doc.len() != 1 {
            return Err(CommandError::location(
                40323,
                "A pipeline stage specification object must contain exactly one field.",
            ));
        }
        let (name, value) = doc.iter().next().unwrap();
        out.push(parse_stage(name, value)?);
    }
    Ok(out)
}

fn parse_stage(name: &str, value: &Bson) -> Result<Stage, CommandError> {
    match name {
        "$match" => match value {
            Bson::Document(d) => {
                // Walk any $expr once so a malformed expression fails the
                // pipeline build rather than the first document.
                if let Some(expr) = d.get("$expr") {
                    expression::parse(expr)?;
                }
                Ok(Stage::Match(d.clone()))
            }
            _ => Err(CommandError::location(
                15959,
                "the match filter must be an expression in an object",
            )),
        },
        "$sort" => parse_sort(value).map(Stage::Sort),
        "$project" => match value {
            Bson::Document(d) => Ok(Stage::Project(Projection::parse(d, true)?)),
            _ => Err(CommandError::location(
                15969,
                "$project specification must be an object",
            )),
        },
        "$group" => parse_group(value).map(Stage::Group),
        "$addFields" | "$set" => parse_add_fields(name, value).map(Stage::AddFields),
        "$unset" => parse_unset(value).map(Stage::Unset),
        "$count" => parse_count(value).map(Stage::Count),
        "$limit" => parse_non_negative(value, "limit", 15957, 15958).map(Stage::Limit),
        "$skip" => parse_non_negative(value, "skip", 15972, 15956).map(Stage::Skip),
        "$unwind" => parse_unwind(value).map(Stage::Unwind),
        other => Err(CommandError::location(
            40324,
            format!("Unrecognized pipeline stage name: '{}'", other),
        )),
    }
}

pub fn parse_sort(value: &Bson) -> Result<Vec<(String, i8)>, CommandError> {
    let doc = match value {
        Bson::Document(d) => d,
        _ => {
            return Err(CommandError::location(
                15973,
                "the $sort key specification must be an object",
            ))
        }
    };
    if doc.is_empty() {
        return Err(CommandError::location(
            15976,
            "$sort stage must have at least one sort key",
        ));
    }
    let mut keys = Vec::with_capacity(doc.len());
    for (field, dir) in doc {
        let dir = match numeric_value(dir) {
            Some(n) if n == 1.0 => 1i8,
            Some(n) if n == -1.0 => -1i8,
            _ => {
                return Err(CommandError::location(
                    15974,
                    "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
                ))
            }
        };
        keys.push((field.clone(), dir));
    }
    Ok(keys)
}

fn parse_group(value: &Bson) -> Result<GroupSpec, CommandError> {
    let doc = match value {
        Bson::Document(d) => d,
        _ => {
            return Err(CommandError::location(
                15947,
                "a group's fields must be specified in an object",
            ))
        }
    };
    let id = match doc.get("_id") {
        Some(v) => expression::parse(v)?,
        None => {
            return Err(CommandError::location(
                15955,
                "a group specification must include an _id",
            ))
        }
    };

    let mut accumulators = Vec::new();
    for (field, spec) in doc {
        if field == "_id" {
            continue;
        }
        let spec = match spec {
            Bson::Document(d) => d,
            _ => {
                return Err(CommandError::location(
                    40234,
                    format!("The field '{}' must be an accumulator object", field),
                ))
            }
        };
        if spec.len() != 1 {
            return Err(CommandError::location(
                40238,
                format!("The field '{}' must specify one accumulator", field),
            ));
        }
        let (op_name, arg) = spec.iter().next().unwrap();
        let op = match op_name.as_str() {
            "$sum" => AccOp::Sum,
            "$avg" => AccOp::Avg,
            "$min" => AccOp::Min,
            "$max" => AccOp::Max,
            "$first" => AccOp::First,
            "$last" => AccOp::Last,
            "$push" => AccOp::Push,
            "$addToSet" => AccOp::AddToSet,
            "$count" => AccOp::Count,
            other => {
                return Err(CommandError::location(
                    15952,
                    format!("unknown group operator '{}'", other),
                ))
            }
        };
        let expr = match op {
            AccOp::Count => {
                match arg {
                    Bson::Document(d) if d.is_empty() => {}
                    _ => {
                        return Err(CommandError::location(
                            40248,
                            "$count takes no arguments, i.e. $count:{}",
                        ))
                    }
                }
                Expr::Literal(Bson::Null)
            }
            AccOp::Push | AccOp::AddToSet => expression::parse(arg)?,
            _ => {
                // The numeric accumulators are unary; an array argument is
                // the multi-argument expression form and is rejected.
                if matches!(arg, Bson::Array(_)) {
                    return Err(CommandError::location(
                        40237,
                        format!("The {} accumulator is a unary operator", op_name),
                    ));
                }
                expression::parse(arg)?
            }
        };
        accumulators.push((field.clone(), op, expr));
    }

    Ok(GroupSpec { id, accumulators })
}

fn parse_add_fields(name: &str, value: &Bson) -> Result<Vec<(String, Expr)>, CommandError> {
    let doc = match value {
        Bson::Document(d) => d,
        _ => {
            return Err(CommandError::location(
                40272,
                format!("{} specification stage must be an object", name),
            ))
        }
    };
    if doc.is_empty() {
        return Err(CommandError::location(
            40177,
            format!(
                "Invalid {} :: caused by :: specification must have at least one field",
                name
            ),
        ));
    }
    let mut fields = Vec::with_capacity(doc.len());
    for (k, v) in doc {
        fields.push((k.clone(), expression::parse(v)?));
    }
    Ok(fields)
}

fn parse_unset(value: &Bson) -> Result<Vec<String>, CommandError> {
    let paths: Vec<String> = match value {
        Bson::String(s) if !s.is_empty() => vec![s.clone()],
        Bson::Array(arr) if !arr.is_empty() => {
            let mut out = Vec::with_capacity(arr.len());
            for element in arr {
                match element {
                    Bson::String(s) if !s.is_empty() => out.push(s.clone()),
                    _ => {
                        return Err(CommandError::location(
                            31120,
                            "$unset specification must be a string or an array containing only string values",
                        ))
                    }
                }
            }
            out
        }
        _ => {
            return Err(CommandError::location(
                31119,
                "$unset specification must be a string or an array with at least one field",
            ))
        }
    };

    for a in &paths {
        for b in &paths {
            if a != b && b.starts_with(a.as_str()) && b.as_bytes().get(a.len()) == Some(&b'.') {
                return Err(CommandError::location(
                    31249,
                    format!(
                        "Invalid $unset :: caused by :: Path collision at {} remaining portion {}",
                        b,
                        &b[a.len() + 1..]
                    ),
                ));
            }
        }
    }
    Ok(paths)
}

fn parse_count(value: &Bson) -> Result<String, CommandError> {
    let name = match value {
        Bson::String(s) => s.clone(),
        _ => {
            return Err(CommandError::location(
                40156,
                "the count field must be a non-empty string",
            ))
        }
    };
    if name.is_empty() {
        return Err(CommandError::location(
            40156,
            "the count field must be a non-empty string",
        ));
    }
    if name.starts_with('$') {
        return Err(CommandError::location(
            40158,
            "the count field cannot be a $-prefixed path",
        ));
    }
    if name.contains('.') {
        return Err(CommandError::location(
            40160,
            "the count field cannot contain '.'",
        ));
    }
    Ok(name)
}

fn parse_non_negative(
    value: &Bson,
    what: &str,
    type_code: i32,
    range_code: i32,
) -> Result<i64, CommandError> {
    let n = numeric_value(value).ok_or_else(|| {
        CommandError::location(
            type_code,
            format!("the {} must be specified as a number", what),
        )
    })?;
    if n.fract() != 0.0 || n < 0.0 || n > i64::MAX as f64 {
        return Err(CommandError::location(
            range_code,
            format!("the {} must be a non-negative number", what),
        ));
    }
    Ok(n as i64)
}

fn parse_unwind(value: &Bson) -> Result<UnwindSpec, CommandError> {
    fn check_path(path: &str) -> Result<String, CommandError> {
        match path.strip_prefix('$') {
            Some(rest) if !rest.is_empty() => Ok(rest.to_string()),
            _ => Err(CommandError::location(
                28818,
                format!(
                    "path option to $unwind stage should be prefixed with a '$': {}",
                    path
                ),
            )),
        }
    }
    match value {
        Bson::String(s) => Ok(UnwindSpec {
            path: check_path(s)?,
            include_array_index: None,
            preserve_null_and_empty: false,
        }),
        Bson::Document(d) => {
            let path = match d.get("path") {
                Some(Bson::String(s)) => check_path(s)?,
                _ => {
                    return Err(CommandError::location(
                        28812,
                        "no path specified to $unwind stage",
                    ))
                }
            };
            let preserve = match d.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Bson::Boolean(b)) => *b,
                Some(_) => {
                    return Err(CommandError::location(
                        28809,
                        "expected a boolean for the preserveNullAndEmptyArrays option to $unwind stage",
                    ))
                }
            };
            let index_field = match d.get("includeArrayIndex") {
                None => None,
                Some(Bson::String(s)) if !s.is_empty() && !s.starts_with('$') => Some(s.clone()),
                Some(_) => {
                    return Err(CommandError::location(
                        28822,
                        "includeArrayIndex option to $unwind stage should not be prefixed with a '$'",
                    ))
                }
            };
            Ok(UnwindSpec {
                path,
                include_array_index: index_field,
                preserve_null_and_empty: preserve,
            })
        }
        _ => Err(CommandError::location(
            15981,
            "expected either a string or an object as specification for $unwind stage",
        )),
    }
}

/// The filter of a leading `$match`, if the pipeline starts with one.
/// The aggregate command consults the backend about pushing it down.
pub fn leading_match(stages: &[Stage]) -> Option<&Document> {
    match stages.first() {
        Some(Stage::Match(filter)) => Some(filter),
        _ => None,
    }
}

/// Chains pipeline stages over an input stream. Each stage pulls lazily from
/// its upstream; blocking stages (sort, group, count) drain on first pull.
pub fn build_stream(input: Box<dyn ResultStream>, stages: Vec<Stage>) -> Box<dyn ResultStream> {
    let mut current = input;
    for stage in stages {
        current = match stage {
            Stage::Match(f) => Box::new(MatchStream::new(current, f)),
            Stage::Sort(keys) => Box::new(SortStream::new(current, keys, SortStyle::Aggregate)),
            Stage::Project(p) => Box::new(ProjectStream::new(current, p)),
            Stage::Group(g) => Box::new(GroupStream::new(current, g)),
            Stage::AddFields(fields) => Box::new(AddFieldsStream::new(current, fields)),
            Stage::Unset(paths) => Box::new(UnsetStream::new(current, paths)),
            Stage::Count(name) => Box::new(CountStream::new(current, name)),
            Stage::Limit(n) => Box::new(LimitStream::new(current, n)),
            Stage::Skip(n) => Box::new(SkipStream::new(current, n)),
            Stage::Unwind(spec) => Box::new(UnwindStream::new(current, spec)),
        };
    }
    current
}

struct MatchStream {
    upstream: Box<dyn ResultStream>,
    filter: Document,
    pos: u64,
}

impl MatchStream {
    fn new(upstream: Box<dyn ResultStream>, filter: Document) -> Self {
        Self {
            upstream,
            filter,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for MatchStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        while let Some(doc) = self.upstream.next().await? {
            if filter::matches(&doc, &self.filter)? {
                self.pos += 1;
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

/// In-memory stable sort. Also used by `find`, which runs the `Find`
/// comparator; the `$sort` stage runs the `Aggregate` one.
pub struct SortStream {
    upstream: Box<dyn ResultStream>,
    keys: Vec<(String, i8)>,
    style: SortStyle,
    buffered: Option<VecDeque<Document>>,
    pos: u64,
}

impl SortStream {
    pub fn new(upstream: Box<dyn ResultStream>, keys: Vec<(String, i8)>, style: SortStyle) -> Self {
        Self {
            upstream,
            keys,
            style,
            buffered: None,
            pos: 0,
        }
    }
}

pub fn sort_documents(docs: &mut [Document], keys: &[(String, i8)], style: SortStyle) {
    docs.sort_by(|a, b| {
        for (path, dir) in keys {
            let va = get_path(a, path);
            let vb = get_path(b, path);
            let ord = compare(va.as_ref(), vb.as_ref(), style);
            let ord = if *dir < 0 { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[async_trait]
impl ResultStream for SortStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        if self.buffered.is_none() {
            let mut docs = Vec::new();
            while let Some(doc) = self.upstream.next().await? {
                docs.push(doc);
            }
            sort_documents(&mut docs, &self.keys, self.style);
            self.buffered = Some(docs.into());
        }
        match self.buffered.as_mut().unwrap().pop_front() {
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

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct ProjectStream {
    upstream: Box<dyn ResultStream>,
    projection: Projection,
    pos: u64,
}

impl ProjectStream {
    fn new(upstream: Box<dyn ResultStream>, projection: Projection) -> Self {
        Self {
            upstream,
            projection,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for ProjectStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        match self.upstream.next().await? {
            Some(doc) => {
                self.pos += 1;
                Ok(Some(self.projection.apply(&doc)?))
            }
            None => Ok(None),
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct AddFieldsStream {
    upstream: Box<dyn ResultStream>,
    fields: Vec<(String, Expr)>,
    pos: u64,
}

impl AddFieldsStream {
    fn new(upstream: Box<dyn ResultStream>, fields: Vec<(String, Expr)>) -> Self {
        Self {
            upstream,
            fields,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for AddFieldsStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        match self.upstream.next().await? {
            Some(doc) => {
                let ctx = EvalContext::new(doc.clone());
                let mut out = doc;
                for (path, expr) in &self.fields {
                    match expression::eval(expr, &ctx)? {
                        Some(v) => ordering::set_path(&mut out, path, v)?,
                        None => ordering::remove_path(&mut out, path),
                    }
                }
                self.pos += 1;
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct UnsetStream {
    upstream: Box<dyn ResultStream>,
    paths: Vec<String>,
    pos: u64,
}

impl UnsetStream {
    fn new(upstream: Box<dyn ResultStream>, paths: Vec<String>) -> Self {
        Self {
            upstream,
            paths,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for UnsetStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        match self.upstream.next().await? {
            Some(doc) => {
                let mut out = doc;
                for path in &self.paths {
                    ordering::remove_path(&mut out, path);
                }
                self.pos += 1;
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct GroupStream {
    upstream: Box<dyn ResultStream>,
    spec: GroupSpec,
    groups: Option<VecDeque<Document>>,
    pos: u64,
}

impl GroupStream {
    fn new(upstream: Box<dyn ResultStream>, spec: GroupSpec) -> Self {
        Self {
            upstream,
            spec,
            groups: None,
            pos: 0,
        }
    }

    async fn drain(&mut self) -> Result<VecDeque<Document>, CommandError> {
        struct Bucket {
            id: Bson,
            states: Vec<AccState>,
        }

        let mut buckets: IndexMap<String, Bucket> = IndexMap::new();
        while let Some(doc) = self.upstream.next().await? {
            let ctx = EvalContext::new(doc.clone());
            let id = expression::eval(&self.spec.id, &ctx)?.unwrap_or(Bson::Null);
            // Numerically equal keys of different widths share a bucket; the
            // bucket's _id keeps the first value that arrived.
            let key = ordering::canonical_key(&id);
            let bucket = buckets.entry(key).or_insert_with(|| Bucket {
                id,
                states: self
                    .spec
                    .accumulators
                    .iter()
                    .map(|(_, op, _)| AccState::new(*op))
                    .collect(),
            });
            for (i, (_, _, expr)) in self.spec.accumulators.iter().enumerate() {
                let value = expression::eval(expr, &ctx)?;
                bucket.states[i].update(value);
            }
        }

        let mut out = VecDeque::with_capacity(buckets.len());
        for (_, bucket) in buckets {
            let mut doc = Document::new();
            doc.insert("_id", bucket.id);
            for ((name, _, _), state) in self.spec.accumulators.iter().zip(bucket.states) {
                doc.insert(name.clone(), state.finalize());
            }
            out.push_back(doc);
        }
        Ok(out)
    }
}

#[async_trait]
impl ResultStream for GroupStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        if self.groups.is_none() {
            let groups = self.drain().await?;
            self.groups = Some(groups);
        }
        match self.groups.as_mut().unwrap().pop_front() {
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

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct AccState {
    op: AccOp,
    values: Vec<Bson>,
    single: Option<Bson>,
    seen_first: bool,
    count: i64,
}

impl AccState {
    fn new(op: AccOp) -> Self {
        Self {
            op,
            values: Vec::new(),
            single: None,
            seen_first: false,
            count: 0,
        }
    }

    fn update(&mut self, value: Option<Bson>) {
        match self.op {
            AccOp::Sum | AccOp::Avg | AccOp::Push => {
                if let Some(v) = value {
                    self.values.push(v);
                }
            }
            AccOp::AddToSet => {
                if let Some(v) = value {
                    if !self.values.iter().any(|existing| values_equal(existing, &v)) {
                        self.values.push(v);
                    }
                }
            }
            AccOp::First => {
                if !self.seen_first {
                    self.single = Some(value.unwrap_or(Bson::Null));
                    self.seen_first = true;
                }
            }
            AccOp::Last => {
                self.single = Some(value.unwrap_or(Bson::Null));
            }
            AccOp::Min | AccOp::Max => {
                let Some(v) = value else { return };
                if matches!(v, Bson::Null | Bson::Undefined) {
                    return;
                }
                let take = match &self.single {
                    None => true,
                    Some(best) => {
                        let ord = compare(Some(&v), Some(best), SortStyle::Aggregate);
                        if self.op == AccOp::Min {
                            ord == std::cmp::Ordering::Less
                        } else {
                            ord == std::cmp::Ordering::Greater
                        }
                    }
                };
                if take {
                    self.single = Some(v);
                }
            }
            AccOp::Count => {
                self.count += 1;
            }
        }
    }

    fn finalize(self) -> Bson {
        match self.op {
            AccOp::Sum => sum_values(&self.values),
            AccOp::Avg => {
                let nums: Vec<f64> = self.values.iter().filter_map(numeric_value).collect();
                if nums.is_empty() {
                    Bson::Null
                } else {
                    Bson::Double(nums.iter().sum::<f64>() / nums.len() as f64)
                }
            }
            AccOp::Min | AccOp::Max | AccOp::First | AccOp::Last => {
                self.single.unwrap_or(Bson::Null)
            }
            AccOp::Push | AccOp::AddToSet => Bson::Array(self.values),
            AccOp::Count => {
                if self.count <= i32::MAX as i64 {
                    Bson::Int32(self.count as i32)
                } else {
                    Bson::Int64(self.count)
                }
            }
        }
    }
}

struct CountStream {
    upstream: Box<dyn ResultStream>,
    name: String,
    emitted: bool,
    pos: u64,
}

impl CountStream {
    fn new(upstream: Box<dyn ResultStream>, name: String) -> Self {
        Self {
            upstream,
            name,
            emitted: false,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for CountStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        let mut count: i64 = 0;
        while self.upstream.next().await?.is_some() {
            count += 1;
        }
        // $count is $group + $project; with no input there is no group.
        if count == 0 {
            return Ok(None);
        }
        self.pos += 1;
        let mut doc = Document::new();
        if count <= i32::MAX as i64 {
            doc.insert(self.name.clone(), count as i32);
        } else {
            doc.insert(self.name.clone(), count);
        }
        Ok(Some(doc))
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct LimitStream {
    upstream: Box<dyn ResultStream>,
    remaining: i64,
    pos: u64,
}

impl LimitStream {
    fn new(upstream: Box<dyn ResultStream>, n: i64) -> Self {
        Self {
            upstream,
            remaining: n,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for LimitStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        if self.remaining <= 0 {
            return Ok(None);
        }
        match self.upstream.next().await? {
            Some(doc) => {
                self.remaining -= 1;
                self.pos += 1;
                Ok(Some(doc))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct SkipStream {
    upstream: Box<dyn ResultStream>,
    to_skip: i64,
    pos: u64,
}

impl SkipStream {
    fn new(upstream: Box<dyn ResultStream>, n: i64) -> Self {
        Self {
            upstream,
            to_skip: n,
            pos: 0,
        }
    }
}

#[async_trait]
impl ResultStream for SkipStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        while self.to_skip > 0 {
            if self.upstream.next().await?.is_none() {
                self.to_skip = 0;
                return Ok(None);
            }
            self.to_skip -= 1;
        }
        match self.upstream.next().await? {
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

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

struct UnwindStream {
    upstream: Box<dyn ResultStream>,
    spec: UnwindSpec,
    pending: VecDeque<Document>,
    pos: u64,
}

impl UnwindStream {
    fn new(upstream: Box<dyn ResultStream>, spec: UnwindSpec) -> Self {
        Self {
            upstream,
            spec,
            pending: VecDeque::new(),
            pos: 0,
        }
    }

    fn expand(&mut self, doc: Document) -> Result<(), CommandError> {
        let value = get_path(&doc, &self.spec.path);
        match value {
            Some(Bson::Array(elements)) => {
                if elements.is_empty() {
                    if self.spec.preserve_null_and_empty {
                        let mut out = doc;
                        ordering::remove_path(&mut out, &self.spec.path);
                        if let Some(index_field) = &self.spec.include_array_index {
                            ordering::set_path(&mut out, index_field, Bson::Null)?;
                        }
                        self.pending.push_back(out);
                    }
                    return Ok(());
                }
                for (i, element) in elements.into_iter().enumerate() {
                    let mut out = doc.clone();
                    ordering::set_path(&mut out, &self.spec.path, element)?;
                    if let Some(index_field) = &self.spec.include_array_index {
                        ordering::set_path(&mut out, index_field, Bson::Int64(i as i64))?;
                    }
                    self.pending.push_back(out);
                }
            }
            None | Some(Bson::Null) | Some(Bson::Undefined) => {
                if self.spec.preserve_null_and_empty {
                    let mut out = doc;
                    if let Some(index_field) = &self.spec.include_array_index {
                        ordering::set_path(&mut out, index_field, Bson::Null)?;
                    }
                    self.pending.push_back(out);
                }
            }
            Some(_) => {
                // A non-array value unwinds to itself.
                let mut out = doc;
                if let Some(index_field) = &self.spec.include_array_index {
                    ordering::set_path(&mut out, index_field, Bson::Null)?;
                }
                self.pending.push_back(out);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStream for UnwindStream {
    async fn next(&mut self) -> Result<Option<Document>, CommandError> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                self.pos += 1;
                return Ok(Some(doc));
            }
            match self.upstream.next().await? {
                Some(doc) => self.expand(doc)?,
                None => return Ok(None),
            }
        }
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        self.upstream.close().await;
    }
}

/// Materializes a whole stream; used by commands with non-cursor replies.
pub async fn collect(mut stream: Box<dyn ResultStream>) -> Result<Vec<Document>, CommandError> {
    let mut out = Vec::new();
    while let Some(doc) = stream.next().await? {
        out.push(doc);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VecStream;
    use bson::{bson, doc};

    fn run(pipeline: Vec<Bson>, input: Vec<Document>) -> Result<Vec<Document>, CommandError> {
        let stages = parse_pipeline(&pipeline)?;
        let stream = build_stream(Box::new(VecStream::new(input)), stages);
        futures::executor::block_on(collect(stream))
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = run(vec![bson!({"$frobnicate": 1})], vec![]).unwrap_err();
        assert_eq!(err.code, 40324);
        assert_eq!(err.message, "Unrecognized pipeline stage name: '$frobnicate'");
    }

    #[test]
    fn match_then_count() {
        let input: Vec<Document> = (0..110).map(|i| doc! {"_id": i, "v": 42}).collect();
        let out = run(
            vec![bson!({"$match": {"v": 42}}), bson!({"$count": "v"})],
            input,
        )
        .unwrap();
        assert_eq!(out, vec![doc! {"v": 110}]);
    }

    #[test]
    fn group_keeps_first_numeric_type() {
        let input = vec![doc! {"k": 1}, doc! {"k": 1.0}, doc! {"k": 2}];
        let out = run(
            vec![bson!({"$group": {"_id": "$k", "n": {"$sum": 1}}})],
            input,
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        // int 1 arrived first; double 1.0 joined its bucket.
        assert_eq!(out[0].get("_id"), Some(&Bson::Int32(1)));
        assert_eq!(out[0].get_i32("n").unwrap(), 2);
    }

    #[test]
    fn group_requires_id() {
        let err = run(vec![bson!({"$group": {"n": {"$sum": 1}}})], vec![]).unwrap_err();
        assert_eq!(err.code, 15955);
    }

    #[test]
    fn sum_rejects_array_argument() {
        let err = run(
            vec![bson!({"$group": {"_id": Bson::Null, "n": {"$sum": []}}})],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err.code, 40237);
    }

    #[test]
    fn unwind_drops_missing_and_null() {
        let input = vec![
            doc! {"_id": 1, "a": [10, 20]},
            doc! {"_id": 2, "a": Bson::Null},
            doc! {"_id": 3},
        ];
        let out = run(vec![bson!({"$unwind": "$a"})], input).unwrap();
        assert_eq!(out, vec![doc! {"_id": 1, "a": 10}, doc! {"_id": 1, "a": 20}]);
    }

    #[test]
    fn unset_path_collision() {
        let err = run(vec![bson!({"$unset": ["v", "v.foo"]})], vec![]).unwrap_err();
        assert_eq!(err.code, 31249);
    }
}
