/*!
 * @file expression.rs
 * @brief Aggregation expression tree and evaluator
 */

use bson::{Bson, Document};

use crate::error::{code, CommandError};
use crate::filter::is_truthy;
use crate::ordering::{compare, get_path, numeric_value, type_name, SortStyle};

/// A parsed aggregation expression. Unknown operators fail at parse time, so
/// a bad pipeline never starts producing documents.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Bson),
    FieldRef(String),
    Variable(SystemVariable),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Op(&'static str, Vec<Expr>),
}

#[derive(Debug, Clone)]
pub struct SystemVariable {
    pub kind: VariableKind,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Now,
    Root,
    Current,
}

pub struct EvalContext {
    pub current: Document,
    pub now: bson::DateTime,
}

impl EvalContext {
    pub fn new(current: Document) -> Self {
        Self {
            current,
            now: bson::DateTime::from_chrono(chrono::Utc::now()),
        }
    }
}

const OPERATORS: &[(&str, Option<usize>)] = &[
    ("$type", Some(1)),
    ("$sum", None),
    ("$avg", None),
    ("$min", None),
    ("$max", None),
    ("$add", None),
    ("$subtract", Some(2)),
    ("$multiply", None),
    ("$divide", Some(2)),
    ("$mod", Some(2)),
    ("$abs", Some(1)),
    ("$eq", Some(2)),
    ("$ne", Some(2)),
    ("$gt", Some(2)),
    ("$gte", Some(2)),
    ("$lt", Some(2)),
    ("$lte", Some(2)),
    ("$cmp", Some(2)),
    ("$and", None),
    ("$or", None),
    ("$not", Some(1)),
    ("$concat", None),
    ("$ifNull", None),
    ("$cond", Some(3)),
    ("$size", Some(1)),
];

pub fn parse(value: &Bson) -> Result<Expr, CommandError> {
    match value {
        Bson::Document(doc) => parse_document(doc),
        Bson::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for element in arr {
                out.push(parse(element)?);
            }
            Ok(Expr::Array(out))
        }
        Bson::String(s) if s.starts_with("$$") => parse_variable(&s[2..]),
        Bson::String(s) if s.starts_with('$') => {
            let path = &s[1..];
            if path.is_empty() {
                return Err(CommandError::location(
                    16872,
                    "'$' by itself is not a valid FieldPath",
                ));
            }
            Ok(Expr::FieldRef(path.to_string()))
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn parse_document(doc: &Document) -> Result<Expr, CommandError> {
    let has_operator = doc.keys().any(|k| k.starts_with('$'));
    if !has_operator {
        let mut fields = Vec::with_capacity(doc.len());
        for (k, v) in doc {
            fields.push((k.clone(), parse(v)?));
        }
        return Ok(Expr::Object(fields));
    }
    if doc.len() != 1 {
        return Err(CommandError::location(
            15983,
            format!(
                "An object representing an expression must have exactly one field: {:?}",
                doc
            ),
        ));
    }
    let (op, arg) = doc.iter().next().unwrap();

    if op == "$literal" {
        return Ok(Expr::Literal(arg.clone()));
    }

    let Some((name, arity)) = OPERATORS.iter().find(|(n, _)| *n == op.as_str()).copied() else {
        return Err(CommandError::new(
            code::INVALID_PIPELINE_OPERATOR,
            format!("Unrecognized expression '{}'", op),
        ));
    };

    let args = parse_args(name, arg)?;
    if let Some(expected) = arity {
        if args.len() != expected {
            return Err(CommandError::location(
                16020,
                format!(
                    "Expression {} takes exactly {} arguments. {} were passed in.",
                    name,
                    expected,
                    args.len()
                ),
            ));
        }
    }
    Ok(Expr::Op(name, args))
}

fn parse_args(name: &'static str, arg: &Bson) -> Result<Vec<Expr>, CommandError> {
    if name == "$cond" {
        if let Bson::Document(spec) = arg {
            if spec.contains_key("if") {
                let mut args = Vec::with_capacity(3);
                for field in ["if", "then", "else"] {
                    let v = spec.get(field).ok_or_else(|| {
                        CommandError::location(
                            17080,
                            format!("Missing '{}' parameter to $cond", field),
                        )
                    })?;
                    args.push(parse(v)?);
                }
                return Ok(args);
            }
        }
    }
    match arg {
        Bson::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for element in arr {
                out.push(parse(element)?);
            }
            Ok(out)
        }
        other => Ok(vec![parse(other)?]),
    }
}

fn parse_variable(name: &str) -> Result<Expr, CommandError> {
    let (head, path) = match name.split_once('.') {
        Some((head, rest)) => (head, Some(rest.to_string())),
        None => (name, None),
    };
    let kind = match head {
        "NOW" => VariableKind::Now,
        "ROOT" => VariableKind::Root,
        "CURRENT" => VariableKind::Current,
        other => {
            return Err(CommandError::location(
                17276,
                format!("Use of undefined variable: {}", other),
            ))
        }
    };
    Ok(Expr::Variable(SystemVariable { kind, path }))
}

/// Evaluates an expression; `None` is the "missing" value, which callers
/// translate to an absent field.
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Option<Bson>, CommandError> {
    match expr {
        Expr::Literal(v) => Ok(Some(v.clone())),
        Expr::FieldRef(path) => Ok(get_path(&ctx.current, path)),
        Expr::Variable(var) => {
            let base = match var.kind {
                VariableKind::Now => Bson::DateTime(ctx.now),
                VariableKind::Root | VariableKind::Current => Bson::Document(ctx.current.clone()),
            };
            match &var.path {
                None => Ok(Some(base)),
                Some(path) => match base {
                    Bson::Document(d) => Ok(get_path(&d, path)),
                    _ => Ok(None),
                },
            }
        }
        Expr::Array(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(eval(element, ctx)?.unwrap_or(Bson::Null));
            }
            Ok(Some(Bson::Array(out)))
        }
        Expr::Object(fields) => {
            let mut out = Document::new();
            for (k, sub) in fields {
                if let Some(v) = eval(sub, ctx)? {
                    out.insert(k.clone(), v);
                }
            }
            Ok(Some(Bson::Document(out)))
        }
        Expr::Op(name, args) => eval_op(name, args, ctx),
    }
}

fn eval_op(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Option<Bson>, CommandError> {
    match name {
        "$type" => {
            let v = eval(&args[0], ctx)?;
            Ok(Some(Bson::String(
                v.as_ref().map(type_name).unwrap_or("missing").to_string(),
            )))
        }
        "$sum" => Ok(Some(sum_values(&flatten_numeric_args(args, ctx)?))),
        "$avg" => {
            let values = flatten_numeric_args(args, ctx)?;
            let nums: Vec<f64> = values.iter().filter_map(numeric_value).collect();
            if nums.is_empty() {
                Ok(Some(Bson::Null))
            } else {
                Ok(Some(Bson::Double(
                    nums.iter().sum::<f64>() / nums.len() as f64,
                )))
            }
        }
        "$min" | "$max" => {
            let values = flatten_args(args, ctx)?;
            let mut best: Option<Bson> = None;
            for v in values {
                if matches!(v, Bson::Null | Bson::Undefined) {
                    continue;
                }
                let take = match &best {
                    None => true,
                    Some(b) => {
                        let ord = compare(Some(&v), Some(b), SortStyle::Aggregate);
                        if name == "$min" {
                            ord == std::cmp::Ordering::Less
                        } else {
                            ord == std::cmp::Ordering::Greater
                        }
                    }
                };
                if take {
                    best = Some(v);
                }
            }
            Ok(Some(best.unwrap_or(Bson::Null)))
        }
        "$add" => {
            let mut acc_i: i64 = 0;
            let mut acc_f: f64 = 0.0;
            let mut any_double = false;
            let mut all_int32 = true;
            let mut date_ms: Option<i64> = None;
            for arg in args {
                let v = match eval(arg, ctx)? {
                    None => return Ok(Some(Bson::Null)),
                    Some(Bson::Null) => return Ok(Some(Bson::Null)),
                    Some(v) => v,
                };
                match &v {
                    Bson::DateTime(dt) => {
                        if date_ms.is_some() {
                            return Err(CommandError::location(
                                16612,
                                "only one date allowed in an $add expression",
                            ));
                        }
                        date_ms = Some(dt.timestamp_millis());
                    }
                    _ => {
                        let n = numeric_value(&v).ok_or_else(|| {
                            CommandError::location(
                                16554,
                                format!(
                                    "$add only supports numeric or date types, not {}",
                                    type_name(&v)
                                ),
                            )
                        })?;
                        if !matches!(v, Bson::Int32(_)) {
                            all_int32 = false;
                        }
                        if matches!(v, Bson::Double(_) | Bson::Decimal128(_)) {
                            any_double = true;
                        }
                        acc_i = acc_i.wrapping_add(n as i64);
                        acc_f += n;
                    }
                }
            }
            if let Some(ms) = date_ms {
                return Ok(Some(Bson::DateTime(bson::DateTime::from_millis(
                    ms + acc_f as i64,
                ))));
            }
            Ok(Some(arith_result(all_int32, any_double, acc_i, acc_f)))
        }
        "$subtract" => {
            let a = eval(&args[0], ctx)?;
            let b = eval(&args[1], ctx)?;
            let (a, b) = match (a, b) {
                (Some(a), Some(b))
                    if !matches!(a, Bson::Null) && !matches!(b, Bson::Null) =>
                {
                    (a, b)
                }
                _ => return Ok(Some(Bson::Null)),
            };
            match (&a, &b) {
                (Bson::DateTime(x), Bson::DateTime(y)) => Ok(Some(Bson::Int64(
                    x.timestamp_millis() - y.timestamp_millis(),
                ))),
                (Bson::DateTime(x), _) => {
                    let n = require_number("$subtract", &b)?;
                    Ok(Some(Bson::DateTime(bson::DateTime::from_millis(
                        x.timestamp_millis() - n as i64,
                    ))))
                }
                _ => {
                    let x = require_number("$subtract", &a)?;
                    let y = require_number("$subtract", &b)?;
                    let all_int32 = matches!(a, Bson::Int32(_)) && matches!(b, Bson::Int32(_));
                    let any_double = matches!(a, Bson::Double(_) | Bson::Decimal128(_))
                        || matches!(b, Bson::Double(_) | Bson::Decimal128(_));
                    Ok(Some(arith_result(
                        all_int32,
                        any_double,
                        (x as i64).wrapping_sub(y as i64),
                        x - y,
                    )))
                }
            }
        }
        "$multiply" => {
            let mut acc_i: i64 = 1;
            let mut acc_f: f64 = 1.0;
            let mut any_double = false;
            let mut all_int32 = true;
            for arg in args {
                let v = match eval(arg, ctx)? {
                    None => return Ok(Some(Bson::Null)),
                    Some(Bson::Null) => return Ok(Some(Bson::Null)),
                    Some(v) => v,
                };
                let n = require_number("$multiply", &v)?;
                if !matches!(v, Bson::Int32(_)) {
                    all_int32 = false;
                }
                if matches!(v, Bson::Double(_) | Bson::Decimal128(_)) {
                    any_double = true;
                }
                acc_i = acc_i.wrapping_mul(n as i64);
                acc_f *= n;
            }
            Ok(Some(arith_result(all_int32, any_double, acc_i, acc_f)))
        }
        "$divide" => {
            let a = match eval(&args[0], ctx)? {
                Some(v) if !matches!(v, Bson::Null) => v,
                _ => return Ok(Some(Bson::Null)),
            };
            let b = match eval(&args[1], ctx)? {
                Some(v) if !matches!(v, Bson::Null) => v,
                _ => return Ok(Some(Bson::Null)),
            };
            let x = require_number("$divide", &a)?;
            let y = require_number("$divide", &b)?;
            if y == 0.0 {
                return Err(CommandError::location(16608, "can't $divide by zero"));
            }
            Ok(Some(Bson::Double(x / y)))
        }
        "$mod" => {
            let a = match eval(&args[0], ctx)? {
                Some(v) if !matches!(v, Bson::Null) => v,
                _ => return Ok(Some(Bson::Null)),
            };
            let b = match eval(&args[1], ctx)? {
                Some(v) if !matches!(v, Bson::Null) => v,
                _ => return Ok(Some(Bson::Null)),
            };
            let x = require_number("$mod", &a)?;
            let y = require_number("$mod", &b)?;
            if y == 0.0 {
                return Err(CommandError::location(16610, "can't $mod by zero"));
            }
            if matches!(a, Bson::Double(_)) || matches!(b, Bson::Double(_)) {
                Ok(Some(Bson::Double(x % y)))
            } else {
                Ok(Some(Bson::Int64((x as i64) % (y as i64))))
            }
        }
        "$abs" => match eval(&args[0], ctx)? {
            None | Some(Bson::Null) => Ok(Some(Bson::Null)),
            Some(v) => {
                let n = require_number("$abs", &v)?;
                Ok(Some(match v {
                    Bson::Int32(i) => Bson::Int32(i.abs()),
                    Bson::Int64(i) => Bson::Int64(i.abs()),
                    _ => Bson::Double(n.abs()),
                }))
            }
        },
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let a = eval(&args[0], ctx)?;
            let b = eval(&args[1], ctx)?;
            let ord = compare(a.as_ref(), b.as_ref(), SortStyle::Aggregate);
            Ok(Some(match name {
                "$eq" => Bson::Boolean(ord == std::cmp::Ordering::Equal),
                "$ne" => Bson::Boolean(ord != std::cmp::Ordering::Equal),
                "$gt" => Bson::Boolean(ord == std::cmp::Ordering::Greater),
                "$gte" => Bson::Boolean(ord != std::cmp::Ordering::Less),
                "$lt" => Bson::Boolean(ord == std::cmp::Ordering::Less),
                "$lte" => Bson::Boolean(ord != std::cmp::Ordering::Greater),
                _ => Bson::Int32(match ord {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }),
            }))
        }
        "$and" => {
            for arg in args {
                let v = eval(arg, ctx)?;
                if !v.map(|v| is_truthy(&v)).unwrap_or(false) {
                    return Ok(Some(Bson::Boolean(false)));
                }
            }
            Ok(Some(Bson::Boolean(true)))
        }
        "$or" => {
            for arg in args {
                let v = eval(arg, ctx)?;
                if v.map(|v| is_truthy(&v)).unwrap_or(false) {
                    return Ok(Some(Bson::Boolean(true)));
                }
            }
            Ok(Some(Bson::Boolean(false)))
        }
        "$not" => {
            let v = eval(&args[0], ctx)?;
            Ok(Some(Bson::Boolean(
                !v.map(|v| is_truthy(&v)).unwrap_or(false),
            )))
        }
        "$concat" => {
            let mut out = String::new();
            for arg in args {
                match eval(arg, ctx)? {
                    None | Some(Bson::Null) => return Ok(Some(Bson::Null)),
                    Some(Bson::String(s)) => out.push_str(&s),
                    Some(other) => {
                        return Err(CommandError::location(
                            16702,
                            format!(
                                "$concat only supports strings, not {}",
                                type_name(&other)
                            ),
                        ))
                    }
                }
            }
            Ok(Some(Bson::String(out)))
        }
        "$ifNull" => {
            if args.len() < 2 {
                return Err(CommandError::location(
                    1257300,
                    "$ifNull needs at least two arguments",
                ));
            }
            for arg in &args[..args.len() - 1] {
                if let Some(v) = eval(arg, ctx)? {
                    if !matches!(v, Bson::Null | Bson::Undefined) {
                        return Ok(Some(v));
                    }
                }
            }
            eval(&args[args.len() - 1], ctx)
        }
        "$cond" => {
            let test = eval(&args[0], ctx)?;
            if test.map(|v| is_truthy(&v)).unwrap_or(false) {
                eval(&args[1], ctx)
            } else {
                eval(&args[2], ctx)
            }
        }
        "$size" => match eval(&args[0], ctx)? {
            Some(Bson::Array(a)) => Ok(Some(Bson::Int32(a.len() as i32))),
            other => Err(CommandError::location(
                17124,
                format!(
                    "The argument to $size must be an array, but was of type: {}",
                    other.as_ref().map(type_name).unwrap_or("missing")
                ),
            )),
        },
        other => Err(CommandError::new(
            code::INVALID_PIPELINE_OPERATOR,
            format!("Unrecognized expression '{}'", other),
        )),
    }
}

fn require_number(op: &str, v: &Bson) -> Result<f64, CommandError> {
    numeric_value(v).ok_or_else(|| {
        CommandError::location(
            16611,
            format!("{} only supports numeric types, not {}", op, type_name(v)),
        )
    })
}

fn flatten_args(args: &[Expr], ctx: &EvalContext) -> Result<Vec<Bson>, CommandError> {
    let mut values = Vec::new();
    for arg in args {
        if let Some(v) = eval(arg, ctx)? {
            values.push(v);
        }
    }
    if values.len() == 1 {
        if let Bson::Array(inner) = &values[0] {
            return Ok(inner.clone());
        }
    }
    Ok(values)
}

fn flatten_numeric_args(args: &[Expr], ctx: &EvalContext) -> Result<Vec<Bson>, CommandError> {
    flatten_args(args, ctx)
}

/// Shared by the `$sum` expression and the `$sum` accumulator: non-numeric
/// inputs are ignored and an empty input sums to int 0.
pub fn sum_values(values: &[Bson]) -> Bson {
    let mut acc_i: i64 = 0;
    let mut acc_f: f64 = 0.0;
    let mut any_double = false;
    let mut all_int32 = true;
    let mut any = false;
    for v in values {
        let Some(n) = numeric_value(v) else { continue };
        any = true;
        if !matches!(v, Bson::Int32(_)) {
            all_int32 = false;
        }
        if matches!(v, Bson::Double(_) | Bson::Decimal128(_)) {
            any_double = true;
        }
        acc_i = acc_i.wrapping_add(n as i64);
        acc_f += n;
    }
    if !any {
        return Bson::Int32(0);
    }
    arith_result(all_int32, any_double, acc_i, acc_f)
}

fn arith_result(all_int32: bool, any_double: bool, acc_i: i64, acc_f: f64) -> Bson {
    if any_double {
        Bson::Double(acc_f)
    } else if all_int32 && acc_i >= i32::MIN as i64 && acc_i <= i32::MAX as i64 {
        Bson::Int32(acc_i as i32)
    } else {
        Bson::Int64(acc_i)
    }
}

// Exercised further by the pipeline tests in tests/aggregation_tests.rs.
#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    fn eval_on(doc: Document, expr: &Bson) -> Result<Option<Bson>, CommandError> {
        let parsed = parse(expr)?;
        eval(&parsed, &EvalContext::new(doc))
    }

    #[test]
    fn field_refs_and_literals() {
        let d = doc! {"a": {"b": 3}};
        assert_eq!(eval_on(d.clone(), &bson!("$a.b")).unwrap(), Some(bson!(3)));
        assert_eq!(eval_on(d.clone(), &bson!("$a.c")).unwrap(), None);
        assert_eq!(
            eval_on(d, &bson!({"$literal": "$a.b"})).unwrap(),
            Some(bson!("$a.b"))
        );
    }

    #[test]
    fn unknown_operator_fails_at_parse() {
        let err = parse(&bson!({"$frobnicate": 1})).unwrap_err();
        assert_eq!(err.code, code::INVALID_PIPELINE_OPERATOR);
    }

    #[test]
    fn type_of_missing() {
        let d = doc! {"a": 1};
        assert_eq!(
            eval_on(d, &bson!({"$type": "$nope"})).unwrap(),
            Some(bson!("missing"))
        );
    }

    #[test]
    fn sum_promotes_types() {
        assert_eq!(sum_values(&[bson!(1), bson!(2)]), bson!(3));
        assert_eq!(sum_values(&[bson!(1), bson!(2.5)]), bson!(3.5));
        assert_eq!(
            sum_values(&[bson!(1i64), bson!(2)]),
            Bson::Int64(3)
        );
        assert_eq!(sum_values(&[bson!("x")]), bson!(0));
    }
}
