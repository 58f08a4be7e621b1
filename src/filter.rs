/*!
 * @file filter.rs
 * @brief MongoDB query filter evaluation and backend pushdown analysis
 */

use bson::{Bson, Document};
use regex::Regex as CompiledRegex;

use crate::error::CommandError;
use crate::expression::{self, EvalContext};
use crate::ordering::{
    self, compare, matches_type_spec, numeric_value, raw_path_values, values_equal, SortStyle,
};

/// Evaluates a query filter document against a document.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, CommandError> {
    for (key, value) in filter {
        let ok = match key.as_str() {
            "$and" => logical_list(doc, value, key)?.iter().all(|b| *b),
            "$or" => logical_list(doc, value, key)?.iter().any(|b| *b),
            "$nor" => !logical_list(doc, value, key)?.iter().any(|b| *b),
            "$not" => match value {
                Bson::Document(inner) => !matches(doc, inner)?,
                _ => {
                    return Err(CommandError::bad_value(
                        "$not needs a document",
                    ))
                }
            },
            "$expr" => {
                let expr = expression::parse(value)?;
                let ctx = EvalContext::new(doc.clone());
                match expression::eval(&expr, &ctx)? {
                    None => false,
                    Some(v) => is_truthy(&v),
                }
            }
            "$where" => {
                return Err(CommandError::bad_value(
                    "$where is not supported",
                ))
            }
            "$comment" => true,
            k if k.starts_with('$') => {
                return Err(CommandError::bad_value(format!(
                    "unknown top level operator: {}",
                    k
                )))
            }
            path => matches_field(doc, path, value)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_list(doc: &Document, value: &Bson, op: &str) -> Result<Vec<bool>, CommandError> {
    let arr = match value {
        Bson::Array(a) if !a.is_empty() => a,
        _ => {
            return Err(CommandError::bad_value(format!(
                "{} must be a nonempty array",
                op
            )))
        }
    };
    let mut out = Vec::with_capacity(arr.len());
    for element in arr {
        match element {
            Bson::Document(sub) => out.push(matches(doc, sub)?),
            _ => {
                return Err(CommandError::bad_value(format!(
                    "{} argument's entries must be objects",
                    op
                )))
            }
        }
    }
    Ok(out)
}

fn matches_field(doc: &Document, path: &str, condition: &Bson) -> Result<bool, CommandError> {
    let (raw, found) = raw_path_values(doc, path);
    let candidates = scalar_candidates(&raw);

    match condition {
        Bson::Document(ops) if is_operator_doc(ops) => {
            apply_operators(ops, &raw, &candidates, found)
        }
        Bson::RegularExpression(re) => regex_matches(&re.pattern, &re.options, &candidates),
        other => Ok(equality(other, &candidates, found)),
    }
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

/// Scalar comparison candidates: each reachable value plus, when a value is
/// an array, its elements (implicit array member matching).
fn scalar_candidates(raw: &[Bson]) -> Vec<Bson> {
    let mut out = Vec::with_capacity(raw.len());
    for v in raw {
        out.push(v.clone());
        if let Bson::Array(a) = v {
            out.extend(a.iter().cloned());
        }
    }
    out
}

fn equality(target: &Bson, candidates: &[Bson], found: bool) -> bool {
    if matches!(target, Bson::Null) {
        // {field: null} matches both explicit null and a missing field.
        return !found
            || candidates
                .iter()
                .any(|c| matches!(c, Bson::Null | Bson::Undefined));
    }
    candidates.iter().any(|c| values_equal(c, target))
}

fn apply_operators(
    ops: &Document,
    raw: &[Bson],
    candidates: &[Bson],
    found: bool,
) -> Result<bool, CommandError> {
    // $regex and $options pair up; evaluated together.
    let options = ops.get("$options").and_then(|v| v.as_str()).unwrap_or("");

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equality(arg, candidates, found),
            "$ne" => !equality(arg, candidates, found),
            "$gt" => ordered_match(arg, candidates, |o| o == std::cmp::Ordering::Greater),
            "$gte" => ordered_match(arg, candidates, |o| o != std::cmp::Ordering::Less),
            "$lt" => ordered_match(arg, candidates, |o| o == std::cmp::Ordering::Less),
            "$lte" => ordered_match(arg, candidates, |o| o != std::cmp::Ordering::Greater),
            "$in" => in_match(arg, candidates, found)?,
            "$nin" => !in_match(arg, candidates, found)?,
            "$exists" => {
                if is_truthy(arg) {
                    found
                } else {
                    !found
                }
            }
            "$type" => {
                let mut any = false;
                for c in candidates {
                    if matches_type_spec(c, arg)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$regex" => match arg {
                Bson::String(pattern) => regex_matches(pattern, options, candidates)?,
                Bson::RegularExpression(re) => {
                    let merged = if options.is_empty() { &re.options } else { options };
                    regex_matches(&re.pattern, merged, candidates)?
                }
                _ => {
                    return Err(CommandError::bad_value("$regex has to be a string"));
                }
            },
            "$options" => true,
            "$mod" => mod_match(arg, candidates)?,
            "$all" => all_match(arg, candidates)?,
            "$elemMatch" => elem_match(arg, raw)?,
            "$size" => size_match(arg, raw)?,
            "$not" => !match arg {
                Bson::Document(inner) if is_operator_doc(inner) => {
                    apply_operators(inner, raw, candidates, found)?
                }
                Bson::RegularExpression(re) => {
                    regex_matches(&re.pattern, &re.options, candidates)?
                }
                _ => {
                    return Err(CommandError::bad_value(
                        "$not needs a regex or a document",
                    ))
                }
            },
            other => {
                return Err(CommandError::bad_value(format!(
                    "unknown operator: {}",
                    other
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn ordered_match<F>(target: &Bson, candidates: &[Bson], accept: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    candidates.iter().any(|c| {
        if !comparable(c, target) {
            return false;
        }
        accept(compare(Some(c), Some(target), SortStyle::Aggregate))
    })
}

/// Range operators only relate values of the same canonical class.
fn comparable(a: &Bson, b: &Bson) -> bool {
    if ordering::is_numeric(a) && ordering::is_numeric(b) {
        return true;
    }
    ordering::comparison_class(a) == ordering::comparison_class(b)
}

fn in_match(arg: &Bson, candidates: &[Bson], found: bool) -> Result<bool, CommandError> {
    let arr = match arg {
        Bson::Array(a) => a,
        _ => return Err(CommandError::bad_value("$in needs an array")),
    };
    for element in arr {
        let hit = match element {
            Bson::RegularExpression(re) => regex_matches(&re.pattern, &re.options, candidates)?,
            other => equality(other, candidates, found),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn mod_match(arg: &Bson, candidates: &[Bson]) -> Result<bool, CommandError> {
    let arr = match arg {
        Bson::Array(a) => a,
        _ => {
            return Err(CommandError::bad_value(
                "malformed mod, needs to be an array",
            ))
        }
    };
    if arr.len() != 2 {
        return Err(CommandError::bad_value(
            "malformed mod, not enough elements",
        ));
    }
    let divisor = numeric_value(&arr[0])
        .ok_or_else(|| CommandError::bad_value("malformed mod, divisor not a number"))?
        as i64;
    let remainder = numeric_value(&arr[1])
        .ok_or_else(|| CommandError::bad_value("malformed mod, remainder not a number"))?
        as i64;
    if divisor == 0 {
        return Err(CommandError::bad_value("divisor cannot be 0"));
    }
    Ok(candidates.iter().any(|c| {
        numeric_value(c)
            .filter(|n| n.is_finite())
            .map(|n| (n as i64) % divisor == remainder)
            .unwrap_or(false)
    }))
}

fn all_match(arg: &Bson, candidates: &[Bson]) -> Result<bool, CommandError> {
    let arr = match arg {
        Bson::Array(a) => a,
        _ => return Err(CommandError::bad_value("$all needs an array")),
    };
    if arr.is_empty() {
        return Ok(false);
    }
    for element in arr {
        let hit = match element {
            Bson::RegularExpression(re) => regex_matches(&re.pattern, &re.options, candidates)?,
            other => candidates.iter().any(|c| values_equal(c, other)),
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn elem_match(arg: &Bson, raw: &[Bson]) -> Result<bool, CommandError> {
    let spec = match arg {
        Bson::Document(d) => d,
        _ => return Err(CommandError::bad_value("$elemMatch needs an Object")),
    };
    for value in raw {
        let Bson::Array(arr) = value else { continue };
        for element in arr {
            let hit = if is_operator_doc(spec) {
                let single = vec![element.clone()];
                apply_operators(spec, &single, &single, true)?
            } else {
                match element {
                    Bson::Document(sub) => matches(sub, spec)?,
                    _ => false,
                }
            };
            if hit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn size_match(arg: &Bson, raw: &[Bson]) -> Result<bool, CommandError> {
    let n = match numeric_value(arg) {
        Some(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
        _ => {
            return Err(CommandError::bad_value(
                "Failed to parse $size. Expected a non-negative number",
            ))
        }
    };
    Ok(raw
        .iter()
        .any(|v| matches!(v, Bson::Array(a) if a.len() == n)))
}

fn regex_matches(pattern: &str, options: &str, candidates: &[Bson]) -> Result<bool, CommandError> {
    let re = compile_regex(pattern, options)?;
    Ok(candidates.iter().any(|c| match c {
        Bson::String(s) => re.is_match(s),
        Bson::RegularExpression(stored) => stored.pattern == pattern,
        _ => false,
    }))
}

pub fn compile_regex(pattern: &str, options: &str) -> Result<CompiledRegex, CommandError> {
    let mut flags = String::new();
    for opt in options.chars() {
        match opt {
            'i' => flags.push('i'),
            'm' => flags.push('m'),
            's' => flags.push('s'),
            'x' => flags.push('x'),
            // PCRE's 'u' has no counterpart here; patterns are Unicode anyway.
            'u' => {}
            other => {
                return Err(CommandError::bad_value(format!(
                    "invalid flag in regex options: {}",
                    other
                )))
            }
        }
    }
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    CompiledRegex::new(&full)
        .map_err(|e| CommandError::bad_value(format!("invalid regex: {}", e)))
}

pub fn is_truthy(v: &Bson) -> bool {
    match v {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        _ if ordering::is_numeric(v) => numeric_value(v).map(|n| n != 0.0).unwrap_or(false),
        _ => true,
    }
}

/// A filter fragment every backend can translate to native predicates:
/// top-level, undotted field paths compared for equality against scalars.
#[derive(Debug, Clone, Default)]
pub struct PushdownFilter {
    pub equalities: Vec<(String, Bson)>,
}

/// Returns the pushdown form of `filter` when the whole filter can be handed
/// to the backend, or `None` when any part needs in-memory evaluation.
pub fn analyze_pushdown(filter: &Document) -> Option<PushdownFilter> {
    let mut out = PushdownFilter::default();
    for (key, value) in filter {
        if key.starts_with('$') || key.contains('.') {
            return None;
        }
        if !pushable_scalar(value) {
            return None;
        }
        out.equalities.push((key.clone(), value.clone()));
    }
    Some(out)
}

fn pushable_scalar(v: &Bson) -> bool {
    matches!(
        v,
        Bson::String(_)
            | Bson::Int32(_)
            | Bson::Int64(_)
            | Bson::Boolean(_)
            | Bson::ObjectId(_)
    ) || matches!(v, Bson::Double(d) if d.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn implicit_equality_and_operators() {
        let d = doc! {"a": 5, "b": "x"};
        assert!(matches(&d, &doc! {"a": 5}).unwrap());
        assert!(matches(&d, &doc! {"a": {"$gt": 4, "$lt": 6}}).unwrap());
        assert!(!matches(&d, &doc! {"a": {"$gte": 6}}).unwrap());
        assert!(matches(&d, &doc! {"b": {"$in": ["x", "y"]}}).unwrap());
    }

    #[test]
    fn top_level_not_negates_a_filter() {
        let d = doc! {"a": 5};
        assert!(matches(&d, &doc! {"$not": {"a": {"$gt": 10}}}).unwrap());
        assert!(!matches(&d, &doc! {"$not": {"a": 5}}).unwrap());
        assert!(matches(&d, &doc! {"$not": {"$and": [{"a": 1}]}}).unwrap());
        assert!(matches(&d, &doc! {"$not": {"$not": {"a": 5}}}).unwrap());

        let err = matches(&d, &doc! {"$not": 1}).unwrap_err();
        assert_eq!(err.code, 2);
    }

    #[test]
    fn null_matches_missing() {
        let d = doc! {"a": 1};
        assert!(matches(&d, &doc! {"b": Bson::Null}).unwrap());
        assert!(!matches(&d, &doc! {"a": Bson::Null}).unwrap());
    }

    #[test]
    fn array_member_matching() {
        let d = doc! {"tags": ["red", "green"]};
        assert!(matches(&d, &doc! {"tags": "red"}).unwrap());
        assert!(matches(&d, &doc! {"tags": {"$size": 2}}).unwrap());
        assert!(matches(&d, &doc! {"tags": {"$all": ["red", "green"]}}).unwrap());
    }

    #[test]
    fn pushdown_only_for_scalar_equalities() {
        assert!(analyze_pushdown(&doc! {"a": 1, "b": "x"}).is_some());
        assert!(analyze_pushdown(&doc! {"a": {"$gt": 1}}).is_none());
        assert!(analyze_pushdown(&doc! {"a.b": 1}).is_none());
        assert!(analyze_pushdown(&doc! {"$or": [{"a": 1}]}).is_none());
    }
}
