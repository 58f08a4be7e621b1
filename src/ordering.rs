/*!
 * @file ordering.rs
 * @brief Canonical BSON comparison, dotted-path access and group keys
 */

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::CommandError;

/// Which comparator a sort runs under.
///
/// The reference server orders an empty array below null in `find` sorts but
/// above null in the aggregation `$sort` stage. The inconsistency is part of
/// the observable behavior and both comparators are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStyle {
    Find,
    Aggregate,
}

const RANK_MISSING: u8 = 2;
const RANK_MIN_KEY: u8 = 0;
const RANK_UNDEFINED: u8 = 3;
const RANK_EMPTY_ARRAY_FIND: u8 = 4;
const RANK_NULL: u8 = 5;
const RANK_NUMBER: u8 = 10;
const RANK_STRING: u8 = 15;
const RANK_OBJECT: u8 = 20;
const RANK_ARRAY: u8 = 25;
const RANK_BINARY: u8 = 30;
const RANK_OBJECT_ID: u8 = 35;
const RANK_BOOL: u8 = 40;
const RANK_DATE: u8 = 45;
const RANK_TIMESTAMP: u8 = 50;
const RANK_REGEX: u8 = 55;
const RANK_CODE: u8 = 60;
const RANK_CODE_W_SCOPE: u8 = 65;
const RANK_MAX_KEY: u8 = 127;

fn type_rank(v: &Bson, style: SortStyle) -> u8 {
    match v {
        Bson::MinKey => RANK_MIN_KEY,
        Bson::Undefined => RANK_UNDEFINED,
        Bson::Null => RANK_NULL,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => RANK_NUMBER,
        Bson::String(_) | Bson::Symbol(_) => RANK_STRING,
        Bson::Document(_) => RANK_OBJECT,
        Bson::Array(a) => {
            if a.is_empty() && style == SortStyle::Find {
                RANK_EMPTY_ARRAY_FIND
            } else {
                RANK_ARRAY
            }
        }
        Bson::Binary(_) => RANK_BINARY,
        Bson::ObjectId(_) | Bson::DbPointer(_) => RANK_OBJECT_ID,
        Bson::Boolean(_) => RANK_BOOL,
        Bson::DateTime(_) => RANK_DATE,
        Bson::Timestamp(_) => RANK_TIMESTAMP,
        Bson::RegularExpression(_) => RANK_REGEX,
        Bson::JavaScriptCode(_) => RANK_CODE,
        Bson::JavaScriptCodeWithScope(_) => RANK_CODE_W_SCOPE,
        Bson::MaxKey => RANK_MAX_KEY,
    }
}

/// Numeric value of a BSON number, if the value is one.
pub fn numeric_value(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn is_numeric(v: &Bson) -> bool {
    matches!(
        v,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)
    )
}

fn compare_numbers(a: f64, b: f64) -> Ordering {
    // NaN sorts below every other number; two NaNs tie so the order is total.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Total order over possibly-missing BSON values.
///
/// `None` is "missing" and sorts below null in both styles.
pub fn compare(a: Option<&Bson>, b: Option<&Bson>, style: SortStyle) -> Ordering {
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(v)) => {
            return if type_rank(v, style) <= RANK_MISSING {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(v), None) => {
            return if type_rank(v, style) <= RANK_MISSING {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(a), Some(b)) => (a, b),
    };

    let (ra, rb) = (type_rank(a, style), type_rank(b, style));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Bson::MinKey, Bson::MinKey)
        | (Bson::MaxKey, Bson::MaxKey)
        | (Bson::Null, Bson::Null)
        | (Bson::Undefined, Bson::Undefined) => Ordering::Equal,
        _ if is_numeric(a) && is_numeric(b) => {
            let (x, y) = (
                numeric_value(a).unwrap_or(f64::NAN),
                numeric_value(b).unwrap_or(f64::NAN),
            );
            compare_numbers(x, y)
        }
        (Bson::String(x), Bson::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::String(x), Bson::Symbol(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Symbol(x), Bson::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Bson::Document(x), Bson::Document(y)) => compare_documents(x, y, style),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare(Some(ex), Some(ey), style);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            x.time.cmp(&y.time).then_with(|| x.increment.cmp(&y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .cmp(&y.pattern)
            .then_with(|| x.options.cmp(&y.options)),
        (Bson::JavaScriptCode(x), Bson::JavaScriptCode(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn compare_documents(a: &Document, b: &Document, style: SortStyle) -> Ordering {
    let mut ai = a.iter();
    let mut bi = b.iter();
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare(Some(va), Some(vb), style);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Equality under the canonical order; int 1, long 1 and double 1.0 are equal.
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare(Some(a), Some(b), SortStyle::Aggregate) == Ordering::Equal
}

/// Direct dotted-path descent with numeric components indexing into arrays.
/// No implicit array traversal; that is the matcher's business.
pub fn get_path(doc: &Document, path: &str) -> Option<Bson> {
    let mut current = None;
    for (i, seg) in path.split('.').enumerate() {
        let container = if i == 0 {
            doc.get(seg).cloned()
        } else {
            match current {
                Some(Bson::Document(ref d)) => d.get(seg).cloned(),
                Some(Bson::Array(ref a)) => {
                    seg.parse::<usize>().ok().and_then(|idx| a.get(idx).cloned())
                }
                _ => None,
            }
        };
        current = container;
        current.as_ref()?;
    }
    current
}

/// Values reachable at `path`, descending through documents and — at
/// intermediate levels — through array elements. Terminal arrays are returned
/// whole; flattening for scalar matching happens in the filter engine.
/// The bool reports whether the path resolved to anything at all.
pub fn raw_path_values(doc: &Document, path: &str) -> (Vec<Bson>, bool) {
    let segs: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    let root = Bson::Document(doc.clone());
    descend(&root, &segs, &mut out);
    let found = !out.is_empty();
    (out, found)
}

fn descend(v: &Bson, segs: &[&str], out: &mut Vec<Bson>) {
    if segs.is_empty() {
        out.push(v.clone());
        return;
    }
    let seg = segs[0];
    match v {
        Bson::Document(d) => {
            if let Some(next) = d.get(seg) {
                descend(next, &segs[1..], out);
            }
        }
        Bson::Array(a) => {
            if let Ok(idx) = seg.parse::<usize>() {
                if let Some(next) = a.get(idx) {
                    descend(next, &segs[1..], out);
                }
            }
            for element in a {
                if matches!(element, Bson::Document(_)) {
                    descend(element, segs, out);
                }
            }
        }
        _ => {}
    }
}

/// Sets `path` to `value`, creating intermediate documents. Fails when an
/// existing intermediate value is neither a document nor an array.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), CommandError> {
    let segs: Vec<&str> = path.split('.').collect();
    set_in_document(doc, &segs, value, path)
}

fn set_in_document(
    doc: &mut Document,
    segs: &[&str],
    value: Bson,
    full: &str,
) -> Result<(), CommandError> {
    let seg = segs[0];
    if segs.len() == 1 {
        doc.insert(seg, value);
        return Ok(());
    }
    if !doc.contains_key(seg) {
        doc.insert(seg, Document::new());
    }
    match doc.get_mut(seg).unwrap() {
        Bson::Document(sub) => set_in_document(sub, &segs[1..], value, full),
        Bson::Array(arr) => set_in_array(arr, &segs[1..], value, full),
        other => Err(CommandError::location(
            28,
            format!(
                "Cannot create field '{}' in element {{{}: {}}}",
                segs[1], seg, other
            ),
        )),
    }
}

fn set_in_array(
    arr: &mut Vec<Bson>,
    segs: &[&str],
    value: Bson,
    full: &str,
) -> Result<(), CommandError> {
    let seg = segs[0];
    let idx: usize = seg.parse().map_err(|_| {
        CommandError::location(
            28,
            format!("Cannot create field '{}' in element of array at '{}'", seg, full),
        )
    })?;
    while arr.len() <= idx {
        arr.push(Bson::Null);
    }
    if segs.len() == 1 {
        arr[idx] = value;
        return Ok(());
    }
    if matches!(arr[idx], Bson::Null) {
        arr[idx] = Bson::Document(Document::new());
    }
    match &mut arr[idx] {
        Bson::Document(sub) => set_in_document(sub, &segs[1..], value, full),
        Bson::Array(sub) => set_in_array(sub, &segs[1..], value, full),
        other => Err(CommandError::location(
            28,
            format!(
                "Cannot create field '{}' in element {{{}: {}}}",
                segs[1], seg, other
            ),
        )),
    }
}

/// Removes `path` if present. Missing intermediates are a no-op.
pub fn remove_path(doc: &mut Document, path: &str) {
    let segs: Vec<&str> = path.split('.').collect();
    remove_in_document(doc, &segs);
}

fn remove_in_document(doc: &mut Document, segs: &[&str]) {
    let seg = segs[0];
    if segs.len() == 1 {
        doc.remove(seg);
        return;
    }
    match doc.get_mut(seg) {
        Some(Bson::Document(sub)) => remove_in_document(sub, &segs[1..]),
        Some(Bson::Array(arr)) => {
            // Unsetting an array element nulls it out rather than shifting.
            if segs.len() == 2 {
                if let Ok(idx) = segs[1].parse::<usize>() {
                    if idx < arr.len() {
                        arr[idx] = Bson::Null;
                    }
                }
            } else {
                for element in arr.iter_mut() {
                    if let Bson::Document(sub) = element {
                        remove_in_document(sub, &segs[1..]);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Canonical key for `$group` hashing: equal-under-comparison values map to
/// the same key, so int 1 and double 1.0 land in the same bucket and the
/// bucket's `_id` keeps whichever value arrived first.
pub fn canonical_key(v: &Bson) -> String {
    match v {
        Bson::MinKey => "min".into(),
        Bson::MaxKey => "max".into(),
        Bson::Null | Bson::Undefined => "z".into(),
        _ if is_numeric(v) => {
            let n = numeric_value(v).unwrap_or(f64::NAN);
            if n.is_nan() {
                "n:nan".into()
            } else {
                format!("n:{}", n)
            }
        }
        Bson::String(s) | Bson::Symbol(s) => format!("s:{}", s),
        Bson::Boolean(b) => format!("b:{}", b),
        Bson::ObjectId(oid) => format!("o:{}", oid.to_hex()),
        Bson::DateTime(dt) => format!("d:{}", dt.timestamp_millis()),
        Bson::Timestamp(ts) => format!("t:{}:{}", ts.time, ts.increment),
        Bson::RegularExpression(re) => format!("r:{}:{}", re.pattern, re.options),
        Bson::Binary(bin) => format!("x:{}:{}", u8::from(bin.subtype), hex::encode(&bin.bytes)),
        Bson::Array(a) => {
            let inner: Vec<String> = a.iter().map(canonical_key).collect();
            format!("a:[{}]", inner.join(","))
        }
        Bson::Document(d) => {
            let inner: Vec<String> = d
                .iter()
                .map(|(k, val)| format!("{}={}", k, canonical_key(val)))
                .collect();
            format!("doc:{{{}}}", inner.join(","))
        }
        Bson::JavaScriptCode(c) => format!("j:{}", c),
        other => format!("?:{}", other),
    }
}

/// Canonical class tag used by range operators to decide comparability.
pub fn comparison_class(v: &Bson) -> u8 {
    type_rank(v, SortStyle::Aggregate)
}

/// The `$type` operator's name for a value.
pub fn type_name(v: &Bson) -> &'static str {
    match v {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

fn type_code(v: &Bson) -> i32 {
    match v {
        Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::Undefined => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Null => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::Symbol(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::Int32(_) => 16,
        Bson::Timestamp(_) => 17,
        Bson::Int64(_) => 18,
        Bson::Decimal128(_) => 19,
        Bson::MinKey => -1,
        Bson::MaxKey => 127,
    }
}

/// Does `v` satisfy a `$type` specification (alias string or numeric code)?
pub fn matches_type_spec(v: &Bson, spec: &Bson) -> Result<bool, CommandError> {
    match spec {
        Bson::String(alias) => match alias.as_str() {
            "number" => Ok(is_numeric(v)),
            alias => {
                if !KNOWN_TYPE_ALIASES.contains(&alias) {
                    return Err(CommandError::bad_value(format!(
                        "Unknown type name alias: {}",
                        alias
                    )));
                }
                Ok(type_name(v) == alias)
            }
        },
        other => match numeric_value(other) {
            Some(n) if n.fract() == 0.0 => Ok(type_code(v) == n as i32),
            _ => Err(CommandError::bad_value(
                "type must be represented as a number or a string",
            )),
        },
    }
}

const KNOWN_TYPE_ALIASES: &[&str] = &[
    "double",
    "string",
    "object",
    "array",
    "binData",
    "undefined",
    "objectId",
    "bool",
    "date",
    "null",
    "regex",
    "dbPointer",
    "javascript",
    "symbol",
    "javascriptWithScope",
    "int",
    "timestamp",
    "long",
    "decimal",
    "minKey",
    "maxKey",
];

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;

    #[test]
    fn numeric_cross_type_equality() {
        assert!(values_equal(&bson!(1), &bson!(1.0)));
        assert!(values_equal(&bson!(1i64), &bson!(1)));
        assert!(!values_equal(&bson!(1), &bson!(2)));
    }

    #[test]
    fn missing_sorts_below_null() {
        for style in [SortStyle::Find, SortStyle::Aggregate] {
            assert_eq!(compare(None, Some(&Bson::Null), style), Ordering::Less);
        }
    }

    #[test]
    fn empty_array_null_asymmetry() {
        let empty = bson!([]);
        assert_eq!(
            compare(Some(&empty), Some(&Bson::Null), SortStyle::Find),
            Ordering::Less
        );
        assert_eq!(
            compare(Some(&empty), Some(&Bson::Null), SortStyle::Aggregate),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_ties_with_itself() {
        let nan = bson!(f64::NAN);
        assert_eq!(
            compare(Some(&nan), Some(&nan), SortStyle::Find),
            Ordering::Equal
        );
        assert_eq!(
            compare(Some(&nan), Some(&bson!(0)), SortStyle::Find),
            Ordering::Less
        );
    }

    #[test]
    fn dotted_path_descent() {
        let doc = bson::doc! {"a": {"b": [10, 20, 30]}};
        assert_eq!(get_path(&doc, "a.b.1"), Some(bson!(20)));
        assert_eq!(get_path(&doc, "a.c"), None);
    }

    #[test]
    fn group_keys_collapse_numeric_types() {
        assert_eq!(canonical_key(&bson!(1)), canonical_key(&bson!(1.0)));
        assert_ne!(canonical_key(&bson!(1)), canonical_key(&bson!("1")));
    }
}
