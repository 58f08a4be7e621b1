/*!
 * Filter engine tests: operators, canonical type order and dotted paths.
 */

use bson::{bson, doc, Bson};
use doppeldb::filter::matches;
use doppeldb::ordering::{compare, SortStyle};
use std::cmp::Ordering;

#[test]
fn comparison_operators_respect_type_classes() {
    let d = doc! {"n": 5, "s": "mango"};
    // Numbers relate to numbers.
    assert!(matches(&d, &doc! {"n": {"$gt": 4.5}}).unwrap());
    assert!(matches(&d, &doc! {"n": {"$lte": 5i64}}).unwrap());
    // A number never relates to a string through a range operator.
    assert!(!matches(&d, &doc! {"n": {"$gt": ""}}).unwrap());
    assert!(!matches(&d, &doc! {"s": {"$gt": 1}}).unwrap());
    // Strings compare byte-wise.
    assert!(matches(&d, &doc! {"s": {"$gt": "apple"}}).unwrap());
}

#[test]
fn logical_operators_compose() {
    let d = doc! {"a": 1, "b": 2};
    assert!(matches(&d, &doc! {"$and": [{"a": 1}, {"b": 2}]}).unwrap());
    assert!(matches(&d, &doc! {"$or": [{"a": 9}, {"b": 2}]}).unwrap());
    assert!(matches(&d, &doc! {"$nor": [{"a": 9}, {"b": 9}]}).unwrap());
    assert!(!matches(&d, &doc! {"$nor": [{"a": 1}]}).unwrap());

    let err = matches(&d, &doc! {"$and": []}).unwrap_err();
    assert_eq!(err.code, 2);
}

#[test]
fn where_is_rejected() {
    let err = matches(&doc! {}, &doc! {"$where": "this.a == 1"}).unwrap_err();
    assert_eq!(err.code, 2);
}

#[test]
fn exists_and_type() {
    let d = doc! {"a": 1, "b": Bson::Null, "c": [1, 2]};
    assert!(matches(&d, &doc! {"a": {"$exists": true}}).unwrap());
    assert!(matches(&d, &doc! {"missing": {"$exists": false}}).unwrap());
    assert!(matches(&d, &doc! {"b": {"$exists": true}}).unwrap());
    assert!(matches(&d, &doc! {"a": {"$type": "int"}}).unwrap());
    assert!(matches(&d, &doc! {"a": {"$type": "number"}}).unwrap());
    assert!(matches(&d, &doc! {"c": {"$type": "array"}}).unwrap());
    assert!(matches(&d, &doc! {"a": {"$type": 16}}).unwrap());

    let err = matches(&d, &doc! {"a": {"$type": "integer"}}).unwrap_err();
    assert_eq!(err.code, 2);
}

#[test]
fn regex_with_options() {
    let d = doc! {"name": "Mongo Proxy"};
    assert!(matches(&d, &doc! {"name": {"$regex": "^mongo", "$options": "i"}}).unwrap());
    assert!(!matches(&d, &doc! {"name": {"$regex": "^mongo"}}).unwrap());
    assert!(matches(
        &d,
        &doc! {"name": Bson::RegularExpression(bson::Regex {
            pattern: "Proxy$".to_string(),
            options: String::new(),
        })}
    )
    .unwrap());
}

#[test]
fn mod_all_elem_match_size() {
    let d = doc! {"n": 10, "tags": ["a", "b"], "items": [{"qty": 5}, {"qty": 20}]};
    assert!(matches(&d, &doc! {"n": {"$mod": [3, 1]}}).unwrap());
    assert!(!matches(&d, &doc! {"n": {"$mod": [3, 0]}}).unwrap());
    let err = matches(&d, &doc! {"n": {"$mod": [0, 1]}}).unwrap_err();
    assert_eq!(err.code, 2);

    assert!(matches(&d, &doc! {"tags": {"$all": ["a", "b"]}}).unwrap());
    assert!(!matches(&d, &doc! {"tags": {"$all": ["a", "z"]}}).unwrap());
    assert!(!matches(&d, &doc! {"tags": {"$all": []}}).unwrap());

    assert!(matches(&d, &doc! {"items": {"$elemMatch": {"qty": {"$gt": 10}}}}).unwrap());
    assert!(!matches(&d, &doc! {"items": {"$elemMatch": {"qty": {"$gt": 100}}}}).unwrap());

    assert!(matches(&d, &doc! {"tags": {"$size": 2}}).unwrap());
    assert!(!matches(&d, &doc! {"tags": {"$size": 3}}).unwrap());
}

#[test]
fn in_nin_with_regex_members() {
    let d = doc! {"s": "blue"};
    assert!(matches(&d, &doc! {"s": {"$in": ["red", "blue"]}}).unwrap());
    assert!(matches(
        &d,
        &doc! {"s": {"$in": [Bson::RegularExpression(bson::Regex {
            pattern: "^bl".to_string(),
            options: String::new(),
        })]}}
    )
    .unwrap());
    assert!(matches(&doc! {"other": 1}, &doc! {"s": {"$nin": ["red"]}}).unwrap());
}

#[test]
fn not_negates_operator_documents() {
    let d = doc! {"a": 5};
    assert!(matches(&d, &doc! {"a": {"$not": {"$gt": 10}}}).unwrap());
    assert!(!matches(&d, &doc! {"a": {"$not": {"$gt": 1}}}).unwrap());
    // $not matches missing fields too.
    assert!(matches(&doc! {}, &doc! {"a": {"$not": {"$gt": 1}}}).unwrap());
}

#[test]
fn top_level_not_negates_a_nested_filter() {
    let d = doc! {"a": 5, "b": "x"};
    assert!(matches(&d, &doc! {"$not": {"a": {"$gt": 10}}}).unwrap());
    assert!(!matches(&d, &doc! {"$not": {"a": 5, "b": "x"}}).unwrap());
    // Composes with the other logical operators.
    assert!(matches(&d, &doc! {"$not": {"$or": [{"a": 9}, {"b": "y"}]}}).unwrap());
    assert!(matches(&d, &doc! {"$and": [{"$not": {"a": 9}}, {"b": "x"}]}).unwrap());

    let err = matches(&d, &doc! {"$not": [{"a": 1}]}).unwrap_err();
    assert_eq!(err.code, 2);
}

#[test]
fn expr_evaluates_against_the_document() {
    let d = doc! {"spent": 120, "budget": 100};
    assert!(matches(&d, &doc! {"$expr": {"$gt": ["$spent", "$budget"]}}).unwrap());
    assert!(!matches(&d, &doc! {"$expr": {"$lt": ["$spent", "$budget"]}}).unwrap());
}

#[test]
fn dotted_paths_and_numeric_indices() {
    let d = doc! {"a": {"b": [{"c": 1}, {"c": 2}]}};
    assert!(matches(&d, &doc! {"a.b.0.c": 1}).unwrap());
    assert!(matches(&d, &doc! {"a.b.c": 2}).unwrap());
    assert!(!matches(&d, &doc! {"a.b.5.c": 1}).unwrap());
}

#[test]
fn nan_equality_matches_nan() {
    let d = doc! {"x": f64::NAN};
    assert!(matches(&d, &doc! {"x": {"$eq": f64::NAN}}).unwrap());
    assert!(!matches(&d, &doc! {"x": {"$eq": 0.0}}).unwrap());
}

#[test]
fn canonical_type_order_across_classes() {
    // Null < number < string < object < array < binData < objectId < bool
    // < date < timestamp < regex.
    let ordered: Vec<Bson> = vec![
        Bson::Null,
        bson!(1),
        bson!("a"),
        bson!({"k": 1}),
        bson!([1]),
        Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: vec![1],
        }),
        Bson::ObjectId(bson::oid::ObjectId::new()),
        bson!(true),
        Bson::DateTime(bson::DateTime::from_millis(0)),
        Bson::Timestamp(bson::Timestamp { time: 0, increment: 0 }),
        Bson::RegularExpression(bson::Regex {
            pattern: "a".to_string(),
            options: String::new(),
        }),
    ];
    for window in ordered.windows(2) {
        assert_eq!(
            compare(Some(&window[0]), Some(&window[1]), SortStyle::Aggregate),
            Ordering::Less,
            "{:?} should sort before {:?}",
            window[0],
            window[1]
        );
    }
    assert_eq!(
        compare(Some(&Bson::MinKey), Some(&Bson::Null), SortStyle::Aggregate),
        Ordering::Less
    );
    assert_eq!(
        compare(Some(&Bson::MaxKey), Some(&bson!("z")), SortStyle::Aggregate),
        Ordering::Greater
    );
}

#[test]
fn empty_array_vs_null_is_asymmetric_between_sort_styles() {
    let empty = bson!([]);
    // find's .sort(): empty array before null.
    assert_eq!(
        compare(Some(&empty), Some(&Bson::Null), SortStyle::Find),
        Ordering::Less
    );
    // aggregation's $sort: null before empty array.
    assert_eq!(
        compare(Some(&Bson::Null), Some(&empty), SortStyle::Aggregate),
        Ordering::Less
    );
}
