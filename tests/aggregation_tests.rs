/*!
 * Aggregation pipeline tests, run on in-memory document streams.
 */

use bson::{bson, doc, Bson, Document};
use doppeldb::aggregation::{build_stream, collect, parse_pipeline};
use doppeldb::backend::VecStream;
use doppeldb::error::CommandError;

fn run(pipeline: Vec<Bson>, input: Vec<Document>) -> Result<Vec<Document>, CommandError> {
    let stages = parse_pipeline(&pipeline)?;
    let stream = build_stream(Box::new(VecStream::new(input)), stages);
    futures::executor::block_on(collect(stream))
}

fn docs(n: i32) -> Vec<Document> {
    (0..n).map(|i| doc! {"_id": i, "v": 42}).collect()
}

#[test]
fn match_count_produces_single_document() {
    let out = run(
        vec![bson!({"$match": {"v": 42}}), bson!({"$count": "v"})],
        docs(110),
    )
    .unwrap();
    assert_eq!(out, vec![doc! {"v": 110}]);
}

#[test]
fn count_before_match_filters_the_count_document() {
    let out = run(
        vec![bson!({"$count": "v"}), bson!({"$match": {"v": 1}})],
        docs(110),
    )
    .unwrap();
    assert!(out.is_empty());
}

#[test]
fn count_of_empty_input_emits_nothing() {
    let out = run(vec![bson!({"$count": "n"})], vec![]).unwrap();
    assert!(out.is_empty());
}

#[test]
fn count_name_validation() {
    for (value, code) in [
        (bson!(1), 40156),
        (bson!(""), 40156),
        (bson!("$field"), 40158),
        (bson!("a.b"), 40160),
    ] {
        let err = run(vec![bson!({"$count": value})], vec![]).unwrap_err();
        assert_eq!(err.code, code);
    }
}

#[test]
fn projection_conflict_is_code_31254() {
    let err = run(vec![bson!({"$project": {"foo": 1, "bar": 0}})], docs(1)).unwrap_err();
    assert_eq!(err.code, 31254);
    assert_eq!(
        err.message,
        "Cannot do exclusion on field bar in inclusion projection"
    );
}

#[test]
fn sort_stage_validation_codes() {
    let err = run(vec![bson!({"$sort": "nope"})], vec![]).unwrap_err();
    assert_eq!(err.code, 15973);

    let err = run(vec![bson!({"$sort": {}})], vec![]).unwrap_err();
    assert_eq!(err.code, 15976);

    let err = run(vec![bson!({"$sort": {"a": 0}})], vec![]).unwrap_err();
    assert_eq!(err.code, 15974);

    let err = run(vec![bson!({"$sort": {"a": 2}})], vec![]).unwrap_err();
    assert_eq!(err.code, 15974);
}

#[test]
fn sort_is_stable_and_directional() {
    let input = vec![
        doc! {"_id": 1, "k": 2},
        doc! {"_id": 2, "k": 1},
        doc! {"_id": 3, "k": 2},
        doc! {"_id": 4, "k": 1},
    ];
    let out = run(vec![bson!({"$sort": {"k": 1}})], input.clone()).unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![2, 4, 1, 3]);

    let out = run(vec![bson!({"$sort": {"k": -1}})], input).unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![1, 3, 2, 4]);
}

#[test]
fn aggregate_sort_places_null_before_empty_array() {
    let input = vec![
        doc! {"_id": 1, "k": []},
        doc! {"_id": 2, "k": Bson::Null},
    ];
    let out = run(vec![bson!({"$sort": {"k": 1}})], input).unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![2, 1]);
}

#[test]
fn limit_and_skip_paginate() {
    let input: Vec<Document> = (0..10).map(|i| doc! {"_id": i}).collect();
    let out = run(
        vec![bson!({"$skip": 3}), bson!({"$limit": 4})],
        input,
    )
    .unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![3, 4, 5, 6]);
}

#[test]
fn limit_validation() {
    let err = run(vec![bson!({"$limit": "x"})], vec![]).unwrap_err();
    assert_eq!(err.code, 15957);
    let err = run(vec![bson!({"$limit": -1})], vec![]).unwrap_err();
    assert_eq!(err.code, 15958);
    let err = run(vec![bson!({"$limit": 1.5})], vec![]).unwrap_err();
    assert_eq!(err.code, 15958);
    let err = run(vec![bson!({"$skip": -2})], vec![]).unwrap_err();
    assert_eq!(err.code, 15956);
}

#[test]
fn group_accumulators() {
    let input = vec![
        doc! {"k": "a", "v": 1, "t": "x"},
        doc! {"k": "a", "v": 3, "t": "x"},
        doc! {"k": "b", "v": 10, "t": "y"},
    ];
    let out = run(
        vec![bson!({"$group": {
            "_id": "$k",
            "total": {"$sum": "$v"},
            "avg": {"$avg": "$v"},
            "min": {"$min": "$v"},
            "max": {"$max": "$v"},
            "first": {"$first": "$v"},
            "last": {"$last": "$v"},
            "all": {"$push": "$v"},
            "kinds": {"$addToSet": "$t"},
            "n": {"$count": {}},
        }})],
        input,
    )
    .unwrap();
    assert_eq!(out.len(), 2);

    let a = out.iter().find(|d| d.get_str("_id") == Ok("a")).unwrap();
    assert_eq!(a.get_i32("total").unwrap(), 4);
    assert_eq!(a.get_f64("avg").unwrap(), 2.0);
    assert_eq!(a.get_i32("min").unwrap(), 1);
    assert_eq!(a.get_i32("max").unwrap(), 3);
    assert_eq!(a.get_i32("first").unwrap(), 1);
    assert_eq!(a.get_i32("last").unwrap(), 3);
    assert_eq!(a.get_array("all").unwrap().len(), 2);
    assert_eq!(a.get_array("kinds").unwrap(), &vec![bson!("x")]);
    assert_eq!(a.get_i32("n").unwrap(), 2);
}

#[test]
fn group_null_id_aggregates_everything() {
    let out = run(
        vec![bson!({"$group": {"_id": Bson::Null, "count": {"$sum": 1}}})],
        docs(7),
    )
    .unwrap();
    assert_eq!(out, vec![doc! {"_id": Bson::Null, "count": 7}]);
}

#[test]
fn group_id_keeps_first_encountered_numeric_type() {
    let input = vec![doc! {"k": 1.0}, doc! {"k": 1}, doc! {"k": 1i64}];
    let out = run(
        vec![bson!({"$group": {"_id": "$k", "n": {"$sum": 1}}})],
        input,
    )
    .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].get("_id"), Some(&Bson::Double(1.0)));
    assert_eq!(out[0].get_i32("n").unwrap(), 3);
}

#[test]
fn group_error_codes() {
    let err = run(vec![bson!({"$group": {"x": {"$sum": 1}}})], vec![]).unwrap_err();
    assert_eq!(err.code, 15955);

    let err = run(
        vec![bson!({"$group": {"_id": Bson::Null, "x": {"$sum": []}}})],
        vec![],
    )
    .unwrap_err();
    assert_eq!(err.code, 40237);
    assert_eq!(err.message, "The $sum accumulator is a unary operator");

    let err = run(
        vec![bson!({"$group": {"_id": Bson::Null, "x": {"$frob": 1}}})],
        vec![],
    )
    .unwrap_err();
    assert_eq!(err.code, 15952);

    let err = run(
        vec![bson!({"$group": {"_id": Bson::Null, "x": 5}})],
        vec![],
    )
    .unwrap_err();
    assert_eq!(err.code, 40234);
}

#[test]
fn add_fields_and_set_and_unset() {
    let input = vec![doc! {"_id": 1, "a": 2, "nested": {"x": 1, "y": 2}}];
    let out = run(
        vec![
            bson!({"$addFields": {"double": {"$multiply": ["$a", 2]}}}),
            bson!({"$set": {"tag": "t"}}),
            bson!({"$unset": "nested.y"}),
        ],
        input,
    )
    .unwrap();
    assert_eq!(
        out,
        vec![doc! {"_id": 1, "a": 2, "nested": {"x": 1}, "double": 4, "tag": "t"}]
    );
}

#[test]
fn unset_collision_codes() {
    let err = run(vec![bson!({"$unset": ["v", "v.foo"]})], vec![]).unwrap_err();
    assert_eq!(err.code, 31249);

    let err = run(vec![bson!({"$unset": []})], vec![]).unwrap_err();
    assert_eq!(err.code, 31119);
}

#[test]
fn unwind_variants() {
    let input = vec![
        doc! {"_id": 1, "a": [10, 20]},
        doc! {"_id": 2, "a": []},
        doc! {"_id": 3, "a": Bson::Null},
        doc! {"_id": 4},
        doc! {"_id": 5, "a": "scalar"},
    ];

    let out = run(vec![bson!({"$unwind": "$a"})], input.clone()).unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![1, 1, 5]);

    let out = run(
        vec![bson!({"$unwind": {"path": "$a", "preserveNullAndEmptyArrays": true}})],
        input,
    )
    .unwrap();
    let ids: Vec<i32> = out.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![1, 1, 2, 3, 4, 5]);

    let err = run(vec![bson!({"$unwind": "a"})], vec![]).unwrap_err();
    assert_eq!(err.code, 28818);
}

#[test]
fn unwind_include_array_index() {
    let input = vec![doc! {"_id": 1, "a": ["x", "y"]}];
    let out = run(
        vec![bson!({"$unwind": {"path": "$a", "includeArrayIndex": "i"}})],
        input,
    )
    .unwrap();
    assert_eq!(out[0].get_i64("i").unwrap(), 0);
    assert_eq!(out[1].get_i64("i").unwrap(), 1);
}

#[test]
fn unknown_stage_and_malformed_stage_docs() {
    let err = run(vec![bson!({"$frobnicate": {}})], vec![]).unwrap_err();
    assert_eq!(err.code, 40324);
    assert_eq!(err.message, "Unrecognized pipeline stage name: '$frobnicate'");

    let err = run(vec![bson!({"$match": {}, "$limit": 1})], vec![]).unwrap_err();
    assert_eq!(err.code, 40323);

    let err = run(vec![bson!(5)], vec![]).unwrap_err();
    assert_eq!(err.code, 14);
}

#[test]
fn unknown_expression_operator_fails_the_build() {
    let err = run(
        vec![bson!({"$project": {"x": {"$frobnicate": 1}}})],
        docs(1),
    )
    .unwrap_err();
    assert_eq!(err.code, 168);
}

#[test]
fn project_type_and_literal_expressions() {
    let input = vec![doc! {"_id": 1, "a": "text", "n": 2i64}];
    let out = run(
        vec![bson!({"$project": {
            "ta": {"$type": "$a"},
            "tn": {"$type": "$n"},
            "tm": {"$type": "$missing"},
            "lit": {"$literal": "$a"},
            "sum": {"$sum": [1, 2, 3]},
        }})],
        input,
    )
    .unwrap();
    assert_eq!(
        out,
        vec![doc! {
            "_id": 1,
            "ta": "string",
            "tn": "long",
            "tm": "missing",
            "lit": "$a",
            "sum": 6,
        }]
    );
}

/// A pipeline result, re-sorted by _id, matches a hand-computed reference
/// over the same input.
#[test]
fn pipeline_matches_reference_as_multiset() {
    let input: Vec<Document> = (0..100)
        .map(|i| doc! {"_id": i, "group": i % 3, "v": i})
        .collect();

    let out = run(
        vec![
            bson!({"$match": {"v": {"$gte": 10}}}),
            bson!({"$group": {"_id": "$group", "sum": {"$sum": "$v"}}}),
            bson!({"$sort": {"_id": 1}}),
        ],
        input.clone(),
    )
    .unwrap();

    let mut expected = std::collections::BTreeMap::new();
    for d in &input {
        let v = d.get_i32("v").unwrap();
        if v >= 10 {
            *expected.entry(d.get_i32("group").unwrap()).or_insert(0i64) += v as i64;
        }
    }
    assert_eq!(out.len(), expected.len());
    for (doc, (group, sum)) in out.iter().zip(expected.iter()) {
        assert_eq!(doc.get_i32("_id").unwrap(), *group);
        assert_eq!(doc.get_i32("sum").unwrap() as i64, *sum);
    }
}
