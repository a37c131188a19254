//! End-to-end decorrelation scenarios over the students/exams schema.

mod common;

use common::*;
use raopt_core::config::{OptimizerConfig, UnsupportedPolicy};
use raopt_core::expr::{CompareOp, Expr, JoinKind, Operator, SubqueryKind};
use raopt_core::tree::RaTree;
use raopt_rules::{Optimized, Optimizer};

fn optimize(tree: RaTree) -> Optimized {
    init_tracing();
    Optimizer::new(OptimizerConfig::default()).optimize(tree, 1).unwrap()
}

/// `SELECT s.name FROM students s WHERE s.grade = (SELECT max(e.grade) FROM exams e
///  WHERE <correlation>)`
fn scalar_query(correlation: Expr) -> RaTree {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, correlation, e);
    let agg = group_by(&mut tree, vec![], inner);
    let sub = project(&mut tree, vec![max(Expr::attr("e", "grade"))], agg);
    let join = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Scalar, 1, s, sub);
    let filter = select(
        &mut tree,
        Expr::eq(Expr::attr("s", "grade"), Expr::marker(SubqueryKind::Scalar, 1)),
        join,
    );
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);
    tree
}

/// `SELECT s.name FROM students s WHERE [NOT] EXISTS (SELECT * FROM exams e
///  WHERE <predicate>)`
fn exists_query(kind: SubqueryKind, predicate: Expr) -> RaTree {
    let join_kind = match kind {
        SubqueryKind::NotExists => JoinKind::DependentAnti,
        _ => JoinKind::DependentSemi,
    };
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, predicate, e);
    let sub = project(&mut tree, vec![Expr::Wildcard], inner);
    let join = dependent_join(&mut tree, join_kind, kind, 1, s, sub);
    let filter = select(&mut tree, Expr::marker(kind, 1), join);
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);
    tree
}

fn correlated_sid() -> Expr {
    Expr::eq(Expr::attr("e", "sid"), Expr::attr("s", "id"))
}

#[test]
fn test_scalar_subquery_is_decoupled() {
    let optimized = optimize(scalar_query(correlated_sid()));
    let tree = &optimized.tree;

    assert!(!has_dependent_join(tree));
    assert!(tree.ctes().is_empty());
    assert_eq!(optimized.name_counter, 2);
    assert_eq!(optimized.report.joins_unnested(), 1);
    let decorrelation = optimized.report.pass("Decorrelation").unwrap();
    assert_eq!(decorrelation.joins_decoupled, 1);
    assert_eq!(
        tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Selection [s.grade = t.m1]\n\
         \x20     Join Inner [s.id = t.id]\n\
         \x20       Relation students AS s\n\
         \x20       Projection [max(e.grade), e.sid] AS t(m1, id)\n\
         \x20         GroupBy [e.sid]\n\
         \x20           Relation exams AS e\n"
    );
}

#[test]
fn test_scalar_subquery_without_equality_materializes_outer_side() {
    let correlation = Expr::compare(CompareOp::Gt, Expr::attr("e", "year"), Expr::attr("s", "year"));
    let optimized = optimize(scalar_query(correlation));
    let tree = &optimized.tree;

    assert!(!has_dependent_join(tree));
    assert_eq!(optimized.name_counter, 3);
    assert_eq!(optimized.report.ctes_materialized(), 1);
    assert_eq!(
        tree.display(),
        "Root\n\
         \x20 Projection [cte_2.name]\n\
         \x20   Selection [cte_2.grade = t.m1]\n\
         \x20     Join Inner [cte_2.year = t.year]\n\
         \x20       Relation cte_2\n\
         \x20       Projection [max(e.grade), d.year] AS t(m1, year)\n\
         \x20         GroupBy [d.year]\n\
         \x20           Selection [e.year > d.year]\n\
         \x20             CrossProduct\n\
         \x20               Projection DISTINCT [cte_2.year] AS d(year)\n\
         \x20                 Relation cte_2\n\
         \x20               Relation exams AS e\n\
         CTE cte_2:\n\
         \x20 Projection [*] AS cte_2\n\
         \x20   Relation students AS s\n"
    );
}

#[test]
fn test_uncorrelated_scalar_subquery() {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let agg = group_by(&mut tree, vec![], e);
    let sub = project(&mut tree, vec![Expr::function("avg", vec![Expr::attr("e", "grade")])], agg);
    let join = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Scalar, 1, s, sub);
    let filter = select(
        &mut tree,
        Expr::compare(CompareOp::Gt, Expr::attr("s", "grade"), Expr::marker(SubqueryKind::Scalar, 1)),
        join,
    );
    finish(&mut tree, filter);

    let optimized = optimize(tree);
    let decorrelation = optimized.report.pass("Decorrelation").unwrap();
    assert_eq!(decorrelation.uncorrelated, 1);
    assert_eq!(decorrelation.joins_unnested, 0);
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Selection [s.grade > t.m1]\n\
         \x20   Join Inner\n\
         \x20     Relation students AS s\n\
         \x20     Projection [avg(e.grade)] AS t(m1)\n\
         \x20       GroupBy [] implicit\n\
         \x20         Relation exams AS e\n"
    );
}

#[test]
fn test_second_result_relation_gets_numbered_alias() {
    // Two uncorrelated scalar subqueries in one WHERE clause.
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e1 = relation(&mut tree, "exams", Some("e1"));
    let agg1 = group_by(&mut tree, vec![], e1);
    let sub1 = project(&mut tree, vec![max(Expr::attr("e1", "grade"))], agg1);
    let j1 = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Scalar, 1, s, sub1);
    let e2 = relation(&mut tree, "exams", Some("e2"));
    let agg2 = group_by(&mut tree, vec![], e2);
    let sub2 = project(&mut tree, vec![max(Expr::attr("e2", "year"))], agg2);
    let j2 = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Scalar, 2, j1, sub2);
    let filter = select(
        &mut tree,
        Expr::conjunction(vec![
            Expr::compare(CompareOp::Lt, Expr::attr("s", "grade"), Expr::marker(SubqueryKind::Scalar, 1)),
            Expr::compare(CompareOp::Lt, Expr::attr("s", "year"), Expr::marker(SubqueryKind::Scalar, 2)),
        ])
        .unwrap(),
        j2,
    );
    finish(&mut tree, filter);

    let optimized = optimize(tree);
    let display = optimized.tree.display();
    assert!(!has_dependent_join(&optimized.tree));
    assert!(display.contains("Projection [max(e1.grade)] AS t(m1)"), "{display}");
    assert!(display.contains("Projection [max(e2.year)] AS t2(m2)"), "{display}");
    assert!(display.contains("s.grade < t.m1"), "{display}");
    assert!(display.contains("s.year < t2.m2"), "{display}");
    assert_eq!(optimized.name_counter, 3);
}

#[test]
fn test_any_subquery_becomes_semi_join() {
    // SELECT s.name FROM students s WHERE s.grade = ANY (SELECT e.grade FROM exams e
    //   WHERE e.sid = s.id)
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, correlated_sid(), e);
    let sub = project(&mut tree, vec![Expr::attr("e", "grade")], inner);
    let join = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Any, 1, s, sub);
    let filter = select(
        &mut tree,
        Expr::eq(Expr::attr("s", "grade"), Expr::marker(SubqueryKind::Any, 1)),
        join,
    );
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);

    let optimized = optimize(tree);
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Join Semi [s.id = t.id AND s.grade = t.m1]\n\
         \x20     Relation students AS s\n\
         \x20     Projection [e.grade, e.sid] AS t(m1, id)\n\
         \x20       Relation exams AS e\n"
    );
}

#[test]
fn test_trivial_exists_becomes_in() {
    let predicate = Expr::conjunction(vec![
        correlated_sid(),
        Expr::compare(CompareOp::Gt, Expr::attr("e", "grade"), Expr::int(2)),
    ])
    .unwrap();
    let optimized = optimize(exists_query(SubqueryKind::Exists, predicate));

    assert_eq!(optimized.report.pass("Decorrelation").unwrap().exists_to_in, 1);
    assert_eq!(optimized.name_counter, 1);
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Selection [<in subquery #1>]\n\
         \x20     Join In [s.id = e.sid] <in subquery #1>\n\
         \x20       Relation students AS s\n\
         \x20       Projection [e.sid]\n\
         \x20         Selection [e.grade > 2]\n\
         \x20           Relation exams AS e\n"
    );
}

#[test]
fn test_trivial_not_exists_drops_empty_selection() {
    let optimized = optimize(exists_query(SubqueryKind::NotExists, correlated_sid()));
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Selection [<not in subquery #1>]\n\
         \x20     Join AntiIn [s.id = e.sid] <not in subquery #1>\n\
         \x20       Relation students AS s\n\
         \x20       Projection [e.sid]\n\
         \x20         Relation exams AS e\n"
    );
}

#[test]
fn test_complex_exists_materializes_matches() {
    let predicate = Expr::conjunction(vec![
        correlated_sid(),
        Expr::compare(CompareOp::Gt, Expr::attr("e", "year"), Expr::attr("s", "year")),
    ])
    .unwrap();
    let optimized = optimize(exists_query(SubqueryKind::Exists, predicate));
    let tree = &optimized.tree;

    assert_eq!(tree.ctes().len(), 1);
    assert!(!has_marker(tree));
    assert!(!has_dependent_join(tree));
    assert_eq!(optimized.name_counter, 2);
    assert_eq!(
        tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Selection [cte_1.id IS NOT NULL]\n\
         \x20     Join Left [s.id = cte_1.id AND s.year = cte_1.year]\n\
         \x20       Relation students AS s\n\
         \x20       Relation cte_1\n\
         CTE cte_1:\n\
         \x20 Projection DISTINCT [s.id, s.year] AS cte_1(id, year)\n\
         \x20   Selection [e.sid = s.id AND e.year > s.year]\n\
         \x20     CrossProduct\n\
         \x20       Relation exams AS e\n\
         \x20       Relation students AS s\n"
    );
}

#[test]
fn test_complex_not_exists_tests_for_null() {
    let predicate = Expr::compare(CompareOp::Lt, Expr::attr("s", "year"), Expr::attr("e", "year"));
    let optimized = optimize(exists_query(SubqueryKind::NotExists, predicate));
    let tree = &optimized.tree;

    assert_eq!(tree.ctes().len(), 1);
    let top = tree.top().unwrap();
    let filter = tree.children(top)[0];
    assert_eq!(tree.op(filter).to_string(), "Selection [cte_1.year IS NULL]");
}

#[test]
fn test_uncorrelated_exists_becomes_semi_join() {
    let predicate = Expr::compare(CompareOp::Gt, Expr::attr("e", "grade"), Expr::int(5));
    let optimized = optimize(exists_query(SubqueryKind::Exists, predicate));
    let tree = &optimized.tree;

    assert_eq!(optimized.report.pass("Decorrelation").unwrap().uncorrelated, 1);
    let join = tree
        .preorder(tree.root())
        .into_iter()
        .find(|&id| matches!(tree.op(id), Operator::Join { .. }))
        .unwrap();
    assert_eq!(tree.op(join).to_string(), "Join Semi <exists subquery #1>");
}

#[test]
fn test_in_subquery_is_folded_into_exists() {
    // SELECT s.name FROM students s WHERE s.id IN (SELECT e.sid FROM exams e
    //   WHERE e.year = s.year)
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, Expr::eq(Expr::attr("e", "year"), Expr::attr("s", "year")), e);
    let sub = project(&mut tree, vec![Expr::attr("e", "sid")], inner);
    let join = dependent_join(&mut tree, JoinKind::DependentIn, SubqueryKind::In, 1, s, sub);
    if let Operator::Join { predicate, .. } = tree.op_mut(join) {
        *predicate = Some(Expr::eq(Expr::attr("s", "id"), Expr::attr("e", "sid")));
    }
    let filter = select(&mut tree, Expr::marker(SubqueryKind::In, 1), join);
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);

    let optimized = optimize(tree);
    let tree = &optimized.tree;
    assert_eq!(tree.ctes().len(), 1);
    assert!(!has_marker(tree));
    assert_eq!(tree.op(filter).to_string(), "Selection [cte_1.year IS NOT NULL]");
    assert_eq!(
        tree.op(join).to_string(),
        "Join Left [s.year = cte_1.year AND s.id = cte_1.id]"
    );
}

fn not_in_query() -> RaTree {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, Expr::eq(Expr::attr("e", "year"), Expr::attr("s", "year")), e);
    let sub = project(&mut tree, vec![Expr::attr("e", "sid")], inner);
    let join = dependent_join(&mut tree, JoinKind::DependentAntiIn, SubqueryKind::NotIn, 1, s, sub);
    if let Operator::Join { predicate, .. } = tree.op_mut(join) {
        *predicate = Some(Expr::eq(Expr::attr("s", "id"), Expr::attr("e", "sid")));
    }
    let filter = select(&mut tree, Expr::marker(SubqueryKind::NotIn, 1), join);
    finish(&mut tree, filter);
    tree
}

#[test]
fn test_unsupported_rewrite_rejects_by_default() {
    let err = Optimizer::new(OptimizerConfig::default())
        .optimize(not_in_query(), 1)
        .unwrap_err();
    assert!(err.is_unsupported());
    assert!(err.to_string().contains("NOT IN"));
}

#[test]
fn test_unsupported_rewrite_is_skipped_and_rolled_back() {
    init_tracing();
    let input = not_in_query();
    let before = input.display();
    let config = OptimizerConfig {
        on_unsupported: UnsupportedPolicy::Skip,
        ..OptimizerConfig::default()
    };
    let optimized = Optimizer::new(config).optimize(input, 1).unwrap();

    assert_eq!(optimized.report.skipped(), 1);
    assert_eq!(optimized.name_counter, 1);
    assert!(has_dependent_join(&optimized.tree));
    assert_eq!(optimized.tree.display(), before);
}

#[test]
fn test_skip_keeps_other_rewrites() {
    // An unsupported NOT IN next to a supported EXISTS.
    let mut tree = not_in_query();
    let filter = tree.top().unwrap();
    let not_in = tree.children(filter)[0];
    let e = relation(&mut tree, "exams", Some("x"));
    let inner = select(&mut tree, Expr::eq(Expr::attr("x", "sid"), Expr::attr("s", "id")), e);
    let sub = project(&mut tree, vec![Expr::Wildcard], inner);
    let outer = tree.take_child(filter, 0).unwrap();
    assert_eq!(outer, not_in);
    let exists = dependent_join(&mut tree, JoinKind::DependentSemi, SubqueryKind::Exists, 2, outer, sub);
    tree.replace_child(filter, 0, exists).unwrap();
    *tree.op_mut(filter) = Operator::Selection {
        predicate: Expr::conjunction(vec![
            Expr::marker(SubqueryKind::NotIn, 1),
            Expr::marker(SubqueryKind::Exists, 2),
        ]),
    };

    let config = OptimizerConfig {
        on_unsupported: UnsupportedPolicy::Skip,
        ..OptimizerConfig::default()
    };
    let optimized = Optimizer::new(config).optimize(tree, 1).unwrap();
    let decorrelation = optimized.report.pass("Decorrelation").unwrap();
    assert_eq!(decorrelation.skipped.len(), 1);
    assert_eq!(decorrelation.skipped[0].node, not_in);
    assert_eq!(decorrelation.exists_to_in, 1);
    assert_eq!(
        optimized.tree.op(exists).to_string(),
        "Join In [s.id = x.sid] <in subquery #2>"
    );
}

#[test]
fn test_aggregating_exists_is_unsupported() {
    // EXISTS (SELECT count(*) FROM exams e WHERE e.sid = s.id GROUP BY e.year)
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, correlated_sid(), e);
    let agg = group_by(&mut tree, vec![Expr::attr("e", "year")], inner);
    let sub = project(&mut tree, vec![Expr::function("count", vec![Expr::Wildcard])], agg);
    let join = dependent_join(&mut tree, JoinKind::DependentSemi, SubqueryKind::Exists, 1, s, sub);
    let filter = select(&mut tree, Expr::marker(SubqueryKind::Exists, 1), join);
    finish(&mut tree, filter);

    let err = Optimizer::new(OptimizerConfig::default()).optimize(tree, 1).unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn test_missing_marker_is_an_invariant_violation() {
    let mut tree = exists_query(SubqueryKind::Exists, correlated_sid());
    let top = tree.top().unwrap();
    let filter = tree.children(top)[0];
    *tree.op_mut(filter) = Operator::Selection {
        predicate: Some(Expr::eq(Expr::attr("s", "year"), Expr::int(1))),
    };
    let err = Optimizer::new(OptimizerConfig::default()).optimize(tree, 1).unwrap_err();
    assert!(!err.is_unsupported());
}

/// `SELECT s.name FROM students s WHERE s.grade = (SELECT max(d.grade) FROM exams d
///  WHERE <correlation>)`
fn scalar_query_over_d(correlation: Expr) -> RaTree {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let d = relation(&mut tree, "exams", Some("d"));
    let inner = select(&mut tree, correlation, d);
    let agg = group_by(&mut tree, vec![], inner);
    let sub = project(&mut tree, vec![max(Expr::attr("d", "grade"))], agg);
    let join = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Scalar, 1, s, sub);
    let filter = select(
        &mut tree,
        Expr::eq(Expr::attr("s", "grade"), Expr::marker(SubqueryKind::Scalar, 1)),
        join,
    );
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);
    tree
}

#[test]
fn test_subquery_alias_d_is_decoupled() {
    init_tracing();
    let config = OptimizerConfig {
        on_unsupported: UnsupportedPolicy::Skip,
        ..OptimizerConfig::default()
    };
    let correlation = Expr::eq(Expr::attr("d", "sid"), Expr::attr("s", "id"));
    let optimized = Optimizer::new(config).optimize(scalar_query_over_d(correlation), 1).unwrap();

    assert_eq!(optimized.report.skipped(), 0);
    assert_eq!(optimized.report.joins_unnested(), 1);
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Projection [s.name]\n\
         \x20   Selection [s.grade = t.m1]\n\
         \x20     Join Inner [s.id = t.id]\n\
         \x20       Relation students AS s\n\
         \x20       Projection [max(d.grade), d.sid] AS t(m1, id)\n\
         \x20         GroupBy [d.sid]\n\
         \x20           Relation exams AS d\n"
    );
}

#[test]
fn test_subquery_alias_d_gets_numbered_d_projection() {
    let correlation = Expr::compare(CompareOp::Gt, Expr::attr("d", "year"), Expr::attr("s", "year"));
    let optimized = optimize(scalar_query_over_d(correlation));

    assert!(!has_dependent_join(&optimized.tree));
    assert_eq!(optimized.report.ctes_materialized(), 1);
    assert_eq!(
        optimized.tree.display(),
        "Root\n\
         \x20 Projection [cte_2.name]\n\
         \x20   Selection [cte_2.grade = t.m1]\n\
         \x20     Join Inner [cte_2.year = t.year]\n\
         \x20       Relation cte_2\n\
         \x20       Projection [max(d.grade), d1.year] AS t(m1, year)\n\
         \x20         GroupBy [d1.year]\n\
         \x20           Selection [d.year > d1.year]\n\
         \x20             CrossProduct\n\
         \x20               Projection DISTINCT [cte_2.year] AS d1(year)\n\
         \x20                 Relation cte_2\n\
         \x20               Relation exams AS d\n\
         CTE cte_2:\n\
         \x20 Projection [*] AS cte_2\n\
         \x20   Relation students AS s\n"
    );
}

#[test]
fn test_dangling_marker_is_rejected_without_other_checks() {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let filter = select(&mut tree, Expr::marker(SubqueryKind::Exists, 4), s);
    finish(&mut tree, filter);

    let config = OptimizerConfig {
        predicate_pushdown: false,
        verify_output: false,
        ..OptimizerConfig::default()
    };
    let err = Optimizer::new(config).optimize(tree, 1).unwrap_err();
    assert!(!err.is_unsupported());
    assert!(err.to_string().contains("has no join"));
}

#[test]
fn test_any_comparison_outside_join_inputs_is_unsupported() {
    // SELECT s.name FROM students s, exams x WHERE x.grade = ANY (SELECT e.grade
    //   FROM exams e WHERE e.sid = s.id), with only s on the dependent join's left
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let inner = select(&mut tree, correlated_sid(), e);
    let sub = project(&mut tree, vec![Expr::attr("e", "grade")], inner);
    let join = dependent_join(&mut tree, JoinKind::DependentInner, SubqueryKind::Any, 1, s, sub);
    let x = relation(&mut tree, "exams", Some("x"));
    let from = cross(&mut tree, join, x);
    let filter = select(
        &mut tree,
        Expr::eq(Expr::attr("x", "grade"), Expr::marker(SubqueryKind::Any, 1)),
        from,
    );
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);

    let err = Optimizer::new(OptimizerConfig::default()).optimize(tree, 1).unwrap_err();
    assert!(err.is_unsupported());
    assert!(err.to_string().contains("not an input of the join"));
}

#[test]
fn test_exhausted_name_counter_aborts() {
    let config = OptimizerConfig {
        on_unsupported: UnsupportedPolicy::Skip,
        ..OptimizerConfig::default()
    };
    let err = Optimizer::new(config)
        .optimize(scalar_query(correlated_sid()), u32::MAX)
        .unwrap_err();
    assert!(!err.is_unsupported());
    assert!(err.to_string().contains("exhausted"));
}
