//! Tree builders shared by the scenario tests.

#![allow(dead_code)]

use raopt_core::expr::{Expr, JoinKind, Operator, SubqueryKind, SubqueryMarker};
use raopt_core::tree::{NodeId, RaTree};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("raopt=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn relation(tree: &mut RaTree, name: &str, alias: Option<&str>) -> NodeId {
    tree.add(Operator::Relation {
        name: name.into(),
        alias: alias.map(str::to_string),
    })
}

pub fn select(tree: &mut RaTree, predicate: Expr, input: NodeId) -> NodeId {
    tree.add_node(
        Operator::Selection {
            predicate: Some(predicate),
        },
        [input],
    )
    .unwrap()
}

pub fn project(tree: &mut RaTree, exprs: Vec<Expr>, input: NodeId) -> NodeId {
    tree.add_node(
        Operator::Projection {
            exprs,
            alias: None,
            column_names: vec![],
            distinct: false,
        },
        [input],
    )
    .unwrap()
}

pub fn cross(tree: &mut RaTree, left: NodeId, right: NodeId) -> NodeId {
    tree.add_node(Operator::CrossProduct, [left, right]).unwrap()
}

pub fn group_by(tree: &mut RaTree, exprs: Vec<Expr>, input: NodeId) -> NodeId {
    let implicit = exprs.is_empty();
    tree.add_node(Operator::GroupBy { exprs, implicit }, [input]).unwrap()
}

/// A dependent join as the front end emits it for a subquery with marker `id`.
pub fn dependent_join(
    tree: &mut RaTree,
    kind: JoinKind,
    marker: SubqueryKind,
    id: u32,
    outer: NodeId,
    subquery: NodeId,
) -> NodeId {
    tree.add_node(
        Operator::Join {
            kind,
            predicate: None,
            alias: None,
            column_names: vec![],
            marker: Some(SubqueryMarker::new(marker, id)),
        },
        [outer, subquery],
    )
    .unwrap()
}

pub fn finish(tree: &mut RaTree, top: NodeId) {
    tree.set_top(top).unwrap();
}

pub fn max(arg: Expr) -> Expr {
    Expr::function("max", vec![arg])
}

/// Whether any reachable operator (main tree or CTE bodies) is a dependent join.
pub fn has_dependent_join(tree: &RaTree) -> bool {
    tree.roots()
        .into_iter()
        .flat_map(|root| tree.preorder(root))
        .any(|id| tree.op(id).is_dependent_join())
}

/// Whether any reachable operator still embeds a subquery marker.
pub fn has_marker(tree: &RaTree) -> bool {
    tree.roots()
        .into_iter()
        .flat_map(|root| tree.preorder(root))
        .any(|id| tree.op(id).expressions().iter().any(|e| !e.markers().is_empty()))
}

/// `SELECT s.name FROM students s, exams e WHERE s.id = e.sid AND e.grade > 2
///  AND s.year = 2`
pub fn students_exams() -> RaTree {
    let mut tree = RaTree::new();
    let s = relation(&mut tree, "students", Some("s"));
    let e = relation(&mut tree, "exams", Some("e"));
    let from = cross(&mut tree, s, e);
    let filter = select(
        &mut tree,
        Expr::conjunction(vec![
            Expr::eq(Expr::attr("s", "id"), Expr::attr("e", "sid")),
            Expr::compare(
                raopt_core::expr::CompareOp::Gt,
                Expr::attr("e", "grade"),
                Expr::int(2),
            ),
            Expr::eq(Expr::attr("s", "year"), Expr::int(2)),
        ])
        .unwrap(),
        from,
    );
    let top = project(&mut tree, vec![Expr::attr("s", "name")], filter);
    finish(&mut tree, top);
    tree
}
