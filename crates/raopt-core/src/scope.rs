//! # Scope Resolution and Tree Navigation
//!
//! Both rewrite passes reason about *which relations are visible* at a point of the
//! tree and *which attributes* a subtree references. This module answers those
//! questions over the arena.
//!
//! ## Relations in scope
//!
//! [`relations_in_scope`] walks down from a node and collects the FROM items visible
//! above it:
//!
//! - a `Relation` contributes itself (name plus optional alias);
//! - an aliased `Projection`, `Values` or `Join` contributes only its alias, since it
//!   hides everything below it;
//! - a join bound to a subquery marker contributes only its left side, because its
//!   right side is a nested scope; semi/anti/in joins never expose their right side;
//! - every other operator is transparent.
//!
//! ## Attribute qualifiers
//!
//! An attribute's qualifier is its alias, or the relation the [`Catalog`] infers for
//! an unaliased name. A scope entry *covers* a qualifier when either its alias or its
//! relation name equals it.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::expr::{Attribute, Operator};
use crate::tree::{NodeId, RaTree};
use serde::{Deserialize, Serialize};

/// Where a scope entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeSource {
    /// A base relation or CTE reference.
    Relation,
    /// An aliased subquery, VALUES list or join.
    Derived,
}

/// One visible FROM item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub relation: String,
    pub alias: Option<String>,
    pub source: ScopeSource,
}

impl ScopeEntry {
    pub fn relation(name: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            relation: name.into(),
            alias,
            source: ScopeSource::Relation,
        }
    }

    pub fn derived(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            relation: alias.clone(),
            alias: Some(alias),
            source: ScopeSource::Derived,
        }
    }

    pub fn covers(&self, qualifier: &str) -> bool {
        self.alias.as_deref() == Some(qualifier) || self.relation == qualifier
    }

    /// The name attributes of this entry are qualified with.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.relation)
    }
}

/// Ordered, duplicate-free set of scope entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    entries: Vec<ScopeEntry>,
}

impl Scope {
    pub fn insert(&mut self, entry: ScopeEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn covers(&self, qualifier: &str) -> bool {
        self.entries.iter().any(|e| e.covers(qualifier))
    }

    pub fn entry_for(&self, qualifier: &str) -> Option<&ScopeEntry> {
        self.entries.iter().find(|e| e.covers(qualifier))
    }
}

/// Collect the relations visible at `id`.
pub fn relations_in_scope(tree: &RaTree, id: NodeId) -> Result<Scope> {
    let mut scope = Scope::default();
    collect_scope(tree, id, &mut scope)?;
    Ok(scope)
}

fn collect_scope(tree: &RaTree, id: NodeId, out: &mut Scope) -> Result<()> {
    tree.ensure_complete(id)?;
    match tree.op(id) {
        Operator::Relation { name, alias } => out.insert(ScopeEntry::relation(name, alias.clone())),
        Operator::Projection {
            alias: Some(alias), ..
        }
        | Operator::Join {
            alias: Some(alias), ..
        }
        | Operator::Values { alias, .. } => out.insert(ScopeEntry::derived(alias)),
        Operator::Join { kind, marker, .. } => {
            collect_scope(tree, tree.child(id, 0)?, out)?;
            let bound_to_subquery = marker.map_or(false, |m| m.is_present());
            if kind.exposes_right() && !bound_to_subquery {
                collect_scope(tree, tree.child(id, 1)?, out)?;
            }
        }
        Operator::CrossProduct => {
            collect_scope(tree, tree.child(id, 0)?, out)?;
            collect_scope(tree, tree.child(id, 1)?, out)?;
        }
        Operator::Dummy => {}
        Operator::Root
        | Operator::Selection { .. }
        | Operator::Projection { .. }
        | Operator::GroupBy { .. }
        | Operator::OrderBy { .. }
        | Operator::Having { .. } => collect_scope(tree, tree.child(id, 0)?, out)?,
    }
    Ok(())
}

/// Every relation or alias introduced anywhere inside the subtree at `id`,
/// including nested subquery scopes.
pub fn bound_relations(tree: &RaTree, id: NodeId) -> Scope {
    let mut scope = Scope::default();
    for node in tree.preorder(id) {
        match tree.op(node) {
            Operator::Relation { name, alias } => {
                scope.insert(ScopeEntry::relation(name, alias.clone()))
            }
            Operator::Projection {
                alias: Some(alias), ..
            }
            | Operator::Join {
                alias: Some(alias), ..
            }
            | Operator::Values { alias, .. } => scope.insert(ScopeEntry::derived(alias)),
            _ => {}
        }
    }
    scope
}

/// The qualifier an attribute resolves to: its alias, else the catalog's relation.
pub fn attribute_qualifier(attr: &Attribute, catalog: &dyn Catalog) -> Option<String> {
    match &attr.alias {
        Some(alias) => Some(alias.clone()),
        None => catalog.relation_for_attribute(&attr.name),
    }
}

/// Whether two attributes denote the same column once qualifiers are resolved.
pub fn same_attribute(a: &Attribute, b: &Attribute, catalog: &dyn Catalog) -> bool {
    a.name == b.name && attribute_qualifier(a, catalog) == attribute_qualifier(b, catalog)
}

/// Attributes referenced by the operators of the subtree at `id`: selection, join
/// and HAVING predicates, projection outputs, grouping and ordering keys.
pub fn attributes_in(tree: &RaTree, id: NodeId) -> Vec<Attribute> {
    tree.preorder(id)
        .into_iter()
        .filter(|&node| !matches!(tree.op(node), Operator::Values { .. }))
        .flat_map(|node| {
            tree.op(node)
                .expressions()
                .into_iter()
                .flat_map(|e| e.attributes())
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Attributes of the subtree at `id` whose qualifier no relation inside it binds.
///
/// Unaliased attributes the catalog cannot place are treated as bound.
pub fn free_attributes(tree: &RaTree, id: NodeId, catalog: &dyn Catalog) -> Vec<Attribute> {
    let bound = bound_relations(tree, id);
    attributes_in(tree, id)
        .into_iter()
        .filter(|attr| match attribute_qualifier(attr, catalog) {
            Some(q) => !bound.covers(&q),
            None => false,
        })
        .collect()
}

/// Attributes free in `right` that `left` produces, deduplicated by resolved
/// qualifier and name, in first-reference order.
pub fn correlated_attributes(
    tree: &RaTree,
    left: NodeId,
    right: NodeId,
    catalog: &dyn Catalog,
) -> Result<Vec<Attribute>> {
    let outer = relations_in_scope(tree, left)?;
    let mut out: Vec<Attribute> = Vec::new();
    for attr in free_attributes(tree, right, catalog) {
        let covered = attribute_qualifier(&attr, catalog).map_or(false, |q| outer.covers(&q));
        if covered && !out.iter().any(|seen| same_attribute(seen, &attr, catalog)) {
            out.push(attr);
        }
    }
    Ok(out)
}

/// Find the join carrying the subquery marker `marker_id`.
pub fn resolve_marker_to_join(tree: &RaTree, marker_id: u32) -> Option<NodeId> {
    tree.roots()
        .into_iter()
        .flat_map(|root| tree.preorder(root))
        .find(|&node| {
            matches!(tree.op(node), Operator::Join { marker: Some(m), .. } if m.id == marker_id)
        })
}

/// Find the operator whose expressions embed the subquery marker `marker_id`.
pub fn find_marker_occurrence(tree: &RaTree, marker_id: u32) -> Option<NodeId> {
    tree.roots()
        .into_iter()
        .flat_map(|root| tree.preorder(root))
        .find(|&node| {
            tree.op(node)
                .expressions()
                .iter()
                .any(|e| e.contains_marker(marker_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PrefixCatalog;
    use crate::expr::{CompareOp, Expr, JoinKind, SubqueryKind, SubqueryMarker};

    fn relation(tree: &mut RaTree, name: &str, alias: Option<&str>) -> NodeId {
        tree.add(Operator::Relation {
            name: name.into(),
            alias: alias.map(str::to_string),
        })
    }

    fn projection(exprs: Vec<Expr>, alias: Option<&str>) -> Operator {
        Operator::Projection {
            exprs,
            alias: alias.map(str::to_string),
            column_names: vec![],
            distinct: false,
        }
    }

    /// students s JOIN[exists #1] (SELECT * FROM exams e WHERE e.sid = s.id)
    fn exists_tree() -> (RaTree, NodeId, NodeId) {
        let mut tree = RaTree::new();
        let s = relation(&mut tree, "students", Some("s"));
        let e = relation(&mut tree, "exams", Some("e"));
        let sel = tree
            .add_node(
                Operator::Selection {
                    predicate: Some(Expr::eq(Expr::attr("e", "sid"), Expr::attr("s", "id"))),
                },
                [e],
            )
            .unwrap();
        let sub = tree.add_node(projection(vec![Expr::Wildcard], None), [sel]).unwrap();
        let join = tree
            .add_node(
                Operator::Join {
                    kind: JoinKind::DependentSemi,
                    predicate: None,
                    alias: None,
                    column_names: vec![],
                    marker: Some(SubqueryMarker::new(SubqueryKind::Exists, 1)),
                },
                [s, sub],
            )
            .unwrap();
        let where_sel = tree
            .add_node(
                Operator::Selection {
                    predicate: Some(Expr::marker(SubqueryKind::Exists, 1)),
                },
                [join],
            )
            .unwrap();
        tree.set_top(where_sel).unwrap();
        (tree, join, sub)
    }

    #[test]
    fn test_marker_bound_join_exposes_left_only() {
        let (tree, join, _) = exists_tree();
        let scope = relations_in_scope(&tree, join).unwrap();
        assert_eq!(scope.entries(), &[ScopeEntry::relation("students", Some("s".into()))]);
    }

    #[test]
    fn test_aliased_projection_hides_inner_relations() {
        let mut tree = RaTree::new();
        let e = relation(&mut tree, "exams", Some("e"));
        let sub = tree
            .add_node(projection(vec![Expr::attr("e", "grade")], Some("t")), [e])
            .unwrap();
        let scope = relations_in_scope(&tree, sub).unwrap();
        assert!(scope.covers("t"));
        assert!(!scope.covers("e"));
        assert_eq!(scope.entries()[0].source, ScopeSource::Derived);
    }

    #[test]
    fn test_correlated_attributes() {
        let (tree, join, sub) = exists_tree();
        let left = tree.child(join, 0).unwrap();
        let corr = correlated_attributes(&tree, left, sub, &PrefixCatalog).unwrap();
        assert_eq!(corr, vec![Attribute::qualified("s", "id")]);
    }

    #[test]
    fn test_unaliased_attributes_resolve_by_prefix() {
        let mut tree = RaTree::new();
        let orders = relation(&mut tree, "orders", None);
        let lineitem = relation(&mut tree, "lineitem", None);
        let sel = tree
            .add_node(
                Operator::Selection {
                    predicate: Some(Expr::eq(Expr::column("l_orderkey"), Expr::column("o_orderkey"))),
                },
                [lineitem],
            )
            .unwrap();
        let free = free_attributes(&tree, sel, &PrefixCatalog);
        assert_eq!(free, vec![Attribute::bare("o_orderkey")]);

        let corr = correlated_attributes(&tree, orders, sel, &PrefixCatalog).unwrap();
        assert_eq!(corr, vec![Attribute::bare("o_orderkey")]);

        let qualifier = attribute_qualifier(&Attribute::bare("ps_availqty"), &PrefixCatalog);
        assert_eq!(qualifier.as_deref(), Some("partsupp"));
    }

    #[test]
    fn test_marker_navigation() {
        let (tree, join, _) = exists_tree();
        assert_eq!(resolve_marker_to_join(&tree, 1), Some(join));
        assert_eq!(resolve_marker_to_join(&tree, 2), None);
        let occurrence = find_marker_occurrence(&tree, 1).unwrap();
        assert_eq!(tree.children(occurrence), &[join]);
    }

    #[test]
    fn test_attributes_in_covers_grouping_and_having() {
        let mut tree = RaTree::new();
        let l = relation(&mut tree, "lineitem", None);
        let group = tree
            .add_node(
                Operator::GroupBy {
                    exprs: vec![Expr::column("l_orderkey")],
                    implicit: false,
                },
                [l],
            )
            .unwrap();
        let having = tree
            .add_node(
                Operator::Having {
                    predicate: Expr::compare(
                        CompareOp::Gt,
                        Expr::function("sum", vec![Expr::column("l_quantity")]),
                        Expr::int(300),
                    ),
                },
                [group],
            )
            .unwrap();
        let names: Vec<_> = attributes_in(&tree, having).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["l_quantity", "l_orderkey"]);
    }

    #[test]
    fn test_incomplete_node_is_invariant_violation() {
        let mut tree = RaTree::new();
        let s = relation(&mut tree, "students", Some("s"));
        let cross = tree.add_node(Operator::CrossProduct, [s]).unwrap();
        assert!(relations_in_scope(&tree, cross).is_err());
    }
}
