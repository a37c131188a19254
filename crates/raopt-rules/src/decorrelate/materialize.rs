//! CTE materialization shared by the unnesting fallback and the complex EXISTS
//! rewrite.

use raopt_core::catalog::Catalog;
use raopt_core::error::Result;
use raopt_core::expr::{Expr, Operator};
use raopt_core::rule::NameGenerator;
use raopt_core::scope::{attribute_qualifier, bound_relations, Scope};
use raopt_core::tree::{NodeId, RaTree};
use tracing::debug;

/// Wrap `input` in a projection named `cte_<n>` and register it as a CTE.
/// Returns the CTE name.
pub fn register_cte(
    tree: &mut RaTree,
    names: &mut NameGenerator,
    input: NodeId,
    exprs: Vec<Expr>,
    column_names: Vec<String>,
    distinct: bool,
) -> Result<String> {
    let name = names.cte_name()?;
    let body = tree.add_node(
        Operator::Projection {
            exprs,
            alias: Some(name.clone()),
            column_names,
            distinct,
        },
        [input],
    )?;
    tree.add_cte(name.clone(), body)?;
    debug!("Registered CTE {} with body {}", name, body);
    Ok(name)
}

/// A fresh reference to a CTE.
pub fn cte_reference(tree: &mut RaTree, name: &str) -> NodeId {
    tree.add(Operator::Relation {
        name: name.to_string(),
        alias: None,
    })
}

/// Requalify every attribute resolving into `moved` with `new_qualifier`, in the
/// tree containing `anchor` but outside the subtree at `excluded`.
///
/// Nested subquery scopes only have their free attributes requalified; names they
/// bind themselves keep pointing at their own relations.
pub fn requalify_outside(
    tree: &mut RaTree,
    anchor: NodeId,
    excluded: NodeId,
    moved: &Scope,
    new_qualifier: &str,
    catalog: &dyn Catalog,
) {
    let top = tree.top_of(anchor);
    requalify_block(tree, top, excluded, moved, new_qualifier, catalog);
}

fn requalify_block(
    tree: &mut RaTree,
    node: NodeId,
    excluded: NodeId,
    moved: &Scope,
    new_qualifier: &str,
    catalog: &dyn Catalog,
) {
    if node == excluded {
        return;
    }
    requalify_node(tree, node, moved, &Scope::default(), new_qualifier, catalog);
    let children = tree.children(node).to_vec();
    for (index, child) in children.into_iter().enumerate() {
        if opens_nested_scope(tree, node, index, child) {
            requalify_free(tree, child, excluded, moved, new_qualifier, catalog);
        } else {
            requalify_block(tree, child, excluded, moved, new_qualifier, catalog);
        }
    }
}

fn requalify_free(
    tree: &mut RaTree,
    block: NodeId,
    excluded: NodeId,
    moved: &Scope,
    new_qualifier: &str,
    catalog: &dyn Catalog,
) {
    let bound = bound_relations(tree, block);
    for node in tree.preorder(block) {
        if tree.is_ancestor_or_self(excluded, node) {
            continue;
        }
        requalify_node(tree, node, moved, &bound, new_qualifier, catalog);
    }
}

/// Requalify attributes of one operator that resolve into `moved` but not into
/// `shadowed`.
pub fn requalify_node(
    tree: &mut RaTree,
    node: NodeId,
    moved: &Scope,
    shadowed: &Scope,
    new_qualifier: &str,
    catalog: &dyn Catalog,
) {
    for expr in tree.op_mut(node).expressions_mut() {
        expr.for_each_attribute_mut(&mut |attr| {
            let Some(q) = attribute_qualifier(attr, catalog) else {
                return;
            };
            if moved.covers(&q) && !shadowed.covers(&q) {
                attr.alias = Some(new_qualifier.to_string());
            }
        });
    }
}

fn opens_nested_scope(tree: &RaTree, parent: NodeId, index: usize, child: NodeId) -> bool {
    let subquery_side = index == 1
        && matches!(tree.op(parent), Operator::Join { marker: Some(m), .. } if m.is_present());
    let derived = matches!(tree.op(child), Operator::Projection { alias: Some(_), .. });
    subquery_side || derived
}
