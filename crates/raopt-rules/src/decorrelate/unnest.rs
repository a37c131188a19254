//! # General Unnesting of Scalar and ANY Subqueries
//!
//! Rewrites a `DependentInner` join `J(L, P)` whose right side `P` is a single-column
//! subquery into a plain join. The subquery's result becomes a relation `t` with the
//! scalar column `m<n>`, and the consuming comparison reads `t.m<n>`.
//!
//! ## Steps
//!
//! ```text
//! J(L, P)                                  J[L.x = t.x](L, P')
//!   P references L.x            ==>          P' = P AS t(m<n>, x) over
//!                                              DJ(D, ...)   D = DISTINCT L.x AS d
//! ```
//!
//! 1. The correlated attributes `x` (free in `P`, produced by `L`) are collected.
//! 2. A DISTINCT projection `D` of a copy of `L` restricted to them (alias `d`, or
//!    `d<n>` when the query already uses `d`) is
//!    joined, dependently, onto the subquery; inside `P` every outer reference
//!    becomes `d.x`, `P` also outputs `d.x`, and `J` joins on `L.x = t.x`.
//! 3. The inner dependent join is pushed down until nothing below it references
//!    `d`, then becomes a cross product. Selections, projections, ordering and
//!    HAVING are hoisted above it; grouping gains the `d` columns as keys.
//! 4. If the subquery's WHERE equates every `d.x` with an attribute bound inside
//!    the subquery, `D` is removed and `d.x` replaced by that attribute.
//!    Otherwise `L` is materialized as a CTE shared by `J` and `D`.
//!
//! An ANY subquery finishes as a semi join: its comparison moves from the WHERE
//! clause into the join predicate.

use super::materialize::{cte_reference, register_cte, requalify_node, requalify_outside};
use super::{output_column_names, replace_marker_at, set_join_kind, Outcome, SubqueryJoin};
use raopt_core::catalog::Catalog;
use raopt_core::error::{OptimizeError, Result};
use raopt_core::expr::{Attribute, CompareOp, Expr, JoinKind, NodeKind, Operator, SubqueryKind};
use raopt_core::pattern::{matches, Pattern};
use raopt_core::rule::OptContext;
use raopt_core::scope::{
    attribute_qualifier, attributes_in, bound_relations, correlated_attributes, free_attributes,
    relations_in_scope, same_attribute, Scope,
};
use raopt_core::tree::{NodeId, RaTree};
use tracing::{debug, trace};

const REWRITE: &str = "unnesting";

/// Alias of the D-projection.
pub const DELIM_ALIAS: &str = "d";
/// Alias of the scalar result relation.
pub const RESULT_ALIAS: &str = "t";

pub fn unnest(tree: &mut RaTree, site: &SubqueryJoin, ctx: &mut OptContext<'_>) -> Result<Outcome> {
    let catalog = ctx.catalog;
    match site.marker.kind {
        SubqueryKind::Scalar | SubqueryKind::Any => {}
        other => {
            return Err(OptimizeError::unsupported(
                REWRITE,
                format!("{other} subquery on an inner dependent join"),
            ))
        }
    }
    if !matches(tree, site.subquery, &Pattern::projection()) {
        return Err(OptimizeError::unsupported(REWRITE, "subquery root is not a projection"));
    }
    if let Operator::Projection { exprs, .. } = tree.op(site.subquery) {
        if exprs.len() != 1 {
            return Err(OptimizeError::unsupported(
                REWRITE,
                format!("scalar subquery with {} output columns", exprs.len()),
            ));
        }
        if exprs[0] == Expr::Wildcard {
            return Err(OptimizeError::unsupported(REWRITE, "scalar subquery selects *"));
        }
    }
    if site.marker.kind == SubqueryKind::Any {
        any_comparison_in_scope(tree, site, catalog)?;
    }

    let outer_scope = relations_in_scope(tree, site.outer)?;
    let correlated = correlated_attributes(tree, site.outer, site.subquery, catalog)?;

    let n = ctx.names.next_id()?;
    let result_alias = if outer_scope.covers(RESULT_ALIAS) {
        format!("{RESULT_ALIAS}{n}")
    } else {
        RESULT_ALIAS.to_string()
    };
    let delim = delim_alias(tree, site, &outer_scope, catalog, n)?;
    let scalar_column = format!("m{n}");
    let result_ref = Expr::attr(&result_alias, &scalar_column);

    replace_marker_at(tree, site.occurrence, site.marker.id, &result_ref)?;
    if let Operator::Join { kind, marker, .. } = tree.op_mut(site.join) {
        *kind = JoinKind::Inner;
        *marker = None;
    }
    if let Operator::Projection {
        alias,
        column_names,
        ..
    } = tree.op_mut(site.subquery)
    {
        *alias = Some(result_alias.clone());
        *column_names = vec![scalar_column.clone()];
    }

    let outcome = if correlated.is_empty() {
        debug!("Subquery {} is uncorrelated", site.subquery);
        Outcome::Uncorrelated
    } else {
        decorrelate(tree, site, &correlated, &outer_scope, &result_alias, &delim, ctx)?
    };

    if site.marker.kind == SubqueryKind::Any {
        move_any_comparison(tree, site, &result_ref)?;
        set_join_kind(tree, site.join, JoinKind::Semi);
    }
    Ok(outcome)
}

fn decorrelate(
    tree: &mut RaTree,
    site: &SubqueryJoin,
    correlated: &[Attribute],
    outer_scope: &Scope,
    result_alias: &str,
    delim_alias: &str,
    ctx: &mut OptContext<'_>,
) -> Result<Outcome> {
    let catalog = ctx.catalog;
    let columns = output_column_names(correlated, catalog);
    debug!(
        "Unnesting join {} over correlated attributes [{}]",
        site.join,
        columns.join(", ")
    );

    // Join back on the correlated attributes.
    if let Operator::Join { predicate, .. } = tree.op_mut(site.join) {
        for (attr, column) in correlated.iter().zip(&columns) {
            let eq = Expr::eq(Expr::Attribute(attr.clone()), Expr::attr(result_alias, column));
            *predicate = Some(Expr::conjoin(predicate.take(), eq));
        }
    }

    // Outer references inside the subquery now read from d.
    for node in tree.preorder(site.subquery) {
        for expr in tree.op_mut(node).expressions_mut() {
            expr.for_each_attribute_mut(&mut |attr| {
                if let Some(i) = correlated.iter().position(|c| same_attribute(c, attr, catalog)) {
                    *attr = Attribute::qualified(delim_alias, &columns[i]);
                }
            });
        }
    }
    if let Operator::Projection {
        exprs,
        column_names,
        ..
    } = tree.op_mut(site.subquery)
    {
        for column in &columns {
            exprs.push(Expr::attr(delim_alias, column));
            column_names.push(column.clone());
        }
    }

    let outer_copy = tree.deep_clone(site.outer)?;
    let delim = tree.add_node(
        Operator::Projection {
            exprs: correlated.iter().cloned().map(Expr::Attribute).collect(),
            alias: Some(delim_alias.to_string()),
            column_names: columns.clone(),
            distinct: true,
        },
        [outer_copy],
    )?;
    let subquery = tree.take_child(site.join, 1)?;
    let dependent = tree.add_node(
        Operator::Join {
            kind: JoinKind::DependentInner,
            predicate: None,
            alias: None,
            column_names: vec![],
            marker: None,
        },
        [delim, subquery],
    )?;
    tree.replace_child(site.join, 1, dependent)?;

    push_down(tree, dependent, site.subquery, delim_alias, &columns, catalog)?;

    if decouple(tree, site.subquery, delim, delim_alias, &columns, catalog)? {
        debug!("Join {} decoupled from its D-projection", site.join);
        return Ok(Outcome::Unnested {
            decoupled: true,
            materialized: false,
        });
    }

    materialize_outer(tree, site, delim, outer_scope, ctx)?;
    Ok(Outcome::Unnested {
        decoupled: false,
        materialized: true,
    })
}

/// The D-projection's alias: `d` unless the outer side or the subquery already
/// binds or reads that name, then `d<n>`.
fn delim_alias(
    tree: &RaTree,
    site: &SubqueryJoin,
    outer_scope: &Scope,
    catalog: &dyn Catalog,
    n: u32,
) -> Result<String> {
    let inner = bound_relations(tree, site.subquery);
    let read: Vec<String> = [site.outer, site.subquery]
        .into_iter()
        .flat_map(|id| attributes_in(tree, id))
        .filter_map(|a| attribute_qualifier(&a, catalog))
        .collect();
    let taken = |alias: &str| {
        outer_scope.covers(alias) || inner.covers(alias) || read.iter().any(|q| q == alias)
    };

    if !taken(DELIM_ALIAS) {
        return Ok(DELIM_ALIAS.to_string());
    }
    let fresh = format!("{DELIM_ALIAS}{n}");
    if taken(&fresh) {
        return Err(OptimizeError::unsupported(
            REWRITE,
            format!("aliases {DELIM_ALIAS} and {fresh} are both in use"),
        ));
    }
    trace!("Alias {} is taken, D-projection uses {}", DELIM_ALIAS, fresh);
    Ok(fresh)
}

/// Whether anything in the subtree at `id` reads the D-projection.
fn references_delim(tree: &RaTree, id: NodeId, delim_alias: &str, catalog: &dyn Catalog) -> bool {
    free_attributes(tree, id, catalog)
        .iter()
        .any(|a| a.alias.as_deref() == Some(delim_alias))
}

fn delim_refs(delim_alias: &str, columns: &[String]) -> Vec<Expr> {
    columns.iter().map(|c| Expr::attr(delim_alias, c)).collect()
}

/// Push the dependent join `dependent` (D on the left) down the subquery until its
/// right input no longer references `d`, then turn it into a cross product.
fn push_down(
    tree: &mut RaTree,
    dependent: NodeId,
    result: NodeId,
    delim_alias: &str,
    columns: &[String],
    catalog: &dyn Catalog,
) -> Result<()> {
    loop {
        let input = tree.child(dependent, 1)?;
        if !references_delim(tree, input, delim_alias, catalog) {
            trace!("Dependent join {} settles above {}", dependent, input);
            *tree.op_mut(dependent) = Operator::CrossProduct;
            return Ok(());
        }

        let grandchild = match tree.op(input).kind() {
            NodeKind::Join | NodeKind::CrossProduct => {
                if matches!(tree.op(input), Operator::Join { alias: Some(_), .. }) {
                    return Err(OptimizeError::unsupported(REWRITE, "correlated aliased join"));
                }
                binary_side(tree, input, delim_alias, catalog)?
            }
            _ => {
                forward_delim(tree, input, result, delim_alias, columns)?;
                0
            }
        };
        trace!("Hoisting {} above dependent join {}", input, dependent);
        tree.rotate_below_child(dependent, 1, grandchild)?;
    }
}

/// Prepare a single-child operator to be hoisted above the dependent join:
/// projections forward the `d` columns, grouping adds them as keys.
fn forward_delim(
    tree: &mut RaTree,
    input: NodeId,
    result: NodeId,
    delim_alias: &str,
    columns: &[String],
) -> Result<()> {
    match tree.op_mut(input) {
        Operator::Selection { .. } | Operator::OrderBy { .. } | Operator::Having { .. } => Ok(()),
        Operator::Projection { alias: Some(_), .. } if input != result => {
            Err(OptimizeError::unsupported(REWRITE, "correlated derived table"))
        }
        Operator::Projection {
            exprs,
            column_names,
            ..
        } => {
            for (d, column) in delim_refs(delim_alias, columns).into_iter().zip(columns) {
                if !exprs.contains(&d) {
                    exprs.push(d);
                    if !column_names.is_empty() {
                        column_names.push(column.clone());
                    }
                }
            }
            Ok(())
        }
        Operator::GroupBy { exprs, implicit } => {
            for d in delim_refs(delim_alias, columns) {
                if !exprs.contains(&d) {
                    exprs.push(d);
                }
            }
            *implicit = false;
            Ok(())
        }
        other => Err(OptimizeError::invariant(format!(
            "{} {} cannot reference the D-projection",
            other.kind_name(),
            input
        ))),
    }
}

/// Which input of the binary node `node` the dependent join must follow.
fn binary_side(tree: &RaTree, node: NodeId, delim_alias: &str, catalog: &dyn Catalog) -> Result<usize> {
    let (left_allowed, right_allowed, preferred) = match tree.op(node) {
        Operator::CrossProduct => (true, true, 0),
        Operator::Join { kind, .. } => match kind {
            JoinKind::Inner | JoinKind::Cross => (true, true, 0),
            JoinKind::Right => (false, true, 1),
            JoinKind::Left | JoinKind::Semi | JoinKind::Anti | JoinKind::In | JoinKind::AntiIn => {
                (true, false, 0)
            }
            dependent => {
                return Err(OptimizeError::unsupported(
                    REWRITE,
                    format!("nested {dependent} join remains in the subquery"),
                ))
            }
        },
        other => {
            return Err(OptimizeError::invariant(format!(
                "{} {} is not a binary operator",
                other.kind_name(),
                node
            )))
        }
    };
    let left = references_delim(tree, tree.child(node, 0)?, delim_alias, catalog);
    let right = references_delim(tree, tree.child(node, 1)?, delim_alias, catalog);
    let side = match (left, right) {
        (true, true) => {
            return Err(OptimizeError::unsupported(
                REWRITE,
                "both join inputs reference the outer query",
            ))
        }
        (true, false) => 0,
        (false, true) => 1,
        (false, false) => preferred,
    };
    let allowed = if side == 0 { left_allowed } else { right_allowed };
    if !allowed {
        return Err(OptimizeError::unsupported(
            REWRITE,
            "outer reference on the null-supplying side of an outer join",
        ));
    }
    Ok(side)
}

/// Try to eliminate the D-projection. Returns `false` when some `d` column has no
/// equality partner, leaving the tree unchanged.
fn decouple(
    tree: &mut RaTree,
    result: NodeId,
    delim: NodeId,
    delim_alias: &str,
    columns: &[String],
    catalog: &dyn Catalog,
) -> Result<bool> {
    let cross = tree
        .parent(delim)
        .ok_or_else(|| OptimizeError::invariant(format!("D-projection {delim} is detached")))?;
    let sibling = tree.child(cross, 1)?;

    // Operators between the subquery top and the cross product, top first.
    let mut path = Vec::new();
    let mut current = cross;
    while current != result {
        current = tree
            .parent(current)
            .ok_or_else(|| OptimizeError::invariant(format!("node {current} left the subquery")))?;
        path.push(current);
    }
    path.reverse();

    let Some(&selection) = path
        .iter()
        .find(|&&id| matches!(tree.op(id), Operator::Selection { .. }))
    else {
        return Ok(false);
    };

    let inner = bound_relations(tree, sibling);
    let conjuncts: Vec<Expr> = match tree.op(selection) {
        Operator::Selection {
            predicate: Some(p),
        } => p.conjuncts().into_iter().cloned().collect(),
        _ => Vec::new(),
    };
    let mut partners = Vec::with_capacity(columns.len());
    for column in columns {
        let d = Attribute::qualified(delim_alias, column);
        match equality_partner(&conjuncts, &d, &inner, catalog) {
            Some(partner) => partners.push(partner),
            None => {
                trace!("{}.{} has no equality partner in selection {}", delim_alias, column, selection);
                return Ok(false);
            }
        }
    }

    // Drop D and its cross product.
    let sibling = tree.take_child(cross, 1)?;
    tree.replace_node(cross, sibling)?;

    for &node in &path {
        for expr in tree.op_mut(node).expressions_mut() {
            expr.rewrite(&mut |e| {
                let Expr::Attribute(a) = e else {
                    return false;
                };
                if a.alias.as_deref() != Some(delim_alias) {
                    return false;
                }
                match columns.iter().position(|c| *c == a.name) {
                    Some(i) => {
                        *e = Expr::Attribute(partners[i].clone());
                        true
                    }
                    None => false,
                }
            });
        }
    }

    let remaining: Vec<Expr> = match tree.op(selection) {
        Operator::Selection {
            predicate: Some(p),
        } => p
            .conjuncts()
            .into_iter()
            .filter(|c| !c.is_attribute_tautology())
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    match Expr::conjunction(remaining) {
        Some(predicate) => {
            *tree.op_mut(selection) = Operator::Selection {
                predicate: Some(predicate),
            };
        }
        None => {
            tree.remove_single_child(selection)?;
        }
    }
    Ok(true)
}

/// An attribute bound in `inner` that a top-level conjunct equates with `d`.
fn equality_partner(
    conjuncts: &[Expr],
    d: &Attribute,
    inner: &Scope,
    catalog: &dyn Catalog,
) -> Option<Attribute> {
    conjuncts.iter().find_map(|c| {
        let Expr::Comparison {
            op: CompareOp::Eq,
            left,
            right,
        } = c
        else {
            return None;
        };
        let (Expr::Attribute(l), Expr::Attribute(r)) = (left.as_ref(), right.as_ref()) else {
            return None;
        };
        let other = if l == d {
            r
        } else if r == d {
            l
        } else {
            return None;
        };
        // Outer references were all renamed to d; an unplaceable name is inner.
        let bound_inside = match attribute_qualifier(other, catalog) {
            Some(q) => d.alias.as_ref() != Some(&q) && inner.covers(&q),
            None => true,
        };
        bound_inside.then(|| other.clone())
    })
}

/// Move the outer side into a CTE read by both `J` and the D-projection.
fn materialize_outer(
    tree: &mut RaTree,
    site: &SubqueryJoin,
    delim: NodeId,
    outer_scope: &Scope,
    ctx: &mut OptContext<'_>,
) -> Result<()> {
    let catalog = ctx.catalog;
    let outer = tree.take_child(site.join, 0)?;
    let name = register_cte(tree, &mut ctx.names, outer, vec![Expr::Wildcard], vec![], false)?;
    debug!("Join {} falls back to materializing its outer side as {}", site.join, name);

    let left = cte_reference(tree, &name);
    tree.replace_child(site.join, 0, left)?;
    let source = cte_reference(tree, &name);
    tree.replace_child(delim, 0, source)?;

    let subquery = tree.child(site.join, 1)?;
    requalify_outside(tree, site.join, subquery, outer_scope, &name, catalog);
    requalify_node(tree, delim, outer_scope, &Scope::default(), &name, catalog);
    Ok(())
}

/// Position of the top-level conjunct comparing against the ANY marker.
fn any_comparison_index(tree: &RaTree, site: &SubqueryJoin) -> Result<usize> {
    let not_top_level =
        || OptimizeError::unsupported(REWRITE, "ANY comparison is not a top-level WHERE conjunct");
    let Operator::Selection {
        predicate: Some(predicate),
    } = tree.op(site.occurrence)
    else {
        return Err(not_top_level());
    };
    predicate
        .conjuncts()
        .iter()
        .position(|c| match c {
            Expr::Comparison { left, right, .. } => {
                let is_marker = |e: &Expr| matches!(e, Expr::Marker(m) if m.id == site.marker.id);
                is_marker(left) || is_marker(right)
            }
            _ => false,
        })
        .ok_or_else(not_top_level)
}

/// The ANY comparison moves into the join predicate, so its other operand may only
/// read relations the join's outer input provides.
fn any_comparison_in_scope(tree: &RaTree, site: &SubqueryJoin, catalog: &dyn Catalog) -> Result<()> {
    let index = any_comparison_index(tree, site)?;
    let Operator::Selection {
        predicate: Some(predicate),
    } = tree.op(site.occurrence)
    else {
        return Ok(());
    };
    let outer = relations_in_scope(tree, site.outer)?;
    let conjuncts = predicate.conjuncts();
    let missing = conjuncts[index]
        .attributes()
        .into_iter()
        .filter_map(|a| attribute_qualifier(a, catalog))
        .find(|q| !outer.covers(q));
    match missing {
        Some(qualifier) => Err(OptimizeError::unsupported(
            REWRITE,
            format!("ANY comparison reads {qualifier}, which is not an input of the join"),
        )),
        None => Ok(()),
    }
}

fn move_any_comparison(tree: &mut RaTree, site: &SubqueryJoin, result_ref: &Expr) -> Result<()> {
    let Operator::Selection {
        predicate: Some(predicate),
    } = tree.op(site.occurrence)
    else {
        return Err(OptimizeError::invariant(format!(
            "ANY comparison vanished from {}",
            site.occurrence
        )));
    };
    let Expr::Attribute(result_attr) = result_ref else {
        return Err(OptimizeError::invariant("ANY result is not an attribute"));
    };
    let (moved, kept): (Vec<Expr>, Vec<Expr>) = predicate
        .clone()
        .into_conjuncts()
        .into_iter()
        .partition(|c| c.attributes().iter().any(|a| a.name == result_attr.name && a.alias == result_attr.alias));
    let Some(comparison) = Expr::conjunction(moved) else {
        return Err(OptimizeError::invariant(format!(
            "ANY comparison vanished from {}",
            site.occurrence
        )));
    };

    match Expr::conjunction(kept) {
        Some(rest) => {
            *tree.op_mut(site.occurrence) = Operator::Selection {
                predicate: Some(rest),
            };
        }
        None => {
            tree.remove_single_child(site.occurrence)?;
        }
    }
    if let Operator::Join { predicate, .. } = tree.op_mut(site.join) {
        *predicate = Some(Expr::conjoin(predicate.take(), comparison));
    }
    Ok(())
}
