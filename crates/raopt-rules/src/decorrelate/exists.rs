//! # EXISTS / NOT EXISTS Decorrelation
//!
//! A correlated EXISTS only asks whether *some* inner row satisfies the WHERE clause
//! for the current outer row, so it does not need the general D-projection
//! machinery. The subquery's WHERE conjuncts are classified first:
//!
//! - *ordinary*: every attribute is bound inside the subquery;
//! - *correlating*: a comparison between an expression bound only inside and one
//!   bound only outside;
//! - anything else that mentions the outer query is unsupported.
//!
//! ## Trivial correlation
//!
//! A single correlating `=` or `<>` predicate turns the EXISTS into an IN:
//!
//! ```text
//! EXISTS (SELECT * FROM exams e WHERE e.sid = s.id AND e.grade > 2)
//!   ==>  s.id IN (SELECT e.sid FROM exams e WHERE e.grade > 2)
//! ```
//!
//! ## Complex correlation
//!
//! Otherwise the set of outer rows with a match is computed once, as a CTE that
//! joins the subquery's FROM with the outer base relations involved, and the outer
//! query left-joins against it:
//!
//! ```text
//! cte_n = SELECT DISTINCT s.id, s.year FROM exams e, students s
//!         WHERE e.sid = s.id AND e.year > s.year
//! ... LEFT JOIN cte_n ON s.id = cte_n.id AND s.year = cte_n.year
//!     WHERE cte_n.id IS NOT NULL
//! ```

use super::materialize::{cte_reference, register_cte};
use super::{
    direct_selection, output_column_names, replace_marker_at, set_join_kind, set_marker_kind,
    Outcome, SubqueryJoin,
};
use raopt_core::catalog::Catalog;
use raopt_core::error::{OptimizeError, Result};
use raopt_core::expr::{Attribute, CompareOp, Expr, JoinKind, Operator, SubqueryKind};
use raopt_core::pattern::{matches, Pattern};
use raopt_core::rule::OptContext;
use raopt_core::scope::{
    attribute_qualifier, bound_relations, correlated_attributes, relations_in_scope,
    same_attribute, Scope, ScopeEntry, ScopeSource,
};
use raopt_core::tree::{NodeId, RaTree};
use tracing::{debug, trace};

const REWRITE: &str = "exists rewrite";

/// A correlating predicate, oriented outer side first.
#[derive(Debug, Clone)]
struct Correlation {
    /// Position among the selection's conjuncts.
    index: usize,
    op: CompareOp,
    outer: Expr,
    inner: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Inner,
    Outer,
    Mixed,
    Constant,
}

/// Classifies attributes as bound inside the subquery or only outside it.
struct Resolver<'a> {
    inner: Scope,
    outer: Scope,
    catalog: &'a dyn Catalog,
}

impl Resolver<'_> {
    fn is_outer(&self, attr: &Attribute) -> bool {
        match attribute_qualifier(attr, self.catalog) {
            Some(q) => !self.inner.covers(&q) && self.outer.covers(&q),
            None => false,
        }
    }

    fn side(&self, expr: &Expr) -> Side {
        let attrs = expr.attributes();
        let outer = attrs.iter().filter(|a| self.is_outer(a)).count();
        let inner = attrs.len() - outer;
        match (inner, outer) {
            (0, 0) => Side::Constant,
            (_, 0) => Side::Inner,
            (0, _) => Side::Outer,
            _ => Side::Mixed,
        }
    }

    fn mentions_outer(&self, expr: &Expr) -> bool {
        expr.attributes().iter().any(|a| self.is_outer(a))
    }
}

/// Fold the probe comparison of a `DependentIn` join into its subquery's WHERE
/// clause, leaving an equivalent `DependentSemi` join with an EXISTS marker.
pub fn fold_in_probe(tree: &mut RaTree, site: &SubqueryJoin) -> Result<()> {
    let (op, probe) = match tree.op(site.join) {
        Operator::Join {
            predicate: Some(Expr::Comparison { op, left, .. }),
            ..
        } => (*op, left.as_ref().clone()),
        _ => {
            return Err(OptimizeError::invariant(format!(
                "IN join {} has no probe comparison",
                site.join
            )))
        }
    };
    if !matches(tree, site.subquery, &Pattern::projection()) {
        return Err(OptimizeError::unsupported(REWRITE, "subquery root is not a projection"));
    }
    let output = match tree.op(site.subquery) {
        Operator::Projection { exprs, .. } if exprs.len() == 1 && exprs[0] != Expr::Wildcard => {
            exprs[0].clone()
        }
        _ => {
            return Err(OptimizeError::unsupported(
                REWRITE,
                "IN subquery must produce exactly one column",
            ))
        }
    };

    let comparison = Expr::compare(op, probe, output);
    match direct_selection(tree, site.subquery, REWRITE)? {
        Some(selection) => {
            if let Operator::Selection { predicate } = tree.op_mut(selection) {
                *predicate = Some(Expr::conjoin(predicate.take(), comparison));
            }
        }
        None => {
            let below = tree.child(site.subquery, 0)?;
            tree.splice_above(
                below,
                Operator::Selection {
                    predicate: Some(comparison),
                },
            )?;
        }
    }

    if let Operator::Join { kind, predicate, .. } = tree.op_mut(site.join) {
        *kind = JoinKind::DependentSemi;
        *predicate = None;
    }
    set_marker_kind(tree, site, SubqueryKind::Exists);
    trace!("Folded IN probe of join {} into its subquery", site.join);
    Ok(())
}

pub fn rewrite_exists(tree: &mut RaTree, site: &SubqueryJoin, ctx: &mut OptContext<'_>) -> Result<Outcome> {
    let catalog = ctx.catalog;
    let kind = match tree.op(site.join) {
        Operator::Join { kind, .. } => *kind,
        _ => return Err(OptimizeError::invariant(format!("{} is not a join", site.join))),
    };
    let negated = match (kind, site.marker.kind) {
        (JoinKind::DependentSemi, SubqueryKind::Exists) => false,
        (JoinKind::DependentAnti, SubqueryKind::NotExists) => true,
        (kind, marker) => {
            return Err(OptimizeError::invariant(format!(
                "{kind} join {} carries a {marker} marker",
                site.join
            )))
        }
    };
    if !matches(tree, site.subquery, &Pattern::projection()) {
        return Err(OptimizeError::unsupported(REWRITE, "subquery root is not a projection"));
    }

    let resolver = Resolver {
        inner: bound_relations(tree, site.subquery),
        outer: relations_in_scope(tree, site.outer)?,
        catalog,
    };

    let Some(selection) = direct_selection(tree, site.subquery, REWRITE)? else {
        if correlated_attributes(tree, site.outer, site.subquery, catalog)?.is_empty() {
            return Ok(uncorrelated(tree, site, negated));
        }
        return Err(OptimizeError::invariant(format!(
            "correlated EXISTS subquery {} has no selection",
            site.subquery
        )));
    };

    // Outer references are only understood inside the WHERE clause.
    for node in tree.preorder(site.subquery) {
        if node == selection {
            continue;
        }
        if tree.op(node).expressions().iter().any(|e| resolver.mentions_outer(e)) {
            return Err(OptimizeError::unsupported(
                REWRITE,
                "outer reference outside the subquery's WHERE clause",
            ));
        }
    }

    let conjuncts: Vec<Expr> = match tree.op(selection) {
        Operator::Selection {
            predicate: Some(p),
        } => p.conjuncts().into_iter().cloned().collect(),
        _ => {
            return Err(OptimizeError::invariant(format!(
                "selection {selection} has no predicate"
            )))
        }
    };
    let correlations = classify(&conjuncts, &resolver)?;

    match correlations.as_slice() {
        [] => Ok(uncorrelated(tree, site, negated)),
        [only] if matches!(only.op, CompareOp::Eq | CompareOp::NotEq) => {
            rewrite_to_in(tree, site, selection, conjuncts, only.clone(), negated)?;
            Ok(Outcome::ExistsToIn)
        }
        _ => {
            materialize_matches(tree, site, selection, conjuncts, &correlations, &resolver, negated, ctx)?;
            Ok(Outcome::ExistsMaterialized)
        }
    }
}

fn classify(conjuncts: &[Expr], resolver: &Resolver<'_>) -> Result<Vec<Correlation>> {
    let mut correlations = Vec::new();
    for (index, conjunct) in conjuncts.iter().enumerate() {
        if !resolver.mentions_outer(conjunct) {
            continue;
        }
        let Expr::Comparison { op, left, right } = conjunct else {
            return Err(OptimizeError::unsupported(
                REWRITE,
                format!("correlated predicate '{conjunct}' is not a comparison"),
            ));
        };
        let correlation = match (resolver.side(left), resolver.side(right)) {
            (Side::Outer, Side::Inner) => Correlation {
                index,
                op: *op,
                outer: left.as_ref().clone(),
                inner: right.as_ref().clone(),
            },
            (Side::Inner, Side::Outer) => Correlation {
                index,
                op: op.flipped().ok_or_else(|| {
                    OptimizeError::unsupported(
                        REWRITE,
                        format!("cannot orient '{conjunct}' with the outer side first"),
                    )
                })?,
                outer: right.as_ref().clone(),
                inner: left.as_ref().clone(),
            },
            _ => {
                return Err(OptimizeError::unsupported(
                    REWRITE,
                    format!("predicate '{conjunct}' does not compare the subquery with the outer query"),
                ))
            }
        };
        correlations.push(correlation);
    }
    Ok(correlations)
}

fn uncorrelated(tree: &mut RaTree, site: &SubqueryJoin, negated: bool) -> Outcome {
    let kind = if negated { JoinKind::Anti } else { JoinKind::Semi };
    set_join_kind(tree, site.join, kind);
    debug!("EXISTS join {} is uncorrelated, now {}", site.join, kind);
    Outcome::Uncorrelated
}

fn rewrite_to_in(
    tree: &mut RaTree,
    site: &SubqueryJoin,
    selection: NodeId,
    conjuncts: Vec<Expr>,
    correlation: Correlation,
    negated: bool,
) -> Result<()> {
    let remaining: Vec<Expr> = conjuncts
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != correlation.index)
        .map(|(_, c)| c)
        .collect();
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

    if let Operator::Projection {
        exprs,
        column_names,
        ..
    } = tree.op_mut(site.subquery)
    {
        *exprs = vec![correlation.inner.clone()];
        column_names.clear();
    }

    let (join_kind, marker_kind) = if negated {
        (JoinKind::AntiIn, SubqueryKind::NotIn)
    } else {
        (JoinKind::In, SubqueryKind::In)
    };
    if let Operator::Join { kind, predicate, .. } = tree.op_mut(site.join) {
        *kind = join_kind;
        *predicate = Some(Expr::compare(correlation.op, correlation.outer, correlation.inner));
    }
    set_marker_kind(tree, site, marker_kind);
    debug!("EXISTS join {} rewritten to {}", site.join, join_kind);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn materialize_matches(
    tree: &mut RaTree,
    site: &SubqueryJoin,
    selection: NodeId,
    conjuncts: Vec<Expr>,
    correlations: &[Correlation],
    resolver: &Resolver<'_>,
    negated: bool,
    ctx: &mut OptContext<'_>,
) -> Result<()> {
    let catalog = ctx.catalog;

    let mut outer_attrs: Vec<Attribute> = Vec::new();
    for correlation in correlations {
        for attr in correlation.outer.attributes() {
            if !outer_attrs.iter().any(|seen| same_attribute(seen, attr, catalog)) {
                outer_attrs.push(attr.clone());
            }
        }
    }
    let mut relations: Vec<ScopeEntry> = Vec::new();
    for attr in &outer_attrs {
        let entry = attribute_qualifier(attr, catalog)
            .and_then(|q| resolver.outer.entry_for(&q).cloned())
            .ok_or_else(|| OptimizeError::invariant(format!("outer attribute {attr} is not in scope")))?;
        if entry.source != ScopeSource::Relation {
            return Err(OptimizeError::unsupported(
                REWRITE,
                format!("correlated attribute {attr} comes from a derived table"),
            ));
        }
        if !relations.contains(&entry) {
            relations.push(entry);
        }
    }
    let columns = output_column_names(&outer_attrs, catalog);

    // SELECT DISTINCT <outer attrs> FROM <subquery FROM>, <outer relations> WHERE <all>
    let mut input = tree.take_child(selection, 0)?;
    for entry in &relations {
        let relation = tree.add(Operator::Relation {
            name: entry.relation.clone(),
            alias: entry.alias.clone(),
        });
        input = tree.add_node(Operator::CrossProduct, [input, relation])?;
    }
    let filtered = tree.add_node(
        Operator::Selection {
            predicate: Expr::conjunction(conjuncts),
        },
        [input],
    )?;
    let name = register_cte(
        tree,
        &mut ctx.names,
        filtered,
        outer_attrs.iter().cloned().map(Expr::Attribute).collect(),
        columns.clone(),
        true,
    )?;

    let matches_ref = cte_reference(tree, &name);
    tree.replace_child(site.join, 1, matches_ref)?;
    let on = outer_attrs
        .iter()
        .zip(&columns)
        .map(|(attr, column)| Expr::eq(Expr::Attribute(attr.clone()), Expr::attr(&name, column)))
        .collect();
    *tree.op_mut(site.join) = Operator::Join {
        kind: JoinKind::Left,
        predicate: Expr::conjunction(on),
        alias: None,
        column_names: vec![],
        marker: None,
    };

    let first = columns
        .first()
        .ok_or_else(|| OptimizeError::invariant("complex EXISTS without outer attributes"))?;
    let test = Expr::null_test(Expr::attr(&name, first), !negated);
    replace_marker_at(tree, site.occurrence, site.marker.id, &test)?;
    debug!(
        "EXISTS join {} materialized as {} over {} outer relations",
        site.join,
        name,
        relations.len()
    );
    Ok(())
}
