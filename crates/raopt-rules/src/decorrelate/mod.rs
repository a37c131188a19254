//! # Subquery Decorrelation Pass
//!
//! The front end turns every WHERE-clause subquery into a *dependent join*: a join
//! whose right input is the subquery and whose left input is the outer query the
//! subquery may reference. Dependent joins cannot be evaluated as ordinary joins, so
//! this pass eliminates all of them.
//!
//! ## Dispatch
//!
//! Dependent joins are visited innermost first (post-order), so by the time a join
//! is rewritten every subquery nested inside it is already flat.
//!
//! | Join kind         | Rewrite                                                 |
//! |-------------------|---------------------------------------------------------|
//! | `DependentInner`  | general unnesting ([`unnest`]), scalar and ANY markers  |
//! | `DependentSemi`   | EXISTS specialization ([`exists`])                      |
//! | `DependentAnti`   | NOT EXISTS specialization ([`exists`])                  |
//! | `DependentIn`     | folded into an EXISTS, then as `DependentSemi`          |
//! | `DependentAntiIn` | unsupported: NOT IN and NOT EXISTS disagree on NULLs    |
//!
//! ## Rollback
//!
//! Each rewrite starts from a snapshot of the tree and of the name generator. When a
//! rewrite reports [`OptimizeError::Unsupported`] and the context's policy is
//! `Skip`, the snapshot is restored, the join is recorded in the report and the
//! pass moves on; otherwise the error aborts the pass.

pub mod exists;
pub mod materialize;
pub mod unnest;

use raopt_core::catalog::Catalog;
use raopt_core::config::UnsupportedPolicy;
use raopt_core::error::{OptimizeError, Result};
use raopt_core::expr::{Attribute, Expr, JoinKind, Operator, SubqueryKind, SubqueryMarker};
use raopt_core::pattern::{find_all, Pattern, Traversal};
use raopt_core::rule::{OptContext, PassReport, RewritePass, SkippedRewrite};
use raopt_core::scope::{attribute_qualifier, find_marker_occurrence};
use raopt_core::tree::{NodeId, RaTree};
use tracing::{debug, warn};

/// Eliminate dependent joins.
pub struct DecorrelationPass;

impl RewritePass for DecorrelationPass {
    fn name(&self) -> &str {
        "Decorrelation"
    }

    fn apply(&self, tree: &mut RaTree, ctx: &mut OptContext<'_>) -> Result<PassReport> {
        let mut report = PassReport::new(self.name());
        let joins = find_all(tree, &Pattern::dependent_join(), Traversal::PostOrder);
        debug!("Decorrelating {} dependent joins", joins.len());

        for join in joins {
            if !tree.is_reachable(join) || !tree.op(join).is_dependent_join() {
                continue;
            }
            let snapshot = tree.clone();
            let names = ctx.names.clone();
            match decorrelate_join(tree, join, ctx) {
                Ok(outcome) => {
                    debug!("Dependent join {} rewritten: {:?}", join, outcome);
                    outcome.record(&mut report);
                }
                Err(err) if err.is_unsupported() && ctx.on_unsupported == UnsupportedPolicy::Skip => {
                    warn!("Skipping dependent join {}: {}", join, err);
                    *tree = snapshot;
                    ctx.names = names;
                    report.skipped.push(SkippedRewrite {
                        node: join,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        debug!(
            "Decorrelation complete: unnested={}, decoupled={}, ctes={}, exists_to_in={}, skipped={}",
            report.joins_unnested,
            report.joins_decoupled,
            report.ctes_materialized,
            report.exists_to_in,
            report.skipped.len()
        );
        Ok(report)
    }
}

/// How a dependent join was eliminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No correlation: the join simply lost its dependent kind.
    Uncorrelated,
    /// General unnesting; `decoupled` when the D-projection was eliminated,
    /// `materialized` when the outer side moved into a CTE instead.
    Unnested { decoupled: bool, materialized: bool },
    /// EXISTS with a single equality-like correlation became an IN join.
    ExistsToIn,
    /// EXISTS with complex correlation became a left join to a CTE.
    ExistsMaterialized,
}

impl Outcome {
    fn record(self, report: &mut PassReport) {
        match self {
            Outcome::Uncorrelated => report.uncorrelated += 1,
            Outcome::Unnested {
                decoupled,
                materialized,
            } => {
                report.joins_unnested += 1;
                if decoupled {
                    report.joins_decoupled += 1;
                }
                if materialized {
                    report.ctes_materialized += 1;
                }
            }
            Outcome::ExistsToIn => report.exists_to_in += 1,
            Outcome::ExistsMaterialized => report.ctes_materialized += 1,
        }
    }
}

/// A dependent join together with the pieces every rewrite needs.
#[derive(Debug, Clone, Copy)]
pub struct SubqueryJoin {
    pub join: NodeId,
    /// Left input: the outer query.
    pub outer: NodeId,
    /// Right input: the subquery.
    pub subquery: NodeId,
    pub marker: SubqueryMarker,
    /// The operator whose predicate consumes the subquery result.
    pub occurrence: NodeId,
}

impl SubqueryJoin {
    pub fn inspect(tree: &RaTree, join: NodeId) -> Result<Self> {
        tree.ensure_complete(join)?;
        let marker = match tree.op(join) {
            Operator::Join {
                marker: Some(m), ..
            } if m.is_present() => *m,
            _ => {
                return Err(OptimizeError::invariant(format!(
                    "dependent join {join} carries no subquery marker"
                )))
            }
        };
        let occurrence = find_marker_occurrence(tree, marker.id).ok_or_else(|| {
            OptimizeError::invariant(format!("marker {marker} is not referenced by any predicate"))
        })?;
        Ok(Self {
            join,
            outer: tree.child(join, 0)?,
            subquery: tree.child(join, 1)?,
            marker,
            occurrence,
        })
    }
}

fn decorrelate_join(tree: &mut RaTree, join: NodeId, ctx: &mut OptContext<'_>) -> Result<Outcome> {
    let site = SubqueryJoin::inspect(tree, join)?;
    let kind = match tree.op(join) {
        Operator::Join { kind, .. } => *kind,
        other => {
            return Err(OptimizeError::invariant(format!(
                "expected a join at {join}, found {}",
                other.kind_name()
            )))
        }
    };
    match kind {
        JoinKind::DependentInner => unnest::unnest(tree, &site, ctx),
        JoinKind::DependentSemi | JoinKind::DependentAnti => exists::rewrite_exists(tree, &site, ctx),
        JoinKind::DependentIn => {
            exists::fold_in_probe(tree, &site)?;
            let site = SubqueryJoin::inspect(tree, join)?;
            exists::rewrite_exists(tree, &site, ctx)
        }
        JoinKind::DependentAntiIn => Err(OptimizeError::unsupported(
            "decorrelation",
            "correlated NOT IN subquery",
        )),
        other => Err(OptimizeError::invariant(format!(
            "join {join} of kind {other} is not dependent"
        ))),
    }
}

/// Output column names for a list of attributes: the attribute name, prefixed by
/// its qualifier when two attributes share a name.
pub(crate) fn output_column_names(attrs: &[Attribute], catalog: &dyn Catalog) -> Vec<String> {
    attrs
        .iter()
        .map(|attr| {
            let shared = attrs.iter().filter(|other| other.name == attr.name).count() > 1;
            match attribute_qualifier(attr, catalog) {
                Some(q) if shared => format!("{}_{}", q, attr.name),
                _ => attr.name.clone(),
            }
        })
        .collect()
}

/// Replace the marker `marker_id` inside the expressions of `node`.
pub(crate) fn replace_marker_at(
    tree: &mut RaTree,
    node: NodeId,
    marker_id: u32,
    replacement: &Expr,
) -> Result<()> {
    let replaced: usize = tree
        .op_mut(node)
        .expressions_mut()
        .into_iter()
        .map(|e| e.replace_marker(marker_id, replacement))
        .sum();
    if replaced == 0 {
        return Err(OptimizeError::invariant(format!(
            "marker #{marker_id} not found at {node}"
        )));
    }
    Ok(())
}

/// Change the kind of a marker both on its join and where it is consumed.
pub(crate) fn set_marker_kind(tree: &mut RaTree, site: &SubqueryJoin, kind: SubqueryKind) {
    if let Operator::Join {
        marker: Some(marker),
        ..
    } = tree.op_mut(site.join)
    {
        marker.kind = kind;
    }
    for expr in tree.op_mut(site.occurrence).expressions_mut() {
        expr.rewrite(&mut |e| {
            if let Expr::Marker(m) = e {
                if m.id == site.marker.id {
                    m.kind = kind;
                }
            }
            false
        });
    }
}

/// Set the kind of the join at `join`, leaving everything else untouched.
pub(crate) fn set_join_kind(tree: &mut RaTree, join: NodeId, new_kind: JoinKind) {
    if let Operator::Join { kind, .. } = tree.op_mut(join) {
        *kind = new_kind;
    }
}

/// The selection directly below a subquery's top projection, if any.
///
/// Aggregating subqueries put grouping between the two; they are rejected here
/// because their WHERE clause cannot be separated from the aggregate.
pub(crate) fn direct_selection(
    tree: &RaTree,
    projection: NodeId,
    rewrite: &'static str,
) -> Result<Option<NodeId>> {
    let child = tree.child(projection, 0)?;
    match tree.op(child) {
        Operator::Selection { .. } => Ok(Some(child)),
        Operator::GroupBy { .. } | Operator::Having { .. } => Err(OptimizeError::unsupported(
            rewrite,
            "aggregating subquery",
        )),
        _ => Ok(None),
    }
}
