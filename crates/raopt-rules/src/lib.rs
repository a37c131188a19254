//! # Built-in Rewrite Passes
//!
//! This crate provides the two rewrite passes of the optimizer and the driver that
//! runs them over a relational-algebra tree produced by the SQL front end.
//!
//! ## Passes
//!
//! - **`PredicatePushdownPass`**: Splits every selection into its AND-conjuncts and
//!   moves each one to the deepest node whose scope covers the relations it reads.
//! - **`DecorrelationPass`**: Eliminates every dependent join. Scalar and ANY
//!   subqueries go through general unnesting (a D-projection of the outer query,
//!   pushed down and decoupled, or replaced by a CTE); EXISTS and NOT EXISTS use a
//!   cheaper rewrite to an IN join or to a left join against a CTE.
//!
//! ## Driver
//!
//! [`Optimizer::optimize`] takes the tree by value, validates the front end's
//! output, runs the enabled passes in order and validates the result. The tree is
//! handed back only on success, together with the advanced synthetic-name counter
//! and an [`OptimizeReport`].

pub mod decorrelate;
pub mod predicate_pushdown;

use std::sync::Arc;

use raopt_core::catalog::{Catalog, PrefixCatalog};
use raopt_core::config::OptimizerConfig;
use raopt_core::error::Result;
use raopt_core::rule::{NameGenerator, OptContext, PassRegistry, PassReport};
use raopt_core::tree::RaTree;
use raopt_core::validate::{validate_input, validate_output};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Create the pass registry for a configuration.
///
/// Pushdown runs first so that filters sit next to their relations when
/// subqueries are unnested.
pub fn default_pass_registry(config: &OptimizerConfig) -> PassRegistry {
    let mut registry = PassRegistry::new();
    if config.predicate_pushdown {
        registry.add_pass(Box::new(predicate_pushdown::PredicatePushdownPass));
    }
    if config.decorrelation {
        registry.add_pass(Box::new(decorrelate::DecorrelationPass));
    }
    registry
}

/// Reports of all passes of one optimize call, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub passes: Vec<PassReport>,
}

impl OptimizeReport {
    pub fn pass(&self, name: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.pass == name)
    }

    pub fn conjuncts_pushed(&self) -> usize {
        self.passes.iter().map(|p| p.conjuncts_pushed).sum()
    }

    pub fn joins_unnested(&self) -> usize {
        self.passes.iter().map(|p| p.joins_unnested).sum()
    }

    pub fn ctes_materialized(&self) -> usize {
        self.passes.iter().map(|p| p.ctes_materialized).sum()
    }

    pub fn skipped(&self) -> usize {
        self.passes.iter().map(|p| p.skipped.len()).sum()
    }
}

/// Result of a successful optimize call.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub tree: RaTree,
    /// The synthetic-name counter after optimization; hand it back to the front end.
    pub name_counter: u32,
    pub report: OptimizeReport,
}

pub struct Optimizer {
    pub registry: PassRegistry,
    pub config: OptimizerConfig,
    pub catalog: Arc<dyn Catalog>,
}

impl Optimizer {
    /// An optimizer resolving unaliased attributes through the TPC-H prefix table.
    pub fn new(config: OptimizerConfig) -> Self {
        Self::with_catalog(config, Arc::new(PrefixCatalog))
    }

    pub fn with_catalog(config: OptimizerConfig, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            registry: default_pass_registry(&config),
            config,
            catalog,
        }
    }

    /// Optimize `tree`, continuing synthetic names at `name_counter`.
    pub fn optimize(&self, mut tree: RaTree, name_counter: u32) -> Result<Optimized> {
        validate_input(&tree)?;
        debug!(
            "Starting optimization: nodes={}, ctes={}, passes={:?}",
            tree.len(),
            tree.ctes().len(),
            self.registry.names()
        );

        let mut ctx = OptContext::new(
            self.catalog.as_ref(),
            NameGenerator::starting_at(name_counter),
            self.config.on_unsupported,
        );
        let mut report = OptimizeReport::default();
        for pass in self.registry.passes() {
            let pass_report = pass.apply(&mut tree, &mut ctx)?;
            debug!("Pass {} finished: {:?}", pass.name(), pass_report);
            report.passes.push(pass_report);
        }

        if self.config.verify_output {
            // Skipped rewrites legitimately leave their dependent joins behind.
            let allow_dependent = !self.config.decorrelation || report.skipped() > 0;
            validate_output(&tree, allow_dependent)?;
        }
        debug!(
            "Optimization complete: ctes={}, name_counter={}",
            tree.ctes().len(),
            ctx.names.current()
        );
        Ok(Optimized {
            tree,
            name_counter: ctx.names.current(),
            report,
        })
    }
}
