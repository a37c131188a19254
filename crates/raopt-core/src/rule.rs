//! # Rewrite Pass System
//!
//! This module defines the pass trait and the pass registry that drive the optimizer.
//!
//! ## Passes
//!
//! A [`RewritePass`] rewrites the whole tree in place. Passes run in registration
//! order; the default registry runs predicate pushdown before decorrelation so that
//! filters already sit next to their relations when subqueries are unnested.
//!
//! Each pass returns a [`PassReport`] counting what it changed. Rewrites that were
//! rolled back because of an unsupported construct are listed in
//! `PassReport::skipped` rather than reported as errors when the context's
//! [`UnsupportedPolicy`] is `Skip`.
//!
//! ## Context
//!
//! [`OptContext`] carries what every pass needs besides the tree: the catalog used
//! to resolve unaliased attributes, the synthetic-name generator, and the
//! unsupported-construct policy. The name generator replaces any global counter: the
//! caller seeds it with the front end's counter value and reads the advanced value
//! back after optimization.

use crate::catalog::Catalog;
use crate::config::UnsupportedPolicy;
use crate::error::{OptimizeError, Result};
use crate::tree::{NodeId, RaTree};
use serde::{Deserialize, Serialize};

/// Source of synthetic names (`cte_<n>`, `m<n>`, `t<n>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameGenerator {
    next: u32,
}

impl NameGenerator {
    /// Continue numbering after the front end's last value.
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Hand out the current value. Fails once the counter cannot advance.
    pub fn next_id(&mut self) -> Result<u32> {
        let id = self.next;
        self.next = id
            .checked_add(1)
            .ok_or_else(|| OptimizeError::invariant(format!("synthetic name counter exhausted at {id}")))?;
        Ok(id)
    }

    /// The next value that would be handed out.
    pub fn current(&self) -> u32 {
        self.next
    }

    pub fn cte_name(&mut self) -> Result<String> {
        Ok(format!("cte_{}", self.next_id()?))
    }
}

/// Context passed to passes during application.
pub struct OptContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub names: NameGenerator,
    pub on_unsupported: UnsupportedPolicy,
}

impl<'a> OptContext<'a> {
    pub fn new(catalog: &'a dyn Catalog, names: NameGenerator, on_unsupported: UnsupportedPolicy) -> Self {
        Self {
            catalog,
            names,
            on_unsupported,
        }
    }
}

/// A rewrite that was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRewrite {
    /// The dependent join the rewrite started from.
    pub node: NodeId,
    pub reason: String,
}

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: String,
    /// Conjuncts moved below their original selection.
    pub conjuncts_pushed: usize,
    /// Selections removed because they ended up empty.
    pub selections_removed: usize,
    /// Scalar/ANY dependent joins turned into plain joins.
    pub joins_unnested: usize,
    /// Unnested joins whose D-projection was eliminated.
    pub joins_decoupled: usize,
    /// CTEs introduced by fallback materialization.
    pub ctes_materialized: usize,
    /// EXISTS/NOT EXISTS joins rewritten to IN/NOT IN joins.
    pub exists_to_in: usize,
    /// Dependent joins without correlation turned into plain joins.
    pub uncorrelated: usize,
    pub skipped: Vec<SkippedRewrite>,
}

impl PassReport {
    pub fn new(pass: impl Into<String>) -> Self {
        Self {
            pass: pass.into(),
            ..Self::default()
        }
    }
}

/// A pass rewrites the tree in place.
pub trait RewritePass: Send + Sync {
    /// Unique name of this pass.
    fn name(&self) -> &str;

    /// Apply the pass to the whole tree.
    fn apply(&self, tree: &mut RaTree, ctx: &mut OptContext<'_>) -> Result<PassReport>;
}

/// Ordered registry of rewrite passes.
pub struct PassRegistry {
    passes: Vec<Box<dyn RewritePass>>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn RewritePass>) {
        self.passes.push(pass);
    }

    pub fn passes(&self) -> impl Iterator<Item = &dyn RewritePass> {
        self.passes.iter().map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
