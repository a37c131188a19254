//! # raopt-core: Relational-Algebra Optimizer Core
//!
//! This crate implements the data structures shared by the rewrite passes of the
//! relational-algebra (RA) optimizer: the tree the SQL front end produces, the
//! navigation helpers the passes use to reason about scopes, and the pass
//! machinery that runs them.
//!
//! ## Module Overview
//!
//! - **`expr`**: Operator and scalar expression definitions, join kinds and
//!   subquery markers.
//! - **`tree`**: The arena holding the RA tree, its CTE side list and the
//!   structural editing primitives (splice, replace, detach, clone).
//! - **`scope`**: Relation-scope resolution, attribute collection, correlation
//!   analysis and marker-to-join resolution.
//! - **`catalog`**: Catalog trait mapping unaliased attributes to base relations,
//!   with the TPC-H prefix convention as fallback.
//! - **`pattern`**: Declarative pattern matching used to locate rewrite sites.
//! - **`rule`**: The `RewritePass` trait, the `PassRegistry` and the optimizer
//!   context (catalog, synthetic-name generator, unsupported policy).
//! - **`config`**: `OptimizerConfig` and the unsupported-construct policy.
//! - **`validate`**: Input and output contracts of the optimizer.
//! - **`error`**: The `OptimizeError` taxonomy.

pub mod catalog;
pub mod config;
pub mod error;
pub mod expr;
pub mod pattern;
pub mod rule;
pub mod scope;
pub mod tree;
pub mod validate;
