//! # Catalog Interface
//!
//! The catalog answers one question for the optimizer: which base relation owns an
//! unqualified attribute? Scope resolution needs the answer whenever a query names
//! a column without an alias (`WHERE l_orderkey = o_orderkey`), because correlation
//! and pushdown decisions are made per relation.
//!
//! ## Trait Design
//!
//! The `Catalog` trait is minimal and used behind a trait object (`dyn Catalog`) so
//! that a front end with real schema metadata can plug in its own lookup. Two
//! implementations ship with the crate:
//!
//! - [`PrefixCatalog`]: the closed TPC-H naming convention (`l_` -> `lineitem`,
//!   `ps_` -> `partsupp`, ...). The longest matching prefix wins, so `ps_availqty`
//!   resolves to `partsupp` and not `part`.
//! - [`InMemoryCatalog`]: explicit column registrations, populated programmatically,
//!   falling back to the prefix convention for names it does not know.

use std::collections::HashMap;

/// Catalog provides attribute ownership information.
pub trait Catalog: Send + Sync {
    /// Base relation owning the unqualified attribute `attribute`, if known.
    fn relation_for_attribute(&self, attribute: &str) -> Option<String>;
}

/// Attribute-name prefixes of the TPC-H schema and the relation each one denotes.
pub const TPCH_PREFIXES: &[(&str, &str)] = &[
    ("c_", "customer"),
    ("o_", "orders"),
    ("l_", "lineitem"),
    ("ps_", "partsupp"),
    ("p_", "part"),
    ("s_", "supplier"),
    ("n_", "nation"),
    ("r_", "region"),
];

/// Resolve an attribute name through the TPC-H prefix table.
pub fn prefix_relation(attribute: &str) -> Option<&'static str> {
    TPCH_PREFIXES
        .iter()
        .filter(|(prefix, _)| attribute.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, relation)| *relation)
}

/// Catalog backed only by the TPC-H prefix convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixCatalog;

impl Catalog for PrefixCatalog {
    fn relation_for_attribute(&self, attribute: &str) -> Option<String> {
        prefix_relation(attribute).map(str::to_string)
    }
}

/// In-memory catalog for testing and development.
///
/// Explicit registrations always take precedence over the prefix convention.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    /// Owning relation keyed by column name.
    pub columns: HashMap<String, String>,
    /// Consult the TPC-H prefix table for unregistered names.
    pub prefix_fallback: bool,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self {
            columns: HashMap::new(),
            prefix_fallback: true,
        }
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_prefix_fallback() -> Self {
        Self {
            columns: HashMap::new(),
            prefix_fallback: false,
        }
    }

    pub fn add_table(&mut self, relation: &str, columns: &[&str]) {
        for column in columns {
            self.columns.insert(column.to_string(), relation.to_string());
        }
    }
}

impl Catalog for InMemoryCatalog {
    fn relation_for_attribute(&self, attribute: &str) -> Option<String> {
        if let Some(relation) = self.columns.get(attribute) {
            return Some(relation.clone());
        }
        if self.prefix_fallback {
            return prefix_relation(attribute).map(str::to_string);
        }
        None
    }
}
