//! # Operator and Expression Types
//!
//! This module defines the node vocabulary of the relational-algebra (RA) tree.
//! It is organized into two layers:
//!
//! ## Scalar Expressions (`Expr`)
//! Scalar expressions are owned, recursive trees: constants, attribute references,
//! function calls, arithmetic, boolean connectives, comparisons and subquery markers.
//! They live *inside* the operator that uses them (a Selection's predicate, a
//! Projection's output list, a Join's condition) and move together with it.
//!
//! ## Relational Operators (`Operator`)
//! Operators are the nodes of the RA tree proper. They are stored in the arena of
//! [`RaTree`](crate::tree::RaTree) and reference their inputs by [`NodeId`]
//! (crate::tree::NodeId). Every operator has a fixed declared arity; the tree checks
//! it before any structural edit.
//!
//! ## Subquery Markers
//! A WHERE-clause subquery is represented twice: the join that computes it (the
//! right child is the subquery) carries a [`SubqueryMarker`], and the predicate that
//! consumes its result embeds an `Expr::Marker` with the same id. The two are linked
//! by id only; the marker never owns the join.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Constant values that appear in queries (e.g., `WHERE l_quantity < 24`).
///
/// Uses `OrderedFloat` for `f64` so that expressions can derive `Eq` and `Hash`,
/// which the rewrite passes rely on when comparing and deduplicating attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    /// SQL NULL value.
    Null,
    /// Boolean true/false.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point, wrapped in OrderedFloat for Eq/Hash support.
    Float64(OrderedFloat<f64>),
    /// UTF-8 string.
    Utf8(String),
    /// Date literal in its textual form (`date '1995-03-15'`).
    Date(String),
    /// Interval literal in its textual form (`interval '3' month`).
    Interval(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(true) => write!(f, "TRUE"),
            ScalarValue::Bool(false) => write!(f, "FALSE"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{}", v.0),
            ScalarValue::Utf8(s) => write!(f, "'{}'", s.replace('\'', "''")),
            ScalarValue::Date(s) => write!(f, "date '{s}'"),
            ScalarValue::Interval(s) => write!(f, "interval {s}"),
        }
    }
}

/// Reference to an attribute, optionally qualified by a relation alias.
///
/// Attribute identity is the pair `(alias, name)`. An unqualified attribute is
/// resolved to its base relation through the [`Catalog`](crate::catalog::Catalog).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attribute {
    pub alias: Option<String>,
    pub name: String,
}

impl Attribute {
    pub fn qualified(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: Some(alias.into()),
            name: name.into(),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            alias: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}.{}", alias, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Comparison operators of a `ComparisonPredicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equality (`=`). The only operator that yields join keys.
    Eq,
    /// Inequality (`<>`).
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }

    /// The operator that yields the same result with its operands swapped.
    ///
    /// `LIKE` is not symmetric, so it has no flipped form.
    pub fn flipped(self) -> Option<CompareOp> {
        match self {
            CompareOp::Eq => Some(CompareOp::Eq),
            CompareOp::NotEq => Some(CompareOp::NotEq),
            CompareOp::Lt => Some(CompareOp::Gt),
            CompareOp::LtEq => Some(CompareOp::GtEq),
            CompareOp::Gt => Some(CompareOp::Lt),
            CompareOp::GtEq => Some(CompareOp::LtEq),
            CompareOp::Like | CompareOp::NotLike => None,
        }
    }
}

/// Arithmetic and string operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Concat => "||",
        }
    }
}

/// Boolean connectives. `Not` takes exactly one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// Which kind of subquery a marker stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubqueryKind {
    /// `x op (SELECT ...)`: the marker is one side of a comparison.
    Scalar,
    /// `x op ANY (SELECT ...)`: the marker is one side of a comparison.
    Any,
    /// `EXISTS (SELECT ...)`: the marker is a standalone boolean term.
    Exists,
    /// `NOT EXISTS (SELECT ...)`.
    NotExists,
    /// `probe IN (SELECT ...)`: the probe comparison lives on the join.
    In,
    /// `probe NOT IN (SELECT ...)`.
    NotIn,
}

impl fmt::Display for SubqueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubqueryKind::Scalar => "scalar",
            SubqueryKind::Any => "any",
            SubqueryKind::Exists => "exists",
            SubqueryKind::NotExists => "not exists",
            SubqueryKind::In => "in",
            SubqueryKind::NotIn => "not in",
        };
        f.write_str(name)
    }
}

/// Placeholder token linking a predicate to the join that implements a subquery.
///
/// `id == 0` means "no subquery here"; the front end numbers real markers from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubqueryMarker {
    pub kind: SubqueryKind,
    pub id: u32,
}

impl SubqueryMarker {
    pub fn new(kind: SubqueryKind, id: u32) -> Self {
        Self { kind, id }
    }

    pub fn is_present(&self) -> bool {
        self.id != 0
    }
}

impl fmt::Display for SubqueryMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} subquery #{}>", self.kind, self.id)
    }
}

/// One `WHEN condition THEN result` arm of a CASE expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseBranch {
    pub condition: Expr,
    pub result: Expr,
}

/// Scalar expressions and predicates.
///
/// This is a recursive tree representing a single scalar computation. Expressions
/// are stored inside operator nodes and never shared between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Constant literal value.
    Constant(ScalarValue),
    /// Reference to an attribute of a relation in scope.
    Attribute(Attribute),
    /// `*` in a projection list.
    Wildcard,
    /// Named function or aggregate call (e.g., `sum(l_extendedprice)`).
    FunctionCall {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },
    /// `CAST(expr AS type_name)`.
    TypeCast { expr: Box<Expr>, type_name: String },
    /// Arithmetic or string operation (e.g., `l_extendedprice * (1 - l_discount)`).
    Binary {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Parenthesized expression list, e.g. a row constructor.
    List(Vec<Expr>),
    /// `expr IS NULL`, or `expr IS NOT NULL` when `negated`.
    NullTest { expr: Box<Expr>, negated: bool },
    /// `expr [NOT] IN (v1, v2, ...)` over a literal list.
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// `CASE [operand] WHEN .. THEN .. [ELSE ..] END`.
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<CaseBranch>,
        otherwise: Option<Box<Expr>>,
    },
    /// AND / OR / NOT over a flat argument list. AND chains are kept flat so that
    /// conjunct decomposition does not have to walk nested binary trees.
    Bool { op: BoolOp, args: Vec<Expr> },
    /// Comparison predicate (`left op right`).
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Reference to the result of a WHERE-clause subquery.
    Marker(SubqueryMarker),
}

impl Expr {
    pub fn attr(alias: impl Into<String>, name: impl Into<String>) -> Expr {
        Expr::Attribute(Attribute::qualified(alias, name))
    }

    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Attribute(Attribute::bare(name))
    }

    pub fn int(value: i64) -> Expr {
        Expr::Constant(ScalarValue::Int64(value))
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::Constant(ScalarValue::Utf8(value.into()))
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Expr {
        Expr::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::compare(CompareOp::Eq, left, right)
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::FunctionCall {
            name: name.into(),
            args,
            distinct: false,
        }
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::Or,
            args,
        }
    }

    pub fn not(arg: Expr) -> Expr {
        Expr::Bool {
            op: BoolOp::Not,
            args: vec![arg],
        }
    }

    pub fn null_test(expr: Expr, negated: bool) -> Expr {
        Expr::NullTest {
            expr: Box::new(expr),
            negated,
        }
    }

    pub fn marker(kind: SubqueryKind, id: u32) -> Expr {
        Expr::Marker(SubqueryMarker::new(kind, id))
    }

    /// AND together a list of conjuncts, flattening nested ANDs.
    ///
    /// Returns `None` for an empty list and the conjunct itself for a single one.
    pub fn conjunction(conjuncts: Vec<Expr>) -> Option<Expr> {
        let mut flat: Vec<Expr> = conjuncts
            .into_iter()
            .flat_map(Expr::into_conjuncts)
            .collect();
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Expr::Bool {
                op: BoolOp::And,
                args: flat,
            }),
        }
    }

    /// AND `extra` onto an optional existing predicate.
    pub fn conjoin(existing: Option<Expr>, extra: Expr) -> Expr {
        let mut conjuncts = existing.map(Expr::into_conjuncts).unwrap_or_default();
        conjuncts.extend(extra.into_conjuncts());
        match Expr::conjunction(conjuncts) {
            Some(expr) => expr,
            None => Expr::Constant(ScalarValue::Bool(true)),
        }
    }

    /// Flatten AND-chains: (A AND (B AND C)) -> [A, B, C].
    ///
    /// OR and NOT predicates are returned whole; they are never split.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Bool {
                op: BoolOp::And,
                args,
            } => args.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Owned counterpart of [`Expr::conjuncts`].
    pub fn into_conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::Bool {
                op: BoolOp::And,
                args,
            } => args.into_iter().flat_map(Expr::into_conjuncts).collect(),
            other => vec![other],
        }
    }

    pub fn as_attribute(&self) -> Option<&Attribute> {
        match self {
            Expr::Attribute(a) => Some(a),
            _ => None,
        }
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Constant(_) | Expr::Attribute(_) | Expr::Wildcard | Expr::Marker(_) => vec![],
            Expr::FunctionCall { args, .. } => args.iter().collect(),
            Expr::TypeCast { expr, .. } | Expr::NullTest { expr, .. } => vec![expr.as_ref()],
            Expr::Binary { left, right, .. } | Expr::Comparison { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            Expr::List(items) | Expr::Bool { args: items, .. } => items.iter().collect(),
            Expr::InList { expr, list, .. } => {
                let mut out = vec![expr.as_ref()];
                out.extend(list.iter());
                out
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let mut out = Vec::new();
                if let Some(operand) = operand {
                    out.push(operand.as_ref());
                }
                for branch in branches {
                    out.push(&branch.condition);
                    out.push(&branch.result);
                }
                if let Some(otherwise) = otherwise {
                    out.push(otherwise.as_ref());
                }
                out
            }
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Constant(_) | Expr::Attribute(_) | Expr::Wildcard | Expr::Marker(_) => vec![],
            Expr::FunctionCall { args, .. } => args.iter_mut().collect(),
            Expr::TypeCast { expr, .. } | Expr::NullTest { expr, .. } => vec![expr.as_mut()],
            Expr::Binary { left, right, .. } | Expr::Comparison { left, right, .. } => {
                vec![left.as_mut(), right.as_mut()]
            }
            Expr::List(items) | Expr::Bool { args: items, .. } => items.iter_mut().collect(),
            Expr::InList { expr, list, .. } => {
                let mut out = vec![expr.as_mut()];
                out.extend(list.iter_mut());
                out
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let mut out = Vec::new();
                if let Some(operand) = operand {
                    out.push(operand.as_mut());
                }
                for CaseBranch { condition, result } in branches.iter_mut() {
                    out.push(condition);
                    out.push(result);
                }
                if let Some(otherwise) = otherwise {
                    out.push(otherwise.as_mut());
                }
                out
            }
        }
    }

    /// Return all attribute references in this expression.
    pub fn attributes(&self) -> Vec<&Attribute> {
        let mut attrs = Vec::new();
        self.collect_attributes(&mut attrs);
        attrs
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a Attribute>) {
        if let Expr::Attribute(a) = self {
            out.push(a);
        }
        for child in self.children() {
            child.collect_attributes(out);
        }
    }

    /// Return all subquery markers embedded in this expression.
    pub fn markers(&self) -> Vec<SubqueryMarker> {
        let mut markers = Vec::new();
        self.collect_markers(&mut markers);
        markers
    }

    fn collect_markers(&self, out: &mut Vec<SubqueryMarker>) {
        if let Expr::Marker(m) = self {
            out.push(*m);
        }
        for child in self.children() {
            child.collect_markers(out);
        }
    }

    pub fn contains_marker(&self, id: u32) -> bool {
        self.markers().iter().any(|m| m.id == id)
    }

    /// Check if this expression references attributes qualified by `alias`.
    pub fn references_alias(&self, alias: &str) -> bool {
        self.attributes()
            .iter()
            .any(|a| a.alias.as_deref() == Some(alias))
    }

    /// Top-down rewrite. `f` returns `true` when it replaced the node it was given,
    /// in which case the replacement is not descended into.
    pub fn rewrite<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut Expr) -> bool,
    {
        if f(self) {
            return;
        }
        for child in self.children_mut() {
            child.rewrite(f);
        }
    }

    /// Apply `f` to every attribute reference in place.
    pub fn for_each_attribute_mut<F>(&mut self, f: &mut F)
    where
        F: FnMut(&mut Attribute),
    {
        self.rewrite(&mut |e| {
            if let Expr::Attribute(a) = e {
                f(a);
            }
            false
        });
    }

    /// Replace every occurrence of the marker `id` with `replacement`.
    /// Returns the number of occurrences replaced.
    pub fn replace_marker(&mut self, id: u32, replacement: &Expr) -> usize {
        let mut replaced = 0;
        self.rewrite(&mut |e| match e {
            Expr::Marker(m) if m.id == id => {
                *e = replacement.clone();
                replaced += 1;
                true
            }
            _ => false,
        });
        replaced
    }

    /// `a = a` over the very same attribute.
    pub fn is_attribute_tautology(&self) -> bool {
        match self {
            Expr::Comparison {
                op: CompareOp::Eq,
                left,
                right,
            } => matches!((left.as_ref(), right.as_ref()), (Expr::Attribute(l), Expr::Attribute(r)) if l == r),
            _ => false,
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{v}"),
            Expr::Attribute(a) => write!(f, "{a}"),
            Expr::Wildcard => f.write_str("*"),
            Expr::FunctionCall {
                name,
                args,
                distinct,
            } => {
                write!(f, "{name}(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                write_list(f, args, ", ")?;
                f.write_str(")")
            }
            Expr::TypeCast { expr, type_name } => write!(f, "CAST({expr} AS {type_name})"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::List(items) => {
                f.write_str("(")?;
                write_list(f, items, ", ")?;
                f.write_str(")")
            }
            Expr::NullTest { expr, negated } => {
                if *negated {
                    write!(f, "{expr} IS NOT NULL")
                } else {
                    write!(f, "{expr} IS NULL")
                }
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                write_list(f, list, ", ")?;
                f.write_str(")")
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                f.write_str("CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {operand}")?;
                }
                for branch in branches {
                    write!(f, " WHEN {} THEN {}", branch.condition, branch.result)?;
                }
                if let Some(otherwise) = otherwise {
                    write!(f, " ELSE {otherwise}")?;
                }
                f.write_str(" END")
            }
            Expr::Bool { op, args } => match op {
                BoolOp::And => write_list(f, args, " AND "),
                BoolOp::Or => {
                    f.write_str("(")?;
                    write_list(f, args, " OR ")?;
                    f.write_str(")")
                }
                BoolOp::Not => {
                    f.write_str("NOT (")?;
                    write_list(f, args, ", ")?;
                    f.write_str(")")
                }
            },
            Expr::Comparison { op, left, right } => write!(f, "{left} {} {right}", op.symbol()),
            Expr::Marker(m) => write!(f, "{m}"),
        }
    }
}

/// SQL join kinds.
///
/// The dependent kinds only exist between the front end and decorrelation: their
/// right input references attributes produced by their left input. For `In` and
/// `AntiIn` the join predicate is the probe comparison `probe op <subquery output>`
/// whose left side is evaluated in the outer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    /// Inner join: only matching rows from both sides.
    Inner,
    /// Left outer join: all rows from left, matching from right (or NULLs).
    Left,
    /// Right outer join: all rows from right, matching from left (or NULLs).
    Right,
    /// Cartesian product expressed as a join.
    Cross,
    /// Left rows with at least one match on the right (EXISTS).
    Semi,
    /// Left rows with no match on the right (NOT EXISTS).
    Anti,
    /// Left rows whose probe compares true against some right value (IN).
    In,
    /// Left rows whose probe compares true against no right value (NOT IN).
    AntiIn,
    /// Correlated inner join for scalar and ANY subqueries.
    DependentInner,
    /// Correlated EXISTS.
    DependentSemi,
    /// Correlated NOT EXISTS.
    DependentAnti,
    /// Correlated IN.
    DependentIn,
    /// Correlated NOT IN.
    DependentAntiIn,
}

impl JoinKind {
    pub fn is_dependent(self) -> bool {
        matches!(
            self,
            JoinKind::DependentInner
                | JoinKind::DependentSemi
                | JoinKind::DependentAnti
                | JoinKind::DependentIn
                | JoinKind::DependentAntiIn
        )
    }

    /// Whether the right input's attributes are visible above the join.
    pub fn exposes_right(self) -> bool {
        matches!(
            self,
            JoinKind::Inner
                | JoinKind::Left
                | JoinKind::Right
                | JoinKind::Cross
                | JoinKind::DependentInner
        )
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Sort direction of one ORDER BY key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Relational operators -- the nodes of the RA tree.
///
/// Children are not stored here; the owning [`RaNode`](crate::tree::RaNode) keeps
/// them as arena ids so that structural rewrites never move operator payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Tree root; its single child is the query's top operator.
    Root,
    /// Filter. The predicate is only `None` transiently while predicate pushdown
    /// has detached it.
    Selection { predicate: Option<Expr> },
    /// Computes output expressions. With an alias it is a FROM-subquery or CTE body
    /// whose outputs are named by `column_names`.
    Projection {
        exprs: Vec<Expr>,
        alias: Option<String>,
        column_names: Vec<String>,
        distinct: bool,
    },
    /// Cartesian product of its two inputs.
    CrossProduct,
    /// Base relation (or CTE reference) in a FROM clause.
    Relation { name: String, alias: Option<String> },
    /// Join of its two inputs. `marker` identifies the WHERE-clause subquery this
    /// join implements; the right input is then a nested scope.
    Join {
        kind: JoinKind,
        predicate: Option<Expr>,
        alias: Option<String>,
        column_names: Vec<String>,
        marker: Option<SubqueryMarker>,
    },
    /// Grouping. `implicit` marks aggregation without a GROUP BY clause.
    GroupBy { exprs: Vec<Expr>, implicit: bool },
    /// Ordering with one direction per key.
    OrderBy {
        exprs: Vec<Expr>,
        directions: Vec<SortDirection>,
    },
    /// Post-aggregation filter.
    Having { predicate: Expr },
    /// Inline single-column VALUES list.
    Values {
        rows: Vec<Expr>,
        alias: String,
        column: String,
    },
    /// Placeholder occupying a child slot while a subtree is being moved.
    Dummy,
}

/// Kind discriminant for pattern matching (without data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Root,
    Selection,
    Projection,
    CrossProduct,
    Relation,
    Join,
    GroupBy,
    OrderBy,
    Having,
    Values,
    Dummy,
}

impl Operator {
    pub fn kind(&self) -> NodeKind {
        match self {
            Operator::Root => NodeKind::Root,
            Operator::Selection { .. } => NodeKind::Selection,
            Operator::Projection { .. } => NodeKind::Projection,
            Operator::CrossProduct => NodeKind::CrossProduct,
            Operator::Relation { .. } => NodeKind::Relation,
            Operator::Join { .. } => NodeKind::Join,
            Operator::GroupBy { .. } => NodeKind::GroupBy,
            Operator::OrderBy { .. } => NodeKind::OrderBy,
            Operator::Having { .. } => NodeKind::Having,
            Operator::Values { .. } => NodeKind::Values,
            Operator::Dummy => NodeKind::Dummy,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            NodeKind::Root => "Root",
            NodeKind::Selection => "Selection",
            NodeKind::Projection => "Projection",
            NodeKind::CrossProduct => "CrossProduct",
            NodeKind::Relation => "Relation",
            NodeKind::Join => "Join",
            NodeKind::GroupBy => "GroupBy",
            NodeKind::OrderBy => "OrderBy",
            NodeKind::Having => "Having",
            NodeKind::Values => "Values",
            NodeKind::Dummy => "Dummy",
        }
    }

    /// Declared number of children.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Relation { .. } | Operator::Values { .. } | Operator::Dummy => 0,
            Operator::CrossProduct | Operator::Join { .. } => 2,
            Operator::Root
            | Operator::Selection { .. }
            | Operator::Projection { .. }
            | Operator::GroupBy { .. }
            | Operator::OrderBy { .. }
            | Operator::Having { .. } => 1,
        }
    }

    /// Expressions carried by this operator.
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            Operator::Selection { predicate } => predicate.iter().collect(),
            Operator::Join { predicate, .. } => predicate.iter().collect(),
            Operator::Projection { exprs, .. }
            | Operator::GroupBy { exprs, .. }
            | Operator::OrderBy { exprs, .. } => exprs.iter().collect(),
            Operator::Having { predicate } => vec![predicate],
            Operator::Values { rows, .. } => rows.iter().collect(),
            Operator::Root | Operator::CrossProduct | Operator::Relation { .. } | Operator::Dummy => {
                vec![]
            }
        }
    }

    pub fn expressions_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Operator::Selection { predicate } => predicate.iter_mut().collect(),
            Operator::Join { predicate, .. } => predicate.iter_mut().collect(),
            Operator::Projection { exprs, .. }
            | Operator::GroupBy { exprs, .. }
            | Operator::OrderBy { exprs, .. } => exprs.iter_mut().collect(),
            Operator::Having { predicate } => vec![predicate],
            Operator::Values { rows, .. } => rows.iter_mut().collect(),
            Operator::Root | Operator::CrossProduct | Operator::Relation { .. } | Operator::Dummy => {
                vec![]
            }
        }
    }

    pub fn is_dependent_join(&self) -> bool {
        matches!(self, Operator::Join { kind, .. } if kind.is_dependent())
    }
}

fn write_names(f: &mut fmt::Formatter<'_>, alias: &Option<String>, columns: &[String]) -> fmt::Result {
    if let Some(alias) = alias {
        write!(f, " AS {alias}")?;
        if !columns.is_empty() {
            write!(f, "({})", columns.join(", "))?;
        }
    }
    Ok(())
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Root => f.write_str("Root"),
            Operator::Selection { predicate } => match predicate {
                Some(p) => write!(f, "Selection [{p}]"),
                None => f.write_str("Selection <empty>"),
            },
            Operator::Projection {
                exprs,
                alias,
                column_names,
                distinct,
            } => {
                f.write_str("Projection ")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                f.write_str("[")?;
                write_list(f, exprs, ", ")?;
                f.write_str("]")?;
                write_names(f, alias, column_names)
            }
            Operator::CrossProduct => f.write_str("CrossProduct"),
            Operator::Relation { name, alias } => match alias {
                Some(alias) => write!(f, "Relation {name} AS {alias}"),
                None => write!(f, "Relation {name}"),
            },
            Operator::Join {
                kind,
                predicate,
                alias,
                column_names,
                marker,
            } => {
                write!(f, "Join {kind}")?;
                if let Some(p) = predicate {
                    write!(f, " [{p}]")?;
                }
                write_names(f, alias, column_names)?;
                if let Some(m) = marker {
                    write!(f, " {m}")?;
                }
                Ok(())
            }
            Operator::GroupBy { exprs, implicit } => {
                f.write_str("GroupBy [")?;
                write_list(f, exprs, ", ")?;
                f.write_str("]")?;
                if *implicit {
                    f.write_str(" implicit")?;
                }
                Ok(())
            }
            Operator::OrderBy { exprs, directions } => {
                f.write_str("OrderBy [")?;
                for (i, expr) in exprs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let dir = match directions.get(i) {
                        Some(SortDirection::Desc) => "DESC",
                        _ => "ASC",
                    };
                    write!(f, "{expr} {dir}")?;
                }
                f.write_str("]")
            }
            Operator::Having { predicate } => write!(f, "Having [{predicate}]"),
            Operator::Values {
                rows,
                alias,
                column,
            } => {
                f.write_str("Values [")?;
                write_list(f, rows, ", ")?;
                write!(f, "] AS {alias}({column})")
            }
            Operator::Dummy => f.write_str("Dummy"),
        }
    }
}
