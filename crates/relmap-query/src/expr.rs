//! Object-level predicate expressions.
//!
//! An [`Expr`] names attributes, not columns. The same tree is used two ways:
//!
//! - [`Expr::to_sql_fragment`] renders it against a descriptor into a WHERE
//!   fragment with bound parameters, for the database;
//! - [`Expr::evaluate`] classifies one object's attribute state in memory,
//!   for conforming queries inside a unit of work.
//!
//! Both follow SQL's three-valued logic: any comparison with NULL is
//! [`Truth::Unknown`], `NOT Unknown` is `Unknown`, and only `True` selects a
//! row or object. Nodes that cannot be evaluated faithfully in memory (raw SQL
//! fragments, comparisons between incomparable types) raise a conformance
//! error instead of guessing.

use std::cmp::Ordering;

use relmap_core::error::ConformanceError;
use relmap_core::{Descriptor, Error, ObjectState, Result, Value};

/// Placeholder and identifier quoting rules of the target database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// `$1`, `$2`, ...
    #[default]
    Postgres,
    /// `?1`, `?2`, ...
    Sqlite,
    /// Positional `?`
    Mysql,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote a table or column name, doubling any embedded quote character.
    pub fn quote_identifier(self, name: &str) -> String {
        let quote = match self {
            Dialect::Postgres | Dialect::Sqlite => '"',
            Dialect::Mysql => '`',
        };
        let mut quoted = String::with_capacity(name.len() + 2);
        quoted.push(quote);
        for c in name.chars() {
            if c == quote {
                quoted.push(quote);
            }
            quoted.push(c);
        }
        quoted.push(quote);
        quoted
    }
}

/// Result of evaluating a predicate under three-valued logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub const fn from_bool(b: bool) -> Self {
        if b { Truth::True } else { Truth::False }
    }

    /// Only `True` selects.
    pub const fn is_true(self) -> bool {
        matches!(self, Truth::True)
    }

    pub const fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    pub const fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    pub const fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Truth::True => Value::Bool(true),
            Truth::False => Value::Bool(false),
            Truth::Unknown => Value::Null,
        }
    }
}

/// A predicate over an entity's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Attribute reference, resolved to a column through the descriptor
    Attribute { name: String },

    /// Literal value, bound as a parameter
    Literal(Value),

    /// Comparison or boolean combinator
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    Unary { op: UnaryOp, expr: Box<Expr> },

    IsNull { expr: Box<Expr>, negated: bool },

    /// Raw SQL fragment (escape hatch; cannot be evaluated in memory)
    Raw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub const fn sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Binding strength; higher binds tighter.
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            _ => 3,
        }
    }

    pub const fn is_comparison(self) -> bool {
        !matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    fn matches(self, ordering: Ordering) -> bool {
        match self {
            BinaryOp::Eq => ordering == Ordering::Equal,
            BinaryOp::Ne => ordering != Ordering::Equal,
            BinaryOp::Lt => ordering == Ordering::Less,
            BinaryOp::Le => ordering != Ordering::Greater,
            BinaryOp::Gt => ordering == Ordering::Greater,
            BinaryOp::Ge => ordering != Ordering::Less,
            BinaryOp::And | BinaryOp::Or => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

macro_rules! comparisons {
    ($($method:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $method(self, other: impl Into<Expr>) -> Self {
                self.binary(BinaryOp::$op, other)
            }
        )*
    };
}

/// Rendered SQL text plus the parameters it binds, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub text: String,
    pub params: Vec<Value>,
}

impl Expr {
    /// Reference an attribute by name.
    pub fn attr(name: impl Into<String>) -> Self {
        Expr::Attribute { name: name.into() }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Raw SQL passed through untouched. Never conforms in memory.
    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    comparisons! {
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
    }

    pub fn and(self, other: Expr) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Expr) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// Attribute names referenced anywhere in the tree.
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Attribute { name } => out.push(name),
            Expr::Binary { left, right, .. } => {
                left.collect_attributes(out);
                right.collect_attributes(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => {
                expr.collect_attributes(out);
            }
            Expr::Literal(_) | Expr::Raw(_) => {}
        }
    }

    // ==================== SQL Rendering ====================

    /// Render as a WHERE fragment for `descriptor`'s table.
    pub fn to_sql_fragment(&self, descriptor: &Descriptor, dialect: Dialect) -> Result<SqlFragment> {
        let mut params = Vec::new();
        let text = self.build(descriptor, dialect, &mut params, 0)?;
        Ok(SqlFragment { text, params })
    }

    /// Render into an existing parameter list; placeholders continue after
    /// `offset + params.len()`.
    pub fn build(
        &self,
        descriptor: &Descriptor,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> Result<String> {
        match self {
            Expr::Attribute { name } => {
                let (_, mapping) = descriptor.attribute(name)?;
                Ok(dialect.quote_identifier(mapping.column()))
            }

            Expr::Literal(value) => {
                params.push(value.clone());
                Ok(dialect.placeholder(offset + params.len()))
            }

            Expr::Binary { left, op, right } => {
                let left_sql = left.build_operand(*op, descriptor, dialect, params, offset)?;
                let right_sql = right.build_operand(*op, descriptor, dialect, params, offset)?;
                Ok(format!("{left_sql} {} {right_sql}", op.sql()))
            }

            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => {
                let inner = expr.build(descriptor, dialect, params, offset)?;
                if expr.is_compound() {
                    Ok(format!("NOT ({inner})"))
                } else {
                    Ok(format!("NOT {inner}"))
                }
            }

            Expr::IsNull { expr, negated } => {
                let inner = expr.build(descriptor, dialect, params, offset)?;
                let inner = if expr.is_compound() {
                    format!("({inner})")
                } else {
                    inner
                };
                if *negated {
                    Ok(format!("{inner} IS NOT NULL"))
                } else {
                    Ok(format!("{inner} IS NULL"))
                }
            }

            Expr::Raw(sql) => Ok(sql.clone()),
        }
    }

    /// Render a child of a binary node, parenthesizing when it binds looser
    /// than (or as loosely as, for comparisons) its parent.
    fn build_operand(
        &self,
        parent: BinaryOp,
        descriptor: &Descriptor,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> Result<String> {
        let sql = self.build(descriptor, dialect, params, offset)?;
        let needs_parens = match self {
            Expr::Binary { op, .. } => {
                op.precedence() < parent.precedence()
                    || (parent.is_comparison() && op.is_comparison())
            }
            Expr::Unary { .. } | Expr::IsNull { .. } => parent.is_comparison(),
            _ => false,
        };
        Ok(if needs_parens { format!("({sql})") } else { sql })
    }

    fn is_compound(&self) -> bool {
        matches!(
            self,
            Expr::Binary { .. } | Expr::Unary { .. } | Expr::IsNull { .. }
        )
    }

    // ==================== In-memory Evaluation ====================

    /// Classify one object's state.
    ///
    /// Attributes absent from the object's variant evaluate as NULL, which is
    /// what the database stores in their columns.
    pub fn evaluate(&self, descriptor: &Descriptor, state: &ObjectState) -> Result<Truth> {
        match self {
            Expr::Binary { left, op, right } if !op.is_comparison() => {
                let l = left.evaluate(descriptor, state)?;
                let r = right.evaluate(descriptor, state)?;
                Ok(if *op == BinaryOp::And { l.and(r) } else { l.or(r) })
            }

            Expr::Binary { left, op, right } => {
                let l = left.operand(descriptor, state)?;
                let r = right.operand(descriptor, state)?;
                match compare_values(&l, &r) {
                    Ok(Some(ordering)) => Ok(Truth::from_bool(op.matches(ordering))),
                    Ok(None) => Ok(Truth::Unknown),
                    Err(message) => Err(conflict(descriptor, message)),
                }
            }

            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => Ok(expr.evaluate(descriptor, state)?.not()),

            Expr::IsNull { expr, negated } => {
                let is_null = expr.operand(descriptor, state)?.is_null();
                Ok(Truth::from_bool(is_null != *negated))
            }

            Expr::Attribute { .. } | Expr::Literal(_) => {
                match self.operand(descriptor, state)? {
                    Value::Null => Ok(Truth::Unknown),
                    Value::Bool(b) => Ok(Truth::from_bool(b)),
                    other => Err(conflict(
                        descriptor,
                        format!("{} value used as a condition", other.type_name()),
                    )),
                }
            }

            Expr::Raw(sql) => Err(conflict(
                descriptor,
                format!("raw SQL '{}' cannot be evaluated in memory", sql),
            )),
        }
    }

    /// Evaluate in value position.
    fn operand(&self, descriptor: &Descriptor, state: &ObjectState) -> Result<Value> {
        match self {
            Expr::Attribute { name } => {
                let (index, _) = descriptor.attribute(name)?;
                Ok(state.get(index).cloned().unwrap_or(Value::Null))
            }
            Expr::Literal(value) => Ok(value.clone()),
            _ => Ok(self.evaluate(descriptor, state)?.into_value()),
        }
    }
}

fn conflict(descriptor: &Descriptor, message: String) -> Error {
    Error::ConformanceConflict(ConformanceError {
        entity: descriptor.entity().to_string(),
        message,
    })
}

/// Order two values the way SQL would, `None` when either is NULL.
///
/// Integers compare exactly; mixed integer and floating-point operands
/// compare as f64. Text compares by byte order. Values of unrelated types are
/// an error rather than silently unequal.
pub fn compare_values(a: &Value, b: &Value) -> std::result::Result<Option<Ordering>, String> {
    if a.is_null() || b.is_null() {
        return Ok(None);
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Ok(Some(x.cmp(&y)));
    }
    if a.is_numeric() && b.is_numeric() {
        return match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(x.partial_cmp(&y)),
            _ => Err(format!("cannot compare {} with {}", a, b)),
        };
    }
    let ordering = match (a, b) {
        (Value::Text(x), Value::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        _ => {
            return Err(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ));
        }
    };
    Ok(Some(ordering))
}

macro_rules! literal_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Literal(Value::from(v))
                }
            }
        )*
    };
}

literal_from!(Value, &str, String, i32, i64, bool, f64);
