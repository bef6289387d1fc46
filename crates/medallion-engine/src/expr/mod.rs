//! Row expression language used by derived columns and expectations.
//!
//! A small SQL-flavoured dialect: literals, column references, arithmetic,
//! comparisons, `AND`/`OR`/`NOT`, `IS [NOT] NULL`, and a handful of scalar
//! functions (`current_date()`, `datediff`, `coalesce`, `abs`). Expressions
//! are parsed once at pipeline build time and evaluated per record.

mod eval;
mod lexer;
mod parser;

use std::collections::BTreeSet;
use std::fmt;

use medallion_types::Value;

pub use eval::{EvalContext, Truth};

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Binary operators, in no particular precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
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
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// Unit argument of `datediff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Year,
    Month,
    Day,
}

impl DatePart {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "year" | "years" | "yy" | "yyyy" => Some(Self::Year),
            "month" | "months" | "mm" => Some(Self::Month),
            "day" | "days" | "dd" => Some(Self::Day),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Column reference. Table qualifiers (`a.col`) are stripped at parse time.
    Column(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    CurrentDate,
    DateDiff {
        part: DatePart,
        start: Box<Expr>,
        end: Box<Expr>,
    },
    Coalesce(Vec<Expr>),
    Abs(Box<Expr>),
}

/// Expression that failed to tokenize or parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid expression at offset {offset}: {message}")]
pub struct ExpressionError {
    pub message: String,
    /// Byte offset into the source text.
    pub offset: usize,
}

impl ExpressionError {
    pub(crate) fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

impl Expr {
    /// Parse `source` into an expression tree.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] for unknown tokens, unbalanced
    /// parentheses, unknown functions, or wrong function arity.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = lexer::tokenize(source)?;
        parser::Parser::new(tokens).parse()
    }

    /// Names of every column the expression reads.
    #[must_use]
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Literal(_) | Self::CurrentDate => {}
            Self::Column(name) => {
                out.insert(name);
            }
            Self::Unary { expr, .. } | Self::IsNull { expr, .. } | Self::Abs(expr) => {
                expr.collect_columns(out);
            }
            Self::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Self::DateDiff { start, end, .. } => {
                start.collect_columns(out);
                end.collect_columns(out);
            }
            Self::Coalesce(args) => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(Value::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Literal(Value::Date(d)) => write!(f, "DATE '{}'", Value::Date(*d)),
            Self::Literal(Value::Float(v)) if v.fract() == 0.0 && v.is_finite() => {
                write!(f, "{v:.1}")
            }
            Self::Literal(v) => write!(f, "{v}"),
            Self::Column(name) if lexer::is_plain_identifier(name) => f.write_str(name),
            Self::Column(name) => write!(f, "\"{}\"", name.replace('"', "\"\"")),
            Self::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-({expr})"),
            Self::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "NOT ({expr})"),
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::IsNull { expr, negated } => {
                write!(f, "({expr} IS {}NULL)", if *negated { "NOT " } else { "" })
            }
            Self::CurrentDate => f.write_str("current_date()"),
            Self::DateDiff { part, start, end } => {
                write!(f, "datediff({}, {start}, {end})", part.as_str())
            }
            Self::Coalesce(args) => {
                f.write_str("coalesce(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Self::Abs(expr) => write!(f, "abs({expr})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_collected_without_qualifiers() {
        let expr = Expr::parse("a.current_premium > b.fixed_expenses AND current_premium > 0")
            .unwrap();
        let cols: Vec<_> = expr.columns().into_iter().collect();
        assert_eq!(cols, vec!["current_premium", "fixed_expenses"]);
    }

    #[test]
    fn display_reparses_to_same_tree() {
        for source in [
            "customer_age < 100 and customer_age > 0",
            "datediff(year, birthdate, current_date())",
            "coalesce(town, 'unknown') != 'x' OR NOT premium IS NULL",
            "abs(-3 * (a + 2.5)) >= DATE '2024-01-01'",
        ] {
            let expr = Expr::parse(source).unwrap();
            let again = Expr::parse(&expr.to_string()).unwrap();
            assert_eq!(expr, again, "{source}");
        }
    }

    #[test]
    fn error_reports_offset() {
        let err = Expr::parse("premium > ").unwrap_err();
        assert_eq!(err.offset, 10);
        assert!(err.to_string().contains("offset 10"));
    }
}
