//! Expression evaluation with SQL null semantics.

use std::cmp::Ordering;

use chrono::{Datelike, NaiveDate};
use medallion_types::value::DATE_FORMAT;
use medallion_types::{Record, Value};

use super::{BinaryOp, DatePart, Expr, UnaryOp};

/// Inputs an expression may read besides the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Value of `current_date()`. Fixed per trigger so reruns are reproducible.
    pub processing_date: NaiveDate,
}

impl EvalContext {
    #[must_use]
    pub fn new(processing_date: NaiveDate) -> Self {
        Self { processing_date }
    }
}

/// Three-valued predicate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Truth {
    True,
    False,
    /// The predicate read a null (or a non-boolean) and has no definite answer.
    Unknown,
}

impl Truth {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Boolean(true) => Self::True,
            Value::Boolean(false) => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl Expr {
    /// Evaluate against `record`. Any null operand yields `Null`, except in
    /// `AND`/`OR` (Kleene logic), `IS [NOT] NULL`, and `coalesce`.
    #[must_use]
    pub fn evaluate(&self, record: &Record, ctx: &EvalContext) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Column(name) => record.get(name).clone(),
            Self::CurrentDate => Value::Date(ctx.processing_date),
            Self::Unary { op, expr } => {
                let v = expr.evaluate(record, ctx);
                match op {
                    UnaryOp::Not => match Truth::from_value(&v) {
                        Truth::True => Value::Boolean(false),
                        Truth::False => Value::Boolean(true),
                        Truth::Unknown => Value::Null,
                    },
                    UnaryOp::Neg => match v {
                        Value::Integer(i) => i.checked_neg().map_or(Value::Null, Value::Integer),
                        Value::Float(f) => Value::Float(-f),
                        _ => Value::Null,
                    },
                }
            }
            Self::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = left.truth(record, ctx);
                    if l == Truth::False {
                        return Value::Boolean(false);
                    }
                    match (l, right.truth(record, ctx)) {
                        (_, Truth::False) => Value::Boolean(false),
                        (Truth::True, Truth::True) => Value::Boolean(true),
                        _ => Value::Null,
                    }
                }
                BinaryOp::Or => {
                    let l = left.truth(record, ctx);
                    if l == Truth::True {
                        return Value::Boolean(true);
                    }
                    match (l, right.truth(record, ctx)) {
                        (_, Truth::True) => Value::Boolean(true),
                        (Truth::False, Truth::False) => Value::Boolean(false),
                        _ => Value::Null,
                    }
                }
                _ => {
                    let l = left.evaluate(record, ctx);
                    let r = right.evaluate(record, ctx);
                    binary(*op, &l, &r)
                }
            },
            Self::IsNull { expr, negated } => {
                Value::Boolean(expr.evaluate(record, ctx).is_null() != *negated)
            }
            Self::DateDiff { part, start, end } => {
                match (
                    as_date(&start.evaluate(record, ctx)),
                    as_date(&end.evaluate(record, ctx)),
                ) {
                    (Some(s), Some(e)) => Value::Integer(datediff(*part, s, e)),
                    _ => Value::Null,
                }
            }
            Self::Coalesce(args) => args
                .iter()
                .map(|arg| arg.evaluate(record, ctx))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null),
            Self::Abs(expr) => match expr.evaluate(record, ctx) {
                Value::Integer(i) => i.checked_abs().map_or(Value::Null, Value::Integer),
                Value::Float(f) => Value::Float(f.abs()),
                _ => Value::Null,
            },
        }
    }

    /// Evaluate as a predicate.
    #[must_use]
    pub fn truth(&self, record: &Record, ctx: &EvalContext) -> Truth {
        Truth::from_value(&self.evaluate(record, ctx))
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, l, r),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            compare(op, l, r)
        }
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let (Value::Integer(a), Value::Integer(b)) = (l, r) {
        let checked = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        if let Some(v) = checked {
            return Value::Integer(v);
        }
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Value::Null;
    };
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Value::Null,
        BinaryOp::Div => a / b,
        _ => return Value::Null,
    };
    Value::Float(v)
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Value {
    let ordering = match (l, r) {
        (Value::Date(_), Value::String(_)) => as_date(r).and_then(|d| l.compare(&Value::Date(d))),
        (Value::String(_), Value::Date(_)) => as_date(l).and_then(|d| Value::Date(d).compare(r)),
        _ => l.compare(r),
    };
    let Some(ordering) = ordering else {
        return Value::Null;
    };
    Value::Boolean(match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::Ne => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => return Value::Null,
    })
}

fn as_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok(),
        _ => None,
    }
}

/// Whole units elapsed from `start` to `end`; negative when `end < start`.
fn datediff(part: DatePart, start: NaiveDate, end: NaiveDate) -> i64 {
    if end < start {
        return -datediff(part, end, start);
    }
    match part {
        DatePart::Day => (end - start).num_days(),
        DatePart::Month => {
            let mut months = i64::from(end.year() - start.year()) * 12
                + i64::from(end.month()) - i64::from(start.month());
            if end.day() < start.day() {
                months -= 1;
            }
            months
        }
        DatePart::Year => {
            let mut years = i64::from(end.year() - start.year());
            if (end.month(), end.day()) < (start.month(), start.day()) {
                years -= 1;
            }
            years
        }
    }
}
