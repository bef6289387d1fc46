//! Recursive-descent expression parser.
//!
//! Precedence, loosest first: `OR`, `AND`, `NOT`, comparison and
//! `IS [NOT] NULL`, `+ -`, `* /`, unary minus, primary.

use chrono::NaiveDate;
use medallion_types::value::DATE_FORMAT;
use medallion_types::Value;

use super::lexer::{Token, TokenKind};
use super::{BinaryOp, DatePart, Expr, ExpressionError, UnaryOp};

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or_expr()?;
        if !self.is_at_end() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn parse_or_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and_expr()?;
        while self.check_keyword("OR") {
            self.advance();
            let right = self.parse_and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not_expr()?;
        while self.check_keyword("AND") {
            self.advance();
            let right = self.parse_not_expr()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr, ExpressionError> {
        if self.check_keyword("NOT") {
            self.advance();
            let expr = self.parse_not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_additive()?;

        if self.check_keyword("IS") {
            self.advance();
            let negated = self.check_keyword("NOT");
            if negated {
                self.advance();
            }
            if !self.check_keyword("NULL") {
                return Err(self.error("expected NULL after IS"));
            }
            self.advance();
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let op = match self.current().kind {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.check(&TokenKind::Minus) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Integer(v) => {
                self.advance();
                Ok(Expr::Literal(Value::Integer(v)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(v)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::String(s)))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_or_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::QuotedIdent(name) => {
                self.advance();
                self.parse_column_tail(name)
            }
            TokenKind::Ident(name) => {
                self.advance();
                match name.to_ascii_uppercase().as_str() {
                    "NULL" => Ok(Expr::Literal(Value::Null)),
                    "TRUE" => Ok(Expr::Literal(Value::Boolean(true))),
                    "FALSE" => Ok(Expr::Literal(Value::Boolean(false))),
                    "DATE" if matches!(self.current().kind, TokenKind::Str(_)) => {
                        self.parse_date_literal()
                    }
                    "AND" | "OR" | "NOT" | "IS" => Err(ExpressionError::new(
                        format!("unexpected keyword {name}"),
                        token.offset,
                    )),
                    _ if self.check(&TokenKind::LParen) => self.parse_call(&name, token.offset),
                    _ => self.parse_column_tail(name),
                }
            }
            TokenKind::Eof => Err(self.error("unexpected end of expression")),
            _ => Err(self.error("expected a value, column, or '('")),
        }
    }

    /// `qualifier.column` keeps only the column name.
    fn parse_column_tail(&mut self, name: String) -> Result<Expr, ExpressionError> {
        if !self.check(&TokenKind::Dot) {
            return Ok(Expr::Column(name));
        }
        self.advance();
        match self.current().kind.clone() {
            TokenKind::Ident(column) | TokenKind::QuotedIdent(column) => {
                self.advance();
                Ok(Expr::Column(column))
            }
            _ => Err(self.error("expected column name after '.'")),
        }
    }

    fn parse_date_literal(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.current().offset;
        let TokenKind::Str(raw) = self.current().kind.clone() else {
            return Err(self.error("expected 'YYYY-MM-DD' after DATE"));
        };
        self.advance();
        NaiveDate::parse_from_str(&raw, DATE_FORMAT)
            .map(|d| Expr::Literal(Value::Date(d)))
            .map_err(|_| ExpressionError::new(format!("invalid date literal '{raw}'"), offset))
    }

    fn parse_call(&mut self, name: &str, offset: usize) -> Result<Expr, ExpressionError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let lowered = name.to_ascii_lowercase();

        let expr = match lowered.as_str() {
            "current_date" => Expr::CurrentDate,
            "datediff" => {
                let part = self.parse_date_part()?;
                self.expect(&TokenKind::Comma, "','")?;
                let start = self.parse_or_expr()?;
                self.expect(&TokenKind::Comma, "','")?;
                let end = self.parse_or_expr()?;
                Expr::DateDiff {
                    part,
                    start: Box::new(start),
                    end: Box::new(end),
                }
            }
            "coalesce" => {
                let mut args = vec![self.parse_or_expr()?];
                while self.check(&TokenKind::Comma) {
                    self.advance();
                    args.push(self.parse_or_expr()?);
                }
                Expr::Coalesce(args)
            }
            "abs" => Expr::Abs(Box::new(self.parse_or_expr()?)),
            _ => {
                return Err(ExpressionError::new(
                    format!("unknown function '{name}'"),
                    offset,
                ));
            }
        };

        if !self.check(&TokenKind::RParen) {
            return Err(self.error(&format!("too many arguments to {lowered}()")));
        }
        self.advance();
        Ok(expr)
    }

    fn parse_date_part(&mut self) -> Result<DatePart, ExpressionError> {
        let part = match &self.current().kind {
            TokenKind::Ident(raw) | TokenKind::Str(raw) => DatePart::parse(raw),
            _ => None,
        };
        match part {
            Some(part) => {
                self.advance();
                Ok(part)
            }
            None => Err(self.error("expected date part (year, month, or day)")),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.pos += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn expect(&mut self, kind: &TokenKind, describe: &str) -> Result<(), ExpressionError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {describe}")))
        }
    }

    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::new(message, self.current().offset)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Expr {
        Expr::parse(source).unwrap()
    }

    fn col(name: &str) -> Box<Expr> {
        Box::new(Expr::Column(name.into()))
    }

    fn int(v: i64) -> Box<Expr> {
        Box::new(Expr::Literal(Value::Integer(v)))
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a = 1 OR b = 2 AND c = 3");
        let Expr::Binary {
            op: BinaryOp::Or,
            right,
            ..
        } = expr
        else {
            panic!("expected OR at the root");
        };
        assert!(matches!(
            *right,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        assert_eq!(
            parse("1 + 2 * 3"),
            Expr::Binary {
                op: BinaryOp::Add,
                left: int(1),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: int(2),
                    right: int(3),
                }),
            }
        );
    }

    #[test]
    fn lowercase_keywords_and_qualifiers() {
        assert_eq!(
            parse("a.customer_age < 100 and customer_age > 0"),
            Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(Expr::Binary {
                    op: BinaryOp::Lt,
                    left: col("customer_age"),
                    right: int(100),
                }),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Gt,
                    left: col("customer_age"),
                    right: int(0),
                }),
            }
        );
    }

    #[test]
    fn is_not_null() {
        assert_eq!(
            parse("town IS NOT NULL"),
            Expr::IsNull {
                expr: col("town"),
                negated: true
            }
        );
    }

    #[test]
    fn datediff_call() {
        assert_eq!(
            parse("datediff(YEAR, birthdate, current_date())"),
            Expr::DateDiff {
                part: DatePart::Year,
                start: col("birthdate"),
                end: Box::new(Expr::CurrentDate),
            }
        );
    }

    #[test]
    fn date_literal() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        assert_eq!(
            parse("DATE '2024-06-30'"),
            Expr::Literal(Value::Date(expected))
        );
        assert!(Expr::parse("DATE '2024-13-01'").is_err());
    }

    #[test]
    fn column_named_date_still_works() {
        assert_eq!(parse("date"), Expr::Column("date".into()));
    }

    #[test]
    fn unknown_function_is_rejected() {
        let err = Expr::parse("upper(town)").unwrap_err();
        assert!(err.message.contains("unknown function"));
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn arity_errors() {
        assert!(Expr::parse("abs(1, 2)").is_err());
        assert!(Expr::parse("current_date(1)").is_err());
        assert!(Expr::parse("datediff(week, a, b)").is_err());
        assert!(Expr::parse("coalesce()").is_err());
    }

    #[test]
    fn unbalanced_parentheses() {
        assert!(Expr::parse("(a > 1").is_err());
        assert!(Expr::parse("a > 1)").is_err());
    }
}
