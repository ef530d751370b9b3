//! Recursive-descent SQL parser

use veld_common::{VeldError, VeldResult};

use crate::ast::*;
use crate::lexer::Lexer;
use crate::token::{Position, Token, TokenType};

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

/// Parses a `;`-separated list of statements.
pub fn parse(source: &str) -> VeldResult<Vec<Statement>> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_statements()
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse_statements(&mut self) -> VeldResult<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.check(&TokenType::Eof) {
            statements.push(Statement::Select(self.parse_select()?));
            while self.matches(&TokenType::Semicolon) {}
        }
        Ok(statements)
    }

    fn parse_select(&mut self) -> VeldResult<SelectStatement> {
        // Constructs outside the supported dialect are rejected as plan
        // errors so later statements still run.
        if self.check(&TokenType::With) {
            return Err(VeldError::plan_error("unsupported construct: CTE"));
        }
        self.expect(TokenType::Select, "expected SELECT")?;
        if self.check(&TokenType::Distinct) {
            return Err(VeldError::plan_error("unsupported construct: DISTINCT"));
        }
        if self.check(&TokenType::Values) {
            return Err(VeldError::plan_error("unsupported construct: VALUES"));
        }

        let mut projections = Vec::new();
        loop {
            if self.matches(&TokenType::Star) {
                projections.push(Projection::Star);
            } else {
                let expr = self.parse_expr()?;
                let alias = if self.matches(&TokenType::As) {
                    Some(self.expect_identifier("expected alias after AS")?)
                } else {
                    None
                };
                projections.push(Projection::Expr { expr, alias });
            }
            if !self.matches(&TokenType::Comma) {
                break;
            }
        }

        if self.check(&TokenType::Into) {
            return Err(VeldError::plan_error("unsupported construct: SELECT INTO"));
        }

        self.expect(TokenType::From, "expected FROM")?;
        let mut from = Vec::new();
        loop {
            let name = self.expect_identifier("expected table name")?;
            let alias = if self.matches(&TokenType::As) {
                Some(self.expect_identifier("expected alias after AS")?)
            } else if let TokenType::Identifier(_) = self.peek().ty {
                Some(self.expect_identifier("expected alias")?)
            } else {
                None
            };
            from.push(TableRef { name, alias });
            if !self.matches(&TokenType::Comma) {
                break;
            }
        }

        let where_clause = if self.matches(&TokenType::Where) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.matches(&TokenType::Group) {
            self.expect(TokenType::By, "expected BY after GROUP")?;
            loop {
                group_by.push(self.parse_expr()?);
                if !self.matches(&TokenType::Comma) {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.matches(&TokenType::Order) {
            self.expect(TokenType::By, "expected BY after ORDER")?;
            loop {
                let expr = self.parse_expr()?;
                let asc = if self.matches(&TokenType::Desc) {
                    false
                } else {
                    self.matches(&TokenType::Asc);
                    true
                };
                order_by.push(OrderByItem { expr, asc });
                if !self.matches(&TokenType::Comma) {
                    break;
                }
            }
        }

        Ok(SelectStatement { projections, from, where_clause, group_by, order_by })
    }

    // ---- expressions, loosest binding first ----

    pub fn parse_expr(&mut self) -> VeldResult<AstExpr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> VeldResult<AstExpr> {
        let mut left = self.parse_and()?;
        while self.matches(&TokenType::Or) {
            let right = self.parse_and()?;
            left = AstExpr::Binary {
                op: AstBinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> VeldResult<AstExpr> {
        let mut left = self.parse_not()?;
        while self.matches(&TokenType::And) {
            let right = self.parse_not()?;
            left = AstExpr::Binary {
                op: AstBinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> VeldResult<AstExpr> {
        if self.matches(&TokenType::Not) {
            let expr = self.parse_not()?;
            return Ok(AstExpr::Unary { op: AstUnaryOp::Not, expr: Box::new(expr) });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> VeldResult<AstExpr> {
        let left = self.parse_additive()?;

        let op = match self.peek().ty {
            TokenType::Eq => Some(AstBinaryOp::Eq),
            TokenType::Neq => Some(AstBinaryOp::Neq),
            TokenType::Lt => Some(AstBinaryOp::Lt),
            TokenType::Leq => Some(AstBinaryOp::Leq),
            TokenType::Gt => Some(AstBinaryOp::Gt),
            TokenType::Geq => Some(AstBinaryOp::Geq),
            TokenType::Like => Some(AstBinaryOp::Like),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            return Ok(AstExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }

        if self.matches(&TokenType::Regexp) {
            let pattern = match self.advance().ty.clone() {
                TokenType::StringLiteral(s) => s,
                _ => return Err(self.error("REGEXP requires a string pattern")),
            };
            return Ok(AstExpr::Regexp { expr: Box::new(left), pattern });
        }

        if self.matches(&TokenType::In) {
            self.expect(TokenType::LeftParen, "expected ( after IN")?;
            let mut list = Vec::new();
            loop {
                list.push(self.parse_expr()?);
                if !self.matches(&TokenType::Comma) {
                    break;
                }
            }
            self.expect(TokenType::RightParen, "expected ) after IN list")?;
            return Ok(AstExpr::In { expr: Box::new(left), list });
        }

        if self.matches(&TokenType::Is) {
            let negated = self.matches(&TokenType::Not);
            self.expect(TokenType::Null, "expected NULL after IS")?;
            let op = if negated { AstUnaryOp::IsNotNull } else { AstUnaryOp::IsNull };
            return Ok(AstExpr::Unary { op, expr: Box::new(left) });
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> VeldResult<AstExpr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().ty {
                TokenType::Plus => AstBinaryOp::Add,
                TokenType::Minus => AstBinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = AstExpr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_multiplicative(&mut self) -> VeldResult<AstExpr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().ty {
                TokenType::Star => AstBinaryOp::Mul,
                TokenType::Slash => AstBinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = AstExpr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_unary(&mut self) -> VeldResult<AstExpr> {
        if self.matches(&TokenType::Minus) {
            // Fold a leading minus into the literal where possible.
            return Ok(match self.parse_unary()? {
                AstExpr::IntLiteral(v) => AstExpr::IntLiteral(-v),
                AstExpr::FloatLiteral(v) => AstExpr::FloatLiteral(-v),
                other => AstExpr::Binary {
                    op: AstBinaryOp::Sub,
                    left: Box::new(AstExpr::IntLiteral(0)),
                    right: Box::new(other),
                },
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> VeldResult<AstExpr> {
        let token = self.advance().clone();
        match token.ty {
            TokenType::IntLiteral(v) => Ok(AstExpr::IntLiteral(v)),
            TokenType::FloatLiteral(v) => Ok(AstExpr::FloatLiteral(v)),
            TokenType::StringLiteral(s) => Ok(AstExpr::StringLiteral(s)),
            TokenType::True => Ok(AstExpr::BoolLiteral(true)),
            TokenType::False => Ok(AstExpr::BoolLiteral(false)),
            TokenType::Null => Ok(AstExpr::NullLiteral),

            TokenType::Date => {
                let text = match self.advance().ty.clone() {
                    TokenType::StringLiteral(s) => s,
                    _ => return Err(self.error("DATE requires a 'yyyy-mm-dd' literal")),
                };
                parse_date_literal(&text, token.pos)
            }

            TokenType::Case => {
                let mut branches = Vec::new();
                while self.matches(&TokenType::When) {
                    let cond = self.parse_expr()?;
                    self.expect(TokenType::Then, "expected THEN")?;
                    let value = self.parse_expr()?;
                    branches.push((cond, value));
                }
                let else_expr = if self.matches(&TokenType::Else) {
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                self.expect(TokenType::End, "expected END")?;
                if branches.is_empty() {
                    return Err(self.error("CASE requires at least one WHEN branch"));
                }
                Ok(AstExpr::Case { branches, else_expr })
            }

            TokenType::Extract => {
                self.expect(TokenType::LeftParen, "expected ( after EXTRACT")?;
                self.expect(TokenType::Year, "only EXTRACT(YEAR FROM ...) is supported")?;
                self.expect(TokenType::From, "expected FROM in EXTRACT")?;
                let expr = self.parse_expr()?;
                self.expect(TokenType::RightParen, "expected ) after EXTRACT")?;
                Ok(AstExpr::ExtractYear { expr: Box::new(expr) })
            }

            TokenType::Sum | TokenType::Avg | TokenType::Min | TokenType::Max
            | TokenType::Count => {
                let func = match token.ty {
                    TokenType::Sum => AggFunc::Sum,
                    TokenType::Avg => AggFunc::Avg,
                    TokenType::Min => AggFunc::Min,
                    TokenType::Max => AggFunc::Max,
                    _ => AggFunc::Count,
                };
                self.expect(TokenType::LeftParen, "expected ( after aggregate")?;
                let arg = if func == AggFunc::Count && self.matches(&TokenType::Star) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                self.expect(TokenType::RightParen, "expected ) after aggregate")?;
                Ok(AstExpr::Aggregate { func, arg })
            }

            TokenType::Identifier(first) => {
                if self.matches(&TokenType::Dot) {
                    let name = self.expect_identifier("expected column after '.'")?;
                    Ok(AstExpr::Column { table: Some(first), name })
                } else {
                    Ok(AstExpr::Column { table: None, name: first })
                }
            }

            TokenType::LeftParen => {
                let expr = self.parse_expr()?;
                self.expect(TokenType::RightParen, "expected )")?;
                Ok(expr)
            }

            TokenType::Over => Err(VeldError::plan_error("unsupported construct: window function")),
            TokenType::Nullif => Err(VeldError::plan_error("unsupported construct: NULLIF")),
            TokenType::Similar => Err(VeldError::plan_error("unsupported construct: SIMILAR")),

            other => Err(VeldError::parse_error(format!(
                "unexpected token {other:?} at {}",
                token.pos
            ))),
        }
    }

    // ---- helpers ----

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.current.min(self.tokens.len() - 1)];
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        token
    }

    fn check(&self, ty: &TokenType) -> bool {
        &self.peek().ty == ty
    }

    fn matches(&mut self, ty: &TokenType) -> bool {
        if self.check(ty) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ty: TokenType, message: &str) -> VeldResult<()> {
        if self.matches(&ty) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn expect_identifier(&mut self, message: &str) -> VeldResult<String> {
        match self.peek().ty.clone() {
            TokenType::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    fn error(&self, message: &str) -> VeldError {
        let pos = self.peek().pos;
        VeldError::parse_error(format!("{message} at {pos}"))
    }
}

fn parse_date_literal(text: &str, pos: Position) -> VeldResult<AstExpr> {
    let parts: Vec<&str> = text.split('-').collect();
    if parts.len() == 3 {
        if let (Ok(year), Ok(month), Ok(day)) =
            (parts[0].parse(), parts[1].parse(), parts[2].parse())
        {
            return Ok(AstExpr::DateLiteral { year, month, day });
        }
    }
    Err(VeldError::parse_error(format!(
        "bad date literal '{text}' at {pos} (expected yyyy-mm-dd)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(source: &str) -> SelectStatement {
        match parse(source).unwrap().remove(0) {
            Statement::Select(s) => s,
        }
    }

    #[test]
    fn test_simple_select() {
        let s = select("SELECT SUM(x), SUM(y) FROM t WHERE x < 3");
        assert_eq!(s.projections.len(), 2);
        assert_eq!(s.from.len(), 1);
        assert_eq!(s.from[0].name, "t");
        assert!(s.where_clause.is_some());
    }

    #[test]
    fn test_join_with_aliases() {
        let s = select("SELECT a.v, b.w FROM a, b WHERE a.k = b.k");
        assert_eq!(s.from.len(), 2);
        let w = s.where_clause.unwrap();
        match w {
            AstExpr::Binary { op: AstBinaryOp::Eq, left, right } => {
                assert_eq!(
                    *left,
                    AstExpr::Column { table: Some("a".into()), name: "k".into() }
                );
                assert_eq!(
                    *right,
                    AstExpr::Column { table: Some("b".into()), name: "k".into() }
                );
            }
            other => panic!("expected equality, got {other:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        // a + b * c < d AND e => ((a + (b*c)) < d) AND e
        let s = select("SELECT 1 FROM t WHERE a + b * c < d AND e");
        match s.where_clause.unwrap() {
            AstExpr::Binary { op: AstBinaryOp::And, left, .. } => match *left {
                AstExpr::Binary { op: AstBinaryOp::Lt, left, .. } => match *left {
                    AstExpr::Binary { op: AstBinaryOp::Add, right, .. } => match *right {
                        AstExpr::Binary { op: AstBinaryOp::Mul, .. } => {}
                        other => panic!("expected mul, got {other:?}"),
                    },
                    other => panic!("expected add, got {other:?}"),
                },
                other => panic!("expected lt, got {other:?}"),
            },
            other => panic!("expected and, got {other:?}"),
        }
    }

    #[test]
    fn test_date_and_extract() {
        let s = select(
            "SELECT EXTRACT(YEAR FROM x) FROM d WHERE x >= DATE '2021-01-01' ORDER BY x",
        );
        assert!(matches!(
            s.projections[0],
            Projection::Expr { expr: AstExpr::ExtractYear { .. }, .. }
        ));
        match s.where_clause.unwrap() {
            AstExpr::Binary { op: AstBinaryOp::Geq, right, .. } => {
                assert_eq!(
                    *right,
                    AstExpr::DateLiteral { year: 2021, month: 1, day: 1 }
                );
            }
            other => panic!("expected >=, got {other:?}"),
        }
        assert_eq!(s.order_by.len(), 1);
        assert!(s.order_by[0].asc);
    }

    #[test]
    fn test_like_and_in_and_case() {
        let s = select(
            "SELECT CASE WHEN c LIKE 'foo%' THEN 1 ELSE 0 END FROM r WHERE x IN (1, 2, 3)",
        );
        assert!(matches!(
            s.projections[0],
            Projection::Expr { expr: AstExpr::Case { .. }, .. }
        ));
        assert!(matches!(s.where_clause.unwrap(), AstExpr::In { .. }));
    }

    #[test]
    fn test_count_star_and_group_by() {
        let s = select("SELECT k, COUNT(*) FROM t GROUP BY k");
        assert_eq!(s.group_by.len(), 1);
        assert!(matches!(
            s.projections[1],
            Projection::Expr { expr: AstExpr::Aggregate { func: AggFunc::Count, arg: None }, .. }
        ));
    }

    #[test]
    fn test_multiple_statements() {
        let statements = parse("SELECT 1 FROM t; SELECT 2 FROM u;").unwrap();
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_unsupported_constructs_are_plan_errors() {
        for source in [
            "WITH x AS (SELECT 1 FROM t) SELECT 1 FROM x",
            "SELECT DISTINCT x FROM t",
            "SELECT x INTO y FROM t",
        ] {
            match parse(source) {
                Err(VeldError::PlanError { .. }) => {}
                other => panic!("expected plan error for {source}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_error_carries_position() {
        let err = parse("SELECT FROM").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("line 1"), "{message}");
    }

    #[test]
    fn test_is_null_and_not() {
        let s = select("SELECT 1 FROM t WHERE x IS NOT NULL AND NOT y IS NULL");
        assert!(matches!(s.where_clause.unwrap(), AstExpr::Binary { op: AstBinaryOp::And, .. }));
    }
}
