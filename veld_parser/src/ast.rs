//! Untyped SQL AST
//!
//! The planner binds these shapes against the catalog; nothing here knows
//! about types or nullability.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub projections: Vec<Projection>,
    pub from: Vec<TableRef>,
    pub where_clause: Option<AstExpr>,
    pub group_by: Vec<AstExpr>,
    pub order_by: Vec<OrderByItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// `SELECT *`
    Star,
    Expr { expr: AstExpr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expr: AstExpr,
    pub asc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AstBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    And,
    Or,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AstUnaryOp {
    Not,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AstExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    BoolLiteral(bool),
    /// `DATE 'yyyy-mm-dd'`, kept as calendar parts until planning.
    DateLiteral {
        year: i32,
        month: i32,
        day: i32,
    },
    NullLiteral,
    Binary {
        op: AstBinaryOp,
        left: Box<AstExpr>,
        right: Box<AstExpr>,
    },
    Unary {
        op: AstUnaryOp,
        expr: Box<AstExpr>,
    },
    Case {
        branches: Vec<(AstExpr, AstExpr)>,
        else_expr: Option<Box<AstExpr>>,
    },
    Aggregate {
        func: AggFunc,
        /// None is `COUNT(*)`.
        arg: Option<Box<AstExpr>>,
    },
    In {
        expr: Box<AstExpr>,
        list: Vec<AstExpr>,
    },
    /// `EXTRACT(YEAR FROM expr)`
    ExtractYear {
        expr: Box<AstExpr>,
    },
    /// `expr REGEXP 'pattern'`
    Regexp {
        expr: Box<AstExpr>,
        pattern: String,
    },
}
