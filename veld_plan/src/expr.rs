//! Typed scalar expressions
//!
//! Every expression carries its SQL type and nullability. Column references
//! name a child operator's output slot; virtual column references bind to
//! the enclosing translator's virtual-schema slot (scan columns, aggregate
//! slots).

use veld_catalog::SqlType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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
    StartsWith,
    EndsWith,
    Contains,
    Like,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Leq | BinaryOp::Gt
                | BinaryOp::Geq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f64),
    Bool(bool),
    /// Julian day number.
    Date(i32),
    Text(String),
    /// A typed NULL.
    Null(SqlType),
}

impl Literal {
    pub fn ty(&self) -> SqlType {
        match self {
            Literal::SmallInt(_) => SqlType::SmallInt,
            Literal::Int(_) => SqlType::Int,
            Literal::BigInt(_) => SqlType::BigInt,
            Literal::Real(_) => SqlType::Real,
            Literal::Bool(_) => SqlType::Boolean,
            Literal::Date(_) => SqlType::Date,
            Literal::Text(_) => SqlType::Text,
            Literal::Null(ty) => *ty,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    ColumnRef {
        child: usize,
        column: usize,
        ty: SqlType,
        nullable: bool,
    },
    VirtualColumnRef {
        column: usize,
        ty: SqlType,
        nullable: bool,
    },
    Literal(Literal),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        ty: SqlType,
        nullable: bool,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Case {
        ty: SqlType,
        nullable: bool,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Aggregate {
        func: AggregateFunc,
        ty: SqlType,
        arg: Option<Box<Expr>>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Literal>,
    },
    /// EXTRACT(YEAR FROM date)
    ExtractYear {
        expr: Box<Expr>,
    },
    Regexp {
        expr: Box<Expr>,
        pattern: String,
    },
}

impl Expr {
    pub fn ty(&self) -> SqlType {
        match self {
            Expr::ColumnRef { ty, .. } | Expr::VirtualColumnRef { ty, .. } => *ty,
            Expr::Literal(lit) => lit.ty(),
            Expr::Unary { .. } => SqlType::Boolean,
            Expr::Binary { ty, .. } => *ty,
            Expr::Case { ty, .. } => *ty,
            Expr::Aggregate { ty, .. } => *ty,
            Expr::In { .. } => SqlType::Boolean,
            Expr::ExtractYear { .. } => SqlType::Int,
            Expr::Regexp { .. } => SqlType::Boolean,
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            Expr::ColumnRef { nullable, .. } | Expr::VirtualColumnRef { nullable, .. } => *nullable,
            Expr::Literal(lit) => lit.is_null(),
            // IS NULL itself is never null; NOT propagates.
            Expr::Unary { op, expr } => match op {
                UnaryOp::IsNull => false,
                UnaryOp::Not => expr.nullable(),
            },
            Expr::Binary { nullable, .. } => *nullable,
            Expr::Case { nullable, .. } => *nullable,
            Expr::Aggregate { arg, .. } => arg.as_deref().map(Expr::nullable).unwrap_or(false),
            Expr::In { expr, .. } => expr.nullable(),
            Expr::ExtractYear { expr } => expr.nullable(),
            Expr::Regexp { expr, .. } => expr.nullable(),
        }
    }

    /// Walks the expression tree, visiting every node.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Unary { expr, .. }
            | Expr::ExtractYear { expr }
            | Expr::Regexp { expr, .. } => expr.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Case { branches, else_expr, .. } => {
                for (cond, value) in branches {
                    cond.visit(f);
                    value.visit(f);
                }
                if let Some(e) = else_expr {
                    e.visit(f);
                }
            }
            Expr::Aggregate { arg, .. } => {
                if let Some(a) = arg {
                    a.visit(f);
                }
            }
            Expr::In { expr, .. } => expr.visit(f),
            Expr::ColumnRef { .. } | Expr::VirtualColumnRef { .. } | Expr::Literal(_) => {}
        }
    }

    /// Rewrites every node bottom-up through `f`.
    pub fn rewrite(self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Unary { op, expr } => Expr::Unary { op, expr: Box::new(expr.rewrite(f)) },
            Expr::Binary { op, ty, nullable, left, right } => Expr::Binary {
                op,
                ty,
                nullable,
                left: Box::new(left.rewrite(f)),
                right: Box::new(right.rewrite(f)),
            },
            Expr::Case { ty, nullable, branches, else_expr } => Expr::Case {
                ty,
                nullable,
                branches: branches
                    .into_iter()
                    .map(|(c, v)| (c.rewrite(f), v.rewrite(f)))
                    .collect(),
                else_expr: else_expr.map(|e| Box::new(e.rewrite(f))),
            },
            Expr::Aggregate { func, ty, arg } => Expr::Aggregate {
                func,
                ty,
                arg: arg.map(|a| Box::new(a.rewrite(f))),
            },
            Expr::In { expr, list } => Expr::In { expr: Box::new(expr.rewrite(f)), list },
            Expr::ExtractYear { expr } => Expr::ExtractYear { expr: Box::new(expr.rewrite(f)) },
            Expr::Regexp { expr, pattern } => {
                Expr::Regexp { expr: Box::new(expr.rewrite(f)), pattern }
            }
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Collects the distinct (child, column) pairs this expression reads.
    pub fn referenced_columns(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::ColumnRef { child, column, .. } = e {
                if !out.contains(&(*child, *column)) {
                    out.push((*child, *column));
                }
            }
        });
        out
    }

    /// Collects the distinct virtual columns this expression reads.
    pub fn referenced_virtual_columns(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::VirtualColumnRef { column, .. } = e {
                if !out.contains(column) {
                    out.push(*column);
                }
            }
        });
        out
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }
}
