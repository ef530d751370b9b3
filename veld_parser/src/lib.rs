//! SQL front end for VeldDB
//!
//! Hand-written lexer and recursive-descent parser for the supported SELECT
//! dialect. Produces the untyped AST the planner binds against the catalog.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{
    AggFunc, AstBinaryOp, AstExpr, AstUnaryOp, OrderByItem, Projection, SelectStatement,
    Statement, TableRef,
};
pub use lexer::Lexer;
pub use parser::{parse, Parser};
pub use token::{Position, Token, TokenType};
