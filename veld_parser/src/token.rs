//! SQL tokens

#[derive(Debug, Clone, PartialEq)]
pub enum TokenType {
    Identifier(String),
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),

    // Keywords
    Select,
    From,
    Where,
    Group,
    Order,
    By,
    Asc,
    Desc,
    And,
    Or,
    Not,
    Like,
    In,
    Is,
    Null,
    Case,
    When,
    Then,
    Else,
    End,
    Extract,
    Year,
    As,
    Sum,
    Avg,
    Min,
    Max,
    Count,
    True,
    False,
    Date,
    Regexp,

    // Rejected-up-front constructs
    With,
    Distinct,
    Over,
    Into,
    Values,
    Nullif,
    Similar,

    // Punctuation and operators
    Comma,
    Dot,
    Semicolon,
    LeftParen,
    RightParen,
    Star,
    Plus,
    Minus,
    Slash,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,

    Eof,
}

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub ty: TokenType,
    pub pos: Position,
}

impl Token {
    pub fn new(ty: TokenType, pos: Position) -> Self {
        Self { ty, pos }
    }
}

pub fn keyword(ident: &str) -> Option<TokenType> {
    // SQL keywords are case-insensitive.
    let upper = ident.to_ascii_uppercase();
    Some(match upper.as_str() {
        "SELECT" => TokenType::Select,
        "FROM" => TokenType::From,
        "WHERE" => TokenType::Where,
        "GROUP" => TokenType::Group,
        "ORDER" => TokenType::Order,
        "BY" => TokenType::By,
        "ASC" => TokenType::Asc,
        "DESC" => TokenType::Desc,
        "AND" => TokenType::And,
        "OR" => TokenType::Or,
        "NOT" => TokenType::Not,
        "LIKE" => TokenType::Like,
        "IN" => TokenType::In,
        "IS" => TokenType::Is,
        "NULL" => TokenType::Null,
        "CASE" => TokenType::Case,
        "WHEN" => TokenType::When,
        "THEN" => TokenType::Then,
        "ELSE" => TokenType::Else,
        "END" => TokenType::End,
        "EXTRACT" => TokenType::Extract,
        "YEAR" => TokenType::Year,
        "AS" => TokenType::As,
        "SUM" => TokenType::Sum,
        "AVG" => TokenType::Avg,
        "MIN" => TokenType::Min,
        "MAX" => TokenType::Max,
        "COUNT" => TokenType::Count,
        "TRUE" => TokenType::True,
        "FALSE" => TokenType::False,
        "DATE" => TokenType::Date,
        "REGEXP" => TokenType::Regexp,
        "WITH" => TokenType::With,
        "DISTINCT" => TokenType::Distinct,
        "OVER" => TokenType::Over,
        "INTO" => TokenType::Into,
        "VALUES" => TokenType::Values,
        "NULLIF" => TokenType::Nullif,
        "SIMILAR" => TokenType::Similar,
        _ => return None,
    })
}
