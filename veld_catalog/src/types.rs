//! SQL type system

use serde::{Deserialize, Serialize};

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    SmallInt,
    Int,
    BigInt,
    Real,
    Boolean,
    Date,
    Text,
}

impl SqlType {
    /// Width in bytes of one stored element; text columns are variable-width
    /// and return None.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            SqlType::Boolean => Some(1),
            SqlType::SmallInt => Some(2),
            SqlType::Int | SqlType::Date => Some(4),
            SqlType::BigInt | SqlType::Real => Some(8),
            SqlType::Text => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            SqlType::SmallInt | SqlType::Int | SqlType::BigInt | SqlType::Real
        )
    }

    pub fn is_integral(self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Int | SqlType::BigInt)
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SqlType::SmallInt => "smallint",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Real => "real",
            SqlType::Boolean => "boolean",
            SqlType::Date => "date",
            SqlType::Text => "text",
        };
        f.write_str(s)
    }
}
