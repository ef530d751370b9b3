//! Typed IR value wrappers
//!
//! `SqlValue` pairs a typed payload with an i1 null flag; operating on one
//! appends IR through the program builder. Text payloads are pointers to a
//! `StringView` struct.

use veld_catalog::SqlType;
use veld_ir::{ProgramBuilder, Value};

/// The payload of a SQL value inside generated code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrVal {
    Bool(Value),
    I16(Value),
    I32(Value),
    I64(Value),
    F64(Value),
    /// Julian day in an i32.
    Date(Value),
    /// Pointer to a `StringView`.
    Str(Value),
}

impl IrVal {
    pub fn raw(self) -> Value {
        match self {
            IrVal::Bool(v)
            | IrVal::I16(v)
            | IrVal::I32(v)
            | IrVal::I64(v)
            | IrVal::F64(v)
            | IrVal::Date(v)
            | IrVal::Str(v) => v,
        }
    }

    pub fn with_raw(self, v: Value) -> IrVal {
        match self {
            IrVal::Bool(_) => IrVal::Bool(v),
            IrVal::I16(_) => IrVal::I16(v),
            IrVal::I32(_) => IrVal::I32(v),
            IrVal::I64(_) => IrVal::I64(v),
            IrVal::F64(_) => IrVal::F64(v),
            IrVal::Date(_) => IrVal::Date(v),
            IrVal::Str(_) => IrVal::Str(v),
        }
    }

    pub fn sql_type(self) -> SqlType {
        match self {
            IrVal::Bool(_) => SqlType::Boolean,
            IrVal::I16(_) => SqlType::SmallInt,
            IrVal::I32(_) => SqlType::Int,
            IrVal::I64(_) => SqlType::BigInt,
            IrVal::F64(_) => SqlType::Real,
            IrVal::Date(_) => SqlType::Date,
            IrVal::Str(_) => SqlType::Text,
        }
    }

    pub fn from_sql_type(ty: SqlType, v: Value) -> IrVal {
        match ty {
            SqlType::Boolean => IrVal::Bool(v),
            SqlType::SmallInt => IrVal::I16(v),
            SqlType::Int => IrVal::I32(v),
            SqlType::BigInt => IrVal::I64(v),
            SqlType::Real => IrVal::F64(v),
            SqlType::Date => IrVal::Date(v),
            SqlType::Text => IrVal::Str(v),
        }
    }
}

/// A nullable SQL value flowing between translators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SqlValue {
    pub val: IrVal,
    /// i1, true when NULL.
    pub null: Value,
}

impl SqlValue {
    pub fn new(val: IrVal, null: Value) -> Self {
        Self { val, null }
    }

    pub fn not_null(val: IrVal, p: &mut ProgramBuilder) -> Self {
        let null = p.const_i1(false);
        Self { val, null }
    }

    pub fn ty(&self) -> SqlType {
        self.val.sql_type()
    }
}

/// Default (zero) value of a type, used to seed virtual slots.
pub fn default_value(ty: SqlType, p: &mut ProgramBuilder) -> SqlValue {
    let val = match ty {
        SqlType::Boolean => IrVal::Bool(p.const_i1(false)),
        SqlType::SmallInt => IrVal::I16(p.const_i16(0)),
        SqlType::Int => IrVal::I32(p.const_i32(0)),
        SqlType::BigInt => IrVal::I64(p.const_i64(0)),
        SqlType::Real => IrVal::F64(p.const_f64(0.0)),
        SqlType::Date => IrVal::Date(p.const_i32(0)),
        SqlType::Text => {
            let i8_ty = p.i8_type();
            IrVal::Str(p.nullptr(i8_ty))
        }
    };
    SqlValue::not_null(val, p)
}

/// Per-column value slots a translator exposes to its parent (`values`) or
/// binds child expressions to (`virtual_values`).
#[derive(Debug, Default, Clone)]
pub struct SchemaValues {
    values: Vec<SqlValue>,
}

impl SchemaValues {
    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn add(&mut self, value: SqlValue) {
        self.values.push(value);
    }

    pub fn set(&mut self, idx: usize, value: SqlValue) {
        self.values[idx] = value;
    }

    pub fn get(&self, idx: usize) -> SqlValue {
        self.values[idx]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn all(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn set_all(&mut self, values: Vec<SqlValue>) {
        self.values = values;
    }
}
