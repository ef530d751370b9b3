//! Materialized row layout
//!
//! Buffers (vectors, hash-table entries) hold fixed-size rows: one field per
//! column followed by one null byte per column. Text fields embed a
//! `StringView` whose bytes are copied on pack so the row owns its data.

use veld_catalog::SqlType;
use veld_common::VeldResult;
use veld_ir::{CompType, ProgramBuilder, Type, Value};

use crate::runtime_fns::RuntimeFunctions;
use crate::values::{IrVal, SqlValue};

#[derive(Clone)]
pub struct RowLayout {
    pub ir_type: Type,
    pub columns: Vec<(SqlType, bool)>,
}

impl RowLayout {
    pub fn new(p: &mut ProgramBuilder, rt: &RuntimeFunctions, columns: &[(SqlType, bool)]) -> VeldResult<Self> {
        let mut fields = Vec::with_capacity(columns.len() * 2);
        for &(ty, _) in columns {
            fields.push(ir_field_type(p, rt, ty));
        }
        for _ in columns {
            fields.push(p.i8_type());
        }
        let ir_type = p.struct_type(&fields, None)?;
        Ok(Self { ir_type, columns: columns.to_vec() })
    }

    pub fn size(&self, p: &ProgramBuilder) -> u32 {
        p.type_manager().size_of(self.ir_type)
    }

    /// Casts a raw row pointer (`i8*`) to the row struct pointer.
    pub fn typed_row(&self, p: &mut ProgramBuilder, raw: Value) -> VeldResult<Value> {
        let row_ptr_ty = p.pointer_type(self.ir_type);
        p.ptr_cast(raw, row_ptr_ty)
    }

    /// Stores `values` into the row at `raw`.
    pub fn pack(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        raw: Value,
        values: &[SqlValue],
    ) -> VeldResult<()> {
        let row = self.typed_row(p, raw)?;
        for (i, value) in values.iter().enumerate() {
            let field = p.const_gep(row, &[0, i as i32])?;
            match value.val {
                IrVal::Bool(v) => {
                    let byte = p.i8_zext_i1(v)?;
                    p.store_i8(field, byte)?;
                }
                IrVal::I16(v) => p.store_i16(field, v)?,
                IrVal::I32(v) | IrVal::Date(v) => p.store_i32(field, v)?,
                IrVal::I64(v) => p.store_i64(field, v)?,
                IrVal::F64(v) => p.store_f64(field, v)?,
                IrVal::Str(view) => {
                    p.call(rt.string_copy, &[view, field])?;
                }
            }
            let null_field = p.const_gep(row, &[0, (self.columns.len() + i) as i32])?;
            let null_byte = p.i8_zext_i1(value.null)?;
            p.store_i8(null_field, null_byte)?;
        }
        Ok(())
    }

    /// Stores `values` without copying text bytes: the embedded view aliases
    /// the source (valid while the source mapping lives).
    pub fn pack_borrowed(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        raw: Value,
        values: &[SqlValue],
    ) -> VeldResult<()> {
        let row = self.typed_row(p, raw)?;
        for (i, value) in values.iter().enumerate() {
            let field = p.const_gep(row, &[0, i as i32])?;
            match value.val {
                IrVal::Str(view) => {
                    let src_data = p.const_gep(view, &[0, 0])?;
                    let data = p.load_ptr(src_data)?;
                    let src_len = p.const_gep(view, &[0, 1])?;
                    let len = p.load_i32(src_len)?;
                    let dst_data = p.const_gep(field, &[0, 0])?;
                    p.store_ptr(dst_data, data)?;
                    let dst_len = p.const_gep(field, &[0, 1])?;
                    p.store_i32(dst_len, len)?;
                }
                IrVal::Bool(v) => {
                    let byte = p.i8_zext_i1(v)?;
                    p.store_i8(field, byte)?;
                }
                IrVal::I16(v) => p.store_i16(field, v)?,
                IrVal::I32(v) | IrVal::Date(v) => p.store_i32(field, v)?,
                IrVal::I64(v) => p.store_i64(field, v)?,
                IrVal::F64(v) => p.store_f64(field, v)?,
            }
            let null_field = p.const_gep(row, &[0, (self.columns.len() + i) as i32])?;
            let null_byte = p.i8_zext_i1(value.null)?;
            p.store_i8(null_field, null_byte)?;
        }
        let _ = rt;
        Ok(())
    }

    /// Loads every column of the row at `raw`.
    pub fn unpack(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        raw: Value,
    ) -> VeldResult<Vec<SqlValue>> {
        let row = self.typed_row(p, raw)?;
        let mut out = Vec::with_capacity(self.columns.len());
        for (i, &(ty, _)) in self.columns.iter().enumerate() {
            let field = p.const_gep(row, &[0, i as i32])?;
            let val = match ty {
                SqlType::Boolean => {
                    let byte = p.load_i8(field)?;
                    let zero = p.const_i8(0);
                    IrVal::Bool(p.cmp_i8(CompType::Ne, byte, zero)?)
                }
                SqlType::SmallInt => IrVal::I16(p.load_i16(field)?),
                SqlType::Int => IrVal::I32(p.load_i32(field)?),
                SqlType::Date => IrVal::Date(p.load_i32(field)?),
                SqlType::BigInt => IrVal::I64(p.load_i64(field)?),
                SqlType::Real => IrVal::F64(p.load_f64(field)?),
                // The embedded view itself is the value.
                SqlType::Text => IrVal::Str(p.materialize_if_gep(field)?),
            };
            let null_field = p.const_gep(row, &[0, (self.columns.len() + i) as i32])?;
            let null_byte = p.load_i8(null_field)?;
            let zero = p.const_i8(0);
            let null = p.cmp_i8(CompType::Ne, null_byte, zero)?;
            out.push(SqlValue::new(val, null));
        }
        let _ = rt;
        Ok(out)
    }
}

pub fn ir_field_type(p: &mut ProgramBuilder, rt: &RuntimeFunctions, ty: SqlType) -> Type {
    match ty {
        SqlType::Boolean => p.i8_type(),
        SqlType::SmallInt => p.i16_type(),
        SqlType::Int | SqlType::Date => p.i32_type(),
        SqlType::BigInt => p.i64_type(),
        SqlType::Real => p.f64_type(),
        SqlType::Text => rt.types.string_view,
    }
}
