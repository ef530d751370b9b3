//! Disk-backed materialized buffers
//!
//! A scan's backing store: one memory-mapped column per referenced table
//! column (plus optional null columns). The proxies emit opens into the
//! pipeline body, direct loads for fixed-width gets, and runtime calls for
//! text.

use veld_catalog::{Column, SqlType};
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, ProgramBuilder, Value};

use crate::runtime_fns::RuntimeFunctions;
use crate::values::{IrVal, SqlValue};

pub struct ColumnProxy {
    /// Pointer to the global `RawColumnData` struct.
    pub global: Value,
    pub ty: SqlType,
    path: Value,
}

impl ColumnProxy {
    pub fn new(
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        ty: SqlType,
        path: &str,
    ) -> VeldResult<Self> {
        let i8_ty = p.i8_type();
        let null = p.nullptr(i8_ty);
        let zero = p.const_i32(0);
        let init = p.constant_struct(rt.types.raw_column_data, &[null, zero, null]);
        let global = p.global(rt.types.raw_column_data, init);
        let path = p.global_const_char_array(path);
        Ok(Self { global, ty, path })
    }

    pub fn open(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<()> {
        p.call(rt.column_open, &[self.global, self.path])?;
        Ok(())
    }

    pub fn close(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<()> {
        p.call(rt.column_close, &[self.global])?;
        Ok(())
    }

    pub fn size(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<Value> {
        let f = match self.ty {
            SqlType::Boolean => rt.column_size_i8,
            SqlType::SmallInt => rt.column_size_i16,
            SqlType::Int | SqlType::Date => rt.column_size_i32,
            SqlType::BigInt => rt.column_size_i64,
            SqlType::Real => rt.column_size_f64,
            SqlType::Text => rt.column_size_text,
        };
        p.call(f, &[self.global])
    }

    /// Raw data pointer (`i8*`) of the mapping.
    pub fn data_ptr(&self, p: &mut ProgramBuilder) -> VeldResult<Value> {
        let field = p.const_gep(self.global, &[0, 0])?;
        p.load_ptr(field)
    }

    /// Loads element `tuple`; text goes through the runtime into `view`
    /// (a caller-allocated `StringView` slot).
    pub fn get(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        tuple: Value,
        view: Option<Value>,
    ) -> VeldResult<IrVal> {
        if self.ty == SqlType::Text {
            let view = view
                .ok_or_else(|| VeldError::codegen_error("text get needs a view slot"))?;
            p.call(rt.column_get_text, &[self.global, tuple, view])?;
            return Ok(IrVal::Str(view));
        }

        let data = self.data_ptr(p)?;
        Ok(match self.ty {
            SqlType::Boolean => {
                let elem = p.dynamic_gep(data, tuple, &[])?;
                let byte = p.load_i8(elem)?;
                let zero = p.const_i8(0);
                IrVal::Bool(p.cmp_i8(CompType::Ne, byte, zero)?)
            }
            SqlType::SmallInt => {
                let i16_ty = p.i16_type();
                let ptr_ty = p.pointer_type(i16_ty);
                let typed = p.ptr_cast(data, ptr_ty)?;
                let elem = p.dynamic_gep(typed, tuple, &[])?;
                IrVal::I16(p.load_i16(elem)?)
            }
            SqlType::Int | SqlType::Date => {
                let i32_ty = p.i32_type();
                let ptr_ty = p.pointer_type(i32_ty);
                let typed = p.ptr_cast(data, ptr_ty)?;
                let elem = p.dynamic_gep(typed, tuple, &[])?;
                let v = p.load_i32(elem)?;
                if self.ty == SqlType::Date {
                    IrVal::Date(v)
                } else {
                    IrVal::I32(v)
                }
            }
            SqlType::BigInt => {
                let i64_ty = p.i64_type();
                let ptr_ty = p.pointer_type(i64_ty);
                let typed = p.ptr_cast(data, ptr_ty)?;
                let elem = p.dynamic_gep(typed, tuple, &[])?;
                IrVal::I64(p.load_i64(elem)?)
            }
            SqlType::Real => {
                let f64_ty = p.f64_type();
                let ptr_ty = p.pointer_type(f64_ty);
                let typed = p.ptr_cast(data, ptr_ty)?;
                let elem = p.dynamic_gep(typed, tuple, &[])?;
                IrVal::F64(p.load_f64(elem)?)
            }
            SqlType::Text => unreachable!(),
        })
    }
}

/// Per-column proxies for one table scan.
pub struct DiskMaterializedBuffer {
    pub columns: Vec<ColumnProxy>,
    pub null_columns: Vec<Option<ColumnProxy>>,
}

impl DiskMaterializedBuffer {
    /// `catalog_columns` pairs each kept slot with its catalog column.
    pub fn new(
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        catalog_columns: &[&Column],
    ) -> VeldResult<Self> {
        let mut columns = Vec::with_capacity(catalog_columns.len());
        let mut null_columns = Vec::with_capacity(catalog_columns.len());
        for column in catalog_columns {
            columns.push(ColumnProxy::new(p, rt, column.ty, &column.data_path)?);
            null_columns.push(match &column.null_path {
                Some(path) => Some(ColumnProxy::new(p, rt, SqlType::Boolean, path)?),
                None => None,
            });
        }
        Ok(Self { columns, null_columns })
    }

    pub fn init(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<()> {
        for column in &self.columns {
            column.open(p, rt)?;
        }
        for column in self.null_columns.iter().flatten() {
            column.open(p, rt)?;
        }
        Ok(())
    }

    pub fn reset(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<()> {
        for column in &self.columns {
            column.close(p, rt)?;
        }
        for column in self.null_columns.iter().flatten() {
            column.close(p, rt)?;
        }
        Ok(())
    }

    pub fn size(&self, p: &mut ProgramBuilder, rt: &RuntimeFunctions) -> VeldResult<Value> {
        self.columns[0].size(p, rt)
    }

    /// Loads column `col` of row `tuple` with its null flag.
    pub fn get(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        tuple: Value,
        col: usize,
        view: Option<Value>,
    ) -> VeldResult<SqlValue> {
        let val = self.columns[col].get(p, rt, tuple, view)?;
        let null = match &self.null_columns[col] {
            Some(null_column) => {
                match null_column.get(p, rt, tuple, None)? {
                    IrVal::Bool(b) => b,
                    _ => unreachable!("null columns are boolean"),
                }
            }
            None => p.const_i1(false),
        };
        Ok(SqlValue::new(val, null))
    }

    /// Allocates one `StringView` slot per text column (None elsewhere);
    /// call once per emitted loop, before the loop body.
    pub fn text_views(
        &self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
    ) -> VeldResult<Vec<Option<Value>>> {
        self.columns
            .iter()
            .map(|c| {
                if c.ty == SqlType::Text {
                    Ok(Some(p.alloca(rt.types.string_view, 1)?))
                } else {
                    Ok(None)
                }
            })
            .collect()
    }
}
