//! Result printer
//!
//! Prints each field through the runtime printer, substituting the
//! configured empty literal for null, then ends the row.

use veld_catalog::SqlType;
use veld_common::VeldResult;
use veld_plan::OperatorSchema;

use crate::control_flow::begin_if_else;
use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::IrVal;

pub struct OutputTranslator {
    schema: OperatorSchema,
}

impl OutputTranslator {
    pub fn new(schema: &OperatorSchema) -> Self {
        Self { schema: schema.clone() }
    }
}

impl OperatorTranslator for OutputTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let child = tree.nodes[this].children[0];
        tree.produce(child, ctx)
    }

    fn consume(
        &self,
        this: usize,
        _src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        for column in &self.schema.columns {
            let value = tree.compute(&column.expr, this, ctx)?;

            let guard = begin_if_else(&mut ctx.program, value.null)?;
            ctx.program.call(ctx.rt.print_null, &[])?;
            guard.else_branch(&mut ctx.program)?;
            let print = match column.ty() {
                SqlType::Boolean => ctx.rt.print_bool,
                SqlType::SmallInt => ctx.rt.print_i16,
                SqlType::Int => ctx.rt.print_i32,
                SqlType::BigInt => ctx.rt.print_i64,
                SqlType::Real => ctx.rt.print_f64,
                SqlType::Date => ctx.rt.print_date,
                SqlType::Text => ctx.rt.print_string,
            };
            debug_assert!(matches!(
                (column.ty(), value.val),
                (SqlType::Boolean, IrVal::Bool(_))
                    | (SqlType::SmallInt, IrVal::I16(_))
                    | (SqlType::Int, IrVal::I32(_))
                    | (SqlType::BigInt, IrVal::I64(_))
                    | (SqlType::Real, IrVal::F64(_))
                    | (SqlType::Date, IrVal::Date(_))
                    | (SqlType::Text, IrVal::Str(_))
            ));
            ctx.program.call(print, &[value.val.raw()])?;
            guard.end(&mut ctx.program)?;
        }
        ctx.program.call(ctx.rt.print_newline, &[])?;
        Ok(())
    }
}
