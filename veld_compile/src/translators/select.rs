//! Residual filter above a join or other operator
//!
//! Null predicates drop the row (three-valued logic collapses to false).

use veld_common::{VeldError, VeldResult};
use veld_plan::{Expr, OperatorSchema};

use crate::control_flow::begin_if;
use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};

pub struct SelectTranslator {
    cond: Expr,
    schema: OperatorSchema,
}

impl SelectTranslator {
    pub fn new(cond: &Expr, schema: &OperatorSchema) -> Self {
        Self { cond: cond.clone(), schema: schema.clone() }
    }
}

impl OperatorTranslator for SelectTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let child = tree.nodes[this].children.first().copied().ok_or_else(|| {
            VeldError::codegen_error("select has no child")
        })?;
        tree.produce(child, ctx)
    }

    fn consume(
        &self,
        this: usize,
        _src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let value = tree.compute(&self.cond, this, ctx)?;
        let not_null = ctx.program.lnot_i1(value.null)?;
        let pass = ctx.program.and_i1(value.val.raw(), not_null)?;

        let guard = begin_if(&mut ctx.program, pass)?;
        tree.fill_values(this, &self.schema, ctx)?;
        tree.consume_parent(this, ctx)?;
        guard.end(&mut ctx.program)
    }
}
