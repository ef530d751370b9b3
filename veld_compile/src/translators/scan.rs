//! Full table scan
//!
//! Opens one memory-mapped column per kept slot, then walks `0..cardinality`
//! filling the virtual slots and pushing each tuple to the parent.

use veld_catalog::Column;
use veld_common::{VeldError, VeldResult};
use veld_ir::CompType;
use veld_plan::OperatorSchema;

use crate::buffer::DiskMaterializedBuffer;
use crate::control_flow::Loop;
use crate::translators::{catalog_columns, CompileContext, OperatorTranslator, TranslatorTree};

pub struct ScanTranslator {
    schema: OperatorSchema,
    columns: Vec<Column>,
}

impl ScanTranslator {
    pub fn new(
        table: &str,
        schema: &OperatorSchema,
        scan_schema: &OperatorSchema,
        ctx: &CompileContext,
    ) -> VeldResult<Self> {
        Ok(Self {
            schema: schema.clone(),
            columns: catalog_columns(ctx.db, table, scan_schema)?,
        })
    }
}

impl OperatorTranslator for ScanTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let refs: Vec<&Column> = self.columns.iter().collect();
        let buffer = DiskMaterializedBuffer::new(&mut ctx.program, &ctx.rt, &refs)?;
        buffer.init(&mut ctx.program, &ctx.rt)?;
        let cardinality = buffer.size(&mut ctx.program, &ctx.rt)?;
        let views = buffer.text_views(&mut ctx.program, &ctx.rt)?;

        let zero = ctx.program.const_i32(0);
        let lp = Loop::new(&mut ctx.program, &[zero])?;
        let i = lp.var(0);
        let cond = ctx.program.cmp_i32(CompType::Lt, i, cardinality)?;
        lp.enter_body(&mut ctx.program, cond)?;

        let mut virtuals = Vec::with_capacity(self.columns.len());
        for slot in 0..self.columns.len() {
            virtuals.push(buffer.get(&mut ctx.program, &ctx.rt, i, slot, views[slot])?);
        }
        tree.nodes[this].virtual_values.set_all(virtuals);
        tree.fill_values(this, &self.schema, ctx)?;
        tree.consume_parent(this, ctx)?;

        let one = ctx.program.const_i32(1);
        let next = ctx.program.add_i32(i, one)?;
        lp.continue_with(&mut ctx.program, &[next])?;
        lp.exit(&mut ctx.program)?;

        buffer.reset(&mut ctx.program, &ctx.rt)
    }

    fn consume(
        &self,
        _this: usize,
        _src: usize,
        _tree: &mut TranslatorTree,
        _ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        Err(VeldError::codegen_error("a scan is a leaf and cannot consume"))
    }
}
