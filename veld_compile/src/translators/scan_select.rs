//! Scan with inlined predicate evaluation (static order)
//!
//! Predicate-referenced columns load first; a failing (or null) predicate
//! skips to the next tuple before the remaining columns are touched.

use veld_catalog::Column;
use veld_common::{VeldError, VeldResult};
use veld_ir::CompType;
use veld_plan::{Expr, OperatorSchema};

use crate::buffer::DiskMaterializedBuffer;
use crate::control_flow::{begin_if, Loop};
use crate::translators::{catalog_columns, CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::default_value;

pub struct ScanSelectTranslator {
    schema: OperatorSchema,
    scan_schema: OperatorSchema,
    columns: Vec<Column>,
    filters: Vec<Expr>,
}

impl ScanSelectTranslator {
    pub fn new(
        table: &str,
        schema: &OperatorSchema,
        scan_schema: &OperatorSchema,
        filters: &[Expr],
        ctx: &CompileContext,
    ) -> VeldResult<Self> {
        Ok(Self {
            schema: schema.clone(),
            scan_schema: scan_schema.clone(),
            columns: catalog_columns(ctx.db, table, scan_schema)?,
            filters: filters.to_vec(),
        })
    }
}

impl OperatorTranslator for ScanSelectTranslator {
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
        let one = ctx.program.const_i32(1);
        let next = ctx.program.add_i32(i, one)?;

        // Seed the virtual slots, then load lazily: predicate columns first.
        let mut virtuals = Vec::with_capacity(self.columns.len());
        for column in &self.scan_schema.columns {
            virtuals.push(default_value(column.ty(), &mut ctx.program));
        }
        tree.nodes[this].virtual_values.set_all(virtuals);

        let mut loaded = vec![false; self.columns.len()];
        for filter in &self.filters {
            for slot in filter.referenced_virtual_columns() {
                if !loaded[slot] {
                    loaded[slot] = true;
                    let v = buffer.get(&mut ctx.program, &ctx.rt, i, slot, views[slot])?;
                    tree.nodes[this].virtual_values.set(slot, v);
                }
            }

            let value = tree.compute(filter, this, ctx)?;
            // Null collapses to false: the tuple is dropped.
            let not_null = ctx.program.lnot_i1(value.null)?;
            let pass = ctx.program.and_i1(value.val.raw(), not_null)?;
            let fail = ctx.program.lnot_i1(pass)?;
            let guard = begin_if(&mut ctx.program, fail)?;
            lp.continue_with(&mut ctx.program, &[next])?;
            guard.end(&mut ctx.program)?;
        }

        for slot in 0..self.columns.len() {
            if !loaded[slot] {
                let v = buffer.get(&mut ctx.program, &ctx.rt, i, slot, views[slot])?;
                tree.nodes[this].virtual_values.set(slot, v);
            }
        }
        tree.fill_values(this, &self.schema, ctx)?;
        tree.consume_parent(this, ctx)?;

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
