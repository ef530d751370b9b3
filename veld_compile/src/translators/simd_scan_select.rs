//! Vectorized scan-select
//!
//! Evaluates integer/date predicates against literals eight tuples at a
//! time: compare into an i1x8 lane mask, AND the masks, compress the
//! matching tuple indices with the permute-by-mask trick, and stream them to
//! the parent in 64-tuple batches. Strings, reals, and bigints are not
//! vectorizable and must go through the scalar translator; asking for them
//! is an error rather than a silent widening.

use veld_catalog::{Column, SqlType};
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, Value};
use veld_plan::{BinaryOp, Expr, Literal, OperatorSchema};

use crate::buffer::DiskMaterializedBuffer;
use crate::control_flow::{begin_if, Loop};
use crate::translators::{catalog_columns, CompileContext, OperatorTranslator, TranslatorTree};

/// Batch capacity; flushed once fewer than eight slots remain.
const BATCH: u32 = 64;
/// Slack for the final (partially valid) 8-lane store.
const BATCH_ALLOC: u32 = BATCH + 8;

struct SimdPredicate {
    slot: usize,
    cmp: CompType,
    literal: i32,
}

/// A filter the SIMD path can evaluate: integer/date compare between a
/// non-nullable virtual column and a literal.
fn classify(filter: &Expr) -> Option<SimdPredicate> {
    let Expr::Binary { op, left, right, .. } = filter else {
        return None;
    };
    let cmp = match op {
        BinaryOp::Eq => CompType::Eq,
        BinaryOp::Neq => CompType::Ne,
        BinaryOp::Lt => CompType::Lt,
        BinaryOp::Leq => CompType::Le,
        BinaryOp::Gt => CompType::Gt,
        BinaryOp::Geq => CompType::Ge,
        _ => return None,
    };

    let literal_i32 = |lit: &Literal| -> Option<i32> {
        match lit {
            Literal::SmallInt(v) => Some(*v as i32),
            Literal::Int(v) => Some(*v),
            Literal::Date(v) => Some(*v),
            _ => None,
        }
    };

    match (left.as_ref(), right.as_ref()) {
        (Expr::VirtualColumnRef { column, ty, nullable, .. }, Expr::Literal(lit))
            if matches!(ty, SqlType::Int | SqlType::Date) && !nullable =>
        {
            Some(SimdPredicate { slot: *column, cmp, literal: literal_i32(lit)? })
        }
        (Expr::Literal(lit), Expr::VirtualColumnRef { column, ty, nullable, .. })
            if matches!(ty, SqlType::Int | SqlType::Date) && !nullable =>
        {
            Some(SimdPredicate { slot: *column, cmp: cmp.flip(), literal: literal_i32(lit)? })
        }
        _ => None,
    }
}

pub fn supports(filters: &[Expr], _scan_schema: &OperatorSchema) -> bool {
    !filters.is_empty() && filters.iter().all(|f| classify(f).is_some())
}

pub struct SimdScanSelectTranslator {
    schema: OperatorSchema,
    columns: Vec<Column>,
    predicates: Vec<SimdPredicate>,
}

impl SimdScanSelectTranslator {
    pub fn new(
        table: &str,
        schema: &OperatorSchema,
        scan_schema: &OperatorSchema,
        filters: &[Expr],
        ctx: &CompileContext,
    ) -> VeldResult<Self> {
        let predicates: Vec<SimdPredicate> = filters
            .iter()
            .map(|f| {
                classify(f).ok_or_else(|| {
                    VeldError::codegen_error(
                        "vectorized scan supports only int/date compares against literals",
                    )
                })
            })
            .collect::<VeldResult<_>>()?;
        Ok(Self {
            schema: schema.clone(),
            columns: catalog_columns(ctx.db, table, scan_schema)?,
            predicates,
        })
    }
}

impl OperatorTranslator for SimdScanSelectTranslator {
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

        let i32_ty = ctx.program.i32_type();
        let zero = ctx.program.const_i32(0);
        let one = ctx.program.const_i32(1);
        let eight = ctx.program.const_i32(8);

        // Batch of matching tuple indices plus its fill count.
        let batch = ctx.program.alloca(i32_ty, BATCH_ALLOC)?;
        let count_slot = ctx.program.alloca(i32_ty, 1)?;
        ctx.program.store_i32(count_slot, zero)?;

        // Hoisted predicate state: data pointers and broadcast literals.
        let mut pred_state = Vec::with_capacity(self.predicates.len());
        for predicate in &self.predicates {
            let data = buffer.columns[predicate.slot].data_ptr(&mut ctx.program)?;
            let i32p = ctx.program.pointer_type(i32_ty);
            let typed = ctx.program.ptr_cast(data, i32p)?;
            let lit = ctx.program.const_i32(predicate.literal);
            let splat = ctx.program.vec8_broadcast_i32(lit)?;
            pred_state.push((typed, splat));
        }
        let iota = ctx.program.const_i32_vec8([0, 1, 2, 3, 4, 5, 6, 7]);

        // Flushes the batch through the parent; emitted at each call site.
        let mut flush = |tree: &mut TranslatorTree, ctx: &mut CompileContext| -> VeldResult<()> {
            let count = ctx.program.load_i32(count_slot)?;
            let lp = Loop::new(&mut ctx.program, &[zero])?;
            let k = lp.var(0);
            let more = ctx.program.cmp_i32(CompType::Lt, k, count)?;
            lp.enter_body(&mut ctx.program, more)?;

            let slot_ptr = ctx.program.dynamic_gep(batch, k, &[])?;
            let tuple = ctx.program.load_i32(slot_ptr)?;
            let mut virtuals = Vec::with_capacity(self.columns.len());
            for slot in 0..self.columns.len() {
                virtuals.push(buffer.get(&mut ctx.program, &ctx.rt, tuple, slot, views[slot])?);
            }
            tree.nodes[this].virtual_values.set_all(virtuals);
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)?;

            let next = ctx.program.add_i32(k, one)?;
            lp.continue_with(&mut ctx.program, &[next])?;
            lp.exit(&mut ctx.program)?;
            ctx.program.store_i32(count_slot, zero)
        };

        // Main vector loop: blocks of eight tuples.
        let lp = Loop::new(&mut ctx.program, &[zero])?;
        let i = lp.var(0);
        let block_end = ctx.program.add_i32(i, eight)?;
        let in_range = ctx.program.cmp_i32(CompType::Le, block_end, cardinality)?;
        lp.enter_body(&mut ctx.program, in_range)?;
        {
            let mut combined: Option<Value> = None;
            for ((typed, splat), predicate) in pred_state.iter().zip(&self.predicates) {
                let lane_ptr = ctx.program.dynamic_gep(*typed, i, &[])?;
                let lanes = ctx.program.vec8_load_i32(lane_ptr)?;
                let mask = ctx.program.vec8_cmp_i32(predicate.cmp, lanes, *splat)?;
                combined = Some(match combined {
                    None => mask,
                    Some(prev) => ctx.program.vec8_and_i1(prev, mask)?,
                });
            }
            let mask = ctx.program.vec8_mask_i1(combined.expect("at least one predicate"))?;
            let zero64 = ctx.program.const_i64(0);
            let any = ctx.program.cmp_i64(CompType::Ne, mask, zero64)?;

            let guard = begin_if(&mut ctx.program, any)?;
            {
                // indices = broadcast(i) + iota, front-packed by the mask.
                let base = ctx.program.vec8_broadcast_i32(i)?;
                let indices = ctx.program.vec8_add_i32(base, iota)?;
                let packed = ctx.program.vec8_compress_i32(indices, mask)?;
                let count = ctx.program.load_i32(count_slot)?;
                let dest = ctx.program.dynamic_gep(batch, count, &[])?;
                ctx.program.vec8_store_i32(dest, packed)?;
                let hits64 = ctx.program.popcount_i64(mask)?;
                let hits = ctx.program.i32_trunc_i64(hits64)?;
                let new_count = ctx.program.add_i32(count, hits)?;
                ctx.program.store_i32(count_slot, new_count)?;

                // Flush once another full block might not fit.
                let limit = ctx.program.const_i32((BATCH - 8 + 1) as i32);
                let full = ctx.program.cmp_i32(CompType::Ge, new_count, limit)?;
                let flush_guard = begin_if(&mut ctx.program, full)?;
                flush(tree, ctx)?;
                flush_guard.end(&mut ctx.program)?;
            }
            guard.end(&mut ctx.program)?;
        }
        let next = ctx.program.add_i32(i, eight)?;
        lp.continue_with(&mut ctx.program, &[next])?;
        lp.exit(&mut ctx.program)?;

        // Scalar tail.
        let tail_start = lp.var(0);
        let tail = Loop::new(&mut ctx.program, &[tail_start])?;
        let t = tail.var(0);
        let more = ctx.program.cmp_i32(CompType::Lt, t, cardinality)?;
        tail.enter_body(&mut ctx.program, more)?;
        {
            let next_t = ctx.program.add_i32(t, one)?;
            for (predicate, (typed, _)) in self.predicates.iter().zip(&pred_state) {
                let lane_ptr = ctx.program.dynamic_gep(*typed, t, &[])?;
                let v = ctx.program.load_i32(lane_ptr)?;
                let lit = ctx.program.const_i32(predicate.literal);
                let pass = ctx.program.cmp_i32(predicate.cmp, v, lit)?;
                let fail = ctx.program.lnot_i1(pass)?;
                let guard = begin_if(&mut ctx.program, fail)?;
                tail.continue_with(&mut ctx.program, &[next_t])?;
                guard.end(&mut ctx.program)?;
            }
            let count = ctx.program.load_i32(count_slot)?;
            let slot_ptr = ctx.program.dynamic_gep(batch, count, &[])?;
            ctx.program.store_i32(slot_ptr, t)?;
            let new_count = ctx.program.add_i32(count, one)?;
            ctx.program.store_i32(count_slot, new_count)?;
            tail.continue_with(&mut ctx.program, &[next_t])?;
        }
        tail.exit(&mut ctx.program)?;

        // Final flush.
        flush(tree, ctx)?;

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
