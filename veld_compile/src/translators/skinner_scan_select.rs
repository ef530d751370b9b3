//! Adaptive scan-select (permutable)
//!
//! Emits one boolean function per residual predicate plus a
//! `base(budget, next_tuple) -> i32` driver with two paths: a
//! sorted-intersection walk over the active index buckets, and a sequential
//! walk evaluating the predicate function-pointer array in its current
//! order. The host UCB executor permutes the array and the active index set
//! between steps; an empty index bucket short-circuits the whole scan.

use veld_catalog::{Column, SqlType};
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, FunctionRef, Value};
use veld_plan::{BinaryOp, Expr, Literal, OperatorSchema};

use crate::buffer::DiskMaterializedBuffer;
use crate::control_flow::{begin_if, begin_if_else, Loop};
use crate::row_layout::RowLayout;
use crate::translators::{catalog_columns, CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::default_value;

const RESULT_MAX: u32 = 64;

pub struct SkinnerScanSelectTranslator {
    schema: OperatorSchema,
    scan_schema: OperatorSchema,
    columns: Vec<Column>,
    filters: Vec<Expr>,
    index_filters: Vec<usize>,
}

impl SkinnerScanSelectTranslator {
    pub fn new(
        table: &str,
        schema: &OperatorSchema,
        scan_schema: &OperatorSchema,
        filters: &[Expr],
        index_filters: &[usize],
        ctx: &CompileContext,
    ) -> VeldResult<Self> {
        let columns = catalog_columns(ctx.db, table, scan_schema)?;
        // Only integral and date keys have a disk-index representation.
        let index_filters: Vec<usize> = index_filters
            .iter()
            .copied()
            .filter(|&i| match index_slot_and_key(&filters[i]) {
                Some((slot, _)) => matches!(
                    columns[slot].ty,
                    SqlType::SmallInt | SqlType::Int | SqlType::BigInt | SqlType::Date
                ),
                None => false,
            })
            .collect();
        Ok(Self {
            schema: schema.clone(),
            scan_schema: scan_schema.clone(),
            columns,
            filters: filters.to_vec(),
            index_filters,
        })
    }
}

/// `vcol == literal` (either side): the slot and the key literal.
fn index_slot_and_key(filter: &Expr) -> Option<(usize, &Literal)> {
    if let Expr::Binary { op: BinaryOp::Eq, left, right, .. } = filter {
        match (left.as_ref(), right.as_ref()) {
            (Expr::VirtualColumnRef { column, .. }, Expr::Literal(lit))
            | (Expr::Literal(lit), Expr::VirtualColumnRef { column, .. }) => {
                return Some((*column, lit))
            }
            _ => {}
        }
    }
    None
}

fn literal_as_i64(lit: &Literal) -> VeldResult<i64> {
    Ok(match lit {
        Literal::SmallInt(v) => *v as i64,
        Literal::Int(v) => *v as i64,
        Literal::BigInt(v) => *v,
        Literal::Date(v) => *v as i64,
        _ => return Err(VeldError::codegen_error("index key must be integral")),
    })
}

impl OperatorTranslator for SkinnerScanSelectTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let refs: Vec<&Column> = self.columns.iter().collect();
        let buffer = DiskMaterializedBuffer::new(&mut ctx.program, &ctx.rt, &refs)?;
        buffer.init(&mut ctx.program, &ctx.rt)?;

        // 1. Predicate columns and the shared predicate struct.
        let mut pred_cols: Vec<usize> = Vec::new();
        for filter in &self.filters {
            for slot in filter.referenced_virtual_columns() {
                if !pred_cols.contains(&slot) {
                    pred_cols.push(slot);
                }
            }
        }
        pred_cols.sort_unstable();
        let pred_types: Vec<(SqlType, bool)> = pred_cols
            .iter()
            .map(|&slot| (self.columns[slot].ty, self.columns[slot].nullable))
            .collect();
        let pred_layout = RowLayout::new(&mut ctx.program, &ctx.rt, &pred_types)?;
        let init = super::aggregate::zero_struct_constant(&mut ctx.program, pred_layout.ir_type)?;
        let pred_struct = ctx.program.global(pred_layout.ir_type, init);
        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);
        let pred_struct_raw = ctx.program.ptr_cast(pred_struct, i8p)?;

        // Seed the full virtual schema so predicate emission sees every
        // slot.
        let mut defaults = Vec::with_capacity(self.columns.len());
        for column in &self.scan_schema.columns {
            defaults.push(default_value(column.ty(), &mut ctx.program));
        }
        tree.nodes[this].virtual_values.set_all(defaults.clone());

        // 2. One boolean function per predicate.
        let mut pred_fns: Vec<FunctionRef> = Vec::new();
        for (i, filter) in self.filters.iter().enumerate() {
            let saved = ctx.program.current_function();
            let i1 = ctx.program.i1_type();
            let func = ctx
                .program
                .create_public_function(i1, &[], &format!("scan_pred_{this}_{i}"))?;

            let unpacked = pred_layout.unpack(&mut ctx.program, &ctx.rt, pred_struct_raw)?;
            tree.nodes[this].virtual_values.set_all(defaults.clone());
            for (field, &slot) in unpacked.into_iter().zip(&pred_cols) {
                tree.nodes[this].virtual_values.set(slot, field);
            }
            let value = tree.compute(filter, this, ctx)?;
            // Null collapses to false.
            let guard = begin_if(&mut ctx.program, value.null)?;
            let f = ctx.program.const_i1(false);
            ctx.program.ret_value(f)?;
            guard.end(&mut ctx.program)?;
            ctx.program.ret_value(value.val.raw())?;

            ctx.program.set_current_function(saved);
            pred_fns.push(func);
        }

        // 3. Index-evaluable predicates: open each index, fetch its bucket,
        // short-circuit on empty, and collect the buckets.
        let num_index = self.index_filters.len();
        let nullp = ctx.program.nullptr(i8_ty);
        let bucket_array_global = ctx.program.global(i8p, nullp);
        if num_index > 0 {
            let n_const = ctx.program.const_i32(num_index as i32);
            let arr = ctx.program.call(ctx.rt.bucket_array_create, &[n_const])?;
            ctx.program.store_ptr(bucket_array_global, arr)?;
            for &fi in &self.index_filters {
                let (slot, lit) = index_slot_and_key(&self.filters[fi])
                    .expect("classified as index-evaluable");
                let column = &self.columns[slot];
                let path = column
                    .index_path
                    .as_deref()
                    .ok_or_else(|| VeldError::codegen_error("index filter without index"))?;
                let path_global = ctx.program.global_const_char_array(path);
                let open = if column.ty == SqlType::BigInt {
                    ctx.rt.disk_index_open_i64
                } else {
                    ctx.rt.disk_index_open_i32
                };
                let index = ctx.program.call(open, &[path_global])?;
                let key = literal_as_i64(lit)?;
                let key_const = ctx.program.const_i64(key);
                let bucket = ctx.program.alloca(ctx.rt.types.index_bucket, 1)?;
                ctx.program
                    .call(ctx.rt.disk_index_get_bucket, &[index, key_const, bucket])?;

                // An empty bucket proves the scan yields nothing.
                let len_field = ctx.program.const_gep(bucket, &[0, 1])?;
                let len = ctx.program.load_i32(len_field)?;
                let zero = ctx.program.const_i32(0);
                let empty = ctx.program.cmp_i32(CompType::Eq, len, zero)?;
                let guard = begin_if(&mut ctx.program, empty)?;
                ctx.program.ret()?;
                guard.end(&mut ctx.program)?;

                ctx.program.call(ctx.rt.bucket_array_push, &[arr, bucket])?;
            }
        }

        // 4. Driver state the executor rewrites in place.
        let i32_ty = ctx.program.i32_type();
        let zero32 = ctx.program.const_i32(0);

        let active_ty = ctx.program.array_type(i32_ty, num_index.max(1) as u32);
        let zeros = vec![zero32; num_index.max(1)];
        let active_init = ctx.program.constant_array(active_ty, &zeros);
        let active_index = ctx.program.global(active_ty, active_init);
        let active_size = ctx.program.global(i32_ty, zero32);
        let progress = ctx.program.global(i32_ty, zero32);

        let result_ty = ctx.program.array_type(i32_ty, RESULT_MAX);
        let result_zeros = vec![zero32; RESULT_MAX as usize];
        let result_init = ctx.program.constant_array(result_ty, &result_zeros);
        let result_array = ctx.program.global(result_ty, result_init);

        let mut fn_ptrs = Vec::with_capacity(pred_fns.len());
        for &f in &pred_fns {
            let ptr = ctx.program.get_function_pointer(f);
            fn_ptrs.push(ctx.program.ptr_cast(ptr, i8p)?);
        }
        let pred_arr_ty = ctx.program.array_type(i8p, pred_fns.len() as u32);
        let pred_arr_init = ctx.program.constant_array(pred_arr_ty, &fn_ptrs);
        let pred_array = ctx.program.global(pred_arr_ty, pred_arr_init);

        let positions: Vec<Value> = self
            .index_filters
            .iter()
            .map(|&fi| ctx.program.const_i32(fi as i32))
            .collect();
        let positions_ty = ctx.program.array_type(i32_ty, num_index.max(1) as u32);
        let positions_init = if positions.is_empty() {
            ctx.program.constant_array(positions_ty, &zeros)
        } else {
            ctx.program.constant_array(positions_ty, &positions)
        };
        let positions_array = ctx.program.global(positions_ty, positions_init);

        // 5. The base driver.
        let base_fn = self.emit_base(
            this,
            tree,
            ctx,
            &buffer,
            &pred_layout,
            pred_struct_raw,
            &pred_cols,
            pred_fns.len(),
            bucket_array_global,
            active_index,
            active_size,
            progress,
            result_array,
            pred_array,
        )?;

        // 6. Hand control to the UCB executor.
        let cardinality = buffer.size(&mut ctx.program, &ctx.rt)?;
        ctx.program.store_i32(progress, cardinality)?;

        let base_ptr = ctx.program.get_function_pointer(base_fn);
        let base_raw = ctx.program.ptr_cast(base_ptr, i8p)?;
        let num_preds = ctx.program.const_i32(pred_fns.len() as i32);
        let pred_array_head = ctx.program.const_gep(pred_array, &[0, 0])?;
        let pred_array_raw = ctx.program.ptr_cast(pred_array_head, i8p)?;
        let positions_head = ctx.program.const_gep(positions_array, &[0, 0])?;
        let num_index_const = ctx.program.const_i32(num_index as i32);
        let active_head = ctx.program.const_gep(active_index, &[0, 0])?;
        let args = [
            base_raw,
            num_preds,
            pred_array_raw,
            ctx.program.materialize_if_gep(positions_head)?,
            num_index_const,
            ctx.program.materialize_if_gep(active_head)?,
            active_size,
            progress,
        ];
        ctx.program.call(ctx.rt.execute_permutable_scan_select, &args)?;

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

impl SkinnerScanSelectTranslator {
    /// Emits `base(budget, next_tuple) -> i32`: consumes at most `budget`
    /// tuples, returning the leftover budget on completion or -2 with the
    /// progress global holding the last tuple examined.
    #[allow(clippy::too_many_arguments)]
    fn emit_base(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
        buffer: &DiskMaterializedBuffer,
        pred_layout: &RowLayout,
        pred_struct_raw: Value,
        pred_cols: &[usize],
        num_preds: usize,
        bucket_array_global: Value,
        active_index: Value,
        active_size: Value,
        progress: Value,
        result_array: Value,
        pred_array: Value,
    ) -> VeldResult<FunctionRef> {
        let saved = ctx.program.current_function();
        let i32_ty = ctx.program.i32_type();
        let base_fn = ctx.program.create_public_function(
            i32_ty,
            &[i32_ty, i32_ty],
            &format!("scan_base_{this}"),
        )?;
        let args = ctx.program.get_function_arguments(base_fn);
        let (initial_budget, next_tuple) = (args[0], args[1]);

        let i1_ty = ctx.program.i1_type();
        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);
        let pred_fn_ty = ctx.program.function_type(i1_ty, &[]);
        let pred_fn_ptr_ty = ctx.program.pointer_type(pred_fn_ty);

        let cardinality = buffer.size(&mut ctx.program, &ctx.rt)?;
        let views = buffer.text_views(&mut ctx.program, &ctx.rt)?;
        let index_size = ctx.program.load_i32(active_size)?;
        let zero = ctx.program.const_i32(0);
        let one = ctx.program.const_i32(1);
        let has_index = ctx.program.cmp_i32(CompType::Gt, index_size, zero)?;
        let total_preds = ctx.program.const_i32(num_preds as i32);
        let num_scan_preds = ctx.program.sub_i32(total_preds, index_size)?;
        let result_head = ctx.program.const_gep(result_array, &[0, 0])?;
        let result_head = ctx.program.materialize_if_gep(result_head)?;
        let active_head = ctx.program.const_gep(active_index, &[0, 0])?;
        let active_head = ctx.program.materialize_if_gep(active_head)?;
        let pred_head = ctx.program.const_gep(pred_array, &[0, 0])?;

        // Shared per-tuple body: stores the predicate columns, runs the
        // scan-suffix predicates, and on success pushes the tuple upward.
        // `reject` receives the insertion point when a predicate fails.
        let mut emit_tuple = |tree: &mut TranslatorTree,
                              ctx: &mut CompileContext,
                              tuple: Value,
                              reject: &dyn Fn(&mut CompileContext) -> VeldResult<()>|
         -> VeldResult<()> {
            // Predicate columns into the shared struct.
            let mut pred_values = Vec::with_capacity(pred_cols.len());
            for &slot in pred_cols {
                pred_values.push(buffer.get(&mut ctx.program, &ctx.rt, tuple, slot, views[slot])?);
            }
            pred_layout.pack_borrowed(&mut ctx.program, &ctx.rt, pred_struct_raw, &pred_values)?;

            // Evaluate the scan-suffix predicates through the pointer array.
            let plp = Loop::new(&mut ctx.program, &[zero])?;
            let pi = plp.var(0);
            let more = ctx.program.cmp_i32(CompType::Lt, pi, num_scan_preds)?;
            plp.enter_body(&mut ctx.program, more)?;
            let slot_ptr = ctx.program.dynamic_gep(pred_head, pi, &[])?;
            let raw_fn = ctx.program.load_ptr(slot_ptr)?;
            let typed_fn = ctx.program.ptr_cast(raw_fn, pred_fn_ptr_ty)?;
            let pass = ctx.program.call_indirect(typed_fn, pred_fn_ty, &[])?;
            let fail = ctx.program.lnot_i1(pass)?;
            let guard = begin_if(&mut ctx.program, fail)?;
            reject(ctx)?;
            guard.end(&mut ctx.program)?;
            let next_pi = ctx.program.add_i32(pi, one)?;
            plp.continue_with(&mut ctx.program, &[next_pi])?;
            plp.exit(&mut ctx.program)?;

            // Survivors: full tuple to the parent.
            let mut virtuals = Vec::with_capacity(self.columns.len());
            for slot in 0..self.columns.len() {
                virtuals.push(buffer.get(&mut ctx.program, &ctx.rt, tuple, slot, views[slot])?);
            }
            tree.nodes[this].virtual_values.set_all(virtuals);
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)
        };

        let path = begin_if_else(&mut ctx.program, has_index)?;
        {
            // Sorted-intersection path over the active buckets.
            let arr = ctx.program.load_ptr(bucket_array_global)?;
            ctx.program
                .call(ctx.rt.bucket_array_init_intersection, &[arr, next_tuple])?;
            let max = ctx.program.const_i32(RESULT_MAX as i32);
            let first_count = ctx.program.call(
                ctx.rt.bucket_array_populate,
                &[arr, result_head, max, active_head, index_size],
            )?;

            let outer = Loop::new(&mut ctx.program, &[initial_budget, first_count])?;
            let budget_in = outer.var(0);
            let count = outer.var(1);
            let more = ctx.program.cmp_i32(CompType::Gt, count, zero)?;
            outer.enter_body(&mut ctx.program, more)?;
            {
                let inner = Loop::new(&mut ctx.program, &[zero, budget_in])?;
                let k = inner.var(0);
                let budget = inner.var(1);
                let more = ctx.program.cmp_i32(CompType::Lt, k, count)?;
                inner.enter_body(&mut ctx.program, more)?;

                let slot_ptr = ctx.program.dynamic_gep(result_head, k, &[])?;
                let tuple = ctx.program.load_i32(slot_ptr)?;

                let spent = ctx.program.sub_i32(budget, one)?;
                let exhausted = ctx.program.cmp_i32(CompType::Eq, spent, zero)?;
                let guard = begin_if(&mut ctx.program, exhausted)?;
                ctx.program.store_i32(progress, tuple)?;
                let minus_two = ctx.program.const_i32(-2);
                ctx.program.ret_value(minus_two)?;
                guard.end(&mut ctx.program)?;

                let next_k = ctx.program.add_i32(k, one)?;
                let inner_ref = &inner;
                emit_tuple(tree, ctx, tuple, &move |ctx: &mut CompileContext| {
                    inner_ref.continue_with(&mut ctx.program, &[next_k, spent])
                })?;

                inner.continue_with(&mut ctx.program, &[next_k, spent])?;
                inner.exit(&mut ctx.program)?;

                let budget_left = inner.var(1);
                let next_count = ctx.program.call(
                    ctx.rt.bucket_array_populate,
                    &[arr, result_head, max, active_head, index_size],
                )?;
                outer.continue_with(&mut ctx.program, &[budget_left, next_count])?;
            }
            outer.exit(&mut ctx.program)?;

            ctx.program.store_i32(progress, cardinality)?;
            let budget_left = outer.var(0);
            ctx.program.ret_value(budget_left)?;
        }
        path.else_branch(&mut ctx.program)?;
        {
            // Sequential path from next_tuple.
            let lp = Loop::new(&mut ctx.program, &[next_tuple, initial_budget])?;
            let i = lp.var(0);
            let budget = lp.var(1);
            let more = ctx.program.cmp_i32(CompType::Lt, i, cardinality)?;
            lp.enter_body(&mut ctx.program, more)?;

            let spent = ctx.program.sub_i32(budget, one)?;
            let exhausted = ctx.program.cmp_i32(CompType::Eq, spent, zero)?;
            let guard = begin_if(&mut ctx.program, exhausted)?;
            ctx.program.store_i32(progress, i)?;
            let minus_two = ctx.program.const_i32(-2);
            ctx.program.ret_value(minus_two)?;
            guard.end(&mut ctx.program)?;

            let next_i = ctx.program.add_i32(i, one)?;
            let lp_ref = &lp;
            emit_tuple(tree, ctx, i, &move |ctx: &mut CompileContext| {
                lp_ref.continue_with(&mut ctx.program, &[next_i, spent])
            })?;

            lp.continue_with(&mut ctx.program, &[next_i, spent])?;
            lp.exit(&mut ctx.program)?;

            ctx.program.store_i32(progress, cardinality)?;
            let budget_left = lp.var(1);
            ctx.program.ret_value(budget_left)?;
        }
        path.end(&mut ctx.program)?;
        // Both paths returned; the join block is unreachable and the
        // simplifier deletes it, but it still needs a terminator.
        let zero_ret = ctx.program.const_i32(0);
        ctx.program.ret_value(zero_ret)?;

        ctx.program.set_current_function(saved);
        Ok(base_fn)
    }
}
