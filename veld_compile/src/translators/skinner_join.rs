//! Adaptive n-way join (permutable)
//!
//! Children materialize into row vectors, one pipeline each. The join emits
//! one handler function per table plus a valid-tuple handler; handlers chain
//! through a position-indexed function-pointer array the host executor
//! rewrites per ordering, evaluate the predicates flagged for their table,
//! and yield (-1) when the budget drains. Output tuples are deduped across
//! orderings through the shared tuple-index set and streamed to the parent
//! after the executor finishes.

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, FunctionRef, Value};
use veld_plan::{Expr, OperatorNode, OperatorSchema};

use crate::control_flow::{begin_if, ternary, Loop};
use crate::row_layout::RowLayout;
use crate::translators::aggregate::zero_struct_constant;
use crate::translators::{child_schema_types, CompileContext, OperatorTranslator, TranslatorTree};

/// Shared materialization state: one row vector per child (filled by that
/// child's pipeline) plus its layout and a global row struct used to pass
/// the current tuple between emitted functions.
#[derive(Clone)]
pub struct MaterializedChildren {
    pub layouts: Vec<RowLayout>,
    pub vectors: Vec<Value>,
    pub value_structs: Vec<Value>,
    pub value_struct_raws: Vec<Value>,
}

impl MaterializedChildren {
    pub fn new(
        op_children_types: &[Vec<(SqlType, bool)>],
        ctx: &mut CompileContext,
    ) -> VeldResult<Self> {
        let mut layouts = Vec::new();
        let mut vectors = Vec::new();
        let mut value_structs = Vec::new();
        let mut value_struct_raws = Vec::new();
        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);

        for types in op_children_types {
            let layout = RowLayout::new(&mut ctx.program, &ctx.rt, types)?;
            let zero64 = ctx.program.const_i64(0);
            let zero32 = ctx.program.const_i32(0);
            let nullp = ctx.program.nullptr(i8_ty);
            let vec_init = ctx
                .program
                .constant_struct(ctx.rt.types.vector, &[zero64, zero32, zero32, nullp]);
            let vector = ctx.program.global(ctx.rt.types.vector, vec_init);
            let struct_init = zero_struct_constant(&mut ctx.program, layout.ir_type)?;
            let value_struct = ctx.program.global(layout.ir_type, struct_init);
            let raw = ctx.program.ptr_cast(value_struct, i8p)?;
            layouts.push(layout);
            vectors.push(vector);
            value_structs.push(value_struct);
            value_struct_raws.push(raw);
        }
        Ok(Self { layouts, vectors, value_structs, value_struct_raws })
    }

    /// One fill pipeline per child: create the vector, drain the child.
    pub fn fill(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let children = tree.nodes[this].children.clone();
        for (t, &child) in children.iter().enumerate() {
            let outer_fn = ctx.program.current_function();
            ctx.pipelines.create_pipeline();
            let name = ctx.pipelines.current().body.clone();
            let void = ctx.program.void_type();
            ctx.program.create_public_function(void, &[], &name)?;
            let elem = ctx.program.const_i64(self.layouts[t].size(&ctx.program) as i64);
            let cap = ctx.program.const_i32(16);
            ctx.program.call(ctx.rt.vector_create, &[self.vectors[t], elem, cap])?;
            tree.produce(child, ctx)?;
            ctx.program.ret()?;
            let fill = ctx.pipelines.finish_pipeline();
            ctx.pipelines.add_predecessor(fill);
            ctx.program.set_current_function(outer_fn);
        }
        Ok(())
    }
}

pub struct SkinnerJoinTranslator {
    conditions: Vec<Expr>,
    schema: OperatorSchema,
    child_types: Vec<Vec<(SqlType, bool)>>,
    materialized: std::cell::RefCell<Option<MaterializedChildren>>,
}

impl SkinnerJoinTranslator {
    pub fn new(conditions: &[Expr], schema: &OperatorSchema, op: &OperatorNode) -> Self {
        let child_types =
            (0..op.children.len()).map(|t| child_schema_types(op, t)).collect();
        Self {
            conditions: conditions.to_vec(),
            schema: schema.clone(),
            child_types,
            materialized: std::cell::RefCell::new(None),
        }
    }
}

/// Bitmask of the children a predicate touches.
pub fn tables_of(condition: &Expr) -> u64 {
    let mut mask = 0u64;
    for (child, _) in condition.referenced_columns() {
        mask |= 1 << child;
    }
    mask
}

impl OperatorTranslator for SkinnerJoinTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let n = self.child_types.len();
        let n_preds = self.conditions.len();
        let children = tree.nodes[this].children.clone();

        let materialized = MaterializedChildren::new(&self.child_types, ctx)?;
        let vectors = materialized.vectors.clone();
        let layouts = materialized.layouts.clone();
        let value_struct_raws = materialized.value_struct_raws.clone();
        *self.materialized.borrow_mut() = Some(materialized.clone());
        materialized.fill(this, tree, ctx)?;

        // Globals the executor and the handlers share.
        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);
        let i32_ty = ctx.program.i32_type();
        let i64_ty = ctx.program.i64_type();
        let zero32 = ctx.program.const_i32(0);

        let i32_arr = ctx.program.array_type(i32_ty, n as u32);
        let zeroes32 = vec![zero32; n];
        let idx_init = ctx.program.constant_array(i32_arr, &zeroes32);
        let idx_arr = ctx.program.global(i32_arr, idx_init);
        let pos_init = ctx.program.constant_array(i32_arr, &zeroes32);
        let table_positions = ctx.program.global(i32_arr, pos_init);
        let card_init = ctx.program.constant_array(i32_arr, &zeroes32);
        let cardinalities = ctx.program.global(i32_arr, card_init);

        let flag_ty = ctx.program.array_type(i8_ty, (n * n_preds).max(1) as u32);
        let zero8 = ctx.program.const_i8(0);
        let flag_zeroes = vec![zero8; (n * n_preds).max(1)];
        let flag_init = ctx.program.constant_array(flag_ty, &flag_zeroes);
        let flag_arr = ctx.program.global(flag_ty, flag_init);

        let masks: Vec<Value> = self
            .conditions
            .iter()
            .map(|c| ctx.program.const_i64(tables_of(c) as i64))
            .collect();
        let i64_arr = ctx.program.array_type(i64_ty, n_preds.max(1) as u32);
        let masks_init = if masks.is_empty() {
            let zero64 = ctx.program.const_i64(0);
            let z = vec![zero64];
            ctx.program.constant_array(i64_arr, &z)
        } else {
            ctx.program.constant_array(i64_arr, &masks)
        };
        let tables_per_pred = ctx.program.global(i64_arr, masks_init);

        let ptr_arr = ctx.program.array_type(i8p, (n + 1) as u32);
        let nullp = ctx.program.nullptr(i8_ty);
        let ptr_zeroes = vec![nullp; n + 1];
        let positions_init = ctx.program.constant_array(ptr_arr, &ptr_zeroes);
        let handler_positions = ctx.program.global(ptr_arr, positions_init);

        let tit_global = ctx.program.global(i8p, nullp);

        // Predicate functions: unpack the referenced tables' value structs,
        // evaluate, null collapses to false.
        let mut pred_fns = Vec::with_capacity(n_preds);
        for (pi, condition) in self.conditions.iter().enumerate() {
            let saved = ctx.program.current_function();
            let i1 = ctx.program.i1_type();
            let func = ctx
                .program
                .create_public_function(i1, &[], &format!("join_pred_{this}_{pi}"))?;
            let mask = tables_of(condition);
            for (t, &child) in children.iter().enumerate() {
                if mask & (1 << t) != 0 {
                    let values =
                        layouts[t].unpack(&mut ctx.program, &ctx.rt, value_struct_raws[t])?;
                    tree.nodes[child].values.set_all(values);
                }
            }
            let value = tree.compute(condition, this, ctx)?;
            let guard = begin_if(&mut ctx.program, value.null)?;
            let f = ctx.program.const_i1(false);
            ctx.program.ret_value(f)?;
            guard.end(&mut ctx.program)?;
            ctx.program.ret_value(value.val.raw())?;
            ctx.program.set_current_function(saved);
            pred_fns.push(func);
        }

        // Valid-tuple handler: dedupe-insert the current index tuple.
        let handler_ty = {
            let i32_ty = ctx.program.i32_type();
            ctx.program.function_type(i32_ty, &[i32_ty])
        };
        let valid_fn = {
            let saved = ctx.program.current_function();
            let func = ctx.program.create_public_function(
                i32_ty,
                &[i32_ty],
                &format!("join_valid_{this}"),
            )?;
            let budget = ctx.program.get_function_arguments(func)[0];
            let tit = ctx.program.load_ptr(tit_global)?;
            let head = ctx.program.const_gep(idx_arr, &[0, 0])?;
            let head = ctx.program.materialize_if_gep(head)?;
            let n_const = ctx.program.const_i32(n as i32);
            ctx.program.call(ctx.rt.tit_insert, &[tit, head, n_const])?;
            ctx.program.ret_value(budget)?;
            ctx.program.set_current_function(saved);
            func
        };

        // Per-table handlers.
        let mut table_handlers = Vec::with_capacity(n);
        for t in 0..n {
            table_handlers.push(self.emit_table_handler(
                this,
                t,
                ctx,
                &layouts,
                &vectors,
                &value_struct_raws,
                &pred_fns,
                handler_ty,
                idx_arr,
                table_positions,
                cardinalities,
                flag_arr,
                handler_positions,
            )?);
        }

        // Base driver: run the handler at position zero.
        let base_fn = {
            let saved = ctx.program.current_function();
            let func = ctx.program.create_public_function(
                i32_ty,
                &[i32_ty],
                &format!("join_base_{this}"),
            )?;
            let budget = ctx.program.get_function_arguments(func)[0];
            let head = ctx.program.const_gep(handler_positions, &[0, 0])?;
            let first = ctx.program.load_ptr(head)?;
            let handler_ptr_ty = ctx.program.pointer_type(handler_ty);
            let typed = ctx.program.ptr_cast(first, handler_ptr_ty)?;
            let r = ctx.program.call_indirect(typed, handler_ty, &[budget])?;
            ctx.program.ret_value(r)?;
            ctx.program.set_current_function(saved);
            func
        };

        // Runtime state: cardinalities and the tuple-index set.
        for (t, vector) in vectors.iter().enumerate() {
            let size = ctx.program.call(ctx.rt.vector_size, &[*vector])?;
            let slot = ctx.program.const_gep(cardinalities, &[0, t as i32])?;
            ctx.program.store_i32(slot, size)?;
        }
        let tit = ctx.program.call(ctx.rt.tit_create, &[])?;
        ctx.program.store_ptr(tit_global, tit)?;

        // Handler table for the executor to permute.
        let mut handler_ptrs = Vec::with_capacity(n);
        for &f in &table_handlers {
            let ptr = ctx.program.get_function_pointer(f);
            handler_ptrs.push(ctx.program.ptr_cast(ptr, i8p)?);
        }
        let handlers_arr_ty = ctx.program.array_type(i8p, n as u32);
        let handlers_init = ctx.program.constant_array(handlers_arr_ty, &handler_ptrs);
        let handlers_array = ctx.program.global(handlers_arr_ty, handlers_init);

        let base_ptr = ctx.program.get_function_pointer(base_fn);
        let base_raw = ctx.program.ptr_cast(base_ptr, i8p)?;
        let valid_ptr = ctx.program.get_function_pointer(valid_fn);
        let valid_raw = ctx.program.ptr_cast(valid_ptr, i8p)?;

        let n_const = ctx.program.const_i32(n as i32);
        let n_preds_const = ctx.program.const_i32(n_preds as i32);
        let handlers_head = ctx.program.const_gep(handlers_array, &[0, 0])?;
        let handlers_head = ctx.program.ptr_cast(handlers_head, i8p)?;
        let positions_head = ctx.program.const_gep(handler_positions, &[0, 0])?;
        let positions_head = ctx.program.ptr_cast(positions_head, i8p)?;
        let table_pos_head = ctx.program.const_gep(table_positions, &[0, 0])?;
        let table_pos_head = ctx.program.materialize_if_gep(table_pos_head)?;
        let flag_head = ctx.program.const_gep(flag_arr, &[0, 0])?;
        let flag_head = ctx.program.materialize_if_gep(flag_head)?;
        let masks_head = ctx.program.const_gep(tables_per_pred, &[0, 0])?;
        let masks_head = ctx.program.materialize_if_gep(masks_head)?;
        let card_head = ctx.program.const_gep(cardinalities, &[0, 0])?;
        let card_head = ctx.program.materialize_if_gep(card_head)?;
        let idx_head = ctx.program.const_gep(idx_arr, &[0, 0])?;
        let idx_head = ctx.program.materialize_if_gep(idx_head)?;

        ctx.program.call(
            ctx.rt.execute_permutable_join,
            &[
                n_const,
                n_preds_const,
                base_raw,
                handlers_head,
                valid_raw,
                positions_head,
                table_pos_head,
                flag_head,
                masks_head,
                card_head,
                idx_head,
            ],
        )?;

        // Output: walk the deduped tuple set in order.
        let tit = ctx.program.load_ptr(tit_global)?;
        let it = ctx.program.call(ctx.rt.tit_iter_create, &[tit, n_const])?;
        let total = ctx.program.call(ctx.rt.tit_iter_size, &[it])?;
        let lp = Loop::new(&mut ctx.program, &[zero32])?;
        let j = lp.var(0);
        let more = ctx.program.cmp_i32(CompType::Lt, j, total)?;
        lp.enter_body(&mut ctx.program, more)?;
        {
            let tuple_ptr = ctx.program.call(ctx.rt.tit_iter_get, &[it, j])?;
            for (t, &child) in children.iter().enumerate() {
                let offset = ctx.program.const_i32(t as i32);
                let slot = ctx.program.dynamic_gep(tuple_ptr, offset, &[])?;
                let row_idx = ctx.program.load_i32(slot)?;
                let row = ctx.program.call(ctx.rt.vector_get, &[vectors[t], row_idx])?;
                let values = layouts[t].unpack(&mut ctx.program, &ctx.rt, row)?;
                tree.nodes[child].values.set_all(values);
            }
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)?;
        }
        let one = ctx.program.const_i32(1);
        let next = ctx.program.add_i32(j, one)?;
        lp.continue_with(&mut ctx.program, &[next])?;
        lp.exit(&mut ctx.program)?;

        ctx.program.call(ctx.rt.tit_iter_free, &[it])?;
        ctx.program.call(ctx.rt.tit_free, &[tit])?;
        for vector in &vectors {
            ctx.program.call(ctx.rt.vector_free, &[*vector])?;
        }
        Ok(())
    }

    fn consume(
        &self,
        _this: usize,
        src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        // Materialization: append the child tuple to its vector.
        let m = self
            .materialized
            .borrow()
            .clone()
            .expect("join consumed before produce");
        let parent_children = {
            let parent = tree.nodes[src].parent.expect("child has parent");
            tree.nodes[parent].children.clone()
        };
        let t = parent_children.iter().position(|&c| c == src).expect("unknown child");
        let row = ctx.program.call(ctx.rt.vector_push_back, &[m.vectors[t]])?;
        let values = tree.nodes[src].values.all().to_vec();
        m.layouts[t].pack(&mut ctx.program, &ctx.rt, row, &values)
    }
}

impl SkinnerJoinTranslator {
    /// `handler_t(budget) -> i32`: walks table `t`'s buffer (resuming from
    /// the saved index when it leads the current order), binds each row into
    /// the table's value struct, evaluates the predicates flagged for this
    /// table, and chains to the handler at the next position.
    #[allow(clippy::too_many_arguments)]
    fn emit_table_handler(
        &self,
        this: usize,
        t: usize,
        ctx: &mut CompileContext,
        layouts: &[RowLayout],
        vectors: &[Value],
        value_struct_raws: &[Value],
        pred_fns: &[FunctionRef],
        handler_ty: veld_ir::Type,
        idx_arr: Value,
        table_positions: Value,
        cardinalities: Value,
        flag_arr: Value,
        handler_positions: Value,
    ) -> VeldResult<FunctionRef> {
        let saved = ctx.program.current_function();
        let i32_ty = ctx.program.i32_type();
        let func = ctx.program.create_public_function(
            i32_ty,
            &[i32_ty],
            &format!("join_table_{this}_{t}"),
        )?;
        let initial_budget = ctx.program.get_function_arguments(func)[0];

        let zero = ctx.program.const_i32(0);
        let one = ctx.program.const_i32(1);
        let n_preds = self.conditions.len();

        let pos_slot = ctx.program.const_gep(table_positions, &[0, t as i32])?;
        let pos = ctx.program.load_i32(pos_slot)?;
        let is_top = ctx.program.cmp_i32(CompType::Eq, pos, zero)?;
        let idx_slot = ctx.program.const_gep(idx_arr, &[0, t as i32])?;
        let idx_slot = ctx.program.materialize_if_gep(idx_slot)?;
        let resume = ctx.program.load_i32(idx_slot)?;
        let start = ternary(
            &mut ctx.program,
            is_top,
            |_| Ok(vec![resume]),
            |_| Ok(vec![zero]),
        )?[0];

        let card_slot = ctx.program.const_gep(cardinalities, &[0, t as i32])?;
        let cardinality = ctx.program.load_i32(card_slot)?;

        let lp = Loop::new(&mut ctx.program, &[start, initial_budget])?;
        let i = lp.var(0);
        let budget = lp.var(1);
        let more = ctx.program.cmp_i32(CompType::Lt, i, cardinality)?;
        lp.enter_body(&mut ctx.program, more)?;
        {
            ctx.program.store_i32(idx_slot, i)?;
            let spent = ctx.program.sub_i32(budget, one)?;
            let exhausted = ctx.program.cmp_i32(CompType::Eq, spent, zero)?;
            let guard = begin_if(&mut ctx.program, exhausted)?;
            let minus_one = ctx.program.const_i32(-1);
            ctx.program.ret_value(minus_one)?;
            guard.end(&mut ctx.program)?;

            // Bind the row into this table's value struct.
            let row = ctx.program.call(ctx.rt.vector_get, &[vectors[t], i])?;
            let values = layouts[t].unpack(&mut ctx.program, &ctx.rt, row)?;
            layouts[t].pack_borrowed(&mut ctx.program, &ctx.rt, value_struct_raws[t], &values)?;

            // Predicates flagged for this table under the current order.
            let next_i = ctx.program.add_i32(i, one)?;
            for (pi, &pred_fn) in pred_fns.iter().enumerate() {
                let flag_slot = ctx
                    .program
                    .const_gep(flag_arr, &[0, (t * n_preds + pi) as i32])?;
                let flag = ctx.program.load_i8(flag_slot)?;
                let zero8 = ctx.program.const_i8(0);
                let active = ctx.program.cmp_i8(CompType::Ne, flag, zero8)?;
                let check = begin_if(&mut ctx.program, active)?;
                let pass = ctx.program.call(pred_fn, &[])?;
                let fail = ctx.program.lnot_i1(pass)?;
                let reject = begin_if(&mut ctx.program, fail)?;
                lp.continue_with(&mut ctx.program, &[next_i, spent])?;
                reject.end(&mut ctx.program)?;
                check.end(&mut ctx.program)?;
            }

            // Chain to the next position's handler.
            let next_pos = ctx.program.add_i32(pos, one)?;
            let positions_head = ctx.program.const_gep(handler_positions, &[0, 0])?;
            let positions_head = ctx.program.materialize_if_gep(positions_head)?;
            let next_slot = ctx.program.dynamic_gep(positions_head, next_pos, &[])?;
            let next_raw = ctx.program.load_ptr(next_slot)?;
            let handler_ptr_ty = ctx.program.pointer_type(handler_ty);
            let typed = ctx.program.ptr_cast(next_raw, handler_ptr_ty)?;
            let r = ctx.program.call_indirect(typed, handler_ty, &[spent])?;

            let yielded = ctx.program.cmp_i32(CompType::Lt, r, zero)?;
            let guard = begin_if(&mut ctx.program, yielded)?;
            let minus_one = ctx.program.const_i32(-1);
            ctx.program.ret_value(minus_one)?;
            guard.end(&mut ctx.program)?;

            lp.continue_with(&mut ctx.program, &[next_i, r])?;
        }
        lp.exit(&mut ctx.program)?;
        let remaining = lp.var(1);
        ctx.program.ret_value(remaining)?;

        ctx.program.set_current_function(saved);
        Ok(func)
    }
}
