//! Grouped aggregation
//!
//! A hash table keyed by the group-by fingerprint holds one row per group:
//! the group columns (with null bytes) followed by the aggregate states.
//! Probes compare the full group key before updating; a second pipeline
//! walks every bucket and pushes each group's row.

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, Type, Value};
use veld_plan::{Expr, OperatorSchema};

use crate::control_flow::{begin_if, begin_if_else, Loop};
use crate::hashing::fingerprint;
use crate::row_layout::{ir_field_type, RowLayout};
use crate::translators::aggregate::{plan_aggregators, Aggregator};
use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::{IrVal, SqlValue};

pub struct GroupByAggregateTranslator {
    group_by: Vec<Expr>,
    aggregates: Vec<Expr>,
    schema: OperatorSchema,
    state: std::cell::RefCell<Option<GroupByState>>,
}

#[derive(Clone)]
struct GroupByState {
    table: Value,
    group_layout: RowLayout,
    aggregators: std::rc::Rc<Vec<Aggregator>>,
}

impl GroupByAggregateTranslator {
    pub fn new(group_by: &[Expr], aggregates: &[Expr], schema: &OperatorSchema) -> Self {
        Self {
            group_by: group_by.to_vec(),
            aggregates: aggregates.to_vec(),
            schema: schema.clone(),
            state: std::cell::RefCell::new(None),
        }
    }
}

impl OperatorTranslator for GroupByAggregateTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        // Row layout: group fields, group null bytes, then aggregate state.
        let group_types: Vec<(SqlType, bool)> =
            self.group_by.iter().map(|g| (g.ty(), g.nullable())).collect();
        let mut fields: Vec<Type> = Vec::new();
        for &(ty, _) in &group_types {
            fields.push(ir_field_type(&mut ctx.program, &ctx.rt, ty));
        }
        for _ in &group_types {
            fields.push(ctx.program.i8_type());
        }
        // Aggregate fields start after the group span.
        let aggregators =
            plan_aggregators(&mut ctx.program, &ctx.rt, &self.aggregates, &mut fields)?;
        let aggregators = std::rc::Rc::new(aggregators);
        let row_ty = ctx.program.struct_type(&fields, None)?;
        let group_layout = RowLayout { ir_type: row_ty, columns: group_types };
        let element_size = group_layout.size(&ctx.program) as i64;

        let i8_ty = ctx.program.i8_type();
        let null = ctx.program.nullptr(i8_ty);
        let zero = ctx.program.const_i64(0);
        let init = ctx.program.constant_struct(ctx.rt.types.hash_table, &[zero, null]);
        let table = ctx.program.global(ctx.rt.types.hash_table, init);
        *self.state.borrow_mut() = Some(GroupByState {
            table,
            group_layout: group_layout.clone(),
            aggregators: aggregators.clone(),
        });

        // Build pipeline drains the child into the table.
        let outer_fn = ctx.program.current_function();
        ctx.pipelines.create_pipeline();
        let name = ctx.pipelines.current().body.clone();
        let void = ctx.program.void_type();
        ctx.program.create_public_function(void, &[], &name)?;
        let size_const = ctx.program.const_i64(element_size);
        ctx.program.call(ctx.rt.hash_table_create, &[table, size_const])?;
        let child = tree.nodes[this].children[0];
        tree.produce(child, ctx)?;
        ctx.program.ret()?;
        let build = ctx.pipelines.finish_pipeline();
        ctx.pipelines.add_predecessor(build);
        ctx.program.set_current_function(outer_fn);

        // Second pass: iterate every bucket entry and push the group.
        let layout = group_layout;
        let list = ctx.program.alloca(ctx.rt.types.bucket_list, 1)?;
        ctx.program.call(ctx.rt.hash_table_get_all_buckets, &[table, list])?;
        let count_field = ctx.program.const_gep(list, &[0, 0])?;
        let num_buckets = ctx.program.load_i32(count_field)?;

        let zero32 = ctx.program.const_i32(0);
        let outer = Loop::new(&mut ctx.program, &[zero32])?;
        let b = outer.var(0);
        let more = ctx.program.cmp_i32(CompType::Lt, b, num_buckets)?;
        outer.enter_body(&mut ctx.program, more)?;
        {
            let bucket = ctx.program.call(ctx.rt.bucket_list_get, &[list, b])?;
            let entries = ctx.program.call(ctx.rt.vector_size, &[bucket])?;
            let zero32 = ctx.program.const_i32(0);
            let inner = Loop::new(&mut ctx.program, &[zero32])?;
            let e = inner.var(0);
            let more = ctx.program.cmp_i32(CompType::Lt, e, entries)?;
            inner.enter_body(&mut ctx.program, more)?;

            let row = ctx.program.call(ctx.rt.vector_get, &[bucket, e])?;
            let groups = layout.unpack(&mut ctx.program, &ctx.rt, row)?;
            let typed_row = layout.typed_row(&mut ctx.program, row)?;
            let mut virtuals = groups;
            for aggregator in aggregators.iter() {
                virtuals.push(aggregator.read(typed_row, ctx)?);
            }
            tree.nodes[this].virtual_values.set_all(virtuals);
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)?;

            let one = ctx.program.const_i32(1);
            let next = ctx.program.add_i32(e, one)?;
            inner.continue_with(&mut ctx.program, &[next])?;
            inner.exit(&mut ctx.program)?;
        }
        let one = ctx.program.const_i32(1);
        let next = ctx.program.add_i32(b, one)?;
        outer.continue_with(&mut ctx.program, &[next])?;
        outer.exit(&mut ctx.program)?;

        ctx.program.call(ctx.rt.bucket_list_free, &[list])?;
        ctx.program.call(ctx.rt.hash_table_free, &[table])?;
        Ok(())
    }

    fn consume(
        &self,
        this: usize,
        _src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let GroupByState { table, group_layout: layout, aggregators } = self
            .state
            .borrow()
            .clone()
            .expect("group-by consumed before produce");

        let keys: Vec<SqlValue> = self
            .group_by
            .iter()
            .map(|g| tree.compute(g, this, ctx))
            .collect::<VeldResult<_>>()?;
        let fp = fingerprint(&mut ctx.program, &ctx.rt, &keys)?;

        // Walk the bucket looking for the exact group; track the match with
        // a frame flag so the loop body can stay structured.
        let i8_ty = ctx.program.i8_type();
        let found_slot = ctx.program.alloca(i8_ty, 1)?;
        let zero8 = ctx.program.const_i8(0);
        ctx.program.store_i8(found_slot, zero8)?;

        let bucket = ctx.program.call(ctx.rt.hash_table_get_bucket, &[table, fp])?;
        let missing = ctx.program.ptr_cmp_nullptr(bucket)?;
        let present = ctx.program.lnot_i1(missing)?;
        let guard = begin_if(&mut ctx.program, present)?;
        {
            let entries = ctx.program.call(ctx.rt.vector_size, &[bucket])?;
            let zero32 = ctx.program.const_i32(0);
            let lp = Loop::new(&mut ctx.program, &[zero32])?;
            let e = lp.var(0);
            let more = ctx.program.cmp_i32(CompType::Lt, e, entries)?;
            lp.enter_body(&mut ctx.program, more)?;

            let row = ctx.program.call(ctx.rt.vector_get, &[bucket, e])?;
            let stored = layout.unpack(&mut ctx.program, &ctx.rt, row)?;
            let same = group_equal(&mut *ctx, &keys, &stored)?;
            let hit = begin_if(&mut ctx.program, same)?;
            {
                let typed_row = layout.typed_row(&mut ctx.program, row)?;
                for aggregator in aggregators.iter() {
                    aggregator.update(typed_row, this, tree, ctx)?;
                }
                let one8 = ctx.program.const_i8(1);
                ctx.program.store_i8(found_slot, one8)?;
                lp.break_out(&mut ctx.program)?;
            }
            hit.end(&mut ctx.program)?;

            let one = ctx.program.const_i32(1);
            let next = ctx.program.add_i32(e, one)?;
            lp.continue_with(&mut ctx.program, &[next])?;
            lp.exit(&mut ctx.program)?;
        }
        guard.end(&mut ctx.program)?;

        // No match: insert a fresh group row and initialize its aggregates.
        let byte = ctx.program.load_i8(found_slot)?;
        let zero8 = ctx.program.const_i8(0);
        let fresh = ctx.program.cmp_i8(CompType::Eq, byte, zero8)?;
        let guard = begin_if(&mut ctx.program, fresh)?;
        {
            let row = ctx.program.call(ctx.rt.hash_table_insert, &[table, fp])?;
            layout.pack(&mut ctx.program, &ctx.rt, row, &keys)?;
            let typed_row = layout.typed_row(&mut ctx.program, row)?;
            for aggregator in aggregators.iter() {
                aggregator.initialize(typed_row, this, tree, ctx)?;
            }
        }
        guard.end(&mut ctx.program)
    }
}

/// Equality of the probe keys against a stored group (null-aware: two nulls
/// match).
fn group_equal(
    ctx: &mut CompileContext,
    keys: &[SqlValue],
    stored: &[SqlValue],
) -> VeldResult<Value> {
    let mut all = ctx.program.const_i1(true);
    for (key, row) in keys.iter().zip(stored) {
        let string_equals = ctx.rt.string_equals;
        let p = &mut ctx.program;
        let value_eq = match (key.val, row.val) {
            (IrVal::Bool(a), IrVal::Bool(b)) => p.cmp_i1(CompType::Eq, a, b)?,
            (IrVal::I16(a), IrVal::I16(b)) => p.cmp_i16(CompType::Eq, a, b)?,
            (IrVal::I32(a), IrVal::I32(b)) | (IrVal::Date(a), IrVal::Date(b)) => {
                p.cmp_i32(CompType::Eq, a, b)?
            }
            (IrVal::I64(a), IrVal::I64(b)) => p.cmp_i64(CompType::Eq, a, b)?,
            (IrVal::F64(a), IrVal::F64(b)) => p.cmp_f64(CompType::Eq, a, b)?,
            (IrVal::Str(a), IrVal::Str(b)) => p.call(string_equals, &[a, b])?,
            _ => return Err(VeldError::codegen_error("group key type mismatch")),
        };
        let both_null = p.and_i1(key.null, row.null)?;
        let neither_null = {
            let a = p.lnot_i1(key.null)?;
            let b = p.lnot_i1(row.null)?;
            p.and_i1(a, b)?
        };
        let value_match = p.and_i1(neither_null, value_eq)?;
        let eq = p.or_i1(both_null, value_match)?;
        all = p.and_i1(all, eq)?;
    }
    Ok(all)
}
