//! Sorting
//!
//! Materializes the child into a vector, emits a lexicographic comparator
//! (ascending/descending per key, nulls first), sorts through the runtime's
//! stable merge sort, then streams the rows upward in order.

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, ProgramBuilder, Value};
use veld_plan::{Expr, OperatorNode, OperatorSchema, SortKey};

use crate::control_flow::{begin_if, Loop};
use crate::row_layout::RowLayout;
use crate::translators::{child_schema_types, CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::{IrVal, SqlValue};

pub struct OrderByTranslator {
    keys: Vec<SortKey>,
    schema: OperatorSchema,
    child_types: Vec<(SqlType, bool)>,
    state: std::cell::RefCell<Option<OrderByState>>,
}

#[derive(Clone)]
struct OrderByState {
    layout: RowLayout,
    vector: Value,
}

impl OrderByTranslator {
    pub fn new(keys: &[SortKey], schema: &OperatorSchema, op: &OperatorNode) -> Self {
        Self {
            keys: keys.to_vec(),
            schema: schema.clone(),
            child_types: child_schema_types(op, 0),
            state: std::cell::RefCell::new(None),
        }
    }

    /// Emits the comparator: `fn(a_row, b_row) -> i1` answering "a sorts at
    /// or before b" (ties keep the left element, which keeps the sort
    /// stable).
    fn emit_comparator(
        &self,
        layout: &RowLayout,
        ctx: &mut CompileContext,
    ) -> VeldResult<veld_ir::FunctionRef> {
        let saved = ctx.program.current_function();

        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);
        let i1 = ctx.program.i1_type();
        let func = ctx.program.create_function(i1, &[i8p, i8p])?;
        let args = ctx.program.get_function_arguments(func);

        let a_vals = layout.unpack(&mut ctx.program, &ctx.rt, args[0])?;
        let b_vals = layout.unpack(&mut ctx.program, &ctx.rt, args[1])?;

        for key in &self.keys {
            let column = match &key.expr {
                Expr::ColumnRef { column, .. } => *column,
                _ => {
                    return Err(VeldError::codegen_error(
                        "sort keys must be child column references",
                    ))
                }
            };
            // Descending order swaps the operands.
            let (a, b) = if key.asc {
                (a_vals[column], b_vals[column])
            } else {
                (b_vals[column], a_vals[column])
            };

            let string_less = ctx.rt.string_less_than;
            let p = &mut ctx.program;
            let lt = key_less(p, string_less, a, b)?;
            let early = begin_if(p, lt)?;
            let t = p.const_i1(true);
            p.ret_value(t)?;
            early.end(p)?;

            let gt = key_less(p, string_less, b, a)?;
            let early = begin_if(p, gt)?;
            let f = p.const_i1(false);
            p.ret_value(f)?;
            early.end(p)?;
            // Equal on this key: fall through to the next.
        }
        let t = ctx.program.const_i1(true);
        ctx.program.ret_value(t)?;

        ctx.program.set_current_function(saved);
        Ok(func)
    }
}

/// Null-aware "strictly less": null sorts before every value.
fn key_less(
    p: &mut ProgramBuilder,
    string_less: veld_ir::FunctionRef,
    a: SqlValue,
    b: SqlValue,
) -> VeldResult<Value> {
    let b_not_null = p.lnot_i1(b.null)?;
    let null_lt = p.and_i1(a.null, b_not_null)?;

    let value_lt = match (a.val, b.val) {
        (IrVal::Bool(x), IrVal::Bool(y)) => {
            let nx = p.lnot_i1(x)?;
            p.and_i1(nx, y)?
        }
        (IrVal::I16(x), IrVal::I16(y)) => p.cmp_i16(CompType::Lt, x, y)?,
        (IrVal::I32(x), IrVal::I32(y)) | (IrVal::Date(x), IrVal::Date(y)) => {
            p.cmp_i32(CompType::Lt, x, y)?
        }
        (IrVal::I64(x), IrVal::I64(y)) => p.cmp_i64(CompType::Lt, x, y)?,
        (IrVal::F64(x), IrVal::F64(y)) => p.cmp_f64(CompType::Lt, x, y)?,
        (IrVal::Str(x), IrVal::Str(y)) => p.call(string_less, &[x, y])?,
        _ => return Err(VeldError::codegen_error("sort key type mismatch")),
    };
    let a_not_null = p.lnot_i1(a.null)?;
    let both = p.and_i1(a_not_null, b_not_null)?;
    let value_side = p.and_i1(both, value_lt)?;
    p.or_i1(null_lt, value_side)
}

impl OperatorTranslator for OrderByTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let layout = RowLayout::new(&mut ctx.program, &ctx.rt, &self.child_types)?;
        let element_size = layout.size(&ctx.program) as i64;

        let zero64 = ctx.program.const_i64(0);
        let zero32 = ctx.program.const_i32(0);
        let i8_ty = ctx.program.i8_type();
        let nullp = ctx.program.nullptr(i8_ty);
        let init = ctx
            .program
            .constant_struct(ctx.rt.types.vector, &[zero64, zero32, zero32, nullp]);
        let vector = ctx.program.global(ctx.rt.types.vector, init);
        *self.state.borrow_mut() = Some(OrderByState { layout: layout.clone(), vector });

        // Fill pipeline.
        let outer_fn = ctx.program.current_function();
        ctx.pipelines.create_pipeline();
        let name = ctx.pipelines.current().body.clone();
        let void = ctx.program.void_type();
        ctx.program.create_public_function(void, &[], &name)?;
        let size_const = ctx.program.const_i64(element_size);
        let cap = ctx.program.const_i32(16);
        ctx.program.call(ctx.rt.vector_create, &[vector, size_const, cap])?;
        let child = tree.nodes[this].children[0];
        tree.produce(child, ctx)?;
        ctx.program.ret()?;
        let fill = ctx.pipelines.finish_pipeline();
        ctx.pipelines.add_predecessor(fill);
        ctx.program.set_current_function(outer_fn);

        // Sort, then stream in order.
        let comparator = self.emit_comparator(&layout, ctx)?;
        let cmp_ptr = ctx.program.get_function_pointer(comparator);
        let i8p = ctx.program.pointer_type(i8_ty);
        let cmp_raw = ctx.program.ptr_cast(cmp_ptr, i8p)?;
        ctx.program.call(ctx.rt.vector_sort, &[vector, cmp_raw])?;

        let count = ctx.program.call(ctx.rt.vector_size, &[vector])?;
        let zero = ctx.program.const_i32(0);
        let lp = Loop::new(&mut ctx.program, &[zero])?;
        let j = lp.var(0);
        let more = ctx.program.cmp_i32(CompType::Lt, j, count)?;
        lp.enter_body(&mut ctx.program, more)?;

        let row = ctx.program.call(ctx.rt.vector_get, &[vector, j])?;
        let child_values = layout.unpack(&mut ctx.program, &ctx.rt, row)?;
        tree.nodes[child].values.set_all(child_values);
        tree.fill_values(this, &self.schema, ctx)?;
        tree.consume_parent(this, ctx)?;

        let one = ctx.program.const_i32(1);
        let next = ctx.program.add_i32(j, one)?;
        lp.continue_with(&mut ctx.program, &[next])?;
        lp.exit(&mut ctx.program)?;

        ctx.program.call(ctx.rt.vector_free, &[vector])?;
        Ok(())
    }

    fn consume(
        &self,
        _this: usize,
        src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let OrderByState { layout, vector } = self
            .state
            .borrow()
            .clone()
            .expect("order by consumed before produce");
        let row = ctx.program.call(ctx.rt.vector_push_back, &[vector])?;
        let values = tree.nodes[src].values.all().to_vec();
        layout.pack(&mut ctx.program, &ctx.rt, row, &values)
    }
}
