//! Aggregation without grouping
//!
//! A global struct holds one state span per aggregate plus a null byte; an
//! `empty` flag distinguishes the first tuple (initialize) from the rest
//! (update). After the child pipeline drains, a non-empty state pushes the
//! single output tuple.

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, ProgramBuilder, Type, Value};
use veld_plan::{AggregateFunc, Expr, OperatorSchema};

use crate::control_flow::{begin_if, begin_if_else, ternary};
use crate::row_layout::ir_field_type;
use crate::runtime_fns::RuntimeFunctions;
use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::{IrVal, SqlValue};

/// One aggregate's state: its value field(s) and null byte inside the state
/// struct.
#[derive(Clone)]
pub struct Aggregator {
    pub func: AggregateFunc,
    pub arg: Option<Expr>,
    pub result_ty: SqlType,
    field: usize,
    null_field: usize,
    /// AVG's running count.
    count_field: Option<usize>,
}

/// Assigns state fields for every aggregate into `fields`.
pub fn plan_aggregators(
    p: &mut ProgramBuilder,
    rt: &RuntimeFunctions,
    aggregates: &[Expr],
    fields: &mut Vec<Type>,
) -> VeldResult<Vec<Aggregator>> {
    let mut out = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let Expr::Aggregate { func, ty, arg } = aggregate else {
            return Err(VeldError::codegen_error("non-aggregate in aggregate list"));
        };
        let field = fields.len();
        let mut count_field = None;
        match func {
            AggregateFunc::Avg => {
                fields.push(p.f64_type());
                count_field = Some(fields.len());
                fields.push(p.i64_type());
            }
            AggregateFunc::Count => fields.push(p.i64_type()),
            _ => fields.push(ir_field_type(p, rt, *ty)),
        }
        let null_field = fields.len();
        fields.push(p.i8_type());
        out.push(Aggregator {
            func: *func,
            arg: arg.as_deref().cloned(),
            result_ty: *ty,
            field,
            null_field,
            count_field,
        });
    }
    Ok(out)
}

impl Aggregator {
    fn arg_value(
        &self,
        this: usize,
        tree: &TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<Option<SqlValue>> {
        self.arg.as_ref().map(|a| tree.compute(a, this, ctx)).transpose()
    }

    fn set_null_flag(&self, p: &mut ProgramBuilder, state: Value, null: Value) -> VeldResult<()> {
        let field = p.const_gep(state, &[0, self.null_field as i32])?;
        let byte = p.i8_zext_i1(null)?;
        p.store_i8(field, byte)
    }

    /// First tuple: seed the state.
    pub fn initialize(
        &self,
        state: Value,
        this: usize,
        tree: &TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let arg = self.arg_value(this, tree, ctx)?;
        let p = &mut ctx.program;
        let field = p.const_gep(state, &[0, self.field as i32])?;

        match self.func {
            AggregateFunc::Count => {
                // COUNT(*) counts the row; COUNT(x) skips null x.
                let one = p.const_i64(1);
                let zero = p.const_i64(0);
                let v = match &arg {
                    None => one,
                    Some(a) => ternary(p, a.null, |_| Ok(vec![zero]), |_| Ok(vec![one]))?[0],
                };
                p.store_i64(field, v)?;
                let f = p.const_i1(false);
                self.set_null_flag(p, state, f)?;
            }
            AggregateFunc::Avg => {
                let a = arg.expect("AVG has an argument");
                let x = to_f64(p, a.val)?;
                let count_field =
                    p.const_gep(state, &[0, self.count_field.unwrap() as i32])?;
                // A null first value leaves the state empty (count 0).
                let zero_f = p.const_f64(0.0);
                let zero_i = p.const_i64(0);
                let one_i = p.const_i64(1);
                let mean = ternary(p, a.null, |_| Ok(vec![zero_f]), |_| Ok(vec![x]))?[0];
                let count =
                    ternary(p, a.null, |_| Ok(vec![zero_i]), |_| Ok(vec![one_i]))?[0];
                p.store_f64(field, mean)?;
                p.store_i64(count_field, count)?;
                self.set_null_flag(p, state, a.null)?;
            }
            AggregateFunc::Sum => {
                let a = arg.expect("SUM has an argument");
                let v = widen_sum(p, a.val, self.result_ty)?;
                store_field(p, field, self.result_ty, v)?;
                self.set_null_flag(p, state, a.null)?;
            }
            AggregateFunc::Min | AggregateFunc::Max => {
                let a = arg.expect("MIN/MAX has an argument");
                store_value(p, &ctx.rt, field, a.val)?;
                self.set_null_flag(p, state, a.null)?;
            }
        }
        Ok(())
    }

    /// Later tuples: fold the argument into the state.
    pub fn update(
        &self,
        state: Value,
        this: usize,
        tree: &TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let arg = self.arg_value(this, tree, ctx)?;

        match self.func {
            AggregateFunc::Count => {
                let p = &mut ctx.program;
                let field = p.const_gep(state, &[0, self.field as i32])?;
                match &arg {
                    None => {
                        let old = p.load_i64(field)?;
                        let one = p.const_i64(1);
                        let new = p.add_i64(old, one)?;
                        p.store_i64(field, new)?;
                    }
                    Some(a) => {
                        let not_null = p.lnot_i1(a.null)?;
                        let guard = begin_if(p, not_null)?;
                        let old = p.load_i64(field)?;
                        let one = p.const_i64(1);
                        let new = p.add_i64(old, one)?;
                        p.store_i64(field, new)?;
                        guard.end(p)?;
                    }
                }
            }

            AggregateFunc::Avg => {
                let a = arg.expect("AVG has an argument");
                let p = &mut ctx.program;
                let not_null = p.lnot_i1(a.null)?;
                let guard = begin_if(p, not_null)?;
                // Welford's running mean keeps the sum numerically stable.
                let x = to_f64(p, a.val)?;
                let field = p.const_gep(state, &[0, self.field as i32])?;
                let count_field =
                    p.const_gep(state, &[0, self.count_field.unwrap() as i32])?;
                let count = p.load_i64(count_field)?;
                let one = p.const_i64(1);
                let new_count = p.add_i64(count, one)?;
                p.store_i64(count_field, new_count)?;
                let mean = p.load_f64(field)?;
                let delta = p.sub_f64(x, mean)?;
                let count_f = p.f64_conv_i64(new_count)?;
                let step = p.div_f64(delta, count_f)?;
                let new_mean = p.add_f64(mean, step)?;
                p.store_f64(field, new_mean)?;
                let f = p.const_i1(false);
                self.set_null_flag(p, state, f)?;
                guard.end(p)?;
            }

            AggregateFunc::Sum => {
                let a = arg.expect("SUM has an argument");
                let p = &mut ctx.program;
                let not_null = p.lnot_i1(a.null)?;
                let guard = begin_if(p, not_null)?;
                let field = p.const_gep(state, &[0, self.field as i32])?;
                let x = widen_sum(p, a.val, self.result_ty)?;

                // A state that was still null restarts from this value.
                let null_field = p.const_gep(state, &[0, self.null_field as i32])?;
                let null_byte = p.load_i8(null_field)?;
                let zero8 = p.const_i8(0);
                let was_null = p.cmp_i8(CompType::Ne, null_byte, zero8)?;
                let inner = begin_if_else(p, was_null)?;
                store_field(p, field, self.result_ty, x)?;
                inner.else_branch(p)?;
                match self.result_ty {
                    SqlType::Real => {
                        let old = p.load_f64(field)?;
                        let new = p.add_f64(old, x)?;
                        p.store_f64(field, new)?;
                    }
                    _ => {
                        let old = p.load_i64(field)?;
                        let new = p.add_i64(old, x)?;
                        p.store_i64(field, new)?;
                    }
                }
                inner.end(p)?;
                let f = p.const_i1(false);
                self.set_null_flag(p, state, f)?;
                guard.end(p)?;
            }

            AggregateFunc::Min | AggregateFunc::Max => {
                let a = arg.expect("MIN/MAX has an argument");
                let rt_less = ctx.rt.string_less_than;
                let p = &mut ctx.program;
                let not_null = p.lnot_i1(a.null)?;
                let guard = begin_if(p, not_null)?;
                let field = p.const_gep(state, &[0, self.field as i32])?;

                let null_field = p.const_gep(state, &[0, self.null_field as i32])?;
                let null_byte = p.load_i8(null_field)?;
                let zero8 = p.const_i8(0);
                let was_null = p.cmp_i8(CompType::Ne, null_byte, zero8)?;
                let inner = begin_if_else(p, was_null)?;
                store_value(p, &ctx.rt, field, a.val)?;
                inner.else_branch(p)?;
                {
                    let current = load_field(p, field, self.result_ty)?;
                    let cmp = if self.func == AggregateFunc::Min {
                        CompType::Lt
                    } else {
                        CompType::Gt
                    };
                    let better = compare(p, rt_less, cmp, a.val, current)?;
                    let replace = begin_if(p, better)?;
                    store_value(p, &ctx.rt, field, a.val)?;
                    replace.end(p)?;
                }
                inner.end(p)?;
                let f = p.const_i1(false);
                self.set_null_flag(p, state, f)?;
                guard.end(p)?;
            }
        }
        Ok(())
    }

    /// The aggregate's final value.
    pub fn read(&self, state: Value, ctx: &mut CompileContext) -> VeldResult<SqlValue> {
        let p = &mut ctx.program;
        let field = p.const_gep(state, &[0, self.field as i32])?;
        let null_field = p.const_gep(state, &[0, self.null_field as i32])?;
        let null_byte = p.load_i8(null_field)?;
        let zero8 = p.const_i8(0);
        let null = p.cmp_i8(CompType::Ne, null_byte, zero8)?;

        let val = match self.func {
            AggregateFunc::Avg => IrVal::F64(p.load_f64(field)?),
            AggregateFunc::Count => IrVal::I64(p.load_i64(field)?),
            _ => load_field(p, field, self.result_ty)?,
        };
        Ok(SqlValue::new(val, null))
    }
}

fn to_f64(p: &mut ProgramBuilder, v: IrVal) -> VeldResult<Value> {
    match v {
        IrVal::F64(x) => Ok(x),
        IrVal::I16(x) => p.f64_conv_i16(x),
        IrVal::I32(x) | IrVal::Date(x) => p.f64_conv_i32(x),
        IrVal::I64(x) => p.f64_conv_i64(x),
        _ => Err(VeldError::codegen_error("cannot average this type")),
    }
}

/// SUM accumulates in i64 (integral) or f64 (real).
fn widen_sum(p: &mut ProgramBuilder, v: IrVal, result: SqlType) -> VeldResult<Value> {
    match result {
        SqlType::Real => to_f64(p, v),
        _ => match v {
            IrVal::I64(x) => Ok(x),
            IrVal::I16(x) => p.i64_sext_i16(x),
            IrVal::I32(x) => p.i64_sext_i32(x),
            _ => Err(VeldError::codegen_error("cannot sum this type")),
        },
    }
}

fn store_field(p: &mut ProgramBuilder, field: Value, ty: SqlType, v: Value) -> VeldResult<()> {
    match ty {
        SqlType::Real => p.store_f64(field, v),
        _ => p.store_i64(field, v),
    }
}

/// MIN/MAX state keeps the argument's own representation.
fn store_value(
    p: &mut ProgramBuilder,
    rt: &RuntimeFunctions,
    field: Value,
    v: IrVal,
) -> VeldResult<()> {
    match v {
        IrVal::Bool(x) => {
            let byte = p.i8_zext_i1(x)?;
            p.store_i8(field, byte)
        }
        IrVal::I16(x) => p.store_i16(field, x),
        IrVal::I32(x) | IrVal::Date(x) => p.store_i32(field, x),
        IrVal::I64(x) => p.store_i64(field, x),
        IrVal::F64(x) => p.store_f64(field, x),
        IrVal::Str(view) => {
            p.call(rt.string_copy, &[view, field])?;
            Ok(())
        }
    }
}

fn load_field(p: &mut ProgramBuilder, field: Value, ty: SqlType) -> VeldResult<IrVal> {
    Ok(match ty {
        SqlType::Boolean => {
            let byte = p.load_i8(field)?;
            let zero = p.const_i8(0);
            IrVal::Bool(p.cmp_i8(CompType::Ne, byte, zero)?)
        }
        SqlType::SmallInt => IrVal::I16(p.load_i16(field)?),
        SqlType::Int => IrVal::I32(p.load_i32(field)?),
        SqlType::Date => IrVal::Date(p.load_i32(field)?),
        SqlType::BigInt => IrVal::I64(p.load_i64(field)?),
        SqlType::Real => IrVal::F64(p.load_f64(field)?),
        SqlType::Text => IrVal::Str(p.materialize_if_gep(field)?),
    })
}

/// `a cmp b` across the aggregate value types.
fn compare(
    p: &mut ProgramBuilder,
    string_less_than: veld_ir::FunctionRef,
    cmp: CompType,
    a: IrVal,
    b: IrVal,
) -> VeldResult<Value> {
    match (a, b) {
        (IrVal::I16(x), IrVal::I16(y)) => p.cmp_i16(cmp, x, y),
        (IrVal::I32(x), IrVal::I32(y)) | (IrVal::Date(x), IrVal::Date(y)) => p.cmp_i32(cmp, x, y),
        (IrVal::I64(x), IrVal::I64(y)) => p.cmp_i64(cmp, x, y),
        (IrVal::F64(x), IrVal::F64(y)) => p.cmp_f64(cmp, x, y),
        (IrVal::Bool(x), IrVal::Bool(y)) => p.cmp_i1(cmp, x, y),
        (IrVal::Str(x), IrVal::Str(y)) => match cmp {
            CompType::Lt => p.call(string_less_than, &[x, y]),
            CompType::Gt => p.call(string_less_than, &[y, x]),
            _ => Err(VeldError::codegen_error("bad string comparison")),
        },
        _ => Err(VeldError::codegen_error("aggregate type mismatch")),
    }
}

/// A zero initializer constant for a struct type.
pub fn zero_struct_constant(p: &mut ProgramBuilder, ty: Type) -> VeldResult<Value> {
    use veld_ir::TypeKind;
    let fields = p
        .type_manager()
        .struct_fields(ty)
        .ok_or_else(|| VeldError::codegen_error("zero init of non-struct"))?;
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        let kind = p.type_manager().kind(field).clone();
        values.push(match kind {
            TypeKind::I1 => p.const_i1(false),
            TypeKind::I8 => p.const_i8(0),
            TypeKind::I16 => p.const_i16(0),
            TypeKind::I32 => p.const_i32(0),
            TypeKind::I64 => p.const_i64(0),
            TypeKind::F64 => p.const_f64(0.0),
            TypeKind::Pointer(inner) => p.nullptr(inner),
            TypeKind::Struct { .. } => zero_struct_constant(p, field)?,
            _ => return Err(VeldError::codegen_error("cannot zero this field")),
        });
    }
    Ok(p.constant_struct(ty, &values))
}

pub struct AggregateTranslator {
    aggregates: Vec<Expr>,
    schema: OperatorSchema,
    state: std::cell::RefCell<Option<AggregateState>>,
}

#[derive(Clone)]
struct AggregateState {
    state: Value,
    empty: Value,
    aggregators: std::rc::Rc<Vec<Aggregator>>,
}

impl AggregateTranslator {
    pub fn new(aggregates: &[Expr], schema: &OperatorSchema) -> Self {
        Self {
            aggregates: aggregates.to_vec(),
            schema: schema.clone(),
            state: std::cell::RefCell::new(None),
        }
    }
}

impl OperatorTranslator for AggregateTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let mut fields = Vec::new();
        let aggregators =
            plan_aggregators(&mut ctx.program, &ctx.rt, &self.aggregates, &mut fields)?;
        let state_ty = ctx.program.struct_type(&fields, None)?;
        let init = zero_struct_constant(&mut ctx.program, state_ty)?;
        let state = ctx.program.global(state_ty, init);
        let zero = ctx.program.const_i64(0);
        let empty = ctx.program.global(ctx.program.i64_type(), zero);
        let aggregators = std::rc::Rc::new(aggregators);
        *self.state.borrow_mut() =
            Some(AggregateState { state, empty, aggregators: aggregators.clone() });

        // Drain the child in its own pipeline.
        let outer_fn = ctx.program.current_function();
        ctx.pipelines.create_pipeline();
        let name = ctx.pipelines.current().body.clone();
        let void = ctx.program.void_type();
        ctx.program.create_public_function(void, &[], &name)?;
        let child = tree.nodes[this].children[0];
        tree.produce(child, ctx)?;
        ctx.program.ret()?;
        let child_pipeline = ctx.pipelines.finish_pipeline();
        ctx.pipelines.add_predecessor(child_pipeline);
        ctx.program.set_current_function(outer_fn);

        // Output the single tuple when any input arrived.
        let seen = ctx.program.load_i64(empty)?;
        let zero = ctx.program.const_i64(0);
        let non_empty = ctx.program.cmp_i64(CompType::Ne, seen, zero)?;
        let guard = begin_if(&mut ctx.program, non_empty)?;

        let mut virtuals = Vec::with_capacity(aggregators.len());
        for aggregator in aggregators.iter() {
            virtuals.push(aggregator.read(state, ctx)?);
        }
        tree.nodes[this].virtual_values.set_all(virtuals);
        tree.fill_values(this, &self.schema, ctx)?;
        tree.consume_parent(this, ctx)?;

        guard.end(&mut ctx.program)
    }

    fn consume(
        &self,
        this: usize,
        _src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let AggregateState { state, empty, aggregators } = self
            .state
            .borrow()
            .clone()
            .expect("aggregate consumed before produce");

        let seen = ctx.program.load_i64(empty)?;
        let zero = ctx.program.const_i64(0);
        let first = ctx.program.cmp_i64(CompType::Eq, seen, zero)?;

        let guard = begin_if_else(&mut ctx.program, first)?;
        for aggregator in aggregators.iter() {
            aggregator.initialize(state, this, tree, ctx)?;
        }
        let one = ctx.program.const_i64(1);
        ctx.program.store_i64(empty, one)?;
        guard.else_branch(&mut ctx.program)?;
        for aggregator in aggregators.iter() {
            aggregator.update(state, this, tree, ctx)?;
        }
        guard.end(&mut ctx.program)
    }
}
