//! Adaptive n-way join (recompiling)
//!
//! Children materialize exactly as in the permutable variant, plus one
//! in-memory index per equality-predicate column. Instead of permutable
//! handlers, the host executor asks this translator's runtime state for
//! machine code specialized to each ordering: a nested-loop function with
//! the predicates placed at their deepest bound table and equality
//! predicates pushed through the corresponding index. Compiled orderings
//! live in an LRU cache; every ordering inserts into the shared tuple-index
//! set, so progress survives order switches. Compilation is synchronous; a
//! null entry point on a miss is fatal (the permutable variant remains the
//! reliable baseline).

use std::os::raw::c_void;

use hashbrown::HashMap;

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, ProgramBuilder, Value};
use veld_plan::{BinaryOp, Expr, OperatorNode, OperatorSchema};

use crate::control_flow::{begin_if, Loop};
use crate::expr_translator::{ExprEnv, ExprTranslator};
use crate::row_layout::RowLayout;
use crate::runtime_fns::RuntimeFunctions;
use crate::translators::skinner_join::{tables_of, MaterializedChildren};
use crate::translators::{child_schema_types, CompileContext, OperatorTranslator, TranslatorTree};
use crate::values::{IrVal, SchemaValues, SqlValue};

const CACHE_CAPACITY: usize = 64;

/// Host-side state the emitted program points at: everything needed to
/// synthesize and cache per-ordering join code at query runtime.
pub struct RecompilingJoinState {
    n: usize,
    conditions: Vec<Expr>,
    child_types: Vec<Vec<(SqlType, bool)>>,
    /// (table, column) -> runtime index slot.
    index_of: HashMap<(usize, usize), usize>,

    // Runtime pointers, filled by the emitted program before execution.
    buffers: Vec<usize>,
    indexes: Vec<usize>,
    idx_arr: usize,
    tit: usize,

    cache: HashMap<Vec<i32>, CompiledOrder>,
    lru: Vec<Vec<i32>>,
    regexes: Vec<Box<regex::bytes::Regex>>,
}

struct CompiledOrder {
    // Keeps the mapping alive while the entry point is callable.
    #[allow(dead_code)]
    program: veld_backend::CompiledProgram,
    entry: usize,
}

impl RecompilingJoinState {
    /// Compiled entry point for an ordering, reusing the cache.
    pub fn compile_order(&mut self, order: &[i32]) -> VeldResult<usize> {
        if let Some(hit) = self.cache.get(order) {
            let entry = hit.entry;
            self.lru.retain(|o| o != order);
            self.lru.push(order.to_vec());
            return Ok(entry);
        }

        let compiled = self.synthesize(order)?;
        let entry = compiled
            .function("step")
            .ok_or_else(|| VeldError::codegen_error("recompiled join lost its entry point"))?
            as usize;

        if self.cache.len() >= CACHE_CAPACITY {
            if let Some(oldest) = self.lru.first().cloned() {
                self.lru.remove(0);
                self.cache.remove(&oldest);
            }
        }
        self.cache
            .insert(order.to_vec(), CompiledOrder { program: compiled, entry });
        self.lru.push(order.to_vec());
        log::debug!("recompiled join order {order:?}");
        Ok(entry)
    }

    /// Builds `step(budget) -> i32` for one ordering: nested loops over the
    /// materialized buffers with index pushdown, predicate placement at the
    /// deepest bound table, budget accounting, and dedupe through the shared
    /// tuple-index set.
    fn synthesize(&mut self, order: &[i32]) -> VeldResult<veld_backend::CompiledProgram> {
        let mut p = ProgramBuilder::new();
        let rt = RuntimeFunctions::declare(&mut p);

        let i32_ty = p.i32_type();
        let i8_ty = p.i8_type();
        let i8p = p.pointer_type(i8_ty);
        let i32p = p.pointer_type(i32_ty);
        let vec_p = p.pointer_type(rt.types.vector);

        p.create_public_function(i32_ty, &[i32_ty], "step")?;
        let initial_budget = p.get_function_arguments(p.current_function())[0];
        let budget_slot = p.alloca(i32_ty, 1)?;
        p.store_i32(budget_slot, initial_budget)?;

        let layouts: Vec<RowLayout> = self
            .child_types
            .iter()
            .map(|types| RowLayout::new(&mut p, &rt, types))
            .collect::<VeldResult<_>>()?;
        let buffers: Vec<Value> =
            self.buffers.iter().map(|&addr| p.ptr_const(addr, vec_p)).collect();
        let idx_slots: Vec<Value> = (0..self.n)
            .map(|t| p.ptr_const(self.idx_arr + 4 * t, i32p))
            .collect();
        let idx_head = p.ptr_const(self.idx_arr, i32p);
        let tit = p.ptr_const(self.tit, i8p);

        // Predicates fire at the deepest position where every table they
        // touch is bound.
        let mut fire_at: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        for (pi, condition) in self.conditions.iter().enumerate() {
            let mask = tables_of(condition);
            let deepest = (0..order.len())
                .find(|&level| {
                    let bound: u64 = order[..=level].iter().map(|&t| 1u64 << t).sum();
                    mask & !bound == 0
                })
                .ok_or_else(|| VeldError::codegen_error("predicate touches unknown table"))?;
            fire_at[deepest].push(pi);
        }

        let mut bound: Vec<SchemaValues> = vec![SchemaValues::default(); self.n];
        self.emit_level(
            &mut p, &rt, order, 0, &layouts, &buffers, &idx_slots, idx_head, tit,
            budget_slot, &fire_at, &mut bound,
        )?;

        let remaining = p.load_i32(budget_slot)?;
        p.ret_value(remaining)?;

        veld_backend::compile(p.build())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_level(
        &mut self,
        p: &mut ProgramBuilder,
        rt: &RuntimeFunctions,
        order: &[i32],
        level: usize,
        layouts: &[RowLayout],
        buffers: &[Value],
        idx_slots: &[Value],
        idx_head: Value,
        tit: Value,
        budget_slot: Value,
        fire_at: &[Vec<usize>],
        bound: &mut Vec<SchemaValues>,
    ) -> VeldResult<()> {
        let t = order[level] as usize;
        let i32_zero = p.const_i32(0);
        let one = p.const_i32(1);
        let cardinality = p.call(rt.vector_size, &[buffers[t]])?;

        // The leading table resumes from its saved position.
        let start = if level == 0 {
            p.load_i32(idx_slots[t])?
        } else {
            i32_zero
        };

        let lp = Loop::new(p, &[start])?;
        let i = lp.var(0);
        let more = p.cmp_i32(CompType::Lt, i, cardinality)?;
        lp.enter_body(p, more)?;

        p.store_i32(idx_slots[t], i)?;
        let budget = p.load_i32(budget_slot)?;
        let spent = p.sub_i32(budget, one)?;
        p.store_i32(budget_slot, spent)?;
        let exhausted = p.cmp_i32(CompType::Eq, spent, i32_zero)?;
        let guard = begin_if(p, exhausted)?;
        let minus_one = p.const_i32(-1);
        p.ret_value(minus_one)?;
        guard.end(p)?;

        let next_i = p.add_i32(i, one)?;

        // Equality pushdown: skip ahead through the index when a key from an
        // earlier table names this table's indexed column.
        if let Some((index_slot, key_expr)) = self.pushdown_for(order, level) {
            let empty = SchemaValues::default();
            let key = {
                let children: Vec<&SchemaValues> = bound.iter().collect();
                let env = ExprEnv { children: &children, virtuals: &empty };
                let mut et = ExprTranslator { p, rt, regexes: &mut self.regexes };
                let value = et.compute(&key_expr, &env)?;
                et.to_i64(value.val)?
            };
            let i8_ty = p.i8_type();
            let index_ptr_ty = p.pointer_type(i8_ty);
            let index = p.ptr_const(self.indexes[index_slot], index_ptr_ty);
            let last = p.sub_i32(i, one)?;
            let next_match =
                p.call(rt.mem_index_get_next_greater, &[index, key, last, cardinality])?;
            let ahead = p.cmp_i32(CompType::Gt, next_match, i)?;
            let skip = begin_if(p, ahead)?;
            lp.continue_with(p, &[next_match])?;
            skip.end(p)?;
        }

        let row = p.call(rt.vector_get, &[buffers[t], i])?;
        bound[t] = {
            let values = layouts[t].unpack(p, rt, row)?;
            let mut sv = SchemaValues::default();
            sv.set_all(values);
            sv
        };

        for &pi in &fire_at[level] {
            let condition = self.conditions[pi].clone();
            let empty = SchemaValues::default();
            let value = {
                let children: Vec<&SchemaValues> = bound.iter().collect();
                let env = ExprEnv { children: &children, virtuals: &empty };
                let mut et = ExprTranslator { p, rt, regexes: &mut self.regexes };
                et.compute(&condition, &env)?
            };
            let not_null = p.lnot_i1(value.null)?;
            let pass = p.and_i1(value.val.raw(), not_null)?;
            let fail = p.lnot_i1(pass)?;
            let reject = begin_if(p, fail)?;
            lp.continue_with(p, &[next_i])?;
            reject.end(p)?;
        }

        if level + 1 == order.len() {
            // A valid output tuple: every idx slot is current.
            let n_const = p.const_i32(self.n as i32);
            p.call(rt.tit_insert, &[tit, idx_head, n_const])?;
        } else {
            self.emit_level(
                p, rt, order, level + 1, layouts, buffers, idx_slots, idx_head, tit,
                budget_slot, fire_at, bound,
            )?;
        }

        lp.continue_with(p, &[next_i])?;
        lp.exit(p)
    }

    /// An index-evaluable equality for this level: this table's indexed
    /// column equals an expression over earlier tables. Returns the runtime
    /// index slot and the key expression.
    fn pushdown_for(&self, order: &[i32], level: usize) -> Option<(usize, Expr)> {
        let t = order[level] as usize;
        let earlier: u64 = order[..level].iter().map(|&x| 1u64 << x).sum();
        for condition in &self.conditions {
            let Expr::Binary { op: BinaryOp::Eq, left, right, .. } = condition else {
                continue;
            };
            for (mine, other) in [(left, right), (right, left)] {
                if let Expr::ColumnRef { child, column, .. } = mine.as_ref() {
                    if *child == t
                        && tables_of(other) & !earlier == 0
                        && tables_of(other) != 0
                    {
                        if let Some(&slot) = self.index_of.get(&(*child, *column)) {
                            return Some((slot, other.as_ref().clone()));
                        }
                    }
                }
            }
        }
        None
    }
}

/// Bridge the executor calls through to the state.
///
/// # Safety
/// `ctx` is the `RecompilingJoinState` the emitted program was built with.
pub unsafe extern "C" fn veld_recompile_order(
    ctx: *mut c_void,
    order: *const i32,
    n: i32,
) -> *const c_void {
    let state = &mut *(ctx as *mut RecompilingJoinState);
    let order = std::slice::from_raw_parts(order, n as usize);
    match state.compile_order(order) {
        Ok(entry) => entry as *const c_void,
        Err(e) => {
            log::error!("join recompilation failed: {e}");
            std::ptr::null()
        }
    }
}

pub unsafe extern "C" fn veld_recompile_set_buffer(ctx: *mut c_void, t: i32, ptr: *mut u8) {
    let state = &mut *(ctx as *mut RecompilingJoinState);
    state.buffers[t as usize] = ptr as usize;
}

pub unsafe extern "C" fn veld_recompile_set_index(ctx: *mut c_void, slot: i32, ptr: *mut u8) {
    let state = &mut *(ctx as *mut RecompilingJoinState);
    state.indexes[slot as usize] = ptr as usize;
}

pub unsafe extern "C" fn veld_recompile_set_state(
    ctx: *mut c_void,
    idx_arr: *mut i32,
    tit: *mut u8,
) {
    let state = &mut *(ctx as *mut RecompilingJoinState);
    state.idx_arr = idx_arr as usize;
    state.tit = tit as usize;
}

pub struct RecompilingSkinnerJoinTranslator {
    conditions: Vec<Expr>,
    schema: OperatorSchema,
    child_types: Vec<Vec<(SqlType, bool)>>,
    state: std::cell::RefCell<Option<ProducedState>>,
}

#[derive(Clone)]
struct ProducedState {
    materialized: MaterializedChildren,
    /// (table, column) -> (runtime slot, index global holding the pointer).
    index_globals: std::rc::Rc<HashMap<(usize, usize), (usize, Value)>>,
}

impl RecompilingSkinnerJoinTranslator {
    pub fn new(conditions: &[Expr], schema: &OperatorSchema, op: &OperatorNode) -> Self {
        let child_types =
            (0..op.children.len()).map(|t| child_schema_types(op, t)).collect();
        Self {
            conditions: conditions.to_vec(),
            schema: schema.clone(),
            child_types,
            state: std::cell::RefCell::new(None),
        }
    }

    /// Equality-predicate columns that get an in-memory index (integral and
    /// date keys).
    fn indexable_columns(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for condition in &self.conditions {
            let Expr::Binary { op: BinaryOp::Eq, left, right, .. } = condition else {
                continue;
            };
            for side in [left.as_ref(), right.as_ref()] {
                if let Expr::ColumnRef { child, column, ty, .. } = side {
                    if matches!(
                        ty,
                        SqlType::SmallInt | SqlType::Int | SqlType::BigInt | SqlType::Date
                    ) && !out.contains(&(*child, *column))
                    {
                        out.push((*child, *column));
                    }
                }
            }
        }
        out
    }
}

impl OperatorTranslator for RecompilingSkinnerJoinTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let n = self.child_types.len();
        let children = tree.nodes[this].children.clone();
        let i8_ty = ctx.program.i8_type();
        let i8p = ctx.program.pointer_type(i8_ty);
        let i32_ty = ctx.program.i32_type();
        let zero32 = ctx.program.const_i32(0);
        let nullp = ctx.program.nullptr(i8_ty);

        let materialized = MaterializedChildren::new(&self.child_types, ctx)?;

        // One in-memory index per equality column.
        let indexable = self.indexable_columns();
        let mut index_globals: HashMap<(usize, usize), (usize, Value)> = HashMap::new();
        for (slot, &(t, c)) in indexable.iter().enumerate() {
            let global = ctx.program.global(i8p, nullp);
            index_globals.insert((t, c), (slot, global));
        }
        let index_globals = std::rc::Rc::new(index_globals);
        *self.state.borrow_mut() = Some(ProducedState {
            materialized: materialized.clone(),
            index_globals: index_globals.clone(),
        });

        // Fill pipelines (vectors plus indexes created up front).
        for (t, &child) in children.iter().enumerate() {
            let outer_fn = ctx.program.current_function();
            ctx.pipelines.create_pipeline();
            let name = ctx.pipelines.current().body.clone();
            let void = ctx.program.void_type();
            ctx.program.create_public_function(void, &[], &name)?;
            let elem = ctx
                .program
                .const_i64(materialized.layouts[t].size(&ctx.program) as i64);
            let cap = ctx.program.const_i32(16);
            ctx.program
                .call(ctx.rt.vector_create, &[materialized.vectors[t], elem, cap])?;
            for (&(it, _), &(_, global)) in index_globals.iter() {
                if it == t {
                    let index = ctx.program.call(ctx.rt.mem_index_create, &[])?;
                    ctx.program.store_ptr(global, index)?;
                }
            }
            tree.produce(child, ctx)?;
            ctx.program.ret()?;
            let fill = ctx.pipelines.finish_pipeline();
            ctx.pipelines.add_predecessor(fill);
            ctx.program.set_current_function(outer_fn);
        }

        // Shared driver state.
        let i32_arr = ctx.program.array_type(i32_ty, n as u32);
        let zeroes32 = vec![zero32; n];
        let idx_init = ctx.program.constant_array(i32_arr, &zeroes32);
        let idx_arr = ctx.program.global(i32_arr, idx_init);
        let card_init = ctx.program.constant_array(i32_arr, &zeroes32);
        let cardinalities = ctx.program.global(i32_arr, card_init);
        let tit_global = ctx.program.global(i8p, nullp);

        for (t, vector) in materialized.vectors.iter().enumerate() {
            let size = ctx.program.call(ctx.rt.vector_size, &[*vector])?;
            let slot = ctx.program.const_gep(cardinalities, &[0, t as i32])?;
            ctx.program.store_i32(slot, size)?;
        }
        let tit = ctx.program.call(ctx.rt.tit_create, &[])?;
        ctx.program.store_ptr(tit_global, tit)?;

        // Host state the recompiler runs against.
        let state = Box::new(RecompilingJoinState {
            n,
            conditions: self.conditions.clone(),
            child_types: self.child_types.clone(),
            index_of: indexable
                .iter()
                .enumerate()
                .map(|(slot, &key)| (key, slot))
                .collect(),
            buffers: vec![0; n],
            indexes: vec![0; indexable.len()],
            idx_arr: 0,
            tit: 0,
            cache: HashMap::new(),
            lru: Vec::new(),
            regexes: Vec::new(),
        });
        let state_addr = state.as_ref() as *const RecompilingJoinState as usize;
        ctx.recompile_states.push(state);
        let state_ptr = ctx.program.ptr_const(state_addr, i8p);

        // Wire the runtime pointers into the state.
        let void = ctx.program.void_type();
        let set_buffer = ctx.program.declare_external_function(
            "veld_recompile_set_buffer",
            void,
            &[i8p, i32_ty, i8p],
            veld_recompile_set_buffer as usize,
        );
        let set_index = ctx.program.declare_external_function(
            "veld_recompile_set_index",
            void,
            &[i8p, i32_ty, i8p],
            veld_recompile_set_index as usize,
        );
        let i32p = ctx.program.pointer_type(i32_ty);
        let set_state = ctx.program.declare_external_function(
            "veld_recompile_set_state",
            void,
            &[i8p, i32p, i8p],
            veld_recompile_set_state as usize,
        );

        for (t, vector) in materialized.vectors.iter().enumerate() {
            let t_const = ctx.program.const_i32(t as i32);
            let raw = ctx.program.ptr_cast(*vector, i8p)?;
            ctx.program.call(set_buffer, &[state_ptr, t_const, raw])?;
        }
        for (&(_, _), &(slot, global)) in index_globals.iter() {
            let slot_const = ctx.program.const_i32(slot as i32);
            let index = ctx.program.load_ptr(global)?;
            ctx.program.call(set_index, &[state_ptr, slot_const, index])?;
        }
        let idx_head = ctx.program.const_gep(idx_arr, &[0, 0])?;
        let idx_head = ctx.program.materialize_if_gep(idx_head)?;
        let tit_loaded = ctx.program.load_ptr(tit_global)?;
        ctx.program.call(set_state, &[state_ptr, idx_head, tit_loaded])?;

        // Run the adaptive loop.
        let trampoline = ctx.program.ptr_const(veld_recompile_order as usize, i8p);
        let n_const = ctx.program.const_i32(n as i32);
        let card_head = ctx.program.const_gep(cardinalities, &[0, 0])?;
        let card_head = ctx.program.materialize_if_gep(card_head)?;
        ctx.program.call(
            ctx.rt.execute_recompiling_join,
            &[n_const, card_head, idx_head, state_ptr, trampoline],
        )?;

        // Output the deduped tuples.
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
                let row = ctx
                    .program
                    .call(ctx.rt.vector_get, &[materialized.vectors[t], row_idx])?;
                let values = materialized.layouts[t].unpack(&mut ctx.program, &ctx.rt, row)?;
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
        for vector in &materialized.vectors {
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
        let state = self
            .state
            .borrow()
            .clone()
            .expect("join consumed before produce");
        let parent = tree.nodes[src].parent.expect("child has parent");
        let t = tree.nodes[parent]
            .children
            .iter()
            .position(|&c| c == src)
            .expect("unknown child");

        let row = ctx
            .program
            .call(ctx.rt.vector_push_back, &[state.materialized.vectors[t]])?;
        let values = tree.nodes[src].values.all().to_vec();
        state
            .materialized
            .layouts[t]
            .pack(&mut ctx.program, &ctx.rt, row, &values)?;

        // Feed the per-column indexes: the row id is size-1 after the push.
        let size = ctx
            .program
            .call(ctx.rt.vector_size, &[state.materialized.vectors[t]])?;
        let one = ctx.program.const_i32(1);
        let row_idx = ctx.program.sub_i32(size, one)?;
        for (&(it, column), &(_, global)) in state.index_globals.iter() {
            if it != t {
                continue;
            }
            let value = values[column];
            let key = match value.val {
                IrVal::I16(v) => ctx.program.i64_sext_i16(v)?,
                IrVal::I32(v) | IrVal::Date(v) => ctx.program.i64_sext_i32(v)?,
                IrVal::I64(v) => v,
                _ => continue,
            };
            let index = ctx.program.load_ptr(global)?;
            ctx.program
                .call(ctx.rt.mem_index_insert, &[index, key, row_idx])?;
        }
        Ok(())
    }
}
