//! Hash equi-join
//!
//! The left child drains into a fingerprint-keyed hash table in its own
//! pipeline; the right child probes, iterating the matching bucket and
//! re-verifying the full key conjunction before pushing upward.

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, Value};
use veld_plan::{BinaryOp, Expr, OperatorSchema};

use crate::control_flow::{begin_if, Loop};
use crate::hashing::fingerprint;
use crate::row_layout::RowLayout;
use crate::translators::{CompileContext, OperatorTranslator, TranslatorTree};

pub struct HashJoinTranslator {
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    schema: OperatorSchema,
    left_types: Vec<(SqlType, bool)>,
    state: std::cell::RefCell<Option<HashJoinState>>,
}

#[derive(Clone)]
struct HashJoinState {
    layout: RowLayout,
    table: Value,
}

impl HashJoinTranslator {
    pub fn new(
        left_keys: &[Expr],
        right_keys: &[Expr],
        schema: &OperatorSchema,
        left_types: Vec<(SqlType, bool)>,
    ) -> Self {
        Self {
            left_keys: left_keys.to_vec(),
            right_keys: right_keys.to_vec(),
            schema: schema.clone(),
            left_types,
            state: std::cell::RefCell::new(None),
        }
    }

    /// The probe-time key re-verification: a conjunction of per-column
    /// equalities over both children.
    fn verify_expr(&self) -> Expr {
        let mut conj: Option<Expr> = None;
        for (l, r) in self.left_keys.iter().zip(&self.right_keys) {
            let eq = Expr::Binary {
                op: BinaryOp::Eq,
                ty: SqlType::Boolean,
                nullable: l.nullable() || r.nullable(),
                left: Box::new(l.clone()),
                right: Box::new(r.clone()),
            };
            conj = Some(match conj {
                None => eq,
                Some(prev) => Expr::Binary {
                    op: BinaryOp::And,
                    ty: SqlType::Boolean,
                    nullable: prev.nullable() || eq.nullable(),
                    left: Box::new(prev),
                    right: Box::new(eq),
                },
            });
        }
        conj.expect("hash join requires at least one key")
    }
}

impl OperatorTranslator for HashJoinTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let layout = RowLayout::new(&mut ctx.program, &ctx.rt, &self.left_types)?;
        let element_size = layout.size(&ctx.program) as i64;

        // The hash table lives in a global so the build pipeline and the
        // probing outer pipeline share it.
        let i8_ty = ctx.program.i8_type();
        let null = ctx.program.nullptr(i8_ty);
        let zero = ctx.program.const_i64(0);
        let init = ctx.program.constant_struct(ctx.rt.types.hash_table, &[zero, null]);
        let table = ctx.program.global(ctx.rt.types.hash_table, init);
        *self.state.borrow_mut() = Some(HashJoinState { layout, table });

        // Build pipeline: drain the left child into the table.
        let outer_fn = ctx.program.current_function();
        ctx.pipelines.create_pipeline();
        let name = ctx.pipelines.current().body.clone();
        let void = ctx.program.void_type();
        ctx.program.create_public_function(void, &[], &name)?;

        let size_const = ctx.program.const_i64(element_size);
        ctx.program.call(ctx.rt.hash_table_create, &[table, size_const])?;
        let left = tree.nodes[this].children[0];
        tree.produce(left, ctx)?;
        ctx.program.ret()?;
        let build = ctx.pipelines.finish_pipeline();
        ctx.pipelines.add_predecessor(build);

        // Probe runs in the enclosing pipeline.
        ctx.program.set_current_function(outer_fn);
        let right = tree.nodes[this].children[1];
        tree.produce(right, ctx)?;

        ctx.program.call(ctx.rt.hash_table_free, &[table])?;
        Ok(())
    }

    fn consume(
        &self,
        this: usize,
        src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let left = tree.nodes[this].children[0];
        let HashJoinState { layout, table } = self
            .state
            .borrow()
            .clone()
            .ok_or_else(|| VeldError::codegen_error("hash join consumed before produce"))?;

        if src == left {
            // Build side: fingerprint the keys, append a packed row.
            let keys: Vec<_> = self
                .left_keys
                .iter()
                .map(|k| tree.compute(k, this, ctx))
                .collect::<VeldResult<_>>()?;
            let fp = fingerprint(&mut ctx.program, &ctx.rt, &keys)?;
            let row = ctx.program.call(ctx.rt.hash_table_insert, &[table, fp])?;
            let left_values = tree.nodes[left].values.all().to_vec();
            layout.pack(&mut ctx.program, &ctx.rt, row, &left_values)?;
            return Ok(());
        }

        // Probe side.
        let keys: Vec<_> = self
            .right_keys
            .iter()
            .map(|k| tree.compute(k, this, ctx))
            .collect::<VeldResult<_>>()?;
        let fp = fingerprint(&mut ctx.program, &ctx.rt, &keys)?;
        let bucket = ctx.program.call(ctx.rt.hash_table_get_bucket, &[table, fp])?;
        let missing = ctx.program.ptr_cmp_nullptr(bucket)?;
        let found = ctx.program.lnot_i1(missing)?;

        let guard = begin_if(&mut ctx.program, found)?;
        {
            let bucket_size = ctx.program.call(ctx.rt.vector_size, &[bucket])?;
            let zero = ctx.program.const_i32(0);
            let lp = Loop::new(&mut ctx.program, &[zero])?;
            let j = lp.var(0);
            let cond = ctx.program.cmp_i32(CompType::Lt, j, bucket_size)?;
            lp.enter_body(&mut ctx.program, cond)?;

            let row = ctx.program.call(ctx.rt.vector_get, &[bucket, j])?;
            let left_values = layout.unpack(&mut ctx.program, &ctx.rt, row)?;
            tree.nodes[left].values.set_all(left_values);

            // Fingerprints collide; re-verify the full key conjunction.
            let verify = self.verify_expr();
            let matched = tree.compute(&verify, this, ctx)?;
            let not_null = ctx.program.lnot_i1(matched.null)?;
            let pass = ctx.program.and_i1(matched.val.raw(), not_null)?;

            let inner = begin_if(&mut ctx.program, pass)?;
            tree.fill_values(this, &self.schema, ctx)?;
            tree.consume_parent(this, ctx)?;
            inner.end(&mut ctx.program)?;

            let one = ctx.program.const_i32(1);
            let next = ctx.program.add_i32(j, one)?;
            lp.continue_with(&mut ctx.program, &[next])?;
            lp.exit(&mut ctx.program)?;
        }
        guard.end(&mut ctx.program)
    }
}
