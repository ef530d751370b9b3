//! Operator translators (push produce/consume model)
//!
//! A translator's `produce` emits code that will eventually invoke its
//! parent's `consume` for every tuple. Translators live in an arena tree
//! addressed by index; per-node schema value slots live on the nodes so a
//! parent can read a child's outputs while either translator is active.

pub mod aggregate;
pub mod cross_product;
pub mod group_by_aggregate;
pub mod hash_join;
pub mod order_by;
pub mod output;
pub mod scan;
pub mod scan_select;
pub mod select;
pub mod simd_scan_select;
pub mod skinner_join;
pub mod skinner_join_recompiling;
pub mod skinner_scan_select;

use veld_catalog::Database;
use veld_common::{EngineConfig, SkinnerMode, VeldError, VeldResult};
use veld_ir::ProgramBuilder;
use veld_plan::{Expr, OperatorKind, OperatorNode, OperatorSchema};

use crate::expr_translator::{ExprEnv, ExprTranslator};
use crate::pipeline::PipelineBuilder;
use crate::runtime_fns::RuntimeFunctions;
use crate::values::{SchemaValues, SqlValue};

pub struct CompileContext<'a> {
    pub program: ProgramBuilder,
    pub pipelines: PipelineBuilder,
    pub rt: RuntimeFunctions,
    pub db: &'a Database,
    pub config: &'a EngineConfig,
    /// Host objects generated code points into; they must outlive execution.
    pub regexes: Vec<Box<regex::bytes::Regex>>,
    pub recompile_states: Vec<Box<skinner_join_recompiling::RecompilingJoinState>>,
}

impl<'a> CompileContext<'a> {
    pub fn new(db: &'a Database, config: &'a EngineConfig) -> Self {
        let mut program = ProgramBuilder::new();
        let rt = RuntimeFunctions::declare(&mut program);
        Self {
            program,
            pipelines: PipelineBuilder::new(),
            rt,
            db,
            config,
            regexes: Vec::new(),
            recompile_states: Vec::new(),
        }
    }
}

/// Translators are shared (`Rc`) because the produce/consume model is
/// re-entrant: a child's emitted tuple invokes its parent's `consume` while
/// the parent's `produce` frame is still on the stack. Per-produce state
/// lives behind interior mutability with tightly scoped borrows.
pub trait OperatorTranslator {
    fn produce(
        &self,
        this: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()>;

    fn consume(
        &self,
        this: usize,
        src: usize,
        tree: &mut TranslatorTree,
        ctx: &mut CompileContext,
    ) -> VeldResult<()>;
}

pub struct TranslatorNode {
    translator: std::rc::Rc<dyn OperatorTranslator>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub values: SchemaValues,
    pub virtual_values: SchemaValues,
}

#[derive(Default)]
pub struct TranslatorTree {
    pub nodes: Vec<TranslatorNode>,
}

impl TranslatorTree {
    /// Builds the translator tree for an operator tree; returns the root id.
    pub fn build(op: &OperatorNode, ctx: &CompileContext) -> VeldResult<(Self, usize)> {
        let mut tree = TranslatorTree::default();
        let root = tree.add(op, None, ctx)?;
        Ok((tree, root))
    }

    fn add(
        &mut self,
        op: &OperatorNode,
        parent: Option<usize>,
        ctx: &CompileContext,
    ) -> VeldResult<usize> {
        let id = self.nodes.len();
        self.nodes.push(TranslatorNode {
            translator: make_translator(op, ctx)?,
            parent,
            children: Vec::new(),
            values: SchemaValues::default(),
            virtual_values: SchemaValues::default(),
        });
        for child in &op.children {
            let child_id = self.add(child, Some(id), ctx)?;
            self.nodes[id].children.push(child_id);
        }
        Ok(id)
    }

    pub fn produce(&mut self, this: usize, ctx: &mut CompileContext) -> VeldResult<()> {
        let translator = self.nodes[this].translator.clone();
        translator.produce(this, self, ctx)
    }

    /// Invokes the parent's consume for the tuple currently in `child`'s
    /// value slots.
    pub fn consume_parent(&mut self, child: usize, ctx: &mut CompileContext) -> VeldResult<()> {
        let Some(parent) = self.nodes[child].parent else {
            return Ok(());
        };
        let translator = self.nodes[parent].translator.clone();
        translator.consume(parent, child, self, ctx)
    }

    /// Evaluates an expression in `this` node's environment.
    pub fn compute(
        &self,
        expr: &Expr,
        this: usize,
        ctx: &mut CompileContext,
    ) -> VeldResult<SqlValue> {
        let children: Vec<&SchemaValues> = self.nodes[this]
            .children
            .iter()
            .map(|&c| &self.nodes[c].values)
            .collect();
        let env = ExprEnv {
            children: &children,
            virtuals: &self.nodes[this].virtual_values,
        };
        let mut translator = ExprTranslator {
            p: &mut ctx.program,
            rt: &ctx.rt,
            regexes: &mut ctx.regexes,
        };
        translator.compute(expr, &env)
    }

    /// Computes a node's schema into its value slots (the usual epilogue of
    /// a consume/produce body).
    pub fn fill_values(
        &mut self,
        this: usize,
        schema: &OperatorSchema,
        ctx: &mut CompileContext,
    ) -> VeldResult<()> {
        let mut values = Vec::with_capacity(schema.len());
        for column in &schema.columns {
            values.push(self.compute(&column.expr, this, ctx)?);
        }
        self.nodes[this].values.set_all(values);
        Ok(())
    }
}

fn make_translator(
    op: &OperatorNode,
    ctx: &CompileContext,
) -> VeldResult<std::rc::Rc<dyn OperatorTranslator>> {
    use std::rc::Rc;
    Ok(match &op.kind {
        OperatorKind::Scan { table, scan_schema } => {
            Rc::new(scan::ScanTranslator::new(table, &op.schema, scan_schema, ctx)?)
        }
        OperatorKind::ScanSelect { table, scan_schema, filters } => {
            if simd_scan_select::supports(filters, scan_schema) {
                Rc::new(simd_scan_select::SimdScanSelectTranslator::new(
                    table,
                    &op.schema,
                    scan_schema,
                    filters,
                    ctx,
                )?)
            } else {
                Rc::new(scan_select::ScanSelectTranslator::new(
                    table,
                    &op.schema,
                    scan_schema,
                    filters,
                    ctx,
                )?)
            }
        }
        OperatorKind::SkinnerScanSelect { table, scan_schema, filters, index_filters } => {
            Rc::new(skinner_scan_select::SkinnerScanSelectTranslator::new(
                table,
                &op.schema,
                scan_schema,
                filters,
                index_filters,
                ctx,
            )?)
        }
        OperatorKind::Select { cond } => {
            Rc::new(select::SelectTranslator::new(cond, &op.schema))
        }
        OperatorKind::CrossProduct => {
            Rc::new(cross_product::CrossProductTranslator::new(&op.schema))
        }
        OperatorKind::HashJoin { left_keys, right_keys } => {
            Rc::new(hash_join::HashJoinTranslator::new(
                left_keys,
                right_keys,
                &op.schema,
                left_schema_types(op),
            ))
        }
        OperatorKind::SkinnerJoin { conditions } => match ctx.config.skinner {
            SkinnerMode::Permute => Rc::new(skinner_join::SkinnerJoinTranslator::new(
                conditions, &op.schema, op,
            )),
            SkinnerMode::Recompile => {
                Rc::new(skinner_join_recompiling::RecompilingSkinnerJoinTranslator::new(
                    conditions, &op.schema, op,
                ))
            }
        },
        OperatorKind::Aggregate { aggregates } => {
            Rc::new(aggregate::AggregateTranslator::new(aggregates, &op.schema))
        }
        OperatorKind::GroupByAggregate { group_by, aggregates } => {
            Rc::new(group_by_aggregate::GroupByAggregateTranslator::new(
                group_by, aggregates, &op.schema,
            ))
        }
        OperatorKind::OrderBy { keys } => {
            Rc::new(order_by::OrderByTranslator::new(keys, &op.schema, op))
        }
        OperatorKind::Output => Rc::new(output::OutputTranslator::new(&op.schema)),
    })
}

/// Resolves a scan schema's slots to their catalog columns (cloned so the
/// translator owns them).
pub fn catalog_columns(
    db: &Database,
    table: &str,
    scan_schema: &OperatorSchema,
) -> VeldResult<Vec<veld_catalog::Column>> {
    let table = db
        .table(table)
        .ok_or_else(|| VeldError::codegen_error(format!("unknown table '{table}'")))?;
    scan_schema
        .columns
        .iter()
        .map(|c| {
            table
                .column(&c.name)
                .cloned()
                .ok_or_else(|| VeldError::codegen_error(format!("unknown column '{}'", c.name)))
        })
        .collect()
}

/// Column types of a node's child schemas (used to lay out join rows).
pub fn child_schema_types(op: &OperatorNode, child: usize) -> Vec<(veld_catalog::SqlType, bool)> {
    op.children[child]
        .schema
        .columns
        .iter()
        .map(|c| (c.ty(), c.nullable()))
        .collect()
}

fn left_schema_types(op: &OperatorNode) -> Vec<(veld_catalog::SqlType, bool)> {
    child_schema_types(op, 0)
}
