//! Planner: binds the AST against the catalog and yields the operator tree
//!
//! The shape is fixed: per-table adaptive scans (with early projection and
//! single-table predicates pushed down), a join layer (HashJoin for plain
//! two-way equi-joins, SkinnerJoin otherwise, CrossProduct when no predicate
//! connects the tables), optional aggregation, optional ordering, and an
//! Output root.

use hashbrown::HashMap;

use veld_catalog::{Database, SqlType};
use veld_common::{EngineConfig, VeldError, VeldResult};
use veld_parser::{
    AggFunc, AstBinaryOp, AstExpr, AstUnaryOp, Projection, SelectStatement,
};

use crate::expr::{AggregateFunc, BinaryOp, Expr, Literal, UnaryOp};
use crate::operator::{
    OperatorKind, OperatorNode, OperatorSchema, SchemaColumn, SortKey,
};

struct BoundTable<'a> {
    name: String,
    table: &'a veld_catalog::Table,
}

pub struct Planner<'a> {
    db: &'a Database,
    config: &'a EngineConfig,
}

impl<'a> Planner<'a> {
    pub fn new(db: &'a Database, config: &'a EngineConfig) -> Self {
        Self { db, config }
    }

    pub fn plan(&self, stmt: &SelectStatement) -> VeldResult<OperatorNode> {
        // 1. Bind FROM tables.
        let mut tables: Vec<BoundTable> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for table_ref in &stmt.from {
            let table = self.db.table(&table_ref.name).ok_or_else(|| {
                VeldError::plan_error(format!("unknown table '{}'", table_ref.name))
            })?;
            let visible = table_ref.alias.clone().unwrap_or_else(|| table_ref.name.clone());
            if by_name.contains_key(&visible) {
                return Err(VeldError::plan_error(format!(
                    "duplicate table name or alias '{visible}'"
                )));
            }
            by_name.insert(visible.clone(), tables.len());
            tables.push(BoundTable { name: table_ref.name.clone(), table });
        }
        if tables.is_empty() {
            return Err(VeldError::plan_error("FROM clause is empty"));
        }

        let binder = Binder { tables: &tables, by_name: &by_name };

        // 2. Bind all expressions (column = catalog index at this stage).
        let mut projections: Vec<(String, Expr)> = Vec::new();
        for (i, projection) in stmt.projections.iter().enumerate() {
            match projection {
                Projection::Star => {
                    for (t, bound) in tables.iter().enumerate() {
                        for (c, col) in bound.table.columns().iter().enumerate() {
                            projections.push((
                                col.name.clone(),
                                Expr::ColumnRef {
                                    child: t,
                                    column: c,
                                    ty: col.ty,
                                    nullable: col.nullable,
                                },
                            ));
                        }
                    }
                }
                Projection::Expr { expr, alias } => {
                    let bound = binder.bind(expr)?;
                    let name = alias.clone().unwrap_or_else(|| match expr {
                        AstExpr::Column { name, .. } => name.clone(),
                        _ => format!("col{i}"),
                    });
                    projections.push((name, bound));
                }
            }
        }

        let where_bound = stmt.where_clause.as_ref().map(|w| binder.bind(w)).transpose()?;
        if let Some(w) = &where_bound {
            if w.ty() != SqlType::Boolean {
                return Err(VeldError::type_error("WHERE clause must be boolean"));
            }
            if w.contains_aggregate() {
                return Err(VeldError::plan_error("aggregates are not allowed in WHERE"));
            }
        }
        let group_by: Vec<Expr> =
            stmt.group_by.iter().map(|g| binder.bind(g)).collect::<VeldResult<_>>()?;
        let order_by: Vec<(Expr, bool)> = stmt
            .order_by
            .iter()
            .map(|o| Ok((binder.bind(&o.expr)?, o.asc)))
            .collect::<VeldResult<_>>()?;

        // 3. Split the WHERE conjunction.
        let mut single_table: Vec<Vec<Expr>> = vec![Vec::new(); tables.len()];
        let mut multi_table: Vec<Expr> = Vec::new();
        if let Some(w) = where_bound {
            for conjunct in flatten_conjunction(w) {
                let mut referenced: Vec<usize> =
                    conjunct.referenced_columns().iter().map(|&(t, _)| t).collect();
                referenced.sort_unstable();
                referenced.dedup();
                match referenced.len() {
                    0 | 1 => single_table[referenced.first().copied().unwrap_or(0)]
                        .push(conjunct),
                    _ => multi_table.push(conjunct),
                }
            }
        }

        // 4. Early projection: per table, the catalog columns referenced
        // anywhere upstream.
        let mut used: Vec<Vec<usize>> = vec![Vec::new(); tables.len()];
        {
            let mut mark = |expr: &Expr| {
                for (t, c) in expr.referenced_columns() {
                    if !used[t].contains(&c) {
                        used[t].push(c);
                    }
                }
            };
            for (_, e) in &projections {
                mark(e);
            }
            for filters in &single_table {
                for f in filters {
                    mark(f);
                }
            }
            for e in &multi_table {
                mark(e);
            }
            for e in &group_by {
                mark(e);
            }
            for (e, _) in &order_by {
                mark(e);
            }
        }
        for columns in &mut used {
            columns.sort_unstable();
        }
        // A table none of whose columns are referenced still scans its first
        // column so cardinality is observable.
        for (t, columns) in used.iter_mut().enumerate() {
            if columns.is_empty() {
                if tables[t].table.columns().is_empty() {
                    return Err(VeldError::plan_error(format!(
                        "table '{}' has no columns",
                        tables[t].name
                    )));
                }
                columns.push(0);
            }
        }

        // Remap catalog indices to compact scan slots.
        let slot_of: Vec<HashMap<usize, usize>> = used
            .iter()
            .map(|columns| columns.iter().enumerate().map(|(slot, &c)| (c, slot)).collect())
            .collect();
        let remap = |expr: Expr| -> Expr {
            let slot_of = &slot_of;
            expr.rewrite(&mut |e| match e {
                Expr::ColumnRef { child, column, ty, nullable } => Expr::ColumnRef {
                    child,
                    column: slot_of[child][&column],
                    ty,
                    nullable,
                },
                other => other,
            })
        };

        let projections: Vec<(String, Expr)> =
            projections.into_iter().map(|(n, e)| (n, remap(e))).collect();
        let single_table: Vec<Vec<Expr>> = single_table
            .into_iter()
            .map(|filters| filters.into_iter().map(&remap).collect())
            .collect();
        let multi_table: Vec<Expr> = multi_table.into_iter().map(&remap).collect();
        let group_by: Vec<Expr> = group_by.into_iter().map(&remap).collect();
        let order_by: Vec<(Expr, bool)> =
            order_by.into_iter().map(|(e, asc)| (remap(e), asc)).collect();

        // 5. Per-table scan nodes (schema = passthrough of the kept slots).
        let mut scans = Vec::with_capacity(tables.len());
        for (t, bound) in tables.iter().enumerate() {
            scans.push(self.build_scan(bound, &used[t], single_table[t].clone())?);
        }

        // 6. Join layer.
        let multi = tables.len() > 1;
        let (mut top, flat_of) = if multi {
            self.build_join(scans, multi_table)?
        } else {
            let mut flat = HashMap::new();
            for (slot, _) in used[0].iter().enumerate() {
                flat.insert((0usize, slot), slot);
            }
            (scans.into_iter().next().unwrap(), flat)
        };

        // Rebase an expression onto the single node below (child 0, flat
        // column indices); identity for a single table.
        let rebase = |expr: Expr| -> Expr {
            let flat_of = &flat_of;
            expr.rewrite(&mut |e| match e {
                Expr::ColumnRef { child, column, ty, nullable } => Expr::ColumnRef {
                    child: 0,
                    column: flat_of[&(child, column)],
                    ty,
                    nullable,
                },
                other => other,
            })
        };

        // 7. Aggregation layer.
        let has_aggregates = projections.iter().any(|(_, e)| e.contains_aggregate())
            || order_by.iter().any(|(e, _)| e.contains_aggregate());
        let visible = projections.len();

        let order_keys: Vec<(usize, bool)> = if has_aggregates || !group_by.is_empty() {
            // The aggregate sits above the scan/join; its inputs read that
            // child's flat outputs.
            let projections_above: Vec<(String, Expr)> = projections
                .iter()
                .map(|(n, e)| (n.clone(), rebase(e.clone())))
                .collect();
            let group_above: Vec<Expr> = group_by.iter().cloned().map(&rebase).collect();
            let order_above: Vec<(Expr, bool)> = order_by
                .iter()
                .map(|(e, asc)| (rebase(e.clone()), *asc))
                .collect();

            top = self.build_aggregate(top, &group_above, &projections_above, &order_above)?;
            // build_aggregate appended one hidden key per ORDER BY item.
            (visible..top.schema.len())
                .zip(order_above.iter().map(|&(_, asc)| asc))
                .collect()
        } else {
            // Fold projections (plus hidden order keys) into the top node's
            // own schema: over virtual slots for a leaf, over child refs for
            // a join.
            let mut columns: Vec<SchemaColumn> = Vec::new();
            for (name, expr) in &projections {
                columns.push(SchemaColumn { name: name.clone(), expr: expr.clone() });
            }
            let mut keys = Vec::new();
            for (i, (expr, asc)) in order_by.iter().enumerate() {
                // Reuse a visible column when the key is identical.
                if let Some(pos) = columns[..visible].iter().position(|c| &c.expr == expr) {
                    keys.push((pos, *asc));
                } else {
                    columns.push(SchemaColumn {
                        name: format!("__sort{i}"),
                        expr: expr.clone(),
                    });
                    keys.push((columns.len() - 1, *asc));
                }
            }
            let columns = if multi {
                columns
            } else {
                columns
                    .into_iter()
                    .map(|c| SchemaColumn { name: c.name, expr: to_virtual(c.expr) })
                    .collect()
            };
            top.schema = OperatorSchema::new(columns);
            keys
        };

        // 8. OrderBy layer.
        if !order_keys.is_empty() {
            let passthrough = passthrough_schema(&top.schema);
            let keys = order_keys
                .iter()
                .map(|&(idx, asc)| SortKey {
                    expr: Expr::ColumnRef {
                        child: 0,
                        column: idx,
                        ty: top.schema.columns[idx].ty(),
                        nullable: top.schema.columns[idx].nullable(),
                    },
                    asc,
                })
                .collect();
            top = OperatorNode::new(OperatorKind::OrderBy { keys }, passthrough, vec![top]);
        }

        // 9. Output root prints the visible columns.
        let output_schema = OperatorSchema::new(
            top.schema.columns[..visible]
                .iter()
                .enumerate()
                .map(|(i, c)| SchemaColumn {
                    name: c.name.clone(),
                    expr: Expr::ColumnRef {
                        child: 0,
                        column: i,
                        ty: c.ty(),
                        nullable: c.nullable(),
                    },
                })
                .collect(),
        );
        Ok(OperatorNode::new(OperatorKind::Output, output_schema, vec![top]))
    }

    /// A scan node whose schema passes the kept slots through.
    fn build_scan(
        &self,
        bound: &BoundTable,
        used: &[usize],
        filters: Vec<Expr>,
    ) -> VeldResult<OperatorNode> {
        let columns = bound.table.columns();
        let scan_columns: Vec<SchemaColumn> = used
            .iter()
            .enumerate()
            .map(|(slot, &c)| SchemaColumn {
                name: columns[c].name.clone(),
                expr: Expr::VirtualColumnRef {
                    column: slot,
                    ty: columns[c].ty,
                    nullable: columns[c].nullable,
                },
            })
            .collect();
        let scan_schema = OperatorSchema::new(scan_columns.clone());
        let schema = OperatorSchema::new(scan_columns);

        if filters.is_empty() {
            return Ok(OperatorNode::new(
                OperatorKind::Scan { table: bound.name.clone(), scan_schema },
                schema,
                Vec::new(),
            ));
        }

        // Single-table predicates read virtual slots.
        let filters: Vec<Expr> = filters.into_iter().map(to_virtual).collect();

        let kind = if self.config.adaptive_scan {
            let mut index_filters = Vec::new();
            for (i, filter) in filters.iter().enumerate() {
                if let Some(slot) = index_evaluable(filter) {
                    if columns[used[slot]].has_index() {
                        index_filters.push(i);
                    }
                }
            }
            OperatorKind::SkinnerScanSelect {
                table: bound.name.clone(),
                scan_schema,
                filters,
                index_filters,
            }
        } else {
            OperatorKind::ScanSelect { table: bound.name.clone(), scan_schema, filters }
        };
        Ok(OperatorNode::new(kind, schema, Vec::new()))
    }

    /// Join layer over the scans; returns the node plus the flat output slot
    /// of each (table, slot) pair.
    #[allow(clippy::type_complexity)]
    fn build_join(
        &self,
        scans: Vec<OperatorNode>,
        conditions: Vec<Expr>,
    ) -> VeldResult<(OperatorNode, HashMap<(usize, usize), usize>)> {
        // Passthrough schema over all children's columns.
        let mut flat_of = HashMap::new();
        let mut columns = Vec::new();
        for (t, scan) in scans.iter().enumerate() {
            for (slot, column) in scan.schema.columns.iter().enumerate() {
                flat_of.insert((t, slot), columns.len());
                columns.push(SchemaColumn {
                    name: column.name.clone(),
                    expr: Expr::ColumnRef {
                        child: t,
                        column: slot,
                        ty: column.ty(),
                        nullable: column.nullable(),
                    },
                });
            }
        }
        let schema = OperatorSchema::new(columns);

        if conditions.is_empty() {
            return Ok((
                OperatorNode::new(OperatorKind::CrossProduct, schema, scans),
                flat_of,
            ));
        }

        // Two tables joined purely by equalities: hash join.
        if scans.len() == 2 {
            let mut left_keys = Vec::new();
            let mut right_keys = Vec::new();
            let mut all_equi = true;
            for condition in &conditions {
                match split_equi(condition) {
                    Some((l, r)) => {
                        left_keys.push(l);
                        right_keys.push(r);
                    }
                    None => {
                        all_equi = false;
                        break;
                    }
                }
            }
            if all_equi {
                return Ok((
                    OperatorNode::new(
                        OperatorKind::HashJoin { left_keys, right_keys },
                        schema,
                        scans,
                    ),
                    flat_of,
                ));
            }
        }

        Ok((
            OperatorNode::new(OperatorKind::SkinnerJoin { conditions }, schema, scans),
            flat_of,
        ))
    }

    /// Aggregate (or group-by aggregate) node whose schema computes the
    /// projections plus hidden order keys over the aggregate's virtual
    /// slots.
    fn build_aggregate(
        &self,
        child: OperatorNode,
        group_by: &[Expr],
        projections: &[(String, Expr)],
        order_by: &[(Expr, bool)],
    ) -> VeldResult<OperatorNode> {
        // Collect distinct aggregate calls across projections and keys.
        let mut aggregates: Vec<Expr> = Vec::new();
        let mut collect = |e: &Expr| {
            e.visit(&mut |sub| {
                if matches!(sub, Expr::Aggregate { .. }) && !aggregates.contains(sub) {
                    aggregates.push(sub.clone());
                }
            })
        };
        for (_, e) in projections {
            collect(e);
        }
        for (e, _) in order_by {
            collect(e);
        }

        let n_group = group_by.len();
        // Rewrites an output expression onto the aggregate's virtual slots.
        let rewrite_output = |expr: &Expr| -> VeldResult<Expr> {
            // Whole-expression match against a grouping key first.
            if let Some(i) = group_by.iter().position(|g| g == expr) {
                return Ok(Expr::VirtualColumnRef {
                    column: i,
                    ty: expr.ty(),
                    nullable: expr.nullable(),
                });
            }
            let rewritten = expr.clone().rewrite(&mut |e| {
                if let Some(i) = group_by.iter().position(|g| g == &e) {
                    return Expr::VirtualColumnRef {
                        column: i,
                        ty: e.ty(),
                        nullable: e.nullable(),
                    };
                }
                if let Expr::Aggregate { .. } = &e {
                    if let Some(j) = aggregates.iter().position(|a| a == &e) {
                        return Expr::VirtualColumnRef {
                            column: n_group + j,
                            ty: e.ty(),
                            nullable: e.nullable(),
                        };
                    }
                }
                e
            });
            // Anything still reading a raw column was neither grouped nor
            // aggregated.
            if !rewritten.referenced_columns().is_empty() {
                return Err(VeldError::plan_error(
                    "column must appear in GROUP BY or inside an aggregate",
                ));
            }
            Ok(rewritten)
        };

        let mut columns = Vec::new();
        for (name, expr) in projections {
            columns.push(SchemaColumn { name: name.clone(), expr: rewrite_output(expr)? });
        }
        for (i, (expr, _)) in order_by.iter().enumerate() {
            columns.push(SchemaColumn {
                name: format!("__sort{i}"),
                expr: rewrite_output(expr)?,
            });
        }

        // Aggregate inputs read the child's schema outputs (the child's
        // passthrough schema is its tuple).
        let group_by: Vec<Expr> = group_by.to_vec();

        let kind = if n_group == 0 {
            OperatorKind::Aggregate { aggregates }
        } else {
            OperatorKind::GroupByAggregate { group_by, aggregates }
        };
        Ok(OperatorNode::new(kind, OperatorSchema::new(columns), vec![child]))
    }
}

/// ColumnRef(0, slot) -> VirtualColumnRef(slot): expressions evaluated
/// inside a leaf operator bind to its virtual schema.
fn to_virtual(expr: Expr) -> Expr {
    expr.rewrite(&mut |e| match e {
        Expr::ColumnRef { column, ty, nullable, .. } => {
            Expr::VirtualColumnRef { column, ty, nullable }
        }
        other => other,
    })
}

fn passthrough_schema(schema: &OperatorSchema) -> OperatorSchema {
    OperatorSchema::new(
        schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| SchemaColumn {
                name: c.name.clone(),
                expr: Expr::ColumnRef {
                    child: 0,
                    column: i,
                    ty: c.ty(),
                    nullable: c.nullable(),
                },
            })
            .collect(),
    )
}

fn flatten_conjunction(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::Binary { op: BinaryOp::And, left, right, .. } => {
            let mut out = flatten_conjunction(*left);
            out.extend(flatten_conjunction(*right));
            out
        }
        other => vec![other],
    }
}

/// `vcol == literal` (either side) yields the virtual slot.
fn index_evaluable(filter: &Expr) -> Option<usize> {
    if let Expr::Binary { op: BinaryOp::Eq, left, right, .. } = filter {
        match (left.as_ref(), right.as_ref()) {
            (Expr::VirtualColumnRef { column, .. }, Expr::Literal(lit))
            | (Expr::Literal(lit), Expr::VirtualColumnRef { column, .. })
                if !lit.is_null() =>
            {
                return Some(*column);
            }
            _ => {}
        }
    }
    None
}

/// An equality whose sides each read exactly one distinct child; returns
/// (left-child expr, right-child expr).
fn split_equi(condition: &Expr) -> Option<(Expr, Expr)> {
    if let Expr::Binary { op: BinaryOp::Eq, left, right, .. } = condition {
        let l = single_child(left)?;
        let r = single_child(right)?;
        if l == 0 && r == 1 {
            return Some((left.as_ref().clone(), right.as_ref().clone()));
        }
        if l == 1 && r == 0 {
            return Some((right.as_ref().clone(), left.as_ref().clone()));
        }
    }
    None
}

fn single_child(expr: &Expr) -> Option<usize> {
    let children: Vec<usize> = expr.referenced_columns().iter().map(|&(t, _)| t).collect();
    match children.as_slice() {
        [] => None,
        [first, rest @ ..] if rest.iter().all(|c| c == first) => Some(*first),
        _ => None,
    }
}

// ---- expression binding ----

struct Binder<'a, 'b> {
    tables: &'b [BoundTable<'a>],
    by_name: &'b HashMap<String, usize>,
}

impl Binder<'_, '_> {
    fn bind(&self, expr: &AstExpr) -> VeldResult<Expr> {
        match expr {
            AstExpr::Column { table, name } => self.bind_column(table.as_deref(), name),

            AstExpr::IntLiteral(v) => Ok(Expr::Literal(match i32::try_from(*v) {
                Ok(small) => Literal::Int(small),
                Err(_) => Literal::BigInt(*v),
            })),
            AstExpr::FloatLiteral(v) => Ok(Expr::Literal(Literal::Real(*v))),
            AstExpr::StringLiteral(s) => Ok(Expr::Literal(Literal::Text(s.clone()))),
            AstExpr::BoolLiteral(v) => Ok(Expr::Literal(Literal::Bool(*v))),
            AstExpr::DateLiteral { year, month, day } => {
                Ok(Expr::Literal(Literal::Date(veld_runtime::date::build(*year, *month, *day))))
            }
            AstExpr::NullLiteral => Ok(Expr::Literal(Literal::Null(SqlType::Int))),

            AstExpr::Binary { op, left, right } => self.bind_binary(*op, left, right),

            AstExpr::Unary { op, expr } => {
                let bound = self.bind(expr)?;
                match op {
                    AstUnaryOp::Not => {
                        if bound.ty() != SqlType::Boolean {
                            return Err(VeldError::type_error("NOT requires a boolean"));
                        }
                        Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(bound) })
                    }
                    AstUnaryOp::IsNull => {
                        Ok(Expr::Unary { op: UnaryOp::IsNull, expr: Box::new(bound) })
                    }
                    AstUnaryOp::IsNotNull => Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(Expr::Unary {
                            op: UnaryOp::IsNull,
                            expr: Box::new(bound),
                        }),
                    }),
                }
            }

            AstExpr::Case { branches, else_expr } => {
                let mut bound_branches = Vec::new();
                let mut value_ty: Option<SqlType> = None;
                for (cond, value) in branches {
                    let cond = self.bind(cond)?;
                    if cond.ty() != SqlType::Boolean {
                        return Err(VeldError::type_error("CASE condition must be boolean"));
                    }
                    let value = self.bind(value)?;
                    value_ty = Some(merge_types(value_ty, value.ty())?);
                    bound_branches.push((cond, value));
                }
                let bound_else = else_expr.as_ref().map(|e| self.bind(e)).transpose()?;
                if let Some(e) = &bound_else {
                    value_ty = Some(merge_types(value_ty, e.ty())?);
                }
                let ty = value_ty.expect("parser requires one WHEN branch");
                let nullable = bound_else.is_none()
                    || bound_branches.iter().any(|(_, v)| v.nullable())
                    || bound_else.as_ref().is_some_and(|e| e.nullable());
                Ok(Expr::Case {
                    ty,
                    nullable,
                    branches: bound_branches,
                    else_expr: bound_else.map(Box::new),
                })
            }

            AstExpr::Aggregate { func, arg } => {
                let bound = arg.as_ref().map(|a| self.bind(a)).transpose()?;
                let func = match func {
                    AggFunc::Sum => AggregateFunc::Sum,
                    AggFunc::Avg => AggregateFunc::Avg,
                    AggFunc::Min => AggregateFunc::Min,
                    AggFunc::Max => AggregateFunc::Max,
                    AggFunc::Count => AggregateFunc::Count,
                };
                let ty = match (func, &bound) {
                    (AggregateFunc::Count, _) => SqlType::BigInt,
                    (_, None) => {
                        return Err(VeldError::type_error("aggregate requires an argument"))
                    }
                    (AggregateFunc::Avg, Some(a)) => {
                        require_numeric(a, "AVG")?;
                        SqlType::Real
                    }
                    (AggregateFunc::Sum, Some(a)) => {
                        require_numeric(a, "SUM")?;
                        if a.ty() == SqlType::Real {
                            SqlType::Real
                        } else {
                            SqlType::BigInt
                        }
                    }
                    (AggregateFunc::Min | AggregateFunc::Max, Some(a)) => a.ty(),
                };
                Ok(Expr::Aggregate { func, ty, arg: bound.map(Box::new) })
            }

            AstExpr::In { expr, list } => {
                let bound = self.bind(expr)?;
                let mut literals = Vec::new();
                for item in list {
                    match self.bind(item)? {
                        Expr::Literal(lit) if !lit.is_null() => {
                            check_comparable(bound.ty(), lit.ty())?;
                            literals.push(lit);
                        }
                        _ => {
                            return Err(VeldError::plan_error(
                                "IN list must contain non-null literals",
                            ))
                        }
                    }
                }
                Ok(Expr::In { expr: Box::new(bound), list: literals })
            }

            AstExpr::ExtractYear { expr } => {
                let bound = self.bind(expr)?;
                if bound.ty() != SqlType::Date {
                    return Err(VeldError::type_error("EXTRACT(YEAR) requires a date"));
                }
                Ok(Expr::ExtractYear { expr: Box::new(bound) })
            }

            AstExpr::Regexp { expr, pattern } => {
                let bound = self.bind(expr)?;
                if bound.ty() != SqlType::Text {
                    return Err(VeldError::type_error("REGEXP requires a text operand"));
                }
                Ok(Expr::Regexp { expr: Box::new(bound), pattern: pattern.clone() })
            }
        }
    }

    fn bind_column(&self, qualifier: Option<&str>, name: &str) -> VeldResult<Expr> {
        let hit = match qualifier {
            Some(q) => {
                let &t = self.by_name.get(q).ok_or_else(|| {
                    VeldError::plan_error(format!("unknown table or alias '{q}'"))
                })?;
                self.tables[t].table.column_idx(name).map(|c| (t, c))
            }
            None => {
                let mut found = None;
                for (t, bound) in self.tables.iter().enumerate() {
                    if let Some(c) = bound.table.column_idx(name) {
                        if found.is_some() {
                            return Err(VeldError::plan_error(format!(
                                "ambiguous column '{name}'"
                            )));
                        }
                        found = Some((t, c));
                    }
                }
                found
            }
        };
        let (t, c) = hit.ok_or_else(|| {
            VeldError::plan_error(format!("unknown column '{name}'"))
        })?;
        let column = &self.tables[t].table.columns()[c];
        Ok(Expr::ColumnRef {
            child: t,
            column: c,
            ty: column.ty,
            nullable: column.nullable,
        })
    }

    fn bind_binary(
        &self,
        op: AstBinaryOp,
        left: &AstExpr,
        right: &AstExpr,
    ) -> VeldResult<Expr> {
        let mut left = self.bind(left)?;
        let mut right = self.bind(right)?;
        coerce_null(&mut left, &mut right);

        let nullable = left.nullable() || right.nullable();
        let make = |op, ty, left: Expr, right: Expr| Expr::Binary {
            op,
            ty,
            nullable,
            left: Box::new(left),
            right: Box::new(right),
        };

        match op {
            AstBinaryOp::Add | AstBinaryOp::Sub | AstBinaryOp::Mul => {
                require_numeric(&left, "arithmetic")?;
                require_numeric(&right, "arithmetic")?;
                let ty = promote(left.ty(), right.ty());
                let op = match op {
                    AstBinaryOp::Add => BinaryOp::Add,
                    AstBinaryOp::Sub => BinaryOp::Sub,
                    _ => BinaryOp::Mul,
                };
                Ok(make(op, ty, left, right))
            }
            AstBinaryOp::Div => {
                require_numeric(&left, "division")?;
                require_numeric(&right, "division")?;
                // Division always computes in floating point.
                Ok(make(BinaryOp::Div, SqlType::Real, left, right))
            }
            AstBinaryOp::Eq | AstBinaryOp::Neq | AstBinaryOp::Lt | AstBinaryOp::Leq
            | AstBinaryOp::Gt | AstBinaryOp::Geq => {
                check_comparable(left.ty(), right.ty())?;
                let op = match op {
                    AstBinaryOp::Eq => BinaryOp::Eq,
                    AstBinaryOp::Neq => BinaryOp::Neq,
                    AstBinaryOp::Lt => BinaryOp::Lt,
                    AstBinaryOp::Leq => BinaryOp::Leq,
                    AstBinaryOp::Gt => BinaryOp::Gt,
                    _ => BinaryOp::Geq,
                };
                Ok(make(op, SqlType::Boolean, left, right))
            }
            AstBinaryOp::And | AstBinaryOp::Or => {
                if left.ty() != SqlType::Boolean || right.ty() != SqlType::Boolean {
                    return Err(VeldError::type_error("AND/OR require boolean operands"));
                }
                let op = if op == AstBinaryOp::And { BinaryOp::And } else { BinaryOp::Or };
                Ok(make(op, SqlType::Boolean, left, right))
            }
            AstBinaryOp::Like => {
                if left.ty() != SqlType::Text {
                    return Err(VeldError::type_error("LIKE requires a text operand"));
                }
                let pattern = match &right {
                    Expr::Literal(Literal::Text(p)) => p.clone(),
                    _ => {
                        return Err(VeldError::plan_error(
                            "LIKE pattern must be a string literal",
                        ))
                    }
                };
                Ok(plan_like(left, &pattern, nullable))
            }
        }
    }
}

/// Specializes a LIKE pattern: no wildcards becomes equality, a leading or
/// trailing `%` (only) becomes an affix test, anything else keeps the
/// general matcher.
fn plan_like(expr: Expr, pattern: &str, nullable: bool) -> Expr {
    let make = |op, rhs: String| Expr::Binary {
        op,
        ty: SqlType::Boolean,
        nullable,
        left: Box::new(expr.clone()),
        right: Box::new(Expr::Literal(Literal::Text(rhs))),
    };

    let has_wildcard = |s: &str| s.contains('%') || s.contains('_');
    if !has_wildcard(pattern) {
        return make(BinaryOp::Eq, pattern.to_string());
    }
    if let Some(prefix) = pattern.strip_suffix('%') {
        if !has_wildcard(prefix) {
            return make(BinaryOp::StartsWith, prefix.to_string());
        }
    }
    if let Some(suffix) = pattern.strip_prefix('%') {
        if !has_wildcard(suffix) {
            return make(BinaryOp::EndsWith, suffix.to_string());
        }
    }
    if pattern.len() >= 2 {
        if let Some(inner) = pattern.strip_prefix('%').and_then(|p| p.strip_suffix('%')) {
            if !has_wildcard(inner) {
                return make(BinaryOp::Contains, inner.to_string());
            }
        }
    }
    make(BinaryOp::Like, pattern.to_string())
}

fn require_numeric(expr: &Expr, what: &str) -> VeldResult<()> {
    if expr.ty().is_numeric() {
        Ok(())
    } else {
        Err(VeldError::type_error(format!(
            "{what} requires numeric operands, got {}",
            expr.ty()
        )))
    }
}

fn promote(a: SqlType, b: SqlType) -> SqlType {
    use SqlType::*;
    if a == Real || b == Real {
        Real
    } else if a == BigInt || b == BigInt {
        BigInt
    } else if a == Int || b == Int {
        Int
    } else {
        SmallInt
    }
}

fn check_comparable(a: SqlType, b: SqlType) -> VeldResult<()> {
    let ok = (a.is_numeric() && b.is_numeric())
        || (a == b)
        || matches!((a, b), (SqlType::Date, SqlType::Date));
    if ok {
        Ok(())
    } else {
        Err(VeldError::type_error(format!("cannot compare {a} with {b}")))
    }
}

fn merge_types(current: Option<SqlType>, next: SqlType) -> VeldResult<SqlType> {
    match current {
        None => Ok(next),
        Some(ty) if ty == next => Ok(ty),
        Some(ty) if ty.is_numeric() && next.is_numeric() => Ok(promote(ty, next)),
        Some(ty) => Err(VeldError::type_error(format!(
            "CASE branches mix {ty} and {next}"
        ))),
    }
}

/// Types a NULL literal from the opposite operand.
fn coerce_null(left: &mut Expr, right: &mut Expr) {
    if let Expr::Literal(Literal::Null(ty)) = left {
        *ty = right.ty();
    }
    if let Expr::Literal(Literal::Null(ty)) = right {
        *ty = left.ty();
    }
}
