//! Logical operator tree
//!
//! Leaves scan a single table; internal nodes combine children. Each node
//! carries an `OperatorSchema`: an ordered list of named, typed, nullable
//! output columns, each with a scalar expression over child column
//! references (or over the node's own virtual slots for leaves and
//! aggregates).

use veld_catalog::SqlType;

use crate::expr::Expr;

#[derive(Debug, Clone)]
pub struct SchemaColumn {
    pub name: String,
    pub expr: Expr,
}

impl SchemaColumn {
    pub fn ty(&self) -> SqlType {
        self.expr.ty()
    }

    pub fn nullable(&self) -> bool {
        self.expr.nullable()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperatorSchema {
    pub columns: Vec<SchemaColumn>,
}

impl OperatorSchema {
    pub fn new(columns: Vec<SchemaColumn>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One sort key of an OrderBy.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: Expr,
    pub asc: bool,
}

#[derive(Debug, Clone)]
pub enum OperatorKind {
    /// Full scan; the schema's exprs read virtual slots filled per tuple.
    Scan {
        table: String,
        /// Kept table columns, in virtual-slot order (names are catalog
        /// column names).
        scan_schema: OperatorSchema,
    },
    /// Scan with inlined predicate evaluation (static order).
    ScanSelect {
        table: String,
        /// Types of the virtual slots, in table-column order of the kept set.
        scan_schema: OperatorSchema,
        filters: Vec<Expr>,
    },
    /// Adaptive scan: predicate order is chosen at runtime; `index_filters`
    /// lists the filter indices evaluable through a column index.
    SkinnerScanSelect {
        table: String,
        scan_schema: OperatorSchema,
        filters: Vec<Expr>,
        index_filters: Vec<usize>,
    },
    Select {
        cond: Expr,
    },
    CrossProduct,
    HashJoin {
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
    },
    /// Adaptive n-way join over conjunctive predicates.
    SkinnerJoin {
        conditions: Vec<Expr>,
    },
    /// Aggregation without grouping; virtual slots hold the aggregate
    /// results.
    Aggregate {
        aggregates: Vec<Expr>,
    },
    /// Virtual slots hold group-by columns then aggregates.
    GroupByAggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<Expr>,
    },
    OrderBy {
        keys: Vec<SortKey>,
    },
    Output,
}

#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub kind: OperatorKind,
    pub schema: OperatorSchema,
    pub children: Vec<OperatorNode>,
}

impl OperatorNode {
    pub fn new(kind: OperatorKind, schema: OperatorSchema, children: Vec<OperatorNode>) -> Self {
        Self { kind, schema, children }
    }

    pub fn child(&self) -> &OperatorNode {
        &self.children[0]
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            OperatorKind::Scan { .. } => "scan",
            OperatorKind::ScanSelect { .. } => "scan_select",
            OperatorKind::SkinnerScanSelect { .. } => "skinner_scan_select",
            OperatorKind::Select { .. } => "select",
            OperatorKind::CrossProduct => "cross_product",
            OperatorKind::HashJoin { .. } => "hash_join",
            OperatorKind::SkinnerJoin { .. } => "skinner_join",
            OperatorKind::Aggregate { .. } => "aggregate",
            OperatorKind::GroupByAggregate { .. } => "group_by_aggregate",
            OperatorKind::OrderBy { .. } => "order_by",
            OperatorKind::Output => "output",
        }
    }

    /// Indented single-line-per-operator dump, for tests and debugging.
    pub fn explain(&self) -> String {
        fn walk(node: &OperatorNode, depth: usize, out: &mut String) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(node.name());
            out.push_str(&format!(" [{} cols]\n", node.schema.len()));
            for child in &node.children {
                walk(child, depth + 1, out);
            }
        }
        let mut out = String::new();
        walk(self, 0, &mut out);
        out
    }
}
