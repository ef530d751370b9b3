//! Logical planning for VeldDB
//!
//! Typed expressions, the operator tree, and the planner that binds parsed
//! SQL against the catalog.

pub mod expr;
pub mod operator;
pub mod planner;

pub use expr::{AggregateFunc, BinaryOp, Expr, Literal, UnaryOp};
pub use operator::{OperatorKind, OperatorNode, OperatorSchema, SchemaColumn, SortKey};
pub use planner::Planner;

#[cfg(test)]
mod tests {
    use super::*;
    use veld_catalog::{Column, Database, SqlType, Table};
    use veld_common::{EngineConfig, VeldError};
    use veld_parser::{parse, Statement};

    fn test_db() -> Database {
        let mut db = Database::new();
        let mut t = Table::new("t");
        for (name, ty) in [("x", SqlType::Int), ("y", SqlType::Int)] {
            t.insert(Column {
                name: name.into(),
                ty,
                nullable: false,
                data_path: format!("{name}.veld"),
                null_path: None,
                index_path: None,
            })
            .unwrap();
        }
        db.insert(t).unwrap();

        for table in ["a", "b"] {
            let mut node = Table::new(table);
            for (name, ty) in [("k", SqlType::Int), ("v", SqlType::Int)] {
                node.insert(Column {
                    name: name.into(),
                    ty,
                    nullable: false,
                    data_path: format!("{table}_{name}.veld"),
                    null_path: None,
                    index_path: if name == "k" {
                        Some(format!("{table}_{name}.veldidx"))
                    } else {
                        None
                    },
                })
                .unwrap();
            }
            db.insert(node).unwrap();
        }

        let mut r = Table::new("r");
        r.insert(Column {
            name: "c".into(),
            ty: SqlType::Text,
            nullable: false,
            data_path: "c.veld".into(),
            null_path: None,
            index_path: None,
        })
        .unwrap();
        db.insert(r).unwrap();
        db
    }

    fn plan(sql: &str) -> Result<OperatorNode, VeldError> {
        let db = test_db();
        let config = EngineConfig::new();
        let Statement::Select(stmt) = parse(sql)?.remove(0);
        Planner::new(&db, &config).plan(&stmt)
    }

    #[test]
    fn test_simple_aggregate_plan() {
        let node = plan("SELECT SUM(x), SUM(y) FROM t WHERE x < 3").unwrap();
        assert!(matches!(node.kind, OperatorKind::Output));
        let agg = node.child();
        assert!(matches!(agg.kind, OperatorKind::Aggregate { .. }));
        let scan = agg.child();
        assert!(matches!(scan.kind, OperatorKind::SkinnerScanSelect { .. }));
        // Output prints two columns.
        assert_eq!(node.schema.len(), 2);
    }

    #[test]
    fn test_two_way_equi_join_uses_hash_join() {
        let node = plan("SELECT a.v, b.v FROM a, b WHERE a.k = b.k").unwrap();
        let join = node.child();
        match &join.kind {
            OperatorKind::HashJoin { left_keys, right_keys } => {
                assert_eq!(left_keys.len(), 1);
                assert_eq!(right_keys.len(), 1);
            }
            other => panic!("expected hash join, got {other:?}"),
        }
        assert_eq!(join.children.len(), 2);
    }

    #[test]
    fn test_theta_join_uses_skinner_join() {
        let node = plan("SELECT a.v FROM a, b WHERE a.k < b.k").unwrap();
        assert!(matches!(node.child().kind, OperatorKind::SkinnerJoin { .. }));
    }

    #[test]
    fn test_no_predicate_uses_cross_product() {
        let node = plan("SELECT a.v, b.v FROM a, b").unwrap();
        assert!(matches!(node.child().kind, OperatorKind::CrossProduct));
    }

    #[test]
    fn test_early_projection_drops_unused_columns() {
        let node = plan("SELECT x FROM t").unwrap();
        let scan = node.child();
        match &scan.kind {
            OperatorKind::Scan { table, scan_schema } => {
                assert_eq!(table, "t");
                assert_eq!(scan_schema.len(), 1);
            }
            other => panic!("expected scan, got {other:?}"),
        }
        // Only x is scanned; the scan schema is the projection itself.
        assert_eq!(scan.schema.len(), 1);
    }

    #[test]
    fn test_index_evaluable_filter_detected() {
        let node = plan("SELECT a.v FROM a WHERE a.k = 5 AND a.v < 10").unwrap();
        let scan = node.child();
        match &scan.kind {
            OperatorKind::SkinnerScanSelect { filters, index_filters, .. } => {
                assert_eq!(filters.len(), 2);
                assert_eq!(index_filters.len(), 1);
                // The indexed filter is the k = 5 equality.
                assert!(matches!(
                    &filters[index_filters[0]],
                    Expr::Binary { op: BinaryOp::Eq, .. }
                ));
            }
            other => panic!("expected adaptive scan, got {other:?}"),
        }
    }

    #[test]
    fn test_order_by_adds_hidden_key() {
        let node = plan("SELECT x FROM t ORDER BY y DESC").unwrap();
        let order = node.child();
        match &order.kind {
            OperatorKind::OrderBy { keys } => {
                assert_eq!(keys.len(), 1);
                assert!(!keys[0].asc);
            }
            other => panic!("expected order by, got {other:?}"),
        }
        // The scan carries x plus the hidden sort key; output prints 1.
        assert_eq!(order.child().schema.len(), 2);
        assert_eq!(node.schema.len(), 1);
    }

    #[test]
    fn test_group_by_plan() {
        let node = plan("SELECT x, COUNT(*) FROM t GROUP BY x").unwrap();
        let agg = node.child();
        match &agg.kind {
            OperatorKind::GroupByAggregate { group_by, aggregates } => {
                assert_eq!(group_by.len(), 1);
                assert_eq!(aggregates.len(), 1);
            }
            other => panic!("expected group-by aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_like_specialization() {
        let node = plan("SELECT c FROM r WHERE c LIKE 'foo%'").unwrap();
        let scan = node.child();
        match &scan.kind {
            OperatorKind::SkinnerScanSelect { filters, .. } => {
                assert!(matches!(
                    &filters[0],
                    Expr::Binary { op: BinaryOp::StartsWith, .. }
                ));
            }
            other => panic!("expected adaptive scan, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_names_are_plan_errors() {
        assert!(matches!(
            plan("SELECT x FROM missing"),
            Err(VeldError::PlanError { .. })
        ));
        assert!(matches!(
            plan("SELECT missing FROM t"),
            Err(VeldError::PlanError { .. })
        ));
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(
            plan("SELECT x + c FROM t, r"),
            Err(VeldError::TypeError { .. })
        ));
        assert!(matches!(
            plan("SELECT x FROM t WHERE x"),
            Err(VeldError::TypeError { .. })
        ));
        assert!(matches!(
            plan("SELECT x FROM t, r WHERE x = c"),
            Err(VeldError::TypeError { .. })
        ));
    }

    #[test]
    fn test_ungrouped_column_rejected() {
        assert!(matches!(
            plan("SELECT x, y, COUNT(*) FROM t GROUP BY x"),
            Err(VeldError::PlanError { .. })
        ));
    }

    #[test]
    fn test_division_is_real() {
        let node = plan("SELECT x / y FROM t").unwrap();
        assert_eq!(node.schema.columns[0].ty(), SqlType::Real);
    }
}
