//! End-to-end query tests: SQL through the planner, the translators, native
//! code, and back out through the printer.

use std::sync::Mutex;

use veld_catalog::{Column, Database, SqlType, Table};
use veld_common::{EngineConfig, SkinnerMode};
use veld_compile::compile_query;
use veld_parser::{parse, Statement};
use veld_plan::Planner;
use veld_runtime::printer::capture_output;
use veld_runtime::writer;

// The printer sink is process-global; query tests must not interleave.
static OUTPUT_LOCK: Mutex<()> = Mutex::new(());

struct Fixture {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    db: Database,
}

impl Fixture {
    fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap(), db: Database::new() }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_str().unwrap().to_string()
    }

    fn add_i32_table(&mut self, table: &str, columns: &[(&str, &[i32])]) {
        self.add_i32_table_indexed(table, columns, &[]);
    }

    fn add_i32_table_indexed(
        &mut self,
        table: &str,
        columns: &[(&str, &[i32])],
        indexed: &[&str],
    ) {
        let mut t = Table::new(table);
        for (name, values) in columns {
            let data_path = self.path(&format!("{table}_{name}.veld"));
            writer::write_i32_column(values, &data_path).unwrap();
            let index_path = if indexed.contains(name) {
                let path = self.path(&format!("{table}_{name}.veldidx"));
                writer::write_i32_index(values, &path).unwrap();
                Some(path)
            } else {
                None
            };
            t.insert(Column {
                name: name.to_string(),
                ty: SqlType::Int,
                nullable: false,
                data_path,
                null_path: None,
                index_path,
            })
            .unwrap();
        }
        self.db.insert(t).unwrap();
    }

    fn add_text_table(&mut self, table: &str, column: &str, values: &[&str]) {
        let data_path = self.path(&format!("{table}_{column}.veld"));
        let owned: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        writer::write_text_column(&owned, &data_path).unwrap();
        let mut t = Table::new(table);
        t.insert(Column {
            name: column.to_string(),
            ty: SqlType::Text,
            nullable: false,
            data_path,
            null_path: None,
            index_path: None,
        })
        .unwrap();
        self.db.insert(t).unwrap();
    }

    fn run(&self, sql: &str) -> Vec<String> {
        self.run_with(sql, EngineConfig::new())
    }

    fn run_with(&self, sql: &str, config: EngineConfig) -> Vec<String> {
        let _guard = OUTPUT_LOCK.lock().unwrap();
        let statements = parse(sql).unwrap();
        let ((), rows) = capture_output(|| {
            for statement in &statements {
                let Statement::Select(stmt) = statement;
                let plan = Planner::new(&self.db, &config).plan(stmt).unwrap();
                let query = compile_query(&plan, &self.db, &config).unwrap();
                query.execute().unwrap();
            }
        });
        rows
    }
}

#[test]
fn test_sum_with_filter() {
    // Schema: t(x, y) = [(1,10),(2,20),(3,30)].
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("x", &[1, 2, 3]), ("y", &[10, 20, 30])]);

    let rows = fx.run("SELECT SUM(x), SUM(y) FROM t WHERE x < 3");
    assert_eq!(rows, vec!["3,30"]);
}

#[test]
fn test_two_way_join() {
    let mut fx = Fixture::new();
    fx.add_i32_table("a", &[("k", &[1, 2]), ("v", &[100, 200])]);
    fx.add_i32_table("b", &[("k", &[1, 2, 3]), ("w", &[10, 20, 30])]);

    let mut rows = fx.run("SELECT a.v, b.w FROM a, b WHERE a.k = b.k");
    rows.sort();
    assert_eq!(rows, vec!["100,10", "200,20"]);
}

#[test]
fn test_like_prefix() {
    let mut fx = Fixture::new();
    fx.add_text_table("r", "c", &["foo", "foobar", "barfoo", "baz"]);

    let rows = fx.run("SELECT c FROM r WHERE c LIKE 'foo%'");
    assert_eq!(rows, vec!["foo", "foobar"]);
}

#[test]
fn test_like_contains_and_suffix() {
    let mut fx = Fixture::new();
    fx.add_text_table("r", "c", &["foo", "foobar", "barfoo", "baz"]);

    let rows = fx.run("SELECT c FROM r WHERE c LIKE '%foo'");
    assert_eq!(rows, vec!["foo", "barfoo"]);

    let rows = fx.run("SELECT c FROM r WHERE c LIKE '%oo%'");
    assert_eq!(rows, vec!["foo", "foobar", "barfoo"]);
}

#[test]
fn test_date_extract_and_order_by() {
    let mut fx = Fixture::new();
    let dates = vec![
        veld_runtime::date::build(2020, 1, 1),
        veld_runtime::date::build(2021, 6, 15),
        veld_runtime::date::build(2022, 12, 31),
    ];
    let data_path = fx.path("d_x.veld");
    writer::write_i32_column(&dates, &data_path).unwrap();
    let mut t = Table::new("d");
    t.insert(Column {
        name: "x".into(),
        ty: SqlType::Date,
        nullable: false,
        data_path,
        null_path: None,
        index_path: None,
    })
    .unwrap();
    fx.db.insert(t).unwrap();

    let rows = fx.run(
        "SELECT EXTRACT(YEAR FROM x) FROM d WHERE x >= DATE '2021-01-01' ORDER BY x",
    );
    assert_eq!(rows, vec!["2021", "2022"]);
}

#[test]
fn test_star_join_with_empty_side_is_empty() {
    let mut fx = Fixture::new();
    fx.add_i32_table("f", &[("k", &[1, 2, 3]), ("m", &[5, 6, 7])]);
    fx.add_i32_table("d1", &[("k", &[1, 2, 3])]);
    fx.add_i32_table("d2", &[("k", &[1, 2, 3])]);
    fx.add_i32_table("d3", &[("k", &[])]);

    let rows = fx.run(
        "SELECT f.m FROM f, d1, d2, d3 \
         WHERE f.k = d1.k AND f.k = d2.k AND f.k = d3.k",
    );
    assert!(rows.is_empty());
}

#[test]
fn test_index_scan_empty_bucket_short_circuits() {
    let mut fx = Fixture::new();
    fx.add_i32_table_indexed("t", &[("k", &[1, 2, 3]), ("v", &[10, 20, 30])], &["k"]);

    let rows = fx.run("SELECT v FROM t WHERE k = 99 AND v > 0");
    assert!(rows.is_empty());

    let rows = fx.run("SELECT v FROM t WHERE k = 2 AND v > 0");
    assert_eq!(rows, vec!["20"]);
}

#[test]
fn test_avg_formats_two_decimals() {
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("x", &[2, 4, 6, 8, 10])]);

    let rows = fx.run("SELECT AVG(x) FROM t");
    assert_eq!(rows, vec!["6.00"]);
}

#[test]
fn test_group_by_with_count_and_sum() {
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("k", &[1, 2, 1, 2, 1]), ("v", &[10, 20, 30, 40, 50])]);

    let mut rows = fx.run("SELECT k, COUNT(*), SUM(v) FROM t GROUP BY k");
    rows.sort();
    assert_eq!(rows, vec!["1,3,90", "2,2,60"]);
}

#[test]
fn test_cross_product() {
    let mut fx = Fixture::new();
    fx.add_i32_table("a", &[("x", &[1, 2])]);
    fx.add_i32_table("b", &[("y", &[10, 20])]);

    let mut rows = fx.run("SELECT x, y FROM a, b");
    rows.sort();
    assert_eq!(rows, vec!["1,10", "1,20", "2,10", "2,20"]);
}

#[test]
fn test_order_by_desc_and_expressions() {
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("x", &[3, 1, 2])]);

    let rows = fx.run("SELECT x + 100 FROM t ORDER BY x DESC");
    assert_eq!(rows, vec!["103", "102", "101"]);
}

#[test]
fn test_in_list_and_case() {
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("x", &[1, 2, 3, 4, 5])]);

    let rows = fx.run("SELECT x FROM t WHERE x IN (2, 4, 9)");
    assert_eq!(rows, vec!["2", "4"]);

    let rows = fx.run(
        "SELECT CASE WHEN x < 3 THEN 0 ELSE 1 END FROM t WHERE x IN (1, 5)",
    );
    assert_eq!(rows, vec!["0", "1"]);
}

#[test]
fn test_nullable_column_filter_drops_nulls() {
    let mut fx = Fixture::new();
    let data_path = fx.path("n_x.veld");
    writer::write_i32_column(&[1, 2, 3, 4], &data_path).unwrap();
    let null_path = fx.path("n_x_null.veld");
    writer::write_null_column(&[false, true, false, true], &null_path).unwrap();
    let mut t = Table::new("n");
    t.insert(Column {
        name: "x".into(),
        ty: SqlType::Int,
        nullable: true,
        data_path,
        null_path: Some(null_path),
        index_path: None,
    })
    .unwrap();
    fx.db.insert(t).unwrap();

    // A null predicate collapses to false: rows 2 and 4 are dropped.
    let rows = fx.run("SELECT x FROM n WHERE x > 0");
    assert_eq!(rows, vec!["1", "3"]);
}

#[test]
fn test_skinner_modes_agree() {
    let mut fx = Fixture::new();
    fx.add_i32_table("a", &[("k", &[1, 2, 3]), ("v", &[10, 20, 30])]);
    fx.add_i32_table("b", &[("k", &[2, 3, 4]), ("w", &[200, 300, 400])]);
    fx.add_i32_table("c", &[("k", &[3, 4, 5]), ("u", &[7, 8, 9])]);

    let sql = "SELECT a.v, b.w, c.u FROM a, b, c \
               WHERE a.k = b.k AND b.k = c.k";

    let mut permute = fx.run_with(sql, EngineConfig::new());
    let mut recompile = fx.run_with(
        sql,
        EngineConfig { skinner: SkinnerMode::Recompile, adaptive_scan: true },
    );
    permute.sort();
    recompile.sort();
    assert_eq!(permute, vec!["30,300,7"]);
    assert_eq!(permute, recompile);
}

#[test]
fn test_simd_scan_matches_scalar() {
    let mut fx = Fixture::new();
    let xs: Vec<i32> = (0..100).map(|i| i % 17).collect();
    let ys: Vec<i32> = (0..100).collect();
    fx.add_i32_table("t", &[("x", &xs), ("y", &ys)]);

    let sql = "SELECT y FROM t WHERE x = 5 AND y < 60";
    let mut adaptive = fx.run(sql);
    // Disabling the adaptive scan routes this plan through the vectorized
    // translator (all filters are int compares against literals).
    let mut simd = fx.run_with(
        sql,
        EngineConfig { skinner: SkinnerMode::Permute, adaptive_scan: false },
    );
    adaptive.sort();
    simd.sort();
    assert_eq!(adaptive, simd);
    assert!(!adaptive.is_empty());
}

#[test]
fn test_division_prints_real() {
    let mut fx = Fixture::new();
    fx.add_i32_table("t", &[("x", &[7]), ("y", &[2])]);

    let rows = fx.run("SELECT x / y FROM t");
    assert_eq!(rows, vec!["3.50"]);
}
