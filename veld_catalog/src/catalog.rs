//! Read-only directory of tables, columns, and their on-disk files
//!
//! The catalog is populated by the embedding program (or a JSON manifest)
//! before parsing begins and passed by reference into the planner and the
//! translator factory.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use veld_common::{VeldError, VeldResult};

use crate::types::SqlType;

/// One column of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SqlType,
    #[serde(default)]
    pub nullable: bool,
    pub data_path: String,
    #[serde(default)]
    pub null_path: Option<String>,
    #[serde(default)]
    pub index_path: Option<String>,
}

impl Column {
    pub fn has_index(&self) -> bool {
        self.index_path.is_some()
    }
}

/// A table: an insertion-ordered map of column name to column.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub name: String,
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: Vec::new(), by_name: HashMap::new() }
    }

    pub fn insert(&mut self, column: Column) -> VeldResult<()> {
        if self.by_name.contains_key(&column.name) {
            return Err(VeldError::catalog_error(format!(
                "duplicate column '{}' in table '{}'",
                column.name, self.name
            )));
        }
        self.by_name.insert(column.name.clone(), self.columns.len());
        self.columns.push(column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn column_idx(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// The database: an insertion-ordered map of table name to table.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: Table) -> VeldResult<()> {
        if self.by_name.contains_key(&table.name) {
            return Err(VeldError::catalog_error(format!(
                "duplicate table '{}'",
                table.name
            )));
        }
        self.by_name.insert(table.name.clone(), self.tables.len());
        self.tables.push(table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.by_name.get(name).map(|&i| &self.tables[i])
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Load a catalog from the JSON manifest format:
    /// `{"tables": {"t": {"columns": [{"name": ..., "type": ..., ...}]}}}`.
    /// Paths in the manifest are resolved relative to the process working
    /// directory.
    pub fn from_manifest(json: &str) -> VeldResult<Self> {
        let manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| VeldError::catalog_error(format!("bad manifest: {e}")))?;
        let mut db = Database::new();
        for (name, spec) in manifest.tables {
            let mut table = Table::new(name);
            for column in spec.columns {
                table.insert(column)?;
            }
            db.insert(table)?;
        }
        Ok(db)
    }

    pub fn from_manifest_file(path: &str) -> VeldResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            VeldError::catalog_error(format!("cannot read manifest '{path}': {e}"))
        })?;
        Self::from_manifest(&json)
    }
}

#[derive(Deserialize)]
struct Manifest {
    // JSON object order is the table order; deserialize the map as pairs so
    // insertion order survives.
    #[serde(deserialize_with = "ordered_tables")]
    tables: Vec<(String, TableSpec)>,
}

#[derive(Deserialize)]
struct TableSpec {
    columns: Vec<Column>,
}

fn ordered_tables<'de, D>(d: D) -> Result<Vec<(String, TableSpec)>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    struct V;
    impl<'de> serde::de::Visitor<'de> for V {
        type Value = Vec<(String, TableSpec)>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a map of table name to table spec")
        }

        fn visit_map<A: serde::de::MapAccess<'de>>(
            self,
            mut m: A,
        ) -> Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some(entry) = m.next_entry::<String, TableSpec>()? {
                out.push(entry);
            }
            Ok(out)
        }
    }
    d.deserialize_map(V)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ty: SqlType) -> Column {
        Column {
            name: name.to_string(),
            ty,
            nullable: false,
            data_path: format!("{name}.veld"),
            null_path: None,
            index_path: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = Table::new("t");
        table.insert(column("x", SqlType::Int)).unwrap();
        table.insert(column("y", SqlType::Text)).unwrap();

        assert_eq!(table.column_idx("x"), Some(0));
        assert_eq!(table.column("y").unwrap().ty, SqlType::Text);
        assert!(table.column("z").is_none());
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut table = Table::new("t");
        table.insert(column("x", SqlType::Int)).unwrap();
        assert!(table.insert(column("x", SqlType::Int)).is_err());
    }

    #[test]
    fn test_manifest_round_trip() {
        let json = r#"{
            "tables": {
                "t": {
                    "columns": [
                        {"name": "x", "type": "int", "data_path": "x.veld"},
                        {"name": "c", "type": "text", "nullable": true,
                         "data_path": "c.veld", "null_path": "c_null.veld"}
                    ]
                }
            }
        }"#;
        let db = Database::from_manifest(json).unwrap();
        let t = db.table("t").unwrap();
        assert_eq!(t.columns().len(), 2);
        assert_eq!(t.column("x").unwrap().ty, SqlType::Int);
        assert!(t.column("c").unwrap().nullable);
        assert_eq!(
            t.column("c").unwrap().null_path.as_deref(),
            Some("c_null.veld")
        );
    }
}
