//! CSV column loader
//!
//! Serializes a comma-separated text file into the binary column files a
//! table's catalog entry names: one data file per column, a sibling null
//! file for nullable columns (empty fields read as NULL), and a sorted
//! index file for indexed columns. Fields are split on commas with no
//! quoting; dates are `yyyy-mm-dd`.

use anyhow::{bail, Context, Result};

use veld_catalog::{Column, SqlType, Table};
use veld_runtime::{date, writer};

enum ColumnValues {
    SmallInt(Vec<i16>),
    Int(Vec<i32>),
    BigInt(Vec<i64>),
    Real(Vec<f64>),
    Bool(Vec<bool>),
    Date(Vec<i32>),
    Text(Vec<String>),
}

impl ColumnValues {
    fn new(ty: SqlType) -> Self {
        match ty {
            SqlType::SmallInt => ColumnValues::SmallInt(Vec::new()),
            SqlType::Int => ColumnValues::Int(Vec::new()),
            SqlType::BigInt => ColumnValues::BigInt(Vec::new()),
            SqlType::Real => ColumnValues::Real(Vec::new()),
            SqlType::Boolean => ColumnValues::Bool(Vec::new()),
            SqlType::Date => ColumnValues::Date(Vec::new()),
            SqlType::Text => ColumnValues::Text(Vec::new()),
        }
    }

    /// NULL still occupies a data slot; the null file carries the flag.
    fn push_null(&mut self) {
        match self {
            ColumnValues::SmallInt(v) => v.push(0),
            ColumnValues::Int(v) | ColumnValues::Date(v) => v.push(0),
            ColumnValues::BigInt(v) => v.push(0),
            ColumnValues::Real(v) => v.push(0.0),
            ColumnValues::Bool(v) => v.push(false),
            ColumnValues::Text(v) => v.push(String::new()),
        }
    }

    fn push(&mut self, field: &str, line: usize, column: &str) -> Result<()> {
        let bad = || format!("line {line}: bad value '{field}' for column '{column}'");
        match self {
            ColumnValues::SmallInt(v) => v.push(field.parse().with_context(bad)?),
            ColumnValues::Int(v) => v.push(field.parse().with_context(bad)?),
            ColumnValues::BigInt(v) => v.push(field.parse().with_context(bad)?),
            ColumnValues::Real(v) => v.push(field.parse().with_context(bad)?),
            ColumnValues::Bool(v) => v.push(match field.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => true,
                "false" | "f" | "0" => false,
                _ => bail!(bad()),
            }),
            ColumnValues::Date(v) => v.push(parse_date(field).with_context(bad)?),
            ColumnValues::Text(v) => v.push(field.to_string()),
        }
        Ok(())
    }
}

fn parse_date(field: &str) -> Result<i32> {
    let parts: Vec<&str> = field.split('-').collect();
    if parts.len() != 3 {
        bail!("expected yyyy-mm-dd");
    }
    let year = parts[0].parse().context("bad year")?;
    let month = parts[1].parse().context("bad month")?;
    let day = parts[2].parse().context("bad day")?;
    Ok(date::build(year, month, day))
}

/// Loads a CSV into the table's column files; returns the row count.
pub fn load_table(csv_path: &str, table: &Table) -> Result<usize> {
    let source =
        std::fs::read_to_string(csv_path).with_context(|| format!("reading '{csv_path}'"))?;
    let columns = table.columns();

    let mut values: Vec<ColumnValues> =
        columns.iter().map(|c| ColumnValues::new(c.ty)).collect();
    let mut nulls: Vec<Vec<bool>> = vec![Vec::new(); columns.len()];

    let mut rows = 0;
    for (i, line) in source.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != columns.len() {
            bail!(
                "line {}: expected {} fields for table '{}', got {}",
                i + 1,
                columns.len(),
                table.name,
                fields.len()
            );
        }
        for ((field, column), (column_values, column_nulls)) in fields
            .iter()
            .zip(columns)
            .zip(values.iter_mut().zip(nulls.iter_mut()))
        {
            if field.is_empty() {
                if !column.nullable {
                    bail!("line {}: column '{}' is not nullable", i + 1, column.name);
                }
                column_values.push_null();
                column_nulls.push(true);
            } else {
                column_values.push(field, i + 1, &column.name)?;
                column_nulls.push(false);
            }
        }
        rows += 1;
    }

    for ((column, column_values), column_nulls) in
        columns.iter().zip(&values).zip(&nulls)
    {
        write_column(column, column_values, column_nulls)?;
    }
    Ok(rows)
}

fn write_column(column: &Column, values: &ColumnValues, nulls: &[bool]) -> Result<()> {
    match values {
        ColumnValues::SmallInt(v) => writer::write_i16_column(v, &column.data_path)?,
        ColumnValues::Int(v) | ColumnValues::Date(v) => {
            writer::write_i32_column(v, &column.data_path)?
        }
        ColumnValues::BigInt(v) => writer::write_i64_column(v, &column.data_path)?,
        ColumnValues::Real(v) => writer::write_f64_column(v, &column.data_path)?,
        ColumnValues::Bool(v) => writer::write_bool_column(v, &column.data_path)?,
        ColumnValues::Text(v) => writer::write_text_column(v, &column.data_path)?,
    }

    if let Some(null_path) = &column.null_path {
        writer::write_null_column(nulls, null_path)?;
    }

    if let Some(index_path) = &column.index_path {
        match values {
            ColumnValues::SmallInt(v) => {
                let wide: Vec<i32> = v.iter().map(|&x| x as i32).collect();
                writer::write_i32_index(&wide, index_path)?;
            }
            ColumnValues::Int(v) | ColumnValues::Date(v) => {
                writer::write_i32_index(v, index_path)?;
            }
            ColumnValues::BigInt(v) => writer::write_i64_index(v, index_path)?,
            _ => bail!(
                "column '{}' cannot be indexed (only integral and date keys)",
                column.name
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(dir: &std::path::Path, name: &str, ty: SqlType) -> Column {
        Column {
            name: name.to_string(),
            ty,
            nullable: false,
            data_path: dir.join(format!("{name}.veld")).to_str().unwrap().to_string(),
            null_path: None,
            index_path: None,
        }
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "1,foo,2020-01-01\n2,bar,2021-06-15\n").unwrap();

        let mut table = Table::new("t");
        let mut k = column(dir.path(), "k", SqlType::Int);
        k.index_path = Some(dir.path().join("k.veldidx").to_str().unwrap().to_string());
        table.insert(k).unwrap();
        table.insert(column(dir.path(), "c", SqlType::Text)).unwrap();
        table.insert(column(dir.path(), "d", SqlType::Date)).unwrap();

        let rows = load_table(csv.to_str().unwrap(), &table).unwrap();
        assert_eq!(rows, 2);

        let k_bytes = std::fs::read(dir.path().join("k.veld")).unwrap();
        assert_eq!(k_bytes.len(), 8);
        assert_eq!(i32::from_le_bytes(k_bytes[0..4].try_into().unwrap()), 1);

        // The index file opens with its key count.
        let idx_bytes = std::fs::read(dir.path().join("k.veldidx")).unwrap();
        assert_eq!(u32::from_le_bytes(idx_bytes[0..4].try_into().unwrap()), 2);

        let d_bytes = std::fs::read(dir.path().join("d.veld")).unwrap();
        assert_eq!(
            i32::from_le_bytes(d_bytes[0..4].try_into().unwrap()),
            date::build(2020, 1, 1)
        );
    }

    #[test]
    fn test_null_fields_need_nullable_column() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "1,10\n2,\n").unwrap();

        let mut table = Table::new("t");
        table.insert(column(dir.path(), "x", SqlType::Int)).unwrap();
        table.insert(column(dir.path(), "y", SqlType::Int)).unwrap();
        assert!(load_table(csv.to_str().unwrap(), &table).is_err());

        let mut nullable = column(dir.path(), "x", SqlType::Int);
        nullable.nullable = true;
        nullable.null_path =
            Some(dir.path().join("x_null.veld").to_str().unwrap().to_string());
        let mut table = Table::new("u");
        table.insert(nullable).unwrap();

        let csv = dir.path().join("nullable.csv");
        std::fs::write(&csv, "1\n\n3\n").unwrap();
        let rows = load_table(csv.to_str().unwrap(), &table).unwrap();
        // The empty line is skipped, not read as a null row.
        assert_eq!(rows, 2);
        let nulls = std::fs::read(dir.path().join("x_null.veld")).unwrap();
        assert_eq!(nulls, vec![0, 0]);
    }

    #[test]
    fn test_text_column_rejects_index() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("rows.csv");
        std::fs::write(&csv, "foo\n").unwrap();

        let mut c = column(dir.path(), "c", SqlType::Text);
        c.index_path = Some(dir.path().join("c.veldidx").to_str().unwrap().to_string());
        let mut table = Table::new("t");
        table.insert(c).unwrap();

        assert!(load_table(csv.to_str().unwrap(), &table).is_err());
    }
}
