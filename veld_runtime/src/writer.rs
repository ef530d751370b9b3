//! Column file writers
//!
//! Serializes in-memory vectors into the on-disk column formats read by
//! `column_data` and `column_index`. Used by the loader path and by tests.

use std::fs::File;
use std::io::{BufWriter, Write};

use veld_common::VeldResult;

macro_rules! fixed_width_writer {
    ($name:ident, $t:ty) => {
        pub fn $name(values: &[$t], path: &str) -> VeldResult<()> {
            let mut out = BufWriter::new(File::create(path)?);
            for v in values {
                out.write_all(&v.to_le_bytes())?;
            }
            out.flush()?;
            Ok(())
        }
    };
}

fixed_width_writer!(write_i16_column, i16);
fixed_width_writer!(write_i32_column, i32);
fixed_width_writer!(write_i64_column, i64);
fixed_width_writer!(write_f64_column, f64);

pub fn write_bool_column(values: &[bool], path: &str) -> VeldResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for &v in values {
        out.write_all(&[v as u8])?;
    }
    out.flush()?;
    Ok(())
}

/// `{ u32 cardinality; { u32 length; u32 offset }[cardinality]; u8 bytes[] }`
/// with offsets from the start of the file and NUL-terminated slot bytes.
pub fn write_text_column(values: &[String], path: &str) -> VeldResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let card = values.len() as u32;
    out.write_all(&card.to_le_bytes())?;

    let mut offset = 4 + 8 * values.len() as u32;
    for v in values {
        out.write_all(&(v.len() as u32).to_le_bytes())?;
        out.write_all(&offset.to_le_bytes())?;
        offset += v.len() as u32 + 1;
    }
    for v in values {
        out.write_all(v.as_bytes())?;
        out.write_all(&[0])?;
    }
    out.flush()?;
    Ok(())
}

/// Sibling null file: one bool per row, true meaning null.
pub fn write_null_column(nulls: &[bool], path: &str) -> VeldResult<()> {
    write_bool_column(nulls, path)
}

/// Sorted secondary index over i32-representable keys (smallint widened,
/// int, date): `{ u32 n_keys; { i32 key; u32 run_len }[n_keys];
/// u32 row_ids[] }` with keys ascending and each run of row ids ascending.
pub fn write_i32_index(values: &[i32], path: &str) -> VeldResult<()> {
    let mut pairs: Vec<(i32, u32)> =
        values.iter().enumerate().map(|(i, &v)| (v, i as u32)).collect();
    pairs.sort_unstable();

    let mut keys: Vec<(i32, u32)> = Vec::new();
    for &(k, _) in &pairs {
        match keys.last_mut() {
            Some((last, count)) if *last == k => *count += 1,
            _ => keys.push((k, 1)),
        }
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&(keys.len() as u32).to_le_bytes())?;
    for (k, count) in &keys {
        out.write_all(&k.to_le_bytes())?;
        out.write_all(&count.to_le_bytes())?;
    }
    for (_, row) in &pairs {
        out.write_all(&row.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_i64_index(values: &[i64], path: &str) -> VeldResult<()> {
    let mut pairs: Vec<(i64, u32)> =
        values.iter().enumerate().map(|(i, &v)| (v, i as u32)).collect();
    pairs.sort_unstable();

    let mut keys: Vec<(i64, u32)> = Vec::new();
    for &(k, _) in &pairs {
        match keys.last_mut() {
            Some((last, count)) if *last == k => *count += 1,
            _ => keys.push((k, 1)),
        }
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&(keys.len() as u32).to_le_bytes())?;
    for (k, count) in &keys {
        out.write_all(&k.to_le_bytes())?;
        out.write_all(&count.to_le_bytes())?;
    }
    for (_, row) in &pairs {
        out.write_all(&row.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.veld");
        write_i64_column(&[1, 2, 3], p.to_str().unwrap()).unwrap();
        assert_eq!(std::fs::metadata(&p).unwrap().len(), 24);

        let p = dir.path().join("b.veld");
        write_bool_column(&[true, false], p.to_str().unwrap()).unwrap();
        assert_eq!(std::fs::metadata(&p).unwrap().len(), 2);
    }

    #[test]
    fn test_text_header_layout() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("t.veld");
        write_text_column(&["ab".into(), "c".into()], p.to_str().unwrap()).unwrap();
        let bytes = std::fs::read(&p).unwrap();
        // card = 2
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 2);
        // first slot: len 2, offset 4 + 2*8 = 20
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 20);
        // bytes are NUL-terminated
        assert_eq!(&bytes[20..23], b"ab\0");
    }

    #[test]
    fn test_index_runs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x.veldidx");
        write_i32_index(&[5, 3, 5, 1], p.to_str().unwrap()).unwrap();
        let bytes = std::fs::read(&p).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 3);
        // keys 1, 3, 5 with counts 1, 1, 2
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(bytes[20..24].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(bytes[24..28].try_into().unwrap()), 2);
    }
}
