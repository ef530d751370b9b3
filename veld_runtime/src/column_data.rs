//! Memory-mapped column files
//!
//! One file per column, little-endian. Fixed-width columns are raw packed
//! elements. Text columns carry a header of `(length, offset)` slots followed
//! by the concatenated (NUL-terminated) bytes, offsets measured from the file
//! start.
//!
//! Open/mmap failures are fatal: generated code holds raw pointers into the
//! mapping and there is no way to unwind through it.

use std::ffi::CStr;
use std::fs::File;
use std::os::raw::c_char;

use memmap2::Mmap;

use crate::string::StringView;

/// Layout shared by every column kind; generated code reads `data` and
/// `file_length` directly. `map` keeps the mapping alive and is opaque to
/// generated code.
#[repr(C)]
pub struct RawColumnData {
    pub data: *const u8,
    pub file_length: u32,
    map: *mut Mmap,
}

#[repr(C)]
struct TextSlot {
    length: u32,
    offset: u32,
}

pub unsafe extern "C" fn veld_column_open(col: *mut RawColumnData, path: *const c_char) {
    let path = CStr::from_ptr(path).to_str().expect("column path is not utf-8");
    let file = File::open(path)
        .unwrap_or_else(|e| panic!("cannot open column file '{path}': {e}"));
    let len = file
        .metadata()
        .unwrap_or_else(|e| panic!("cannot stat column file '{path}': {e}"))
        .len();
    if len == 0 {
        // mmap rejects zero-length files; an empty file is an empty column.
        (*col).data = std::ptr::null();
        (*col).file_length = 0;
        (*col).map = std::ptr::null_mut();
        return;
    }
    let map = Mmap::map(&file)
        .unwrap_or_else(|e| panic!("cannot mmap column file '{path}': {e}"));
    let map = Box::new(map);
    (*col).data = map.as_ptr();
    (*col).file_length = map.len() as u32;
    (*col).map = Box::into_raw(map);
}

pub unsafe extern "C" fn veld_column_close(col: *mut RawColumnData) {
    if !(*col).map.is_null() {
        drop(Box::from_raw((*col).map));
        (*col).map = std::ptr::null_mut();
        (*col).data = std::ptr::null();
        (*col).file_length = 0;
    }
}

pub unsafe extern "C" fn veld_column_size_i8(col: *mut RawColumnData) -> u32 {
    (*col).file_length
}

pub unsafe extern "C" fn veld_column_size_i16(col: *mut RawColumnData) -> u32 {
    (*col).file_length / 2
}

pub unsafe extern "C" fn veld_column_size_i32(col: *mut RawColumnData) -> u32 {
    (*col).file_length / 4
}

pub unsafe extern "C" fn veld_column_size_i64(col: *mut RawColumnData) -> u32 {
    (*col).file_length / 8
}

pub unsafe extern "C" fn veld_column_size_f64(col: *mut RawColumnData) -> u32 {
    (*col).file_length / 8
}

pub unsafe extern "C" fn veld_column_size_text(col: *mut RawColumnData) -> u32 {
    if (*col).file_length < 4 {
        return 0;
    }
    *((*col).data as *const u32)
}

/// Writes the idx'th text slot into `out` as a borrowed view of the mapping.
pub unsafe extern "C" fn veld_column_get_text(
    col: *mut RawColumnData,
    idx: u32,
    out: *mut StringView,
) {
    let base = (*col).data;
    let slot = (base.add(4) as *const TextSlot).add(idx as usize);
    (*out).data = base.add((*slot).offset as usize);
    (*out).len = (*slot).length;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;
    use std::io::Write as _;

    #[test]
    fn test_open_fixed_width_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.veld");
        let values = vec![1i32, -5, 7, i32::MAX];
        writer::write_i32_column(&values, path.to_str().unwrap()).unwrap();

        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        unsafe {
            let mut col = std::mem::zeroed::<RawColumnData>();
            veld_column_open(&mut col, cpath.as_ptr());
            assert_eq!(veld_column_size_i32(&mut col), 4);
            let data = col.data as *const i32;
            for (i, &v) in values.iter().enumerate() {
                assert_eq!(*data.add(i), v);
            }
            veld_column_close(&mut col);
        }
    }

    #[test]
    fn test_open_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.veld");
        let values = vec!["foo".to_string(), "".to_string(), "barfoo".to_string()];
        writer::write_text_column(&values, path.to_str().unwrap()).unwrap();

        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        unsafe {
            let mut col = std::mem::zeroed::<RawColumnData>();
            veld_column_open(&mut col, cpath.as_ptr());
            assert_eq!(veld_column_size_text(&mut col), 3);
            for (i, expected) in values.iter().enumerate() {
                let mut view = StringView { data: std::ptr::null(), len: 0 };
                veld_column_get_text(&mut col, i as u32, &mut view);
                assert_eq!(view.as_bytes(), expected.as_bytes());
            }
            veld_column_close(&mut col);
        }
    }

    #[test]
    #[should_panic(expected = "cannot open column file")]
    fn test_missing_file_is_fatal() {
        let cpath = std::ffi::CString::new("/nonexistent/never.veld").unwrap();
        unsafe {
            let mut col = std::mem::zeroed::<RawColumnData>();
            veld_column_open(&mut col, cpath.as_ptr());
        }
    }

    #[test]
    fn test_empty_text_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.veld");
        // A zero-byte file reads as an empty column rather than a header.
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[]).unwrap();
        drop(f);

        let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        unsafe {
            let mut col = std::mem::zeroed::<RawColumnData>();
            veld_column_open(&mut col, cpath.as_ptr());
            assert_eq!(veld_column_size_text(&mut col), 0);
            veld_column_close(&mut col);
        }
    }
}
