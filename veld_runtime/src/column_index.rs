//! Secondary column indexes
//!
//! A disk index maps a key to the sorted run of row ids holding that key,
//! parsed from the `.veldidx` layout written by `writer`. A memory index is
//! built on the fly while a join materializes its children. Both hand out
//! `IndexBucket` views; the scan-select driver intersects several buckets
//! through `BucketArray`.

use std::ffi::CStr;
use std::os::raw::c_char;

use hashbrown::HashMap;

/// A borrowed, ascending run of row ids for one key.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IndexBucket {
    pub row_ids: *const u32,
    pub len: u32,
}

impl IndexBucket {
    fn empty() -> Self {
        Self { row_ids: std::ptr::null(), len: 0 }
    }
}

// ---- Disk-backed index ----

pub struct DiskIndex {
    /// (key, start offset into row_ids, run length), keys ascending.
    keys: Vec<(i64, u32, u32)>,
    row_ids: Vec<u32>,
}

impl DiskIndex {
    fn open(path: &str, key_width: usize) -> Self {
        let bytes = std::fs::read(path)
            .unwrap_or_else(|e| panic!("cannot open index file '{path}': {e}"));
        assert!(bytes.len() >= 4, "index file '{path}' is truncated");
        let n_keys = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;

        let mut keys = Vec::with_capacity(n_keys);
        let mut pos = 4usize;
        let mut offset = 0u32;
        for _ in 0..n_keys {
            let key = match key_width {
                4 => i32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as i64,
                8 => i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()),
                _ => unreachable!(),
            };
            pos += key_width;
            let count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
            keys.push((key, offset, count));
            offset += count;
        }

        let mut row_ids = Vec::with_capacity(offset as usize);
        for _ in 0..offset {
            row_ids.push(u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }

        Self { keys, row_ids }
    }

    fn get_bucket(&self, key: i64) -> IndexBucket {
        match self.keys.binary_search_by_key(&key, |&(k, _, _)| k) {
            Ok(i) => {
                let (_, start, len) = self.keys[i];
                IndexBucket {
                    row_ids: self.row_ids[start as usize..].as_ptr(),
                    len,
                }
            }
            Err(_) => IndexBucket::empty(),
        }
    }
}

pub unsafe extern "C" fn veld_disk_index_open_i32(path: *const c_char) -> *mut DiskIndex {
    let path = CStr::from_ptr(path).to_str().expect("index path is not utf-8");
    Box::into_raw(Box::new(DiskIndex::open(path, 4)))
}

pub unsafe extern "C" fn veld_disk_index_open_i64(path: *const c_char) -> *mut DiskIndex {
    let path = CStr::from_ptr(path).to_str().expect("index path is not utf-8");
    Box::into_raw(Box::new(DiskIndex::open(path, 8)))
}

pub unsafe extern "C" fn veld_disk_index_get_bucket(
    index: *mut DiskIndex,
    key: i64,
    out: *mut IndexBucket,
) {
    *out = (*index).get_bucket(key);
}

pub unsafe extern "C" fn veld_disk_index_free(index: *mut DiskIndex) {
    if !index.is_null() {
        drop(Box::from_raw(index));
    }
}

// ---- In-memory index ----

#[derive(Default)]
pub struct MemIndex {
    buckets: HashMap<i64, Vec<u32>>,
}

impl MemIndex {
    /// Rows arrive in ascending order during materialization, so runs stay
    /// sorted by appending.
    pub fn insert(&mut self, key: i64, row: u32) {
        self.buckets.entry(key).or_default().push(row);
    }

    pub fn get_bucket(&self, key: i64) -> IndexBucket {
        match self.buckets.get(&key) {
            Some(rows) => IndexBucket { row_ids: rows.as_ptr(), len: rows.len() as u32 },
            None => IndexBucket::empty(),
        }
    }

    /// The smallest row id with this key strictly greater than `last`, or
    /// `cardinality` when the run is exhausted.
    pub fn get_next_greater(&self, key: i64, last: i32, cardinality: i32) -> i32 {
        match self.buckets.get(&key) {
            Some(rows) => {
                let pos = rows.partition_point(|&r| (r as i32) <= last);
                if pos < rows.len() {
                    rows[pos] as i32
                } else {
                    cardinality
                }
            }
            None => cardinality,
        }
    }
}

pub extern "C" fn veld_mem_index_create() -> *mut MemIndex {
    Box::into_raw(Box::new(MemIndex::default()))
}

pub unsafe extern "C" fn veld_mem_index_insert(index: *mut MemIndex, key: i64, row: i32) {
    (*index).insert(key, row as u32);
}

pub unsafe extern "C" fn veld_mem_index_get_bucket(
    index: *mut MemIndex,
    key: i64,
    out: *mut IndexBucket,
) {
    *out = (*index).get_bucket(key);
}

pub unsafe extern "C" fn veld_mem_index_get_next_greater(
    index: *mut MemIndex,
    key: i64,
    last: i32,
    cardinality: i32,
) -> i32 {
    (*index).get_next_greater(key, last, cardinality)
}

pub unsafe extern "C" fn veld_mem_index_free(index: *mut MemIndex) {
    if !index.is_null() {
        drop(Box::from_raw(index));
    }
}

// ---- Sorted intersection over several buckets ----

pub struct BucketArray {
    buckets: Vec<IndexBucket>,
    cursors: Vec<usize>,
}

pub extern "C" fn veld_bucket_array_create(capacity: u32) -> *mut BucketArray {
    Box::into_raw(Box::new(BucketArray {
        buckets: Vec::with_capacity(capacity as usize),
        cursors: Vec::with_capacity(capacity as usize),
    }))
}

pub unsafe extern "C" fn veld_bucket_array_push(arr: *mut BucketArray, bucket: *const IndexBucket) {
    (*arr).buckets.push(*bucket);
    (*arr).cursors.push(0);
}

/// Positions each bucket's cursor at its first row id >= `next_tuple`.
pub unsafe extern "C" fn veld_bucket_array_init_intersection(arr: *mut BucketArray, next_tuple: i32) {
    let arr = &mut *arr;
    for (bucket, cursor) in arr.buckets.iter().zip(arr.cursors.iter_mut()) {
        let rows = std::slice::from_raw_parts(bucket.row_ids, bucket.len as usize);
        *cursor = rows.partition_point(|&r| (r as i32) < next_tuple);
    }
}

/// Streams up to `max_size` row ids present in every active bucket into
/// `result`, advancing the cursors; returns the number produced. `active`
/// selects which buckets participate (by position in the array).
pub unsafe extern "C" fn veld_bucket_array_populate(
    arr: *mut BucketArray,
    result: *mut i32,
    max_size: i32,
    active: *const i32,
    active_count: i32,
) -> i32 {
    let BucketArray { buckets, cursors } = &mut *arr;
    let active = std::slice::from_raw_parts(active, active_count as usize);
    let rows: Vec<&[u32]> = buckets
        .iter()
        .map(|b| {
            if b.row_ids.is_null() {
                &[][..]
            } else {
                std::slice::from_raw_parts(b.row_ids, b.len as usize)
            }
        })
        .collect();
    let mut produced = 0i32;

    'outer: while produced < max_size {
        // Candidate = current row of the first active bucket.
        let first = active[0] as usize;
        if cursors[first] >= rows[first].len() {
            break;
        }
        let mut candidate = rows[first][cursors[first]];

        let mut agreed = 1;
        while agreed < active.len() {
            let i = active[agreed] as usize;
            let r = rows[i];
            let c = &mut cursors[i];
            while *c < r.len() && r[*c] < candidate {
                *c += 1;
            }
            if *c >= r.len() {
                break 'outer;
            }
            if r[*c] > candidate {
                // Restart with the larger candidate.
                candidate = r[*c];
                let f = &mut cursors[first];
                let fr = rows[first];
                while *f < fr.len() && fr[*f] < candidate {
                    *f += 1;
                }
                if *f >= fr.len() {
                    break 'outer;
                }
                if fr[*f] > candidate {
                    candidate = fr[*f];
                }
                agreed = 1;
                continue;
            }
            agreed += 1;
        }

        // All active buckets agree on `candidate`.
        *result.add(produced as usize) = candidate as i32;
        produced += 1;
        for &i in active {
            cursors[i as usize] += 1;
        }
    }

    produced
}

pub unsafe extern "C" fn veld_bucket_array_free(arr: *mut BucketArray) {
    if !arr.is_null() {
        drop(Box::from_raw(arr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;

    #[test]
    fn test_disk_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.veldidx");
        writer::write_i32_index(&[5, 3, 5, 1, 3], path.to_str().unwrap()).unwrap();

        let idx = DiskIndex::open(path.to_str().unwrap(), 4);
        let b = idx.get_bucket(5);
        let rows = unsafe { std::slice::from_raw_parts(b.row_ids, b.len as usize) };
        assert_eq!(rows, &[0, 2]);

        let b = idx.get_bucket(3);
        let rows = unsafe { std::slice::from_raw_parts(b.row_ids, b.len as usize) };
        assert_eq!(rows, &[1, 4]);

        assert_eq!(idx.get_bucket(7).len, 0);
    }

    #[test]
    fn test_mem_index_next_greater() {
        let mut idx = MemIndex::default();
        for (row, key) in [(0u32, 2i64), (1, 7), (3, 2), (5, 2)] {
            idx.insert(key, row);
        }
        assert_eq!(idx.get_next_greater(2, -1, 10), 0);
        assert_eq!(idx.get_next_greater(2, 0, 10), 3);
        assert_eq!(idx.get_next_greater(2, 3, 10), 5);
        assert_eq!(idx.get_next_greater(2, 5, 10), 10);
        assert_eq!(idx.get_next_greater(9, -1, 10), 10);
    }

    #[test]
    fn test_sorted_intersection() {
        let a = vec![1u32, 3, 5, 7, 9];
        let b = vec![2u32, 3, 5, 9, 11];
        let c = vec![3u32, 4, 5, 8, 9, 10];
        unsafe {
            let arr = veld_bucket_array_create(3);
            for rows in [&a, &b, &c] {
                let bucket = IndexBucket { row_ids: rows.as_ptr(), len: rows.len() as u32 };
                veld_bucket_array_push(arr, &bucket);
            }
            veld_bucket_array_init_intersection(arr, 0);

            let mut result = [0i32; 64];
            let active = [0i32, 1, 2];
            let n = veld_bucket_array_populate(arr, result.as_mut_ptr(), 64, active.as_ptr(), 3);
            assert_eq!(&result[..n as usize], &[3, 5, 9]);

            // Exhausted afterwards.
            let n = veld_bucket_array_populate(arr, result.as_mut_ptr(), 64, active.as_ptr(), 3);
            assert_eq!(n, 0);
            veld_bucket_array_free(arr);
        }
    }

    #[test]
    fn test_intersection_resume_from_tuple() {
        let a = vec![1u32, 4, 6, 8];
        let b = vec![4u32, 6, 9];
        unsafe {
            let arr = veld_bucket_array_create(2);
            for rows in [&a, &b] {
                let bucket = IndexBucket { row_ids: rows.as_ptr(), len: rows.len() as u32 };
                veld_bucket_array_push(arr, &bucket);
            }
            veld_bucket_array_init_intersection(arr, 5);

            let mut result = [0i32; 8];
            let active = [0i32, 1];
            let n = veld_bucket_array_populate(arr, result.as_mut_ptr(), 8, active.as_ptr(), 2);
            assert_eq!(&result[..n as usize], &[6]);
            veld_bucket_array_free(arr);
        }
    }
}
