//! Fingerprint-keyed hash table of row buckets
//!
//! Maps a 64-bit fingerprint to a `Vector` of rows. Collisions chain inside
//! the bucket; callers re-verify keys on probe.

use hashbrown::HashMap;

use crate::vector::{veld_vector_create, veld_vector_free, veld_vector_push_back, Vector};

type BucketMap = HashMap<u64, Box<Vector>>;

#[repr(C)]
pub struct HashTable {
    pub element_size: u64,
    map: *mut BucketMap,
}

#[repr(C)]
pub struct BucketList {
    pub num_buckets: u32,
    buckets: *mut *mut Vector,
}

pub unsafe extern "C" fn veld_hash_table_create(ht: *mut HashTable, element_size: u64) {
    (*ht).element_size = element_size;
    (*ht).map = Box::into_raw(Box::new(BucketMap::new()));
}

/// Returns a freshly appended row slot in the fingerprint's bucket.
pub unsafe extern "C" fn veld_hash_table_insert(ht: *mut HashTable, fingerprint: u64) -> *mut u8 {
    let element_size = (*ht).element_size;
    let map = &mut *(*ht).map;
    let bucket = map.entry(fingerprint).or_insert_with(|| {
        let mut v = Box::new(std::mem::zeroed::<Vector>());
        veld_vector_create(v.as_mut() as *mut Vector, element_size, 2);
        v
    });
    veld_vector_push_back(bucket.as_mut() as *mut Vector)
}

/// The bucket for a fingerprint, or null when absent.
pub unsafe extern "C" fn veld_hash_table_get_bucket(ht: *mut HashTable, fingerprint: u64) -> *mut Vector {
    let map = &mut *(*ht).map;
    match map.get_mut(&fingerprint) {
        Some(bucket) => bucket.as_mut() as *mut Vector,
        None => std::ptr::null_mut(),
    }
}

pub unsafe extern "C" fn veld_hash_table_get_all_buckets(ht: *mut HashTable, list: *mut BucketList) {
    let map = &mut *(*ht).map;
    let mut buckets: Vec<*mut Vector> =
        map.values_mut().map(|b| b.as_mut() as *mut Vector).collect();
    (*list).num_buckets = buckets.len() as u32;
    (*list).buckets = buckets.as_mut_ptr();
    std::mem::forget(buckets);
}

pub unsafe extern "C" fn veld_bucket_list_get(list: *mut BucketList, i: u32) -> *mut Vector {
    *(*list).buckets.add(i as usize)
}

pub unsafe extern "C" fn veld_bucket_list_size(list: *mut BucketList) -> u32 {
    (*list).num_buckets
}

pub unsafe extern "C" fn veld_bucket_list_free(list: *mut BucketList) {
    if !(*list).buckets.is_null() {
        drop(Vec::from_raw_parts(
            (*list).buckets,
            (*list).num_buckets as usize,
            (*list).num_buckets as usize,
        ));
        (*list).buckets = std::ptr::null_mut();
        (*list).num_buckets = 0;
    }
}

pub unsafe extern "C" fn veld_hash_table_free(ht: *mut HashTable) {
    if (*ht).map.is_null() {
        return;
    }
    let mut map = Box::from_raw((*ht).map);
    for bucket in map.values_mut() {
        veld_vector_free(bucket.as_mut() as *mut Vector);
    }
    (*ht).map = std::ptr::null_mut();
}

/// Mixes a value into a running fingerprint (boost-style combine).
pub unsafe extern "C" fn veld_hash_combine(hash: *mut u64, v: u64) {
    *hash ^= v
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(*hash << 6)
        .wrapping_add(*hash >> 2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_probe() {
        unsafe {
            let mut ht = std::mem::zeroed::<HashTable>();
            veld_hash_table_create(&mut ht, 8);

            let slot = veld_hash_table_insert(&mut ht, 42) as *mut i64;
            *slot = 100;
            let slot = veld_hash_table_insert(&mut ht, 42) as *mut i64;
            *slot = 200;

            let bucket = veld_hash_table_get_bucket(&mut ht, 42);
            assert!(!bucket.is_null());
            assert_eq!((*bucket).size, 2);

            assert!(veld_hash_table_get_bucket(&mut ht, 7).is_null());
            veld_hash_table_free(&mut ht);
        }
    }

    #[test]
    fn test_get_all_buckets() {
        unsafe {
            let mut ht = std::mem::zeroed::<HashTable>();
            veld_hash_table_create(&mut ht, 4);
            for fp in [1u64, 2, 3] {
                let slot = veld_hash_table_insert(&mut ht, fp) as *mut i32;
                *slot = fp as i32;
            }

            let mut list = std::mem::zeroed::<BucketList>();
            veld_hash_table_get_all_buckets(&mut ht, &mut list);
            assert_eq!(veld_bucket_list_size(&mut list), 3);
            let mut total = 0;
            for i in 0..3 {
                total += (*veld_bucket_list_get(&mut list, i)).size;
            }
            assert_eq!(total, 3);

            veld_bucket_list_free(&mut list);
            veld_hash_table_free(&mut ht);
        }
    }

    #[test]
    fn test_hash_combine_order_sensitive() {
        unsafe {
            let mut a = 0u64;
            veld_hash_combine(&mut a, 1);
            veld_hash_combine(&mut a, 2);
            let mut b = 0u64;
            veld_hash_combine(&mut b, 2);
            veld_hash_combine(&mut b, 1);
            assert_ne!(a, b);
        }
    }
}
