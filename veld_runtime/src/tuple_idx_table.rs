//! Adaptive-radix-tree set of tuple-index vectors
//!
//! SkinnerJoin identifies an output tuple by the vector of per-child row
//! indices that produced it. This set dedupes those vectors across join
//! orderings. Keys are the indices encoded big-endian so byte-lexicographic
//! order equals element-wise numeric order; nodes grow N4 → N16 → N48 → N256
//! with path compression.

const EMPTY48: u8 = 255;

enum Node {
    Leaf { key: Vec<u8> },
    Inner(Box<Inner>),
}

struct Inner {
    prefix: Vec<u8>,
    children: Children,
}

enum Children {
    N4 { keys: [u8; 4], slots: [Option<Box<Node>>; 4], len: u8 },
    N16 { keys: [u8; 16], slots: [Option<Box<Node>>; 16], len: u8 },
    N48 { index: Box<[u8; 256]>, slots: Vec<Option<Box<Node>>>, len: u8 },
    N256 { slots: Box<[Option<Box<Node>>; 256]>, len: u16 },
}

impl Children {
    fn new() -> Self {
        Children::N4 { keys: [0; 4], slots: [None, None, None, None], len: 0 }
    }

    fn find_mut(&mut self, byte: u8) -> Option<&mut Box<Node>> {
        match self {
            Children::N4 { keys, slots, len } => {
                for i in 0..*len as usize {
                    if keys[i] == byte {
                        return slots[i].as_mut();
                    }
                }
                None
            }
            Children::N16 { keys, slots, len } => {
                for i in 0..*len as usize {
                    if keys[i] == byte {
                        return slots[i].as_mut();
                    }
                }
                None
            }
            Children::N48 { index, slots, .. } => {
                let slot = index[byte as usize];
                if slot == EMPTY48 {
                    None
                } else {
                    slots[slot as usize].as_mut()
                }
            }
            Children::N256 { slots, .. } => slots[byte as usize].as_mut(),
        }
    }

    fn is_full(&self) -> bool {
        match self {
            Children::N4 { len, .. } => *len == 4,
            Children::N16 { len, .. } => *len == 16,
            Children::N48 { len, .. } => *len == 48,
            Children::N256 { .. } => false,
        }
    }

    /// Lazy expansion: grows into the next node kind only when full.
    fn grow(&mut self) {
        let old = std::mem::replace(self, Children::new());
        match old {
            Children::N4 { keys, mut slots, len } => {
                let mut nkeys = [0u8; 16];
                let mut nslots: [Option<Box<Node>>; 16] = std::array::from_fn(|_| None);
                for i in 0..len as usize {
                    nkeys[i] = keys[i];
                    nslots[i] = slots[i].take();
                }
                *self = Children::N16 { keys: nkeys, slots: nslots, len };
            }
            Children::N16 { keys, mut slots, len } => {
                let mut index = Box::new([EMPTY48; 256]);
                let mut nslots: Vec<Option<Box<Node>>> = (0..48).map(|_| None).collect();
                for i in 0..len as usize {
                    index[keys[i] as usize] = i as u8;
                    nslots[i] = slots[i].take();
                }
                *self = Children::N48 { index, slots: nslots, len };
            }
            Children::N48 { index, mut slots, len } => {
                let mut nslots: Box<[Option<Box<Node>>; 256]> =
                    Box::new(std::array::from_fn(|_| None));
                for byte in 0..256usize {
                    let slot = index[byte];
                    if slot != EMPTY48 {
                        nslots[byte] = slots[slot as usize].take();
                    }
                }
                *self = Children::N256 { slots: nslots, len: len as u16 };
            }
            n256 @ Children::N256 { .. } => *self = n256,
        }
    }

    fn add(&mut self, byte: u8, node: Box<Node>) {
        if self.is_full() {
            self.grow();
        }
        match self {
            Children::N4 { keys, slots, len } => {
                keys[*len as usize] = byte;
                slots[*len as usize] = Some(node);
                *len += 1;
            }
            Children::N16 { keys, slots, len } => {
                keys[*len as usize] = byte;
                slots[*len as usize] = Some(node);
                *len += 1;
            }
            Children::N48 { index, slots, len } => {
                index[byte as usize] = *len;
                slots[*len as usize] = Some(node);
                *len += 1;
            }
            Children::N256 { slots, len } => {
                slots[byte as usize] = Some(node);
                *len += 1;
            }
        }
    }

    /// Visits children in ascending byte order.
    fn for_each_sorted(&self, mut f: impl FnMut(&Node)) {
        match self {
            Children::N4 { keys, slots, len } => {
                let mut order: Vec<usize> = (0..*len as usize).collect();
                order.sort_by_key(|&i| keys[i]);
                for i in order {
                    f(slots[i].as_ref().unwrap());
                }
            }
            Children::N16 { keys, slots, len } => {
                let mut order: Vec<usize> = (0..*len as usize).collect();
                order.sort_by_key(|&i| keys[i]);
                for i in order {
                    f(slots[i].as_ref().unwrap());
                }
            }
            Children::N48 { index, slots, .. } => {
                for byte in 0..256usize {
                    let slot = index[byte];
                    if slot != EMPTY48 {
                        f(slots[slot as usize].as_ref().unwrap());
                    }
                }
            }
            Children::N256 { slots, .. } => {
                for slot in slots.iter().flatten() {
                    f(slot);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct TupleIdxTable {
    root: Option<Box<Node>>,
    size: usize,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl TupleIdxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Inserts the tuple-index vector; returns false when already present.
    pub fn insert(&mut self, tuple: &[u32]) -> bool {
        let mut key = Vec::with_capacity(tuple.len() * 4);
        for v in tuple {
            key.extend_from_slice(&v.to_be_bytes());
        }
        let inserted = Self::insert_at(&mut self.root, &key, 0);
        if inserted {
            self.size += 1;
        }
        inserted
    }

    fn insert_at(slot: &mut Option<Box<Node>>, key: &[u8], depth: usize) -> bool {
        enum Step {
            Duplicate,
            LeafSplit(usize),
            PrefixSplit(usize),
            Descend(usize, u8),
        }

        let step = match slot {
            None => {
                *slot = Some(Box::new(Node::Leaf { key: key.to_vec() }));
                return true;
            }
            Some(node) => match node.as_ref() {
                Node::Leaf { key: existing } => {
                    debug_assert_eq!(existing.len(), key.len());
                    if existing[depth..] == key[depth..] {
                        Step::Duplicate
                    } else {
                        Step::LeafSplit(common_prefix(&existing[depth..], &key[depth..]))
                    }
                }
                Node::Inner(inner) => {
                    let p = common_prefix(&inner.prefix, &key[depth..]);
                    if p < inner.prefix.len() {
                        Step::PrefixSplit(p)
                    } else {
                        let next_depth = depth + inner.prefix.len();
                        Step::Descend(next_depth, key[next_depth])
                    }
                }
            },
        };

        match step {
            Step::Duplicate => false,

            // Split the leaf under an inner node holding the shared path.
            Step::LeafSplit(p) => {
                let old = slot.take().unwrap();
                let old_byte = match old.as_ref() {
                    Node::Leaf { key: existing } => existing[depth + p],
                    Node::Inner(_) => unreachable!(),
                };
                let new_byte = key[depth + p];
                let mut children = Children::new();
                children.add(old_byte, old);
                children.add(new_byte, Box::new(Node::Leaf { key: key.to_vec() }));
                *slot = Some(Box::new(Node::Inner(Box::new(Inner {
                    prefix: key[depth..depth + p].to_vec(),
                    children,
                }))));
                true
            }

            // Path mismatch inside a compressed prefix: split it.
            Step::PrefixSplit(p) => {
                let mut old = slot.take().unwrap();
                let (shared, old_byte) = match old.as_mut() {
                    Node::Inner(inner) => {
                        let shared = inner.prefix[..p].to_vec();
                        let old_byte = inner.prefix[p];
                        inner.prefix.drain(..p + 1);
                        (shared, old_byte)
                    }
                    Node::Leaf { .. } => unreachable!(),
                };
                let new_byte = key[depth + p];
                let mut children = Children::new();
                children.add(old_byte, old);
                children.add(new_byte, Box::new(Node::Leaf { key: key.to_vec() }));
                *slot = Some(Box::new(Node::Inner(Box::new(Inner { prefix: shared, children }))));
                true
            }

            Step::Descend(next_depth, byte) => {
                let node = slot.as_mut().unwrap();
                let inner = match node.as_mut() {
                    Node::Inner(inner) => inner,
                    Node::Leaf { .. } => unreachable!(),
                };
                match inner.children.find_mut(byte) {
                    Some(child) => {
                        let mut child_slot = Some(std::mem::replace(
                            child,
                            Box::new(Node::Leaf { key: Vec::new() }),
                        ));
                        let inserted = Self::insert_at(&mut child_slot, key, next_depth + 1);
                        *child = child_slot.unwrap();
                        inserted
                    }
                    None => {
                        inner
                            .children
                            .add(byte, Box::new(Node::Leaf { key: key.to_vec() }));
                        true
                    }
                }
            }
        }
    }

    /// Visits every tuple in lexicographic order.
    pub fn for_each(&self, mut cb: impl FnMut(&[u32])) {
        fn walk(node: &Node, cb: &mut impl FnMut(&[u32])) {
            match node {
                Node::Leaf { key } => {
                    let tuple: Vec<u32> = key
                        .chunks_exact(4)
                        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
                        .collect();
                    cb(&tuple);
                }
                Node::Inner(inner) => {
                    inner.children.for_each_sorted(|child| walk(child, cb));
                }
            }
        }
        if let Some(root) = &self.root {
            walk(root, &mut cb);
        }
    }
}

// ---- Generated-code interface ----

pub extern "C" fn veld_tit_create() -> *mut TupleIdxTable {
    Box::into_raw(Box::new(TupleIdxTable::new()))
}

pub unsafe extern "C" fn veld_tit_insert(table: *mut TupleIdxTable, arr: *const i32, n: i32) -> bool {
    let tuple: Vec<u32> =
        std::slice::from_raw_parts(arr, n as usize).iter().map(|&v| v as u32).collect();
    (*table).insert(&tuple)
}

pub unsafe extern "C" fn veld_tit_size(table: *mut TupleIdxTable) -> i32 {
    (*table).len() as i32
}

pub unsafe extern "C" fn veld_tit_free(table: *mut TupleIdxTable) {
    if !table.is_null() {
        drop(Box::from_raw(table));
    }
}

/// Sorted snapshot used by the output loop; the set is frozen once the
/// adaptive driver finishes, so a snapshot is exact.
pub struct TupleIdxTableIter {
    tuples: Vec<i32>,
    arity: usize,
}

pub unsafe extern "C" fn veld_tit_iter_create(table: *mut TupleIdxTable, arity: i32) -> *mut TupleIdxTableIter {
    let mut tuples = Vec::new();
    (*table).for_each(|tuple| {
        for &v in tuple {
            tuples.push(v as i32);
        }
    });
    Box::into_raw(Box::new(TupleIdxTableIter { tuples, arity: arity as usize }))
}

pub unsafe extern "C" fn veld_tit_iter_size(it: *mut TupleIdxTableIter) -> i32 {
    if (*it).arity == 0 {
        return 0;
    }
    ((*it).tuples.len() / (*it).arity) as i32
}

pub unsafe extern "C" fn veld_tit_iter_get(it: *mut TupleIdxTableIter, i: i32) -> *const i32 {
    (*it).tuples.as_ptr().add(i as usize * (*it).arity)
}

pub unsafe extern "C" fn veld_tit_iter_free(it: *mut TupleIdxTableIter) {
    if !it.is_null() {
        drop(Box::from_raw(it));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedupes() {
        let mut t = TupleIdxTable::new();
        assert!(t.insert(&[1, 2, 3]));
        assert!(t.insert(&[1, 2, 4]));
        assert!(!t.insert(&[1, 2, 3]));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_for_each_sorted() {
        let mut t = TupleIdxTable::new();
        for tuple in [[2u32, 0], [0, 5], [1, 1], [0, 2], [1, 0]] {
            t.insert(&tuple);
        }
        let mut seen = Vec::new();
        t.for_each(|tup| seen.push(tup.to_vec()));
        assert_eq!(
            seen,
            vec![vec![0, 2], vec![0, 5], vec![1, 0], vec![1, 1], vec![2, 0]]
        );
    }

    #[test]
    fn test_node_growth_past_48_children() {
        let mut t = TupleIdxTable::new();
        // 200 distinct leading bytes forces N4 -> N16 -> N48 -> N256 growth.
        for i in 0..200u32 {
            assert!(t.insert(&[(i << 24) | 5, 7]));
        }
        assert_eq!(t.len(), 200);
        let mut count = 0;
        let mut last: Option<Vec<u32>> = None;
        t.for_each(|tup| {
            let v = tup.to_vec();
            if let Some(prev) = &last {
                assert!(prev < &v);
            }
            last = Some(v);
            count += 1;
        });
        assert_eq!(count, 200);
    }

    #[test]
    fn test_path_compression_split() {
        let mut t = TupleIdxTable::new();
        // Shared 7-byte prefix exercises the prefix-split path.
        t.insert(&[0x01020304, 0x05060708]);
        t.insert(&[0x01020304, 0x05060709]);
        t.insert(&[0x01020304, 0x05FF0708]);
        assert_eq!(t.len(), 3);
        let mut seen = Vec::new();
        t.for_each(|tup| seen.push(tup.to_vec()));
        assert_eq!(
            seen,
            vec![
                vec![0x01020304, 0x05060708],
                vec![0x01020304, 0x05060709],
                vec![0x01020304, 0x05FF0708],
            ]
        );
    }

    #[test]
    fn test_iter_snapshot() {
        unsafe {
            let t = veld_tit_create();
            let a = [3i32, 1];
            let b = [1i32, 2];
            assert!(veld_tit_insert(t, a.as_ptr(), 2));
            assert!(veld_tit_insert(t, b.as_ptr(), 2));
            assert!(!veld_tit_insert(t, a.as_ptr(), 2));

            let it = veld_tit_iter_create(t, 2);
            assert_eq!(veld_tit_iter_size(it), 2);
            let first = veld_tit_iter_get(it, 0);
            assert_eq!((*first, *first.add(1)), (1, 2));
            let second = veld_tit_iter_get(it, 1);
            assert_eq!((*second, *second.add(1)), (3, 1));

            veld_tit_iter_free(it);
            veld_tit_free(t);
        }
    }
}
