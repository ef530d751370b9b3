//! Type manager
//!
//! Types are opaque `Type` handles into a manager. Composites are
//! deduplicated on construction, so type equality is handle equality except
//! for named structs, which are identified by name and may be forward
//! declared as opaque.

use hashbrown::HashMap;
use smallvec::SmallVec;

use veld_common::{VeldError, VeldResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type(pub u16);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F64,
    I32Vec4,
    I32Vec8,
    I1Vec8,
    Pointer(Type),
    /// Element type and length; length 0 means unsized.
    Array(Type, u32),
    Struct {
        name: Option<String>,
        fields: Vec<Type>,
        opaque: bool,
    },
    Function {
        ret: Type,
        args: Vec<Type>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Pointer(Type),
    Array(Type, u32),
    AnonStruct(Vec<Type>),
    Function(Type, Vec<Type>),
}

pub struct TypeManager {
    kinds: Vec<TypeKind>,
    dedup: HashMap<DedupKey, Type>,
    named: HashMap<String, Type>,
}

impl Default for TypeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeManager {
    pub fn new() -> Self {
        // Primitives occupy fixed handles so they can be constructed without
        // a lookup.
        let kinds = vec![
            TypeKind::Void,
            TypeKind::I1,
            TypeKind::I8,
            TypeKind::I16,
            TypeKind::I32,
            TypeKind::I64,
            TypeKind::F64,
            TypeKind::I32Vec4,
            TypeKind::I32Vec8,
            TypeKind::I1Vec8,
        ];
        Self { kinds, dedup: HashMap::new(), named: HashMap::new() }
    }

    pub fn void_type(&self) -> Type {
        Type(0)
    }
    pub fn i1_type(&self) -> Type {
        Type(1)
    }
    pub fn i8_type(&self) -> Type {
        Type(2)
    }
    pub fn i16_type(&self) -> Type {
        Type(3)
    }
    pub fn i32_type(&self) -> Type {
        Type(4)
    }
    pub fn i64_type(&self) -> Type {
        Type(5)
    }
    pub fn f64_type(&self) -> Type {
        Type(6)
    }
    pub fn i32_vec4_type(&self) -> Type {
        Type(7)
    }
    pub fn i32_vec8_type(&self) -> Type {
        Type(8)
    }
    pub fn i1_vec8_type(&self) -> Type {
        Type(9)
    }

    pub fn kind(&self, t: Type) -> &TypeKind {
        &self.kinds[t.0 as usize]
    }

    fn push(&mut self, kind: TypeKind) -> Type {
        let t = Type(self.kinds.len() as u16);
        self.kinds.push(kind);
        t
    }

    fn intern(&mut self, key: DedupKey, kind: TypeKind) -> Type {
        if let Some(&t) = self.dedup.get(&key) {
            return t;
        }
        let t = self.push(kind);
        self.dedup.insert(key, t);
        t
    }

    pub fn pointer(&mut self, pointee: Type) -> Type {
        self.intern(DedupKey::Pointer(pointee), TypeKind::Pointer(pointee))
    }

    pub fn array(&mut self, elem: Type, len: u32) -> Type {
        self.intern(DedupKey::Array(elem, len), TypeKind::Array(elem, len))
    }

    pub fn function(&mut self, ret: Type, args: &[Type]) -> Type {
        self.intern(
            DedupKey::Function(ret, args.to_vec()),
            TypeKind::Function { ret, args: args.to_vec() },
        )
    }

    /// Anonymous structs are deduplicated by field tuple; named structs are
    /// registered under their name. Re-registering a name is an error unless
    /// the earlier registration was opaque.
    pub fn struct_type(&mut self, fields: &[Type], name: Option<&str>) -> VeldResult<Type> {
        match name {
            None => Ok(self.intern(
                DedupKey::AnonStruct(fields.to_vec()),
                TypeKind::Struct { name: None, fields: fields.to_vec(), opaque: false },
            )),
            Some(name) => {
                if let Some(&existing) = self.named.get(name) {
                    match &mut self.kinds[existing.0 as usize] {
                        TypeKind::Struct { opaque, fields: f, .. } if *opaque => {
                            *f = fields.to_vec();
                            *opaque = false;
                            Ok(existing)
                        }
                        _ => Err(VeldError::ir_error(format!(
                            "named struct '{name}' is already defined"
                        ))),
                    }
                } else {
                    let t = self.push(TypeKind::Struct {
                        name: Some(name.to_string()),
                        fields: fields.to_vec(),
                        opaque: false,
                    });
                    self.named.insert(name.to_string(), t);
                    Ok(t)
                }
            }
        }
    }

    /// Forward declaration of a named struct.
    pub fn opaque(&mut self, name: &str) -> Type {
        if let Some(&t) = self.named.get(name) {
            return t;
        }
        let t = self.push(TypeKind::Struct {
            name: Some(name.to_string()),
            fields: Vec::new(),
            opaque: true,
        });
        self.named.insert(name.to_string(), t);
        t
    }

    pub fn get_named(&self, name: &str) -> Option<Type> {
        self.named.get(name).copied()
    }

    /// An already-interned pointer type, without mutation.
    pub fn find_pointer(&self, pointee: Type) -> Option<Type> {
        self.dedup.get(&DedupKey::Pointer(pointee)).copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    // ---- predicates ----

    pub fn is_void(&self, t: Type) -> bool {
        matches!(self.kind(t), TypeKind::Void)
    }
    pub fn is_i1(&self, t: Type) -> bool {
        matches!(self.kind(t), TypeKind::I1)
    }
    pub fn is_f64(&self, t: Type) -> bool {
        matches!(self.kind(t), TypeKind::F64)
    }
    pub fn is_ptr(&self, t: Type) -> bool {
        matches!(self.kind(t), TypeKind::Pointer(_))
    }
    pub fn is_func(&self, t: Type) -> bool {
        matches!(self.kind(t), TypeKind::Function { .. })
    }
    pub fn is_vec(&self, t: Type) -> bool {
        matches!(
            self.kind(t),
            TypeKind::I32Vec4 | TypeKind::I32Vec8 | TypeKind::I1Vec8
        )
    }

    pub fn pointee(&self, t: Type) -> Option<Type> {
        match self.kind(t) {
            TypeKind::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    pub fn function_signature(&self, t: Type) -> Option<(Type, &[Type])> {
        match self.kind(t) {
            TypeKind::Function { ret, args } => Some((*ret, args)),
            _ => None,
        }
    }

    // ---- layout ----

    pub fn align_of(&self, t: Type) -> u32 {
        match self.kind(t) {
            TypeKind::Void => 1,
            TypeKind::I1 | TypeKind::I8 => 1,
            TypeKind::I16 => 2,
            TypeKind::I32 => 4,
            TypeKind::I64 | TypeKind::F64 | TypeKind::Pointer(_) | TypeKind::Function { .. } => 8,
            TypeKind::I32Vec4 => 16,
            TypeKind::I32Vec8 | TypeKind::I1Vec8 => 32,
            TypeKind::Array(elem, _) => self.align_of(*elem),
            TypeKind::Struct { fields, .. } => {
                fields.iter().map(|&f| self.align_of(f)).max().unwrap_or(1)
            }
        }
    }

    pub fn size_of(&self, t: Type) -> u32 {
        match self.kind(t) {
            TypeKind::Void => 0,
            TypeKind::I1 | TypeKind::I8 => 1,
            TypeKind::I16 => 2,
            TypeKind::I32 => 4,
            TypeKind::I64 | TypeKind::F64 | TypeKind::Pointer(_) | TypeKind::Function { .. } => 8,
            TypeKind::I32Vec4 => 16,
            TypeKind::I32Vec8 | TypeKind::I1Vec8 => 32,
            TypeKind::Array(elem, len) => self.size_of(*elem) * len,
            TypeKind::Struct { fields, .. } => {
                let mut offset = 0u32;
                for &f in fields {
                    offset = align_up(offset, self.align_of(f));
                    offset += self.size_of(f);
                }
                align_up(offset, self.align_of(t))
            }
        }
    }

    pub fn field_offset(&self, strct: Type, field: usize) -> Option<(u32, Type)> {
        match self.kind(strct) {
            TypeKind::Struct { fields, .. } => {
                let mut offset = 0u32;
                for (i, &f) in fields.iter().enumerate() {
                    offset = align_up(offset, self.align_of(f));
                    if i == field {
                        return Some((offset, f));
                    }
                    offset += self.size_of(f);
                }
                None
            }
            _ => None,
        }
    }

    /// Walks the index sequence of a GEP: the first index scales by the
    /// pointee size; struct indices add the field offset; array indices
    /// scale by element size. Returns the cumulative byte offset and the
    /// residual type (the pointee of the resulting pointer).
    pub fn pointer_offset(&self, ptr: Type, indices: &[i32]) -> VeldResult<(i32, Type)> {
        let mut current = self
            .pointee(ptr)
            .ok_or_else(|| VeldError::ir_error("GEP base is not a pointer"))?;
        let mut offset: i64 = indices[0] as i64 * self.size_of(current) as i64;

        for &idx in &indices[1..] {
            match self.kind(current) {
                TypeKind::Struct { fields, .. } => {
                    let (field_offset, field_ty) =
                        self.field_offset(current, idx as usize).ok_or_else(|| {
                            VeldError::ir_error(format!(
                                "GEP struct index {idx} out of range ({} fields)",
                                fields.len()
                            ))
                        })?;
                    offset += field_offset as i64;
                    current = field_ty;
                }
                TypeKind::Array(elem, _) => {
                    offset += idx as i64 * self.size_of(*elem) as i64;
                    current = *elem;
                }
                TypeKind::Pointer(_) => {
                    return Err(VeldError::ir_error(
                        "GEP cannot walk through a nested pointer",
                    ));
                }
                _ => {
                    return Err(VeldError::ir_error(format!(
                        "GEP index {idx} into non-composite type"
                    )));
                }
            }
        }

        let offset = i32::try_from(offset)
            .map_err(|_| VeldError::ir_error("GEP offset exceeds 32 bits"))?;
        Ok((offset, current))
    }

    /// Field types of a struct, for constant layout.
    pub fn struct_fields(&self, t: Type) -> Option<SmallVec<[Type; 8]>> {
        match self.kind(t) {
            TypeKind::Struct { fields, .. } => Some(fields.iter().copied().collect()),
            _ => None,
        }
    }
}

pub fn align_up(offset: u32, align: u32) -> u32 {
    (offset + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_composites() {
        let mut tm = TypeManager::new();
        let p1 = tm.pointer(tm.i32_type());
        let p2 = tm.pointer(tm.i32_type());
        assert_eq!(p1, p2);

        let a1 = tm.array(tm.i64_type(), 4);
        let a2 = tm.array(tm.i64_type(), 4);
        let a3 = tm.array(tm.i64_type(), 8);
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);

        let s1 = tm.struct_type(&[tm.i32_type(), tm.i64_type()], None).unwrap();
        let s2 = tm.struct_type(&[tm.i32_type(), tm.i64_type()], None).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_named_struct_redefinition() {
        let mut tm = TypeManager::new();
        let fwd = tm.opaque("row");
        let defined = tm.struct_type(&[tm.i32_type()], Some("row")).unwrap();
        assert_eq!(fwd, defined);
        assert!(tm.struct_type(&[tm.i64_type()], Some("row")).is_err());
        assert_eq!(tm.get_named("row"), Some(defined));
    }

    #[test]
    fn test_struct_layout_natural_alignment() {
        let mut tm = TypeManager::new();
        let s = tm
            .struct_type(&[tm.i8_type(), tm.i32_type(), tm.i8_type(), tm.i64_type()], None)
            .unwrap();
        // i8 @0, i32 @4, i8 @8, i64 @16 -> size 24, align 8
        assert_eq!(tm.field_offset(s, 0), Some((0, tm.i8_type())));
        assert_eq!(tm.field_offset(s, 1), Some((4, tm.i32_type())));
        assert_eq!(tm.field_offset(s, 2), Some((8, tm.i8_type())));
        assert_eq!(tm.field_offset(s, 3), Some((16, tm.i64_type())));
        assert_eq!(tm.size_of(s), 24);
        assert_eq!(tm.align_of(s), 8);
    }

    #[test]
    fn test_pointer_offset_walk() {
        let mut tm = TypeManager::new();
        let inner = tm.struct_type(&[tm.i32_type(), tm.i32_type()], None).unwrap();
        let outer = tm.struct_type(&[tm.i64_type(), inner], None).unwrap();
        let ptr = tm.pointer(outer);

        // outer[1].field1.field1
        let (offset, residual) = tm.pointer_offset(ptr, &[1, 1, 1]).unwrap();
        assert_eq!(offset, 16 + 8 + 4);
        assert_eq!(residual, tm.i32_type());

        let arr = tm.array(tm.i32_type(), 10);
        let parr = tm.pointer(arr);
        let (offset, residual) = tm.pointer_offset(parr, &[0, 3]).unwrap();
        assert_eq!(offset, 12);
        assert_eq!(residual, tm.i32_type());
    }
}
