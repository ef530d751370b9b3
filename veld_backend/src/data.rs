//! Data section layout
//!
//! Char-array constants, the f64 pool, vector constants, the permute lookup
//! table for masked compression, and mutable globals (with their initial
//! values serialized) all live in one writable buffer. Pointers into the
//! buffer and into code cannot be resolved until the buffers have final
//! addresses, so they are recorded as relocations.

use veld_common::{VeldError, VeldResult};
use veld_ir::instruction::{opcode_of, Type1, Type3};
use veld_ir::types::{align_up, TypeKind};
use veld_ir::value::Value;
use veld_ir::{ConstantOpcode, Program};

/// A pointer-sized cell in the data section that needs patching once final
/// base addresses exist.
#[derive(Debug, Clone, Copy)]
pub enum DataReloc {
    /// `data[offset] = data_base + target`
    DataPtr { offset: usize, target: usize },
    /// `data[offset] = code_base + offset_of(func)`
    FuncPtr { offset: usize, func: usize },
}

pub struct DataSection {
    pub bytes: Vec<u8>,
    pub relocs: Vec<DataReloc>,
    pub char_array_offsets: Vec<usize>,
    pub f64_offsets: Vec<usize>,
    pub vec4_offsets: Vec<usize>,
    pub vec8_offsets: Vec<usize>,
    pub global_offsets: Vec<usize>,
    /// 256 x 8 i32 lane-index table for `vpermd`-based compression.
    pub permute_lut_offset: usize,
}

fn reserve(bytes: &mut Vec<u8>, size: usize, align: usize) -> usize {
    let offset = align_up(bytes.len() as u32, align as u32) as usize;
    bytes.resize(offset + size, 0);
    offset
}

pub fn build_data_section(program: &Program) -> VeldResult<DataSection> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut relocs = Vec::new();

    // Char arrays, NUL-terminated.
    let mut char_array_offsets = Vec::with_capacity(program.char_array_constants.len());
    for s in &program.char_array_constants {
        let offset = reserve(&mut bytes, s.len() + 1, 1);
        bytes[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        char_array_offsets.push(offset);
    }

    let mut f64_offsets = Vec::with_capacity(program.f64_constants.len());
    for &v in &program.f64_constants {
        let offset = reserve(&mut bytes, 8, 8);
        bytes[offset..offset + 8].copy_from_slice(&v.to_bits().to_le_bytes());
        f64_offsets.push(offset);
    }

    let mut vec4_offsets = Vec::with_capacity(program.vec4_constants.len());
    for v in &program.vec4_constants {
        let offset = reserve(&mut bytes, 16, 16);
        for (i, lane) in v.iter().enumerate() {
            bytes[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
        }
        vec4_offsets.push(offset);
    }

    let mut vec8_offsets = Vec::with_capacity(program.vec8_constants.len());
    for v in &program.vec8_constants {
        let offset = reserve(&mut bytes, 32, 32);
        for (i, lane) in v.iter().enumerate() {
            bytes[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
        }
        vec8_offsets.push(offset);
    }

    // For each 8-bit mask, the lane indices of the set bits front-packed.
    let permute_lut_offset = reserve(&mut bytes, 256 * 32, 32);
    for mask in 0..256usize {
        let mut lanes = [0i32; 8];
        let mut out = 0;
        for lane in 0..8 {
            if mask & (1 << lane) != 0 {
                lanes[out] = lane as i32;
                out += 1;
            }
        }
        let base = permute_lut_offset + mask * 32;
        for (i, lane) in lanes.iter().enumerate() {
            bytes[base + i * 4..base + i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
        }
    }

    // Globals, with their initializers serialized in place.
    let mut global_offsets = Vec::with_capacity(program.globals.len());
    let tm = &program.type_manager;
    for global in &program.globals {
        let size = tm.size_of(global.ty) as usize;
        let align = tm.align_of(global.ty) as usize;
        let offset = reserve(&mut bytes, size.max(1), align.max(1));
        global_offsets.push(offset);
    }
    // A second pass writes initializers so globals can point at each other.
    for (idx, global) in program.globals.iter().enumerate() {
        write_constant(
            program,
            global.init,
            global.ty,
            global_offsets[idx],
            &mut bytes,
            &mut relocs,
            &char_array_offsets,
            &global_offsets,
        )?;
    }

    Ok(DataSection {
        bytes,
        relocs,
        char_array_offsets,
        f64_offsets,
        vec4_offsets,
        vec8_offsets,
        global_offsets,
        permute_lut_offset,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_constant(
    program: &Program,
    value: Value,
    ty: veld_ir::Type,
    offset: usize,
    bytes: &mut Vec<u8>,
    relocs: &mut Vec<DataReloc>,
    char_array_offsets: &[usize],
    global_offsets: &[usize],
) -> VeldResult<()> {
    if !value.is_constant_global() {
        return Err(VeldError::codegen_error(
            "global initializer must be a constant",
        ));
    }
    let instr = program.constant_instrs[value.idx()];
    let opcode = ConstantOpcode::from_u8(opcode_of(instr));
    let tm = &program.type_manager;

    match opcode {
        ConstantOpcode::I1Const | ConstantOpcode::I8Const => {
            bytes[offset] = Type1(instr).constant() as u8;
        }
        ConstantOpcode::I16Const => {
            let v = Type1(instr).constant() as u16;
            bytes[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        }
        ConstantOpcode::I32Const => {
            let v = Type1(instr).constant() as u32;
            bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
        ConstantOpcode::I64Const => {
            let v = program.i64_constants[Type1(instr).constant() as usize];
            bytes[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
        }
        ConstantOpcode::F64Const => {
            let v = program.f64_constants[Type1(instr).constant() as usize];
            bytes[offset..offset + 8].copy_from_slice(&v.to_bits().to_le_bytes());
        }
        ConstantOpcode::I32ConstVec4 => {
            let v = program.vec4_constants[Type1(instr).constant() as usize];
            for (i, lane) in v.iter().enumerate() {
                bytes[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
            }
        }
        ConstantOpcode::I32ConstVec8 => {
            let v = program.vec8_constants[Type1(instr).constant() as usize];
            for (i, lane) in v.iter().enumerate() {
                bytes[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&lane.to_le_bytes());
            }
        }
        ConstantOpcode::Nullptr => {
            bytes[offset..offset + 8].fill(0);
        }
        ConstantOpcode::PtrConst => {
            let addr = program.ptr_constants[Type3(instr).arg() as usize];
            bytes[offset..offset + 8].copy_from_slice(&(addr as u64).to_le_bytes());
        }
        ConstantOpcode::GlobalCharArrayConst => {
            relocs.push(DataReloc::DataPtr {
                offset,
                target: char_array_offsets[Type1(instr).constant() as usize],
            });
        }
        ConstantOpcode::GlobalRef => {
            relocs.push(DataReloc::DataPtr {
                offset,
                target: global_offsets[Type1(instr).constant() as usize],
            });
        }
        ConstantOpcode::FuncPtr => {
            let func = Type1(instr).constant() as usize;
            if program.functions[func].external {
                let addr = program.functions[func].addr as u64;
                bytes[offset..offset + 8].copy_from_slice(&addr.to_le_bytes());
            } else {
                relocs.push(DataReloc::FuncPtr { offset, func });
            }
        }
        ConstantOpcode::PtrCast => {
            let inner = Value::from_serialized(Type3(instr).arg());
            write_constant(
                program,
                inner,
                ty,
                offset,
                bytes,
                relocs,
                char_array_offsets,
                global_offsets,
            )?;
        }
        ConstantOpcode::StructConst => {
            let sc = &program.struct_constants[Type1(instr).constant() as usize];
            for (i, &field) in sc.fields.iter().enumerate() {
                let (field_offset, field_ty) = tm
                    .field_offset(sc.ty, i)
                    .ok_or_else(|| VeldError::codegen_error("struct constant field mismatch"))?;
                write_constant(
                    program,
                    field,
                    field_ty,
                    offset + field_offset as usize,
                    bytes,
                    relocs,
                    char_array_offsets,
                    global_offsets,
                )?;
            }
        }
        ConstantOpcode::ArrayConst => {
            let ac = &program.array_constants[Type1(instr).constant() as usize];
            let elem_ty = match tm.kind(ac.ty) {
                TypeKind::Array(elem, _) => *elem,
                _ => return Err(VeldError::codegen_error("array constant of non-array type")),
            };
            let stride = tm.size_of(elem_ty) as usize;
            for (i, &elem) in ac.elements.iter().enumerate() {
                write_constant(
                    program,
                    elem,
                    elem_ty,
                    offset + i * stride,
                    bytes,
                    relocs,
                    char_array_offsets,
                    global_offsets,
                )?;
            }
        }
    }
    Ok(())
}
