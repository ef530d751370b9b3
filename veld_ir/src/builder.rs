//! Program and function builders
//!
//! The `ProgramBuilder` multiplexes function construction. Each internal
//! function owns a vector of 64-bit instruction words plus basic-block
//! descriptors; constants and globals are append-only program-wide pools,
//! interned by value for scalar primitives. `build()` consumes the builder
//! and yields the immutable `Program`.

use hashbrown::HashMap;
use smallvec::SmallVec;

use veld_common::{VeldError, VeldResult};

use crate::instruction::{opcode_of, Type1, Type2, Type3, Type5};
use crate::opcode::{ConstantOpcode, Opcode};
use crate::program::{
    ArrayConstant, BasicBlockData, Function, Global, Program, StructConstant,
};
use crate::types::{Type, TypeManager};
use crate::value::{CompType, FunctionRef, Value};

pub struct ProgramBuilder {
    pub(crate) type_manager: TypeManager,
    functions: Vec<Function>,
    current_func: usize,
    name_to_function: HashMap<String, FunctionRef>,

    constant_instrs: Vec<u64>,
    i64_constants: Vec<u64>,
    f64_constants: Vec<f64>,
    char_array_constants: Vec<String>,
    vec4_constants: Vec<[i32; 4]>,
    vec8_constants: Vec<[i32; 8]>,
    struct_constants: Vec<StructConstant>,
    array_constants: Vec<ArrayConstant>,
    ptr_constants: Vec<usize>,
    globals: Vec<Global>,

    // Scalar constants are interned by value.
    interned_i1: [Option<Value>; 2],
    interned_i8: HashMap<u8, Value>,
    interned_i16: HashMap<u16, Value>,
    interned_i32: HashMap<u32, Value>,
    interned_i64: HashMap<u64, Value>,
    interned_f64: HashMap<u64, Value>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            type_manager: TypeManager::new(),
            functions: Vec::new(),
            current_func: usize::MAX,
            name_to_function: HashMap::new(),
            constant_instrs: Vec::new(),
            i64_constants: Vec::new(),
            f64_constants: Vec::new(),
            char_array_constants: Vec::new(),
            vec4_constants: Vec::new(),
            vec8_constants: Vec::new(),
            struct_constants: Vec::new(),
            array_constants: Vec::new(),
            ptr_constants: Vec::new(),
            globals: Vec::new(),
            interned_i1: [None, None],
            interned_i8: HashMap::new(),
            interned_i16: HashMap::new(),
            interned_i32: HashMap::new(),
            interned_i64: HashMap::new(),
            interned_f64: HashMap::new(),
        }
    }

    // ---- types (delegated to the type manager) ----

    pub fn type_manager(&self) -> &TypeManager {
        &self.type_manager
    }

    pub fn void_type(&self) -> Type {
        self.type_manager.void_type()
    }
    pub fn i1_type(&self) -> Type {
        self.type_manager.i1_type()
    }
    pub fn i8_type(&self) -> Type {
        self.type_manager.i8_type()
    }
    pub fn i16_type(&self) -> Type {
        self.type_manager.i16_type()
    }
    pub fn i32_type(&self) -> Type {
        self.type_manager.i32_type()
    }
    pub fn i64_type(&self) -> Type {
        self.type_manager.i64_type()
    }
    pub fn f64_type(&self) -> Type {
        self.type_manager.f64_type()
    }
    pub fn i32_vec8_type(&self) -> Type {
        self.type_manager.i32_vec8_type()
    }
    pub fn i1_vec8_type(&self) -> Type {
        self.type_manager.i1_vec8_type()
    }

    pub fn pointer_type(&mut self, pointee: Type) -> Type {
        self.type_manager.pointer(pointee)
    }

    pub fn array_type(&mut self, elem: Type, len: u32) -> Type {
        self.type_manager.array(elem, len)
    }

    pub fn function_type(&mut self, ret: Type, args: &[Type]) -> Type {
        self.type_manager.function(ret, args)
    }

    pub fn struct_type(&mut self, fields: &[Type], name: Option<&str>) -> VeldResult<Type> {
        self.type_manager.struct_type(fields, name)
    }

    pub fn opaque_type(&mut self, name: &str) -> Type {
        self.type_manager.opaque(name)
    }

    // ---- functions ----

    fn add_function(&mut self, func: Function) -> FunctionRef {
        let r = FunctionRef(self.functions.len());
        self.name_to_function.insert(func.name.clone(), r);
        self.functions.push(func);
        r
    }

    pub fn create_function(&mut self, ret: Type, args: &[Type]) -> VeldResult<FunctionRef> {
        let name = format!("_func{}", self.functions.len());
        self.create_function_named(ret, args, &name, false)
    }

    pub fn create_public_function(
        &mut self,
        ret: Type,
        args: &[Type],
        name: &str,
    ) -> VeldResult<FunctionRef> {
        self.create_function_named(ret, args, name, true)
    }

    fn create_function_named(
        &mut self,
        ret: Type,
        args: &[Type],
        name: &str,
        public: bool,
    ) -> VeldResult<FunctionRef> {
        if self.name_to_function.contains_key(name) {
            return Err(VeldError::ir_error(format!("function '{name}' already exists")));
        }
        let ty = self.type_manager.function(ret, args);
        let mut func = Function::internal(name, ty, ret, args.to_vec(), public);

        // Entry block with one FUNC_ARG per parameter.
        func.blocks.push(BasicBlockData::default());
        let r = self.add_function(func);
        self.current_func = r.0;
        let arg_types = args.to_vec();
        for (i, arg_ty) in arg_types.into_iter().enumerate() {
            let v = self.append(Type3::build(Opcode::FuncArg.to_u8(), 0, arg_ty.0, i as u8))?;
            self.functions[r.0].arg_values.push(v);
        }
        Ok(r)
    }

    pub fn declare_external_function(
        &mut self,
        name: &str,
        ret: Type,
        args: &[Type],
        addr: usize,
    ) -> FunctionRef {
        if let Some(&r) = self.name_to_function.get(name) {
            return r;
        }
        let ty = self.type_manager.function(ret, args);
        self.add_function(Function::external(name, ty, ret, args.to_vec(), addr))
    }

    pub fn get_function(&self, name: &str) -> Option<FunctionRef> {
        self.name_to_function.get(name).copied()
    }

    pub fn get_function_arguments(&self, f: FunctionRef) -> Vec<Value> {
        self.functions[f.0].arg_values.clone()
    }

    pub fn get_function_pointer(&mut self, f: FunctionRef) -> Value {
        // Intern the pointer type so type_of can recover it immutably.
        let func_ty = self.functions[f.0].ty;
        self.type_manager.pointer(func_ty);
        self.append_constant(Type1::build(ConstantOpcode::FuncPtr.to_u8(), f.0 as u64))
    }

    /// Switch the insertion point to another (existing) function. The
    /// current block of the target function is preserved.
    pub fn set_current_function(&mut self, f: FunctionRef) {
        self.current_func = f.0;
    }

    pub fn current_function(&self) -> FunctionRef {
        FunctionRef(self.current_func)
    }

    fn func(&self) -> &Function {
        &self.functions[self.current_func]
    }

    fn func_mut(&mut self) -> &mut Function {
        &mut self.functions[self.current_func]
    }

    // ---- blocks ----

    pub fn create_block(&mut self) -> usize {
        let func = self.func_mut();
        func.blocks.push(BasicBlockData::default());
        func.blocks.len() - 1
    }

    pub fn current_block(&self) -> usize {
        self.func().current_block
    }

    pub fn is_terminated(&self, block: usize) -> bool {
        self.func().blocks[block].terminated
    }

    pub fn set_current_block(&mut self, block: usize) -> VeldResult<()> {
        let func = self.func();
        if !func.blocks[func.current_block].terminated {
            return Err(VeldError::ir_error(
                "cannot switch away from a non-terminated block",
            ));
        }
        if func.blocks[block].terminated {
            return Err(VeldError::ir_error("cannot re-enter a terminated block"));
        }
        self.func_mut().current_block = block;
        Ok(())
    }

    /// Appends one instruction word to the current block.
    pub fn append(&mut self, instr: u64) -> VeldResult<Value> {
        let opcode = Opcode::from_u8(opcode_of(instr));
        let current_func = self.current_func;
        let func = &mut self.functions[current_func];
        let block_id = func.current_block;
        if func.blocks[block_id].terminated {
            return Err(VeldError::ir_error("cannot append to a terminated block"));
        }

        let idx = func.instrs.len() as u32;
        func.instrs.push(instr);
        let block = &mut func.blocks[block_id];
        match block.segments.last_mut() {
            Some(seg) if seg.1 + 1 == idx => seg.1 = idx,
            _ => block.segments.push((idx, idx)),
        }

        if opcode.is_terminator() {
            block.terminated = true;
            match opcode {
                Opcode::Br => {
                    let target = Type5(instr).marg0();
                    func.add_edge(block_id, target);
                }
                Opcode::CondBr => {
                    let t5 = Type5(instr);
                    func.add_edge(block_id, t5.marg0());
                    func.add_edge(block_id, t5.marg1());
                }
                _ => {}
            }
        }

        Ok(Value::instr(idx))
    }

    fn append_constant(&mut self, instr: u64) -> Value {
        let idx = self.constant_instrs.len() as u32;
        self.constant_instrs.push(instr);
        Value::constant_global(idx)
    }

    pub fn branch(&mut self, block: usize) -> VeldResult<()> {
        self.append(Type5::build(Opcode::Br.to_u8(), 0, block as u32, 0))?;
        Ok(())
    }

    /// Constant conditions are deliberately not collapsed here; the
    /// simplification pass runs later.
    pub fn cond_branch(&mut self, cond: Value, b1: usize, b2: usize) -> VeldResult<()> {
        self.append(Type5::build(
            Opcode::CondBr.to_u8(),
            cond.serialize(),
            b1 as u32,
            b2 as u32,
        ))?;
        Ok(())
    }

    pub fn ret(&mut self) -> VeldResult<()> {
        self.append(Type1::build(Opcode::Return.to_u8(), 0))?;
        Ok(())
    }

    pub fn ret_value(&mut self, v: Value) -> VeldResult<()> {
        let ty = self.type_of(v);
        self.append(Type3::build(Opcode::ReturnValue.to_u8(), v.serialize(), ty.0, 0))?;
        Ok(())
    }

    // ---- phis ----

    pub fn phi(&mut self, ty: Type) -> VeldResult<Value> {
        self.append(Type3::build(Opcode::Phi.to_u8(), 0, ty.0, 0))
    }

    /// Emits a phi member carrying `v` in the current (predecessor) block;
    /// the phi it feeds is patched in later by `update_phi_member`.
    pub fn phi_member(&mut self, v: Value) -> VeldResult<Value> {
        let v = self.materialize_if_gep(v)?;
        self.append(Type2::build(
            Opcode::PhiMember.to_u8(),
            Value::NONE.serialize() & 0xFF_FFFF,
            v.serialize(),
        ))
    }

    /// Back-patches `member` to name the phi it feeds.
    pub fn update_phi_member(&mut self, phi: Value, member: Value) {
        let func = self.func_mut();
        let instr = func.instrs[member.idx()];
        func.instrs[member.idx()] = Type2(instr).with_arg0(phi.serialize());
    }

    // ---- memory ----

    pub fn alloca(&mut self, ty: Type, count: u32) -> VeldResult<Value> {
        let ptr_ty = self.pointer_type(ty);
        let count = self.const_i32(count as i32);
        self.append(Type3::build(
            Opcode::Alloca.to_u8(),
            count.serialize(),
            ptr_ty.0,
            0,
        ))
    }

    pub fn nullptr(&mut self, ty: Type) -> Value {
        let ptr_ty = self.pointer_type(ty);
        self.append_constant(Type3::build(ConstantOpcode::Nullptr.to_u8(), 0, ptr_ty.0, 0))
    }

    /// A pointer cast of a constant yields a constant.
    pub fn ptr_cast(&mut self, v: Value, ty: Type) -> VeldResult<Value> {
        if v.is_constant_global() {
            return Ok(self.append_constant(Type3::build(
                ConstantOpcode::PtrCast.to_u8(),
                v.serialize(),
                ty.0,
                0,
            )));
        }
        let v = self.materialize_if_gep(v)?;
        self.append(Type3::build(Opcode::PtrCast.to_u8(), v.serialize(), ty.0, 0))
    }

    /// An opaque host pointer baked into the program as a constant.
    pub fn ptr_const(&mut self, addr: usize, ty: Type) -> Value {
        let idx = self.ptr_constants.len() as u32;
        self.ptr_constants.push(addr);
        self.append_constant(Type3::build(ConstantOpcode::PtrConst.to_u8(), idx, ty.0, 0))
    }

    pub fn ptr_cmp_nullptr(&mut self, v: Value) -> VeldResult<Value> {
        let v = self.materialize_if_gep(v)?;
        self.append(Type2::build(Opcode::PtrCmpNullptr.to_u8(), v.serialize(), 0))
    }

    /// Forces a lazy GEP into a real pointer value. Identity on anything
    /// that is not a GEP.
    pub fn materialize_if_gep(&mut self, v: Value) -> VeldResult<Value> {
        if !self.is_gep(v) {
            return Ok(v);
        }
        let ty = self.type_of(v);
        self.append(Type3::build(
            Opcode::PtrMaterialize.to_u8(),
            v.serialize(),
            ty.0,
            0,
        ))
    }

    fn is_gep(&self, v: Value) -> bool {
        if v.is_constant_global() || v.is_none() {
            return false;
        }
        let opcode = Opcode::from_u8(opcode_of(self.func().instrs[v.idx()]));
        matches!(opcode, Opcode::GepStatic | Opcode::GepDynamic)
    }

    // ---- loads / stores ----

    fn load(&mut self, opcode: Opcode, ptr: Value) -> VeldResult<Value> {
        self.append(Type2::build(opcode.to_u8(), ptr.serialize(), 0))
    }

    fn store(&mut self, opcode: Opcode, ptr: Value, v: Value) -> VeldResult<()> {
        self.append(Type2::build(opcode.to_u8(), ptr.serialize(), v.serialize()))?;
        Ok(())
    }

    pub fn load_i1(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I1Load, ptr)
    }
    pub fn load_i8(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I8Load, ptr)
    }
    pub fn load_i16(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I16Load, ptr)
    }
    pub fn load_i32(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I32Load, ptr)
    }
    pub fn load_i64(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I64Load, ptr)
    }
    pub fn load_f64(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::F64Load, ptr)
    }

    pub fn load_ptr(&mut self, ptr: Value) -> VeldResult<Value> {
        let pointee = self
            .type_manager
            .pointee(self.type_of(ptr))
            .ok_or_else(|| VeldError::ir_error("load_ptr of non-pointer"))?;
        self.append(Type3::build(Opcode::PtrLoad.to_u8(), ptr.serialize(), pointee.0, 0))
    }

    pub fn store_i8(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::I8Store, ptr, v)
    }
    pub fn store_i16(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::I16Store, ptr, v)
    }
    pub fn store_i32(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::I32Store, ptr, v)
    }
    pub fn store_i64(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::I64Store, ptr, v)
    }
    pub fn store_f64(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::F64Store, ptr, v)
    }

    /// At most one lazy pointer operand per instruction: the address may be
    /// a pending GEP, the stored value may not.
    pub fn store_ptr(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        let v = self.materialize_if_gep(v)?;
        self.store(Opcode::PtrStore, ptr, v)
    }

    // ---- GEP ----

    /// Emits the paired `GEP_STATIC_OFFSET` / `GEP_STATIC`; the returned
    /// value names the second word. The GEP stays lazy until a consumer or
    /// the materialization pass forces it.
    pub fn const_gep(&mut self, base: Value, indices: &[i32]) -> VeldResult<Value> {
        let base_ty = self.type_of(base);
        let (offset, residual) = self.type_manager.pointer_offset(base_ty, indices)?;
        let result_ty = self.pointer_type(residual);
        let offset_const = self.const_i32(offset);

        // A GEP feeding a GEP must be materialized first.
        let base = self.materialize_if_gep(base)?;
        self.append(Type2::build(
            Opcode::GepStaticOffset.to_u8(),
            base.serialize(),
            offset_const.serialize(),
        ))?;
        self.append(Type3::build(Opcode::GepStatic.to_u8(), 0, result_ty.0, 0))
    }

    /// `base + index * sizeof(elem) + constant offset of `indices``.
    /// Non-power-of-two element sizes are lowered through an explicit
    /// multiply so the backend only sees hardware-scalable GEPs.
    pub fn dynamic_gep(&mut self, base: Value, index: Value, indices: &[i32]) -> VeldResult<Value> {
        let base_ty = self.type_of(base);
        let elem_ty = self
            .type_manager
            .pointee(base_ty)
            .ok_or_else(|| VeldError::ir_error("dynamic GEP base is not a pointer"))?;
        let elem_size = self.type_manager.size_of(elem_ty);

        let mut walk = vec![0];
        walk.extend_from_slice(indices);
        let (offset, residual) = self.type_manager.pointer_offset(base_ty, &walk)?;
        let result_ty = self.pointer_type(residual);
        let offset_const = self.const_i32(offset);

        let (index, scale) = if matches!(elem_size, 1 | 2 | 4 | 8) {
            (index, elem_size as u8)
        } else {
            let wide = self.i64_zext_i32(index)?;
            let size = self.const_i64(elem_size as i64);
            (self.mul_i64(wide, size)?, 1u8)
        };

        let base = self.materialize_if_gep(base)?;
        self.append(Type2::build(
            Opcode::GepDynamicOffset.to_u8(),
            index.serialize(),
            offset_const.serialize(),
        ))?;
        self.append(Type3::build(
            Opcode::GepDynamic.to_u8(),
            base.serialize(),
            result_ty.0,
            scale,
        ))
    }

    // ---- calls ----

    /// Arguments are emitted as a `CALL_ARG` run immediately preceding the
    /// call; the backend relies on this exact sequence.
    pub fn call(&mut self, f: FunctionRef, args: &[Value]) -> VeldResult<Value> {
        self.emit_call_args(args)?;
        self.append(Type1::build(Opcode::Call.to_u8(), f.0 as u64))
    }

    pub fn call_indirect(
        &mut self,
        func_ptr: Value,
        func_ty: Type,
        args: &[Value],
    ) -> VeldResult<Value> {
        self.emit_call_args(args)?;
        let func_ptr = self.materialize_if_gep(func_ptr)?;
        self.append(Type3::build(
            Opcode::CallIndirect.to_u8(),
            func_ptr.serialize(),
            func_ty.0,
            0,
        ))
    }

    fn emit_call_args(&mut self, args: &[Value]) -> VeldResult<()> {
        // Materialize first so the CALL_ARG run stays contiguous; the
        // backend recognises the exact sequence.
        let mut materialized = Vec::with_capacity(args.len());
        for &a in args {
            materialized.push(self.materialize_if_gep(a)?);
        }
        for (i, a) in materialized.into_iter().enumerate() {
            let ty = self.type_of(a);
            self.append(Type3::build(Opcode::CallArg.to_u8(), a.serialize(), ty.0, i as u8))?;
        }
        Ok(())
    }

    // ---- scalar constants ----

    pub fn const_i1(&mut self, v: bool) -> Value {
        if let Some(c) = self.interned_i1[v as usize] {
            return c;
        }
        let c = self.append_constant(Type1::build(ConstantOpcode::I1Const.to_u8(), v as u64));
        self.interned_i1[v as usize] = Some(c);
        c
    }

    pub fn const_i8(&mut self, v: i8) -> Value {
        if let Some(&c) = self.interned_i8.get(&(v as u8)) {
            return c;
        }
        let c = self.append_constant(Type1::build(ConstantOpcode::I8Const.to_u8(), v as u8 as u64));
        self.interned_i8.insert(v as u8, c);
        c
    }

    pub fn const_i16(&mut self, v: i16) -> Value {
        if let Some(&c) = self.interned_i16.get(&(v as u16)) {
            return c;
        }
        let c =
            self.append_constant(Type1::build(ConstantOpcode::I16Const.to_u8(), v as u16 as u64));
        self.interned_i16.insert(v as u16, c);
        c
    }

    pub fn const_i32(&mut self, v: i32) -> Value {
        if let Some(&c) = self.interned_i32.get(&(v as u32)) {
            return c;
        }
        let c =
            self.append_constant(Type1::build(ConstantOpcode::I32Const.to_u8(), v as u32 as u64));
        self.interned_i32.insert(v as u32, c);
        c
    }

    pub fn const_i64(&mut self, v: i64) -> Value {
        if let Some(&c) = self.interned_i64.get(&(v as u64)) {
            return c;
        }
        let idx = self.i64_constants.len() as u64;
        self.i64_constants.push(v as u64);
        let c = self.append_constant(Type1::build(ConstantOpcode::I64Const.to_u8(), idx));
        self.interned_i64.insert(v as u64, c);
        c
    }

    pub fn const_f64(&mut self, v: f64) -> Value {
        let bits = v.to_bits();
        if let Some(&c) = self.interned_f64.get(&bits) {
            return c;
        }
        let idx = self.f64_constants.len() as u64;
        self.f64_constants.push(v);
        let c = self.append_constant(Type1::build(ConstantOpcode::F64Const.to_u8(), idx));
        self.interned_f64.insert(bits, c);
        c
    }

    pub fn const_i32_vec4(&mut self, v: [i32; 4]) -> Value {
        let idx = self.vec4_constants.len() as u64;
        self.vec4_constants.push(v);
        self.append_constant(Type1::build(ConstantOpcode::I32ConstVec4.to_u8(), idx))
    }

    pub fn const_i32_vec8(&mut self, v: [i32; 8]) -> Value {
        let idx = self.vec8_constants.len() as u64;
        self.vec8_constants.push(v);
        self.append_constant(Type1::build(ConstantOpcode::I32ConstVec8.to_u8(), idx))
    }

    /// A NUL-terminated char-array global; the value is an `i8*`.
    pub fn global_const_char_array(&mut self, s: &str) -> Value {
        let i8_ty = self.i8_type();
        self.type_manager.pointer(i8_ty);
        let idx = self.char_array_constants.len() as u64;
        self.char_array_constants.push(s.to_string());
        self.append_constant(Type1::build(
            ConstantOpcode::GlobalCharArrayConst.to_u8(),
            idx,
        ))
    }

    pub fn constant_struct(&mut self, ty: Type, fields: &[Value]) -> Value {
        let idx = self.struct_constants.len() as u64;
        self.struct_constants.push(StructConstant { ty, fields: fields.to_vec() });
        self.append_constant(Type1::build(ConstantOpcode::StructConst.to_u8(), idx))
    }

    pub fn constant_array(&mut self, ty: Type, elements: &[Value]) -> Value {
        let idx = self.array_constants.len() as u64;
        self.array_constants.push(ArrayConstant { ty, elements: elements.to_vec() });
        self.append_constant(Type1::build(ConstantOpcode::ArrayConst.to_u8(), idx))
    }

    /// A mutable global with an initializer; the value is a pointer to it.
    pub fn global(&mut self, ty: Type, init: Value) -> Value {
        self.type_manager.pointer(ty);
        let idx = self.globals.len() as u64;
        self.globals.push(Global { ty, init });
        self.append_constant(Type1::build(ConstantOpcode::GlobalRef.to_u8(), idx))
    }

    // ---- constant inspection ----

    fn constant_instr(&self, v: Value) -> u64 {
        self.constant_instrs[v.idx()]
    }

    pub fn get_i1_constant(&self, v: Value) -> Option<bool> {
        if !v.is_constant_global() {
            return None;
        }
        let instr = self.constant_instr(v);
        match ConstantOpcode::from_u8(opcode_of(instr)) {
            ConstantOpcode::I1Const => Some(Type1(instr).constant() != 0),
            _ => None,
        }
    }

    /// Integer constants of any width, sign-extended to i64.
    pub fn get_int_constant(&self, v: Value) -> Option<i64> {
        if !v.is_constant_global() {
            return None;
        }
        let instr = self.constant_instr(v);
        let payload = Type1(instr).constant();
        match ConstantOpcode::from_u8(opcode_of(instr)) {
            ConstantOpcode::I1Const => Some((payload != 0) as i64),
            ConstantOpcode::I8Const => Some(payload as u8 as i8 as i64),
            ConstantOpcode::I16Const => Some(payload as u16 as i16 as i64),
            ConstantOpcode::I32Const => Some(payload as u32 as i32 as i64),
            ConstantOpcode::I64Const => Some(self.i64_constants[payload as usize] as i64),
            _ => None,
        }
    }

    pub fn get_f64_constant(&self, v: Value) -> Option<f64> {
        if !v.is_constant_global() {
            return None;
        }
        let instr = self.constant_instr(v);
        match ConstantOpcode::from_u8(opcode_of(instr)) {
            ConstantOpcode::F64Const => Some(self.f64_constants[Type1(instr).constant() as usize]),
            _ => None,
        }
    }

    // ---- integer arithmetic ----

    fn binary(
        &mut self,
        opcode: Opcode,
        v1: Value,
        v2: Value,
        fold: impl Fn(i64, i64) -> i64,
        make_const: impl Fn(&mut Self, i64) -> Value,
    ) -> VeldResult<Value> {
        if let (Some(a), Some(b)) = (self.get_int_constant(v1), self.get_int_constant(v2)) {
            return Ok(make_const(self, fold(a, b)));
        }
        self.append(Type2::build(opcode.to_u8(), v1.serialize(), v2.serialize()))
    }

    fn int_cmp(
        &mut self,
        eq_opcode: Opcode,
        cmp: CompType,
        v1: Value,
        v2: Value,
    ) -> VeldResult<Value> {
        if let (Some(a), Some(b)) = (self.get_int_constant(v1), self.get_int_constant(v2)) {
            return Ok(self.const_i1(cmp.evaluate(a, b)));
        }
        // Canonicalize constant-first comparisons to constant-second.
        let (cmp, v1, v2) = if v1.is_constant_global() && !v2.is_constant_global() {
            (cmp.flip(), v2, v1)
        } else {
            (cmp, v1, v2)
        };
        let opcode = Opcode::from_u8(eq_opcode.to_u8() + cmp_offset(cmp));
        self.append(Type2::build(opcode.to_u8(), v1.serialize(), v2.serialize()))
    }

    pub fn add_i8(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I8Add, a, b, |x, y| (x as i8).wrapping_add(y as i8) as i64, |s, v| s.const_i8(v as i8))
    }
    pub fn sub_i8(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I8Sub, a, b, |x, y| (x as i8).wrapping_sub(y as i8) as i64, |s, v| s.const_i8(v as i8))
    }
    pub fn mul_i8(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I8Mul, a, b, |x, y| (x as i8).wrapping_mul(y as i8) as i64, |s, v| s.const_i8(v as i8))
    }
    pub fn cmp_i8(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        self.int_cmp(Opcode::I8CmpEq, cmp, a, b)
    }

    pub fn add_i16(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I16Add, a, b, |x, y| (x as i16).wrapping_add(y as i16) as i64, |s, v| s.const_i16(v as i16))
    }
    pub fn sub_i16(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I16Sub, a, b, |x, y| (x as i16).wrapping_sub(y as i16) as i64, |s, v| s.const_i16(v as i16))
    }
    pub fn mul_i16(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I16Mul, a, b, |x, y| (x as i16).wrapping_mul(y as i16) as i64, |s, v| s.const_i16(v as i16))
    }
    pub fn cmp_i16(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        self.int_cmp(Opcode::I16CmpEq, cmp, a, b)
    }

    pub fn add_i32(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I32Add, a, b, |x, y| (x as i32).wrapping_add(y as i32) as i64, |s, v| s.const_i32(v as i32))
    }
    pub fn sub_i32(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I32Sub, a, b, |x, y| (x as i32).wrapping_sub(y as i32) as i64, |s, v| s.const_i32(v as i32))
    }
    pub fn mul_i32(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I32Mul, a, b, |x, y| (x as i32).wrapping_mul(y as i32) as i64, |s, v| s.const_i32(v as i32))
    }
    pub fn cmp_i32(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        self.int_cmp(Opcode::I32CmpEq, cmp, a, b)
    }

    pub fn add_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64Add, a, b, |x, y| x.wrapping_add(y), |s, v| s.const_i64(v))
    }
    pub fn sub_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64Sub, a, b, |x, y| x.wrapping_sub(y), |s, v| s.const_i64(v))
    }
    pub fn mul_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64Mul, a, b, |x, y| x.wrapping_mul(y), |s, v| s.const_i64(v))
    }
    pub fn lshift_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64LShift, a, b, |x, y| ((x as u64) << (y & 63)) as i64, |s, v| s.const_i64(v))
    }
    pub fn rshift_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64RShift, a, b, |x, y| ((x as u64) >> (y & 63)) as i64, |s, v| s.const_i64(v))
    }
    pub fn and_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64And, a, b, |x, y| x & y, |s, v| s.const_i64(v))
    }
    pub fn or_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64Or, a, b, |x, y| x | y, |s, v| s.const_i64(v))
    }
    pub fn xor_i64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.binary(Opcode::I64Xor, a, b, |x, y| x ^ y, |s, v| s.const_i64(v))
    }
    pub fn cmp_i64(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        self.int_cmp(Opcode::I64CmpEq, cmp, a, b)
    }
    pub fn popcount_i64(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(a) = self.get_int_constant(v) {
            return Ok(self.const_i64(a.count_ones() as i64));
        }
        self.append(Type2::build(Opcode::I64Popcount.to_u8(), v.serialize(), 0))
    }

    // ---- floating point ----

    fn f64_binary(
        &mut self,
        opcode: Opcode,
        v1: Value,
        v2: Value,
        fold: impl Fn(f64, f64) -> f64,
    ) -> VeldResult<Value> {
        if let (Some(a), Some(b)) = (self.get_f64_constant(v1), self.get_f64_constant(v2)) {
            return Ok(self.const_f64(fold(a, b)));
        }
        self.append(Type2::build(opcode.to_u8(), v1.serialize(), v2.serialize()))
    }

    pub fn add_f64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.f64_binary(Opcode::F64Add, a, b, |x, y| x + y)
    }
    pub fn sub_f64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.f64_binary(Opcode::F64Sub, a, b, |x, y| x - y)
    }
    pub fn mul_f64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.f64_binary(Opcode::F64Mul, a, b, |x, y| x * y)
    }
    pub fn div_f64(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.f64_binary(Opcode::F64Div, a, b, |x, y| x / y)
    }

    pub fn cmp_f64(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        if let (Some(x), Some(y)) = (self.get_f64_constant(a), self.get_f64_constant(b)) {
            return Ok(self.const_i1(cmp.evaluate(x, y)));
        }
        let (cmp, a, b) = if a.is_constant_global() && !b.is_constant_global() {
            (cmp.flip(), b, a)
        } else {
            (cmp, a, b)
        };
        let opcode = Opcode::from_u8(Opcode::F64CmpEq.to_u8() + cmp_offset(cmp));
        self.append(Type2::build(opcode.to_u8(), a.serialize(), b.serialize()))
    }

    // ---- i1 logic ----

    pub fn lnot_i1(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(b) = self.get_i1_constant(v) {
            return Ok(self.const_i1(!b));
        }
        self.append(Type2::build(Opcode::I1LNot.to_u8(), v.serialize(), 0))
    }

    pub fn and_i1(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        if let (Some(x), Some(y)) = (self.get_i1_constant(a), self.get_i1_constant(b)) {
            return Ok(self.const_i1(x && y));
        }
        self.append(Type2::build(Opcode::I1And.to_u8(), a.serialize(), b.serialize()))
    }

    pub fn or_i1(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        if let (Some(x), Some(y)) = (self.get_i1_constant(a), self.get_i1_constant(b)) {
            return Ok(self.const_i1(x || y));
        }
        self.append(Type2::build(Opcode::I1Or.to_u8(), a.serialize(), b.serialize()))
    }

    pub fn cmp_i1(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        debug_assert!(matches!(cmp, CompType::Eq | CompType::Ne));
        if let (Some(x), Some(y)) = (self.get_i1_constant(a), self.get_i1_constant(b)) {
            return Ok(self.const_i1(cmp.evaluate(x, y)));
        }
        let opcode = if cmp == CompType::Eq { Opcode::I1CmpEq } else { Opcode::I1CmpNe };
        self.append(Type2::build(opcode.to_u8(), a.serialize(), b.serialize()))
    }

    // ---- conversions ----

    fn unary(&mut self, opcode: Opcode, v: Value) -> VeldResult<Value> {
        self.append(Type2::build(opcode.to_u8(), v.serialize(), 0))
    }

    pub fn i8_zext_i1(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(b) = self.get_i1_constant(v) {
            return Ok(self.const_i8(b as i8));
        }
        self.unary(Opcode::I1ZextI8, v)
    }
    pub fn i64_zext_i1(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(b) = self.get_i1_constant(v) {
            return Ok(self.const_i64(b as i64));
        }
        self.unary(Opcode::I1ZextI64, v)
    }
    pub fn i64_zext_i8(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c as u8 as i64));
        }
        self.unary(Opcode::I8ZextI64, v)
    }
    pub fn i64_zext_i16(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c as u16 as i64));
        }
        self.unary(Opcode::I16ZextI64, v)
    }
    pub fn i64_zext_i32(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c as u32 as i64));
        }
        self.unary(Opcode::I32ZextI64, v)
    }
    pub fn i64_sext_i8(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c));
        }
        self.unary(Opcode::I8SextI64, v)
    }
    pub fn i64_sext_i16(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c));
        }
        self.unary(Opcode::I16SextI64, v)
    }
    pub fn i64_sext_i32(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i64(c));
        }
        self.unary(Opcode::I32SextI64, v)
    }
    pub fn i16_trunc_i64(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i16(c as i16));
        }
        self.unary(Opcode::I64TruncI16, v)
    }
    pub fn i32_trunc_i64(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_i32(c as i32));
        }
        self.unary(Opcode::I64TruncI32, v)
    }

    pub fn f64_conv_i8(&mut self, v: Value) -> VeldResult<Value> {
        self.conv_to_f64(Opcode::I8ConvF64, v)
    }
    pub fn f64_conv_i16(&mut self, v: Value) -> VeldResult<Value> {
        self.conv_to_f64(Opcode::I16ConvF64, v)
    }
    pub fn f64_conv_i32(&mut self, v: Value) -> VeldResult<Value> {
        self.conv_to_f64(Opcode::I32ConvF64, v)
    }
    pub fn f64_conv_i64(&mut self, v: Value) -> VeldResult<Value> {
        self.conv_to_f64(Opcode::I64ConvF64, v)
    }

    fn conv_to_f64(&mut self, opcode: Opcode, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_int_constant(v) {
            return Ok(self.const_f64(c as f64));
        }
        self.unary(opcode, v)
    }

    pub fn i64_conv_f64(&mut self, v: Value) -> VeldResult<Value> {
        if let Some(c) = self.get_f64_constant(v) {
            return Ok(self.const_i64(c as i64));
        }
        self.unary(Opcode::F64ConvI64, v)
    }

    // ---- SIMD ----

    pub fn vec8_load_i32(&mut self, ptr: Value) -> VeldResult<Value> {
        self.load(Opcode::I32Vec8Load, ptr)
    }
    pub fn vec8_store_i32(&mut self, ptr: Value, v: Value) -> VeldResult<()> {
        self.store(Opcode::I32Vec8Store, ptr, v)
    }
    pub fn vec8_broadcast_i32(&mut self, v: Value) -> VeldResult<Value> {
        self.unary(Opcode::I32Vec8Broadcast, v)
    }
    pub fn vec8_add_i32(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.append(Type2::build(Opcode::I32Vec8Add.to_u8(), a.serialize(), b.serialize()))
    }
    pub fn vec8_cmp_i32(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        let opcode = Opcode::from_u8(Opcode::I32Vec8CmpEq.to_u8() + cmp_offset(cmp));
        self.append(Type2::build(opcode.to_u8(), a.serialize(), b.serialize()))
    }
    pub fn vec8_and_i1(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.append(Type2::build(Opcode::I1Vec8And.to_u8(), a.serialize(), b.serialize()))
    }
    pub fn vec8_or_i1(&mut self, a: Value, b: Value) -> VeldResult<Value> {
        self.append(Type2::build(Opcode::I1Vec8Or.to_u8(), a.serialize(), b.serialize()))
    }
    /// Extracts the 8-lane mask into the low bits of an i64.
    pub fn vec8_mask_i1(&mut self, v: Value) -> VeldResult<Value> {
        self.unary(Opcode::I1Vec8Mask, v)
    }
    /// Front-packs the lanes of `v` selected by `mask` (an i64 lane mask).
    pub fn vec8_compress_i32(&mut self, v: Value, mask: Value) -> VeldResult<Value> {
        self.append(Type2::build(Opcode::I32Vec8Compress.to_u8(), v.serialize(), mask.serialize()))
    }
    /// Scalar `v` equal to any lane of the constant vector.
    pub fn i32_cmp_eq_any_vec8(&mut self, v: Value, const_vec: Value) -> VeldResult<Value> {
        self.append(Type2::build(
            Opcode::I32CmpEqAnyConstVec8.to_u8(),
            v.serialize(),
            const_vec.serialize(),
        ))
    }
    pub fn i32_cmp_eq_any_vec4(&mut self, v: Value, const_vec: Value) -> VeldResult<Value> {
        self.append(Type2::build(
            Opcode::I32CmpEqAnyConstVec4.to_u8(),
            v.serialize(),
            const_vec.serialize(),
        ))
    }

    // ---- type recovery ----

    /// Static type of a value. Stable: appending unrelated instructions
    /// never changes the answer.
    pub fn type_of(&self, v: Value) -> Type {
        if v.is_constant_global() {
            return self.type_of_constant(v);
        }
        let instr = self.func().instrs[v.idx()];
        self.type_of_instr(instr)
    }

    fn type_of_instr(&self, instr: u64) -> Type {
        use Opcode::*;
        let tm = &self.type_manager;
        let opcode = Opcode::from_u8(opcode_of(instr));
        match opcode {
            Return | Br | CondBr | I8Store | I16Store | I32Store | I64Store | F64Store
            | PtrStore | I32Vec8Store | ReturnValue => tm.void_type(),

            I1CmpEq | I1CmpNe | I1LNot | I1And | I1Or | I8CmpEq | I8CmpNe | I8CmpLt | I8CmpLe
            | I8CmpGt | I8CmpGe | I16CmpEq | I16CmpNe | I16CmpLt | I16CmpLe | I16CmpGt
            | I16CmpGe | I32CmpEq | I32CmpNe | I32CmpLt | I32CmpLe | I32CmpGt | I32CmpGe
            | I64CmpEq | I64CmpNe | I64CmpLt | I64CmpLe | I64CmpGt | I64CmpGe | F64CmpEq
            | F64CmpNe | F64CmpLt | F64CmpLe | F64CmpGt | F64CmpGe | PtrCmpNullptr | I1Load
            | I32CmpEqAnyConstVec4 | I32CmpEqAnyConstVec8 => tm.i1_type(),

            I8Add | I8Sub | I8Mul | I1ZextI8 | I8Load => tm.i8_type(),
            I16Add | I16Sub | I16Mul | I64TruncI16 | I16Load => tm.i16_type(),
            I32Add | I32Sub | I32Mul | I64TruncI32 | I32Load => tm.i32_type(),
            I64Add | I64Sub | I64Mul | I64LShift | I64RShift | I64And | I64Or | I64Xor
            | I1ZextI64 | I8ZextI64 | I16ZextI64 | I32ZextI64 | I8SextI64 | I16SextI64
            | I32SextI64 | F64ConvI64 | I64Load | I64Popcount | I1Vec8Mask => tm.i64_type(),
            F64Add | F64Sub | F64Mul | F64Div | I8ConvF64 | I16ConvF64 | I32ConvF64
            | I64ConvF64 | F64Load => tm.f64_type(),

            I32Vec8Load | I32Vec8Broadcast | I32Vec8Add | I32Vec8Compress => tm.i32_vec8_type(),
            I32Vec8CmpEq | I32Vec8CmpNe | I32Vec8CmpLt | I32Vec8CmpLe | I32Vec8CmpGt
            | I32Vec8CmpGe | I1Vec8And | I1Vec8Or => tm.i1_vec8_type(),

            Phi | Alloca | PtrCast | GepStatic | GepDynamic | PtrMaterialize | FuncArg => {
                Type(Type3(instr).type_id())
            }
            PtrLoad => Type(Type3(instr).type_id()),
            CallArg => Type(Type3(instr).type_id()),

            Call => {
                let func_id = Type1(instr).constant() as usize;
                self.functions[func_id].ret
            }
            CallIndirect => {
                let func_ty = Type(Type3(instr).type_id());
                match tm.function_signature(func_ty) {
                    Some((ret, _)) => ret,
                    None => tm.void_type(),
                }
            }

            PhiMember => tm.void_type(),

            GepStaticOffset | GepDynamicOffset => tm.void_type(),
        }
    }

    fn type_of_constant(&self, v: Value) -> Type {
        let tm = &self.type_manager;
        let instr = self.constant_instr(v);
        match ConstantOpcode::from_u8(opcode_of(instr)) {
            ConstantOpcode::I1Const => tm.i1_type(),
            ConstantOpcode::I8Const => tm.i8_type(),
            ConstantOpcode::I16Const => tm.i16_type(),
            ConstantOpcode::I32Const => tm.i32_type(),
            ConstantOpcode::I64Const => tm.i64_type(),
            ConstantOpcode::F64Const => tm.f64_type(),
            ConstantOpcode::I32ConstVec4 => tm.i32_vec4_type(),
            ConstantOpcode::I32ConstVec8 => tm.i32_vec8_type(),
            ConstantOpcode::GlobalCharArrayConst => {
                // i8*; interned when the char array was created.
                tm.find_pointer(tm.i8_type()).expect("char array pointer type")
            }
            ConstantOpcode::StructConst => {
                self.struct_constants[Type1(instr).constant() as usize].ty
            }
            ConstantOpcode::ArrayConst => self.array_constants[Type1(instr).constant() as usize].ty,
            ConstantOpcode::Nullptr | ConstantOpcode::PtrConst | ConstantOpcode::PtrCast => {
                Type(Type3(instr).type_id())
            }
            ConstantOpcode::GlobalRef => {
                // Globals are addressed through a pointer to their type,
                // interned when the global was created.
                let g = &self.globals[Type1(instr).constant() as usize];
                tm.find_pointer(g.ty).expect("global pointer type")
            }
            ConstantOpcode::FuncPtr => {
                let f = &self.functions[Type1(instr).constant() as usize];
                tm.find_pointer(f.ty).expect("function pointer type")
            }
        }
    }

    // ---- finalize ----

    pub fn build(self) -> Program {
        Program {
            type_manager: self.type_manager,
            functions: self.functions,
            constant_instrs: self.constant_instrs,
            i64_constants: self.i64_constants,
            f64_constants: self.f64_constants,
            char_array_constants: self.char_array_constants,
            vec4_constants: self.vec4_constants,
            vec8_constants: self.vec8_constants,
            struct_constants: self.struct_constants,
            array_constants: self.array_constants,
            ptr_constants: self.ptr_constants,
            globals: self.globals,
        }
    }
}

fn cmp_offset(cmp: CompType) -> u8 {
    match cmp {
        CompType::Eq => 0,
        CompType::Ne => 1,
        CompType::Lt => 2,
        CompType::Le => 3,
        CompType::Gt => 4,
        CompType::Ge => 5,
    }
}
