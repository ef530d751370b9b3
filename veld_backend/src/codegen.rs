//! Machine-code generation for one function
//!
//! Walks the blocks in allocation order and lowers each 64-bit IR word using
//! the register assignments. Integers live sign-extended in 64-bit
//! registers; i1 is 0/1; f64 in xmm; i32x8 / i1x8 in ymm. RAX, R11, and
//! XMM7/YMM7 are scratch. Non-materialized GEPs fold into the addressing
//! mode of their consumer; materialized ones become an `lea` at their
//! definition.

use hashbrown::HashMap;

use veld_common::{VeldError, VeldResult};
use veld_ir::instruction::{opcode_of, Type1, Type2, Type3, Type5};
use veld_ir::value::Value;
use veld_ir::{ConstantOpcode, Opcode, Program};

use crate::asm::{Assembler, Cond, Label, Mem, RAX, RBP, R11};
use crate::data::DataSection;
use crate::linear_scan::Allocation;
use crate::register::{self, FLAG, SPILL};

const XMM_SCRATCH: u8 = 7;
const YMM_SCRATCH: u8 = 7;
const YMM_SCRATCH2: u8 = 6;

/// Absolute-address slots inside emitted code that need the final code base
/// (internal function targets).
pub struct CodeReloc {
    /// Offset of the 8-byte immediate inside this function's code.
    pub imm_offset: usize,
    pub func: usize,
}

pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<CodeReloc>,
}

/// How a constant value is materialized at a use site.
enum ConstOperand {
    Int(i64),
    F64(usize),
    Vec4(usize),
    Vec8(usize),
    Addr(u64),
    InternalFunc(usize),
}

pub struct FunctionCompiler<'a> {
    program: &'a Program,
    func_idx: usize,
    allocation: &'a Allocation,
    materialize: &'a [bool],
    data: &'a DataSection,
    data_base: u64,

    asm: Assembler,
    relocs: Vec<CodeReloc>,
    block_labels: Vec<Label>,
    slots: HashMap<usize, i32>,
    frame_bytes: i32,
    frame_patch: usize,
    /// Condition captured for a compare assigned to the EFLAGS pseudo-reg.
    flag_cond: Option<Cond>,
    /// Stack-passed call arguments accumulated until the call.
    pending_stack_args: Vec<u32>,
}

impl<'a> FunctionCompiler<'a> {
    pub fn new(
        program: &'a Program,
        func_idx: usize,
        allocation: &'a Allocation,
        materialize: &'a [bool],
        data: &'a DataSection,
        data_base: u64,
    ) -> Self {
        Self {
            program,
            func_idx,
            allocation,
            materialize,
            data,
            data_base,
            asm: Assembler::new(),
            relocs: Vec::new(),
            block_labels: Vec::new(),
            slots: HashMap::new(),
            frame_bytes: 0,
            frame_patch: 0,
            flag_cond: None,
            pending_stack_args: Vec::new(),
        }
    }

    fn func(&self) -> &veld_ir::Function {
        &self.program.functions[self.func_idx]
    }

    pub fn compile(mut self) -> VeldResult<CompiledFunction> {
        // Prologue: save rbp + callee-saved registers, open the frame.
        self.asm.push_r(RBP);
        self.asm.mov_rr(RBP, crate::asm::RSP);
        for &reg in &register::CALLEE_SAVED_ENCODINGS {
            self.asm.push_r(reg);
        }
        // Placeholder frame size; patched once the slot count is known.
        self.asm.sub_ri(crate::asm::RSP, 0);
        self.frame_patch = self.asm.pos() - 4;

        for _ in 0..self.func().blocks.len() {
            let label = self.asm.label();
            self.block_labels.push(label);
        }

        let order = self.allocation.order.clone();
        for &bb in &order {
            self.asm.bind(self.block_labels[bb]);
            let indices: Vec<usize> = self.func().blocks[bb].instr_indices().collect();
            for idx in indices {
                self.emit_instr(idx)?;
            }
        }

        self.asm.finish();

        // 5 callee saves at rbp-8..rbp-40; slots below; pad so calls stay
        // 16-byte aligned.
        let frame = ((self.frame_bytes + 15) & !15) + 8;
        let patch = self.frame_patch;
        self.asm.code[patch..patch + 4].copy_from_slice(&frame.to_le_bytes());

        Ok(CompiledFunction { code: self.asm.code, relocs: self.relocs })
    }

    // ---- locations ----

    fn assignment(&self, idx: usize) -> i32 {
        self.allocation.assignments[idx]
    }

    fn slot(&mut self, idx: usize, size: i32) -> Mem {
        let frame_bytes = &mut self.frame_bytes;
        let off = *self.slots.entry(idx).or_insert_with(|| {
            *frame_bytes += size.max(8);
            40 + *frame_bytes
        });
        Mem::base_disp(RBP, -off)
    }

    fn constant(&self, v: Value) -> VeldResult<ConstOperand> {
        let instr = self.program.constant_instrs[v.idx()];
        let payload = Type1(instr).constant();
        Ok(match ConstantOpcode::from_u8(opcode_of(instr)) {
            ConstantOpcode::I1Const
            | ConstantOpcode::I8Const
            | ConstantOpcode::I16Const
            | ConstantOpcode::I32Const => {
                // Sign-extend from the stored width.
                let op = ConstantOpcode::from_u8(opcode_of(instr));
                let v = match op {
                    ConstantOpcode::I1Const => (payload != 0) as i64,
                    ConstantOpcode::I8Const => payload as u8 as i8 as i64,
                    ConstantOpcode::I16Const => payload as u16 as i16 as i64,
                    _ => payload as u32 as i32 as i64,
                };
                ConstOperand::Int(v)
            }
            ConstantOpcode::I64Const => {
                ConstOperand::Int(self.program.i64_constants[payload as usize] as i64)
            }
            ConstantOpcode::F64Const => ConstOperand::F64(payload as usize),
            ConstantOpcode::I32ConstVec4 => ConstOperand::Vec4(payload as usize),
            ConstantOpcode::I32ConstVec8 => ConstOperand::Vec8(payload as usize),
            ConstantOpcode::Nullptr => ConstOperand::Addr(0),
            ConstantOpcode::GlobalCharArrayConst => ConstOperand::Addr(
                self.data_base + self.data.char_array_offsets[payload as usize] as u64,
            ),
            ConstantOpcode::GlobalRef => ConstOperand::Addr(
                self.data_base + self.data.global_offsets[payload as usize] as u64,
            ),
            ConstantOpcode::PtrConst => {
                ConstOperand::Addr(self.program.ptr_constants[Type3(instr).arg() as usize] as u64)
            }
            ConstantOpcode::FuncPtr => {
                let func = payload as usize;
                if self.program.functions[func].external {
                    ConstOperand::Addr(self.program.functions[func].addr as u64)
                } else {
                    ConstOperand::InternalFunc(func)
                }
            }
            ConstantOpcode::PtrCast => {
                return self.constant(Value::from_serialized(Type3(instr).arg()))
            }
            ConstantOpcode::StructConst | ConstantOpcode::ArrayConst => {
                return Err(VeldError::codegen_error(
                    "aggregate constant used as an operand",
                ))
            }
        })
    }

    /// Loads an integer/pointer value into `dst`. Returns the register the
    /// value actually lives in (avoids the move when it is already in one).
    fn int_to(&mut self, raw: u32, dst: u8, allow_in_place: bool) -> VeldResult<u8> {
        let v = Value::from_serialized(raw);
        if v.is_constant_global() {
            match self.constant(v)? {
                ConstOperand::Int(i) => self.asm.mov_imm(dst, i),
                ConstOperand::Addr(a) => self.asm.movabs(dst, a),
                ConstOperand::InternalFunc(func) => {
                    self.asm.movabs(dst, 0);
                    self.relocs.push(CodeReloc { imm_offset: self.asm.pos() - 8, func });
                }
                _ => return Err(VeldError::codegen_error("non-integer constant operand")),
            }
            return Ok(dst);
        }
        let idx = v.idx();
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 8);
                self.asm.mov_r_m(dst, &mem);
                Ok(dst)
            }
            FLAG => Err(VeldError::codegen_error("flag value used as data")),
            reg => {
                let hw = register::gp_encoding(reg);
                if allow_in_place {
                    Ok(hw)
                } else {
                    self.asm.mov_rr(dst, hw);
                    Ok(dst)
                }
            }
        }
    }

    /// Loads an f64 value into `dst` xmm (or returns its home register).
    fn f64_to(&mut self, raw: u32, dst: u8, allow_in_place: bool) -> VeldResult<u8> {
        let v = Value::from_serialized(raw);
        if v.is_constant_global() {
            match self.constant(v)? {
                ConstOperand::F64(pool) => {
                    let addr = self.data_base + self.data.f64_offsets[pool] as u64;
                    self.asm.movabs(R11, addr);
                    self.asm.movsd_x_m(dst, &Mem::base(R11));
                }
                _ => return Err(VeldError::codegen_error("non-f64 constant operand")),
            }
            return Ok(dst);
        }
        let idx = v.idx();
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 8);
                self.asm.movsd_x_m(dst, &mem);
                Ok(dst)
            }
            reg if register::is_xmm(reg) => {
                let hw = register::xmm_encoding(reg);
                if allow_in_place {
                    Ok(hw)
                } else {
                    self.asm.movsd_xx(dst, hw);
                    Ok(dst)
                }
            }
            _ => Err(VeldError::codegen_error("f64 value in integer register")),
        }
    }

    /// Loads a vector value into `dst` ymm (or returns its home register).
    fn vec_to(&mut self, raw: u32, dst: u8, allow_in_place: bool) -> VeldResult<u8> {
        let v = Value::from_serialized(raw);
        if v.is_constant_global() {
            match self.constant(v)? {
                ConstOperand::Vec8(pool) => {
                    let addr = self.data_base + self.data.vec8_offsets[pool] as u64;
                    self.asm.movabs(R11, addr);
                    self.asm.vmovdqu_y_m(dst, &Mem::base(R11));
                }
                _ => return Err(VeldError::codegen_error("non-vector constant operand")),
            }
            return Ok(dst);
        }
        let idx = v.idx();
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 32);
                self.asm.vmovdqu_y_m(dst, &mem);
                Ok(dst)
            }
            reg if register::is_xmm(reg) => {
                let hw = register::xmm_encoding(reg);
                if allow_in_place {
                    Ok(hw)
                } else {
                    self.asm.vmovdqa_yy(dst, hw);
                    Ok(dst)
                }
            }
            _ => Err(VeldError::codegen_error("vector value in integer register")),
        }
    }

    /// Writes an integer/pointer result from `src` to its assigned home.
    fn store_int_result(&mut self, idx: usize, src: u8) {
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 8);
                self.asm.mov_m_r(&mem, src);
            }
            FLAG => {}
            reg => {
                let hw = register::gp_encoding(reg);
                self.asm.mov_rr(hw, src);
            }
        }
    }

    fn store_f64_result(&mut self, idx: usize, src: u8) {
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 8);
                self.asm.movsd_m_x(&mem, src);
            }
            reg => {
                self.asm.movsd_xx(register::xmm_encoding(reg), src);
            }
        }
    }

    fn store_vec_result(&mut self, idx: usize, src: u8) {
        match self.assignment(idx) {
            SPILL => {
                let mem = self.slot(idx, 32);
                self.asm.vmovdqu_m_y(&mem, src);
            }
            reg => {
                self.asm.vmovdqa_yy(register::xmm_encoding(reg), src);
            }
        }
    }

    // ---- addressing ----

    fn instr_opcode(&self, idx: usize) -> Opcode {
        Opcode::from_u8(opcode_of(self.func().instrs[idx]))
    }

    fn is_lazy_gep(&self, raw: u32) -> bool {
        let v = Value::from_serialized(raw);
        if v.is_constant_global() || v.is_none() {
            return false;
        }
        matches!(self.instr_opcode(v.idx()), Opcode::GepStatic | Opcode::GepDynamic)
            && !self.materialize[v.idx()]
    }

    /// Resolves a pointer operand into a memory operand, folding a lazy GEP.
    /// May clobber RAX and R11. When `collapse` is set the result is
    /// guaranteed not to reference RAX (so RAX stays usable for the value).
    fn address_of(&mut self, raw: u32, collapse: bool) -> VeldResult<Mem> {
        let mem = self.address_of_inner(raw)?;
        if collapse && (mem.base == RAX || mem.index.map(|(r, _)| r == RAX).unwrap_or(false)) {
            self.asm.lea(R11, &mem);
            return Ok(Mem::base(R11));
        }
        Ok(mem)
    }

    fn address_of_inner(&mut self, raw: u32) -> VeldResult<Mem> {
        let v = Value::from_serialized(raw);
        if v.is_constant_global() {
            let reg = self.int_to(raw, R11, false)?;
            return Ok(Mem::base(reg));
        }
        let idx = v.idx();
        match self.instr_opcode(idx) {
            Opcode::GepStatic if !self.materialize[idx] => {
                let offset_word = Type2(self.func().instrs[idx - 1]);
                let base_raw = offset_word.arg0();
                let disp = self.const_int(offset_word.arg1())? as i32;
                let base = self.base_to_reg(base_raw)?;
                Ok(Mem::base_disp(base, disp))
            }
            Opcode::GepDynamic if !self.materialize[idx] => {
                let gep_word = Type3(self.func().instrs[idx]);
                let offset_word = Type2(self.func().instrs[idx - 1]);
                let base_raw = gep_word.arg();
                let scale = gep_word.sarg();
                let index_raw = offset_word.arg0();
                let disp = self.const_int(offset_word.arg1())? as i32;

                let base = self.base_to_reg(base_raw)?;
                // Index into RAX unless it is already in a register.
                let index = self.int_to(index_raw, RAX, true)?;
                Ok(Mem { base, index: Some((index, scale)), disp })
            }
            _ => {
                let reg = self.int_to(raw, R11, true)?;
                Ok(Mem::base(reg))
            }
        }
    }

    /// Base pointer into a register, preferring R11 as scratch so RAX stays
    /// free for indexes and values.
    fn base_to_reg(&mut self, raw: u32) -> VeldResult<u8> {
        self.int_to(raw, R11, true)
    }

    fn const_int(&self, raw: u32) -> VeldResult<i64> {
        let v = Value::from_serialized(raw);
        match self.constant(v)? {
            ConstOperand::Int(i) => Ok(i),
            _ => Err(VeldError::codegen_error("expected integer constant")),
        }
    }

    // ---- instruction dispatch ----

    fn emit_instr(&mut self, idx: usize) -> VeldResult<()> {
        use Opcode::*;
        let instr = self.func().instrs[idx];
        let opcode = Opcode::from_u8(opcode_of(instr));

        match opcode {
            FuncArg => self.emit_func_arg(idx, instr),
            Phi => Ok(()),
            PhiMember => self.emit_phi_member(instr),

            I8Add | I16Add | I32Add | I64Add => self.emit_int_binary(idx, instr, IntOp::Add),
            I8Sub | I16Sub | I32Sub | I64Sub => self.emit_int_binary(idx, instr, IntOp::Sub),
            I8Mul | I16Mul | I32Mul | I64Mul => self.emit_int_binary(idx, instr, IntOp::Mul),
            I64And | I1And => self.emit_int_binary(idx, instr, IntOp::And),
            I64Or | I1Or => self.emit_int_binary(idx, instr, IntOp::Or),
            I64Xor => self.emit_int_binary(idx, instr, IntOp::Xor),
            I64LShift => self.emit_shift(idx, instr, true),
            I64RShift => self.emit_shift(idx, instr, false),

            I1CmpEq | I8CmpEq | I16CmpEq | I32CmpEq | I64CmpEq => {
                self.emit_int_cmp(idx, instr, Cond::E)
            }
            I1CmpNe | I8CmpNe | I16CmpNe | I32CmpNe | I64CmpNe => {
                self.emit_int_cmp(idx, instr, Cond::Ne)
            }
            I8CmpLt | I16CmpLt | I32CmpLt | I64CmpLt => self.emit_int_cmp(idx, instr, Cond::L),
            I8CmpLe | I16CmpLe | I32CmpLe | I64CmpLe => self.emit_int_cmp(idx, instr, Cond::Le),
            I8CmpGt | I16CmpGt | I32CmpGt | I64CmpGt => self.emit_int_cmp(idx, instr, Cond::G),
            I8CmpGe | I16CmpGe | I32CmpGe | I64CmpGe => self.emit_int_cmp(idx, instr, Cond::Ge),

            I1LNot => {
                let t2 = Type2(instr);
                self.int_to(t2.arg0(), RAX, false)?;
                self.asm.xor_ri(RAX, 1);
                self.store_int_result(idx, RAX);
                Ok(())
            }

            I1ZextI8 | I1ZextI64 | I8ZextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.movzx_rr8(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I16ZextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.movzx_rr16(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I32ZextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.mov_rr32(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            // Values are kept sign-extended in registers; these re-extend
            // from the source width regardless.
            I8SextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.movsx_rr8(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I16SextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.movsx_rr16(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I32SextI64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.movsxd_rr(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I64TruncI16 | I64TruncI32 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                if opcode == I64TruncI16 {
                    self.asm.movzx_rr16(RAX, src);
                    // Sign-extend the 16-bit value back to canonical form.
                    self.asm.shl_ri(RAX, 48);
                    self.asm.sar_ri(RAX, 48);
                } else {
                    self.asm.movsxd_rr(RAX, src);
                }
                self.store_int_result(idx, RAX);
                Ok(())
            }

            I8ConvF64 | I16ConvF64 | I32ConvF64 | I64ConvF64 => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.cvtsi2sd(XMM_SCRATCH, src);
                self.store_f64_result(idx, XMM_SCRATCH);
                Ok(())
            }
            F64ConvI64 => {
                let t2 = Type2(instr);
                let src = self.f64_to(t2.arg0(), XMM_SCRATCH, true)?;
                self.asm.cvttsd2si(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }

            F64Add | F64Sub | F64Mul | F64Div => self.emit_f64_binary(idx, instr, opcode),
            F64CmpEq => self.emit_f64_cmp(idx, instr, Cond::E),
            F64CmpNe => self.emit_f64_cmp(idx, instr, Cond::Ne),
            F64CmpLt => self.emit_f64_cmp(idx, instr, Cond::B),
            F64CmpLe => self.emit_f64_cmp(idx, instr, Cond::Be),
            F64CmpGt => self.emit_f64_cmp(idx, instr, Cond::A),
            F64CmpGe => self.emit_f64_cmp(idx, instr, Cond::Ae),

            I64Popcount => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.popcnt_rr(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }

            I1Load | I8Load | I16Load | I32Load | I64Load | F64Load | PtrLoad => {
                self.emit_load(idx, instr, opcode)
            }
            I8Store | I16Store | I32Store | I64Store | F64Store | PtrStore => {
                self.emit_store(instr, opcode)
            }

            GepStatic | GepDynamic => self.emit_gep_def(idx),
            GepStaticOffset | GepDynamicOffset => Ok(()),
            PtrMaterialize => {
                let raw = Type3(instr).arg();
                let mem = self.address_of(raw, false)?;
                self.asm.lea(RAX, &mem);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            PtrCast => {
                let raw = Type3(instr).arg();
                self.int_to(raw, RAX, false)?;
                self.store_int_result(idx, RAX);
                Ok(())
            }
            PtrCmpNullptr => {
                let t2 = Type2(instr);
                let src = self.int_to(t2.arg0(), RAX, true)?;
                self.asm.test_rr(src, src);
                self.finish_cmp(idx, Cond::E)
            }

            Alloca => self.emit_alloca(idx, instr),

            CallArg => self.emit_call_arg(idx, instr),
            Call => {
                let func = Type1(instr).constant() as usize;
                self.emit_call_common(idx, Some(func), 0)
            }
            CallIndirect => {
                let raw = Type3(instr).arg();
                self.emit_call_common(idx, None, raw)
            }

            Br => {
                let target = Type5(instr).marg0();
                self.asm.jmp(self.block_labels[target]);
                Ok(())
            }
            CondBr => self.emit_cond_br(instr),
            Return => {
                self.emit_epilogue();
                Ok(())
            }
            ReturnValue => {
                let raw = Type3(instr).arg();
                let ty = veld_ir::Type(Type3(instr).type_id());
                if self.program.type_manager.is_f64(ty) {
                    let src = self.f64_to(raw, XMM_SCRATCH, true)?;
                    self.asm.movsd_xx(0, src);
                } else {
                    self.int_to(raw, RAX, false)?;
                }
                self.emit_epilogue();
                Ok(())
            }

            I32Vec8Load => {
                let mem = self.address_of(Type2(instr).arg0(), false)?;
                self.asm.vmovdqu_y_m(YMM_SCRATCH, &mem);
                self.store_vec_result(idx, YMM_SCRATCH);
                Ok(())
            }
            I32Vec8Store => {
                let t2 = Type2(instr);
                let mem = self.address_of(t2.arg0(), true)?;
                let src = self.vec_to(t2.arg1(), YMM_SCRATCH, true)?;
                self.asm.vmovdqu_m_y(&mem, src);
                Ok(())
            }
            I32Vec8Broadcast => {
                let src = self.int_to(Type2(instr).arg0(), RAX, true)?;
                self.asm.vmovd_x_r(XMM_SCRATCH, src);
                self.asm.vpbroadcastd(YMM_SCRATCH, XMM_SCRATCH);
                self.store_vec_result(idx, YMM_SCRATCH);
                Ok(())
            }
            I32Vec8Add => {
                let t2 = Type2(instr);
                let a = self.vec_to(t2.arg0(), YMM_SCRATCH, true)?;
                let b = self.vec_to(t2.arg1(), YMM_SCRATCH2, true)?;
                self.asm.vpaddd(YMM_SCRATCH, a, b);
                self.store_vec_result(idx, YMM_SCRATCH);
                Ok(())
            }
            I32Vec8CmpEq | I32Vec8CmpNe | I32Vec8CmpLt | I32Vec8CmpLe | I32Vec8CmpGt
            | I32Vec8CmpGe => self.emit_vec_cmp(idx, instr, opcode),
            I1Vec8And | I1Vec8Or => {
                let t2 = Type2(instr);
                let a = self.vec_to(t2.arg0(), YMM_SCRATCH, true)?;
                let b = self.vec_to(t2.arg1(), YMM_SCRATCH2, true)?;
                if opcode == I1Vec8And {
                    self.asm.vpand(YMM_SCRATCH, a, b);
                } else {
                    self.asm.vpor(YMM_SCRATCH, a, b);
                }
                self.store_vec_result(idx, YMM_SCRATCH);
                Ok(())
            }
            I1Vec8Mask => {
                let src = self.vec_to(Type2(instr).arg0(), YMM_SCRATCH, true)?;
                self.asm.vmovmskps(RAX, src);
                self.store_int_result(idx, RAX);
                Ok(())
            }
            I32Vec8Compress => {
                let t2 = Type2(instr);
                // indices = lut[mask]; result = vpermd(indices, src).
                self.int_to(t2.arg1(), RAX, false)?;
                self.asm.shl_ri(RAX, 5);
                let lut = self.data_base + self.data.permute_lut_offset as u64;
                self.asm.movabs(R11, lut);
                self.asm.add_rr(R11, RAX);
                self.asm.vmovdqu_y_m(YMM_SCRATCH2, &Mem::base(R11));
                let src = self.vec_to(t2.arg0(), YMM_SCRATCH, true)?;
                self.asm.vpermd(YMM_SCRATCH, YMM_SCRATCH2, src);
                self.store_vec_result(idx, YMM_SCRATCH);
                Ok(())
            }
            I32CmpEqAnyConstVec4 | I32CmpEqAnyConstVec8 => {
                self.emit_cmp_eq_any(idx, instr, opcode == I32CmpEqAnyConstVec8)
            }
        }
    }

    // (continued in impl block below)
}

#[derive(Clone, Copy, PartialEq)]
enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl<'a> FunctionCompiler<'a> {
    fn emit_func_arg(&mut self, idx: usize, instr: u64) -> VeldResult<()> {
        let position = Type3(instr).sarg() as usize;
        let ty = veld_ir::Type(Type3(instr).type_id());
        let is_fp = self.program.type_manager.is_f64(ty);

        // Count per register class to find this argument's home.
        let mut gp_seen = 0usize;
        let mut fp_seen = 0usize;
        for i in 0..position {
            let arg_instr = self.func().instrs[i];
            let arg_ty = veld_ir::Type(Type3(arg_instr).type_id());
            if self.program.type_manager.is_f64(arg_ty) {
                fp_seen += 1;
            } else {
                gp_seen += 1;
            }
        }

        if is_fp {
            let home = register::XMM_ARG_REGS.get(fp_seen).copied().ok_or_else(|| {
                VeldError::codegen_error("stack-passed parameters are not supported")
            })?;
            let home_hw = register::xmm_encoding(home);
            match self.assignment(idx) {
                SPILL => {
                    let mem = self.slot(idx, 8);
                    self.asm.movsd_m_x(&mem, home_hw);
                }
                reg if register::is_xmm(reg) => {
                    self.asm.movsd_xx(register::xmm_encoding(reg), home_hw);
                }
                _ => return Err(VeldError::codegen_error("f64 argument in integer register")),
            }
        } else {
            let home = register::GP_ARG_REGS.get(gp_seen).copied().ok_or_else(|| {
                VeldError::codegen_error("stack-passed parameters are not supported")
            })?;
            let home_hw = register::gp_encoding(home);
            match self.assignment(idx) {
                SPILL => {
                    let mem = self.slot(idx, 8);
                    self.asm.mov_m_r(&mem, home_hw);
                }
                FLAG => {}
                reg => self.asm.mov_rr(register::gp_encoding(reg), home_hw),
            }
        }
        Ok(())
    }

    fn emit_phi_member(&mut self, instr: u64) -> VeldResult<()> {
        let t2 = Type2(instr);
        let phi = Value::from_serialized(t2.arg0());
        if phi.is_none() || phi.is_constant_global() {
            return Err(VeldError::codegen_error("phi member without a phi"));
        }
        let phi_idx = phi.idx();
        let ty = self.program.type_of(self.func(), phi);
        let tm = &self.program.type_manager;

        if tm.is_f64(ty) {
            let src = self.f64_to(t2.arg1(), XMM_SCRATCH, true)?;
            self.store_f64_result(phi_idx, src);
        } else if tm.is_vec(ty) {
            let src = self.vec_to(t2.arg1(), YMM_SCRATCH, true)?;
            self.store_vec_result(phi_idx, src);
        } else {
            let src = self.int_to(t2.arg1(), RAX, true)?;
            self.store_int_result(phi_idx, src);
        }
        Ok(())
    }

    fn emit_int_binary(&mut self, idx: usize, instr: u64, op: IntOp) -> VeldResult<()> {
        let t2 = Type2(instr);
        self.int_to(t2.arg0(), RAX, false)?;
        let rhs = Value::from_serialized(t2.arg1());

        // Right-hand side: register, frame slot, or immediate.
        enum Rhs {
            Reg(u8),
            Mem(Mem),
            Imm(i64),
        }
        let rhs_loc = if rhs.is_constant_global() {
            match self.constant(rhs)? {
                ConstOperand::Int(i) => Rhs::Imm(i),
                ConstOperand::Addr(a) => {
                    self.asm.movabs(R11, a);
                    Rhs::Reg(R11)
                }
                _ => return Err(VeldError::codegen_error("bad integer rhs")),
            }
        } else {
            match self.assignment(rhs.idx()) {
                SPILL => Rhs::Mem(self.slot(rhs.idx(), 8)),
                FLAG => return Err(VeldError::codegen_error("flag value used as data")),
                reg => Rhs::Reg(register::gp_encoding(reg)),
            }
        };

        let rhs_reg = match rhs_loc {
            Rhs::Reg(r) => Some(r),
            Rhs::Mem(mem) => match op {
                IntOp::Add => {
                    self.asm.add_r_m(RAX, &mem);
                    None
                }
                IntOp::Sub => {
                    self.asm.sub_r_m(RAX, &mem);
                    None
                }
                _ => {
                    self.asm.mov_r_m(R11, &mem);
                    Some(R11)
                }
            },
            Rhs::Imm(i) => {
                if let (Ok(v), IntOp::Add) = (i32::try_from(i), op) {
                    self.asm.add_ri(RAX, v);
                    None
                } else if let (Ok(v), IntOp::Sub) = (i32::try_from(i), op) {
                    self.asm.sub_ri(RAX, v);
                    None
                } else {
                    self.asm.mov_imm(R11, i);
                    Some(R11)
                }
            }
        };

        if let Some(r) = rhs_reg {
            match op {
                IntOp::Add => self.asm.add_rr(RAX, r),
                IntOp::Sub => self.asm.sub_rr(RAX, r),
                IntOp::Mul => self.asm.imul_rr(RAX, r),
                IntOp::And => self.asm.and_rr(RAX, r),
                IntOp::Or => self.asm.or_rr(RAX, r),
                IntOp::Xor => self.asm.xor_rr(RAX, r),
            }
        }
        self.store_int_result(idx, RAX);
        Ok(())
    }

    fn emit_shift(&mut self, idx: usize, instr: u64, left: bool) -> VeldResult<()> {
        let t2 = Type2(instr);
        self.int_to(t2.arg0(), RAX, false)?;
        let amount = self.const_int(t2.arg1()).map_err(|_| {
            VeldError::codegen_error("shift amounts must be constants")
        })?;
        if left {
            self.asm.shl_ri(RAX, amount as u8);
        } else {
            self.asm.shr_ri(RAX, amount as u8);
        }
        self.store_int_result(idx, RAX);
        Ok(())
    }

    fn emit_int_cmp(&mut self, idx: usize, instr: u64, cond: Cond) -> VeldResult<()> {
        let t2 = Type2(instr);
        let lhs = self.int_to(t2.arg0(), RAX, true)?;
        let rhs = Value::from_serialized(t2.arg1());

        if rhs.is_constant_global() {
            match self.constant(rhs)? {
                ConstOperand::Int(i) if i32::try_from(i).is_ok() => {
                    self.asm.cmp_ri(lhs, i as i32);
                }
                ConstOperand::Int(i) => {
                    self.asm.mov_imm(R11, i);
                    self.asm.cmp_rr(lhs, R11);
                }
                ConstOperand::Addr(a) => {
                    self.asm.movabs(R11, a);
                    self.asm.cmp_rr(lhs, R11);
                }
                _ => return Err(VeldError::codegen_error("bad compare rhs")),
            }
        } else {
            match self.assignment(rhs.idx()) {
                SPILL => {
                    let mem = self.slot(rhs.idx(), 8);
                    self.asm.cmp_r_m(lhs, &mem);
                }
                FLAG => return Err(VeldError::codegen_error("flag value used as data")),
                reg => self.asm.cmp_rr(lhs, register::gp_encoding(reg)),
            }
        }
        self.finish_cmp(idx, cond)
    }

    /// Stores a computed condition either into EFLAGS (for a fused branch)
    /// or as a 0/1 byte.
    fn finish_cmp(&mut self, idx: usize, cond: Cond) -> VeldResult<()> {
        if self.assignment(idx) == FLAG {
            self.flag_cond = Some(cond);
            return Ok(());
        }
        self.asm.setcc(cond, RAX);
        self.asm.movzx_rr8(RAX, RAX);
        self.store_int_result(idx, RAX);
        Ok(())
    }

    fn emit_f64_binary(&mut self, idx: usize, instr: u64, opcode: Opcode) -> VeldResult<()> {
        let t2 = Type2(instr);
        self.f64_to(t2.arg0(), XMM_SCRATCH, false)?;
        let rhs = Value::from_serialized(t2.arg1());

        let rhs_mem: Option<Mem> = if rhs.is_constant_global() {
            match self.constant(rhs)? {
                ConstOperand::F64(pool) => {
                    let addr = self.data_base + self.data.f64_offsets[pool] as u64;
                    self.asm.movabs(R11, addr);
                    Some(Mem::base(R11))
                }
                _ => return Err(VeldError::codegen_error("bad f64 rhs")),
            }
        } else {
            match self.assignment(rhs.idx()) {
                SPILL => Some(self.slot(rhs.idx(), 8)),
                reg if register::is_xmm(reg) => {
                    let hw = register::xmm_encoding(reg);
                    match opcode {
                        Opcode::F64Add => self.asm.addsd(XMM_SCRATCH, hw),
                        Opcode::F64Sub => self.asm.subsd(XMM_SCRATCH, hw),
                        Opcode::F64Mul => self.asm.mulsd(XMM_SCRATCH, hw),
                        _ => self.asm.divsd(XMM_SCRATCH, hw),
                    }
                    None
                }
                _ => return Err(VeldError::codegen_error("f64 value in integer register")),
            }
        };

        if let Some(mem) = rhs_mem {
            match opcode {
                Opcode::F64Add => self.asm.addsd_m(XMM_SCRATCH, &mem),
                Opcode::F64Sub => self.asm.subsd_m(XMM_SCRATCH, &mem),
                Opcode::F64Mul => self.asm.mulsd_m(XMM_SCRATCH, &mem),
                _ => self.asm.divsd_m(XMM_SCRATCH, &mem),
            }
        }
        self.store_f64_result(idx, XMM_SCRATCH);
        Ok(())
    }

    fn emit_f64_cmp(&mut self, idx: usize, instr: u64, cond: Cond) -> VeldResult<()> {
        let t2 = Type2(instr);
        self.f64_to(t2.arg0(), XMM_SCRATCH, false)?;
        let rhs = Value::from_serialized(t2.arg1());

        if rhs.is_constant_global() {
            match self.constant(rhs)? {
                ConstOperand::F64(pool) => {
                    let addr = self.data_base + self.data.f64_offsets[pool] as u64;
                    self.asm.movabs(R11, addr);
                    self.asm.ucomisd_m(XMM_SCRATCH, &Mem::base(R11));
                }
                _ => return Err(VeldError::codegen_error("bad f64 compare rhs")),
            }
        } else {
            match self.assignment(rhs.idx()) {
                SPILL => {
                    let mem = self.slot(rhs.idx(), 8);
                    self.asm.ucomisd_m(XMM_SCRATCH, &mem);
                }
                reg if register::is_xmm(reg) => {
                    self.asm.ucomisd(XMM_SCRATCH, register::xmm_encoding(reg));
                }
                _ => return Err(VeldError::codegen_error("f64 value in integer register")),
            }
        }
        self.finish_cmp(idx, cond)
    }

    fn emit_load(&mut self, idx: usize, instr: u64, opcode: Opcode) -> VeldResult<()> {
        let raw = Type2(instr).arg0();
        let mem = self.address_of(raw, false)?;
        match opcode {
            Opcode::I1Load => self.asm.movzx_r_m8(RAX, &mem),
            Opcode::I8Load => self.asm.movsx_r_m8(RAX, &mem),
            Opcode::I16Load => self.asm.movsx_r_m16(RAX, &mem),
            Opcode::I32Load => self.asm.movsxd_r_m32(RAX, &mem),
            Opcode::I64Load | Opcode::PtrLoad => self.asm.mov_r_m(RAX, &mem),
            Opcode::F64Load => {
                self.asm.movsd_x_m(XMM_SCRATCH, &mem);
                self.store_f64_result(idx, XMM_SCRATCH);
                return Ok(());
            }
            _ => unreachable!(),
        }
        self.store_int_result(idx, RAX);
        Ok(())
    }

    fn emit_store(&mut self, instr: u64, opcode: Opcode) -> VeldResult<()> {
        let t2 = Type2(instr);
        if opcode == Opcode::F64Store {
            let mem = self.address_of(t2.arg0(), false)?;
            let src = self.f64_to(t2.arg1(), XMM_SCRATCH, true)?;
            self.asm.movsd_m_x(&mem, src);
            return Ok(());
        }
        // The address may not sit in RAX: the value needs it.
        let mem = self.address_of(t2.arg0(), true)?;
        let src = self.int_to(t2.arg1(), RAX, true)?;
        match opcode {
            Opcode::I8Store => self.asm.mov_m_r8(&mem, src),
            Opcode::I16Store => self.asm.mov_m_r16(&mem, src),
            Opcode::I32Store => self.asm.mov_m_r32(&mem, src),
            Opcode::I64Store | Opcode::PtrStore => self.asm.mov_m_r(&mem, src),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// A GEP definition emits code only when the analysis marked it for
    /// materialization.
    fn emit_gep_def(&mut self, idx: usize) -> VeldResult<()> {
        if !self.materialize[idx] {
            return Ok(());
        }
        let raw = Value::instr(idx as u32).serialize();
        let mem = self.address_of_lazy_gep(raw)?;
        self.asm.lea(RAX, &mem);
        self.store_int_result(idx, RAX);
        Ok(())
    }

    /// Folding resolution for a GEP regardless of its materialization mark.
    fn address_of_lazy_gep(&mut self, raw: u32) -> VeldResult<Mem> {
        let idx = Value::from_serialized(raw).idx();
        match self.instr_opcode(idx) {
            Opcode::GepStatic => {
                let offset_word = Type2(self.func().instrs[idx - 1]);
                let base = self.base_to_reg(offset_word.arg0())?;
                let disp = self.const_int(offset_word.arg1())? as i32;
                Ok(Mem::base_disp(base, disp))
            }
            Opcode::GepDynamic => {
                let gep_word = Type3(self.func().instrs[idx]);
                let offset_word = Type2(self.func().instrs[idx - 1]);
                let base = self.base_to_reg(gep_word.arg())?;
                let index = self.int_to(offset_word.arg0(), RAX, true)?;
                let disp = self.const_int(offset_word.arg1())? as i32;
                Ok(Mem { base, index: Some((index, gep_word.sarg())), disp })
            }
            _ => Err(VeldError::codegen_error("not a GEP")),
        }
    }

    fn emit_alloca(&mut self, idx: usize, instr: u64) -> VeldResult<()> {
        let ptr_ty = veld_ir::Type(Type3(instr).type_id());
        let elem_ty = self
            .program
            .type_manager
            .pointee(ptr_ty)
            .ok_or_else(|| VeldError::codegen_error("alloca of non-pointer type"))?;
        let count = self.const_int(Type3(instr).arg())? as i32;
        let size = (self.program.type_manager.size_of(elem_ty) as i32 * count + 7) & !7;

        self.frame_bytes += size;
        let offset = 40 + self.frame_bytes;
        self.asm.lea(RAX, &Mem::base_disp(RBP, -offset));
        self.store_int_result(idx, RAX);
        Ok(())
    }

    fn emit_call_arg(&mut self, idx: usize, instr: u64) -> VeldResult<()> {
        let t3 = Type3(instr);
        let raw = t3.arg();
        let ty = veld_ir::Type(t3.type_id());
        let assignment = self.assignment(idx);

        if assignment == SPILL {
            // Positioned beyond the register set; pushed right before the
            // call.
            self.pending_stack_args.push(raw);
            return Ok(());
        }

        if self.program.type_manager.is_f64(ty) {
            let home = register::xmm_encoding(assignment);
            let src = self.f64_to(raw, home, true)?;
            self.asm.movsd_xx(home, src);
        } else {
            let home = register::gp_encoding(assignment);
            self.int_to(raw, home, false)?;
        }
        Ok(())
    }

    fn emit_call_common(&mut self, idx: usize, target: Option<usize>, indirect_raw: u32) -> VeldResult<()> {
        // Push stack arguments in reverse, padding to 16 bytes.
        let stack_args = std::mem::take(&mut self.pending_stack_args);
        let pad = stack_args.len() % 2 == 1;
        if pad {
            self.asm.sub_ri(crate::asm::RSP, 8);
        }
        for &raw in stack_args.iter().rev() {
            let v = Value::from_serialized(raw);
            let ty = self.program.type_of(self.func(), v);
            if self.program.type_manager.is_f64(ty) {
                let src = self.f64_to(raw, XMM_SCRATCH, true)?;
                self.asm.movq_r_x(RAX, src);
            } else {
                self.int_to(raw, RAX, false)?;
            }
            self.asm.push_r(RAX);
        }

        match target {
            Some(func) if self.program.functions[func].external => {
                self.asm.movabs(RAX, self.program.functions[func].addr as u64);
            }
            Some(func) => {
                self.asm.movabs(RAX, 0);
                self.relocs.push(CodeReloc { imm_offset: self.asm.pos() - 8, func });
            }
            None => {
                self.int_to(indirect_raw, RAX, false)?;
            }
        }
        self.asm.call_r(RAX);

        if !stack_args.is_empty() || pad {
            let bytes = stack_args.len() as i32 * 8 + if pad { 8 } else { 0 };
            self.asm.add_ri(crate::asm::RSP, bytes);
        }

        // Fetch the return value.
        let ret_ty = self.program.type_of(self.func(), Value::instr(idx as u32));
        let tm = &self.program.type_manager;
        if tm.is_void(ret_ty) {
            return Ok(());
        }
        if tm.is_f64(ret_ty) {
            self.store_f64_result(idx, 0); // xmm0
        } else {
            self.store_int_result(idx, RAX);
        }
        Ok(())
    }

    fn emit_cond_br(&mut self, instr: u64) -> VeldResult<()> {
        let t5 = Type5(instr);
        let raw = t5.arg();
        let then_label = self.block_labels[t5.marg0()];
        let else_label = self.block_labels[t5.marg1()];

        let v = Value::from_serialized(raw);
        if !v.is_constant_global() && self.assignment(v.idx()) == FLAG {
            let cond = self
                .flag_cond
                .take()
                .ok_or_else(|| VeldError::codegen_error("flag branch without compare"))?;
            self.asm.jcc(cond, then_label);
            self.asm.jmp(else_label);
            return Ok(());
        }

        let src = self.int_to(raw, RAX, true)?;
        self.asm.test_rr(src, src);
        self.asm.jcc(Cond::Ne, then_label);
        self.asm.jmp(else_label);
        Ok(())
    }

    fn emit_epilogue(&mut self) {
        // Unwind the frame: slots, callee saves, rbp.
        let saves = register::CALLEE_SAVED_ENCODINGS.len() as i32;
        self.asm.lea(crate::asm::RSP, &Mem::base_disp(RBP, -saves * 8));
        for &reg in register::CALLEE_SAVED_ENCODINGS.iter().rev() {
            self.asm.pop_r(reg);
        }
        self.asm.pop_r(RBP);
        self.asm.ret();
    }

    fn emit_vec_cmp(&mut self, idx: usize, instr: u64, opcode: Opcode) -> VeldResult<()> {
        let t2 = Type2(instr);
        // Load both sides; ymm6 is never scratch so load a into ymm7 and
        // keep b wherever it lives (register or reloaded).
        let a = self.vec_to(t2.arg0(), YMM_SCRATCH, false)?;
        let b = self.vec_to(t2.arg1(), YMM_SCRATCH, true)?;

        match opcode {
            Opcode::I32Vec8CmpEq => self.asm.vpcmpeqd(YMM_SCRATCH, a, b),
            Opcode::I32Vec8CmpNe => {
                self.asm.vpcmpeqd(YMM_SCRATCH, a, b);
                // not = xor with all-ones
                self.asm.vpcmpeqd(6, 6, 6);
                self.asm.vpxor(YMM_SCRATCH, YMM_SCRATCH, 6);
            }
            Opcode::I32Vec8CmpGt => self.asm.vpcmpgtd(YMM_SCRATCH, a, b),
            Opcode::I32Vec8CmpLt => self.asm.vpcmpgtd(YMM_SCRATCH, b, a),
            Opcode::I32Vec8CmpLe => {
                self.asm.vpcmpgtd(YMM_SCRATCH, a, b);
                self.asm.vpcmpeqd(6, 6, 6);
                self.asm.vpxor(YMM_SCRATCH, YMM_SCRATCH, 6);
            }
            Opcode::I32Vec8CmpGe => {
                self.asm.vpcmpgtd(YMM_SCRATCH, b, a);
                self.asm.vpcmpeqd(6, 6, 6);
                self.asm.vpxor(YMM_SCRATCH, YMM_SCRATCH, 6);
            }
            _ => unreachable!(),
        }
        self.store_vec_result(idx, YMM_SCRATCH);
        Ok(())
    }

    fn emit_cmp_eq_any(&mut self, idx: usize, instr: u64, wide: bool) -> VeldResult<()> {
        let t2 = Type2(instr);
        let vec = Value::from_serialized(t2.arg1());
        let pool_addr = match self.constant(vec)? {
            ConstOperand::Vec8(pool) => self.data_base + self.data.vec8_offsets[pool] as u64,
            ConstOperand::Vec4(pool) => self.data_base + self.data.vec4_offsets[pool] as u64,
            _ => return Err(VeldError::codegen_error("eq-any needs a constant vector")),
        };

        let src = self.int_to(t2.arg0(), RAX, true)?;
        self.asm.vmovd_x_r(XMM_SCRATCH, src);
        self.asm.movabs(R11, pool_addr);
        if wide {
            self.asm.vpbroadcastd(YMM_SCRATCH, XMM_SCRATCH);
            self.asm.vmovdqu_y_m(6, &Mem::base(R11));
            self.asm.vpcmpeqd(YMM_SCRATCH, YMM_SCRATCH, 6);
            self.asm.vmovmskps(RAX, YMM_SCRATCH);
        } else {
            self.asm.vpbroadcastd_x(XMM_SCRATCH, XMM_SCRATCH);
            self.asm.vmovdqu_x_m(6, &Mem::base(R11));
            self.asm.vpcmpeqd_x(XMM_SCRATCH, XMM_SCRATCH, 6);
            self.asm.vmovmskps_x(RAX, XMM_SCRATCH);
        }
        self.asm.test_rr(RAX, RAX);
        self.finish_cmp(idx, Cond::Ne)
    }
}
