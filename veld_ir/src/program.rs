//! Immutable program representation
//!
//! `ProgramBuilder::build` yields a `Program`: the type manager, the function
//! table, and the append-only constant/global pools. Passes mutate functions
//! in place before the backend consumes them.

use smallvec::SmallVec;

use crate::types::{Type, TypeManager};
use crate::value::Value;

/// A basic block: contiguous instruction segments (inclusive ranges) plus
/// explicit successor and predecessor lists. Extra segments only appear
/// after block merging.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockData {
    pub segments: SmallVec<[(u32, u32); 1]>,
    pub succ: SmallVec<[usize; 2]>,
    pub pred: SmallVec<[usize; 2]>,
    pub terminated: bool,
}

impl BasicBlockData {
    pub fn instr_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments
            .iter()
            .flat_map(|&(start, end)| (start as usize)..=(end as usize))
    }

    pub fn last_instr(&self) -> Option<usize> {
        self.segments.last().map(|&(_, end)| end as usize)
    }
}

/// Either an external function (name, type, host address) or an internal one
/// (instructions plus basic blocks).
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub ty: Type,
    pub ret: Type,
    pub arg_types: Vec<Type>,
    pub arg_values: Vec<Value>,
    pub public: bool,
    pub external: bool,
    /// Host address of an external function.
    pub addr: usize,

    pub instrs: Vec<u64>,
    pub blocks: Vec<BasicBlockData>,
    pub(crate) current_block: usize,
}

impl Function {
    pub fn internal(
        name: &str,
        ty: Type,
        ret: Type,
        arg_types: Vec<Type>,
        public: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            ty,
            ret,
            arg_types,
            arg_values: Vec::new(),
            public,
            external: false,
            addr: 0,
            instrs: Vec::new(),
            blocks: Vec::new(),
            current_block: 0,
        }
    }

    pub fn external(name: &str, ty: Type, ret: Type, arg_types: Vec<Type>, addr: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            ret,
            arg_types,
            arg_values: Vec::new(),
            public: false,
            external: true,
            addr,
            instrs: Vec::new(),
            blocks: Vec::new(),
            current_block: 0,
        }
    }

    pub(crate) fn add_edge(&mut self, from: usize, to: usize) {
        if !self.blocks[from].succ.contains(&to) {
            self.blocks[from].succ.push(to);
        }
        if !self.blocks[to].pred.contains(&from) {
            self.blocks[to].pred.push(from);
        }
    }

    /// Reverse post-order of the CFG from the entry block.
    pub fn reverse_post_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        // Iterative DFS with an explicit stack of (block, next-successor).
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        visited[0] = true;
        loop {
            let Some(&(block, next)) = stack.last() else { break };
            let succ = &self.blocks[block].succ;
            if next < succ.len() {
                stack.last_mut().unwrap().1 += 1;
                let s = succ[next];
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }
}

#[derive(Debug, Clone)]
pub struct StructConstant {
    pub ty: Type,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ArrayConstant {
    pub ty: Type,
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub ty: Type,
    pub init: Value,
}

pub struct Program {
    pub type_manager: TypeManager,
    pub functions: Vec<Function>,
    pub constant_instrs: Vec<u64>,
    pub i64_constants: Vec<u64>,
    pub f64_constants: Vec<f64>,
    pub char_array_constants: Vec<String>,
    pub vec4_constants: Vec<[i32; 4]>,
    pub vec8_constants: Vec<[i32; 8]>,
    pub struct_constants: Vec<StructConstant>,
    pub array_constants: Vec<ArrayConstant>,
    pub ptr_constants: Vec<usize>,
    pub globals: Vec<Global>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Static type of a value inside `func`. Mirrors the builder's dispatch
    /// for the built program (used by the backend).
    pub fn type_of(&self, func: &Function, v: Value) -> Type {
        use crate::instruction::{opcode_of, Type1, Type3};
        use crate::opcode::{ConstantOpcode, Opcode};

        let tm = &self.type_manager;
        if v.is_constant_global() {
            let instr = self.constant_instrs[v.idx()];
            return match ConstantOpcode::from_u8(opcode_of(instr)) {
                ConstantOpcode::I1Const => tm.i1_type(),
                ConstantOpcode::I8Const => tm.i8_type(),
                ConstantOpcode::I16Const => tm.i16_type(),
                ConstantOpcode::I32Const => tm.i32_type(),
                ConstantOpcode::I64Const => tm.i64_type(),
                ConstantOpcode::F64Const => tm.f64_type(),
                ConstantOpcode::I32ConstVec4 => tm.i32_vec4_type(),
                ConstantOpcode::I32ConstVec8 => tm.i32_vec8_type(),
                ConstantOpcode::GlobalCharArrayConst => {
                    tm.find_pointer(tm.i8_type()).expect("char array pointer type")
                }
                ConstantOpcode::StructConst => {
                    self.struct_constants[Type1(instr).constant() as usize].ty
                }
                ConstantOpcode::ArrayConst => {
                    self.array_constants[Type1(instr).constant() as usize].ty
                }
                ConstantOpcode::Nullptr | ConstantOpcode::PtrConst | ConstantOpcode::PtrCast => {
                    Type(Type3(instr).type_id())
                }
                ConstantOpcode::GlobalRef => {
                    let g = &self.globals[Type1(instr).constant() as usize];
                    tm.find_pointer(g.ty).expect("global pointer type")
                }
                ConstantOpcode::FuncPtr => {
                    let f = &self.functions[Type1(instr).constant() as usize];
                    tm.find_pointer(f.ty).expect("function pointer type")
                }
            };
        }

        let instr = func.instrs[v.idx()];
        let opcode = Opcode::from_u8(opcode_of(instr));
        use Opcode::*;
        match opcode {
            Return | Br | CondBr | I8Store | I16Store | I32Store | I64Store | F64Store
            | PtrStore | I32Vec8Store | ReturnValue | PhiMember | GepStaticOffset
            | GepDynamicOffset => tm.void_type(),

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

            Phi | Alloca | PtrCast | GepStatic | GepDynamic | PtrMaterialize | FuncArg
            | PtrLoad | CallArg => Type(Type3(instr).type_id()),

            Call => self.functions[Type1(instr).constant() as usize].ret,
            CallIndirect => {
                let func_ty = Type(Type3(instr).type_id());
                match tm.function_signature(func_ty) {
                    Some((ret, _)) => ret,
                    None => tm.void_type(),
                }
            }
        }
    }
}
