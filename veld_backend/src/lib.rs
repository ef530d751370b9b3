//! Native backend: register allocation and x86-64 emission
//!
//! `compile` runs CFG simplification, the GEP-materialization analysis,
//! live-interval computation, and linear-scan allocation over every internal
//! function, then emits machine code into an executable mapping. Public
//! functions are resolvable by name; the pipeline scheduler calls them
//! through `CompiledProgram::function`.

pub mod asm;
pub mod codegen;
pub mod data;
pub mod linear_scan;
pub mod live_intervals;
pub mod register;

use hashbrown::HashMap;

use memmap2::{Mmap, MmapMut, MmapOptions};

use veld_common::{VeldError, VeldResult};
use veld_ir::{cfg_simplify, compute_gep_materialize, Program};

use crate::codegen::FunctionCompiler;
use crate::data::DataReloc;

pub struct CompiledProgram {
    code: Mmap,
    // The data section stays writable: it holds the program's globals.
    #[allow(dead_code)]
    data: MmapMut,
    symbols: HashMap<String, usize>,
}

// The mappings are plain memory owned by this struct; nothing borrows them.
unsafe impl Send for CompiledProgram {}

impl CompiledProgram {
    /// Address of a public function by name.
    pub fn function(&self, name: &str) -> Option<*const u8> {
        self.symbols.get(name).map(|&off| unsafe { self.code.as_ptr().add(off) })
    }

    /// # Safety
    /// The symbol must exist and have the `extern "C" fn()` type.
    pub unsafe fn invoke(&self, name: &str) -> VeldResult<()> {
        let addr = self
            .function(name)
            .ok_or_else(|| VeldError::codegen_error(format!("unknown symbol '{name}'")))?;
        let f: extern "C" fn() = std::mem::transmute(addr);
        f();
        Ok(())
    }
}

pub fn compile(mut program: Program) -> VeldResult<CompiledProgram> {
    // Per-function passes.
    for func in &mut program.functions {
        if !func.external {
            cfg_simplify(func);
        }
    }

    // Data section first so code can embed absolute data addresses.
    let data_section = data::build_data_section(&program)?;
    let data_len = data_section.bytes.len().max(1);
    let mut data = MmapOptions::new()
        .len(data_len)
        .map_anon()
        .map_err(|e| VeldError::codegen_error(format!("data mapping failed: {e}")))?;
    data[..data_section.bytes.len()].copy_from_slice(&data_section.bytes);
    let data_base = data.as_ptr() as u64;

    // Intra-data pointers can be patched immediately.
    for reloc in &data_section.relocs {
        if let DataReloc::DataPtr { offset, target } = *reloc {
            let addr = data_base + target as u64;
            data[offset..offset + 8].copy_from_slice(&addr.to_le_bytes());
        }
    }

    // Emit every internal function.
    let mut code_bytes: Vec<u8> = Vec::new();
    let mut func_offsets: Vec<usize> = vec![0; program.functions.len()];
    let mut code_relocs: Vec<(usize, usize)> = Vec::new(); // (imm offset, func)
    let mut symbols = HashMap::new();

    for idx in 0..program.functions.len() {
        if program.functions[idx].external {
            continue;
        }
        let func = &program.functions[idx];
        let materialize = compute_gep_materialize(func)?;
        let live = live_intervals::compute_live_intervals(&program, func);
        let allocation = linear_scan::assign_registers(&program, func, &live)?;

        let compiled = FunctionCompiler::new(
            &program,
            idx,
            &allocation,
            &materialize,
            &data_section,
            data_base,
        )
        .compile()?;

        let base = code_bytes.len();
        func_offsets[idx] = base;
        for reloc in compiled.relocs {
            code_relocs.push((base + reloc.imm_offset, reloc.func));
        }
        if program.functions[idx].public {
            symbols.insert(program.functions[idx].name.clone(), base);
        }
        code_bytes.extend_from_slice(&compiled.code);
        log::debug!(
            "emitted '{}' at +{base:#x} ({} bytes)",
            program.functions[idx].name,
            code_bytes.len() - base
        );
    }

    let mut code = MmapOptions::new()
        .len(code_bytes.len().max(1))
        .map_anon()
        .map_err(|e| VeldError::codegen_error(format!("code mapping failed: {e}")))?;
    code[..code_bytes.len()].copy_from_slice(&code_bytes);
    let code_base = code.as_ptr() as u64;

    // Internal call/function-pointer targets.
    for (imm_offset, func) in code_relocs {
        let addr = code_base + func_offsets[func] as u64;
        code[imm_offset..imm_offset + 8].copy_from_slice(&addr.to_le_bytes());
    }
    for reloc in &data_section.relocs {
        if let DataReloc::FuncPtr { offset, func } = *reloc {
            let addr = code_base + func_offsets[func] as u64;
            data[offset..offset + 8].copy_from_slice(&addr.to_le_bytes());
        }
    }

    let code = code
        .make_exec()
        .map_err(|e| VeldError::codegen_error(format!("marking code executable failed: {e}")))?;

    Ok(CompiledProgram { code, data, symbols })
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_ir::{CompType, ProgramBuilder};

    #[test]
    fn test_compile_and_run_constant_return() {
        let mut b = ProgramBuilder::new();
        b.create_public_function(b.i64_type(), &[], "answer").unwrap();
        let v = b.const_i64(42);
        b.ret_value(v).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn() -> i64 =
            unsafe { std::mem::transmute(compiled.function("answer").unwrap()) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn test_compile_and_run_arithmetic() {
        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        b.create_public_function(b.i64_type(), &[i64_ty, i64_ty], "addmul").unwrap();
        let args = b.get_function_arguments(b.current_function());
        let sum = b.add_i64(args[0], args[1]).unwrap();
        let prod = b.mul_i64(sum, args[0]).unwrap();
        b.ret_value(prod).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(i64, i64) -> i64 =
            unsafe { std::mem::transmute(compiled.function("addmul").unwrap()) };
        assert_eq!(f(3, 4), 21);
        assert_eq!(f(-2, 2), 0);
    }

    #[test]
    fn test_compile_and_run_branch() {
        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        b.create_public_function(b.i64_type(), &[i64_ty], "max0").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];

        let positive = b.create_block();
        let negative = b.create_block();
        let zero = b.const_i64(0);
        let cond = b.cmp_i64(CompType::Gt, arg, zero).unwrap();
        b.cond_branch(cond, positive, negative).unwrap();

        b.set_current_block(positive).unwrap();
        b.ret_value(arg).unwrap();
        b.set_current_block(negative).unwrap();
        let zero = b.const_i64(0);
        b.ret_value(zero).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(i64) -> i64 =
            unsafe { std::mem::transmute(compiled.function("max0").unwrap()) };
        assert_eq!(f(7), 7);
        assert_eq!(f(-7), 0);
    }

    #[test]
    fn test_compile_and_run_loop_with_phi() {
        // sum 0..n over a phi-carried loop.
        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        b.create_public_function(b.i64_type(), &[i64_ty], "sum_to").unwrap();
        let n = b.get_function_arguments(b.current_function())[0];

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let zero = b.const_i64(0);
        let mi0 = b.phi_member(zero).unwrap();
        let ms0 = b.phi_member(zero).unwrap();
        b.branch(header).unwrap();

        b.set_current_block(header).unwrap();
        let i = b.phi(i64_ty).unwrap();
        let sum = b.phi(i64_ty).unwrap();
        b.update_phi_member(i, mi0);
        b.update_phi_member(sum, ms0);
        let cond = b.cmp_i64(CompType::Lt, i, n).unwrap();
        b.cond_branch(cond, body, exit).unwrap();

        b.set_current_block(body).unwrap();
        let one = b.const_i64(1);
        let next_sum = b.add_i64(sum, i).unwrap();
        let next_i = b.add_i64(i, one).unwrap();
        let mi1 = b.phi_member(next_i).unwrap();
        let ms1 = b.phi_member(next_sum).unwrap();
        b.update_phi_member(i, mi1);
        b.update_phi_member(sum, ms1);
        b.branch(header).unwrap();

        b.set_current_block(exit).unwrap();
        b.ret_value(sum).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(i64) -> i64 =
            unsafe { std::mem::transmute(compiled.function("sum_to").unwrap()) };
        assert_eq!(f(10), 45);
        assert_eq!(f(0), 0);
        assert_eq!(f(1000), 499500);
    }

    #[test]
    fn test_compile_and_run_external_call() {
        extern "C" fn triple(x: i64) -> i64 {
            x * 3
        }

        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        let ext = b.declare_external_function("triple", i64_ty, &[i64_ty], triple as usize);
        b.create_public_function(b.i64_type(), &[i64_ty], "call_triple").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];
        let result = b.call(ext, &[arg]).unwrap();
        let one = b.const_i64(1);
        let plus = b.add_i64(result, one).unwrap();
        b.ret_value(plus).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(i64) -> i64 =
            unsafe { std::mem::transmute(compiled.function("call_triple").unwrap()) };
        assert_eq!(f(5), 16);
    }

    #[test]
    fn test_compile_and_run_globals() {
        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        let init = b.const_i64(7);
        let counter = b.global(i64_ty, init);

        b.create_public_function(b.i64_type(), &[], "bump").unwrap();
        let old = b.load_i64(counter).unwrap();
        let one = b.const_i64(1);
        let new = b.add_i64(old, one).unwrap();
        b.store_i64(counter, new).unwrap();
        b.ret_value(new).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn() -> i64 =
            unsafe { std::mem::transmute(compiled.function("bump").unwrap()) };
        assert_eq!(f(), 8);
        assert_eq!(f(), 9);
    }

    #[test]
    fn test_compile_and_run_f64() {
        let mut b = ProgramBuilder::new();
        let f64_ty = b.f64_type();
        b.create_public_function(b.f64_type(), &[f64_ty, f64_ty], "fma_ish").unwrap();
        let args = b.get_function_arguments(b.current_function());
        let prod = b.mul_f64(args[0], args[1]).unwrap();
        let half = b.const_f64(0.5);
        let out = b.add_f64(prod, half).unwrap();
        b.ret_value(out).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(f64, f64) -> f64 =
            unsafe { std::mem::transmute(compiled.function("fma_ish").unwrap()) };
        assert_eq!(f(2.0, 3.0), 6.5);
    }

    #[test]
    fn test_compile_and_run_alloca_struct() {
        let mut b = ProgramBuilder::new();
        let i64_ty = b.i64_type();
        let i32_ty = b.i32_type();
        let row = b.struct_type(&[i64_ty, i32_ty], None).unwrap();
        b.create_public_function(b.i64_type(), &[i64_ty], "via_mem").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];

        let slot = b.alloca(row, 1).unwrap();
        let f0 = b.const_gep(slot, &[0, 0]).unwrap();
        b.store_i64(f0, arg).unwrap();
        let f1 = b.const_gep(slot, &[0, 1]).unwrap();
        let five = b.const_i32(5);
        b.store_i32(f1, five).unwrap();

        let v0 = b.load_i64(f0).unwrap();
        let v1 = b.load_i32(f1).unwrap();
        let wide = b.i64_zext_i32(v1).unwrap();
        let out = b.add_i64(v0, wide).unwrap();
        b.ret_value(out).unwrap();

        let compiled = compile(b.build()).unwrap();
        let f: extern "C" fn(i64) -> i64 =
            unsafe { std::mem::transmute(compiled.function("via_mem").unwrap()) };
        assert_eq!(f(100), 105);
    }
}
