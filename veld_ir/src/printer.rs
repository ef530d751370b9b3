//! Textual dump of a function, for debugging and tests

use std::fmt::Write;

use crate::instruction::{opcode_of, Type1, Type2, Type3, Type5};
use crate::opcode::Opcode;
use crate::program::Function;

fn operand(raw: u32) -> String {
    if raw & (1 << 23) != 0 {
        format!("c{}", raw & 0x7F_FFFF)
    } else {
        format!("%{raw}")
    }
}

/// One instruction per line, grouped by block, with value numbers.
pub fn print_function(func: &Function) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "fn {}:", func.name);
    for (bb, block) in func.blocks.iter().enumerate() {
        let _ = writeln!(
            out,
            ".{bb}: ; pred={:?} succ={:?}",
            block.pred.as_slice(),
            block.succ.as_slice()
        );
        for i in block.instr_indices() {
            let instr = func.instrs[i];
            let opcode = Opcode::from_u8(opcode_of(instr));
            let body = match opcode {
                Opcode::Br => format!("br .{}", Type5(instr).marg0()),
                Opcode::CondBr => {
                    let t5 = Type5(instr);
                    format!("condbr {} .{} .{}", operand(t5.arg()), t5.marg0(), t5.marg1())
                }
                Opcode::Return => "ret".to_string(),
                Opcode::ReturnValue => format!("ret {}", operand(Type3(instr).arg())),
                Opcode::Call => format!("call f{}", Type1(instr).constant()),
                Opcode::CallIndirect => format!("call_indirect {}", operand(Type3(instr).arg())),
                Opcode::CallArg => {
                    let t3 = Type3(instr);
                    format!("call_arg[{}] {}", t3.sarg(), operand(t3.arg()))
                }
                Opcode::FuncArg => format!("func_arg[{}]", Type3(instr).sarg()),
                Opcode::Phi => "phi".to_string(),
                Opcode::PhiMember => {
                    let t2 = Type2(instr);
                    format!("phi_member {} <- {}", operand(t2.arg0()), operand(t2.arg1()))
                }
                Opcode::Alloca => format!("alloca x{}", operand(Type3(instr).arg())),
                Opcode::GepStatic | Opcode::GepDynamic => format!("{opcode:?}").to_lowercase(),
                _ => {
                    let t2 = Type2(instr);
                    let name = format!("{opcode:?}").to_lowercase();
                    format!("{name} {} {}", operand(t2.arg0()), operand(t2.arg1()))
                }
            };
            let _ = writeln!(out, "  %{i} = {body}");
        }
    }
    out
}
