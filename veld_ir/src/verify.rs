//! Structural invariant checks
//!
//! Used by tests and (in debug builds) before the backend runs.

use hashbrown::{HashMap, HashSet};

use veld_common::{VeldError, VeldResult};

use crate::instruction::{opcode_of, Type2};
use crate::opcode::Opcode;
use crate::program::Function;
use crate::value::Value;

/// Every block carries exactly one terminator, located at the end of its
/// last segment.
pub fn verify_terminators(func: &Function) -> VeldResult<()> {
    for (bb, block) in func.blocks.iter().enumerate() {
        let mut terminators = 0;
        let mut last_is_terminator = false;
        for i in block.instr_indices() {
            let opcode = Opcode::from_u8(opcode_of(func.instrs[i]));
            last_is_terminator = opcode.is_terminator();
            if last_is_terminator {
                terminators += 1;
            }
        }
        if terminators != 1 || !last_is_terminator {
            return Err(VeldError::ir_error(format!(
                "block {bb} of '{}' has {terminators} terminators",
                func.name
            )));
        }
    }
    Ok(())
}

/// Phis appear only at the head of their block; every phi's member set
/// matches the block's predecessor set.
pub fn verify_phis(func: &Function) -> VeldResult<()> {
    // Map phi instruction -> blocks that carry a member for it.
    let mut member_blocks: HashMap<usize, HashSet<usize>> = HashMap::new();
    let mut phi_block: HashMap<usize, usize> = HashMap::new();

    for (bb, block) in func.blocks.iter().enumerate() {
        let mut in_head = true;
        for i in block.instr_indices() {
            let opcode = Opcode::from_u8(opcode_of(func.instrs[i]));
            match opcode {
                Opcode::Phi => {
                    if !in_head {
                        return Err(VeldError::ir_error(format!(
                            "phi %{i} not at head of block {bb}"
                        )));
                    }
                    phi_block.insert(i, bb);
                }
                Opcode::PhiMember => {
                    in_head = false;
                    let phi = Value::from_serialized(Type2(func.instrs[i]).arg0());
                    member_blocks.entry(phi.idx()).or_default().insert(bb);
                }
                Opcode::FuncArg => {}
                _ => in_head = false,
            }
        }
    }

    for (phi, bb) in &phi_block {
        let preds: HashSet<usize> = func.blocks[*bb].pred.iter().copied().collect();
        let members = member_blocks.get(phi).cloned().unwrap_or_default();
        if members != preds {
            return Err(VeldError::ir_error(format!(
                "phi %{phi} members {members:?} do not match predecessors {preds:?} of block {bb}"
            )));
        }
    }
    Ok(())
}

/// No `(A -> B)` with `|succ(A)| = |pred(B)| = 1` remains (the merge pass
/// ran to fixpoint). Conditional branches whose arms collapsed are exempt.
pub fn verify_no_trivial_edges(func: &Function) -> VeldResult<()> {
    for (bb, block) in func.blocks.iter().enumerate() {
        if block.succ.len() == 1 {
            let succ = block.succ[0];
            if succ != bb && func.blocks[succ].pred.len() == 1 {
                if let Some(last) = block.last_instr() {
                    if Opcode::from_u8(opcode_of(func.instrs[last])) == Opcode::Br {
                        return Err(VeldError::ir_error(format!(
                            "trivially mergeable edge {bb} -> {succ} remains"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}
