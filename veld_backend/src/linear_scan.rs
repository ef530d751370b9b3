//! Linear-scan register allocation
//!
//! Intervals are processed in ascending start order with two active sets
//! (general-purpose and xmm) ordered by ascending end. Function arguments
//! and call arguments are pre-coloured with their System V position
//! registers; calls clobber the remaining argument registers plus r10 and
//! every xmm; an i1 consumed only by the immediately following conditional
//! branch rides the EFLAGS pseudo-register. The spill heuristic frees the
//! non-fixed active interval with the latest end.

use std::collections::BTreeSet;

use veld_common::{VeldError, VeldResult};
use veld_ir::instruction::opcode_of;
use veld_ir::program::Function;
use veld_ir::value::Value;
use veld_ir::{Opcode, Program};

use crate::live_intervals::{LiveInterval, LiveIntervalResult, Pos};
use crate::register::{
    FLAG, GP_ALLOCATABLE, GP_ARG_REGS, GP_CALLER_SAVED_EXTRA, SPILL, XMM_ALLOCATABLE,
    XMM_ARG_REGS,
};

/// Allocation result: one physical register id (or `SPILL`) per instruction,
/// plus the block execution order.
pub struct Allocation {
    pub assignments: Vec<i32>,
    pub order: Vec<usize>,
}

/// An interval in an active set: either a virtual value's interval or a
/// fixed (pre-coloured) clobber.
#[derive(Debug, Clone)]
struct ActiveEntry {
    end: Pos,
    reg: i32,
    /// None marks a fixed interval that no spill may displace.
    value: Option<usize>,
}

struct ActiveSet {
    entries: Vec<ActiveEntry>,
}

impl ActiveSet {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn insert(&mut self, entry: ActiveEntry) {
        let pos = self.entries.partition_point(|e| e.end <= entry.end);
        self.entries.insert(pos, entry);
    }

    /// Frees every interval ending strictly before `start`.
    fn expire(&mut self, start: Pos, free: &mut BTreeSet<i32>) {
        while let Some(first) = self.entries.first() {
            if first.end < start {
                free.insert(first.reg);
                self.entries.remove(0);
            } else {
                break;
            }
        }
    }

    /// Latest-ending non-fixed entry.
    fn spill_candidate(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.value.is_some())
    }

    fn remove_by_reg(&mut self, reg: i32) -> Option<ActiveEntry> {
        let pos = self.entries.iter().position(|e| e.reg == reg)?;
        Some(self.entries.remove(pos))
    }
}

/// Takes the register for a fixed interval, spilling whichever virtual
/// value currently holds it. Two fixed intervals on one register at once is
/// a pre-colouring bug.
fn replace_with_fixed(
    entry: ActiveEntry,
    assignments: &mut [i32],
    free: &mut BTreeSet<i32>,
    active: &mut ActiveSet,
) -> VeldResult<()> {
    if free.remove(&entry.reg) {
        active.insert(entry);
        return Ok(());
    }
    match active.remove_by_reg(entry.reg) {
        Some(old) => match old.value {
            Some(instr) => {
                assignments[instr] = SPILL;
                active.insert(entry);
                Ok(())
            }
            None => Err(VeldError::reg_alloc_error(
                "two fixed intervals conflicting",
            )),
        },
        None => {
            // Register neither free nor active: it was never in the pool
            // (reserved), which is a pre-colouring bug.
            Err(VeldError::reg_alloc_error(format!(
                "fixed register {} is not allocatable",
                entry.reg
            )))
        }
    }
}

pub fn assign_registers(
    program: &Program,
    func: &Function,
    live: &LiveIntervalResult,
) -> VeldResult<Allocation> {
    let tm = &program.type_manager;
    let instrs = &func.instrs;
    let mut assignments = vec![SPILL; instrs.len()];

    let mut free_gp: BTreeSet<i32> = GP_ALLOCATABLE.iter().copied().collect();
    let mut free_xmm: BTreeSet<i32> = XMM_ALLOCATABLE.iter().copied().collect();
    let mut active_gp = ActiveSet::new();
    let mut active_xmm = ActiveSet::new();

    let mut gp_arg_ctr = 0usize;
    let mut xmm_arg_ctr = 0usize;
    // Positions count per register class, not per parameter slot.
    let mut gp_func_arg_ctr = 0usize;
    let mut xmm_func_arg_ctr = 0usize;

    for interval in &live.intervals {
        let instr_idx = interval.value.idx();
        let opcode = Opcode::from_u8(opcode_of(instrs[instr_idx]));
        let is_fp = tm.is_f64(interval.ty);

        // Calls clobber the unconsumed argument registers, r10, and every
        // xmm register.
        if matches!(opcode, Opcode::Call | Opcode::CallIndirect) {
            while gp_arg_ctr < GP_ARG_REGS.len() {
                let reg = GP_ARG_REGS[gp_arg_ctr];
                gp_arg_ctr += 1;
                replace_with_fixed(
                    ActiveEntry { end: interval.start, reg, value: None },
                    &mut assignments,
                    &mut free_gp,
                    &mut active_gp,
                )?;
            }
            while xmm_arg_ctr < XMM_ARG_REGS.len() {
                let reg = XMM_ARG_REGS[xmm_arg_ctr];
                xmm_arg_ctr += 1;
                replace_with_fixed(
                    ActiveEntry { end: interval.start, reg, value: None },
                    &mut assignments,
                    &mut free_xmm,
                    &mut active_xmm,
                )?;
            }
            for &reg in &GP_CALLER_SAVED_EXTRA {
                replace_with_fixed(
                    ActiveEntry { end: interval.start, reg, value: None },
                    &mut assignments,
                    &mut free_gp,
                    &mut active_gp,
                )?;
            }
            gp_arg_ctr = 0;
            xmm_arg_ctr = 0;
        }

        // Expire old intervals.
        active_gp.expire(interval.start, &mut free_gp);
        active_xmm.expire(interval.start, &mut free_xmm);

        // A void call drove the clobbering above but holds no register.
        if tm.is_void(interval.ty) {
            continue;
        }

        // Function arguments are pre-coloured with their position register.
        if opcode == Opcode::FuncArg {
            let (reg, free, active) = if is_fp {
                let position = xmm_func_arg_ctr;
                xmm_func_arg_ctr += 1;
                (XMM_ARG_REGS.get(position), &mut free_xmm, &mut active_xmm)
            } else {
                let position = gp_func_arg_ctr;
                gp_func_arg_ctr += 1;
                (GP_ARG_REGS.get(position), &mut free_gp, &mut active_gp)
            };
            match reg {
                Some(&reg) => {
                    assignments[instr_idx] = reg;
                    replace_with_fixed(
                        ActiveEntry { end: interval.end, reg, value: Some(instr_idx) },
                        &mut assignments,
                        free,
                        active,
                    )?;
                }
                None => {
                    // Stack-passed argument; the emitter reads the frame.
                    assignments[instr_idx] = SPILL;
                }
            }
            continue;
        }

        // An i1 used solely by the immediately following cond-branch stays
        // in EFLAGS.
        if tm.is_i1(interval.ty)
            && interval.start.bb == interval.end.bb
            && interval.start.idx + 1 == interval.end.idx
            && Opcode::from_u8(opcode_of(instrs[interval.end.idx as usize])) == Opcode::CondBr
        {
            assignments[instr_idx] = FLAG;
            continue;
        }

        // Call arguments are pre-coloured positionally; beyond the register
        // set they are stack-passed and stay unassigned.
        if opcode == Opcode::CallArg {
            let (ctr, regs, free, active) = if is_fp {
                (&mut xmm_arg_ctr, &XMM_ARG_REGS[..], &mut free_xmm, &mut active_xmm)
            } else {
                (&mut gp_arg_ctr, &GP_ARG_REGS[..], &mut free_gp, &mut active_gp)
            };
            if *ctr >= regs.len() {
                *ctr += 1;
                assignments[instr_idx] = SPILL;
                continue;
            }
            let reg = regs[*ctr];
            *ctr += 1;
            assignments[instr_idx] = reg;
            replace_with_fixed(
                ActiveEntry { end: interval.end, reg, value: Some(instr_idx) },
                &mut assignments,
                free,
                active,
            )?;
            continue;
        }

        // Vector values always live in xmm/ymm space.
        let wants_xmm = is_fp || tm.is_vec(interval.ty);
        let (free, active) = if wants_xmm {
            (&mut free_xmm, &mut active_xmm)
        } else {
            (&mut free_gp, &mut active_gp)
        };

        if let Some(&reg) = free.iter().next() {
            free.remove(&reg);
            assignments[instr_idx] = reg;
            active.insert(ActiveEntry { end: interval.end, reg, value: Some(instr_idx) });
            continue;
        }

        // No free register: spill the latest-ending non-fixed interval if
        // it ends after the current one, else spill the current.
        match active.spill_candidate() {
            Some(pos) if active.entries[pos].end > interval.end => {
                let victim = active.entries.remove(pos);
                let victim_instr = victim.value.unwrap();
                assignments[instr_idx] = assignments[victim_instr];
                assignments[victim_instr] = SPILL;
                active.insert(ActiveEntry {
                    end: interval.end,
                    reg: victim.reg,
                    value: Some(instr_idx),
                });
            }
            _ => {
                assignments[instr_idx] = SPILL;
            }
        }
    }

    log::debug!("register allocation for '{}':", func.name);
    if log::log_enabled!(log::Level::Trace) {
        for (i, &reg) in assignments.iter().enumerate() {
            log::trace!("  %{i} -> {}", crate::register::name(reg));
        }
    }

    Ok(Allocation { assignments, order: live.order.clone() })
}

/// Invariant check used by tests: no two values whose intervals overlap may
/// share a physical register.
pub fn verify_no_overlap(live: &LiveIntervalResult, allocation: &Allocation) -> VeldResult<()> {
    let assigned: Vec<&LiveInterval> = live
        .intervals
        .iter()
        .filter(|iv| {
            let reg = allocation.assignments[iv.value.idx()];
            reg != SPILL && reg != FLAG
        })
        .collect();

    for (i, a) in assigned.iter().enumerate() {
        for b in assigned.iter().skip(i + 1) {
            let ra = allocation.assignments[a.value.idx()];
            let rb = allocation.assignments[b.value.idx()];
            if ra != rb {
                continue;
            }
            // Touching at a single endpoint is a legal handoff: the def of
            // one instruction may reuse the register freed by its operand.
            if a.start < b.end && b.start < a.end {
                return Err(VeldError::reg_alloc_error(format!(
                    "%{} and %{} overlap on {}",
                    a.value.idx(),
                    b.value.idx(),
                    crate::register::name(ra)
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_intervals::compute_live_intervals;
    use veld_ir::{CompType, ProgramBuilder};

    fn allocate(b: ProgramBuilder, name: &str) -> (Program, Allocation, LiveIntervalResult) {
        let program = b.build();
        let func = program.function(name).unwrap();
        let live = compute_live_intervals(&program, func);
        let allocation = assign_registers(&program, func, &live).unwrap();
        verify_no_overlap(&live, &allocation).unwrap();
        (program, allocation, live)
    }

    use veld_ir::Program;

    #[test]
    fn test_args_precolored() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        let f64_ty = b.f64_type();
        b.create_public_function(b.void_type(), &[i32_ty, i32_ty, f64_ty], "f").unwrap();
        let args = b.get_function_arguments(b.current_function());
        let _ = b.add_i32(args[0], args[1]).unwrap();
        let _ = b.add_f64(args[2], args[2]).unwrap();
        b.ret().unwrap();

        let (_, allocation, _) = allocate(b, "f");
        // rdi, rsi for the two ints; xmm0 for the double.
        assert_eq!(allocation.assignments[0], 4);
        assert_eq!(allocation.assignments[1], 3);
        assert_eq!(allocation.assignments[2], 50);
    }

    #[test]
    fn test_flag_for_branch_only_compare() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        b.create_public_function(b.void_type(), &[i32_ty], "f").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];

        let t = b.create_block();
        let e = b.create_block();
        let ten = b.const_i32(10);
        let cond = b.cmp_i32(CompType::Lt, arg, ten).unwrap();
        b.cond_branch(cond, t, e).unwrap();
        b.set_current_block(t).unwrap();
        b.ret().unwrap();
        b.set_current_block(e).unwrap();
        b.ret().unwrap();

        let (_, allocation, _) = allocate(b, "f");
        assert_eq!(allocation.assignments[cond.idx()], FLAG);
    }

    #[test]
    fn test_spill_under_pressure() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        b.create_public_function(b.i32_type(), &[i32_ty], "f").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];

        // Generate more simultaneously-live values than registers.
        let mut values = Vec::new();
        for k in 0..20 {
            let c = b.const_i32(k);
            values.push(b.add_i32(arg, c).unwrap());
        }
        // Use them all so every interval reaches this point.
        let mut acc = values[0];
        for &v in &values[1..] {
            acc = b.add_i32(acc, v).unwrap();
        }
        b.ret_value(acc).unwrap();

        let (_, allocation, live) = allocate(b, "f");
        let spills = allocation
            .assignments
            .iter()
            .enumerate()
            .filter(|&(i, &r)| {
                r == SPILL && live.intervals.iter().any(|iv| iv.value.idx() == i)
            })
            .count();
        assert!(spills > 0, "20 live values across 12 registers must spill");
    }

    #[test]
    fn test_call_clobbers_caller_saved() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.i32_type();
        let callee = b.declare_external_function("ext", i32_ty, &[], 0x1234);
        b.create_public_function(b.i32_type(), &[i32_ty], "f").unwrap();
        let arg = b.get_function_arguments(b.current_function())[0];

        let one = b.const_i32(1);
        let before = b.add_i32(arg, one).unwrap();
        let ret = b.call(callee, &[]).unwrap();
        let after = b.add_i32(before, ret).unwrap();
        b.ret_value(after).unwrap();

        let (_, allocation, _) = allocate(b, "f");
        // `before` lives across the call, so it cannot sit in an argument
        // register or r10; it must be callee-saved or spilled.
        let reg = allocation.assignments[before.idx()];
        assert!(
            reg == SPILL || matches!(reg, 0 | 9 | 10 | 11 | 12),
            "value live across a call landed in caller-saved {}",
            crate::register::name(reg)
        );
    }
}
