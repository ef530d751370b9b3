//! Structured control-flow combinators
//!
//! These compose blocks, branches, and phis into `if`/ternary/loop shapes.
//! Constant conditions short-circuit at build time; otherwise the block
//! structure is emitted and the current insertion point ends up at the join
//! block.

use veld_common::{VeldError, VeldResult};
use veld_ir::{ProgramBuilder, Value};

pub fn if_then(
    p: &mut ProgramBuilder,
    cond: Value,
    then_fn: impl FnOnce(&mut ProgramBuilder) -> VeldResult<()>,
) -> VeldResult<()> {
    if let Some(c) = p.get_i1_constant(cond) {
        if c {
            then_fn(p)?;
        }
        return Ok(());
    }

    let then_block = p.create_block();
    let dest_block = p.create_block();
    p.cond_branch(cond, then_block, dest_block)?;

    p.set_current_block(then_block)?;
    then_fn(p)?;
    if !p.is_terminated(p.current_block()) {
        p.branch(dest_block)?;
    }

    p.set_current_block(dest_block)
}

pub fn if_then_else(
    p: &mut ProgramBuilder,
    cond: Value,
    then_fn: impl FnOnce(&mut ProgramBuilder) -> VeldResult<()>,
    else_fn: impl FnOnce(&mut ProgramBuilder) -> VeldResult<()>,
) -> VeldResult<()> {
    if let Some(c) = p.get_i1_constant(cond) {
        return if c { then_fn(p) } else { else_fn(p) };
    }

    let then_block = p.create_block();
    let else_block = p.create_block();
    let dest_block = p.create_block();
    p.cond_branch(cond, then_block, else_block)?;

    p.set_current_block(then_block)?;
    then_fn(p)?;
    if !p.is_terminated(p.current_block()) {
        p.branch(dest_block)?;
    }

    p.set_current_block(else_block)?;
    else_fn(p)?;
    if !p.is_terminated(p.current_block()) {
        p.branch(dest_block)?;
    }

    p.set_current_block(dest_block)
}

/// Value-producing conditional: both branches yield the same number of
/// values; the results are phis in the join block.
pub fn ternary(
    p: &mut ProgramBuilder,
    cond: Value,
    then_fn: impl FnOnce(&mut ProgramBuilder) -> VeldResult<Vec<Value>>,
    else_fn: impl FnOnce(&mut ProgramBuilder) -> VeldResult<Vec<Value>>,
) -> VeldResult<Vec<Value>> {
    if let Some(c) = p.get_i1_constant(cond) {
        return if c { then_fn(p) } else { else_fn(p) };
    }

    let then_block = p.create_block();
    let else_block = p.create_block();
    let dest_block = p.create_block();
    p.cond_branch(cond, then_block, else_block)?;

    p.set_current_block(then_block)?;
    let then_values = then_fn(p)?;
    if p.is_terminated(p.current_block()) {
        return Err(VeldError::ir_error("ternary branch may not terminate"));
    }
    let types: Vec<_> = then_values.iter().map(|&v| p.type_of(v)).collect();
    let then_members: Vec<Value> = then_values
        .into_iter()
        .map(|v| p.phi_member(v))
        .collect::<VeldResult<_>>()?;
    p.branch(dest_block)?;

    p.set_current_block(else_block)?;
    let else_values = else_fn(p)?;
    if p.is_terminated(p.current_block()) {
        return Err(VeldError::ir_error("ternary branch may not terminate"));
    }
    if else_values.len() != then_members.len() {
        return Err(VeldError::ir_error("ternary branches disagree on arity"));
    }
    let else_members: Vec<Value> = else_values
        .into_iter()
        .map(|v| p.phi_member(v))
        .collect::<VeldResult<_>>()?;
    p.branch(dest_block)?;

    p.set_current_block(dest_block)?;
    let mut out = Vec::with_capacity(then_members.len());
    for ((then_member, else_member), ty) in
        then_members.into_iter().zip(else_members).zip(types)
    {
        let phi = p.phi(ty)?;
        p.update_phi_member(phi, then_member);
        p.update_phi_member(phi, else_member);
        out.push(phi);
    }
    Ok(out)
}

/// Open-coded `if` for emitters that interleave other state with the body
/// (the closure forms borrow only the builder). `begin_if` enters the then
/// block; `end` joins.
pub struct IfGuard {
    dest: usize,
}

pub fn begin_if(p: &mut ProgramBuilder, cond: Value) -> VeldResult<IfGuard> {
    let then_block = p.create_block();
    let dest = p.create_block();
    p.cond_branch(cond, then_block, dest)?;
    p.set_current_block(then_block)?;
    Ok(IfGuard { dest })
}

impl IfGuard {
    pub fn end(self, p: &mut ProgramBuilder) -> VeldResult<()> {
        if !p.is_terminated(p.current_block()) {
            p.branch(self.dest)?;
        }
        p.set_current_block(self.dest)
    }
}

/// Open-coded `if`/`else`: `begin_if_else` enters the then block,
/// `else_branch` switches to the else block, `end` joins.
pub struct IfElseGuard {
    else_block: usize,
    dest: usize,
}

pub fn begin_if_else(p: &mut ProgramBuilder, cond: Value) -> VeldResult<IfElseGuard> {
    let then_block = p.create_block();
    let else_block = p.create_block();
    let dest = p.create_block();
    p.cond_branch(cond, then_block, else_block)?;
    p.set_current_block(then_block)?;
    Ok(IfElseGuard { else_block, dest })
}

impl IfElseGuard {
    pub fn else_branch(&self, p: &mut ProgramBuilder) -> VeldResult<()> {
        if !p.is_terminated(p.current_block()) {
            p.branch(self.dest)?;
        }
        p.set_current_block(self.else_block)
    }

    pub fn end(self, p: &mut ProgramBuilder) -> VeldResult<()> {
        if !p.is_terminated(p.current_block()) {
            p.branch(self.dest)?;
        }
        p.set_current_block(self.dest)
    }
}

/// Loop with phi-carried variables: a header block holds one phi per loop
/// variable; `continue_with` jumps back from any reachable block, `exit`
/// moves the insertion point past the loop.
pub struct Loop {
    header: usize,
    end: usize,
    body: usize,
    phis: Vec<Value>,
}

impl Loop {
    /// Seeds the loop variables and opens the header.
    pub fn new(p: &mut ProgramBuilder, init: &[Value]) -> VeldResult<Loop> {
        let header = p.create_block();
        let body = p.create_block();
        let end = p.create_block();

        let types: Vec<_> = init.iter().map(|&v| p.type_of(v)).collect();
        let members: Vec<Value> = init
            .iter()
            .map(|&v| p.phi_member(v))
            .collect::<VeldResult<_>>()?;
        p.branch(header)?;

        p.set_current_block(header)?;
        let mut phis = Vec::with_capacity(members.len());
        for (member, ty) in members.into_iter().zip(types) {
            let phi = p.phi(ty)?;
            p.update_phi_member(phi, member);
            phis.push(phi);
        }
        Ok(Loop { header, end, body, phis })
    }

    pub fn var(&self, i: usize) -> Value {
        self.phis[i]
    }

    /// Emits the header's conditional branch and opens the body. Call once,
    /// after computing the continue condition from the loop variables.
    pub fn enter_body(&self, p: &mut ProgramBuilder, cond: Value) -> VeldResult<()> {
        p.cond_branch(cond, self.body, self.end)?;
        p.set_current_block(self.body)
    }

    /// Jumps back to the header with the next values of every variable.
    /// Terminates the current block; usable from nested blocks.
    pub fn continue_with(&self, p: &mut ProgramBuilder, next: &[Value]) -> VeldResult<()> {
        if next.len() != self.phis.len() {
            return Err(VeldError::ir_error("loop continue arity mismatch"));
        }
        for (&phi, &v) in self.phis.iter().zip(next) {
            let member = p.phi_member(v)?;
            p.update_phi_member(phi, member);
        }
        p.branch(self.header)
    }

    /// Jumps to the loop end.
    pub fn break_out(&self, p: &mut ProgramBuilder) -> VeldResult<()> {
        p.branch(self.end)
    }

    /// Moves the insertion point to the loop end. The loop variables stay
    /// readable (the header dominates the end).
    pub fn exit(&self, p: &mut ProgramBuilder) -> VeldResult<()> {
        p.set_current_block(self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veld_ir::{verify, CompType};

    #[test]
    fn test_if_then_else_structure() {
        let mut p = ProgramBuilder::new();
        let i1 = p.i1_type();
        p.create_public_function(p.void_type(), &[i1], "f").unwrap();
        let cond = p.get_function_arguments(p.current_function())[0];

        if_then_else(&mut p, cond, |_| Ok(()), |_| Ok(())).unwrap();
        p.ret().unwrap();

        let program = p.build();
        let func = program.function("f").unwrap();
        verify::verify_terminators(func).unwrap();
        assert_eq!(func.blocks.len(), 4);
    }

    #[test]
    fn test_constant_condition_folds_away() {
        let mut p = ProgramBuilder::new();
        p.create_public_function(p.void_type(), &[], "f").unwrap();
        let t = p.const_i1(true);
        let mut ran = false;
        if_then(&mut p, t, |_| {
            ran = true;
            Ok(())
        })
        .unwrap();
        p.ret().unwrap();
        assert!(ran);

        let program = p.build();
        // No extra blocks were created.
        assert_eq!(program.function("f").unwrap().blocks.len(), 1);
    }

    #[test]
    fn test_ternary_yields_phi() {
        let mut p = ProgramBuilder::new();
        let i1 = p.i1_type();
        p.create_public_function(p.i32_type(), &[i1], "f").unwrap();
        let cond = p.get_function_arguments(p.current_function())[0];

        let one = p.const_i32(1);
        let two = p.const_i32(2);
        let out = ternary(&mut p, cond, |_| Ok(vec![one]), |_| Ok(vec![two])).unwrap();
        p.ret_value(out[0]).unwrap();

        let program = p.build();
        let func = program.function("f").unwrap();
        verify::verify_phis(func).unwrap();
    }

    #[test]
    fn test_loop_counts() {
        let mut p = ProgramBuilder::new();
        let i32t = p.i32_type();
        p.create_public_function(p.i32_type(), &[i32t], "f").unwrap();
        let n = p.get_function_arguments(p.current_function())[0];

        let zero = p.const_i32(0);
        let lp = Loop::new(&mut p, &[zero]).unwrap();
        let i = lp.var(0);
        let cond = p.cmp_i32(CompType::Lt, i, n).unwrap();
        lp.enter_body(&mut p, cond).unwrap();
        let one = p.const_i32(1);
        let next = p.add_i32(i, one).unwrap();
        lp.continue_with(&mut p, &[next]).unwrap();
        lp.exit(&mut p).unwrap();
        p.ret_value(i).unwrap();

        let program = p.build();
        let func = program.function("f").unwrap();
        verify::verify_terminators(func).unwrap();
        verify::verify_phis(func).unwrap();
    }
}
