//! Scalar expression evaluation
//!
//! Computes a typed plan expression into IR, reading child operator outputs
//! and the enclosing translator's virtual slots. Three-valued logic is
//! honoured for AND/OR; every other operator propagates null as
//! "any input null -> output null".

use veld_catalog::SqlType;
use veld_common::{VeldError, VeldResult};
use veld_ir::{CompType, FunctionRef, ProgramBuilder, Value};
use veld_plan::{BinaryOp, Expr, Literal, UnaryOp};

use crate::runtime_fns::RuntimeFunctions;
use crate::values::{IrVal, SqlValue};

/// Value environment for one `compute` call.
pub struct ExprEnv<'a> {
    pub children: &'a [&'a crate::values::SchemaValues],
    pub virtuals: &'a crate::values::SchemaValues,
}

pub struct ExprTranslator<'a> {
    pub p: &'a mut ProgramBuilder,
    pub rt: &'a RuntimeFunctions,
    /// Host-compiled regexes kept alive for the query's lifetime.
    pub regexes: &'a mut Vec<Box<regex::bytes::Regex>>,
}

impl<'a> ExprTranslator<'a> {
    pub fn compute(&mut self, expr: &Expr, env: &ExprEnv) -> VeldResult<SqlValue> {
        match expr {
            Expr::ColumnRef { child, column, .. } => Ok(env.children[*child].get(*column)),
            Expr::VirtualColumnRef { column, .. } => Ok(env.virtuals.get(*column)),
            Expr::Literal(lit) => self.literal(lit),

            Expr::Unary { op, expr } => {
                let value = self.compute(expr, env)?;
                match op {
                    UnaryOp::Not => {
                        let v = self.p.lnot_i1(value.val.raw())?;
                        Ok(SqlValue::new(IrVal::Bool(v), value.null))
                    }
                    UnaryOp::IsNull => Ok(SqlValue::not_null(IrVal::Bool(value.null), self.p)),
                }
            }

            Expr::Binary { op, ty, left, right, .. } => {
                let l = self.compute(left, env)?;
                let r = self.compute(right, env)?;
                self.binary(*op, *ty, l, r)
            }

            Expr::Case { ty, branches, else_expr, .. } => {
                self.case(*ty, branches, else_expr.as_deref(), env)
            }

            Expr::Aggregate { .. } => Err(VeldError::codegen_error(
                "aggregate outside an aggregation operator",
            )),

            Expr::In { expr, list } => self.in_list(expr, list, env),

            Expr::ExtractYear { expr } => {
                let value = self.compute(expr, env)?;
                let year = self.p.call(self.rt.date_extract_year, &[value.val.raw()])?;
                Ok(SqlValue::new(IrVal::I32(year), value.null))
            }

            Expr::Regexp { expr, pattern } => {
                let value = self.compute(expr, env)?;
                let re = regex::bytes::Regex::new(pattern).map_err(|e| {
                    VeldError::plan_error(format!("bad regex '{pattern}': {e}"))
                })?;
                let boxed = Box::new(re);
                let addr = boxed.as_ref() as *const regex::bytes::Regex as usize;
                self.regexes.push(boxed);
                let i8_ty = self.p.i8_type();
                let ptr_ty = self.p.pointer_type(i8_ty);
                let re_ptr = self.p.ptr_const(addr, ptr_ty);
                let hit = self.p.call(self.rt.string_regex, &[value.val.raw(), re_ptr])?;
                Ok(SqlValue::new(IrVal::Bool(hit), value.null))
            }
        }
    }

    pub fn literal(&mut self, lit: &Literal) -> VeldResult<SqlValue> {
        let p = &mut *self.p;
        Ok(match lit {
            Literal::SmallInt(v) => SqlValue::not_null(IrVal::I16(p.const_i16(*v)), p),
            Literal::Int(v) => SqlValue::not_null(IrVal::I32(p.const_i32(*v)), p),
            Literal::BigInt(v) => SqlValue::not_null(IrVal::I64(p.const_i64(*v)), p),
            Literal::Real(v) => SqlValue::not_null(IrVal::F64(p.const_f64(*v)), p),
            Literal::Bool(v) => SqlValue::not_null(IrVal::Bool(p.const_i1(*v)), p),
            Literal::Date(jd) => SqlValue::not_null(IrVal::Date(p.const_i32(*jd)), p),
            Literal::Text(s) => {
                let view = self.global_string(s)?;
                SqlValue::not_null(IrVal::Str(view), self.p)
            }
            Literal::Null(ty) => {
                let value = crate::values::default_value(*ty, p);
                let null = p.const_i1(true);
                SqlValue::new(value.val, null)
            }
        })
    }

    /// A string literal as a pointer to a global `StringView`.
    pub fn global_string(&mut self, s: &str) -> VeldResult<Value> {
        let p = &mut *self.p;
        let data = p.global_const_char_array(s);
        let len = p.const_i32(s.len() as i32);
        let init = p.constant_struct(self.rt.types.string_view, &[data, len]);
        Ok(p.global(self.rt.types.string_view, init))
    }

    fn binary(&mut self, op: BinaryOp, ty: SqlType, l: SqlValue, r: SqlValue) -> VeldResult<SqlValue> {
        match op {
            BinaryOp::And | BinaryOp::Or => self.three_valued_logic(op, l, r),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let null = self.p.or_i1(l.null, r.null)?;
                let val = self.arithmetic(op, ty, l.val, r.val)?;
                Ok(SqlValue::new(val, null))
            }
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Leq | BinaryOp::Gt
            | BinaryOp::Geq => {
                let null = self.p.or_i1(l.null, r.null)?;
                let val = self.comparison(op, l.val, r.val)?;
                Ok(SqlValue::new(IrVal::Bool(val), null))
            }
            BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Contains | BinaryOp::Like => {
                let null = self.p.or_i1(l.null, r.null)?;
                let f = match op {
                    BinaryOp::StartsWith => self.rt.string_starts_with,
                    BinaryOp::EndsWith => self.rt.string_ends_with,
                    BinaryOp::Contains => self.rt.string_contains,
                    _ => self.rt.string_like,
                };
                let hit = self.p.call(f, &[l.val.raw(), r.val.raw()])?;
                Ok(SqlValue::new(IrVal::Bool(hit), null))
            }
        }
    }

    /// SQL three-valued AND/OR: a definite false (AND) or true (OR)
    /// dominates a NULL side.
    fn three_valued_logic(&mut self, op: BinaryOp, l: SqlValue, r: SqlValue) -> VeldResult<SqlValue> {
        let p = &mut *self.p;
        let (lv, rv) = (l.val.raw(), r.val.raw());
        match op {
            BinaryOp::And => {
                let val = p.and_i1(lv, rv)?;
                // null unless either side is a definite false
                let r_def = p.or_i1(r.null, rv)?;
                let l_side = p.and_i1(l.null, r_def)?;
                let l_def = p.or_i1(l.null, lv)?;
                let r_side = p.and_i1(r.null, l_def)?;
                let null = p.or_i1(l_side, r_side)?;
                Ok(SqlValue::new(IrVal::Bool(val), null))
            }
            _ => {
                let val = p.or_i1(lv, rv)?;
                // null unless either side is a definite true
                let r_not = p.lnot_i1(rv)?;
                let r_def = p.or_i1(r.null, r_not)?;
                let l_side = p.and_i1(l.null, r_def)?;
                let l_not = p.lnot_i1(lv)?;
                let l_def = p.or_i1(l.null, l_not)?;
                let r_side = p.and_i1(r.null, l_def)?;
                let null = p.or_i1(l_side, r_side)?;
                Ok(SqlValue::new(IrVal::Bool(val), null))
            }
        }
    }

    fn arithmetic(&mut self, op: BinaryOp, ty: SqlType, l: IrVal, r: IrVal) -> VeldResult<IrVal> {
        if op == BinaryOp::Div || ty == SqlType::Real {
            let lf = self.to_f64(l)?;
            let rf = self.to_f64(r)?;
            let p = &mut *self.p;
            let v = match op {
                BinaryOp::Add => p.add_f64(lf, rf)?,
                BinaryOp::Sub => p.sub_f64(lf, rf)?,
                BinaryOp::Mul => p.mul_f64(lf, rf)?,
                _ => p.div_f64(lf, rf)?,
            };
            return Ok(IrVal::F64(v));
        }

        // Same-width fast path, otherwise widen both sides to i64 and
        // narrow the result to the promoted type.
        if l.sql_type() == r.sql_type() && l.sql_type() == ty {
            let p = &mut *self.p;
            let (a, b) = (l.raw(), r.raw());
            let v = match (ty, op) {
                (SqlType::SmallInt, BinaryOp::Add) => p.add_i16(a, b)?,
                (SqlType::SmallInt, BinaryOp::Sub) => p.sub_i16(a, b)?,
                (SqlType::SmallInt, BinaryOp::Mul) => p.mul_i16(a, b)?,
                (SqlType::Int, BinaryOp::Add) => p.add_i32(a, b)?,
                (SqlType::Int, BinaryOp::Sub) => p.sub_i32(a, b)?,
                (SqlType::Int, BinaryOp::Mul) => p.mul_i32(a, b)?,
                (SqlType::BigInt, BinaryOp::Add) => p.add_i64(a, b)?,
                (SqlType::BigInt, BinaryOp::Sub) => p.sub_i64(a, b)?,
                (SqlType::BigInt, BinaryOp::Mul) => p.mul_i64(a, b)?,
                _ => return Err(VeldError::codegen_error("bad arithmetic type")),
            };
            return Ok(IrVal::from_sql_type(ty, v));
        }

        let lw = self.to_i64(l)?;
        let rw = self.to_i64(r)?;
        let p = &mut *self.p;
        let wide = match op {
            BinaryOp::Add => p.add_i64(lw, rw)?,
            BinaryOp::Sub => p.sub_i64(lw, rw)?,
            BinaryOp::Mul => p.mul_i64(lw, rw)?,
            _ => unreachable!(),
        };
        Ok(match ty {
            SqlType::SmallInt => IrVal::I16(p.i16_trunc_i64(wide)?),
            SqlType::Int => IrVal::I32(p.i32_trunc_i64(wide)?),
            SqlType::BigInt => IrVal::I64(wide),
            _ => return Err(VeldError::codegen_error("bad promoted type")),
        })
    }

    fn comparison(&mut self, op: BinaryOp, l: IrVal, r: IrVal) -> VeldResult<Value> {
        let cmp = match op {
            BinaryOp::Eq => CompType::Eq,
            BinaryOp::Neq => CompType::Ne,
            BinaryOp::Lt => CompType::Lt,
            BinaryOp::Leq => CompType::Le,
            BinaryOp::Gt => CompType::Gt,
            _ => CompType::Ge,
        };

        // Text comparisons go through the runtime.
        if let (IrVal::Str(a), IrVal::Str(b)) = (l, r) {
            return self.string_comparison(cmp, a, b);
        }

        // Real comparison when either side is floating.
        if matches!(l, IrVal::F64(_)) || matches!(r, IrVal::F64(_)) {
            let a = self.to_f64(l)?;
            let b = self.to_f64(r)?;
            return self.p.cmp_f64(cmp, a, b);
        }

        match (l, r) {
            (IrVal::Bool(a), IrVal::Bool(b)) => self.p.cmp_i1(cmp, a, b),
            (IrVal::Date(a), IrVal::Date(b)) => self.p.cmp_i32(cmp, a, b),
            (IrVal::I16(a), IrVal::I16(b)) => self.p.cmp_i16(cmp, a, b),
            (IrVal::I32(a), IrVal::I32(b)) => self.p.cmp_i32(cmp, a, b),
            (IrVal::I64(a), IrVal::I64(b)) => self.p.cmp_i64(cmp, a, b),
            _ => {
                // Mixed integer widths compare at 64 bits.
                let a = self.to_i64(l)?;
                let b = self.to_i64(r)?;
                self.p.cmp_i64(cmp, a, b)
            }
        }
    }

    fn string_comparison(&mut self, cmp: CompType, a: Value, b: Value) -> VeldResult<Value> {
        let p_eq = self.rt.string_equals;
        let p_lt = self.rt.string_less_than;
        let p = &mut *self.p;
        match cmp {
            CompType::Eq => p.call(p_eq, &[a, b]),
            CompType::Ne => {
                let eq = p.call(p_eq, &[a, b])?;
                p.lnot_i1(eq)
            }
            CompType::Lt => p.call(p_lt, &[a, b]),
            CompType::Gt => p.call(p_lt, &[b, a]),
            CompType::Le => {
                let gt = p.call(p_lt, &[b, a])?;
                p.lnot_i1(gt)
            }
            CompType::Ge => {
                let lt = p.call(p_lt, &[a, b])?;
                p.lnot_i1(lt)
            }
        }
    }

    /// CASE lowers to a chain of diamonds, one per WHEN branch; a null
    /// condition falls through to the next branch. Both arms phi into the
    /// result type.
    fn case(
        &mut self,
        ty: SqlType,
        branches: &[(Expr, Expr)],
        else_expr: Option<&Expr>,
        env: &ExprEnv,
    ) -> VeldResult<SqlValue> {
        let (cond_expr, then_expr) = &branches[0];
        let cond = self.compute(cond_expr, env)?;
        let not_null = self.p.lnot_i1(cond.null)?;
        let takes = self.p.and_i1(cond.val.raw(), not_null)?;

        let rest = |this: &mut Self, env: &ExprEnv| -> VeldResult<SqlValue> {
            if branches.len() > 1 {
                this.case(ty, &branches[1..], else_expr, env)
            } else if let Some(e) = else_expr {
                let v = this.compute(e, env)?;
                this.unify(v, ty)
            } else {
                this.literal(&Literal::Null(ty))
            }
        };

        if let Some(c) = self.p.get_i1_constant(takes) {
            return if c {
                let v = self.compute(then_expr, env)?;
                self.unify(v, ty)
            } else {
                rest(self, env)
            };
        }

        let then_block = self.p.create_block();
        let else_block = self.p.create_block();
        let dest_block = self.p.create_block();
        self.p.cond_branch(takes, then_block, else_block)?;

        self.p.set_current_block(then_block)?;
        let then_v = self.compute(then_expr, env)?;
        let then_v = self.unify(then_v, ty)?;
        let val_ty = self.p.type_of(then_v.val.raw());
        let then_val = self.p.phi_member(then_v.val.raw())?;
        let then_null = self.p.phi_member(then_v.null)?;
        self.p.branch(dest_block)?;

        self.p.set_current_block(else_block)?;
        let else_v = rest(self, env)?;
        let else_v = self.unify(else_v, ty)?;
        let else_val = self.p.phi_member(else_v.val.raw())?;
        let else_null = self.p.phi_member(else_v.null)?;
        self.p.branch(dest_block)?;

        self.p.set_current_block(dest_block)?;
        let val_phi = self.p.phi(val_ty)?;
        self.p.update_phi_member(val_phi, then_val);
        self.p.update_phi_member(val_phi, else_val);
        let i1 = self.p.i1_type();
        let null_phi = self.p.phi(i1)?;
        self.p.update_phi_member(null_phi, then_null);
        self.p.update_phi_member(null_phi, else_null);

        Ok(SqlValue::new(IrVal::from_sql_type(ty, val_phi), null_phi))
    }

    /// Widens a branch value to the CASE result type when they differ.
    fn unify(&mut self, value: SqlValue, ty: SqlType) -> VeldResult<SqlValue> {
        if value.ty() == ty {
            Ok(value)
        } else {
            self.cast(value, ty)
        }
    }

    fn in_list(&mut self, expr: &Expr, list: &[Literal], env: &ExprEnv) -> VeldResult<SqlValue> {
        let value = self.compute(expr, env)?;

        // Small integer lists compare against a constant vector lane-wise.
        let as_i32 = |lit: &Literal| -> Option<i32> {
            match lit {
                Literal::SmallInt(v) => Some(*v as i32),
                Literal::Int(v) => Some(*v),
                Literal::Date(v) => Some(*v),
                _ => None,
            }
        };
        let ints: Option<Vec<i32>> = list.iter().map(as_i32).collect();
        if let (Some(ints), IrVal::I32(v) | IrVal::Date(v)) = (&ints, value.val) {
            if !ints.is_empty() && ints.len() <= 8 {
                let p = &mut *self.p;
                let hit = if ints.len() <= 4 {
                    let mut lanes = [ints[0]; 4];
                    lanes[..ints.len()].copy_from_slice(ints);
                    let vec = p.const_i32_vec4(lanes);
                    p.i32_cmp_eq_any_vec4(v, vec)?
                } else {
                    let mut lanes = [ints[0]; 8];
                    lanes[..ints.len()].copy_from_slice(ints);
                    let vec = p.const_i32_vec8(lanes);
                    p.i32_cmp_eq_any_vec8(v, vec)?
                };
                return Ok(SqlValue::new(IrVal::Bool(hit), value.null));
            }
        }

        // General case: a fold of equalities.
        let mut hit = self.p.const_i1(false);
        for lit in list {
            let rhs = self.literal(lit)?;
            let eq = self.comparison(BinaryOp::Eq, value.val, rhs.val)?;
            hit = self.p.or_i1(hit, eq)?;
        }
        Ok(SqlValue::new(IrVal::Bool(hit), value.null))
    }

    pub fn to_f64(&mut self, v: IrVal) -> VeldResult<Value> {
        let p = &mut *self.p;
        match v {
            IrVal::F64(x) => Ok(x),
            IrVal::I16(x) => p.f64_conv_i16(x),
            IrVal::I32(x) | IrVal::Date(x) => p.f64_conv_i32(x),
            IrVal::I64(x) => p.f64_conv_i64(x),
            _ => Err(VeldError::codegen_error("cannot convert to f64")),
        }
    }

    pub fn to_i64(&mut self, v: IrVal) -> VeldResult<Value> {
        let p = &mut *self.p;
        match v {
            IrVal::I64(x) => Ok(x),
            IrVal::I16(x) => p.i64_sext_i16(x),
            IrVal::I32(x) | IrVal::Date(x) => p.i64_sext_i32(x),
            IrVal::Bool(x) => p.i64_zext_i1(x),
            _ => Err(VeldError::codegen_error("cannot convert to i64")),
        }
    }

    /// Widens/converts a value to the target SQL type.
    pub fn cast(&mut self, value: SqlValue, to: SqlType) -> VeldResult<SqlValue> {
        if value.ty() == to {
            return Ok(value);
        }
        let val = match to {
            SqlType::Real => IrVal::F64(self.to_f64(value.val)?),
            SqlType::BigInt => IrVal::I64(self.to_i64(value.val)?),
            SqlType::Int => {
                let wide = self.to_i64(value.val)?;
                IrVal::I32(self.p.i32_trunc_i64(wide)?)
            }
            _ => {
                return Err(VeldError::codegen_error(format!(
                    "unsupported cast from {} to {to}",
                    value.ty()
                )))
            }
        };
        Ok(SqlValue::new(val, value.null))
    }

    pub fn runtime(&self) -> &RuntimeFunctions {
        self.rt
    }

    pub fn call(&mut self, f: FunctionRef, args: &[Value]) -> VeldResult<Value> {
        self.p.call(f, args)
    }
}
