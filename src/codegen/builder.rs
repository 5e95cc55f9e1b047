//! Register- and structure-aware builder for one module function.

use crate::ir::types::{
    BinOp, Callee, Function, FunctionBody, Instr, Operand, Reg, RtOp,
};

/// Builds a function body instruction by instruction. `If`/`While` bodies
/// nest through a stack of instruction lists.
pub struct FunctionBuilder {
    name: String,
    param_count: u32,
    next_reg: u32,
    annotations: Vec<Vec<String>>,
    stack: Vec<Vec<Instr>>,
}

impl FunctionBuilder {
    pub fn new(name: &str, param_count: u32) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            param_count,
            next_reg: param_count,
            annotations: vec![Vec::new(); param_count as usize],
            stack: vec![Vec::new()],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_annotations(&mut self, annotations: Vec<Vec<String>>) {
        assert_eq!(annotations.len(), self.param_count as usize);
        self.annotations = annotations;
    }

    pub fn param(&self, index: u32) -> Operand {
        debug_assert!(index < self.param_count);
        Operand::reg(index)
    }

    pub fn fresh(&mut self) -> Reg {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    pub fn push(&mut self, instr: Instr) {
        self.stack.last_mut().expect("open body").push(instr);
    }

    pub fn set(&mut self, src: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Set { dst, src });
        Operand::reg(dst)
    }

    pub fn set_into(&mut self, dst: Reg, src: Operand) {
        self.push(Instr::Set { dst, src });
    }

    pub fn bin(&mut self, op: BinOp, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Bin { dst, op, lhs, rhs });
        Operand::reg(dst)
    }

    pub fn not(&mut self, src: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Not { dst, src });
        Operand::reg(dst)
    }

    /// Runtime call producing a value.
    pub fn rt(&mut self, op: RtOp, args: Vec<Operand>) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Rt { dst: Some(dst), op, args });
        Operand::reg(dst)
    }

    /// Runtime call for effect only.
    pub fn rt_void(&mut self, op: RtOp, args: Vec<Operand>) {
        self.push(Instr::Rt { dst: None, op, args });
    }

    pub fn call(&mut self, symbol: &str, args: Vec<Operand>) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Call {
            dst: Some(dst),
            callee: Callee::Named { symbol: symbol.to_string() },
            args,
        });
        Operand::reg(dst)
    }

    pub fn call_void(&mut self, symbol: &str, args: Vec<Operand>) {
        self.push(Instr::Call {
            dst: None,
            callee: Callee::Named { symbol: symbol.to_string() },
            args,
        });
    }

    pub fn call_indirect(&mut self, target: Operand, args: Vec<Operand>) -> Operand {
        let dst = self.fresh();
        self.push(Instr::Call { dst: Some(dst), callee: Callee::Indirect { target }, args });
        Operand::reg(dst)
    }

    pub fn call_indirect_void(&mut self, target: Operand, args: Vec<Operand>) {
        self.push(Instr::Call { dst: None, callee: Callee::Indirect { target }, args });
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Instr::Return { value });
    }

    fn nested(&mut self, build: impl FnOnce(&mut Self)) -> Vec<Instr> {
        self.stack.push(Vec::new());
        build(self);
        self.stack.pop().expect("nested body")
    }

    /// Open a nested body explicitly; pair with `end_nested`. Used where the
    /// branch bodies cannot be built through closures.
    pub fn begin_nested(&mut self) {
        self.stack.push(Vec::new());
    }

    pub fn end_nested(&mut self) -> Vec<Instr> {
        self.stack.pop().expect("nested body")
    }

    pub fn push_if(&mut self, cond: Operand, then_body: Vec<Instr>, else_body: Vec<Instr>) {
        self.push(Instr::If { cond, then_body, else_body });
    }

    pub fn push_while(&mut self, header: Vec<Instr>, cond: Operand, body: Vec<Instr>) {
        self.push(Instr::While { header, cond, body });
    }

    pub fn if_(&mut self, cond: Operand, then: impl FnOnce(&mut Self)) {
        let then_body = self.nested(then);
        self.push(Instr::If { cond, then_body, else_body: Vec::new() });
    }

    pub fn if_else(
        &mut self,
        cond: Operand,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        let then_body = self.nested(then);
        let else_body = self.nested(otherwise);
        self.push(Instr::If { cond, then_body, else_body });
    }

    /// `while`: the header runs before each test of the condition operand.
    pub fn while_(
        &mut self,
        header: impl FnOnce(&mut Self) -> Operand,
        body: impl FnOnce(&mut Self),
    ) {
        self.stack.push(Vec::new());
        let cond = header(self);
        let header_body = self.stack.pop().expect("header body");
        let body_instrs = self.nested(body);
        self.push(Instr::While { header: header_body, cond, body: body_instrs });
    }

    pub fn finish(mut self) -> Function {
        let instrs = self.stack.pop().expect("root body");
        assert!(self.stack.is_empty(), "unbalanced nested bodies");
        Function {
            name: self.name,
            param_count: self.param_count,
            reg_count: self.next_reg,
            annotations: self.annotations,
            body: FunctionBody::Ir { instrs },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_bodies_land_in_if() {
        let mut b = FunctionBuilder::new("f", 1);
        let cond = b.param(0);
        b.if_else(
            cond,
            |b| b.ret(Some(Operand::uint(1))),
            |b| b.ret(Some(Operand::uint(0))),
        );
        let function = b.finish();
        let FunctionBody::Ir { instrs } = &function.body else { panic!("ir body") };
        assert_eq!(instrs.len(), 1);
        match &instrs[0] {
            Instr::If { then_body, else_body, .. } => {
                assert_eq!(then_body.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn fresh_registers_start_after_params() {
        let mut b = FunctionBuilder::new("f", 2);
        assert_eq!(b.fresh(), 2);
        assert_eq!(b.fresh(), 3);
    }
}
