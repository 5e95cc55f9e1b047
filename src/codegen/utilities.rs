//! Generic dispatch-ladder emission: runtime lookup of ports and nodes by
//! string or index compiles into a chain of comparisons. Composition sizes
//! are bounded in practice and the constants cache de-duplicates the keys.

use crate::codegen::builder::FunctionBuilder;
use crate::codegen::Generator;
use crate::ir::types::{BinOp, Operand};

/// Emit `if (scrutinee == key(case0)) { body(case0) } else if …` over the
/// cases, interning each key string.
pub(crate) fn emit_string_ladder<'a, T>(
    gen_: &mut Generator<'a>,
    b: &mut FunctionBuilder,
    scrutinee: &Operand,
    cases: &[T],
    key: &dyn Fn(&T) -> String,
    body: &mut dyn FnMut(&mut Generator<'a>, &mut FunctionBuilder, &T),
) {
    string_ladder_from(gen_, b, scrutinee, cases, 0, key, body);
}

fn string_ladder_from<'a, T>(
    gen_: &mut Generator<'a>,
    b: &mut FunctionBuilder,
    scrutinee: &Operand,
    cases: &[T],
    index: usize,
    key: &dyn Fn(&T) -> String,
    body: &mut dyn FnMut(&mut Generator<'a>, &mut FunctionBuilder, &T),
) {
    if index >= cases.len() {
        return;
    }
    let key_operand = gen_.intern(&key(&cases[index]));
    let cond = b.bin(BinOp::Eq, scrutinee.clone(), key_operand);
    b.begin_nested();
    body(gen_, b, &cases[index]);
    let then_body = b.end_nested();
    b.begin_nested();
    string_ladder_from(gen_, b, scrutinee, cases, index + 1, key, body);
    let else_body = b.end_nested();
    b.push_if(cond, then_body, else_body);
}

/// The index-keyed counterpart, used for node and type dispatch.
pub(crate) fn emit_index_ladder<'a, T>(
    gen_: &mut Generator<'a>,
    b: &mut FunctionBuilder,
    scrutinee: &Operand,
    cases: &[T],
    key: &dyn Fn(&T) -> u64,
    body: &mut dyn FnMut(&mut Generator<'a>, &mut FunctionBuilder, &T),
) {
    index_ladder_from(gen_, b, scrutinee, cases, 0, key, body);
}

fn index_ladder_from<'a, T>(
    gen_: &mut Generator<'a>,
    b: &mut FunctionBuilder,
    scrutinee: &Operand,
    cases: &[T],
    index: usize,
    key: &dyn Fn(&T) -> u64,
    body: &mut dyn FnMut(&mut Generator<'a>, &mut FunctionBuilder, &T),
) {
    if index >= cases.len() {
        return;
    }
    let cond = b.bin(BinOp::Eq, scrutinee.clone(), Operand::uint(key(&cases[index])));
    b.begin_nested();
    body(gen_, b, &cases[index]);
    let then_body = b.end_nested();
    b.begin_nested();
    index_ladder_from(gen_, b, scrutinee, cases, index + 1, key, body);
    let else_body = b.end_nested();
    b.push_if(cond, then_body, else_body);
}
