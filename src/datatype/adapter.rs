//! Codegen-side wrapper over a data type descriptor.
//!
//! Presents uniform serialize / summary / retain / release operations to the
//! rest of the generator, generates the entry points the type module did not
//! provide, and reconciles the platform ABI lowering of values crossing a
//! function boundary with the canonical in-memory form held in port slots.

use std::collections::HashSet;

use crate::datatype::{DataType, Lowering};
use crate::error::Issue;
use crate::ir::types::{Module, Operand, RtOp};
use crate::codegen::builder::FunctionBuilder;

pub struct TypeAdapter<'a> {
    pub ty: &'a DataType,
}

impl<'a> TypeAdapter<'a> {
    pub fn new(ty: &'a DataType) -> Self {
        TypeAdapter { ty }
    }

    pub fn storage_size(&self) -> u64 {
        self.ty.storage_size
    }

    fn unsupported(&self, detail: &str) -> Issue {
        Issue::error(
            "Unsupported composition layout",
            format!("cannot lower type '{}': {detail}", self.ty.name),
        )
    }

    /// How many call arguments one value of this type occupies.
    pub fn lowered_param_count(&self, unlowered_struct_pointer: bool) -> u32 {
        match self.ty.lowering {
            Lowering::SplitPair if !unlowered_struct_pointer => 2,
            _ => 1,
        }
    }

    /// Lower the value held at `ptr` into call arguments.
    pub fn convert_port_data_to_args(
        &self,
        b: &mut FunctionBuilder,
        ptr: Operand,
        unlowered_struct_pointer: bool,
    ) -> Result<Vec<Operand>, Issue> {
        match self.ty.lowering {
            Lowering::Scalar => {
                if self.ty.storage_size > 8 {
                    return Err(self.unsupported("scalar wider than one word"));
                }
                Ok(vec![b.rt(RtOp::LoadWord, vec![ptr, Operand::uint(0)])])
            }
            Lowering::SplitPair => {
                if unlowered_struct_pointer {
                    // The callee did not lower this struct; pass the pointer
                    // through unchanged.
                    return Ok(vec![ptr]);
                }
                if self.ty.storage_size != 16 {
                    return Err(self.unsupported("split pair must be exactly two words"));
                }
                let low = b.rt(RtOp::LoadWord, vec![ptr.clone(), Operand::uint(0)]);
                let high = b.rt(RtOp::LoadWord, vec![ptr, Operand::uint(8)]);
                Ok(vec![low, high])
            }
            Lowering::ByvalPtr | Lowering::SretOut => {
                // By-value semantics: the callee sees a private copy.
                let copy = b.rt(RtOp::Alloc, vec![Operand::uint(self.ty.storage_size)]);
                b.rt_void(
                    RtOp::CopyBytes,
                    vec![copy.clone(), ptr, Operand::uint(self.ty.storage_size)],
                );
                Ok(vec![copy])
            }
        }
    }

    /// The inverse: reassemble call arguments into the canonical form at
    /// `dest`. Split pairs are recombined by byte-wise copy.
    pub fn convert_call_args_to_port_data(
        &self,
        b: &mut FunctionBuilder,
        args: &[Operand],
        unlowered_struct_pointer: bool,
        dest: Operand,
    ) -> Result<(), Issue> {
        match self.ty.lowering {
            Lowering::Scalar => {
                if args.len() != 1 {
                    return Err(self.unsupported("scalar expects one argument"));
                }
                b.rt_void(RtOp::StoreWord, vec![dest, Operand::uint(0), args[0].clone()]);
            }
            Lowering::SplitPair if !unlowered_struct_pointer => {
                if args.len() != 2 {
                    return Err(self.unsupported("split pair expects two arguments"));
                }
                b.rt_void(
                    RtOp::StoreWord,
                    vec![dest.clone(), Operand::uint(0), args[0].clone()],
                );
                b.rt_void(RtOp::StoreWord, vec![dest, Operand::uint(8), args[1].clone()]);
            }
            Lowering::SplitPair | Lowering::ByvalPtr | Lowering::SretOut => {
                if args.len() != 1 {
                    return Err(self.unsupported("struct expects one pointer argument"));
                }
                b.rt_void(
                    RtOp::CopyBytes,
                    vec![dest, args[0].clone(), Operand::uint(self.ty.storage_size)],
                );
            }
        }
        Ok(())
    }

    /// Emit any of the type's entry points that the type module did not
    /// provide, in terms of the provided primitives. Generated helpers take
    /// a single pointer to the canonical form.
    pub fn ensure_helpers(
        &self,
        module: &mut Module,
        emitted: &mut HashSet<String>,
    ) -> Result<(), Issue> {
        if !self.ty.has_string_function {
            let symbol = self.ty.symbol("getString");
            if emitted.insert(symbol.clone()) {
                let mut b = FunctionBuilder::new(&symbol, 1);
                let ptr = b.param(0);
                let args = self.convert_port_data_to_args(&mut b, ptr, false)?;
                let json = b.call(&self.ty.symbol("getJson"), args);
                b.ret(Some(json));
                module.add_function(b.finish());
            }
        }
        if !self.ty.has_interprocess_function {
            let symbol = self.ty.symbol("getInterprocessString");
            if emitted.insert(symbol.clone()) {
                let mut b = FunctionBuilder::new(&symbol, 1);
                let ptr = b.param(0);
                let serialized = self.emit_serialize(&mut b, ptr)?;
                b.ret(Some(serialized));
                module.add_function(b.finish());
            }
        }
        if !self.ty.has_retain_release {
            for operation in ["retain", "release"] {
                let symbol = self.ty.symbol(operation);
                if emitted.insert(symbol.clone()) {
                    // No pointer fields to count; the generated form is empty.
                    let mut b = FunctionBuilder::new(&symbol, 1);
                    b.ret(None);
                    module.add_function(b.finish());
                }
            }
        }
        Ok(())
    }

    /// `value -> serialized JSON text`, owned by the caller.
    pub fn emit_serialize(
        &self,
        b: &mut FunctionBuilder,
        ptr: Operand,
    ) -> Result<Operand, Issue> {
        if self.ty.has_string_function {
            let args = self.convert_port_data_to_args(b, ptr, false)?;
            Ok(b.call(&self.ty.symbol("getString"), args))
        } else {
            Ok(b.call(&self.ty.symbol("getString"), vec![ptr]))
        }
    }

    /// Interprocess serialization, falling back to the ordinary form when
    /// the type module provides none.
    pub fn emit_interprocess_serialize(
        &self,
        b: &mut FunctionBuilder,
        ptr: Operand,
    ) -> Result<Operand, Issue> {
        if self.ty.has_interprocess_function {
            let args = self.convert_port_data_to_args(b, ptr, false)?;
            Ok(b.call(&self.ty.symbol("getInterprocessJson"), args))
        } else {
            Ok(b.call(&self.ty.symbol("getInterprocessString"), vec![ptr]))
        }
    }

    pub fn emit_summary(
        &self,
        b: &mut FunctionBuilder,
        ptr: Operand,
    ) -> Result<Operand, Issue> {
        let args = self.convert_port_data_to_args(b, ptr, false)?;
        Ok(b.call(&self.ty.symbol("getSummary"), args))
    }

    pub fn emit_retain(&self, b: &mut FunctionBuilder, ptr: Operand) -> Result<(), Issue> {
        if self.ty.has_retain_release {
            let args = self.convert_port_data_to_args(b, ptr, false)?;
            b.call_void(&self.ty.symbol("retain"), args);
        } else {
            b.call_void(&self.ty.symbol("retain"), vec![ptr]);
        }
        Ok(())
    }

    pub fn emit_release(&self, b: &mut FunctionBuilder, ptr: Operand) -> Result<(), Issue> {
        if self.ty.has_retain_release {
            let args = self.convert_port_data_to_args(b, ptr, false)?;
            b.call_void(&self.ty.symbol("release"), args);
        } else {
            b.call_void(&self.ty.symbol("release"), vec![ptr]);
        }
        Ok(())
    }

    /// `JSON text -> value` written through `dest`, retained for the slot.
    pub fn emit_deserialize_and_retain(
        &self,
        b: &mut FunctionBuilder,
        json: Operand,
        dest: Operand,
    ) -> Result<(), Issue> {
        b.call_void(&self.ty.symbol("makeFromJson"), vec![json, dest.clone()]);
        self.emit_retain(b, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;

    #[test]
    fn scalar_lowers_to_one_word() {
        let ty = DataType::new("integer", Lowering::Scalar, 8);
        let adapter = TypeAdapter::new(&ty);
        let mut b = FunctionBuilder::new("f", 1);
        let ptr = b.param(0);
        let args = adapter.convert_port_data_to_args(&mut b, ptr, false).unwrap();
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn split_pair_lowers_to_two_words_unless_unlowered() {
        let ty = DataType::new("range", Lowering::SplitPair, 16);
        let adapter = TypeAdapter::new(&ty);
        let mut b = FunctionBuilder::new("f", 1);
        let ptr = b.param(0);
        let lowered = adapter.convert_port_data_to_args(&mut b, ptr.clone(), false).unwrap();
        assert_eq!(lowered.len(), 2);
        let unlowered = adapter.convert_port_data_to_args(&mut b, ptr.clone(), true).unwrap();
        assert_eq!(unlowered, vec![ptr]);
    }

    #[test]
    fn bad_split_pair_width_is_unsupported() {
        let ty = DataType::new("odd", Lowering::SplitPair, 24);
        let adapter = TypeAdapter::new(&ty);
        let mut b = FunctionBuilder::new("f", 1);
        let ptr = b.param(0);
        let error = adapter
            .convert_port_data_to_args(&mut b, ptr, false)
            .expect_err("24-byte split pair");
        assert!(error.details.contains("odd"));
    }

    #[test]
    fn missing_helpers_are_generated_once() {
        let ty = DataType::new("integer", Lowering::Scalar, 8);
        let adapter = TypeAdapter::new(&ty);
        let mut module = Module::new("composition");
        let mut emitted = HashSet::new();
        adapter.ensure_helpers(&mut module, &mut emitted).unwrap();
        adapter.ensure_helpers(&mut module, &mut emitted).unwrap();
        assert!(module.function("integer_getString").is_some());
        assert!(module.function("integer_getInterprocessString").is_some());
        assert!(module.function("integer_retain").is_some());
        assert!(module.function("integer_release").is_some());
    }
}
