//! Interning of string and index-array constants emitted into the module.
//! Single-threaded during codegen; no locking.

use std::collections::HashMap;

use crate::ir::types::{GlobalValue, Module, Operand};

/// De-duplicates constants, creating one module global per distinct value
/// with a deterministic name prefixed by the module key.
pub struct ConstantsCache {
    prefix: String,
    strings: HashMap<String, String>,
    arrays: HashMap<Vec<u64>, String>,
    counter: usize,
}

impl ConstantsCache {
    pub fn new(module_key: &str) -> Self {
        ConstantsCache {
            prefix: module_key.to_string(),
            strings: HashMap::new(),
            arrays: HashMap::new(),
            counter: 0,
        }
    }

    /// An operand referencing the interned string constant.
    pub fn string(&mut self, module: &mut Module, value: &str) -> Operand {
        if let Some(name) = self.strings.get(value) {
            return Operand::global(name.clone());
        }
        let name = format!("{}__const{}", self.prefix, self.counter);
        self.counter += 1;
        module.set_global(&name, GlobalValue::Str { value: value.to_string() });
        self.strings.insert(value.to_string(), name.clone());
        Operand::global(name)
    }

    /// An operand referencing the interned index-array constant.
    pub fn uint_array(&mut self, module: &mut Module, values: &[u64]) -> Operand {
        if let Some(name) = self.arrays.get(values) {
            return Operand::global(name.clone());
        }
        let name = format!("{}__indices{}", self.prefix, self.counter);
        self.counter += 1;
        module.set_global(&name, GlobalValue::UintList { values: values.to_vec() });
        self.arrays.insert(values.to_vec(), name.clone());
        Operand::global(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_interned_once() {
        let mut module = Module::new("composition");
        let mut cache = ConstantsCache::new("composition");
        let a = cache.string(&mut module, "hello");
        let b = cache.string(&mut module, "hello");
        let c = cache.string(&mut module, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(module.globals.len(), 2);
    }

    #[test]
    fn arrays_are_keyed_by_contents() {
        let mut module = Module::new("composition");
        let mut cache = ConstantsCache::new("composition");
        let a = cache.uint_array(&mut module, &[1, 2, 3]);
        let b = cache.uint_array(&mut module, &[1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(module.globals.len(), 1);
    }
}
