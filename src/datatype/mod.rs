//! Port data type descriptors.
//!
//! Each data type used by a port is described externally: the entry points
//! its compiled type module provides, and the facts about how the platform
//! ABI lowers the type when it crosses a function boundary. The codegen-side
//! wrapper that turns these descriptors into marshalling code lives in
//! [`adapter`].

pub mod adapter;

use std::collections::BTreeMap;

/// How values of a type are lowered when passed to an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lowering {
    /// A single scalar or pointer-sized argument.
    Scalar,
    /// A struct lowered to two successive word arguments; reassembled by
    /// byte-wise copy into a local of the canonical type.
    SplitPair,
    /// A struct passed by reference with by-value semantics.
    ByvalPtr,
    /// A struct returned through a caller-allocated out-parameter.
    SretOut,
}

/// Descriptor for one port data type.
///
/// `make_from_json` always takes `(json, out)` with the deserialized value
/// written through the out-pointer; the remaining entry points take the
/// value lowered per `lowering`.
#[derive(Debug, Clone)]
pub struct DataType {
    pub name: String,
    pub lowering: Lowering,
    /// Bytes of the canonical in-memory form.
    pub storage_size: u64,
    /// Whether the type module provides `<name>_retain` / `<name>_release`.
    pub has_retain_release: bool,
    /// Whether the type module provides `<name>_getString`.
    pub has_string_function: bool,
    /// Whether the type module provides `<name>_getInterprocessJson`.
    pub has_interprocess_function: bool,
    /// Whether the type module provides `areEqual` / `isLessThan`.
    pub supports_comparison: bool,
    /// JSON default used when a port of this type declares no initial value.
    pub default_json: String,
}

impl DataType {
    pub fn new(name: &str, lowering: Lowering, storage_size: u64) -> Self {
        DataType {
            name: name.to_string(),
            lowering,
            storage_size,
            has_retain_release: false,
            has_string_function: false,
            has_interprocess_function: false,
            supports_comparison: false,
            default_json: "null".to_string(),
        }
    }

    pub fn with_retain_release(mut self) -> Self {
        self.has_retain_release = true;
        self
    }

    pub fn with_string_function(mut self) -> Self {
        self.has_string_function = true;
        self
    }

    pub fn with_interprocess(mut self) -> Self {
        self.has_interprocess_function = true;
        self
    }

    pub fn with_comparison(mut self) -> Self {
        self.supports_comparison = true;
        self
    }

    pub fn with_default_json(mut self, json: &str) -> Self {
        self.default_json = json.to_string();
        self
    }

    /// Offset in bytes between successive values, including padding.
    pub fn allocation_size(&self) -> u64 {
        self.storage_size.div_ceil(8) * 8
    }

    /// Symbol of one of the type module's entry points.
    pub fn symbol(&self, operation: &str) -> String {
        format!("{}_{}", self.name, operation)
    }
}

/// The set of data types known to one code-generation pass, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, DataType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry { types: BTreeMap::new() }
    }

    pub fn register(&mut self, data_type: DataType) {
        self.types.insert(data_type.name.clone(), data_type);
    }

    pub fn get(&self, name: &str) -> Option<&DataType> {
        self.types.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_size_rounds_up_to_word() {
        let t = DataType::new("color", Lowering::ByvalPtr, 12);
        assert_eq!(t.storage_size, 12);
        assert_eq!(t.allocation_size(), 16);
    }

    #[test]
    fn registry_lookup() {
        let mut registry = TypeRegistry::new();
        registry.register(DataType::new("integer", Lowering::Scalar, 8));
        assert!(registry.get("integer").is_some());
        assert!(registry.get("real").is_none());
    }
}
