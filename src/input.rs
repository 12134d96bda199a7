//! Parsed input model.
//!
//! The Frontend parses object files and resolves symbols before the writer
//! runs; these are the structures it hands over. Each chunk carries a `live`
//! flag (dead-code elimination has already run), its relocations, and its
//! raw body bytes. The writer assigns the final index fields but leaves
//! payloads untouched until serialization.

use crate::symbol::SymbolId;
use crate::wasm::{Global, Relocation, Signature};

/// One parsed object file.
pub struct ObjectFile {
    pub name: String,
    pub functions: Vec<InputFunction>,
    pub globals: Vec<InputGlobal>,
    pub segments: Vec<InputSegment>,
    pub custom_sections: Vec<InputSection>,
    /// The file's type section.
    pub types: Vec<Signature>,
    /// Which local types are referenced by a `TYPE_INDEX_LEB` relocation.
    pub type_is_used: Vec<bool>,
    /// Local type index -> output type index, filled in by the writer.
    pub type_map: Vec<u32>,
    /// The file's symbol table view; relocation indices point here.
    pub symbols: Vec<SymbolId>,
    /// Init functions from the file's linking metadata.
    pub init_functions: Vec<InitFunc>,
    /// Platform metadata: ABI JSON fragment, may be empty.
    pub snax_abi: String,
    /// Platform metadata: `"actname:funcname"` entries.
    pub snax_actions: Vec<String>,
    /// Platform metadata: `"codename::actname:funcname"` entries.
    pub snax_notify: Vec<String>,
}

impl ObjectFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            segments: Vec::new(),
            custom_sections: Vec::new(),
            types: Vec::new(),
            type_is_used: Vec::new(),
            type_map: Vec::new(),
            symbols: Vec::new(),
            init_functions: Vec::new(),
            snax_abi: String::new(),
            snax_actions: Vec::new(),
            snax_notify: Vec::new(),
        }
    }

    /// Resolve a relocation's symbol index against this file.
    pub fn symbol(&self, index: u32) -> Option<SymbolId> {
        self.symbols.get(index as usize).copied()
    }
}

/// An init function entry from the linking metadata: `symbol` indexes the
/// file's symbol list and must name a `() -> ()` function.
#[derive(Clone, Copy, Debug)]
pub struct InitFunc {
    pub priority: u32,
    pub symbol: u32,
}

/// A function body from an object file. `body` holds the complete code
/// section entry: the ULEB size prefix followed by locals and code.
/// Relocation offsets are relative to the start of `body`.
pub struct InputFunction {
    pub name: String,
    /// Prettified name from debug info, preferred in the "name" section.
    pub debug_name: String,
    pub signature: Signature,
    pub body: Vec<u8>,
    pub relocations: Vec<Relocation>,
    /// Comdat group name, empty if none.
    pub comdat: String,
    pub live: bool,
    pub function_index: Option<u32>,
}

impl InputFunction {
    pub fn new(name: impl Into<String>, signature: Signature, body: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            debug_name: String::new(),
            signature,
            body,
            relocations: Vec::new(),
            comdat: String::new(),
            live: true,
            function_index: None,
        }
    }

    /// A synthetic function whose body the writer fills in later.
    pub fn synthetic(name: impl Into<String>, signature: Signature) -> Self {
        Self::new(name, signature, Vec::new())
    }
}

/// A global definition from an object file.
pub struct InputGlobal {
    pub name: String,
    pub global: Global,
    pub live: bool,
    pub global_index: Option<u32>,
}

impl InputGlobal {
    pub fn new(name: impl Into<String>, global: Global) -> Self {
        Self { name: name.into(), global, live: true, global_index: None }
    }
}

/// A data segment from an object file.
pub struct InputSegment {
    pub name: String,
    /// Byte alignment, a power of two.
    pub alignment: u32,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub comdat: String,
    pub live: bool,
    /// Index of the output segment this was appended to.
    pub output_segment: Option<u32>,
    /// Offset within that output segment.
    pub output_offset: u32,
}

impl InputSegment {
    pub fn new(name: impl Into<String>, alignment: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            alignment,
            data,
            relocations: Vec::new(),
            comdat: String::new(),
            live: true,
            output_segment: None,
            output_offset: 0,
        }
    }
}

/// A custom section from an object file, passed through by name.
pub struct InputSection {
    pub name: String,
    pub data: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub live: bool,
}

impl InputSection {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { name: name.into(), data, relocations: Vec::new(), live: true }
    }
}
