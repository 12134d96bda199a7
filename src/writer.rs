//! The writer pipeline.
//!
//! Runs once per link, in a fixed order: plan indices, synthesize the ctor
//! and dispatch functions, seal the type table, lay out memory, compute
//! exports and the symbol table, then build every section and write them in
//! parallel into the preallocated output buffer. The ABI file is emitted
//! after the module commits.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::debug;

use crate::abi;
use crate::buffer::OutputBuffer;
use crate::config::Config;
use crate::dispatch::DispatchBuilder;
use crate::encoder::{
    patch_sleb128, patch_u32_le, patch_uleb128, write_export, write_global, write_import,
    write_init_expr, write_limits, write_sig, write_str, write_u32_le, write_u8, write_uleb128,
    SubSection,
};
use crate::error::ErrorSink;
use crate::input::InitFunc;
use crate::layout::{output_segment_name, OutputSegment};
use crate::sections::{OutputRelocation, OutputSection};
use crate::symbol::{
    FunctionRef, GlobalRef, SectionRef, SegmentRef, SymbolId, SymbolKind, SymbolTable,
};
use crate::utils::{align_up, demangle_itanium};
use crate::wasm::{
    Export, ExternalKind, Global, GlobalType, Import, ImportKind, InitExpr, Limits, RelocKind,
    Relocation, Signature, ValType, COMDAT_DATA, COMDAT_FUNCTION, LIMITS_HAS_MAX, NAMES_FUNCTION,
    OPCODE_CALL, OPCODE_END, SEC_CODE, SEC_CUSTOM, SEC_DATA, SEC_ELEM, SEC_EXPORT, SEC_FUNCTION,
    SEC_GLOBAL, SEC_IMPORT, SEC_MEMORY, SEC_TABLE, SEC_TYPE, TYPE_ANYFUNC, WASM_COMDAT_INFO,
    WASM_INIT_FUNCS, WASM_MAGIC, WASM_METADATA_VERSION, WASM_PAGE_SIZE, WASM_SEGMENT_INFO,
    WASM_SYMBOL_TABLE, WASM_VERSION,
};

const STACK_ALIGNMENT: u32 = 16;
const INITIAL_TABLE_OFFSET: u32 = 1;
const FUNCTION_TABLE_NAME: &str = "__indirect_function_table";

/// Link the resolved symbol table into `config.output_file`, then emit the
/// sibling `.abi` file if any object contributed ABI data.
pub fn link(symtab: &mut SymbolTable, config: &Config) -> Result<()> {
    let errors = ErrorSink::new();
    Writer::new(symtab, config, &errors).run()?;
    if !errors.ok() {
        bail!("link failed with {} errors", errors.count());
    }
    Ok(())
}

/// An init function gathered from the linking metadata, ready to be called
/// from `__wasm_call_ctors` or listed in the `linking` section.
struct InitEntry {
    sym: SymbolId,
    priority: u32,
}

/// Addresses one relocatable chunk of an object file.
#[derive(Clone, Copy)]
enum Chunk {
    Function(usize),
    Segment(usize),
    Section(usize),
}

pub struct Writer<'a> {
    symtab: &'a mut SymbolTable,
    config: &'a Config,
    errors: &'a ErrorSink,
    /// Effective global base; forced to zero for relocatable output.
    global_base: u32,

    file_size: u64,
    num_memory_pages: u32,
    max_memory_pages: u32,

    types: Vec<Signature>,
    type_indices: HashMap<Signature, u32>,
    imported_symbols: Vec<SymbolId>,
    num_imported_functions: u32,
    num_imported_globals: u32,
    exports: Vec<Export>,
    defined_fake_globals: Vec<SymbolId>,
    input_globals: Vec<GlobalRef>,
    input_functions: Vec<FunctionRef>,
    indirect_functions: Vec<SymbolId>,
    symtab_entries: Vec<SymbolId>,
    init_functions: Vec<InitEntry>,
    abis: Vec<String>,

    custom_section_mapping: IndexMap<String, Vec<SectionRef>>,
    custom_section_symbols: HashMap<String, SymbolId>,

    segments: Vec<OutputSegment>,
    segment_map: HashMap<String, usize>,

    header: Vec<u8>,
    output_sections: Vec<OutputSection>,
}

impl<'a> Writer<'a> {
    pub fn new(symtab: &'a mut SymbolTable, config: &'a Config, errors: &'a ErrorSink) -> Self {
        Self {
            symtab,
            config,
            errors,
            global_base: config.global_base,
            file_size: 0,
            num_memory_pages: 0,
            max_memory_pages: 0,
            types: Vec::new(),
            type_indices: HashMap::new(),
            imported_symbols: Vec::new(),
            num_imported_functions: 0,
            num_imported_globals: 0,
            exports: Vec::new(),
            defined_fake_globals: Vec::new(),
            input_globals: Vec::new(),
            input_functions: Vec::new(),
            indirect_functions: Vec::new(),
            symtab_entries: Vec::new(),
            init_functions: Vec::new(),
            abis: Vec::new(),
            custom_section_mapping: IndexMap::new(),
            custom_section_symbols: HashMap::new(),
            segments: Vec::new(),
            segment_map: HashMap::new(),
            header: Vec::new(),
            output_sections: Vec::new(),
        }
    }

    pub fn run(mut self) -> Result<()> {
        if self.config.relocatable {
            self.global_base = 0;
        }

        debug!("-- calculate_imports");
        self.calculate_imports();
        debug!("-- assign_indexes");
        self.assign_indexes();
        debug!("-- calculate_init_functions");
        self.calculate_init_functions();
        if !self.config.relocatable {
            self.create_ctor_function();
        }
        if self.symtab.entry_is_undefined {
            self.create_dispatch_function();
        }
        debug!("-- calculate_types");
        self.calculate_types();
        debug!("-- layout_memory");
        self.layout_memory();
        debug!("-- calculate_exports");
        self.calculate_exports();
        debug!("-- calculate_custom_sections");
        self.calculate_custom_sections();
        debug!("-- assign_symtab");
        self.assign_symtab();

        debug!("defined functions: {}", self.input_functions.len());
        debug!("defined globals  : {}", self.input_globals.len());
        debug!("function imports : {}", self.num_imported_functions);
        debug!("global imports   : {}", self.num_imported_globals);

        self.create_header();
        debug!("-- create_sections");
        self.create_sections();

        debug!("writing: {}", self.config.output_file.display());
        let mut buffer = OutputBuffer::create(&self.config.output_file, self.file_size)?;
        if !self.errors.ok() {
            return Ok(());
        }

        self.write_header(&mut buffer);
        debug!("-- write_sections");
        self.write_sections(&mut buffer);
        if !self.errors.ok() {
            return Ok(());
        }

        buffer.commit()?;
        abi::write_abi(&self.abis, &self.config.output_file)
    }

    // ---- index planning -------------------------------------------------

    /// A symbol becomes an import iff it is undefined, live, referenced from
    /// a regular object, not a data symbol, and not weak (unless the output
    /// is relocatable). Function and global imports each get consecutive
    /// indices from zero.
    fn calculate_imports(&mut self) {
        for id in self.symtab.symbol_ids() {
            let sym = self.symtab.symbol(id);
            if !sym.header.undefined || !sym.header.live || !sym.header.used_in_regular_obj {
                continue;
            }
            if sym.header.weak && !self.config.relocatable {
                continue;
            }
            if matches!(sym.kind, SymbolKind::Data(_) | SymbolKind::Section(_)) {
                continue;
            }

            debug!("import: {}", sym.header.name);
            self.imported_symbols.push(id);
            match &mut self.symtab.symbol_mut(id).kind {
                SymbolKind::Function(f) => {
                    f.function_index = Some(self.num_imported_functions);
                    self.num_imported_functions += 1;
                }
                SymbolKind::Global(g) => {
                    g.global_index = Some(self.num_imported_globals);
                    self.num_imported_globals += 1;
                }
                _ => unreachable!(),
            }
        }
    }

    /// Number defined functions and globals after their imports, walk every
    /// live chunk's relocations to discover address-taken functions and used
    /// types.
    fn assign_indexes(&mut self) {
        let mut function_index = self.num_imported_functions;
        for i in 0..self.symtab.synthetic_functions.len() {
            if !self.symtab.synthetic_functions[i].live {
                continue;
            }
            self.symtab.synthetic_functions[i].function_index = Some(function_index);
            self.input_functions.push(FunctionRef::Synthetic(i));
            function_index += 1;
        }
        for file in 0..self.symtab.object_files.len() {
            debug!("functions: {}", self.symtab.object_files[file].name);
            for index in 0..self.symtab.object_files[file].functions.len() {
                let func = &mut self.symtab.object_files[file].functions[index];
                if !func.live {
                    continue;
                }
                func.function_index = Some(function_index);
                self.input_functions.push(FunctionRef::Object { file, index });
                function_index += 1;
            }
        }

        let mut table_index = INITIAL_TABLE_OFFSET;
        for file in 0..self.symtab.object_files.len() {
            debug!("handle relocs: {}", self.symtab.object_files[file].name);
            for i in 0..self.symtab.object_files[file].functions.len() {
                self.handle_relocs(file, Chunk::Function(i), &mut table_index);
            }
            for i in 0..self.symtab.object_files[file].segments.len() {
                self.handle_relocs(file, Chunk::Segment(i), &mut table_index);
            }
            for i in 0..self.symtab.object_files[file].custom_sections.len() {
                self.handle_relocs(file, Chunk::Section(i), &mut table_index);
            }
        }

        let mut global_index = self.num_imported_globals;
        for i in 0..self.symtab.synthetic_globals.len() {
            if !self.symtab.synthetic_globals[i].live {
                continue;
            }
            self.symtab.synthetic_globals[i].global_index = Some(global_index);
            self.input_globals.push(GlobalRef::Synthetic(i));
            global_index += 1;
        }
        for file in 0..self.symtab.object_files.len() {
            debug!("globals: {}", self.symtab.object_files[file].name);
            for index in 0..self.symtab.object_files[file].globals.len() {
                let global = &mut self.symtab.object_files[file].globals[index];
                if !global.live {
                    continue;
                }
                global.global_index = Some(global_index);
                self.input_globals.push(GlobalRef::Object { file, index });
                global_index += 1;
            }
        }
    }

    fn handle_relocs(&mut self, file: usize, chunk: Chunk, next_table_index: &mut u32) {
        let num_relocs = {
            let f = &self.symtab.object_files[file];
            let (live, len) = match chunk {
                Chunk::Function(i) => (f.functions[i].live, f.functions[i].relocations.len()),
                Chunk::Segment(i) => (f.segments[i].live, f.segments[i].relocations.len()),
                Chunk::Section(i) => {
                    (f.custom_sections[i].live, f.custom_sections[i].relocations.len())
                }
            };
            if !live {
                return;
            }
            len
        };

        for ri in 0..num_relocs {
            let reloc = {
                let f = &self.symtab.object_files[file];
                match chunk {
                    Chunk::Function(i) => f.functions[i].relocations[ri],
                    Chunk::Segment(i) => f.segments[i].relocations[ri],
                    Chunk::Section(i) => f.custom_sections[i].relocations[ri],
                }
            };
            match reloc.kind {
                RelocKind::TableIndexI32 | RelocKind::TableIndexSleb => {
                    let Some(id) = self.symtab.object_files[file].symbol(reloc.index) else {
                        self.errors.error(format!(
                            "relocation against unknown symbol index {} in {}",
                            reloc.index, self.symtab.object_files[file].name
                        ));
                        continue;
                    };
                    if !matches!(self.symtab.symbol(id).kind, SymbolKind::Function(_)) {
                        self.errors.error(format!(
                            "table relocation against non-function symbol {}",
                            self.symtab.symbol(id).header.name
                        ));
                        continue;
                    }
                    if self.table_index_of(id).is_some() || self.function_index_of(id).is_none()
                    {
                        continue;
                    }
                    if let SymbolKind::Function(f) = &mut self.symtab.symbol_mut(id).kind {
                        f.table_index = Some(*next_table_index);
                    }
                    *next_table_index += 1;
                    self.indirect_functions.push(id);
                }
                RelocKind::TypeIndexLeb => {
                    let sig = match self.symtab.object_files[file].types.get(reloc.index as usize)
                    {
                        Some(sig) => sig.clone(),
                        None => {
                            self.errors.error(format!(
                                "relocation against unknown type index {} in {}",
                                reloc.index, self.symtab.object_files[file].name
                            ));
                            continue;
                        }
                    };
                    let index = self.register_type(sig);
                    let f = &mut self.symtab.object_files[file];
                    f.type_map[reloc.index as usize] = index;
                    f.type_is_used[reloc.index as usize] = true;
                }
                _ => {}
            }
        }
    }

    fn register_type(&mut self, sig: Signature) -> u32 {
        if let Some(&index) = self.type_indices.get(&sig) {
            return index;
        }
        let index = self.types.len() as u32;
        debug!("type {sig}");
        self.type_indices.insert(sig.clone(), index);
        self.types.push(sig);
        index
    }

    /// The type table has been sealed by `calculate_types`; a miss here is a
    /// linker bug surfaced as a consistency error.
    fn lookup_type(&self, sig: &Signature) -> u32 {
        match self.type_indices.get(sig) {
            Some(&index) => index,
            None => {
                self.errors.error(format!("type not found: {sig}"));
                0
            }
        }
    }

    /// The output type section is the union of: types referenced by TYPE
    /// relocations, signatures of imported functions, and signatures of
    /// defined functions, registered in that order.
    fn calculate_types(&mut self) {
        for file in 0..self.symtab.object_files.len() {
            for i in 0..self.symtab.object_files[file].types.len() {
                if !self.symtab.object_files[file].type_is_used[i] {
                    continue;
                }
                let sig = self.symtab.object_files[file].types[i].clone();
                let index = self.register_type(sig);
                self.symtab.object_files[file].type_map[i] = index;
            }
        }

        let imported = self.imported_symbols.clone();
        for id in imported {
            let sig = self.symtab.symbol(id).as_function().and_then(|f| f.signature.clone());
            if let Some(sig) = sig {
                self.register_type(sig);
            }
        }

        for i in 0..self.input_functions.len() {
            let sig = self.symtab.function(self.input_functions[i]).signature.clone();
            self.register_type(sig);
        }
    }

    fn calculate_init_functions(&mut self) {
        let expected = Signature::default();
        for file in 0..self.symtab.object_files.len() {
            for i in 0..self.symtab.object_files[file].init_functions.len() {
                let InitFunc { priority, symbol } =
                    self.symtab.object_files[file].init_functions[i];
                let Some(id) = self.symtab.object_files[file].symbol(symbol) else {
                    self.errors.error(format!(
                        "init function symbol index {} out of range in {}",
                        symbol, self.symtab.object_files[file].name
                    ));
                    continue;
                };
                let sym = self.symtab.symbol(id);
                if sym.as_function().and_then(|f| f.signature.as_ref()) != Some(&expected) {
                    self.errors
                        .error(format!("invalid signature for init func: {}", sym.header.name));
                }
                self.init_functions.push(InitEntry { sym: id, priority });
            }
        }
        // Stable: ties keep file order.
        self.init_functions.sort_by_key(|entry| entry.priority);
    }

    // ---- synthetic functions --------------------------------------------

    /// `__wasm_call_ctors` calls every init function in priority order.
    fn create_ctor_function(&mut self) {
        let Some(id) = self.symtab.find("__wasm_call_ctors") else {
            return;
        };

        let mut content = Vec::new();
        write_uleb128(&mut content, 0);
        for i in 0..self.init_functions.len() {
            let sym = self.init_functions[i].sym;
            let Some(index) = self.function_index_of(sym) else {
                self.errors.error(format!(
                    "init function without an index: {}",
                    self.symtab.symbol(sym).header.name
                ));
                continue;
            };
            write_u8(&mut content, OPCODE_CALL);
            write_uleb128(&mut content, index as u64);
        }
        write_u8(&mut content, OPCODE_END);

        let mut body = Vec::new();
        write_uleb128(&mut body, content.len() as u64);
        body.extend_from_slice(&content);
        self.attach_synthetic_body(id, body);
    }

    /// The synthesized `apply(receiver, code, action)` entry.
    fn create_dispatch_function(&mut self) {
        let Some(id) = self.symtab.find("apply") else {
            self.errors
                .error("entry is undefined and no synthetic 'apply' symbol exists");
            return;
        };
        let body = DispatchBuilder::new(self.symtab, self.errors).build();
        self.attach_synthetic_body(id, body);
    }

    fn attach_synthetic_body(&mut self, id: SymbolId, body: Vec<u8>) {
        let func = self.symtab.symbol(id).as_function().and_then(|f| f.function);
        match func {
            Some(r) => self.symtab.function_mut(r).body = body,
            None => self.errors.error(format!(
                "cannot synthesize body for {}: not a defined function",
                self.symtab.symbol(id).header.name
            )),
        }
    }

    // ---- memory layout --------------------------------------------------

    fn create_output_segments(&mut self) {
        for file in 0..self.symtab.object_files.len() {
            if !self.symtab.object_files[file].snax_abi.is_empty() {
                self.abis.push(self.symtab.object_files[file].snax_abi.clone());
            }
            for index in 0..self.symtab.object_files[file].segments.len() {
                if !self.symtab.object_files[file].segments[index].live {
                    continue;
                }
                let name = output_segment_name(
                    self.config.merge_data_segments,
                    &self.symtab.object_files[file].segments[index].name,
                )
                .to_string();
                let seg_index = match self.segment_map.get(&name).copied() {
                    Some(i) => i,
                    None => {
                        debug!("new segment: {name}");
                        let i = self.segments.len();
                        self.segments.push(OutputSegment::new(name.clone(), i as u32));
                        self.segment_map.insert(name, i);
                        i
                    }
                };
                self.segments[seg_index].add_input_segment(
                    SegmentRef { file, index },
                    &mut self.symtab.object_files[file].segments[index],
                );
            }
        }
    }

    /// Assign virtual addresses: static data from the global base (or the
    /// stack first, with `--stack-first`), then the explicit stack, then the
    /// heap. Binds `__dso_handle`, `__data_end`, `__heap_base` and the
    /// `__stack_pointer` init value along the way.
    fn layout_memory(&mut self) {
        self.create_output_segments();

        let mut memory_ptr: u32 = 0;
        if self.config.stack_first {
            self.place_stack(&mut memory_ptr);
        } else {
            memory_ptr = self.global_base;
            debug!("mem: global base = {}", self.global_base);
        }

        let data_start = memory_ptr;
        self.set_data_symbol_va("__dso_handle", data_start);

        for i in 0..self.segments.len() {
            memory_ptr = align_up(memory_ptr, self.segments[i].alignment);
            self.segments[i].start_va = memory_ptr;
            debug!(
                "mem: {:<15} offset={:<8} size={:<8} align={}",
                self.segments[i].name, memory_ptr, self.segments[i].size,
                self.segments[i].alignment
            );
            memory_ptr += self.segments[i].size;
        }

        self.set_data_symbol_va("__data_end", memory_ptr);
        debug!("mem: static data = {}", memory_ptr - data_start);

        if !self.config.stack_first {
            self.place_stack(&mut memory_ptr);
        }

        // The heap starts past everything else so a brk-style allocator can
        // grow it at runtime.
        if !self.config.relocatable {
            self.set_data_symbol_va("__heap_base", memory_ptr);
            debug!("mem: heap base   = {memory_ptr}");
        }

        if self.config.initial_memory != 0 {
            if self.config.initial_memory % WASM_PAGE_SIZE != 0 {
                self.errors
                    .error(format!("initial memory must be {WASM_PAGE_SIZE}-byte aligned"));
            }
            if memory_ptr > self.config.initial_memory {
                self.errors
                    .error(format!("initial memory too small, {memory_ptr} bytes needed"));
            } else {
                memory_ptr = self.config.initial_memory;
            }
        }
        self.num_memory_pages = align_up(memory_ptr, WASM_PAGE_SIZE) / WASM_PAGE_SIZE;
        debug!("mem: total pages = {}", self.num_memory_pages);

        if self.config.max_memory != 0 {
            if self.config.max_memory % WASM_PAGE_SIZE != 0 {
                self.errors
                    .error(format!("maximum memory must be {WASM_PAGE_SIZE}-byte aligned"));
            }
            if memory_ptr > self.config.max_memory {
                self.errors
                    .error(format!("maximum memory too small, {memory_ptr} bytes needed"));
            }
            self.max_memory_pages = self.config.max_memory / WASM_PAGE_SIZE;
            debug!("mem: max pages   = {}", self.max_memory_pages);
        }
    }

    fn place_stack(&mut self, memory_ptr: &mut u32) {
        if self.config.relocatable {
            return;
        }
        *memory_ptr = align_up(*memory_ptr, STACK_ALIGNMENT);
        if self.config.z_stack_size % STACK_ALIGNMENT != 0 {
            self.errors
                .error(format!("stack size must be {STACK_ALIGNMENT}-byte aligned"));
        }
        debug!("mem: stack size  = {}", self.config.z_stack_size);
        debug!("mem: stack base  = {}", *memory_ptr);
        *memory_ptr += self.config.z_stack_size;
        if let Some(id) = self.symtab.find("__stack_pointer") {
            let global = self.symtab.symbol(id).as_global().and_then(|g| g.global);
            if let Some(r) = global {
                self.symtab.global_mut(r).global.init = InitExpr::I32Const(*memory_ptr as i32);
            }
        }
        debug!("mem: stack top   = {}", *memory_ptr);
    }

    fn set_data_symbol_va(&mut self, name: &str, va: u32) {
        let Some(id) = self.symtab.find(name) else {
            return;
        };
        if let SymbolKind::Data(d) = &mut self.symtab.symbol_mut(id).kind {
            d.virtual_address = Some(va);
        }
    }

    // ---- exports, custom sections, symtab -------------------------------

    fn calculate_exports(&mut self) {
        if self.config.relocatable {
            return;
        }

        if !self.config.import_memory {
            self.exports.push(Export {
                name: "memory".to_string(),
                kind: ExternalKind::Memory,
                index: 0,
            });
        }
        if self.config.export_table {
            self.exports.push(Export {
                name: FUNCTION_TABLE_NAME.to_string(),
                kind: ExternalKind::Table,
                index: 0,
            });
        }

        let mut fake_global_index = self.num_imported_globals + self.input_globals.len() as u32;

        for id in self.symtab.symbol_ids() {
            let sym = self.symtab.symbol(id);
            if sym.header.undefined || sym.header.local || !sym.header.live {
                continue;
            }
            if sym.header.hidden && !self.config.export_all {
                continue;
            }

            let name = sym.header.name.clone();
            let export = match &sym.kind {
                SymbolKind::Function(_) => {
                    let Some(index) = self.function_index_of(id) else {
                        continue;
                    };
                    Export { name, kind: ExternalKind::Function, index }
                }
                SymbolKind::Global(g) => {
                    let mutable = g
                        .global
                        .map(|r| self.symtab.global(r).global.ty.mutable)
                        .unwrap_or(g.ty.mutable);
                    if mutable {
                        // Hosts without mutable-global support reject these;
                        // the stack pointer simply stays internal.
                        if name != "__stack_pointer" {
                            self.errors.error(format!("mutable global exported: {name}"));
                        }
                        continue;
                    }
                    let Some(index) = self.global_index_of(id) else {
                        continue;
                    };
                    Export { name, kind: ExternalKind::Global, index }
                }
                SymbolKind::Data(_) => {
                    // Promote to an immutable i32 global holding the
                    // symbol's address.
                    self.defined_fake_globals.push(id);
                    let index = fake_global_index;
                    fake_global_index += 1;
                    Export { name, kind: ExternalKind::Global, index }
                }
                SymbolKind::Section(_) => continue,
            };
            debug!("export: {}", export.name);
            self.exports.push(export);
        }
    }

    fn calculate_custom_sections(&mut self) {
        let strip_debug = self.config.strip_debug || self.config.strip_all;
        for file in 0..self.symtab.object_files.len() {
            for index in 0..self.symtab.object_files[file].custom_sections.len() {
                let section = &self.symtab.object_files[file].custom_sections[index];
                if !section.live {
                    continue;
                }
                let name = section.name.clone();
                // Synthesized by the linker, never passed through.
                if name == "linking" || name == "name" || name.starts_with("reloc.") {
                    continue;
                }
                if strip_debug && name.starts_with(".debug_") {
                    continue;
                }
                self.custom_section_mapping
                    .entry(name)
                    .or_default()
                    .push(SectionRef { file, index });
            }
        }
    }

    /// Relocatable output only: assign every symbol its index in the emitted
    /// symbol table, deduplicating section symbols by section name.
    fn assign_symtab(&mut self) {
        if !self.config.relocatable {
            return;
        }

        let mut section_symbol_indices: HashMap<String, u32> = HashMap::new();
        let mut symbol_index = self.symtab_entries.len() as u32;
        for file in 0..self.symtab.object_files.len() {
            debug!("symtab entries: {}", self.symtab.object_files[file].name);
            let ids = self.symtab.object_files[file].symbols.clone();
            for id in ids {
                if self.symtab.symbol(id).header.file != Some(file) {
                    continue;
                }

                if matches!(self.symtab.symbol(id).kind, SymbolKind::Section(_)) {
                    let name = self.symtab.symbol(id).header.name.clone();
                    if !self.custom_section_mapping.contains_key(&name) {
                        continue;
                    }
                    if let Some(&existing) = section_symbol_indices.get(&name) {
                        self.symtab.symbol_mut(id).header.output_symbol_index = Some(existing);
                        continue;
                    }
                    section_symbol_indices.insert(name.clone(), symbol_index);
                    self.custom_section_symbols.insert(name, id);
                    self.symtab.symbol_mut(id).header.live = true;
                }

                // Relocatable output skips GC, so everything here is live.
                debug_assert!(self.symtab.symbol(id).header.live);
                self.symtab.symbol_mut(id).header.output_symbol_index = Some(symbol_index);
                symbol_index += 1;
                self.symtab_entries.push(id);
            }
        }
    }

    // ---- section creation -----------------------------------------------

    fn create_header(&mut self) {
        self.header.extend_from_slice(&WASM_MAGIC);
        write_u32_le(&mut self.header, WASM_VERSION);
        self.file_size += self.header.len() as u64;
    }

    fn create_sections(&mut self) {
        self.create_type_section();
        self.create_import_section();
        self.create_function_section();
        self.create_table_section();
        self.create_memory_section();
        self.create_global_section();
        self.create_export_section();
        self.create_elem_section();
        self.create_code_section();
        self.create_data_section();
        self.create_custom_sections();

        if self.config.relocatable {
            self.create_linking_section();
            self.create_reloc_sections();
        }
        if !self.config.strip_debug && !self.config.strip_all {
            self.create_name_section();
        }

        for section in &mut self.output_sections {
            section.set_offset(self.file_size);
            section.finalize();
            self.file_size += section.size();
        }
    }

    fn memory_limits(&self) -> Limits {
        if self.max_memory_pages != 0 {
            Limits {
                flags: LIMITS_HAS_MAX,
                initial: self.num_memory_pages,
                max: self.max_memory_pages,
            }
        } else {
            Limits { flags: 0, initial: self.num_memory_pages, max: 0 }
        }
    }

    fn create_type_section(&mut self) {
        if self.types.is_empty() {
            return;
        }
        let mut section = OutputSection::new(SEC_TYPE, "");
        write_uleb128(&mut section.body, self.types.len() as u64);
        for sig in &self.types {
            write_sig(&mut section.body, sig);
        }
        self.output_sections.push(section);
    }

    fn create_import_section(&mut self) {
        let mut num_imports = self.imported_symbols.len() as u64;
        if self.config.import_memory {
            num_imports += 1;
        }
        if self.config.import_table {
            num_imports += 1;
        }
        if num_imports == 0 {
            return;
        }

        let mut section = OutputSection::new(SEC_IMPORT, "");
        write_uleb128(&mut section.body, num_imports);

        if self.config.import_memory {
            write_import(
                &mut section.body,
                &Import {
                    field: "memory".to_string(),
                    kind: ImportKind::Memory { limits: self.memory_limits() },
                },
            );
        }
        if self.config.import_table {
            let size = INITIAL_TABLE_OFFSET + self.indirect_functions.len() as u32;
            write_import(
                &mut section.body,
                &Import {
                    field: FUNCTION_TABLE_NAME.to_string(),
                    kind: ImportKind::Table { limits: Limits::exact(size) },
                },
            );
        }

        for i in 0..self.imported_symbols.len() {
            let id = self.imported_symbols[i];
            let sym = self.symtab.symbol(id);
            let import = match &sym.kind {
                SymbolKind::Function(f) => {
                    let sig_index = match &f.signature {
                        Some(sig) => self.lookup_type(sig),
                        None => {
                            self.errors.error(format!(
                                "imported function without a signature: {}",
                                sym.header.name
                            ));
                            0
                        }
                    };
                    Import {
                        field: sym.header.name.clone(),
                        kind: ImportKind::Function { sig_index },
                    }
                }
                SymbolKind::Global(g) => {
                    Import { field: sym.header.name.clone(), kind: ImportKind::Global(g.ty) }
                }
                _ => continue,
            };
            write_import(&mut section.body, &import);
        }
        self.output_sections.push(section);
    }

    fn create_function_section(&mut self) {
        if self.input_functions.is_empty() {
            return;
        }
        let mut section = OutputSection::new(SEC_FUNCTION, "");
        write_uleb128(&mut section.body, self.input_functions.len() as u64);
        for i in 0..self.input_functions.len() {
            let index = {
                let func = self.symtab.function(self.input_functions[i]);
                self.lookup_type(&func.signature)
            };
            write_uleb128(&mut section.body, index as u64);
        }
        self.output_sections.push(section);
    }

    /// Always emitted (or imported): an empty slot 0 is useful for a null
    /// function handler, and a module containing `call_indirect` fails
    /// validation without a table.
    fn create_table_section(&mut self) {
        if self.config.import_table {
            return;
        }
        let size = INITIAL_TABLE_OFFSET + self.indirect_functions.len() as u32;
        let mut section = OutputSection::new(SEC_TABLE, "");
        write_uleb128(&mut section.body, 1);
        write_u8(&mut section.body, TYPE_ANYFUNC);
        write_limits(&mut section.body, &Limits::exact(size));
        self.output_sections.push(section);
    }

    fn create_memory_section(&mut self) {
        if self.config.import_memory {
            return;
        }
        let mut section = OutputSection::new(SEC_MEMORY, "");
        write_uleb128(&mut section.body, 1);
        write_limits(&mut section.body, &self.memory_limits());
        self.output_sections.push(section);
    }

    fn create_global_section(&mut self) {
        let num_globals = self.input_globals.len() + self.defined_fake_globals.len();
        if num_globals == 0 {
            return;
        }
        let mut section = OutputSection::new(SEC_GLOBAL, "");
        write_uleb128(&mut section.body, num_globals as u64);
        for i in 0..self.input_globals.len() {
            write_global(&mut section.body, &self.symtab.global(self.input_globals[i]).global);
        }
        for i in 0..self.defined_fake_globals.len() {
            let va = self.data_symbol_va(self.defined_fake_globals[i]).unwrap_or(0);
            write_global(
                &mut section.body,
                &Global {
                    ty: GlobalType { ty: ValType::I32, mutable: false },
                    init: InitExpr::I32Const(va as i32),
                },
            );
        }
        self.output_sections.push(section);
    }

    fn create_export_section(&mut self) {
        if self.exports.is_empty() {
            return;
        }
        let filtered: Vec<Export> = self
            .exports
            .iter()
            .filter(|export| self.config.should_export(export))
            .cloned()
            .collect();
        let mut section = OutputSection::new(SEC_EXPORT, "");
        write_uleb128(&mut section.body, filtered.len() as u64);
        for export in &filtered {
            write_export(&mut section.body, export);
        }
        self.exports = filtered;
        self.output_sections.push(section);
    }

    fn create_elem_section(&mut self) {
        if self.indirect_functions.is_empty() {
            return;
        }
        let mut section = OutputSection::new(SEC_ELEM, "");
        write_uleb128(&mut section.body, 1);
        write_uleb128(&mut section.body, 0); // table index
        write_init_expr(&mut section.body, &InitExpr::I32Const(INITIAL_TABLE_OFFSET as i32));
        write_uleb128(&mut section.body, self.indirect_functions.len() as u64);
        let mut table_index = INITIAL_TABLE_OFFSET;
        for i in 0..self.indirect_functions.len() {
            let id = self.indirect_functions[i];
            debug_assert_eq!(self.table_index_of(id), Some(table_index));
            write_uleb128(&mut section.body, self.function_index_of(id).unwrap_or(0) as u64);
            table_index += 1;
        }
        self.output_sections.push(section);
    }

    fn create_code_section(&mut self) {
        if self.input_functions.is_empty() {
            return;
        }
        debug!("create_code_section");
        let mut section = OutputSection::new(SEC_CODE, "");
        write_uleb128(&mut section.body, self.input_functions.len() as u64);
        for i in 0..self.input_functions.len() {
            let r = self.input_functions[i];
            let (body, relocs) = {
                let func = self.symtab.function(r);
                (func.body.clone(), func.relocations.clone())
            };
            let base = section.body.len();
            section.body.extend_from_slice(&body);
            if let FunctionRef::Object { file, .. } = r {
                self.apply_relocations(file, &relocs, &mut section, base);
            }
        }
        self.output_sections.push(section);
    }

    fn create_data_section(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        debug!("create_data_section");
        let mut section = OutputSection::new(SEC_DATA, "");
        write_uleb128(&mut section.body, self.segments.len() as u64);
        for i in 0..self.segments.len() {
            write_uleb128(&mut section.body, 0); // memory index
            write_init_expr(
                &mut section.body,
                &InitExpr::I32Const(self.segments[i].start_va as i32),
            );
            write_uleb128(&mut section.body, self.segments[i].size as u64);
            let segment_start = section.body.len();
            let refs = self.segments[i].input_segments.clone();
            for r in refs {
                let (data, relocs, output_offset) = {
                    let input = self.symtab.segment(r);
                    (input.data.clone(), input.relocations.clone(), input.output_offset)
                };
                // Alignment gaps between input segments are zero-filled.
                section.body.resize(segment_start + output_offset as usize, 0);
                let base = section.body.len();
                section.body.extend_from_slice(&data);
                self.apply_relocations(r.file, &relocs, &mut section, base);
            }
        }
        self.output_sections.push(section);
    }

    fn create_custom_sections(&mut self) {
        debug!("create_custom_sections");
        let names: Vec<String> = self.custom_section_mapping.keys().cloned().collect();
        for name in names {
            if let Some(&sym) = self.custom_section_symbols.get(&name) {
                let index = self.output_sections.len() as u32;
                if let SymbolKind::Section(s) = &mut self.symtab.symbol_mut(sym).kind {
                    s.output_section_index = Some(index);
                }
            }
            debug!("create_custom_section: {name}");
            let refs = self.custom_section_mapping[&name].clone();
            let mut section = OutputSection::new(SEC_CUSTOM, &name);
            for r in refs {
                let (data, relocs) = {
                    let input = self.symtab.section(r);
                    (input.data.clone(), input.relocations.clone())
                };
                let base = section.body.len();
                section.body.extend_from_slice(&data);
                self.apply_relocations(r.file, &relocs, &mut section, base);
            }
            self.output_sections.push(section);
        }
    }

    /// One `reloc.*` companion per output section that carries relocations.
    fn create_reloc_sections(&mut self) {
        debug!("create_reloc_sections");
        let original_count = self.output_sections.len();
        for i in 0..original_count {
            if self.output_sections[i].relocations.is_empty() {
                continue;
            }
            let name = self.output_sections[i].reloc_section_name();
            let mut body = Vec::new();
            write_uleb128(&mut body, i as u64);
            write_uleb128(&mut body, self.output_sections[i].relocations.len() as u64);
            self.output_sections[i].write_relocations(&mut body);

            let mut section = OutputSection::new(SEC_CUSTOM, &name);
            section.body = body;
            self.output_sections.push(section);
        }
    }

    fn create_linking_section(&mut self) {
        let mut section = OutputSection::new(SEC_CUSTOM, "linking");
        write_uleb128(&mut section.body, WASM_METADATA_VERSION as u64);

        if !self.symtab_entries.is_empty() {
            let mut sub = SubSection::new(WASM_SYMBOL_TABLE);
            write_uleb128(&mut sub.body, self.symtab_entries.len() as u64);
            for i in 0..self.symtab_entries.len() {
                let id = self.symtab_entries[i];
                let sym = self.symtab.symbol(id);
                write_u8(&mut sub.body, sym.wasm_kind());
                write_uleb128(&mut sub.body, sym.wasm_flags() as u64);
                match &sym.kind {
                    SymbolKind::Function(_) => {
                        write_uleb128(
                            &mut sub.body,
                            self.function_index_of(id).unwrap_or(0) as u64,
                        );
                        if sym.is_defined() {
                            write_str(&mut sub.body, &sym.header.name);
                        }
                    }
                    SymbolKind::Global(_) => {
                        write_uleb128(
                            &mut sub.body,
                            self.global_index_of(id).unwrap_or(0) as u64,
                        );
                        if sym.is_defined() {
                            write_str(&mut sub.body, &sym.header.name);
                        }
                    }
                    SymbolKind::Data(d) => {
                        write_str(&mut sub.body, &sym.header.name);
                        if sym.is_defined() {
                            let (segment_index, segment_offset) = match d.segment {
                                Some(r) => {
                                    let input = self.symtab.segment(r);
                                    (
                                        input.output_segment.unwrap_or(0),
                                        input.output_offset + d.offset,
                                    )
                                }
                                None => (0, d.offset),
                            };
                            write_uleb128(&mut sub.body, segment_index as u64);
                            write_uleb128(&mut sub.body, segment_offset as u64);
                            write_uleb128(&mut sub.body, d.size as u64);
                        }
                    }
                    SymbolKind::Section(s) => {
                        write_uleb128(
                            &mut sub.body,
                            s.output_section_index.unwrap_or(0) as u64,
                        );
                    }
                }
            }
            sub.write_to(&mut section.body);
        }

        if !self.segments.is_empty() {
            let mut sub = SubSection::new(WASM_SEGMENT_INFO);
            write_uleb128(&mut sub.body, self.segments.len() as u64);
            for segment in &self.segments {
                write_str(&mut sub.body, &segment.name);
                write_uleb128(&mut sub.body, segment.alignment as u64);
                write_uleb128(&mut sub.body, 0); // flags
            }
            sub.write_to(&mut section.body);
        }

        if !self.init_functions.is_empty() {
            let mut sub = SubSection::new(WASM_INIT_FUNCS);
            write_uleb128(&mut sub.body, self.init_functions.len() as u64);
            for entry in &self.init_functions {
                write_uleb128(&mut sub.body, entry.priority as u64);
                let index = self.symtab.symbol(entry.sym).header.output_symbol_index;
                write_uleb128(&mut sub.body, index.unwrap_or(0) as u64);
            }
            sub.write_to(&mut section.body);
        }

        // Comdat groups, ordered by name. Input segments grouped into one
        // output segment must agree on their comdat.
        let mut comdats: BTreeMap<String, Vec<(u8, u32)>> = BTreeMap::new();
        for &r in &self.input_functions {
            let func = self.symtab.function(r);
            if func.comdat.is_empty() {
                continue;
            }
            comdats
                .entry(func.comdat.clone())
                .or_default()
                .push((COMDAT_FUNCTION, func.function_index.unwrap_or(0)));
        }
        for (i, segment) in self.segments.iter().enumerate() {
            let Some(&first) = segment.input_segments.first() else {
                continue;
            };
            let comdat = self.symtab.segment(first).comdat.clone();
            debug_assert!(segment
                .input_segments
                .iter()
                .all(|&r| self.symtab.segment(r).comdat == comdat));
            if comdat.is_empty() {
                continue;
            }
            comdats.entry(comdat).or_default().push((COMDAT_DATA, i as u32));
        }
        if !comdats.is_empty() {
            let mut sub = SubSection::new(WASM_COMDAT_INFO);
            write_uleb128(&mut sub.body, comdats.len() as u64);
            for (name, entries) in &comdats {
                write_str(&mut sub.body, name);
                write_uleb128(&mut sub.body, 0); // flags
                write_uleb128(&mut sub.body, entries.len() as u64);
                for &(kind, index) in entries {
                    write_u8(&mut sub.body, kind);
                    write_uleb128(&mut sub.body, index as u64);
                }
            }
            sub.write_to(&mut section.body);
        }

        self.output_sections.push(section);
    }

    /// Function names in index order: imports first, then defined functions.
    fn create_name_section(&mut self) {
        let mut num_names = self.num_imported_functions;
        for &r in &self.input_functions {
            if !self.symtab.function(r).name.is_empty() {
                num_names += 1;
            }
        }
        if num_names == 0 {
            return;
        }

        let mut section = OutputSection::new(SEC_CUSTOM, "name");
        let mut sub = SubSection::new(NAMES_FUNCTION);
        write_uleb128(&mut sub.body, num_names as u64);

        for &id in &self.imported_symbols {
            let sym = self.symtab.symbol(id);
            if let SymbolKind::Function(f) = &sym.kind {
                write_uleb128(&mut sub.body, f.function_index.unwrap_or(0) as u64);
                let name =
                    demangle_itanium(&sym.header.name).unwrap_or_else(|| sym.header.name.clone());
                write_str(&mut sub.body, &name);
            }
        }
        for &r in &self.input_functions {
            let func = self.symtab.function(r);
            if func.name.is_empty() {
                continue;
            }
            write_uleb128(&mut sub.body, func.function_index.unwrap_or(0) as u64);
            let name = if !func.debug_name.is_empty() {
                func.debug_name.clone()
            } else {
                demangle_itanium(&func.name).unwrap_or_else(|| func.name.clone())
            };
            write_str(&mut sub.body, &name);
        }

        sub.write_to(&mut section.body);
        self.output_sections.push(section);
    }

    // ---- relocation application -----------------------------------------

    /// Patch relocation targets inside `section.body`, where the chunk they
    /// refer to was appended at `base`. For relocatable output the entries
    /// are also retained for the `reloc.*` sections, with their index
    /// remapped to the output symbol (or type) index.
    fn apply_relocations(
        &self,
        file: usize,
        relocs: &[Relocation],
        section: &mut OutputSection,
        base: usize,
    ) {
        for reloc in relocs {
            let at = base + reloc.offset as usize;
            let width = match reloc.kind {
                RelocKind::TableIndexI32 | RelocKind::MemoryAddrI32 => 4,
                _ => 5,
            };
            if at + width > section.body.len() {
                self.errors.error(format!(
                    "relocation offset {} out of range in {}",
                    reloc.offset, self.symtab.object_files[file].name
                ));
                continue;
            }
            let value = self.relocation_value(file, reloc);
            let target = &mut section.body[at..at + width];
            match reloc.kind {
                RelocKind::FunctionIndexLeb
                | RelocKind::MemoryAddrLeb
                | RelocKind::TypeIndexLeb
                | RelocKind::GlobalIndexLeb => patch_uleb128(target, value),
                RelocKind::TableIndexSleb | RelocKind::MemoryAddrSleb => {
                    patch_sleb128(target, value as i32)
                }
                RelocKind::TableIndexI32 | RelocKind::MemoryAddrI32 => {
                    patch_u32_le(target, value)
                }
            }

            if self.config.relocatable {
                section.relocations.push(OutputRelocation {
                    kind: reloc.kind,
                    offset: at as u32,
                    index: self.output_reloc_index(file, reloc),
                    addend: reloc.addend,
                });
            }
        }
    }

    fn relocation_value(&self, file: usize, reloc: &Relocation) -> u32 {
        if reloc.kind == RelocKind::TypeIndexLeb {
            return self.symtab.object_files[file]
                .type_map
                .get(reloc.index as usize)
                .copied()
                .unwrap_or(0);
        }
        let Some(id) = self.symtab.object_files[file].symbol(reloc.index) else {
            self.errors.error(format!(
                "relocation against unknown symbol index {} in {}",
                reloc.index, self.symtab.object_files[file].name
            ));
            return 0;
        };
        match reloc.kind {
            RelocKind::FunctionIndexLeb => self.function_index_of(id).unwrap_or_else(|| {
                self.errors.error(format!(
                    "relocation against function without an index: {}",
                    self.symtab.symbol(id).header.name
                ));
                0
            }),
            RelocKind::TableIndexSleb | RelocKind::TableIndexI32 => {
                self.table_index_of(id).unwrap_or_else(|| {
                    self.errors.error(format!(
                        "relocation against function without a table slot: {}",
                        self.symtab.symbol(id).header.name
                    ));
                    0
                })
            }
            RelocKind::GlobalIndexLeb => self.global_index_of(id).unwrap_or_else(|| {
                self.errors.error(format!(
                    "relocation against global without an index: {}",
                    self.symtab.symbol(id).header.name
                ));
                0
            }),
            RelocKind::MemoryAddrLeb | RelocKind::MemoryAddrSleb | RelocKind::MemoryAddrI32 => {
                // Undefined weak data resolves to address zero.
                if self.symtab.symbol(id).header.undefined {
                    0
                } else {
                    self.data_symbol_va(id).unwrap_or(0).wrapping_add(reloc.addend as u32)
                }
            }
            RelocKind::TypeIndexLeb => unreachable!(),
        }
    }

    fn output_reloc_index(&self, file: usize, reloc: &Relocation) -> u32 {
        if reloc.kind == RelocKind::TypeIndexLeb {
            return self.symtab.object_files[file]
                .type_map
                .get(reloc.index as usize)
                .copied()
                .unwrap_or(0);
        }
        self.symtab.object_files[file]
            .symbol(reloc.index)
            .and_then(|id| self.symtab.symbol(id).header.output_symbol_index)
            .unwrap_or(0)
    }

    // ---- final write ----------------------------------------------------

    fn write_header(&self, buffer: &mut OutputBuffer) {
        buffer.as_mut_slice()[..self.header.len()].copy_from_slice(&self.header);
    }

    /// Sections occupy disjoint, precomputed ranges of the buffer, so they
    /// are copied in parallel.
    fn write_sections(&self, buffer: &mut OutputBuffer) {
        let mut tasks = Vec::with_capacity(self.output_sections.len());
        let mut rest = &mut buffer.as_mut_slice()[self.header.len()..];
        for section in &self.output_sections {
            let (slice, tail) = rest.split_at_mut(section.size() as usize);
            tasks.push((slice, section));
            rest = tail;
        }
        tasks
            .into_par_iter()
            .for_each(|(slice, section)| section.write_to(slice));
    }

    // ---- index resolution -----------------------------------------------

    fn function_index_of(&self, id: SymbolId) -> Option<u32> {
        let f = self.symtab.symbol(id).as_function()?;
        f.function_index
            .or_else(|| f.function.and_then(|r| self.symtab.function(r).function_index))
    }

    fn global_index_of(&self, id: SymbolId) -> Option<u32> {
        let g = self.symtab.symbol(id).as_global()?;
        g.global_index
            .or_else(|| g.global.and_then(|r| self.symtab.global(r).global_index))
    }

    fn table_index_of(&self, id: SymbolId) -> Option<u32> {
        self.symtab.symbol(id).as_function()?.table_index
    }

    /// A defined data symbol's address: absolute for the synthetic layout
    /// symbols, segment-relative otherwise.
    fn data_symbol_va(&self, id: SymbolId) -> Option<u32> {
        let d = self.symtab.symbol(id).as_data()?;
        if let Some(va) = d.virtual_address {
            return Some(va);
        }
        let r = d.segment?;
        let input = self.symtab.segment(r);
        let output = &self.segments[input.output_segment? as usize];
        Some(output.start_va + input.output_offset + d.offset)
    }
}
