//! End-to-end link scenarios driven against a hand-built symbol table,
//! checked by walking the emitted module section by section.

use std::path::PathBuf;

use snax_ld::config::Config;
use snax_ld::dispatch::{string_to_name, SNAX_ERROR_NO_ACTION, SNAX_ERROR_ONERROR};
use snax_ld::input::{InitFunc, InputFunction, InputGlobal, InputSegment, ObjectFile};
use snax_ld::link;
use snax_ld::symbol::{
    DataSymbol, FunctionRef, FunctionSymbol, GlobalRef, GlobalSymbol, SegmentRef, Symbol,
    SymbolHeader, SymbolId, SymbolKind, SymbolTable,
};
use snax_ld::wasm::{
    Global, GlobalType, InitExpr, RelocKind, Relocation, Signature, ValType, SEC_CODE,
    SEC_CUSTOM, SEC_DATA, SEC_ELEM, SEC_EXPORT, SEC_FUNCTION, SEC_IMPORT, SEC_MEMORY, SEC_TABLE,
    SEC_TYPE,
};

fn out_path(name: &str) -> PathBuf {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = std::env::temp_dir().join("snax-ld-link-tests");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn config_for(name: &str) -> Config {
    Config { output_file: out_path(name), ..Config::default() }
}

/// A `() -> ()` code entry: size prefix, zero locals, `end`.
fn trivial_body() -> Vec<u8> {
    vec![2, 0x00, 0x0b]
}

fn add_defined_function(
    symtab: &mut SymbolTable,
    file: usize,
    name: &str,
    signature: Signature,
    body: Vec<u8>,
) -> SymbolId {
    let index = symtab.object_files[file].functions.len();
    symtab.object_files[file]
        .functions
        .push(InputFunction::new(name, signature.clone(), body));
    let mut header = SymbolHeader::new(name);
    header.file = Some(file);
    let id = symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Function(FunctionSymbol {
            signature: Some(signature),
            function_index: None,
            table_index: None,
            function: Some(FunctionRef::Object { file, index }),
        }),
    });
    symtab.object_files[file].symbols.push(id);
    id
}

fn add_undefined_function(symtab: &mut SymbolTable, name: &str, signature: Signature) -> SymbolId {
    let mut header = SymbolHeader::new(name);
    header.undefined = true;
    symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Function(FunctionSymbol {
            signature: Some(signature),
            function_index: None,
            table_index: None,
            function: None,
        }),
    })
}

fn add_synthetic_function(symtab: &mut SymbolTable, name: &str, signature: Signature) -> SymbolId {
    let index = symtab.synthetic_functions.len();
    symtab
        .synthetic_functions
        .push(InputFunction::synthetic(name, signature.clone()));
    let mut header = SymbolHeader::new(name);
    header.hidden = true;
    symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Function(FunctionSymbol {
            signature: Some(signature),
            function_index: None,
            table_index: None,
            function: Some(FunctionRef::Synthetic(index)),
        }),
    })
}

fn add_stack_pointer(symtab: &mut SymbolTable) -> SymbolId {
    let ty = GlobalType { ty: ValType::I32, mutable: true };
    let index = symtab.synthetic_globals.len();
    symtab.synthetic_globals.push(InputGlobal::new(
        "__stack_pointer",
        Global { ty, init: InitExpr::I32Const(0) },
    ));
    symtab.add_symbol(Symbol {
        header: SymbolHeader::new("__stack_pointer"),
        kind: SymbolKind::Global(GlobalSymbol {
            ty,
            global_index: None,
            global: Some(GlobalRef::Synthetic(index)),
        }),
    })
}

fn add_layout_symbol(symtab: &mut SymbolTable, name: &str) -> SymbolId {
    let mut header = SymbolHeader::new(name);
    header.hidden = true;
    symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Data(DataSymbol {
            segment: None,
            offset: 0,
            size: 0,
            virtual_address: None,
        }),
    })
}

struct Section {
    id: u8,
    name: String,
    payload: Vec<u8>,
}

/// Walk the module. Every declared section length must match the bytes
/// present, and the whole file must be consumed.
fn parse_sections(bytes: &[u8]) -> Vec<Section> {
    assert_eq!(&bytes[..8], b"\0asm\x01\x00\x00\x00");
    let mut r = &bytes[8..];
    let mut sections = Vec::new();
    while !r.is_empty() {
        let id = r[0];
        r = &r[1..];
        let size = leb128::read::unsigned(&mut r).unwrap() as usize;
        assert!(size <= r.len(), "section {id} overruns the file");
        let (body, rest) = r.split_at(size);
        r = rest;
        let (name, payload) = if id == SEC_CUSTOM {
            let mut b = body;
            let len = leb128::read::unsigned(&mut b).unwrap() as usize;
            let (name, payload) = b.split_at(len);
            (String::from_utf8(name.to_vec()).unwrap(), payload.to_vec())
        } else {
            (String::new(), body.to_vec())
        };
        sections.push(Section { id, name, payload });
    }
    sections
}

fn section<'a>(sections: &'a [Section], id: u8) -> &'a Section {
    sections
        .iter()
        .find(|s| s.id == id)
        .unwrap_or_else(|| panic!("missing section {id}"))
}

fn custom<'a>(sections: &'a [Section], name: &str) -> Option<&'a Section> {
    sections.iter().find(|s| s.id == SEC_CUSTOM && s.name == name)
}

fn sleb_padded(v: i32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    let mut v = v as i64;
    for b in buf.iter_mut().take(4) {
        *b = (v as u8 & 0x7f) | 0x80;
        v >>= 7;
    }
    buf[4] = v as u8 & 0x7f;
    buf
}

fn sleb64(v: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    leb128::write::signed(&mut buf, v).unwrap();
    buf
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn minimal_module() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("run.o"));
    add_defined_function(&mut symtab, 0, "run", Signature::default(), trivial_body());

    let config = Config {
        strip_debug: true,
        z_stack_size: 4096,
        ..config_for("minimal.wasm")
    };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);
    let ids: Vec<u8> = sections.iter().map(|s| s.id).collect();
    assert_eq!(
        ids,
        [SEC_TYPE, SEC_FUNCTION, SEC_TABLE, SEC_MEMORY, SEC_EXPORT, SEC_CODE]
    );

    assert_eq!(section(&sections, SEC_TYPE).payload, [1, 0x60, 0, 0]);
    assert_eq!(section(&sections, SEC_FUNCTION).payload, [1, 0]);
    // Empty table: slot 0 only, exact limits.
    assert_eq!(section(&sections, SEC_TABLE).payload, [1, 0x70, 1, 1, 1]);
    // 1024 global base + 4096 stack fits one page.
    assert_eq!(section(&sections, SEC_MEMORY).payload, [1, 0, 1]);

    let exports = &section(&sections, SEC_EXPORT).payload;
    assert_eq!(exports[0], 2);
    assert!(contains(exports, b"\x06memory"));
    assert!(contains(exports, b"\x03run"));

    assert_eq!(section(&sections, SEC_CODE).payload, [1, 2, 0x00, 0x0b]);
}

#[test]
fn indirect_calls_get_table_slots_and_elem_entries() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("indirect.o"));
    add_defined_function(&mut symtab, 0, "f", Signature::default(), trivial_body());
    add_defined_function(&mut symtab, 0, "g", Signature::default(), trivial_body());

    // caller takes the addresses of f and g through two padded i32.const
    // operands.
    let mut body = vec![16, 0x00, 0x41];
    body.extend([0x80, 0x80, 0x80, 0x80, 0x00]);
    body.extend([0x1a, 0x41]);
    body.extend([0x80, 0x80, 0x80, 0x80, 0x00]);
    body.extend([0x1a, 0x0b]);
    add_defined_function(&mut symtab, 0, "caller", Signature::default(), body);
    let caller = &mut symtab.object_files[0].functions[2];
    caller.relocations.push(Relocation {
        kind: RelocKind::TableIndexSleb,
        offset: 3,
        index: 0,
        addend: 0,
    });
    caller.relocations.push(Relocation {
        kind: RelocKind::TableIndexSleb,
        offset: 10,
        index: 1,
        addend: 0,
    });

    let config = Config { strip_debug: true, ..config_for("indirect.wasm") };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);

    // Two address-taken functions: table limits {has_max, 3, 3}.
    assert_eq!(section(&sections, SEC_TABLE).payload, [1, 0x70, 1, 3, 3]);
    // One elem segment at offset 1 listing f then g.
    assert_eq!(
        section(&sections, SEC_ELEM).payload,
        [1, 0, 0x41, 1, 0x0b, 2, 0, 1]
    );

    // The caller body got its table indices patched in place.
    let code = &section(&sections, SEC_CODE).payload;
    let caller_body = &code[code.len() - 17..];
    assert_eq!(caller_body[3..8], sleb_padded(1));
    assert_eq!(caller_body[10..15], sleb_padded(2));
}

#[test]
fn memory_layout_binds_the_synthetic_symbols() {
    let mut symtab = SymbolTable::new();
    let mut file = ObjectFile::new("data.o");
    file.segments.push(InputSegment::new(".data", 8, vec![0xaa; 100]));
    symtab.object_files.push(file);

    let sp = add_stack_pointer(&mut symtab);
    let data_end = add_layout_symbol(&mut symtab, "__data_end");
    let heap_base = add_layout_symbol(&mut symtab, "__heap_base");
    add_layout_symbol(&mut symtab, "__dso_handle");

    let config = Config {
        strip_debug: true,
        global_base: 1024,
        z_stack_size: 4096,
        ..config_for("layout.wasm")
    };
    link(&mut symtab, &config).unwrap();

    let va = |id: SymbolId| match &symtab.symbol(id).kind {
        SymbolKind::Data(d) => d.virtual_address.unwrap(),
        _ => unreachable!(),
    };
    assert_eq!(va(data_end), 1124);
    assert_eq!(va(heap_base), 5232);
    let sp_global = symtab.symbol(sp);
    let GlobalRef::Synthetic(i) = (match &sp_global.kind {
        SymbolKind::Global(g) => g.global.unwrap(),
        _ => unreachable!(),
    }) else {
        unreachable!()
    };
    assert_eq!(
        symtab.synthetic_globals[i].global.init,
        InitExpr::I32Const(5232)
    );

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);
    assert_eq!(section(&sections, SEC_MEMORY).payload, [1, 0, 1]);

    // One data segment at VA 1024 with 100 payload bytes.
    let data = &section(&sections, SEC_DATA).payload;
    assert_eq!(data[..6], [1, 0, 0x41, 0x80, 0x08, 0x0b]);
    assert_eq!(data[6], 100);
    assert_eq!(data.len(), 7 + 100);

    // The mutable stack pointer is defined but never exported.
    let exports = &section(&sections, SEC_EXPORT).payload;
    assert!(!contains(exports, b"__stack_pointer"));
}

fn dispatch_symtab(actions: &[(&str, Vec<&str>)], notify: &[(&str, Vec<&str>)]) -> SymbolTable {
    let mut symtab = SymbolTable::new();
    symtab.entry_is_undefined = true;
    add_undefined_function(
        &mut symtab,
        "snax_assert_code",
        Signature::new(vec![ValType::I32, ValType::I64], vec![]),
    );
    add_synthetic_function(
        &mut symtab,
        "apply",
        Signature::new(vec![ValType::I64, ValType::I64, ValType::I64], vec![]),
    );
    let handler_sig = Signature::new(vec![ValType::I64, ValType::I64], vec![]);
    for (name, acts) in actions {
        let mut file = ObjectFile::new(format!("{name}.o"));
        file.snax_actions = acts.iter().map(|s| s.to_string()).collect();
        symtab.object_files.push(file);
    }
    for (name, notifs) in notify {
        let mut file = ObjectFile::new(format!("{name}.o"));
        file.snax_notify = notifs.iter().map(|s| s.to_string()).collect();
        symtab.object_files.push(file);
    }
    for file in 0..symtab.object_files.len() {
        let entries: Vec<String> = symtab.object_files[file]
            .snax_actions
            .iter()
            .chain(&symtab.object_files[file].snax_notify)
            .map(|s| s.rsplit(':').next().unwrap().to_string())
            .collect();
        for func in entries {
            if symtab.find(&func).is_none() {
                add_defined_function(&mut symtab, file, &func, handler_sig.clone(), trivial_body());
            }
        }
    }
    symtab
}

#[test]
fn action_dispatcher_is_synthesized_into_apply() {
    let mut symtab = dispatch_symtab(
        &[
            ("token", vec!["transfer:on_transfer"]),
            ("issuer", vec!["issue:on_issue"]),
        ],
        &[],
    );

    let config = Config { strip_debug: true, ..config_for("dispatch.wasm") };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);

    // snax_assert_code is the only import, so handlers start at index 1.
    let imports = &section(&sections, SEC_IMPORT).payload;
    assert_eq!(imports[0], 1);
    assert!(contains(imports, b"snax_assert_code"));

    // apply is the first defined function; its body carries the cascade.
    let code = &section(&sections, SEC_CODE).payload;
    assert!(contains(code, &{
        let mut check = vec![0x42];
        check.extend(sleb64(string_to_name("transfer") as i64));
        check
    }));
    assert!(contains(code, &{
        let mut check = vec![0x42];
        check.extend(sleb64(string_to_name("issue") as i64));
        check
    }));
    // The no-action fault: i32.const 0, i64.const NO_ACTION, call 0.
    let mut fault = vec![0x41, 0x00, 0x42];
    fault.extend(sleb64(SNAX_ERROR_NO_ACTION as i64));
    fault.extend([0x10, 0x00]);
    assert!(contains(code, &fault));
    // Handlers are called with (receiver, code): local.get 0, local.get 1.
    assert!(contains(code, &[0x20, 0x00, 0x20, 0x01, 0x10, 2]));
    assert!(contains(code, &[0x20, 0x00, 0x20, 0x01, 0x10, 3]));
}

#[test]
fn onerror_handler_replaces_the_synthesized_assert() {
    let mut symtab = dispatch_symtab(&[], &[("observer", vec!["snax::onerror:handle_err"])]);

    let config = Config { strip_debug: true, ..config_for("onerror.wasm") };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);
    let code = &section(&sections, SEC_CODE).payload;

    let mut fault = vec![0x42];
    fault.extend(sleb64(SNAX_ERROR_ONERROR as i64));
    assert!(!contains(code, &fault));
    // if code == name("snax"), then if action == name("onerror"), call the
    // handler (function index 2: import 0, apply 1, handle_err 2).
    let mut guard = vec![0x42];
    guard.extend(sleb64(string_to_name("onerror") as i64));
    guard.extend([0x20, 0x02, 0x51, 0x04, 0x40]);
    guard.extend([0x20, 0x00, 0x20, 0x01, 0x10, 2]);
    assert!(contains(code, &guard));
}

#[test]
fn relocatable_output_carries_linking_metadata() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("a.o"));
    symtab.object_files.push(ObjectFile::new("b.o"));

    // a.o calls b.o's function through a padded call relocation.
    let mut body = vec![8, 0x00, 0x10];
    body.extend([0x80, 0x80, 0x80, 0x80, 0x00]);
    body.push(0x0b);
    add_defined_function(&mut symtab, 0, "caller", Signature::default(), body);
    let callee = add_defined_function(&mut symtab, 1, "callee", Signature::default(), trivial_body());
    symtab.object_files[0].symbols.push(callee);
    symtab.object_files[0].functions[0].relocations.push(Relocation {
        kind: RelocKind::FunctionIndexLeb,
        offset: 3,
        index: 1,
        addend: 0,
    });

    let mut segment = InputSegment::new(".data.table", 4, vec![0; 16]);
    segment.comdat = String::new();
    symtab.object_files[0].segments.push(segment);
    let mut header = SymbolHeader::new("table_data");
    header.file = Some(0);
    let data_sym = symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Data(DataSymbol {
            segment: Some(SegmentRef { file: 0, index: 0 }),
            offset: 4,
            size: 8,
            virtual_address: None,
        }),
    });
    symtab.object_files[0].symbols.push(data_sym);

    let config = Config { relocatable: true, ..config_for("reloc.wasm") };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);

    // Every symbol got a consecutive output index, in file order.
    let index_of = |id: SymbolId| symtab.symbol(id).header.output_symbol_index.unwrap();
    let caller = symtab.find("caller").unwrap();
    assert_eq!(index_of(caller), 0);
    assert_eq!(index_of(callee), 2);
    assert_eq!(index_of(data_sym), 1);

    let linking = custom(&sections, "linking").expect("linking section");
    let mut r = &linking.payload[..];
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 1); // metadata version
    let mut subsection_ids = Vec::new();
    while !r.is_empty() {
        let id = leb128::read::unsigned(&mut r).unwrap();
        let len = leb128::read::unsigned(&mut r).unwrap() as usize;
        subsection_ids.push(id);
        r = &r[len..];
    }
    // SYMBOL_TABLE and SEGMENT_INFO, nothing empty.
    assert_eq!(subsection_ids, [8, 5]);

    let symtab_sub = {
        let mut r = &linking.payload[..];
        leb128::read::unsigned(&mut r).unwrap();
        let id = leb128::read::unsigned(&mut r).unwrap();
        assert_eq!(id, 8);
        let len = leb128::read::unsigned(&mut r).unwrap() as usize;
        &r[..len]
    };
    let mut r = symtab_sub;
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 3); // three symbols
    // First entry: defined function "caller", kind 0, flags 0, index, name.
    assert_eq!(r[0], 0);
    assert!(contains(symtab_sub, b"\x06caller"));
    // The data symbol records (segment, offset, size) = (0, 4, 8).
    assert!(contains(symtab_sub, b"\x0atable_data\x00\x04\x08"));

    // The code relocation survives with the symbol's output index.
    let reloc_code = custom(&sections, "reloc.CODE").expect("reloc.CODE section");
    let mut r = &reloc_code.payload[..];
    leb128::read::unsigned(&mut r).unwrap(); // section index
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 1); // one entry
    assert_eq!(r[0], 0); // FUNCTION_INDEX_LEB
    r = &r[1..];
    leb128::read::unsigned(&mut r).unwrap(); // offset
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 2); // callee's symtab index

    // No dispatcher, no exports in relocatable output.
    assert!(sections.iter().all(|s| s.id != SEC_EXPORT));
    assert!(custom(&sections, "name").is_some());
}

#[test]
fn ctor_function_calls_init_functions_in_priority_order() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("ctors.o"));
    add_defined_function(&mut symtab, 0, "init_late", Signature::default(), trivial_body());
    add_defined_function(&mut symtab, 0, "init_early", Signature::default(), trivial_body());
    symtab.object_files[0].init_functions.push(InitFunc { priority: 200, symbol: 0 });
    symtab.object_files[0].init_functions.push(InitFunc { priority: 100, symbol: 1 });
    add_synthetic_function(&mut symtab, "__wasm_call_ctors", Signature::default());

    let config = Config { strip_debug: true, ..config_for("ctors.wasm") };
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);
    let code = &section(&sections, SEC_CODE).payload;

    // __wasm_call_ctors is the first defined function (index 0): its body
    // calls init_early (index 2) before init_late (index 1).
    let ctor_body = &code[1..]; // skip the function count
    assert_eq!(ctor_body[..7], [6, 0x00, 0x10, 2, 0x10, 1, 0x0b]);
}

#[test]
fn misaligned_stack_size_is_a_link_error() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("empty.o"));
    add_defined_function(&mut symtab, 0, "run", Signature::default(), trivial_body());

    let config = Config {
        z_stack_size: 1000,
        ..config_for("badstack.wasm")
    };
    let err = link(&mut symtab, &config).unwrap_err();
    assert!(err.to_string().contains("1 errors"));
}

#[test]
fn too_small_initial_memory_is_a_link_error() {
    let mut symtab = SymbolTable::new();
    let mut file = ObjectFile::new("big.o");
    file.segments.push(InputSegment::new(".data", 1, vec![0; 70000]));
    symtab.object_files.push(file);

    let config = Config {
        initial_memory: 65536,
        ..config_for("smallmem.wasm")
    };
    assert!(link(&mut symtab, &config).is_err());
}

#[test]
fn exported_mutable_global_is_a_link_error() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("mut.o"));
    let ty = GlobalType { ty: ValType::I32, mutable: true };
    let index = symtab.object_files[0].globals.len();
    symtab.object_files[0].globals.push(InputGlobal::new(
        "counter",
        Global { ty, init: InitExpr::I32Const(0) },
    ));
    let mut header = SymbolHeader::new("counter");
    header.file = Some(0);
    symtab.add_symbol(Symbol {
        header,
        kind: SymbolKind::Global(GlobalSymbol {
            ty,
            global_index: None,
            global: Some(GlobalRef::Object { file: 0, index }),
        }),
    });

    let config = config_for("mutglobal.wasm");
    assert!(link(&mut symtab, &config).is_err());
}

#[test]
fn abi_fragments_merge_into_a_sibling_file() {
    let mut symtab = SymbolTable::new();
    let mut file = ObjectFile::new("token.o");
    file.snax_abi =
        r#"{"version":"snax::abi/1.0","actions":[{"name":"transfer","type":"transfer"}]}"#
            .to_string();
    symtab.object_files.push(file);
    add_defined_function(&mut symtab, 0, "run", Signature::default(), trivial_body());

    let config = Config { strip_debug: true, ..config_for("withabi.wasm") };
    link(&mut symtab, &config).unwrap();

    let abi = std::fs::read_to_string(out_path("withabi.abi")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&abi).unwrap();
    assert_eq!(value["version"], "snax::abi/1.0");
    assert_eq!(value["actions"][0]["name"], "transfer");
}

#[test]
fn name_section_lists_functions_in_index_order() {
    let mut symtab = SymbolTable::new();
    symtab.object_files.push(ObjectFile::new("named.o"));
    add_undefined_function(&mut symtab, "host_fn", Signature::default());
    add_defined_function(&mut symtab, 0, "_Z8transferv", Signature::default(), trivial_body());

    let config = config_for("named.wasm");
    link(&mut symtab, &config).unwrap();

    let bytes = std::fs::read(&config.output_file).unwrap();
    let sections = parse_sections(&bytes);
    let name = custom(&sections, "name").expect("name section");

    let mut r = &name.payload[..];
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 1); // FUNCTION names
    let len = leb128::read::unsigned(&mut r).unwrap() as usize;
    let sub = &r[..len];
    let mut r = sub;
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 2); // two names
    assert_eq!(leb128::read::unsigned(&mut r).unwrap(), 0); // import first
    assert!(contains(sub, b"host_fn"));
    // The defined function's name demangles.
    assert!(contains(sub, b"transfer()"));
}
