//! Dispatcher synthesis.
//!
//! When no user entry function exists, the writer fabricates the body of
//! `apply(receiver: i64, code: i64, action: i64)` from the action and notify
//! metadata aggregated across the input objects: a chain of name comparisons
//! that routes an incoming action to its handler, with the platform's
//! assertion calls on the fallthrough paths. The body is raw opcode bytes;
//! every opened `if` is accounted for and closed.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::encoder::{write_sleb128, write_u8, write_uleb128};
use crate::error::ErrorSink;
use crate::symbol::SymbolTable;
use crate::wasm::{
    BLOCKTYPE_VOID, OPCODE_CALL, OPCODE_ELSE, OPCODE_END, OPCODE_GET_LOCAL, OPCODE_I32_CONST,
    OPCODE_I64_CONST, OPCODE_I64_EQ, OPCODE_I64_NE, OPCODE_IF,
};

const SNAX_COMPILER_ERROR_BASE: u64 = 8_000_000_000_000_000_000;
pub const SNAX_ERROR_NO_ACTION: u64 = SNAX_COMPILER_ERROR_BASE;
pub const SNAX_ERROR_ONERROR: u64 = SNAX_COMPILER_ERROR_BASE + 1;

/// The platform's 13-character base-32 encoding of a name into 64 bits:
/// five bits per character for the first twelve, four for the thirteenth.
pub fn string_to_name(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut name = 0u64;
    for (i, &c) in bytes.iter().enumerate().take(12) {
        name |= (char_to_symbol(c) & 0x1f) << (64 - 5 * (i + 1));
    }
    if let Some(&c) = bytes.get(12) {
        name |= char_to_symbol(c) & 0x0f;
    }
    name
}

fn char_to_symbol(c: u8) -> u64 {
    match c {
        b'a'..=b'z' => (c - b'a') as u64 + 6,
        b'1'..=b'5' => (c - b'1') as u64 + 1,
        _ => 0,
    }
}

/// Whether `s` is encodable as a platform name: 1-13 chars from
/// `[.1-5a-z]`, with the thirteenth restricted to the 4-bit range.
pub fn is_valid_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 13 {
        return false;
    }
    if !bytes.iter().all(|&c| matches!(c, b'a'..=b'z' | b'1'..=b'5' | b'.')) {
        return false;
    }
    if bytes.len() == 13 && char_to_symbol(bytes[12]) > 0x0f {
        return false;
    }
    true
}

/// A parsed `"actname:funcname"` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionEntry {
    pub action: String,
    pub func: String,
}

pub fn parse_action_entry(entry: &str) -> Option<ActionEntry> {
    let (action, func) = entry.split_once(':')?;
    if func.is_empty() || func.contains(':') || !is_valid_name(action) {
        return None;
    }
    Some(ActionEntry { action: action.to_string(), func: func.to_string() })
}

/// A parsed `"codename::actname:funcname"` entry. `code` may be the
/// wildcard `"*"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyEntry {
    pub code: String,
    pub action: String,
    pub func: String,
}

pub fn parse_notify_entry(entry: &str) -> Option<NotifyEntry> {
    let (code, rest) = entry.split_once("::")?;
    let (action, func) = rest.split_once(':')?;
    if func.is_empty() || func.contains(':') {
        return None;
    }
    if code != "*" && !is_valid_name(code) {
        return None;
    }
    if !is_valid_name(action) {
        return None;
    }
    Some(NotifyEntry {
        code: code.to_string(),
        action: action.to_string(),
        func: func.to_string(),
    })
}

/// Emits the `apply` body from the symbol table's aggregated metadata.
pub struct DispatchBuilder<'a> {
    symtab: &'a SymbolTable,
    errors: &'a ErrorSink,
}

impl<'a> DispatchBuilder<'a> {
    pub fn new(symtab: &'a SymbolTable, errors: &'a ErrorSink) -> Self {
        Self { symtab, errors }
    }

    /// Build the complete function body: local count, dispatch state
    /// machine, terminating `end`, all length-prefixed.
    pub fn build(&self) -> Vec<u8> {
        let mut os = Vec::new();
        write_uleb128(&mut os, 0);

        if let Some(ctors) = self.function_index("__wasm_call_ctors") {
            if ctors != 0 {
                write_u8(&mut os, OPCODE_CALL);
                write_uleb128(&mut os, ctors as u64);
            }
        }

        let pre = self.function_index("pre_dispatch");
        if let Some(pre_idx) = pre {
            self.emit_get_locals(&mut os, &[0, 1, 2]);
            write_u8(&mut os, OPCODE_CALL);
            write_uleb128(&mut os, pre_idx as u64);
            write_u8(&mut os, OPCODE_IF);
            write_u8(&mut os, BLOCKTYPE_VOID);
        }

        // if receiver == code, this is one of our own actions.
        self.emit_get_locals(&mut os, &[0, 1]);
        write_u8(&mut os, OPCODE_I64_EQ);
        write_u8(&mut os, OPCODE_IF);
        write_u8(&mut os, BLOCKTYPE_VOID);
        self.emit_action_dispatch(&mut os);
        write_u8(&mut os, OPCODE_ELSE);
        self.emit_notify_dispatch(&mut os);
        write_u8(&mut os, OPCODE_END);

        if let Some(dtors) = self.function_index("__cxa_finalize") {
            if dtors != 0 {
                write_u8(&mut os, OPCODE_I32_CONST);
                write_sleb128(&mut os, 0);
                write_u8(&mut os, OPCODE_CALL);
                write_uleb128(&mut os, dtors as u64);
            }
        }
        if pre.is_some() {
            write_u8(&mut os, OPCODE_END);
        }
        write_u8(&mut os, OPCODE_END);

        let mut body = Vec::new();
        write_uleb128(&mut body, os.len() as u64);
        body.extend_from_slice(&os);
        body
    }

    fn function_index(&self, name: &str) -> Option<u32> {
        let id = self.symtab.find(name)?;
        let f = self.symtab.symbol(id).as_function()?;
        f.function_index
            .or_else(|| f.function.and_then(|r| self.symtab.function(r).function_index))
    }

    fn required_function_index(&self, name: &str) -> Option<u32> {
        let index = self.function_index(name);
        if index.is_none() {
            self.errors
                .error(format!("dispatch: function not found in symbol table: {name}"));
        }
        index
    }

    fn emit_get_locals(&self, os: &mut Vec<u8>, locals: &[u32]) {
        for &local in locals {
            write_u8(os, OPCODE_GET_LOCAL);
            write_uleb128(os, local as u64);
        }
    }

    /// `if action == name(actname) { call func(receiver, code) }`, chained
    /// off the previous handler with an `else`. Returns whether an `if` was
    /// opened; the caller owes the matching `end`.
    fn emit_handler(&self, os: &mut Vec<u8>, entry: &ActionEntry, need_else: &mut bool) -> bool {
        let Some(index) = self.required_function_index(&entry.func) else {
            return false;
        };
        if *need_else {
            write_u8(os, OPCODE_ELSE);
        }
        *need_else = true;
        write_u8(os, OPCODE_I64_CONST);
        write_sleb128(os, string_to_name(&entry.action) as i64);
        self.emit_get_locals(os, &[2]);
        write_u8(os, OPCODE_I64_EQ);
        write_u8(os, OPCODE_IF);
        write_u8(os, BLOCKTYPE_VOID);
        self.emit_get_locals(os, &[0, 1]);
        write_u8(os, OPCODE_CALL);
        write_uleb128(os, index as u64);
        true
    }

    fn emit_assert_code(&self, os: &mut Vec<u8>, error_code: u64) {
        let Some(assert_idx) = self.required_function_index("snax_assert_code") else {
            return;
        };
        write_u8(os, OPCODE_I32_CONST);
        write_sleb128(os, 0);
        write_u8(os, OPCODE_I64_CONST);
        write_sleb128(os, error_code as i64);
        write_u8(os, OPCODE_CALL);
        write_uleb128(os, assert_idx as u64);
    }

    fn emit_post_dispatch(&self, os: &mut Vec<u8>, index: u32) {
        self.emit_get_locals(os, &[0, 1, 2]);
        write_u8(os, OPCODE_CALL);
        write_uleb128(os, index as u64);
    }

    /// First-occurrence-deduplicated action entries across all objects.
    fn gather_actions(&self) -> Vec<ActionEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for file in &self.symtab.object_files {
            for raw in &file.snax_actions {
                if !seen.insert(raw.clone()) {
                    continue;
                }
                match parse_action_entry(raw) {
                    Some(entry) => entries.push(entry),
                    None => self
                        .errors
                        .error(format!("malformed action entry {raw:?} in {}", file.name)),
                }
            }
        }
        entries
    }

    /// Notify entries grouped by code name, first-occurrence order.
    fn gather_notify(&self) -> IndexMap<String, Vec<ActionEntry>> {
        let mut seen = HashSet::new();
        let mut handlers: IndexMap<String, Vec<ActionEntry>> = IndexMap::new();
        for file in &self.symtab.object_files {
            for raw in &file.snax_notify {
                if !seen.insert(raw.clone()) {
                    continue;
                }
                match parse_notify_entry(raw) {
                    Some(entry) => handlers.entry(entry.code.clone()).or_default().push(
                        ActionEntry { action: entry.action, func: entry.func },
                    ),
                    None => self
                        .errors
                        .error(format!("malformed notify entry {raw:?} in {}", file.name)),
                }
            }
        }
        handlers
    }

    fn emit_action_dispatch(&self, os: &mut Vec<u8>) {
        let entries = self.gather_actions();
        let mut opened = 0;
        let mut need_else = false;
        for entry in &entries {
            if self.emit_handler(os, entry, &mut need_else) {
                opened += 1;
            }
        }
        if opened > 0 {
            write_u8(os, OPCODE_ELSE);
        }

        // No handler matched: only a fault unless we are "snax" itself.
        self.emit_get_locals(os, &[0]);
        write_u8(os, OPCODE_I64_CONST);
        write_sleb128(os, string_to_name("snax") as i64);
        write_u8(os, OPCODE_I64_NE);
        write_u8(os, OPCODE_IF);
        write_u8(os, BLOCKTYPE_VOID);
        self.emit_assert_code(os, SNAX_ERROR_NO_ACTION);
        if let Some(post_idx) = self.function_index("post_dispatch") {
            write_u8(os, OPCODE_ELSE);
            self.emit_post_dispatch(os, post_idx);
        }
        write_u8(os, OPCODE_END);

        for _ in 0..opened {
            write_u8(os, OPCODE_END);
        }
    }

    fn emit_notify_dispatch(&self, os: &mut Vec<u8>) {
        let handlers = self.gather_notify();

        self.emit_get_locals(os, &[0]);
        write_u8(os, OPCODE_I64_CONST);
        write_sleb128(os, string_to_name("snax") as i64);
        write_u8(os, OPCODE_I64_NE);
        write_u8(os, OPCODE_IF);
        write_u8(os, BLOCKTYPE_VOID);

        // Without an explicit onerror handler, an error notification from
        // "snax" must fault instead of being silently dropped.
        let has_onerror_handler = handlers
            .get("snax")
            .is_some_and(|entries| entries.iter().any(|e| e.action == "onerror"));
        if !has_onerror_handler {
            write_u8(os, OPCODE_I64_CONST);
            write_sleb128(os, string_to_name("snax") as i64);
            self.emit_get_locals(os, &[1]);
            write_u8(os, OPCODE_I64_EQ);
            write_u8(os, OPCODE_IF);
            write_u8(os, BLOCKTYPE_VOID);
            write_u8(os, OPCODE_I64_CONST);
            write_sleb128(os, string_to_name("onerror") as i64);
            self.emit_get_locals(os, &[2]);
            write_u8(os, OPCODE_I64_EQ);
            write_u8(os, OPCODE_IF);
            write_u8(os, BLOCKTYPE_VOID);
            self.emit_assert_code(os, SNAX_ERROR_ONERROR);
            write_u8(os, OPCODE_END);
            write_u8(os, OPCODE_END);
        }

        // else-if chain over code names; the wildcard handlers and
        // post_dispatch land in the trailing else.
        let mut code_opened = 0;
        for (code, entries) in &handlers {
            if code == "*" {
                continue;
            }
            if code_opened > 0 {
                write_u8(os, OPCODE_ELSE);
            }
            write_u8(os, OPCODE_I64_CONST);
            write_sleb128(os, string_to_name(code) as i64);
            self.emit_get_locals(os, &[1]);
            write_u8(os, OPCODE_I64_EQ);
            write_u8(os, OPCODE_IF);
            write_u8(os, BLOCKTYPE_VOID);
            code_opened += 1;

            let mut inner_opened = 0;
            let mut need_else = false;
            for entry in entries {
                if self.emit_handler(os, entry, &mut need_else) {
                    inner_opened += 1;
                }
            }
            for _ in 0..inner_opened {
                write_u8(os, OPCODE_END);
            }
        }

        let wildcard = handlers.get("*").map(Vec::as_slice).unwrap_or(&[]);
        let post = self.function_index("post_dispatch");
        if !wildcard.is_empty() || post.is_some() {
            if code_opened > 0 {
                write_u8(os, OPCODE_ELSE);
            }
            let mut inner_opened = 0;
            let mut need_else = false;
            for entry in wildcard {
                if self.emit_handler(os, entry, &mut need_else) {
                    inner_opened += 1;
                }
            }
            if let Some(post_idx) = post {
                if inner_opened > 0 {
                    write_u8(os, OPCODE_ELSE);
                }
                self.emit_post_dispatch(os, post_idx);
            }
            for _ in 0..inner_opened {
                write_u8(os, OPCODE_END);
            }
        }

        for _ in 0..code_opened {
            write_u8(os, OPCODE_END);
        }

        write_u8(os, OPCODE_END);
    }
}
