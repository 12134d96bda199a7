//! Wire encoding primitives.
//!
//! The only module that knows the binary layout of the output: LEB128
//! integers, length-prefixed strings, limits, signatures, init expressions,
//! import/export records, and section/subsection framing. Everything writes
//! into a growable byte sink; framing is done by building the body first and
//! prefixing its length afterwards.

use crate::wasm::{
    Export, Global, Import, ImportKind, InitExpr, Limits, Signature, LIMITS_HAS_MAX, OPCODE_END,
    OPCODE_F32_CONST, OPCODE_F64_CONST, OPCODE_GET_GLOBAL, OPCODE_I32_CONST, OPCODE_I64_CONST,
    TYPE_FUNC,
};

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_uleb128(buf: &mut Vec<u8>, v: u64) {
    leb128::write::unsigned(buf, v).unwrap();
}

pub fn write_sleb128(buf: &mut Vec<u8>, v: i64) {
    leb128::write::signed(buf, v).unwrap();
}

pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
}

/// ULEB128 length followed by the raw bytes, no terminator.
pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_uleb128(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

pub fn write_limits(buf: &mut Vec<u8>, limits: &Limits) {
    write_uleb128(buf, limits.flags as u64);
    write_uleb128(buf, limits.initial as u64);
    if limits.flags & LIMITS_HAS_MAX != 0 {
        write_uleb128(buf, limits.max as u64);
    }
}

pub fn write_sig(buf: &mut Vec<u8>, sig: &Signature) {
    write_u8(buf, TYPE_FUNC);
    write_uleb128(buf, sig.params.len() as u64);
    for p in &sig.params {
        write_u8(buf, p.encoding());
    }
    write_uleb128(buf, sig.results.len() as u64);
    for r in &sig.results {
        write_u8(buf, r.encoding());
    }
}

pub fn write_init_expr(buf: &mut Vec<u8>, expr: &InitExpr) {
    match *expr {
        InitExpr::I32Const(v) => {
            write_u8(buf, OPCODE_I32_CONST);
            write_sleb128(buf, v as i64);
        }
        InitExpr::I64Const(v) => {
            write_u8(buf, OPCODE_I64_CONST);
            write_sleb128(buf, v);
        }
        InitExpr::F32Const(bits) => {
            write_u8(buf, OPCODE_F32_CONST);
            write_u32_le(buf, bits);
        }
        InitExpr::F64Const(bits) => {
            write_u8(buf, OPCODE_F64_CONST);
            buf.extend_from_slice(&bits.to_le_bytes());
        }
        InitExpr::GetGlobal(index) => {
            write_u8(buf, OPCODE_GET_GLOBAL);
            write_uleb128(buf, index as u64);
        }
    }
    write_u8(buf, OPCODE_END);
}

pub fn write_global(buf: &mut Vec<u8>, global: &Global) {
    write_u8(buf, global.ty.ty.encoding());
    write_u8(buf, global.ty.mutable as u8);
    write_init_expr(buf, &global.init);
}

pub fn write_export(buf: &mut Vec<u8>, export: &Export) {
    write_str(buf, &export.name);
    write_u8(buf, export.kind.encoding());
    write_uleb128(buf, export.index as u64);
}

/// Every import lives in the "env" module.
pub fn write_import(buf: &mut Vec<u8>, import: &Import) {
    write_str(buf, "env");
    write_str(buf, &import.field);
    match &import.kind {
        ImportKind::Function { sig_index } => {
            write_u8(buf, 0x00);
            write_uleb128(buf, *sig_index as u64);
        }
        ImportKind::Table { limits } => {
            write_u8(buf, 0x01);
            write_u8(buf, crate::wasm::TYPE_ANYFUNC);
            write_limits(buf, limits);
        }
        ImportKind::Memory { limits } => {
            write_u8(buf, 0x02);
            write_limits(buf, limits);
        }
        ImportKind::Global(ty) => {
            write_u8(buf, 0x03);
            write_u8(buf, ty.ty.encoding());
            write_u8(buf, ty.mutable as u8);
        }
    }
}

// Relocation targets are emitted as fixed-width 5-byte LEBs so that patching
// them never changes the size of the surrounding code.

pub fn patch_uleb128(buf: &mut [u8], v: u32) {
    let mut v = v as u64;
    for b in buf.iter_mut().take(4) {
        *b = (v as u8 & 0x7f) | 0x80;
        v >>= 7;
    }
    buf[4] = v as u8 & 0x7f;
}

pub fn patch_sleb128(buf: &mut [u8], v: i32) {
    let mut v = v as i64;
    for b in buf.iter_mut().take(4) {
        *b = (v as u8 & 0x7f) | 0x80;
        v >>= 7;
    }
    buf[4] = v as u8 & 0x7f;
}

pub fn patch_u32_le(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

/// A length-prefixed subsection inside a "linking" or "name" section: the
/// body is accumulated first, then framed as `id` + body length + body.
pub struct SubSection {
    id: u8,
    pub body: Vec<u8>,
}

impl SubSection {
    pub fn new(id: u8) -> Self {
        Self { id, body: Vec::new() }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_uleb128(out, self.id as u64);
        write_uleb128(out, self.body.len() as u64);
        out.extend_from_slice(&self.body);
    }
}
