//! Output sections.
//!
//! One struct covers every section the writer emits: the standard sections
//! and the synthesized customs differ only in how their payload is produced,
//! which happens in `writer`. A section accumulates its payload, is framed
//! once by `finalize`, and afterwards only knows how to copy itself into the
//! output buffer at its assigned offset.

use crate::encoder::{write_sleb128, write_u8, write_uleb128};
use crate::wasm::{RelocKind, SEC_CODE, SEC_CUSTOM, SEC_DATA};

/// A relocation re-emitted into a `reloc.*` section. `offset` is relative to
/// the start of the owning section's payload; `index` has already been
/// remapped to the output symbol or type index.
#[derive(Clone, Copy, Debug)]
pub struct OutputRelocation {
    pub kind: RelocKind,
    pub offset: u32,
    pub index: u32,
    pub addend: i32,
}

pub struct OutputSection {
    pub id: u8,
    /// Custom sections only.
    pub name: String,
    /// Payload bytes, exclusive of the section header and the custom name.
    pub body: Vec<u8>,
    pub relocations: Vec<OutputRelocation>,
    offset: u64,
    data: Vec<u8>,
}

impl OutputSection {
    pub fn new(id: u8, name: &str) -> Self {
        debug_assert!(id == SEC_CUSTOM || name.is_empty());
        Self {
            id,
            name: name.to_string(),
            body: Vec::new(),
            relocations: Vec::new(),
            offset: 0,
            data: Vec::new(),
        }
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Frame the accumulated payload: section id, ULEB body length, body.
    /// Custom sections carry their name as a length-prefixed string at the
    /// start of the body.
    pub fn finalize(&mut self) {
        debug_assert!(self.data.is_empty());
        let mut payload = Vec::new();
        if self.id == SEC_CUSTOM {
            crate::encoder::write_str(&mut payload, &self.name);
        }
        payload.append(&mut self.body);

        write_u8(&mut self.data, self.id);
        write_uleb128(&mut self.data, payload.len() as u64);
        self.data.extend_from_slice(&payload);
    }

    /// Size in the output file; valid after `finalize`.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Copy the framed section into its slice of the output buffer.
    pub fn write_to(&self, out: &mut [u8]) {
        out[..self.data.len()].copy_from_slice(&self.data);
    }

    /// Name of the companion `reloc.*` section.
    pub fn reloc_section_name(&self) -> String {
        match self.id {
            SEC_CODE => "reloc.CODE".to_string(),
            SEC_DATA => "reloc.DATA".to_string(),
            SEC_CUSTOM => format!("reloc.{}", self.name),
            _ => unreachable!("relocations only attach to code, data, or custom sections"),
        }
    }

    pub fn write_relocations(&self, out: &mut Vec<u8>) {
        for reloc in &self.relocations {
            write_u8(out, reloc.kind.encoding());
            write_uleb128(out, reloc.offset as u64);
            write_uleb128(out, reloc.index as u64);
            if reloc.kind.has_addend() {
                write_sleb128(out, reloc.addend as i64);
            }
        }
    }
}
