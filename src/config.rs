//! Link configuration.
//!
//! Read-only, bound before the writer runs. The struct doubles as the
//! command-line surface for the external driver (via `Config::parse()`);
//! library users and tests construct it with `Config::default()` and set
//! fields directly.

use clap::Parser;
use std::path::PathBuf;

use crate::wasm::{Export, ExternalKind};

/// Options recognized by the output-generation core.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Output file path.
    #[arg(short = 'o', long = "output", default_value = "a.out.wasm")]
    pub output_file: PathBuf,

    /// Emit a relocatable object with linking metadata instead of an
    /// executable module.
    #[arg(long)]
    pub relocatable: bool,

    /// Import the memory from "env" instead of defining it.
    #[arg(long)]
    pub import_memory: bool,

    /// Import the function table from "env" instead of defining it.
    #[arg(long)]
    pub import_table: bool,

    /// Export the function table.
    #[arg(long)]
    pub export_table: bool,

    /// Export hidden symbols too.
    #[arg(long)]
    pub export_all: bool,

    /// Coalesce `.text.*`/`.data.*`/`.bss.*` data segments by prefix.
    #[arg(long)]
    pub merge_data_segments: bool,

    /// Place the explicit stack below all static data.
    #[arg(long)]
    pub stack_first: bool,

    /// Drop `.debug_*` custom sections and the "name" section.
    #[arg(long)]
    pub strip_debug: bool,

    /// Strip everything strip-debug strips.
    #[arg(long)]
    pub strip_all: bool,

    /// Size of the explicit stack region in bytes, 16-byte aligned.
    #[arg(long = "stack-size", default_value_t = 65536)]
    pub z_stack_size: u32,

    /// Lowest address available to static data.
    #[arg(long, default_value_t = 1024)]
    pub global_base: u32,

    /// Initial memory size in bytes, 64 KiB aligned. 0 means "as laid out".
    #[arg(long, default_value_t = 0)]
    pub initial_memory: u32,

    /// Maximum memory size in bytes, 64 KiB aligned. 0 means no maximum.
    #[arg(long, default_value_t = 0)]
    pub max_memory: u32,

    /// Restrict symbol exports to the given names (repeatable). An empty
    /// list exports everything the visibility rules allow.
    #[arg(long = "export")]
    pub exports: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_file: PathBuf::from("a.out.wasm"),
            relocatable: false,
            import_memory: false,
            import_table: false,
            export_table: false,
            export_all: false,
            merge_data_segments: false,
            stack_first: false,
            strip_debug: false,
            strip_all: false,
            z_stack_size: 65536,
            global_base: 1024,
            initial_memory: 0,
            max_memory: 0,
            exports: Vec::new(),
        }
    }
}

impl Config {
    /// The export predicate. Memory and table exports are structural and
    /// always pass; symbol exports pass unless an allowlist was given and
    /// the name is not on it.
    pub fn should_export(&self, export: &Export) -> bool {
        matches!(export.kind, ExternalKind::Memory | ExternalKind::Table)
            || self.exports.is_empty()
            || self.exports.iter().any(|name| *name == export.name)
    }
}
