//! ABI emission.
//!
//! Each object file may carry a JSON ABI fragment describing its actions,
//! tables and types. After the module is committed, the fragments are folded
//! into one document and written next to the output file with an `.abi`
//! extension. Parse and merge failures are fatal.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::Path;

/// Folds ABI fragments into a single document. Records inside arrays are
/// keyed by their `"name"` field where present, so the same action declared
/// by two objects merges instead of duplicating.
pub struct AbiMerger {
    abi: Value,
}

impl AbiMerger {
    pub fn new(seed: Value) -> Self {
        Self { abi: seed }
    }

    pub fn set_abi(&mut self, abi: Value) {
        self.abi = abi;
    }

    pub fn merge(&self, other: &Value) -> Result<Value> {
        let (Value::Object(base), Value::Object(other)) = (&self.abi, other) else {
            anyhow::bail!("abi fragment is not a JSON object");
        };
        Ok(Value::Object(merge_objects(base, other)))
    }

    pub fn abi_string(&self) -> String {
        serde_json::to_string_pretty(&self.abi).expect("abi serialization")
    }
}

fn merge_objects(base: &Map<String, Value>, other: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in other {
        match (merged.get(key), value) {
            (Some(Value::Array(a)), Value::Array(b)) => {
                merged.insert(key.clone(), Value::Array(merge_arrays(a, b)));
            }
            (Some(Value::Object(a)), Value::Object(b)) => {
                merged.insert(key.clone(), Value::Object(merge_objects(a, b)));
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn merge_arrays(base: &[Value], other: &[Value]) -> Vec<Value> {
    let mut merged = base.to_vec();
    for item in other {
        let key = item.get("name");
        let existing = merged.iter_mut().find(|m| match key {
            Some(name) => m.get("name") == Some(name),
            None => *m == item,
        });
        match existing {
            Some(slot) => *slot = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// Fold all gathered fragments, seeded with the last one, and write the
/// result to `output_file` with its extension replaced by `.abi`.
pub fn write_abi(abis: &[String], output_file: &Path) -> Result<()> {
    let Some(last) = abis.last() else {
        return Ok(());
    };
    let seed: Value =
        serde_json::from_str(last).context("failed to write abi: invalid JSON fragment")?;
    let mut merger = AbiMerger::new(seed);
    for abi in abis {
        let fragment: Value =
            serde_json::from_str(abi).context("failed to write abi: invalid JSON fragment")?;
        let merged = merger.merge(&fragment).context("failed to write abi")?;
        merger.set_abi(merged);
    }

    let path = output_file.with_extension("abi");
    tracing::debug!("writing: {}", path.display());
    std::fs::write(&path, merger.abi_string())
        .with_context(|| format!("failed to open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fragments_merge_by_record_name() {
        let merger = AbiMerger::new(json!({
            "version": "snax::abi/1.0",
            "actions": [{"name": "transfer", "type": "transfer"}],
        }));
        let merged = merger
            .merge(&json!({
                "actions": [
                    {"name": "transfer", "type": "transfer2"},
                    {"name": "issue", "type": "issue"},
                ],
            }))
            .unwrap();
        let actions = merged["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0]["type"], "transfer2");
        assert_eq!(actions[1]["name"], "issue");
        assert_eq!(merged["version"], "snax::abi/1.0");
    }

    #[test]
    fn non_object_fragment_is_an_error() {
        let merger = AbiMerger::new(json!([1, 2]));
        assert!(merger.merge(&json!({})).is_err());
    }

    #[test]
    fn abi_file_lands_next_to_the_output() {
        let dir = std::env::temp_dir().join("snax-ld-abi-test");
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("contract.wasm");
        let fragments = vec![
            json!({"actions": [{"name": "transfer", "type": "transfer"}]}).to_string(),
            json!({"version": "snax::abi/1.0", "actions": []}).to_string(),
        ];
        write_abi(&fragments, &out).unwrap();
        let written = std::fs::read_to_string(dir.join("contract.abi")).unwrap();
        let value: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["version"], "snax::abi/1.0");
        assert_eq!(value["actions"][0]["name"], "transfer");
    }
}
