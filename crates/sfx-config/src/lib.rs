//! Layered configuration.
//!
//! YAML layers are flattened into a single map of JSON-pointer -> leaf
//! value (scalars and arrays are leaves, mappings are paths). Later layers
//! override earlier ones leaf by leaf, and writing a leaf evicts anything
//! it shadows, so a layer may replace a whole subtree with a scalar or the
//! other way around. The map is ordered, which makes the canonical render
//! (one `pointer=value` line per leaf) and its SHA-256 deterministic
//! without a separate key-sorting pass.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

mod settings;

pub use settings::Settings;

/// Env var holding the shared secret accepted on `X-Cron-Secret` for the
/// job endpoints.
pub const ENV_CRON_SECRET: &str = "SFX_CRON_SECRET";

/// Developer escape hatch: when set to 1/true the producer may emit a
/// synthetic suffix instead of failing when every proxy is exhausted.
pub const ENV_ALLOW_MOCK_SUFFIX: &str = "SFX_ALLOW_MOCK_SUFFIX";

/// The merged view over all config layers.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    leaves: BTreeMap<String, Value>,
    /// One `pointer=value` line per leaf, pointer-sorted.
    pub canonical: String,
    /// SHA-256 hex of `canonical`.
    pub config_hash: String,
}

impl LoadedConfig {
    /// Typed settings view; missing leaves fall back to the documented
    /// defaults.
    pub fn settings(&self) -> Settings {
        Settings::from_config(self)
    }

    pub fn leaf(&self, pointer: &str) -> Option<&Value> {
        self.leaves.get(pointer)
    }

    pub fn i64_at(&self, pointer: &str) -> Option<i64> {
        self.leaf(pointer).and_then(Value::as_i64)
    }

    pub fn u64_at(&self, pointer: &str) -> Option<u64> {
        self.leaf(pointer).and_then(Value::as_u64)
    }
}

/// Read and merge YAML files in order; later files win leaf by leaf.
pub fn load_layers(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs = Vec::with_capacity(paths.len());
    for p in paths {
        docs.push(fs::read_to_string(p).with_context(|| format!("read config: {p}"))?);
    }
    let views: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layers_from_strings(&views)
}

/// Same merge over in-memory YAML documents (tests, smoke paths).
pub fn load_layers_from_strings(docs: &[&str]) -> Result<LoadedConfig> {
    let mut leaves: BTreeMap<String, Value> = BTreeMap::new();

    for (i, doc) in docs.iter().enumerate() {
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(doc).with_context(|| format!("parse config layer {i}"))?;
        let as_json = serde_json::to_value(parsed)
            .with_context(|| format!("config layer {i} is not json-representable"))?;
        collect_leaves(&mut leaves, String::new(), as_json);
    }

    let canonical: String = leaves
        .iter()
        .map(|(ptr, v)| format!("{ptr}={v}\n"))
        .collect();
    let config_hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    Ok(LoadedConfig {
        leaves,
        canonical,
        config_hash,
    })
}

/// Descend into mappings, recording scalars and arrays at their pointer.
/// An empty mapping contributes nothing (merging `{}` changes no state).
fn collect_leaves(leaves: &mut BTreeMap<String, Value>, pointer: String, value: Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_ptr = format!("{pointer}/{}", escape_segment(&key));
                collect_leaves(leaves, child_ptr, child);
            }
        }
        leaf => {
            evict_shadowed(leaves, &pointer);
            leaves.insert(pointer, leaf);
        }
    }
}

/// Remove every leaf above or below `pointer`: a leaf and a subtree cannot
/// coexist on one path.
fn evict_shadowed(leaves: &mut BTreeMap<String, Value>, pointer: &str) {
    let below = format!("{pointer}/");
    leaves.retain(|existing, _| {
        let is_descendant = existing.starts_with(&below);
        let is_ancestor = pointer.starts_with(existing.as_str())
            && pointer.as_bytes().get(existing.len()) == Some(&b'/');
        !is_descendant && !is_ancestor
    });
}

/// RFC 6901 pointer escaping for map keys.
fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
