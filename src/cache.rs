use std::fs;
use std::path::PathBuf;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::errors::{ HubitError, Result };
use crate::store::FlatData;
use crate::value::Value;

/// Canonical encoding used for every content-addressed identity : JSON
/// with map keys emitted in sorted order and list elements in place.
/// Two values that compare equal encode identically no matter how their
/// maps were built up, which is what makes the worker cache keys and
/// the model identity deterministic.
pub fn canonical(value : &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value : &Value, out : &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(x) => out.push_str(&format!("{:?}", x)),
        Value::Str(s) => {
            // serde_json handles the escaping rules
            match serde_json::to_string(s) {
                Ok(escaped) => out.push_str(&escaped),
                Err(_) => out.push_str(s)
            }
        },
        Value::List(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        Value::Map(map) => {
            let mut keys : Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                match serde_json::to_string(key) {
                    Ok(escaped) => out.push_str(&escaped),
                    Err(_) => out.push_str(key)
                }
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// A worker's content-addressed identity before its upstream providers
/// are known : component id, component version and the sorted list of
/// (consumed path, canonical value) pairs, hashed with a seedless
/// 64-bit hash so the identity is stable across runs.
pub fn worker_key(
    component_id : &str,
    version : Option<&str>,
    consumed : &[(String, &Value)],
) -> u64 {
    let mut pairs : Vec<String> = consumed.iter()
                                          .map(|(path, value)| format!("{}={}", path, canonical(value)))
                                          .collect();
    pairs.sort();
    let ingest = format!(
        "{}|{}|{}",
        component_id,
        version.unwrap_or("null"),
        pairs.join(";"),
    );
    fxhash::hash64(&ingest)
}

/// The final cache key of a worker that consumes results : its own
/// input-only identity combined with the (sorted) identities of the
/// providers that feed it. Sorting makes the key independent of
/// completion order.
pub fn combine_keys(base : u64, upstream : &[u64]) -> u64 {
    let mut upstream : Vec<u64> = upstream.to_vec();
    upstream.sort();
    upstream.dedup();
    let ingest = format!("{:016x}|{:?}", base, upstream);
    fxhash::hash64(&ingest)
}

/// Model identity : hash of the normalized configuration and the
/// input. Keys one persisted artifact per model+input.
pub fn model_id(config_json : &str, input : &Value) -> String {
    let ingest = format!("{}|{}", config_json, canonical(input));
    format!("{:016x}", fxhash::hash64(&ingest))
}

/// Where whole-model results are persisted between `get` calls. One
/// opaque artifact per model identity; a miss reads as an empty store.
pub trait ResultsCache : Send + Sync {
    fn store(&self, model_id : &str, results : &FlatData) -> Result<()>;
    fn load(&self, model_id : &str) -> Result<Option<FlatData>>;
    fn clear(&self, model_id : &str) -> Result<()>;
}

/// One JSON artifact per model identity under a directory.
pub struct FileCache {
    dir : PathBuf,
}

impl FileCache {
    pub fn new(dir : impl Into<PathBuf>) -> Self {
        FileCache { dir : dir.into() }
    }

    fn artifact(&self, model_id : &str) -> PathBuf {
        self.dir.join(format!("{}.json", model_id))
    }
}

impl ResultsCache for FileCache {
    fn store(&self, model_id : &str, results : &FlatData) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| HubitError::Cache(format!("cannot create '{}' : {}", self.dir.display(), e)))?;
        results.to_file(&self.artifact(model_id))
    }

    fn load(&self, model_id : &str) -> Result<Option<FlatData>> {
        let path = self.artifact(model_id);
        if !path.exists() {
            return Ok(None)
        }
        FlatData::from_file(&path).map(Some)
    }

    fn clear(&self, model_id : &str) -> Result<()> {
        let path = self.artifact(model_id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| HubitError::Cache(format!("cannot remove '{}' : {}", path.display(), e)))?;
        }
        Ok(())
    }
}

/// Keeps the artifacts in memory. Handy in tests and for callers that
/// want dedup within a process without touching disk.
#[derive(Default)]
pub struct MemoryCache {
    inner : RwLock<HashMap<String, FlatData>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache { inner : RwLock::new(HashMap::new()) }
    }
}

impl ResultsCache for MemoryCache {
    fn store(&self, model_id : &str, results : &FlatData) -> Result<()> {
        self.inner.write().insert(String::from(model_id), results.clone());
        Ok(())
    }

    fn load(&self, model_id : &str) -> Result<Option<FlatData>> {
        Ok(self.inner.read().get(model_id).cloned())
    }

    fn clear(&self, model_id : &str) -> Result<()> {
        self.inner.write().remove(model_id);
        Ok(())
    }
}
