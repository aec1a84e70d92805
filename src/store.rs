use std::fs::File;
use std::io::{ BufReader, BufWriter };
use std::path::Path;

use indexmap::IndexMap;
use serde::{ Deserialize, Serialize };

use crate::errors::{ HubitError, Result };
use crate::value::Value;

/// The flat store : a mapping from internal dotted path to value. The
/// input is flattened into one of these once per `set_input`; every
/// worker writes its provided values into another; responses are read
/// straight out of it. List positions become numeric path components so
/// `{"a": [{"b": 1}]}` is stored as `a.0.b = 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatData(IndexMap<String, Value>);

/// A dotted prefix at which flattening halts, preserving the subtree as
/// one opaque value. A segment of `:` matches any list position, so
/// `level0.:.level1` stops below every element of `level0`.
#[derive(Debug, Clone)]
pub struct StopSpec(Vec<String>);

impl StopSpec {
    pub fn new(pattern : impl Into<String>) -> Self {
        StopSpec(pattern.into().split('.').map(String::from).collect())
    }

    fn matches(&self, segments : &[&str]) -> bool {
        self.0.len() == segments.len()
            && self.0.iter().zip(segments.iter()).all(|(pat, seg)| {
                pat == ":" && seg.chars().all(|c| c.is_ascii_digit()) || pat == seg
            })
    }
}

impl FlatData {
    pub fn new() -> Self {
        FlatData(IndexMap::new())
    }

    /// Flatten a nested value.
    pub fn from_value(value : &Value) -> Self {
        FlatData::from_value_clipped(value, &[])
    }

    /// Flatten, halting wherever a stop pattern matches the path built
    /// so far.
    pub fn from_value_clipped(value : &Value, stop_at : &[StopSpec]) -> Self {
        let mut store = FlatData::new();
        let mut segments = Vec::new();
        flatten_into(value, &mut segments, stop_at, &mut store);
        store
    }

    /// Rebuild the nested value. Purely numeric path components are
    /// interpreted as list positions, preserving order; positions never
    /// written come back as nulls.
    pub fn inflate(&self) -> Result<Value> {
        let mut root = Slot::Empty;
        for (key, value) in self.0.iter() {
            let segments : Vec<&str> = key.split('.').collect();
            slot_insert(&mut root, key, &segments, value.clone())?;
        }
        Ok(root.into_value())
    }

    pub fn insert(&mut self, path : impl Into<String>, value : Value) {
        self.0.insert(path.into(), value);
    }

    pub fn get(&self, path : &str) -> Option<&Value> {
        self.0.get(path)
    }

    pub fn contains_key(&self, path : &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn extend(&mut self, other : &FlatData) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<String, Value> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Write the store as one JSON artifact.
    pub fn to_file(&self, path : &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| HubitError::Cache(format!("cannot create '{}' : {}", path.display(), e)))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .map_err(|e| HubitError::Cache(format!("cannot serialize '{}' : {}", path.display(), e)))
    }

    pub fn from_file(path : &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| HubitError::Cache(format!("cannot open '{}' : {}", path.display(), e)))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| HubitError::Cache(format!("cannot deserialize '{}' : {}", path.display(), e)))
    }
}

fn flatten_into(value : &Value, segments : &mut Vec<String>, stop_at : &[StopSpec], out : &mut FlatData) {
    if !segments.is_empty() {
        let borrowed : Vec<&str> = segments.iter().map(|s| s.as_str()).collect();
        if stop_at.iter().any(|spec| spec.matches(&borrowed)) {
            out.insert(segments.join("."), value.clone());
            return
        }
    }

    match value {
        Value::Map(map) => for (key, child) in map {
            segments.push(key.clone());
            flatten_into(child, segments, stop_at, out);
            segments.pop();
        },
        Value::List(items) => for (idx, child) in items.iter().enumerate() {
            segments.push(idx.to_string());
            flatten_into(child, segments, stop_at, out);
            segments.pop();
        },
        scalar => {
            out.insert(segments.join("."), scalar.clone());
        }
    }
}

/// Builder for `inflate`. Lists are grown with empty slots so indices
/// can arrive in any order.
enum Slot {
    Empty,
    Leaf(Value),
    List(Vec<Slot>),
    Map(IndexMap<String, Slot>),
}

fn slot_insert(slot : &mut Slot, full_key : &str, segments : &[&str], value : Value) -> Result<()> {
    let (head, rest) = match segments.split_first() {
        Some(pair) => pair,
        None => {
            match slot {
                Slot::Empty => {
                    *slot = Slot::Leaf(value);
                    return Ok(())
                },
                _ => return Err(HubitError::malformed(full_key, "path is a prefix of another key"))
            }
        }
    };

    if let Ok(idx) = head.parse::<usize>() {
        if let Slot::Empty = slot {
            *slot = Slot::List(Vec::new());
        }
        match slot {
            Slot::List(items) => {
                while items.len() <= idx {
                    items.push(Slot::Empty);
                }
                slot_insert(&mut items[idx], full_key, rest, value)
            },
            _ => Err(HubitError::malformed(full_key, "mixes list and mapping positions"))
        }
    } else {
        if let Slot::Empty = slot {
            *slot = Slot::Map(IndexMap::new());
        }
        match slot {
            Slot::Map(map) => {
                let child = map.entry(String::from(*head)).or_insert(Slot::Empty);
                slot_insert(child, full_key, rest, value)
            },
            _ => Err(HubitError::malformed(full_key, "mixes list and mapping positions"))
        }
    }
}

impl Slot {
    fn into_value(self) -> Value {
        match self {
            Slot::Empty => Value::Null,
            Slot::Leaf(value) => value,
            Slot::List(items) => Value::List(items.into_iter().map(|s| s.into_value()).collect()),
            Slot::Map(map) => Value::Map(map.into_iter().map(|(k, s)| (k, s.into_value())).collect()),
        }
    }
}
