use std::fmt;

use indexmap::IndexMap;
use serde::de::{ self, Deserializer, MapAccess, SeqAccess, Visitor };
use serde::ser::{ SerializeMap, SerializeSeq, Serializer };
use serde::{ Deserialize, Serialize };

use Nested::*;

/// The data that flows through the engine. Input files, intermediate
/// results and responses are all made of these. Mappings keep their
/// insertion order (IndexMap) so that flattening and re-inflating a
/// structure round-trips without shuffling keys, which also keeps the
/// canonical cache encoding honest.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            _ => false
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None
        }
    }

    /// Look up a map key on this value.
    pub fn get(&self, key : &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Look up a list position on this value.
    pub fn at(&self, idx : usize) -> Option<&Value> {
        self.as_list().and_then(|items| items.get(idx))
    }

    /// Follow a sequence of dotted-path segments; purely numeric
    /// segments index into lists, everything else into maps.
    pub fn dig(&self, segments : &[&str]) -> Option<&Value> {
        let mut cursor = self;
        for segment in segments {
            cursor = match segment.parse::<usize>() {
                Ok(idx) => cursor.at(idx)?,
                Err(_) => cursor.get(segment)?,
            };
        }
        Some(cursor)
    }
}

impl From<i64> for Value {
    fn from(n : i64) -> Value { Value::Int(n) }
}

impl From<f64> for Value {
    fn from(x : f64) -> Value { Value::Float(x) }
}

impl From<bool> for Value {
    fn from(b : bool) -> Value { Value::Bool(b) }
}

impl From<&str> for Value {
    fn from(s : &str) -> Value { Value::Str(String::from(s)) }
}

impl From<String> for Value {
    fn from(s : String) -> Value { Value::Str(s) }
}

impl From<Vec<Value>> for Value {
    fn from(items : Vec<Value>) -> Value { Value::List(items) }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer : S) -> Result<S::Ok, S::Error>
    where S : Serializer {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            },
            Value::Map(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (key, val) in map {
                    m.serialize_entry(key, val)?;
                }
                m.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f : &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any yaml or json value")
    }

    fn visit_bool<E : de::Error>(self, b : bool) -> Result<Value, E> { Ok(Value::Bool(b)) }

    fn visit_i64<E : de::Error>(self, n : i64) -> Result<Value, E> { Ok(Value::Int(n)) }

    fn visit_u64<E : de::Error>(self, n : u64) -> Result<Value, E> {
        if n <= i64::max_value() as u64 {
            Ok(Value::Int(n as i64))
        } else {
            Ok(Value::Float(n as f64))
        }
    }

    fn visit_f64<E : de::Error>(self, x : f64) -> Result<Value, E> { Ok(Value::Float(x)) }

    fn visit_str<E : de::Error>(self, s : &str) -> Result<Value, E> { Ok(Value::Str(String::from(s))) }

    fn visit_string<E : de::Error>(self, s : String) -> Result<Value, E> { Ok(Value::Str(s)) }

    fn visit_unit<E : de::Error>(self) -> Result<Value, E> { Ok(Value::Null) }

    fn visit_none<E : de::Error>(self) -> Result<Value, E> { Ok(Value::Null) }

    fn visit_some<D : Deserializer<'de>>(self, d : D) -> Result<Value, D::Error> {
        d.deserialize_any(ValueVisitor)
    }

    fn visit_seq<A : SeqAccess<'de>>(self, mut seq : A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A : MapAccess<'de>>(self, mut access : A) -> Result<Value, A::Error> {
        let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, val)) = access.next_entry::<String, Value>()? {
            map.insert(key, val);
        }
        Ok(Value::Map(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer : D) -> Result<Value, D::Error>
    where D : Deserializer<'de> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A scalar-or-nested-list, the shape produced by tree expansion and
/// consumed by reshaping. Path expansion yields `Nested<QueryPath>`,
/// responses are built from `Nested<Value>`. Keeping this separate from
/// `Value` lets expansion carry paths without stringly-typed detours.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested<T> {
    One(T),
    Many(Vec<Nested<T>>),
}

impl<T> Nested<T> {
    /// Number of leaves.
    pub fn count(&self) -> usize {
        match self {
            One(_) => 1,
            Many(items) => items.iter().map(|item| item.count()).sum()
        }
    }

    /// Leaves in depth-first order.
    pub fn flatten(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out : &mut Vec<&'a T>) {
        match self {
            One(item) => out.push(item),
            Many(items) => for item in items {
                item.collect(out);
            }
        }
    }

    pub fn into_flatten(self) -> Vec<T> {
        match self {
            One(item) => vec![item],
            Many(items) => items.into_iter()
                                .flat_map(|item| item.into_flatten())
                                .collect()
        }
    }

    pub fn map<U>(self, f : &mut impl FnMut(T) -> U) -> Nested<U> {
        match self {
            One(item) => One(f(item)),
            Many(items) => Many(items.into_iter().map(|item| item.map(f)).collect())
        }
    }

    /// Replace the leaf at the list coordinates. Empty coordinates
    /// address a bare `One`. Returns false when the coordinates point
    /// outside the structure.
    pub fn set_at(&mut self, coords : &[usize], value : T) -> bool {
        match (coords.split_first(), &mut *self) {
            (None, One(slot)) => {
                *slot = value;
                true
            },
            (Some((first, rest)), Many(items)) => {
                match items.get_mut(*first) {
                    Some(child) => child.set_at(rest, value),
                    None => false
                }
            },
            _ => false
        }
    }
}

impl Nested<Value> {
    /// Collapse into a `Value`, nested lists becoming `Value::List`.
    pub fn into_value(self) -> Value {
        match self {
            One(value) => value,
            Many(items) => Value::List(items.into_iter()
                                            .map(|item| item.into_value())
                                            .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let yml = "
items:
  - x: 1
  - x: 2.5
name: probe
flag: true
missing: null
";
        serde_yaml::from_str(yml).unwrap()
    }

    #[test]
    fn deserializes_nested_yaml() {
        let v = sample();
        assert_eq!(v.dig(&["items", "0", "x"]), Some(&Value::Int(1)));
        assert_eq!(v.dig(&["items", "1", "x"]), Some(&Value::Float(2.5)));
        assert_eq!(v.get("name").and_then(Value::as_str), Some("probe"));
        assert!(v.get("missing").unwrap().is_null());
    }

    #[test]
    fn serde_round_trip() {
        let v = sample();
        let json = serde_json::to_string(&v).unwrap();
        let back : Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn nested_set_at_and_flatten() {
        let mut n = Many(vec![
            Many(vec![One(Value::Null), One(Value::Null)]),
            Many(vec![One(Value::Null)]),
        ]);
        assert_eq!(n.count(), 3);
        assert!(n.set_at(&[1, 0], Value::Int(7)));
        assert!(!n.set_at(&[2, 0], Value::Int(9)));
        let v = n.into_value();
        assert_eq!(v.dig(&["1", "0"]), Some(&Value::Int(7)));
    }
}
