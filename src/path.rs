use std::fmt;

use hashbrown::HashMap;
use serde::de;
use serde::{ Deserialize, Deserializer, Serialize, Serializer };

use crate::errors::{ HubitError, Result };

use ModelIndex::*;
use QueryIndex::*;

/// The wildcard character accepted in query paths ("all positions at
/// this level").
pub const IDX_WILDCARD : &str = ":";

/// An index specifier as it appears in a model path : a fixed position,
/// an index identifier shared across bindings to express co-iteration,
/// a wildcard bound to an identifier (`:@NAME`, "iterate all positions
/// at this level under NAME"), or a fixed position bound to an
/// identifier (`2@NAME`, the form decomposition relies on when several
/// components cover disjoint slices of one list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelIndex {
    Digit(usize),
    Id(String),
    WildcardId(String),
    DigitId(usize, String),
}

impl ModelIndex {
    /// The symbolic name, if the specifier carries one.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Digit(_) => None,
            Id(name) | WildcardId(name) | DigitId(_, name) => Some(name.as_str())
        }
    }

    /// The position, if the specifier fixes one.
    pub fn fixed_digit(&self) -> Option<usize> {
        match self {
            Digit(d) | DigitId(d, _) => Some(*d),
            Id(_) | WildcardId(_) => None
        }
    }
}

/// An index specifier as it appears in a query path. Digits may be
/// negative (count from the end); they are normalized against a length
/// tree before expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIndex {
    QDigit(i64),
    Wildcard,
}

/// A path as posed by a user : names separated by dots, index positions
/// in square brackets holding a digit, a negative digit or `:`.
/// `QueryPath` (and `ModelPath`) wrap the textual form; the parsed
/// specifiers are recovered on demand so the wrappers stay cheap map
/// keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryPath(String);

/// A path as declared in a component binding. Index positions hold a
/// digit, an index identifier, or a wildcard-bound identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelPath(String);

/// Bracket-counting check shared by both surface forms. Content inside
/// brackets must be a single specifier : no nesting, no dots.
pub fn balanced(path : &str) -> bool {
    let mut open = false;
    for c in path.chars() {
        match c {
            '[' if open => return false,
            '[' => open = true,
            ']' if !open => return false,
            ']' => open = false,
            _ => ()
        }
    }
    !open
}

/// Split a path into the text chunks around brackets and the raw
/// specifier strings, in appearance order. There is always exactly one
/// more chunk than specifiers; the trailing chunk may be empty.
fn split_parts(path : &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut chunks = vec![String::new()];
    let mut specs : Vec<String> = Vec::new();
    let mut current = String::new();
    let mut open = false;

    for c in path.chars() {
        match c {
            '[' if open => {
                return Err(HubitError::malformed(path, "nested '['"))
            },
            '[' => { open = true; },
            ']' if !open => {
                return Err(HubitError::malformed(path, "unmatched ']'"))
            },
            ']' => {
                if current.is_empty() {
                    return Err(HubitError::malformed(path, "empty index specifier"))
                }
                specs.push(std::mem::replace(&mut current, String::new()));
                chunks.push(String::new());
                open = false;
            },
            '.' if open => {
                return Err(HubitError::malformed(path, "dot inside index specifier"))
            },
            c if open => current.push(c),
            c => chunks.last_mut().unwrap().push(c),
        }
    }

    if open {
        return Err(HubitError::malformed(path, "unmatched '['"))
    }
    Ok((chunks, specs))
}

/// Tokenized view shared with the length tree, which substitutes
/// specifiers wholesale while expanding.
pub(crate) fn parts(path : &str) -> Result<(Vec<String>, Vec<String>)> {
    split_parts(path)
}

pub(crate) fn rebuild(chunks : &[String], specs : &[String]) -> String {
    join_parts(chunks, specs)
}

/// Inverse of `split_parts`.
fn join_parts(chunks : &[String], specs : &[String]) -> String {
    let mut out = String::with_capacity(chunks.iter().map(|c| c.len()).sum::<usize>() + specs.len() * 4);
    for (idx, chunk) in chunks.iter().enumerate() {
        out.push_str(chunk);
        if let Some(spec) = specs.get(idx) {
            out.push('[');
            out.push_str(spec);
            out.push(']');
        }
    }
    out
}

fn valid_identifier(s : &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_digits(s : &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

impl QueryPath {
    pub fn new(path : impl Into<String>) -> Self {
        QueryPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The internal dotted form used as a flat-store key :
    /// `a[2].b` becomes `a.2.b`.
    pub fn internal(&self) -> String {
        self.0.replace('[', ".").replace(']', "")
    }

    /// Brackets balanced and every specifier a (possibly negative)
    /// digit or the wildcard.
    pub fn validate(&self) -> Result<()> {
        self.indices().map(|_| ())
    }

    pub fn index_specifiers(&self) -> Result<Vec<String>> {
        split_parts(&self.0).map(|(_, specs)| specs)
    }

    pub fn indices(&self) -> Result<Vec<QueryIndex>> {
        let (_, specs) = split_parts(&self.0)?;
        specs.iter()
             .map(|spec| {
                 if spec == IDX_WILDCARD {
                     Ok(Wildcard)
                 } else {
                     spec.parse::<i64>()
                         .map(QDigit)
                         .map_err(|_| HubitError::malformed(self.as_str(), format!("invalid index specifier '{}'", spec)))
                 }
             })
             .collect()
    }

    pub fn has_wildcard(&self) -> bool {
        match self.indices() {
            Ok(indices) => indices.iter().any(|idx| *idx == Wildcard),
            Err(_) => false
        }
    }

    /// Replace the specifier at bracket position `pos`, e.g. when a
    /// decomposition pins a wildcard to one provider's digit.
    pub fn with_index_at(&self, pos : usize, spec : &str) -> Result<QueryPath> {
        let (chunks, mut specs) = split_parts(&self.0)?;
        if pos >= specs.len() {
            return Err(HubitError::malformed(self.as_str(), format!("no index position {}", pos)))
        }
        specs[pos] = String::from(spec);
        Ok(QueryPath(join_parts(&chunks, &specs)))
    }

    /// Structural match against a model path. The dotted names must
    /// agree exactly; at every index position a query digit matches the
    /// same model digit or any identifier, while the wildcard (and a
    /// not-yet-normalized negative digit) matches anything.
    pub fn matches(&self, mpath : &ModelPath) -> bool {
        mpath.matches_internal(&self.internal())
    }
}

/// One dotted component of a model path : either a literal name or an
/// index position. The runner matches internal dotted paths against
/// these, so a digit in the data is never mistaken for a field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Name(String),
    Index(ModelIndex),
}

impl ModelPath {
    pub fn new(path : impl Into<String>) -> Self {
        ModelPath(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn internal(&self) -> String {
        self.0.replace('[', ".").replace(']', "")
    }

    /// Brackets balanced and every specifier a digit, an identifier or
    /// `:@` followed by an identifier, with identifiers drawn from
    /// `[A-Za-z0-9_-]+`.
    pub fn validate(&self) -> Result<()> {
        self.indices().map(|_| ())
    }

    pub fn index_specifiers(&self) -> Result<Vec<String>> {
        split_parts(&self.0).map(|(_, specs)| specs)
    }

    pub fn indices(&self) -> Result<Vec<ModelIndex>> {
        let (_, specs) = split_parts(&self.0)?;
        specs.iter()
             .map(|spec| {
                 if is_digits(spec) {
                     spec.parse::<usize>()
                         .map(Digit)
                         .map_err(|_| HubitError::malformed(self.as_str(), format!("index '{}' out of range", spec)))
                 } else if let Some(at) = spec.find('@') {
                     let (head, name) = (&spec[..at], &spec[at + 1..]);
                     if !valid_identifier(name) {
                         return Err(HubitError::malformed(self.as_str(), format!("invalid index identifier '{}'", name)))
                     }
                     if head == IDX_WILDCARD {
                         Ok(WildcardId(String::from(name)))
                     } else if is_digits(head) {
                         head.parse::<usize>()
                             .map(|d| DigitId(d, String::from(name)))
                             .map_err(|_| HubitError::malformed(self.as_str(), format!("index '{}' out of range", head)))
                     } else {
                         Err(HubitError::malformed(self.as_str(), format!("invalid index specifier '{}'", spec)))
                     }
                 } else if valid_identifier(spec) {
                     Ok(Id(spec.clone()))
                 } else {
                     Err(HubitError::malformed(self.as_str(), format!("invalid index specifier '{}'", spec)))
                 }
             })
             .collect()
    }

    /// Ordered index identifiers, leading `:@` stripped. Digits do not
    /// contribute.
    pub fn index_identifiers(&self) -> Result<Vec<String>> {
        Ok(self.indices()?
               .into_iter()
               .filter_map(|idx| idx.identifier().map(String::from))
               .collect())
    }

    /// The `-`-joined identifier tuple governing which length tree
    /// applies to this path.
    pub fn idx_context(&self) -> String {
        match self.index_identifiers() {
            Ok(identifiers) => identifiers.join("-"),
            Err(_) => String::new()
        }
    }

    /// The path with brackets and their contents elided. Used for
    /// topology (which objects a path traverses), never for dispatch.
    pub fn remove_brackets(&self) -> String {
        match split_parts(&self.0) {
            Ok((chunks, _)) => chunks.concat(),
            Err(_) => self.0.clone()
        }
    }

    /// Substitute each bracket's content left-to-right with the
    /// supplied values. Wildcard-bound specifiers are kept (their value
    /// is consumed but ignored); the lengths must agree.
    pub fn set_indices(&self, values : &[String]) -> Result<ModelPath> {
        let (chunks, mut specs) = split_parts(&self.0)?;
        if specs.len() != values.len() {
            return Err(HubitError::malformed(
                self.as_str(),
                format!("{} indices supplied for {} index positions", values.len(), specs.len()),
            ))
        }
        for (spec, value) in specs.iter_mut().zip(values.iter()) {
            if !spec.starts_with(":@") {
                *spec = value.clone();
            }
        }
        Ok(ModelPath(join_parts(&chunks, &specs)))
    }

    /// Substitute the identifiers present in `index_for_id` with their
    /// concrete positions. Unknown identifiers and wildcard-bound
    /// specifiers are left untouched for later tree expansion.
    pub fn set_indices_by_identifier(&self, index_for_id : &HashMap<String, usize>) -> Result<ModelPath> {
        let (chunks, mut specs) = split_parts(&self.0)?;
        for spec in specs.iter_mut() {
            if is_digits(spec) || spec.starts_with(":@") {
                continue
            }
            if let Some(at) = spec.find('@') {
                // a digit-bound identifier is already fixed; concretize
                // it once its identifier is known
                let (head, name) = (String::from(&spec[..at]), &spec[at + 1..]);
                if index_for_id.contains_key(name) {
                    *spec = head;
                }
                continue
            }
            if let Some(idx) = index_for_id.get(spec.as_str()) {
                *spec = idx.to_string();
            }
        }
        Ok(ModelPath(join_parts(&chunks, &specs)))
    }

    /// The dotted sub-paths between index positions, in order. The
    /// final element is whatever follows the last bracket (possibly
    /// empty). For `segments[A].layers[B].test.positions[C]` this is
    /// `["segments", "layers", "test.positions", ""]`.
    pub fn paths_between_identifiers(&self) -> Result<Vec<String>> {
        let (chunks, _) = split_parts(&self.0)?;
        Ok(chunks.iter()
                 .map(|chunk| String::from(chunk.trim_matches('.')))
                 .collect())
    }

    /// The path as alternating name and index segments, in dotted
    /// order.
    pub fn segments(&self) -> Result<Vec<PathSegment>> {
        let (chunks, _) = split_parts(&self.0)?;
        let indices = self.indices()?;
        let mut segments = Vec::new();
        for (pos, chunk) in chunks.iter().enumerate() {
            for part in chunk.split('.') {
                if !part.is_empty() {
                    segments.push(PathSegment::Name(String::from(part)));
                }
            }
            if let Some(idx) = indices.get(pos) {
                segments.push(PathSegment::Index(idx.clone()));
            }
        }
        Ok(segments)
    }

    /// Match an internal dotted path (a flat-store key or an expanded
    /// query) against this model path. Name segments must agree
    /// literally; at index positions a digit matches a fixed position
    /// only when equal, and any identifier; `:` and negative digits
    /// match every specifier.
    pub fn matches_internal(&self, dotted : &str) -> bool {
        let segments = match self.segments() {
            Ok(segments) => segments,
            Err(_) => return false
        };
        let query : Vec<&str> = dotted.split('.').collect();
        if query.len() != segments.len() {
            return false
        }
        segments.iter().zip(query.iter()).all(|(segment, q)| match segment {
            PathSegment::Name(name) => name.as_str() == *q,
            PathSegment::Index(idx) => {
                if *q == IDX_WILDCARD {
                    return true
                }
                match q.parse::<i64>() {
                    Ok(d) if d < 0 => true,
                    Ok(d) => match idx {
                        Digit(m) | DigitId(m, _) => d == *m as i64,
                        Id(_) | WildcardId(_) => true,
                    },
                    Err(_) => false
                }
            }
        })
    }

    /// The index-position values of a matching internal dotted path,
    /// in appearance order.
    pub fn extract_indices(&self, dotted : &str) -> Result<Vec<String>> {
        let segments = self.segments()?;
        let query : Vec<&str> = dotted.split('.').collect();
        if query.len() != segments.len() {
            return Err(HubitError::malformed(
                dotted,
                format!("does not align with model path '{}'", self.0),
            ))
        }
        Ok(segments.iter()
                   .zip(query.iter())
                   .filter_map(|(segment, q)| match segment {
                       PathSegment::Index(_) => Some(String::from(*q)),
                       PathSegment::Name(_) => None
                   })
                   .collect())
    }

    /// View this model path as a query path. Only meaningful once every
    /// specifier is a digit or a bare wildcard remains to be expanded.
    pub fn to_query_path(&self) -> QueryPath {
        let raw = match split_parts(&self.0) {
            Ok((chunks, specs)) => {
                let specs = specs.into_iter()
                                 .map(|spec| if spec.starts_with(":@") { String::from(IDX_WILDCARD) } else { spec })
                                 .collect::<Vec<_>>();
                join_parts(&chunks, &specs)
            },
            Err(_) => self.0.clone()
        };
        QueryPath(raw)
    }
}

impl fmt::Display for QueryPath {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ModelPath {
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryPath {
    fn from(s : &str) -> QueryPath {
        QueryPath::new(s)
    }
}

impl From<&str> for ModelPath {
    fn from(s : &str) -> ModelPath {
        ModelPath::new(s)
    }
}

impl Serialize for ModelPath {
    fn serialize<S : Serializer>(&self, serializer : S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ModelPath {
    fn deserialize<D : Deserializer<'de>>(deserializer : D) -> std::result::Result<ModelPath, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let path = ModelPath(raw);
        path.validate().map_err(de::Error::custom)?;
        Ok(path)
    }
}
