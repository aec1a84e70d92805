use indexmap::IndexMap;

use crate::errors::{ HubitError, Result };
use crate::path::{ ModelPath, QueryPath };
use crate::tree::LengthTree;

/// A query posed to the model : one or more query paths.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub paths : Vec<QueryPath>,
}

impl Query {
    pub fn new(paths : Vec<QueryPath>) -> Self {
        Query { paths }
    }

    pub fn from_strs(paths : &[&str]) -> Self {
        Query { paths : paths.iter().map(|p| QueryPath::new(*p)).collect() }
    }

    pub fn validate(&self) -> Result<()> {
        for path in &self.paths {
            path.validate()?;
        }
        Ok(())
    }
}

/// How one query path maps onto the model : the providers that match,
/// the decomposition when several components cover disjoint index
/// slices, and per decomposed path the fully index-resolved paths the
/// watcher will wait on. Built by the model (which owns the trees) and
/// consumed both for dispatch and for reshaping the response.
#[derive(Debug, Clone)]
pub struct QueryExpansion {
    /// The (normalized) original query path.
    pub path : QueryPath,
    /// Matching provider paths, aligned with `decomposed_paths`.
    pub mpaths : Vec<ModelPath>,
    pub decomposed_paths : Vec<QueryPath>,
    /// Expanded concrete paths per decomposed path, keyed by the
    /// decomposed path's text.
    pub expanded_for_decomposed : IndexMap<String, Vec<QueryPath>>,
    /// The identifier whose level the decomposition splits, when the
    /// matched providers carry one.
    decomposed_identifier : Option<String>,
    idx_context : String,
}

impl QueryExpansion {
    /// Match bookkeeping and decomposition. The expansion maps are
    /// filled in afterwards by the model, which prunes the context
    /// tree per decomposed path.
    pub fn new(path : &QueryPath, mpaths : Vec<ModelPath>) -> Result<QueryExpansion> {
        if mpaths.is_empty() {
            return Err(HubitError::NoProvider(String::from(path.as_str())))
        }

        if mpaths.len() > 1 && !path.has_wildcard() {
            return Err(HubitError::AmbiguousProvider {
                path : String::from(path.as_str()),
                providers : mpaths.iter().map(|m| String::from(m.as_str())).collect(),
            })
        }

        let mut contexts : Vec<String> = mpaths.iter().map(|m| m.idx_context()).collect();
        contexts.sort();
        contexts.dedup();
        if contexts.len() > 1 {
            return Err(HubitError::InconsistentContext {
                path : String::from(path.as_str()),
                contexts,
            })
        }
        let idx_context = contexts.remove(0);

        let (decomposed_paths, decomposed_identifier) = QueryExpansion::decompose(path, &mpaths)?;

        Ok(QueryExpansion {
            path : path.clone(),
            mpaths,
            decomposed_paths,
            expanded_for_decomposed : IndexMap::new(),
            decomposed_identifier,
            idx_context,
        })
    }

    /// Split the query into one path per provider. Each provider must
    /// fix exactly one index position, all providers must fix the same
    /// position, and the fixed digits must be distinct; otherwise the
    /// providers cannot be covering disjoint slices of one list.
    fn decompose(path : &QueryPath, mpaths : &[ModelPath]) -> Result<(Vec<QueryPath>, Option<String>)> {
        if mpaths.len() < 2 {
            return Ok((vec![path.clone()], None))
        }

        let mut decomposed = Vec::with_capacity(mpaths.len());
        let mut identifiers : Vec<Option<String>> = Vec::with_capacity(mpaths.len());
        let mut positions : Vec<usize> = Vec::with_capacity(mpaths.len());
        let mut digits : Vec<usize> = Vec::with_capacity(mpaths.len());

        for mpath in mpaths {
            let indices = mpath.indices()?;
            let fixed : Vec<(usize, usize, Option<&str>)> = indices.iter()
                .enumerate()
                .filter_map(|(pos, idx)| idx.fixed_digit().map(|d| (pos, d, idx.identifier())))
                .collect();
            match fixed.as_slice() {
                [(pos, digit, identifier)] => {
                    decomposed.push(path.with_index_at(*pos, &digit.to_string())?);
                    identifiers.push(identifier.map(String::from));
                    positions.push(*pos);
                    digits.push(*digit);
                },
                [] => {
                    return Err(HubitError::Decomposition {
                        path : String::from(path.as_str()),
                        reason : format!("provider '{}' fixes no index position", mpath),
                    })
                },
                _ => {
                    return Err(HubitError::Decomposition {
                        path : String::from(path.as_str()),
                        reason : format!(
                            "only one index position may be fixed per provider; '{}' fixes {}",
                            mpath, fixed.len()
                        ),
                    })
                }
            }
        }

        positions.sort();
        positions.dedup();
        if positions.len() > 1 {
            return Err(HubitError::Decomposition {
                path : String::from(path.as_str()),
                reason : String::from("providers fix different index positions"),
            })
        }

        let mut unique_digits = digits.clone();
        unique_digits.sort();
        unique_digits.dedup();
        if unique_digits.len() != digits.len() {
            return Err(HubitError::Decomposition {
                path : String::from(path.as_str()),
                reason : String::from("providers fix the same digit more than once"),
            })
        }

        let mut unique_ids : Vec<Option<String>> = identifiers.clone();
        unique_ids.sort();
        unique_ids.dedup();
        if unique_ids.len() > 1 {
            return Err(HubitError::Decomposition {
                path : String::from(path.as_str()),
                reason : String::from("providers disagree on the decomposed index identifier"),
            })
        }

        Ok((decomposed, identifiers.remove(0)))
    }

    /// The (one) index context of the matched providers.
    pub fn idx_context(&self) -> &str {
        &self.idx_context
    }

    pub fn decomposed_identifier(&self) -> Option<&str> {
        self.decomposed_identifier.as_deref()
    }

    pub fn is_decomposed(&self) -> bool {
        self.decomposed_paths.len() > 1
    }

    pub fn update_expanded(&mut self, decomposed : &QueryPath, expanded : Vec<QueryPath>) {
        self.expanded_for_decomposed.insert(String::from(decomposed.as_str()), expanded);
    }

    /// All expanded concrete paths, across decompositions.
    pub fn flat_expanded_paths(&self) -> Vec<QueryPath> {
        self.expanded_for_decomposed
            .values()
            .flat_map(|paths| paths.iter().cloned())
            .collect()
    }

    /// False when the query passed through untouched : no
    /// decomposition and the single expanded path is the query itself.
    /// Such responses are scalars, everything else reshapes.
    pub fn is_expanded(&self) -> bool {
        if self.is_decomposed() {
            return true
        }
        match self.expanded_for_decomposed.get(self.path.as_str()) {
            Some(paths) => !(paths.len() == 1 && paths[0] == self.path),
            None => true
        }
    }

    /// After decomposition, the context tree must offer at least as
    /// many positions at the decomposed level as there are decomposed
    /// paths; otherwise some provider's slice lies outside the input.
    pub fn validate_tree(&self, tree : &LengthTree) -> Result<()> {
        if tree.is_dummy() {
            return Ok(())
        }
        let identifier = match &self.decomposed_identifier {
            Some(identifier) => identifier,
            None => return Ok(())
        };

        let n_decomposed = self.decomposed_paths.len();
        let children = tree.children_at_level(identifier)
            .ok_or_else(|| HubitError::Decomposition {
                path : String::from(self.path.as_str()),
                reason : format!(
                    "index identifier '{}' not found in tree for context '{}'",
                    identifier, tree.idx_context()
                ),
            })?;
        if children.iter().any(|n| *n < n_decomposed) {
            return Err(HubitError::Decomposition {
                path : String::from(self.path.as_str()),
                reason : format!(
                    "expected at least {} children at level '{}' of the length tree",
                    n_decomposed, identifier
                ),
            })
        }
        Ok(())
    }
}
