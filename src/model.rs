use std::path::Path;
use std::sync::Arc;
use std::time::{ Duration, Instant };

use hashbrown::HashMap;
use indexmap::IndexMap;
use tracing::info;

use crate::cache::{ self, ResultsCache };
use crate::component::{ Component, ComponentFunc, ComponentLoader };
use crate::config::ModelConfig;
use crate::errors::{ HubitError, Result };
use crate::path::{ ModelPath, QueryIndex, QueryPath };
use crate::query::{ Query, QueryExpansion };
use crate::runner::{ QueryRunner, WorkerPlan };
use crate::store::FlatData;
use crate::tree::{ forest_for_paths, LengthTree };
use crate::value::Value;

/// When the flat results store is persisted to the configured results
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCaching {
    Never,
    /// After every worker completion.
    Incremental,
    /// Once, upon successful completion of a `get`.
    AfterExecution,
}

/// Where a `get` seeds its flat results store from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseResults {
    Never,
    /// The in-memory results accumulated by earlier `get`s (or
    /// injected with `set_results`).
    Current,
    /// The persisted artifact for this model identity.
    Cached,
}

#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    pub reuse : ReuseResults,
    pub use_multi_processing : bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions { reuse : ReuseResults::Never, use_multi_processing : false }
    }
}

/// Per-`get` statistics, newest first.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub elapsed : Duration,
    pub worker_counts : IndexMap<String, usize>,
    pub cache_counts : IndexMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries : Vec<LogEntry>,
}

impl RunLog {
    fn add(&mut self, entry : LogEntry) {
        self.entries.insert(0, entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.first()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The model façade : owns the configuration, the resolved component
/// callables, the input with its length-tree registry, the accumulated
/// flat results, both caching layers and the run log. `get` is the
/// entry point for everything.
pub struct Model {
    name : Option<String>,
    cfg : ModelConfig,
    providers : Vec<(Arc<Component>, ModelPath)>,
    funcs : HashMap<String, (Arc<dyn ComponentFunc>, Option<String>)>,
    input : Option<Value>,
    flat_input : FlatData,
    forest : HashMap<String, LengthTree>,
    flat_results : FlatData,
    component_caching : bool,
    component_cache : HashMap<u64, IndexMap<String, Value>>,
    model_caching : ModelCaching,
    results_cache : Option<Arc<dyn ResultsCache>>,
    log : RunLog,
}

impl Model {
    /// Validate the configuration and resolve every component callable
    /// once, through the loader.
    pub fn new(cfg : ModelConfig, loader : &dyn ComponentLoader) -> Result<Model> {
        let mut funcs = HashMap::new();
        let mut providers = Vec::new();
        for component in cfg.components() {
            let func = loader.load(component)?;
            let version = func.version();
            funcs.insert(String::from(component.id()), (func, version));

            let component = Arc::new(component.clone());
            for binding in &component.provides_results {
                providers.push((component.clone(), binding.path.clone()));
            }
        }

        Ok(Model {
            name : None,
            cfg,
            providers,
            funcs,
            input : None,
            flat_input : FlatData::new(),
            forest : HashMap::new(),
            flat_results : FlatData::new(),
            component_caching : false,
            component_cache : HashMap::new(),
            model_caching : ModelCaching::Never,
            results_cache : None,
            log : RunLog::default(),
        })
    }

    pub fn from_file(path : &Path, loader : &dyn ComponentLoader) -> Result<Model> {
        Model::new(ModelConfig::from_file(path)?, loader)
    }

    pub fn with_name(mut self, name : impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Set the input and build the length tree for every index context
    /// reachable from the consumes-input bindings.
    pub fn set_input(&mut self, input : Value) -> Result<()> {
        self.forest = forest_for_paths(self.cfg.input_paths(), &input)?;
        self.flat_input = FlatData::from_value(&input);
        self.input = Some(input);
        Ok(())
    }

    /// Inject known values, bypassing the components that would
    /// otherwise provide them.
    pub fn set_results(&mut self, results : FlatData) {
        self.flat_results.extend(&results);
    }

    pub fn set_results_from_value(&mut self, results : Value) {
        self.set_results(FlatData::from_value(&results));
    }

    pub fn results(&self) -> &FlatData {
        &self.flat_results
    }

    /// Content-addressed deduplication of identical component
    /// activations, within and across `get` calls.
    pub fn set_component_caching(&mut self, on : bool) {
        self.component_caching = on;
    }

    /// Persist the flat results store to `backend` according to
    /// `mode`; `ReuseResults::Cached` reads the artifact back.
    pub fn set_model_caching(&mut self, mode : ModelCaching, backend : Arc<dyn ResultsCache>) {
        self.model_caching = mode;
        self.results_cache = Some(backend);
    }

    /// The model identity : hash of the normalized configuration and
    /// the input. Requires input.
    pub fn model_id(&self) -> Result<String> {
        let input = self.input.as_ref().ok_or(HubitError::NoInput)?;
        let cfg_json = serde_json::to_string(&self.cfg)
            .map_err(|e| HubitError::Config(format!("cannot normalize config : {}", e)))?;
        Ok(cache::model_id(&cfg_json, input))
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Pose a query and drive it to completion. The response maps each
    /// query path as posed to a scalar (no wildcards) or a nested list
    /// shaped by the query's wildcard positions.
    pub fn get(&mut self, query_paths : &[&str], options : GetOptions) -> Result<IndexMap<String, Value>> {
        if self.input.is_none() {
            return Err(HubitError::NoInput)
        }
        let query = Query::from_strs(query_paths);
        query.validate()?;

        let mut expansions = Vec::with_capacity(query.paths.len());
        for qpath in &query.paths {
            expansions.push(self.expand_query(qpath)?);
        }

        let mut terminals : Vec<String> = Vec::new();
        for (qexp, _) in &expansions {
            for path in qexp.flat_expanded_paths() {
                let internal = path.internal();
                if !terminals.contains(&internal) {
                    terminals.push(internal);
                }
            }
        }

        let seed = match options.reuse {
            ReuseResults::Never => FlatData::new(),
            ReuseResults::Current => {
                if self.flat_results.is_empty() {
                    return Err(HubitError::NoResults)
                }
                self.flat_results.clone()
            },
            ReuseResults::Cached => {
                let backend = self.results_cache
                                  .as_ref()
                                  .ok_or_else(|| HubitError::Cache(String::from("no results cache configured")))?;
                backend.load(&self.model_id()?)?.unwrap_or_default()
            }
        };

        let incremental = match (&self.model_caching, &self.results_cache) {
            (ModelCaching::Incremental, Some(backend)) => Some((backend.clone(), self.model_id()?)),
            _ => None
        };

        let runner = QueryRunner::new(
            &self.providers,
            &self.funcs,
            &self.forest,
            &self.flat_input,
            self.component_caching,
            false,
            options.use_multi_processing,
            Model::thread_count(),
            incremental,
        );

        let t_start = Instant::now();
        let report = runner.run(&terminals, seed, self.component_cache.clone())?;
        let elapsed = t_start.elapsed();
        info!("response created in {:?}", elapsed);

        self.component_cache = report.cached_results;
        self.flat_results.extend(&report.flat_results);

        if let (ModelCaching::AfterExecution, Some(backend)) = (&self.model_caching, &self.results_cache) {
            backend.store(&self.model_id()?, &self.flat_results)?;
        }

        self.log.add(LogEntry {
            elapsed,
            worker_counts : report.worker_counts,
            cache_counts : report.cache_hits,
        });

        let mut response = IndexMap::new();
        for ((qexp, tree), posed) in expansions.iter().zip(query_paths.iter()) {
            let value = self.response_value(qexp, tree, &report.flat_results)?;
            response.insert(String::from(*posed), value);
        }
        Ok(response)
    }

    /// Run the query with dryrun workers (provided paths filled with
    /// nulls, no component invoked) and report the workers that would
    /// run. Validates provider resolution, expansion and the
    /// dependency graph, cycles included.
    pub fn validate_query(&self, query_paths : &[&str], use_multi_processing : bool) -> Result<Vec<WorkerPlan>> {
        if self.input.is_none() {
            return Err(HubitError::NoInput)
        }
        let query = Query::from_strs(query_paths);
        query.validate()?;

        let mut terminals : Vec<String> = Vec::new();
        for qpath in &query.paths {
            let (qexp, _) = self.expand_query(qpath)?;
            for path in qexp.flat_expanded_paths() {
                let internal = path.internal();
                if !terminals.contains(&internal) {
                    terminals.push(internal);
                }
            }
        }

        let runner = QueryRunner::new(
            &self.providers,
            &self.funcs,
            &self.forest,
            &self.flat_input,
            false,
            true,
            use_multi_processing,
            Model::thread_count(),
            None,
        );
        let report = runner.run(&terminals, FlatData::new(), HashMap::new())?;
        Ok(report.workers)
    }

    /// Match a query path to the model : find the providers, normalize
    /// negative indices against the context tree, decompose and expand.
    /// Returns the expansion record plus the (unpruned) context tree
    /// used later for reshaping.
    pub fn expand_query(&self, qpath : &QueryPath) -> Result<(QueryExpansion, LengthTree)> {
        let mpaths = self.mpaths_for_qpath(qpath);
        if mpaths.is_empty() {
            return Err(HubitError::NoProvider(String::from(qpath.as_str())))
        }

        let mut contexts : Vec<String> = mpaths.iter().map(|m| m.idx_context()).collect();
        contexts.sort();
        contexts.dedup();
        if contexts.len() > 1 {
            return Err(HubitError::InconsistentContext {
                path : String::from(qpath.as_str()),
                contexts,
            })
        }
        let tree = self.tree_for_context(&contexts[0])?;

        // Negative indices are resolved against the tree, after which
        // the provider set may narrow (a digit only matches its own
        // slice).
        let normalized = tree.normalize(qpath)?;
        let mpaths = if normalized == *qpath { mpaths } else { self.mpaths_for_qpath(&normalized) };

        let mut qexp = QueryExpansion::new(&normalized, mpaths)?;
        qexp.validate_tree(&tree)?;

        for decomposed in qexp.decomposed_paths.clone() {
            let mut pruned = tree.clone();
            pruned.prune_from_query(&decomposed)?;
            let expanded = pruned.expand_query_path_flat(&decomposed)?;
            qexp.update_expanded(&decomposed, expanded);
        }
        Ok((qexp, tree))
    }

    /// All provider model paths matching a query path.
    pub fn mpaths_for_qpath(&self, qpath : &QueryPath) -> Vec<ModelPath> {
        self.providers
            .iter()
            .filter(|(_, mpath)| qpath.matches(mpath))
            .map(|(_, mpath)| mpath.clone())
            .collect()
    }

    /// The component able to answer a query path; ambiguity between
    /// distinct components is an error.
    pub fn component_for_qpath(&self, qpath : &QueryPath) -> Result<Arc<Component>> {
        let mut matched : Vec<&Arc<Component>> = Vec::new();
        for (component, mpath) in &self.providers {
            if qpath.matches(mpath) && !matched.iter().any(|m| m.id() == component.id()) {
                matched.push(component);
            }
        }
        match matched.as_slice() {
            [] => Err(HubitError::NoProvider(String::from(qpath.as_str()))),
            [component] => Ok((*component).clone()),
            many => Err(HubitError::AmbiguousProvider {
                path : String::from(qpath.as_str()),
                providers : many.iter().map(|c| String::from(c.id())).collect(),
            })
        }
    }

    fn tree_for_context(&self, idx_context : &str) -> Result<LengthTree> {
        self.forest
            .get(idx_context)
            .cloned()
            .ok_or_else(|| HubitError::Config(format!(
                "no length tree for index context '{}'; the context must be reachable from a consumes_input binding",
                idx_context
            )))
    }

    /// Shape one query path's answer from the flat store : scalars
    /// pass through, wildcard queries reshape to the pruned tree, a
    /// decomposition over a context-free path becomes a list indexed
    /// by the providers' fixed digits.
    fn response_value(
        &self,
        qexp : &QueryExpansion,
        tree : &LengthTree,
        flat_results : &FlatData,
    ) -> Result<Value> {
        if !qexp.is_expanded() {
            let internal = qexp.path.internal();
            return flat_results.get(&internal)
                               .cloned()
                               .ok_or_else(|| HubitError::Config(format!(
                                   "response value for '{}' missing from the flat store", internal
                               )))
        }

        if tree.is_dummy() && qexp.is_decomposed() {
            return self.decomposed_scalar_response(qexp, flat_results)
        }

        let mut pruned = tree.clone();
        pruned.prune_from_query(&qexp.path)?;
        let expanded = pruned.expand_query_path_flat(&qexp.path)?;
        let values : Vec<Value> = expanded.iter()
                                          .map(|path| {
                                              flat_results.get(&path.internal())
                                                          .cloned()
                                                          .unwrap_or(Value::Null)
                                          })
                                          .collect();
        Ok(pruned.reshape(values)?.into_value())
    }

    /// Bare-digit providers decompose without a length tree; the
    /// response is a list with each provider's value at its fixed
    /// digit.
    fn decomposed_scalar_response(&self, qexp : &QueryExpansion, flat_results : &FlatData) -> Result<Value> {
        let wildcard_positions : Vec<usize> = qexp.path
            .indices()?
            .iter()
            .enumerate()
            .filter_map(|(pos, idx)| match idx {
                QueryIndex::Wildcard => Some(pos),
                QueryIndex::QDigit(_) => None
            })
            .collect();
        let position = match wildcard_positions.as_slice() {
            [position] => *position,
            _ => {
                return Err(HubitError::Decomposition {
                    path : String::from(qexp.path.as_str()),
                    reason : String::from("a context-free decomposition supports exactly one wildcard"),
                })
            }
        };

        let mut slots : Vec<Value> = Vec::new();
        for decomposed in &qexp.decomposed_paths {
            let specs = decomposed.index_specifiers()?;
            let digit : usize = specs[position].parse().map_err(|_| HubitError::Decomposition {
                path : String::from(qexp.path.as_str()),
                reason : format!("decomposed path '{}' is not index-resolved", decomposed),
            })?;
            while slots.len() <= digit {
                slots.push(Value::Null);
            }
            let internal = decomposed.internal();
            slots[digit] = flat_results.get(&internal).cloned().unwrap_or(Value::Null);
        }
        Ok(Value::List(slots))
    }

    fn thread_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(4)
            .max(2)
    }
}
