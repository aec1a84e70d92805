use std::sync::Arc;

use hashbrown::{ HashMap, HashSet };
use indexmap::IndexMap;

use crate::cache;
use crate::component::{ Binding, Component, ComponentFunc };
use crate::errors::{ HubitError, Result };
use crate::path::{ ModelIndex, QueryPath };
use crate::store::FlatData;
use crate::tree::LengthTree;
use crate::value::{ Nested, Value };

/// One component activation bound to concrete list indices. Created
/// for the explicit (index-resolved) query path that first asked for
/// one of its outputs; every binding path is resolved to concrete
/// internal paths at construction, partly by substituting the indices
/// extracted from the query, partly by expanding leftover
/// wildcard-bound identifiers against the length trees.
///
/// The lifecycle is : created, then subscribed (`set_values` probed the
/// stores once and the pending sets hold what is still missing), then
/// working (both pending sets empty, function invoked), then completed
/// (output buffer populated). The worker never polls; the runner
/// delivers missing values as providers complete.
pub struct Worker {
    component : Arc<Component>,
    func : Arc<dyn ComponentFunc>,
    version : Option<String>,
    query_path : QueryPath,
    id : String,
    dryrun : bool,
    caching : bool,

    provides : IndexMap<String, Nested<String>>,
    consumes_input : IndexMap<String, Nested<String>>,
    consumes_results : IndexMap<String, Nested<String>>,

    input_values : HashMap<String, Value>,
    results_values : HashMap<String, Value>,
    pending_inputs : HashSet<String>,
    pending_results : HashSet<String>,

    output : Option<IndexMap<String, Value>>,
    input_id : Option<u64>,
    results_id : Option<u64>,
    used_cache : bool,
}

impl Worker {
    pub fn new(
        component : Arc<Component>,
        func : Arc<dyn ComponentFunc>,
        version : Option<String>,
        query_path : &QueryPath,
        forest : &HashMap<String, LengthTree>,
        dryrun : bool,
        caching : bool,
    ) -> Result<Worker> {
        // The component must bind one provides-results path that
        // matches the query path that caused this activation.
        let dotted = query_path.internal();
        let matched = component.provides_results
                               .iter()
                               .find(|binding| binding.path.matches_internal(&dotted))
                               .ok_or_else(|| HubitError::worker(
                                   component.id(),
                                   format!("query '{}' does not match any provides binding", query_path),
                               ))?;

        let q_specs = matched.path.extract_indices(&dotted)?;
        let mut q_digits = Vec::with_capacity(q_specs.len());
        for spec in &q_specs {
            match spec.parse::<i64>() {
                Ok(d) if d >= 0 => q_digits.push(d as usize),
                _ => {
                    return Err(HubitError::worker(
                        component.id(),
                        format!("queries should be index-resolved; got '{}'", query_path),
                    ))
                }
            }
        }

        // Concrete index per identifier the query pins down. Wildcard
        // bound identifiers stay free : the worker provides the whole
        // level in one invocation.
        let m_indices = matched.path.indices()?;
        let mut index_for_id : HashMap<String, usize> = HashMap::new();
        let mut id_pairs = Vec::new();
        for (m_idx, q_digit) in m_indices.iter().zip(q_digits.iter()) {
            match m_idx {
                ModelIndex::Id(name) => {
                    index_for_id.insert(name.clone(), *q_digit);
                    id_pairs.push(format!("{}={}", name, q_digit));
                },
                ModelIndex::DigitId(d, name) => {
                    index_for_id.insert(name.clone(), *d);
                    id_pairs.push(format!("{}={}", name, d));
                },
                ModelIndex::Digit(_) | ModelIndex::WildcardId(_) => ()
            }
        }

        let id = format!("name={} ilocs=({})", component.id(), id_pairs.join(", "));

        let mut provides = IndexMap::new();
        for binding in &component.provides_results {
            provides.insert(binding.name.clone(), Worker::resolve(binding, &index_for_id, forest)?);
        }
        let mut consumes_input = IndexMap::new();
        for binding in &component.consumes_input {
            consumes_input.insert(binding.name.clone(), Worker::resolve(binding, &index_for_id, forest)?);
        }
        let mut consumes_results = IndexMap::new();
        for binding in &component.consumes_results {
            consumes_results.insert(binding.name.clone(), Worker::resolve(binding, &index_for_id, forest)?);
        }

        Ok(Worker {
            component,
            func,
            version,
            query_path : query_path.clone(),
            id,
            dryrun,
            caching,
            provides,
            consumes_input,
            consumes_results,
            input_values : HashMap::new(),
            results_values : HashMap::new(),
            pending_inputs : HashSet::new(),
            pending_results : HashSet::new(),
            output : None,
            input_id : None,
            results_id : None,
            used_cache : false,
        })
    }

    /// Resolve one binding to internal dotted paths : substitute the
    /// known identifiers, then expand whatever is left against the
    /// binding's length tree.
    fn resolve(
        binding : &Binding,
        index_for_id : &HashMap<String, usize>,
        forest : &HashMap<String, LengthTree>,
    ) -> Result<Nested<String>> {
        let substituted = binding.path.set_indices_by_identifier(index_for_id)?;
        let indices = substituted.indices()?;
        let concrete = indices.iter().all(|idx| match idx {
            ModelIndex::Digit(_) => true,
            _ => false
        });
        if concrete {
            return Ok(Nested::One(substituted.internal()))
        }

        let idx_context = binding.path.idx_context();
        let tree = forest.get(idx_context.as_str()).ok_or_else(|| HubitError::InconsistentContext {
            path : String::from(binding.path.as_str()),
            contexts : vec![idx_context.clone()],
        })?;

        let mut pruned = tree.clone();
        pruned.prune_from_model(&substituted)?;
        let expanded = pruned.expand_model_path(&substituted)?;
        Ok(expanded.map(&mut |qpath| qpath.internal()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub fn component_id(&self) -> &str {
        self.component.id()
    }

    pub fn func(&self) -> Arc<dyn ComponentFunc> {
        self.func.clone()
    }

    pub fn query_path(&self) -> &QueryPath {
        &self.query_path
    }

    pub fn is_dryrun(&self) -> bool {
        self.dryrun
    }

    /// Concrete internal paths this worker will write.
    pub fn paths_provided(&self) -> Vec<String> {
        self.provides
            .values()
            .flat_map(|paths| paths.flatten().into_iter().cloned())
            .collect()
    }

    pub fn provides_map(&self) -> &IndexMap<String, Nested<String>> {
        &self.provides
    }

    pub fn consumes_input_map(&self) -> &IndexMap<String, Nested<String>> {
        &self.consumes_input
    }

    pub fn consumes_results_map(&self) -> &IndexMap<String, Nested<String>> {
        &self.consumes_results
    }

    /// Probe the stores once. Values already present are copied in;
    /// everything else lands in the pending sets and is returned so the
    /// runner can arrange for it to be supplied later.
    pub fn set_values(&mut self, input : &FlatData, results : &FlatData) -> (Vec<String>, Vec<String>) {
        let input_paths : Vec<String> = self.consumes_input
                                            .values()
                                            .flat_map(|paths| paths.flatten().into_iter().cloned())
                                            .collect();
        for path in input_paths {
            match input.get(&path) {
                Some(value) => { self.input_values.insert(path, value.clone()); },
                None => { self.pending_inputs.insert(path); }
            }
        }

        let results_paths : Vec<String> = self.consumes_results
                                              .values()
                                              .flat_map(|paths| paths.flatten().into_iter().cloned())
                                              .collect();
        for path in results_paths {
            match results.get(&path) {
                Some(value) => { self.results_values.insert(path, value.clone()); },
                None => { self.pending_results.insert(path); }
            }
        }

        if self.caching {
            self.compute_input_id();
        }

        (
            self.pending_inputs.iter().cloned().collect(),
            self.pending_results.iter().cloned().collect(),
        )
    }

    pub fn set_consumed_input(&mut self, path : &str, value : Value) {
        if self.pending_inputs.remove(path) {
            self.input_values.insert(String::from(path), value);
        }
    }

    pub fn set_consumed_result(&mut self, path : &str, value : Value) {
        if self.pending_results.remove(path) {
            self.results_values.insert(String::from(path), value);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pending_inputs.is_empty() && self.pending_results.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.output.is_some()
    }

    pub fn pending_input_paths(&self) -> &HashSet<String> {
        &self.pending_inputs
    }

    pub fn pending_results_paths(&self) -> &HashSet<String> {
        &self.pending_results
    }

    /// The content-addressed identity over everything consumed that is
    /// known at subscription time. Consumed values are keyed by their
    /// binding-local coordinates, not their absolute paths, so two
    /// activations at different indices share an identity whenever the
    /// values they consume are equal. Values that are still pending
    /// enter the final key through the provider identities instead
    /// (see `set_results_id`).
    fn compute_input_id(&mut self) {
        let mut pairs : Vec<(String, &Value)> = Vec::new();
        for (name, paths) in self.consumes_input.iter().chain(self.consumes_results.iter()) {
            for (pos, path) in paths.flatten().into_iter().enumerate() {
                let value = self.input_values
                                .get(path)
                                .or_else(|| self.results_values.get(path));
                if let Some(value) = value {
                    pairs.push((format!("{}[{}]", name, pos), value));
                }
            }
        }
        self.input_id = Some(cache::worker_key(
            self.component.id(),
            self.version.as_deref(),
            &pairs,
        ));
    }

    /// Final cache key : the input-only identity combined with the
    /// identities of the upstream providers this worker subscribed to.
    pub fn set_results_id(&mut self, upstream : &[u64]) -> Option<u64> {
        let base = self.input_id?;
        let key = if self.consumes_results.is_empty() && upstream.is_empty() {
            base
        } else {
            cache::combine_keys(base, upstream)
        };
        self.results_id = Some(key);
        self.results_id
    }

    pub fn results_id(&self) -> Option<u64> {
        self.results_id
    }

    pub fn mark_used_cache(&mut self) {
        self.used_cache = true;
    }

    pub fn used_cache(&self) -> bool {
        self.used_cache
    }

    /// Assemble the two read-only views for the component invocation.
    /// Only call when ready.
    pub fn build_views(&self) -> Result<(IndexMap<String, Value>, IndexMap<String, Value>)> {
        let mut input = IndexMap::new();
        for (name, paths) in &self.consumes_input {
            input.insert(name.clone(), self.gather(paths, &self.input_values)?);
        }
        let mut results = IndexMap::new();
        for (name, paths) in &self.consumes_results {
            results.insert(name.clone(), self.gather(paths, &self.results_values)?);
        }
        Ok((input, results))
    }

    fn gather(&self, paths : &Nested<String>, values : &HashMap<String, Value>) -> Result<Value> {
        match paths {
            Nested::One(path) => values.get(path)
                                       .cloned()
                                       .ok_or_else(|| HubitError::worker(
                                           self.component.id(),
                                           format!("consumed value for '{}' was never delivered", path),
                                       )),
            Nested::Many(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.gather(item, values)?);
                }
                Ok(Value::List(out))
            }
        }
    }

    /// What a dryrun pretends the component produced : nulls in the
    /// shape of each provided binding.
    pub fn dryrun_output(&self) -> IndexMap<String, Value> {
        self.provides
            .iter()
            .map(|(name, paths)| (name.clone(), paths.clone().map(&mut |_| Value::Null).into_value()))
            .collect()
    }

    /// Accept the sink contents, check them against the provided
    /// bindings and return the concrete (path, value) pairs for the
    /// flat store.
    pub fn accept_output(&mut self, values : IndexMap<String, Value>) -> Result<Vec<(String, Value)>> {
        let mut pairs = Vec::new();
        for (name, paths) in &self.provides {
            let value = values.get(name).ok_or_else(|| HubitError::Component {
                component : String::from(self.component.id()),
                message : format!("component did not set provided output '{}'", name),
            })?;
            self.pair_into(name, paths, value, &mut pairs)?;
        }
        self.output = Some(values);
        Ok(pairs)
    }

    fn pair_into(
        &self,
        name : &str,
        paths : &Nested<String>,
        value : &Value,
        out : &mut Vec<(String, Value)>,
    ) -> Result<()> {
        match paths {
            Nested::One(path) => {
                out.push((path.clone(), value.clone()));
                Ok(())
            },
            Nested::Many(items) => {
                let list = value.as_list().ok_or_else(|| HubitError::Component {
                    component : String::from(self.component.id()),
                    message : format!("output '{}' should be a list of {} values", name, items.len()),
                })?;
                if list.len() != items.len() {
                    return Err(HubitError::Component {
                        component : String::from(self.component.id()),
                        message : format!(
                            "output '{}' has {} values where {} were expected",
                            name, list.len(), items.len()
                        ),
                    })
                }
                for (item, value) in items.iter().zip(list.iter()) {
                    self.pair_into(name, item, value, out)?;
                }
                Ok(())
            }
        }
    }

    /// The completed output buffer, by local name.
    pub fn output(&self) -> Option<&IndexMap<String, Value>> {
        self.output.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ ComponentError, ComponentRegistry, ComponentLoader };
    use crate::tree::forest_for_paths;

    fn dummy_func() -> Arc<dyn ComponentFunc> {
        let mut registry = ComponentRegistry::new();
        registry.register_fn("dummy", |_input, _results, _output| Ok(()));
        registry.load(&Component::new("dummy").provides("x", "x")).unwrap()
    }

    fn forest_for(component : &Component, input : &Value) -> HashMap<String, LengthTree> {
        let paths : Vec<_> = component.consumes_input.iter().map(|b| b.path.clone()).collect();
        forest_for_paths(paths.iter(), input).unwrap()
    }

    fn make_worker(component : Component, input : &Value, query : &str) -> Result<Worker> {
        let forest = forest_for(&component, input);
        Worker::new(
            Arc::new(component),
            dummy_func(),
            None,
            &QueryPath::new(query),
            &forest,
            true,
            false,
        )
    }

    fn item_input() -> Value {
        serde_yaml::from_str(
            "{items: [{attr: {items: [{path: 2}, {path: 1}]}}, {attr: {items: [{path: 3}, {path: 4}]}}], some_number: 33}",
        ).unwrap()
    }

    #[test]
    fn query_must_match_a_provides_binding() {
        let component = Component::new("cmp")
            .provides("attr1", "shared.results.attr1.path")
            .provides("attr2", "shared.results.attr2.path")
            .consumes_input("attr", "shared.input.attr.path");
        let input : Value = serde_yaml::from_str("{}").unwrap();
        assert!(make_worker(component, &input, "shared.attr.path").is_err());
    }

    #[test]
    fn init_without_indices() {
        let component = Component::new("cmp")
            .provides("attr1", "shared.results.attr1.path")
            .provides("attr2", "shared.results.attr2.path")
            .consumes_input("attr", "shared.input.attr.path");
        let input : Value = serde_yaml::from_str("{}").unwrap();
        let worker = make_worker(component, &input, "shared.results.attr1.path").unwrap();
        assert_eq!(worker.paths_provided(), vec![
            String::from("shared.results.attr1.path"),
            String::from("shared.results.attr2.path"),
        ]);
    }

    #[test]
    fn query_with_wildcard_rejected() {
        let component = Component::new("cmp")
            .provides("k_therm", "segments[IDX_SEG].layers[IDX_LAY].k_therm")
            .consumes_input("material", "segments[IDX_SEG].layers[IDX_LAY].material");
        let input : Value = serde_yaml::from_str(
            "{segments: [{layers: [{material: brick}]}]}",
        ).unwrap();
        assert!(make_worker(component, &input, "segments[0].layers[:].k_therm").is_err());
    }

    #[test]
    fn wildcard_provides_covers_whole_level() {
        // one invocation provides k_therm for every layer of the
        // queried segment and consumes every material
        let component = Component::new("thermal")
            .provides("k_therm", "segments[IDX_SEG].layers[:@IDX_LAY].k_therm")
            .consumes_input("materials", "segments[IDX_SEG].layers[IDX_LAY].material");
        let input : Value = serde_yaml::from_str(
            "{segments: [{layers: [{material: brick}, {material: wool}]}, {layers: [{material: concrete}]}]}",
        ).unwrap();
        let worker = make_worker(component, &input, "segments[0].layers[1].k_therm").unwrap();
        assert_eq!(worker.paths_provided(), vec![
            String::from("segments.0.layers.0.k_therm"),
            String::from("segments.0.layers.1.k_therm"),
        ]);
        assert_eq!(
            worker.consumes_input_map().get("materials"),
            Some(&Nested::Many(vec![
                Nested::One(String::from("segments.0.layers.0.material")),
                Nested::One(String::from("segments.0.layers.1.material")),
            ]))
        );
    }

    #[test]
    fn two_wildcards_expand_to_nested_lists() {
        let component = Component::new("cmp")
            .provides("attrs1", "items[:@IDX_ITM].attr.items[:@IDX_P].path1")
            .consumes_input("attrs", "items[IDX_ITM].attr.items[IDX_P].path")
            .consumes_input("number", "some_number");
        let forest = forest_for(&component, &item_input());
        let worker = Worker::new(
            Arc::new(component),
            dummy_func(),
            None,
            &QueryPath::new("items[1].attr.items[0].path1"),
            &forest,
            true,
            false,
        ).unwrap();

        // wildcard-bound identifiers stay free, so one activation
        // subscribes to the whole two-level structure
        assert_eq!(
            worker.consumes_input_map().get("attrs"),
            Some(&Nested::Many(vec![
                Nested::Many(vec![
                    Nested::One(String::from("items.0.attr.items.0.path")),
                    Nested::One(String::from("items.0.attr.items.1.path")),
                ]),
                Nested::Many(vec![
                    Nested::One(String::from("items.1.attr.items.0.path")),
                    Nested::One(String::from("items.1.attr.items.1.path")),
                ]),
            ]))
        );
        assert_eq!(
            worker.consumes_input_map().get("number"),
            Some(&Nested::One(String::from("some_number")))
        );
        assert_eq!(worker.paths_provided().len(), 4);
    }

    #[test]
    fn pending_sets_drain_stepwise() {
        let component = Component::new("cmp")
            .provides("attrs1", "items[IDX_ITM].attr.items[IDX_P].path1")
            .consumes_input("attrs", "items[IDX_ITM].attr.items[IDX_P].path")
            .consumes_input("number", "some_number")
            .consumes_results("dependency", "value")
            .consumes_results("dependency2", "items[IDX_ITM].value");
        let forest = forest_for(&component, &item_input());
        let mut worker = Worker::new(
            Arc::new(component),
            dummy_func(),
            None,
            &QueryPath::new("items[1].attr.items[0].path1"),
            &forest,
            true,
            false,
        ).unwrap();

        let (missing_inputs, missing_results) = worker.set_values(&FlatData::new(), &FlatData::new());
        assert_eq!(missing_inputs.len(), 2);
        assert_eq!(missing_results.len(), 2);
        assert!(!worker.is_ready());

        worker.set_consumed_input("items.1.attr.items.0.path", Value::Int(19));
        worker.set_consumed_input("some_number", Value::Int(64));
        assert!(!worker.is_ready());

        worker.set_consumed_result("value", Value::Int(11));
        assert!(!worker.is_ready());
        worker.set_consumed_result("items.1.value", Value::Int(71));
        assert!(worker.is_ready());

        let (input, results) = worker.build_views().unwrap();
        assert_eq!(input.get("number"), Some(&Value::Int(64)));
        assert_eq!(results.get("dependency"), Some(&Value::Int(11)));
    }

    #[test]
    fn dryrun_output_is_null_shaped() {
        let component = Component::new("cmp")
            .provides("attrs1", "items[:@IDX_ITM].attr.items[:@IDX_P].path1")
            .consumes_input("attrs", "items[IDX_ITM].attr.items[IDX_P].path");
        let forest = forest_for(&component, &item_input());
        let worker = Worker::new(
            Arc::new(component),
            dummy_func(),
            None,
            &QueryPath::new("items[0].attr.items[0].path1"),
            &forest,
            true,
            false,
        ).unwrap();
        let output = worker.dryrun_output();
        let attrs1 = output.get("attrs1").unwrap();
        assert_eq!(attrs1.as_list().map(|l| l.len()), Some(2));
    }

    #[test]
    fn accept_output_maps_names_to_paths() {
        let component = Component::new("cmp")
            .provides("ys", "items[:@IDX_ITM].y")
            .consumes_input("xs", "items[IDX_ITM].x");
        let input : Value = serde_yaml::from_str("{items: [{x: 1}, {x: 2}]}").unwrap();
        let forest = forest_for(&component, &input);
        let mut worker = Worker::new(
            Arc::new(component),
            dummy_func(),
            None,
            &QueryPath::new("items[0].y"),
            &forest,
            false,
            false,
        ).unwrap();

        let mut sink = IndexMap::new();
        sink.insert(String::from("ys"), Value::List(vec![Value::Int(2), Value::Int(4)]));
        let pairs = worker.accept_output(sink).unwrap();
        assert_eq!(pairs, vec![
            (String::from("items.0.y"), Value::Int(2)),
            (String::from("items.1.y"), Value::Int(4)),
        ]);
        assert!(worker.is_completed());

        // shape mismatch surfaces as a component error
        let component = Component::new("cmp2")
            .provides("ys", "items[:@IDX_ITM].y")
            .consumes_input("xs", "items[IDX_ITM].x");
        let forest = forest_for(&component, &input);
        let mut worker = Worker::new(
            Arc::new(component), dummy_func(), None,
            &QueryPath::new("items[0].y"), &forest, false, false,
        ).unwrap();
        let mut sink = IndexMap::new();
        sink.insert(String::from("ys"), Value::List(vec![Value::Int(2)]));
        assert!(worker.accept_output(sink).is_err());
    }

    #[test]
    fn cache_identity_tracks_consumed_values() {
        let component = Component::new("sum")
            .provides("p", "cars[IDX_CAR].price")
            .consumes_input("parts", "cars[IDX_CAR].parts[IDX_PART].price");
        let input : Value = serde_yaml::from_str(
            "{cars: [{parts: [{price: 1}, {price: 2}]}, {parts: [{price: 7}]}, {parts: [{price: 1}, {price: 2}]}]}",
        ).unwrap();
        let forest = forest_for(&component, &input);
        let flat_input = FlatData::from_value(&input);

        let mut keys = Vec::new();
        for car in &["0", "1", "2"] {
            let mut worker = Worker::new(
                Arc::new(component.clone()),
                dummy_func(),
                None,
                &QueryPath::new(format!("cars[{}].price", car)),
                &forest,
                false,
                true,
            ).unwrap();
            worker.set_values(&flat_input, &FlatData::new());
            keys.push(worker.set_results_id(&[]).unwrap());
        }

        // cars 0 and 2 have identical parts, car 1 differs
        assert_ne!(keys[0], keys[1]);
        assert_eq!(keys[0], keys[2]);
    }

    #[test]
    fn component_error_formatting() {
        let err = ComponentError::new("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
