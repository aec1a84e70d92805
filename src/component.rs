use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::errors::{ HubitError, Result };
use crate::path::ModelPath;
use crate::value::Value;

/// Binds a component-internal name to a path in the shared data model.
/// The direction (consumed input, consumed results, provided results)
/// is given by which list of the component the binding sits in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    pub name : String,
    pub path : ModelPath,
}

impl Binding {
    pub fn new(name : impl Into<String>, path : impl Into<String>) -> Self {
        Binding { name : name.into(), path : ModelPath::new(path) }
    }
}

/// One isolated calculation : a callable known to the registry under
/// `func_name`, the results it provides and the input/results it
/// consumes. The component functions themselves are registered Rust
/// callables; the engine only ever sees the bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Component {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id : Option<String>,
    pub func_name : String,
    pub provides_results : Vec<Binding>,
    #[serde(default)]
    pub consumes_input : Vec<Binding>,
    #[serde(default)]
    pub consumes_results : Vec<Binding>,
}

impl Component {
    pub fn new(func_name : impl Into<String>) -> Self {
        Component {
            id : None,
            func_name : func_name.into(),
            provides_results : Vec::new(),
            consumes_input : Vec::new(),
            consumes_results : Vec::new(),
        }
    }

    pub fn with_id(mut self, id : impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn provides(mut self, name : &str, path : &str) -> Self {
        self.provides_results.push(Binding::new(name, path));
        self
    }

    pub fn consumes_input(mut self, name : &str, path : &str) -> Self {
        self.consumes_input.push(Binding::new(name, path));
        self
    }

    pub fn consumes_results(mut self, name : &str, path : &str) -> Self {
        self.consumes_results.push(Binding::new(name, path));
        self
    }

    /// Registry key; the function name unless an explicit id is set.
    pub fn id(&self) -> &str {
        match &self.id {
            Some(id) => id.as_str(),
            None => self.func_name.as_str()
        }
    }

    pub fn does_consume_results(&self) -> bool {
        !self.consumes_results.is_empty()
    }

    pub fn does_consume_input(&self) -> bool {
        !self.consumes_input.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.provides_results.is_empty() {
            return Err(HubitError::Config(format!(
                "component with entrypoint '{}' should provide results", self.func_name
            )))
        }
        for binding in self.provides_results
                           .iter()
                           .chain(self.consumes_input.iter())
                           .chain(self.consumes_results.iter()) {
            binding.path.validate()?;
        }
        Ok(())
    }
}

/// What a component function reports when it cannot produce its
/// outputs. The runner wraps it with the component id and propagates.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ComponentError(pub String);

impl ComponentError {
    pub fn new(message : impl Into<String>) -> Self {
        ComponentError(message.into())
    }
}

/// Read-only view handed to a component function : local binding name
/// to resolved value. Bindings whose path kept a wildcard arrive as
/// nested lists in tree order.
#[derive(Debug, Clone, Default)]
pub struct ValueView(IndexMap<String, Value>);

impl ValueView {
    pub(crate) fn new(values : IndexMap<String, Value>) -> Self {
        ValueView(values)
    }

    pub fn get(&self, name : &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// `get` that turns absence into a component error, for use with
    /// `?` inside component functions.
    pub fn require(&self, name : &str) -> std::result::Result<&Value, ComponentError> {
        self.0.get(name)
              .ok_or_else(|| ComponentError::new(format!("no consumed value bound to '{}'", name)))
    }

    pub fn iter(&self) -> indexmap::map::Iter<String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Write-only sink a component function fills with one value (or
/// nested list of values) per provided binding name.
#[derive(Debug, Default)]
pub struct OutputSink {
    values : IndexMap<String, Value>,
}

impl OutputSink {
    pub(crate) fn new() -> Self {
        OutputSink { values : IndexMap::new() }
    }

    pub fn set(&mut self, name : impl Into<String>, value : impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub(crate) fn into_values(self) -> IndexMap<String, Value> {
        self.values
    }
}

/// The calling convention of §6 : a pure function of two read-only
/// views writing into the sink. A version participates in the worker
/// cache key; absent means an implicit null.
pub trait ComponentFunc : Send + Sync {
    fn run(
        &self,
        input : &ValueView,
        results : &ValueView,
        output : &mut OutputSink,
    ) -> std::result::Result<(), ComponentError>;

    fn version(&self) -> Option<String> {
        None
    }
}

struct FnComponent<F> {
    func : F,
    version : Option<String>,
}

impl<F> ComponentFunc for FnComponent<F>
where F : Fn(&ValueView, &ValueView, &mut OutputSink) -> std::result::Result<(), ComponentError> + Send + Sync {
    fn run(
        &self,
        input : &ValueView,
        results : &ValueView,
        output : &mut OutputSink,
    ) -> std::result::Result<(), ComponentError> {
        (self.func)(input, results, output)
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}

/// Component id to callable. Replaces the source model's textual
/// module locators : the embedding application registers its functions
/// once, the model resolves them once at construction, and the runner
/// never dispatches reflectively.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    funcs : HashMap<String, Arc<dyn ComponentFunc>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        ComponentRegistry { funcs : HashMap::new() }
    }

    pub fn register(&mut self, id : impl Into<String>, func : Arc<dyn ComponentFunc>) {
        self.funcs.insert(id.into(), func);
    }

    pub fn register_fn<F>(&mut self, id : impl Into<String>, func : F)
    where F : Fn(&ValueView, &ValueView, &mut OutputSink) -> std::result::Result<(), ComponentError> + Send + Sync + 'static {
        self.register(id, Arc::new(FnComponent { func, version : None }));
    }

    pub fn register_fn_versioned<F>(&mut self, id : impl Into<String>, version : impl Into<String>, func : F)
    where F : Fn(&ValueView, &ValueView, &mut OutputSink) -> std::result::Result<(), ComponentError> + Send + Sync + 'static {
        self.register(id, Arc::new(FnComponent { func, version : Some(version.into()) }));
    }

    pub fn get(&self, id : &str) -> Option<Arc<dyn ComponentFunc>> {
        self.funcs.get(id).cloned()
    }
}

/// Resolves callables for a model at construction time. The registry
/// is the loader almost everyone wants; `NullLoader` exists for
/// validation runs where no real callable is available.
pub trait ComponentLoader {
    fn load(&self, component : &Component) -> Result<Arc<dyn ComponentFunc>>;
}

impl ComponentLoader for ComponentRegistry {
    fn load(&self, component : &Component) -> Result<Arc<dyn ComponentFunc>> {
        self.get(component.id())
            .ok_or_else(|| HubitError::Config(format!(
                "no callable registered for component '{}'", component.id()
            )))
    }
}

/// Hands every component a callable that refuses to run. Dryrun never
/// invokes it, so models loaded this way support `validate_query` and
/// nothing more.
pub struct NullLoader;

struct RefusesToRun;

impl ComponentFunc for RefusesToRun {
    fn run(
        &self,
        _input : &ValueView,
        _results : &ValueView,
        _output : &mut OutputSink,
    ) -> std::result::Result<(), ComponentError> {
        Err(ComponentError::new("model was loaded without callables; dryrun only"))
    }
}

impl ComponentLoader for NullLoader {
    fn load(&self, _component : &Component) -> Result<Arc<dyn ComponentFunc>> {
        Ok(Arc::new(RefusesToRun))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_id_defaults_to_func_name() {
        let cmp = Component::new("thermal").provides("t", "walls[IDX].t");
        assert_eq!(cmp.id(), "thermal");
        let cmp = cmp.with_id("thermal_v2");
        assert_eq!(cmp.id(), "thermal_v2");
    }

    #[test]
    fn component_must_provide_results() {
        let cmp = Component::new("lazy").consumes_input("x", "x");
        assert!(cmp.validate().is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let yml = "
func_name: double
provides_results:
  - {name: y, path: y}
surprise: 1
";
        let parsed : std::result::Result<Component, _> = serde_yaml::from_str(yml);
        assert!(parsed.is_err());
    }

    #[test]
    fn registry_resolves_closures() {
        let mut registry = ComponentRegistry::new();
        registry.register_fn_versioned("double", "1.0", |input, _results, output| {
            let x = input.require("x")?.as_i64().unwrap_or(0);
            output.set("y", 2 * x);
            Ok(())
        });
        let cmp = Component::new("double").provides("y", "y");
        let func = registry.load(&cmp).unwrap();
        assert_eq!(func.version().as_deref(), Some("1.0"));

        let mut input = IndexMap::new();
        input.insert(String::from("x"), Value::Int(21));
        let input = ValueView::new(input);
        let mut sink = OutputSink::new();
        func.run(&input, &ValueView::default(), &mut sink).unwrap();
        assert_eq!(sink.into_values().get("y"), Some(&Value::Int(42)));
    }

    #[test]
    fn missing_callable_is_a_config_error() {
        let registry = ComponentRegistry::new();
        let cmp = Component::new("ghost").provides("y", "y");
        assert!(registry.load(&cmp).is_err());
    }
}
