use std::fs::read_to_string;
use std::path::Path;

use serde::{ Deserialize, Serialize };

use crate::component::{ Binding, Component };
use crate::errors::{ HubitError, Result };
use crate::path::ModelPath;

/// The model configuration : the component entries of the model file in
/// declaration order. The file itself is a YAML sequence of components
/// (see `Component` for the keys); unknown keys are rejected at parse
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelConfig {
    components : Vec<Component>,
}

impl ModelConfig {
    pub fn new(components : Vec<Component>) -> Result<Self> {
        let cfg = ModelConfig { components };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(source : &str) -> Result<Self> {
        let cfg : ModelConfig = serde_yaml::from_str(source)
            .map_err(|e| HubitError::Config(format!("cannot parse model file : {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path : &Path) -> Result<Self> {
        let source = read_to_string(path)
            .map_err(|e| HubitError::Config(format!("cannot read '{}' : {}", path.display(), e)))?;
        ModelConfig::from_yaml(&source)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component_by_id(&self, id : &str) -> Option<&Component> {
        self.components.iter().find(|cmp| cmp.id() == id)
    }

    /// Every (component, provided binding) pair, in declaration order.
    pub fn providers(&self) -> impl Iterator<Item = (&Component, &Binding)> {
        self.components
            .iter()
            .flat_map(|cmp| cmp.provides_results.iter().map(move |binding| (cmp, binding)))
    }

    /// Every consumes-input binding path; these define which length
    /// trees exist.
    pub fn input_paths(&self) -> impl Iterator<Item = &ModelPath> {
        self.components
            .iter()
            .flat_map(|cmp| cmp.consumes_input.iter().map(|binding| &binding.path))
    }

    /// No two components may provide the same model path, and ids must
    /// be unique so the registry lookup is unambiguous.
    fn validate(&self) -> Result<()> {
        for component in &self.components {
            component.validate()?;
        }

        let mut seen_ids : Vec<&str> = Vec::with_capacity(self.components.len());
        for component in &self.components {
            if seen_ids.contains(&component.id()) {
                return Err(HubitError::Config(format!(
                    "component id '{}' is not unique", component.id()
                )))
            }
            seen_ids.push(component.id());
        }

        let mut provider_for_path : Vec<(&str, &str)> = Vec::new();
        for (component, binding) in self.providers() {
            let path = binding.path.as_str();
            match provider_for_path.iter().find(|(seen, _)| *seen == path) {
                Some((_, first)) => {
                    return Err(HubitError::Validation {
                        path : String::from(path),
                        first : String::from(*first),
                        second : String::from(component.id()),
                    })
                },
                None => provider_for_path.push((path, component.id()))
            }
        }
        Ok(())
    }
}
