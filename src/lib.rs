#![forbid(unsafe_code)]
#![allow(unused_parens)]

//! A declarative, path-addressed calculation engine. Components bind
//! abstract field paths to the inputs they consume and the results
//! they provide over a hierarchical, list-structured data tree; a
//! query names output paths (wildcards welcome) and the engine grows a
//! dependency graph of workers, drives it to completion with optional
//! parallelism, deduplicates identical activations through
//! content-addressed caching, and reshapes the flat results into the
//! nested structure the query implies.

pub mod utils;
pub mod errors;
pub mod value;
pub mod path;
pub mod store;
pub mod tree;
pub mod query;
pub mod component;
pub mod config;
pub mod cache;
pub mod worker;
pub mod runner;
pub mod model;

pub use crate::cache::{ FileCache, MemoryCache, ResultsCache };
pub use crate::component::{
    Binding, Component, ComponentError, ComponentFunc, ComponentLoader, ComponentRegistry,
    NullLoader, OutputSink, ValueView,
};
pub use crate::config::ModelConfig;
pub use crate::errors::HubitError;
pub use crate::model::{ GetOptions, Model, ModelCaching, ReuseResults };
pub use crate::path::{ ModelPath, QueryPath };
pub use crate::query::Query;
pub use crate::store::FlatData;
pub use crate::value::Value;
