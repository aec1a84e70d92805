use std::sync::Arc;
use std::sync::atomic::{ AtomicUsize, Ordering };

use hubit::{
    Component, ComponentError, ComponentRegistry, FlatData, GetOptions, HubitError,
    MemoryCache, Model, ModelCaching, ModelConfig, ReuseResults, Value,
};

fn yaml(source : &str) -> Value {
    serde_yaml::from_str(source).unwrap()
}

fn build_model(components : Vec<Component>, registry : &ComponentRegistry, input : &str) -> Model {
    let cfg = ModelConfig::new(components).unwrap();
    let mut model = Model::new(cfg, registry).unwrap();
    model.set_input(yaml(input)).unwrap();
    model
}

#[test]
fn single_scalar() {
    // one component doubling a number
    let mut registry = ComponentRegistry::new();
    registry.register_fn("double", |input, _results, output| {
        let x = input.require("x")?.as_i64().ok_or_else(|| ComponentError::new("x must be an int"))?;
        output.set("out", 2 * x);
        Ok(())
    });
    let components = vec![
        Component::new("double").provides("out", "out").consumes_input("x", "in"),
    ];
    let mut model = build_model(components, &registry, "{in: 3}");
    let response = model.get(&["out"], GetOptions::default()).unwrap();
    assert_eq!(response.get("out"), Some(&Value::Int(6)));
}

#[test]
fn wildcarded_list() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("double", |input, _results, output| {
        let x = input.require("x")?.as_i64().unwrap_or(0);
        output.set("y", 2 * x);
        Ok(())
    });
    let components = vec![
        Component::new("double")
            .provides("y", "items[IDX_ITM].y")
            .consumes_input("x", "items[IDX_ITM].x"),
    ];
    let mut model = build_model(components, &registry, "{items: [{x: 1}, {x: 2}, {x: 3}]}");
    let response = model.get(&["items[:].y"], GetOptions::default()).unwrap();
    assert_eq!(
        response.get("items[:].y"),
        Some(&Value::List(vec![Value::Int(2), Value::Int(4), Value::Int(6)]))
    );
}

#[test]
fn dependency_chain() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("bump", |input, _results, output| {
        let raw = input.require("raw")?.as_i64().unwrap_or(0);
        output.set("b", raw + 1);
        Ok(())
    });
    registry.register_fn("scale", |_input, results, output| {
        let b = results.require("b")?.as_i64().unwrap_or(0);
        output.set("c", b * 10);
        Ok(())
    });
    let components = vec![
        Component::new("bump")
            .provides("b", "a[IDX_A].b")
            .consumes_input("raw", "a[IDX_A].raw"),
        Component::new("scale")
            .provides("c", "a[IDX_A].c")
            .consumes_results("b", "a[IDX_A].b"),
    ];
    let mut model = build_model(components, &registry, "{a: [{raw: 0}, {raw: 1}]}");
    let response = model.get(&["a[:].c"], GetOptions::default()).unwrap();
    assert_eq!(
        response.get("a[:].c"),
        Some(&Value::List(vec![Value::Int(10), Value::Int(20)]))
    );
}

#[test]
fn dependency_chain_parallel() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("bump", |input, _results, output| {
        let raw = input.require("raw")?.as_i64().unwrap_or(0);
        output.set("b", raw + 1);
        Ok(())
    });
    registry.register_fn("scale", |_input, results, output| {
        let b = results.require("b")?.as_i64().unwrap_or(0);
        output.set("c", b * 10);
        Ok(())
    });
    let components = vec![
        Component::new("bump")
            .provides("b", "a[IDX_A].b")
            .consumes_input("raw", "a[IDX_A].raw"),
        Component::new("scale")
            .provides("c", "a[IDX_A].c")
            .consumes_results("b", "a[IDX_A].b"),
    ];
    let mut model = build_model(components, &registry, "{a: [{raw: 0}, {raw: 1}, {raw: 2}]}");
    let options = GetOptions { use_multi_processing : true, ..GetOptions::default() };
    let response = model.get(&["a[:].c"], options).unwrap();
    assert_eq!(
        response.get("a[:].c"),
        Some(&Value::List(vec![Value::Int(10), Value::Int(20), Value::Int(30)]))
    );
}

#[test]
fn decomposition_across_providers() {
    // two components each cover one tank
    let mut registry = ComponentRegistry::new();
    for id in &["tank_0", "tank_1"] {
        registry.register_fn(*id, |input, _results, output| {
            output.set("v", input.require("inlet")?.clone());
            Ok(())
        });
    }
    let components = vec![
        Component::new("tank_0")
            .provides("v", "tanks[0].v")
            .consumes_input("inlet", "tanks[0].inlet"),
        Component::new("tank_1")
            .provides("v", "tanks[1].v")
            .consumes_input("inlet", "tanks[1].inlet"),
    ];
    let mut model = build_model(components, &registry, "{tanks: [{inlet: 11}, {inlet: 22}]}");
    let response = model.get(&["tanks[:].v"], GetOptions::default()).unwrap();
    assert_eq!(
        response.get("tanks[:].v"),
        Some(&Value::List(vec![Value::Int(11), Value::Int(22)]))
    );
}

#[test]
fn decomposition_with_bound_digits() {
    // same split expressed with digit-bound identifiers, which gives
    // the decomposition a length tree to validate against
    let mut registry = ComponentRegistry::new();
    for id in &["tank_0", "tank_1"] {
        registry.register_fn(*id, |input, _results, output| {
            output.set("v", input.require("inlet")?.clone());
            Ok(())
        });
    }
    let components = vec![
        Component::new("tank_0")
            .provides("v", "tanks[0@IDX_TANK].v")
            .consumes_input("inlet", "tanks[IDX_TANK].inlet"),
        Component::new("tank_1")
            .provides("v", "tanks[1@IDX_TANK].v")
            .consumes_input("inlet", "tanks[IDX_TANK].inlet"),
    ];
    let mut model = build_model(components, &registry, "{tanks: [{inlet: 11}, {inlet: 22}]}");
    let response = model.get(&["tanks[:].v"], GetOptions::default()).unwrap();
    assert_eq!(
        response.get("tanks[:].v"),
        Some(&Value::List(vec![Value::Int(11), Value::Int(22)]))
    );
}

fn car_model(counter : Arc<AtomicUsize>) -> Model {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("sum", move |input, _results, output| {
        counter.fetch_add(1, Ordering::SeqCst);
        let parts = input.require("parts")?
                         .as_list()
                         .ok_or_else(|| ComponentError::new("parts must be a list"))?
                         .iter()
                         .map(|v| v.as_i64().unwrap_or(0))
                         .sum::<i64>();
        output.set("p", parts);
        Ok(())
    });
    let components = vec![
        Component::new("sum")
            .provides("p", "cars[IDX_CAR].p")
            .consumes_input("parts", "cars[IDX_CAR].parts[IDX_PART]"),
    ];
    build_model(
        components,
        &registry,
        "{cars: [{parts: [1, 2]}, {parts: [7]}, {parts: [1, 2]}]}",
    )
}

#[test]
fn worker_cache_dedupes_identical_activations() {
    // cars 0 and 2 consume identical part prices
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter.clone());
    model.set_component_caching(true);
    let response = model.get(&["cars[:].p"], GetOptions::default()).unwrap();
    assert_eq!(
        response.get("cars[:].p"),
        Some(&Value::List(vec![Value::Int(3), Value::Int(7), Value::Int(3)]))
    );
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let entry = model.log().latest().unwrap();
    assert_eq!(entry.worker_counts.get("sum"), Some(&3));
    assert_eq!(entry.cache_counts.get("sum"), Some(&1));
}

#[test]
fn without_worker_cache_every_activation_runs() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter.clone());
    let _ = model.get(&["cars[:].p"], GetOptions::default()).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn cache_keys_hold_across_get_calls() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter.clone());
    model.set_component_caching(true);
    let first = model.get(&["cars[:].p"], GetOptions::default()).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    let second = model.get(&["cars[:].p"], GetOptions::default()).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
}

#[test]
fn negative_index_normalizes_before_expansion() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("pick", |input, _results, output| {
        output.set("v", input.require("raw")?.clone());
        Ok(())
    });
    let components = vec![
        Component::new("pick")
            .provides("v", "xs[IDX_X].v")
            .consumes_input("raw", "xs[IDX_X].raw"),
    ];
    let mut model = build_model(components, &registry, "{xs: [{raw: 5}, {raw: 6}, {raw: 7}]}");
    let response = model.get(&["xs[-1].v"], GetOptions::default()).unwrap();
    // keyed by the path as posed, valued by the last element
    assert_eq!(response.get("xs[-1].v"), Some(&Value::Int(7)));
}

#[test]
fn scalar_query_is_not_wrapped_in_a_list() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("double", |input, _results, output| {
        let x = input.require("x")?.as_i64().unwrap_or(0);
        output.set("y", 2 * x);
        Ok(())
    });
    let components = vec![
        Component::new("double")
            .provides("y", "items[IDX_ITM].y")
            .consumes_input("x", "items[IDX_ITM].x"),
    ];
    let mut model = build_model(components, &registry, "{items: [{x: 21}]}");
    let response = model.get(&["items[0].y"], GetOptions::default()).unwrap();
    assert_eq!(response.get("items[0].y"), Some(&Value::Int(42)));

    // the wildcard form keeps the list even with a single item
    let response = model.get(&["items[:].y"], GetOptions::default()).unwrap();
    assert_eq!(response.get("items[:].y"), Some(&Value::List(vec![Value::Int(42)])));
}

#[test]
fn reuse_current_skips_all_work() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter.clone());
    let first = model.get(&["cars[:].p"], GetOptions::default()).unwrap();
    let invocations = counter.load(Ordering::SeqCst);

    let options = GetOptions { reuse : ReuseResults::Current, ..GetOptions::default() };
    let second = model.get(&["cars[:].p"], options).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), invocations);
    assert_eq!(first, second);
}

#[test]
fn reuse_current_without_results_is_an_error() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter);
    let options = GetOptions { reuse : ReuseResults::Current, ..GetOptions::default() };
    match model.get(&["cars[:].p"], options) {
        Err(HubitError::NoResults) => (),
        other => panic!("expected NoResults, got {:?}", other.map(|_| ()))
    }
}

#[test]
fn model_cache_seeds_a_second_model() {
    let backend = Arc::new(MemoryCache::new());

    let counter = Arc::new(AtomicUsize::new(0));
    let mut first = car_model(counter.clone());
    first.set_model_caching(ModelCaching::AfterExecution, backend.clone());
    let _ = first.get(&["cars[:].p"], GetOptions::default()).unwrap();
    let invocations = counter.load(Ordering::SeqCst);

    // same config + input -> same model identity -> warm start
    let mut second = car_model(counter.clone());
    second.set_model_caching(ModelCaching::Never, backend);
    let options = GetOptions { reuse : ReuseResults::Cached, ..GetOptions::default() };
    let response = second.get(&["cars[:].p"], options).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), invocations);
    assert_eq!(
        response.get("cars[:].p"),
        Some(&Value::List(vec![Value::Int(3), Value::Int(7), Value::Int(3)]))
    );
}

#[test]
fn incremental_model_caching_persists_during_the_run() {
    let backend = Arc::new(MemoryCache::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter);
    model.set_model_caching(ModelCaching::Incremental, backend.clone());
    let _ = model.get(&["cars[0].p"], GetOptions::default()).unwrap();

    use hubit::ResultsCache;
    let stored = backend.load(&model.model_id().unwrap()).unwrap().unwrap();
    assert!(stored.contains_key("cars.0.p"));
}

#[test]
fn injected_results_bypass_components() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter.clone());
    let mut known = FlatData::new();
    known.insert("cars.0.p", Value::Int(100));
    known.insert("cars.1.p", Value::Int(200));
    known.insert("cars.2.p", Value::Int(300));
    model.set_results(known);

    let options = GetOptions { reuse : ReuseResults::Current, ..GetOptions::default() };
    let response = model.get(&["cars[:].p"], options).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(
        response.get("cars[:].p"),
        Some(&Value::List(vec![Value::Int(100), Value::Int(200), Value::Int(300)]))
    );
}

#[test]
fn validate_query_reports_workers_without_running() {
    let counter = Arc::new(AtomicUsize::new(0));
    let model = car_model(counter.clone());
    let plans = model.validate_query(&["cars[:].p"], false).unwrap();
    assert_eq!(plans.len(), 3);
    assert!(plans.iter().all(|plan| plan.component_id == "sum"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn component_failure_propagates() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("boom", |_input, _results, _output| {
        Err(ComponentError::new("numerical meltdown"))
    });
    let components = vec![
        Component::new("boom").provides("y", "y").consumes_input("x", "x"),
    ];
    let mut model = build_model(components, &registry, "{x: 1}");
    match model.get(&["y"], GetOptions::default()) {
        Err(HubitError::Component { component, message }) => {
            assert_eq!(component, "boom");
            assert!(message.contains("numerical meltdown"));
        },
        other => panic!("expected Component error, got {:?}", other.map(|_| ()))
    }
}

#[test]
fn cyclic_references_are_detected() {
    let mut registry = ComponentRegistry::new();
    registry.register_fn("a_from_b", |_input, results, output| {
        output.set("a", results.require("b")?.clone());
        Ok(())
    });
    registry.register_fn("b_from_a", |_input, results, output| {
        output.set("b", results.require("a")?.clone());
        Ok(())
    });
    let components = vec![
        Component::new("a_from_b").provides("a", "a").consumes_results("b", "b"),
        Component::new("b_from_a").provides("b", "b").consumes_results("a", "a"),
    ];
    let mut model = build_model(components, &registry, "{seed: 0}");
    match model.get(&["a"], GetOptions::default()) {
        Err(HubitError::CycleDetected(_)) => (),
        other => panic!("expected CycleDetected, got {:?}", other.map(|_| ()))
    }
}

#[test]
fn unknown_query_path_has_no_provider() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut model = car_model(counter);
    match model.get(&["cars[:].weight"], GetOptions::default()) {
        Err(HubitError::NoProvider(_)) => (),
        other => panic!("expected NoProvider, got {:?}", other.map(|_| ()))
    }
}

#[test]
fn get_before_set_input_is_an_error() {
    let registry = ComponentRegistry::new();
    let cfg = ModelConfig::new(vec![]).unwrap();
    let mut model = Model::new(cfg, &registry).unwrap();
    match model.get(&["x"], GetOptions::default()) {
        Err(HubitError::NoInput) => (),
        other => panic!("expected NoInput, got {:?}", other.map(|_| ()))
    }
}

#[test]
fn multi_path_query_shares_intermediate_results() {
    // both queried paths depend on the same upstream worker, which
    // must only run once
    let bump_counter = Arc::new(AtomicUsize::new(0));
    let mut registry = ComponentRegistry::new();
    let counter = bump_counter.clone();
    registry.register_fn("bump", move |input, _results, output| {
        counter.fetch_add(1, Ordering::SeqCst);
        let raw = input.require("raw")?.as_i64().unwrap_or(0);
        output.set("b", raw + 1);
        Ok(())
    });
    registry.register_fn("tenfold", |_input, results, output| {
        let b = results.require("b")?.as_i64().unwrap_or(0);
        output.set("c", b * 10);
        Ok(())
    });
    registry.register_fn("hundredfold", |_input, results, output| {
        let b = results.require("b")?.as_i64().unwrap_or(0);
        output.set("d", b * 100);
        Ok(())
    });
    let components = vec![
        Component::new("bump").provides("b", "n.b").consumes_input("raw", "n.raw"),
        Component::new("tenfold").provides("c", "n.c").consumes_results("b", "n.b"),
        Component::new("hundredfold").provides("d", "n.d").consumes_results("b", "n.b"),
    ];
    let mut model = build_model(components, &registry, "{n: {raw: 4}}");
    let response = model.get(&["n.c", "n.d"], GetOptions::default()).unwrap();
    assert_eq!(response.get("n.c"), Some(&Value::Int(50)));
    assert_eq!(response.get("n.d"), Some(&Value::Int(500)));
    assert_eq!(bump_counter.load(Ordering::SeqCst), 1);
}
