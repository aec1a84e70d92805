use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

use crossbeam_utils::thread;
use hashbrown::{ HashMap, HashSet };
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{ debug, info };

use crate::cache::ResultsCache;
use crate::component::{ Component, ComponentFunc, OutputSink, ValueView };
use crate::errors::{ HubitError, Result };
use crate::path::ModelPath;
use crate::store::FlatData;
use crate::tree::LengthTree;
use crate::value::Value;
use crate::worker::Worker;

use Phase::*;

/// How long the watcher sleeps between checks of the terminal set.
pub const POLL_INTERVAL : Duration = Duration::from_millis(20);

/// The central dependency-resolution loop for one `get`. Spawning is a
/// pre-pass on the caller's thread : the whole worker graph is built by
/// recursing through every missing consumed path before anything runs.
/// Dispatch then drains ready workers, either inline on the caller's
/// thread (cooperative) or through a shared queue worked by a pool of
/// scoped executor threads (parallel). A watcher thread polls the flat
/// results store for the terminal paths and posts one shutdown marker
/// per executor when the query is answered, or when the shutdown flag
/// went up because a component failed.
///
/// In parallel mode the flat store, the subscription index and the
/// cache bookkeeping all live inside one mutex; component invocations
/// happen strictly outside it.
pub struct QueryRunner<'m> {
    providers : &'m [(Arc<Component>, ModelPath)],
    funcs : &'m HashMap<String, (Arc<dyn ComponentFunc>, Option<String>)>,
    forest : &'m HashMap<String, LengthTree>,
    flat_input : &'m FlatData,
    component_caching : bool,
    dryrun : bool,
    use_parallel : bool,
    n_threads : usize,
    incremental_cache : Option<(Arc<dyn ResultsCache>, String)>,
}

/// Everything the runner reports back to the model façade.
pub struct RunReport {
    pub flat_results : FlatData,
    pub cached_results : HashMap<u64, IndexMap<String, Value>>,
    pub worker_counts : IndexMap<String, usize>,
    pub cache_hits : IndexMap<String, usize>,
    pub workers : Vec<WorkerPlan>,
}

/// A completed (or dry-run) worker as seen from outside : what ran,
/// for which query path, writing where, having waited on what.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub component_id : String,
    pub query_path : String,
    pub provides : Vec<String>,
    pub awaited : Vec<String>,
    pub used_cache : bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// set_values ran; pending sets may be non-empty.
    Subscribed,
    /// Another worker owns this worker's cache key; completion arrives
    /// by injection, never by invocation.
    CacheWait,
    /// Handed to an executor (or injected); awaiting commit.
    Dispatched,
    Completed,
}

struct WorkerEntry {
    worker : Worker,
    phase : Phase,
    awaited : Vec<String>,
}

struct RunState {
    workers : Vec<WorkerEntry>,
    id_to_idx : HashMap<String, usize>,
    flat_results : FlatData,
    /// Internal path -> the worker that will write it.
    provided_paths : HashMap<String, usize>,
    subscribers_for_path : HashMap<String, Vec<usize>>,
    results_for_key : HashMap<u64, IndexMap<String, Value>>,
    provider_for_key : HashSet<u64>,
    key_subscribers : HashMap<u64, Vec<usize>>,
}

/// A component invocation ready to run outside the lock : the resolved
/// views travel with the job so executors never touch the worker while
/// the function runs.
struct Job {
    worker_idx : usize,
    component_id : String,
    func : Arc<dyn ComponentFunc>,
    input : IndexMap<String, Value>,
    results : IndexMap<String, Value>,
}

/// What an executor finds on the dispatch queue : a component
/// invocation, or the signal that the query is answered (or abandoned)
/// and the thread should wind down.
enum Dispatch {
    Invoke(Job),
    Shutdown,
}

/// The dispatch queue shared by the spawner, the executor pool and the
/// watcher. Invocations are worked in the order their workers became
/// ready; the watcher ends the run by posting one shutdown marker per
/// executor, so every thread sees exactly one.
struct JobQueue {
    inner : Mutex<VecDeque<Dispatch>>,
}

impl JobQueue {
    fn new() -> Self {
        JobQueue { inner : Mutex::new(VecDeque::new()) }
    }

    fn push(&self, job : Job) {
        self.inner.lock().push_back(Dispatch::Invoke(job));
    }

    fn extend(&self, jobs : Vec<Job>) {
        let mut inner = self.inner.lock();
        for job in jobs {
            inner.push_back(Dispatch::Invoke(job));
        }
    }

    /// One marker per executor; queued invocations ahead of the
    /// markers still drain first.
    fn shutdown_all(&self, executors : usize) {
        let mut inner = self.inner.lock();
        for _ in 0..executors {
            inner.push_back(Dispatch::Shutdown);
        }
    }

    fn pop(&self) -> Option<Dispatch> {
        self.inner.lock().pop_front()
    }
}

/// (worker index, output by local name, arrived-from-cache)
type Injection = (usize, IndexMap<String, Value>, bool);

impl<'m> QueryRunner<'m> {
    pub fn new(
        providers : &'m [(Arc<Component>, ModelPath)],
        funcs : &'m HashMap<String, (Arc<dyn ComponentFunc>, Option<String>)>,
        forest : &'m HashMap<String, LengthTree>,
        flat_input : &'m FlatData,
        component_caching : bool,
        dryrun : bool,
        use_parallel : bool,
        n_threads : usize,
        incremental_cache : Option<(Arc<dyn ResultsCache>, String)>,
    ) -> Self {
        QueryRunner {
            providers,
            funcs,
            forest,
            flat_input,
            component_caching,
            dryrun,
            use_parallel,
            n_threads,
            incremental_cache,
        }
    }

    /// Drive the given terminal paths (internal dotted form) to
    /// completion, starting from `seed` (possibly pre-populated by a
    /// reuse mode) and `cached_results` (component-cache state carried
    /// across `get` calls).
    pub fn run(
        &self,
        terminals : &[String],
        seed : FlatData,
        cached_results : HashMap<u64, IndexMap<String, Value>>,
    ) -> Result<RunReport> {
        let state = Mutex::new(RunState {
            workers : Vec::new(),
            id_to_idx : HashMap::new(),
            flat_results : seed,
            provided_paths : HashMap::new(),
            subscribers_for_path : HashMap::new(),
            results_for_key : cached_results,
            provider_for_key : HashSet::new(),
            key_subscribers : HashMap::new(),
        });

        // Spawn the whole graph before anything runs; every error in
        // this phase is a configuration error with no cleanup to do.
        let initial_jobs = {
            let mut st = state.lock();
            let mut stack = Vec::new();
            self.spawn_paths(&mut st, terminals, &mut stack)?;
            debug!("spawned {} workers", st.workers.len());

            let mut pending : VecDeque<Injection> = VecDeque::new();
            let mut jobs = Vec::new();
            for idx in 0..st.workers.len() {
                self.activate(&mut st, idx, &mut pending, &mut jobs)?;
            }
            self.drain(&mut st, &mut pending, &mut jobs)?;
            jobs
        };

        let shutdown = AtomicBool::new(false);
        let done = AtomicBool::new(false);
        let error_slot : Mutex<Option<HubitError>> = Mutex::new(None);

        if self.use_parallel {
            self.run_parallel(&state, initial_jobs, terminals, &shutdown, &done, &error_slot);
        } else {
            self.run_cooperative(&state, initial_jobs, terminals, &shutdown, &done, &error_slot);
        }

        if let Some(err) = error_slot.into_inner() {
            return Err(err)
        }

        let st = state.into_inner();
        for terminal in terminals {
            if !st.flat_results.contains_key(terminal) {
                return Err(HubitError::Config(format!(
                    "query finished without resolving terminal path '{}'", terminal
                )))
            }
        }

        let mut worker_counts : IndexMap<String, usize> = IndexMap::new();
        let mut cache_hits : IndexMap<String, usize> = IndexMap::new();
        for (component, _) in self.providers {
            worker_counts.entry(String::from(component.id())).or_insert(0);
            cache_hits.entry(String::from(component.id())).or_insert(0);
        }
        let mut plans = Vec::with_capacity(st.workers.len());
        for entry in &st.workers {
            *worker_counts.entry(String::from(entry.worker.component_id())).or_insert(0) += 1;
            if entry.worker.used_cache() {
                *cache_hits.entry(String::from(entry.worker.component_id())).or_insert(0) += 1;
            }
            plans.push(WorkerPlan {
                component_id : String::from(entry.worker.component_id()),
                query_path : String::from(entry.worker.query_path().as_str()),
                provides : entry.worker.paths_provided(),
                awaited : entry.awaited.clone(),
                used_cache : entry.worker.used_cache(),
            });
        }
        info!("query answered by {} workers", st.workers.len());

        Ok(RunReport {
            flat_results : st.flat_results,
            cached_results : st.results_for_key,
            worker_counts,
            cache_hits,
            workers : plans,
        })
    }

    /// Recursive, idempotent worker creation for a batch of requested
    /// internal paths. Paths already present in the store, or already
    /// promised by a spawned worker, are skipped; a promise held by a
    /// worker currently on the spawn stack is a dependency cycle.
    fn spawn_paths(
        &self,
        state : &mut RunState,
        paths : &[String],
        stack : &mut Vec<usize>,
    ) -> Result<Vec<u64>> {
        let mut sub_ids = Vec::new();
        for path in paths {
            if state.flat_results.contains_key(path) {
                continue
            }
            if let Some(&provider_idx) = state.provided_paths.get(path.as_str()) {
                if stack.contains(&provider_idx) {
                    return Err(HubitError::CycleDetected(path.clone()))
                }
                if let Some(results_id) = state.workers[provider_idx].worker.results_id() {
                    sub_ids.push(results_id);
                }
                continue
            }

            let (component, func, version) = self.provider_for_path(path)?;
            let mut worker = Worker::new(
                component,
                func,
                version,
                &crate::path::QueryPath::new(path.as_str()),
                self.forest,
                self.dryrun,
                self.component_caching,
            )?;

            if state.id_to_idx.contains_key(worker.id()) {
                continue
            }
            let idx = state.workers.len();
            state.id_to_idx.insert(String::from(worker.id()), idx);
            for provided in worker.paths_provided() {
                state.provided_paths.insert(provided, idx);
            }

            let (missing_inputs, missing_results) = worker.set_values(self.flat_input, &state.flat_results);
            if !missing_inputs.is_empty() {
                return Err(HubitError::worker(
                    worker.component_id(),
                    format!("consumed input path(s) {:?} not present in the input", missing_inputs),
                ))
            }
            for missing in &missing_results {
                state.subscribers_for_path
                     .entry(missing.clone())
                     .or_insert_with(Vec::new)
                     .push(idx);
            }
            debug!(
                "spawned worker '{}' awaiting {} result path(s)",
                worker.id(), missing_results.len()
            );

            state.workers.push(WorkerEntry {
                worker,
                phase : Subscribed,
                awaited : missing_results.clone(),
            });

            stack.push(idx);
            let upstream = self.spawn_paths(state, &missing_results, stack)?;
            stack.pop();

            if let Some(results_id) = self.submit(state, idx, &upstream) {
                sub_ids.push(results_id);
            }
        }
        Ok(sub_ids)
    }

    /// With caching on, settle the worker's final cache key : claim
    /// the provider role for a fresh key, or register as a key
    /// subscriber when the key is already owned.
    fn submit(&self, state : &mut RunState, idx : usize, upstream : &[u64]) -> Option<u64> {
        if !self.component_caching {
            return None
        }
        let key = state.workers[idx].worker.set_results_id(upstream)?;
        if state.results_for_key.contains_key(&key) {
            state.workers[idx].phase = CacheWait;
        } else if state.provider_for_key.contains(&key) {
            state.workers[idx].phase = CacheWait;
            state.key_subscribers.entry(key).or_insert_with(Vec::new).push(idx);
        } else {
            state.provider_for_key.insert(key);
        }
        Some(key)
    }

    /// The unique component able to provide an internal path.
    fn provider_for_path(&self, path : &str) -> Result<(Arc<Component>, Arc<dyn ComponentFunc>, Option<String>)> {
        let mut matched : Vec<&Arc<Component>> = Vec::new();
        for (component, mpath) in self.providers {
            if mpath.matches_internal(path) && !matched.iter().any(|m| m.id() == component.id()) {
                matched.push(component);
            }
        }
        match matched.as_slice() {
            [] => Err(HubitError::NoProvider(String::from(path))),
            [component] => {
                let (func, version) = self.funcs
                                          .get(component.id())
                                          .ok_or_else(|| HubitError::Config(format!(
                                              "no callable resolved for component '{}'", component.id()
                                          )))?;
                Ok(((*component).clone(), func.clone(), version.clone()))
            },
            many => Err(HubitError::AmbiguousProvider {
                path : String::from(path),
                providers : many.iter().map(|c| String::from(c.id())).collect(),
            })
        }
    }

    /// Move a worker forward if its pending sets are empty : inject
    /// cached output, synthesize a dryrun output, or emit a job.
    fn activate(
        &self,
        state : &mut RunState,
        idx : usize,
        pending : &mut VecDeque<Injection>,
        jobs : &mut Vec<Job>,
    ) -> Result<()> {
        if !state.workers[idx].worker.is_ready() {
            return Ok(())
        }
        match state.workers[idx].phase {
            Dispatched | Completed => Ok(()),
            CacheWait => {
                let cached = state.workers[idx].worker
                                  .results_id()
                                  .and_then(|key| state.results_for_key.get(&key))
                                  .cloned();
                if let Some(output) = cached {
                    state.workers[idx].phase = Dispatched;
                    pending.push_back((idx, output, true));
                }
                Ok(())
            },
            Subscribed => {
                if self.component_caching {
                    let cached = state.workers[idx].worker
                                      .results_id()
                                      .and_then(|key| state.results_for_key.get(&key))
                                      .cloned();
                    if let Some(output) = cached {
                        state.workers[idx].phase = Dispatched;
                        pending.push_back((idx, output, true));
                        return Ok(())
                    }
                }
                if state.workers[idx].worker.is_dryrun() {
                    let output = state.workers[idx].worker.dryrun_output();
                    state.workers[idx].phase = Dispatched;
                    pending.push_back((idx, output, false));
                    return Ok(())
                }
                let job = self.make_job(state, idx)?;
                state.workers[idx].phase = Dispatched;
                jobs.push(job);
                Ok(())
            }
        }
    }

    fn make_job(&self, state : &RunState, idx : usize) -> Result<Job> {
        let worker = &state.workers[idx].worker;
        let (input, results) = worker.build_views()?;
        Ok(Job {
            worker_idx : idx,
            component_id : String::from(worker.component_id()),
            func : worker.func(),
            input,
            results,
        })
    }

    /// Commit completions until the injection queue runs dry. Each
    /// completion writes the provided values to the flat store, wakes
    /// path subscribers and key subscribers, and may enqueue further
    /// injections or jobs.
    fn drain(
        &self,
        state : &mut RunState,
        pending : &mut VecDeque<Injection>,
        jobs : &mut Vec<Job>,
    ) -> Result<()> {
        while let Some((idx, values, from_cache)) = pending.pop_front() {
            if state.workers[idx].phase == Completed {
                continue
            }
            if from_cache {
                state.workers[idx].worker.mark_used_cache();
            }
            let pairs = state.workers[idx].worker.accept_output(values)?;
            state.workers[idx].phase = Completed;
            debug!(
                "worker '{}' completed with {} value(s)",
                state.workers[idx].worker.id(), pairs.len()
            );

            if self.component_caching {
                if let Some(key) = state.workers[idx].worker.results_id() {
                    if let Some(output) = state.workers[idx].worker.output().cloned() {
                        state.results_for_key.insert(key, output);
                    }
                    for subscriber in state.key_subscribers.remove(&key).unwrap_or_default() {
                        self.activate(state, subscriber, pending, jobs)?;
                    }
                }
            }

            for (path, value) in pairs {
                state.flat_results.insert(path.clone(), value.clone());
                let subscribers = state.subscribers_for_path
                                       .get(path.as_str())
                                       .cloned()
                                       .unwrap_or_default();
                for subscriber in subscribers {
                    state.workers[subscriber].worker.set_consumed_result(&path, value.clone());
                    self.activate(state, subscriber, pending, jobs)?;
                }
            }

            if let Some((cache, model_id)) = &self.incremental_cache {
                cache.store(model_id, &state.flat_results)?;
            }
        }
        Ok(())
    }

    fn execute_job(job : Job) -> (usize, Result<IndexMap<String, Value>>) {
        let Job { worker_idx, component_id, func, input, results } = job;
        debug!("invoking component '{}'", component_id);
        let mut sink = OutputSink::new();
        let outcome = func.run(&ValueView::new(input), &ValueView::new(results), &mut sink)
                          .map(|_| sink.into_values())
                          .map_err(|e| HubitError::Component {
                              component : component_id,
                              message : e.to_string(),
                          });
        (worker_idx, outcome)
    }

    /// Run one job result through the drain under the lock, returning
    /// any follow-up jobs.
    fn commit(
        &self,
        state : &Mutex<RunState>,
        idx : usize,
        values : IndexMap<String, Value>,
    ) -> Result<Vec<Job>> {
        let mut st = state.lock();
        let mut pending : VecDeque<Injection> = VecDeque::new();
        let mut jobs = Vec::new();
        pending.push_back((idx, values, false));
        self.drain(&mut st, &mut pending, &mut jobs)?;
        Ok(jobs)
    }

    fn run_cooperative(
        &self,
        state : &Mutex<RunState>,
        initial_jobs : Vec<Job>,
        terminals : &[String],
        shutdown : &AtomicBool,
        done : &AtomicBool,
        error_slot : &Mutex<Option<HubitError>>,
    ) {
        let outcome = thread::scope(|s| {
            // The watcher runs even in cooperative mode so that a
            // shutdown interrupts the run between component calls.
            s.spawn(|_| self.watch(state, terminals, shutdown, done, None));

            let mut queue : VecDeque<Job> = initial_jobs.into_iter().collect();
            while let Some(job) = queue.pop_front() {
                if shutdown.load(Ordering::SeqCst) {
                    break
                }
                let (idx, outcome) = QueryRunner::execute_job(job);
                match outcome.and_then(|values| self.commit(state, idx, values)) {
                    Ok(new_jobs) => queue.extend(new_jobs),
                    Err(err) => {
                        *error_slot.lock() = Some(err);
                        shutdown.store(true, Ordering::SeqCst);
                        break
                    }
                }
            }
            done.store(true, Ordering::SeqCst);
        });
        if outcome.is_err() {
            let mut slot = error_slot.lock();
            if slot.is_none() {
                *slot = Some(HubitError::Config(String::from("a runner thread panicked")));
            }
        }
    }

    fn run_parallel(
        &self,
        state : &Mutex<RunState>,
        initial_jobs : Vec<Job>,
        terminals : &[String],
        shutdown : &AtomicBool,
        done : &AtomicBool,
        error_slot : &Mutex<Option<HubitError>>,
    ) {
        let queue = JobQueue::new();
        queue.extend(initial_jobs);

        let outcome = thread::scope(|s| {
            s.spawn(|_| self.watch(state, terminals, shutdown, done, Some((&queue, self.n_threads))));

            for _ in 0..self.n_threads {
                s.spawn(|_| {
                    loop {
                        match queue.pop() {
                            Some(Dispatch::Invoke(job)) => {
                                if shutdown.load(Ordering::SeqCst) {
                                    continue
                                }
                                let (idx, outcome) = QueryRunner::execute_job(job);
                                match outcome.and_then(|values| self.commit(state, idx, values)) {
                                    Ok(new_jobs) => {
                                        for new_job in new_jobs {
                                            queue.push(new_job);
                                        }
                                    },
                                    Err(err) => {
                                        let mut slot = error_slot.lock();
                                        if slot.is_none() {
                                            *slot = Some(err);
                                        }
                                        shutdown.store(true, Ordering::SeqCst);
                                    }
                                }
                            },
                            Some(Dispatch::Shutdown) => break,
                            None => std::thread::yield_now(),
                        }
                    }
                });
            }
        });
        if outcome.is_err() {
            let mut slot = error_slot.lock();
            if slot.is_none() {
                *slot = Some(HubitError::Config(String::from("a runner thread panicked")));
            }
        }
    }

    /// Poll until every terminal path is present in the flat store (or
    /// the shutdown flag went up), then post one shutdown marker per
    /// executor so the pool can wind down.
    fn watch(
        &self,
        state : &Mutex<RunState>,
        terminals : &[String],
        shutdown : &AtomicBool,
        done : &AtomicBool,
        end_queue : Option<(&JobQueue, usize)>,
    ) {
        loop {
            if done.load(Ordering::SeqCst) || shutdown.load(Ordering::SeqCst) {
                break
            }
            {
                let st = state.lock();
                if terminals.iter().all(|t| st.flat_results.contains_key(t)) {
                    done.store(true, Ordering::SeqCst);
                    break
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if let Some((queue, executors)) = end_queue {
            queue.shutdown_all(executors);
        }
    }
}
