//! Task execution engine
//!
//! Expands a project into tasks, scans them, and runs the stale ones on a
//! bounded pool of workers. Tasks may add tasks while they run; the
//! scheduler keeps absorbing newcomers until nothing is pending, running
//! or newly added.
//!
//! Per task: pending -> ready -> scan -> fresh | stale. A task is ready once
//! every producer of its inputs has finished. Scanning happens then, so
//! generated headers are visible; newly found dependencies on unfinished
//! producers send the task back to waiting. Fresh tasks are reported with
//! `ran = false` and fire no events. Stale tasks fire `start`, run, fire
//! `done`, and on success have their signature recorded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::cache::{SignatureStore, Staleness};
use crate::error::Result;
use crate::graph::TaskGraph;
use crate::project::{
    BuildResult, Context, Project, Task, TaskFunction, TaskId, FAULT_EXIT_CODE, FAULT_MARKER,
};
use crate::signature::{self, Signature};

/// Successful records written between two store flushes
const FLUSH_INTERVAL: usize = 32;

/// Exit code when the program of a command task cannot be found
pub const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

/// Exit code when a command task exceeds its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Lifecycle event passed to a [`Listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    Start,
    Done,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Start => f.write_str("start"),
            TaskEvent::Done => f.write_str("done"),
        }
    }
}

/// Observer of tasks that actually run.
///
/// Called from worker tasks, possibly concurrently for different tasks.
pub trait Listener: Send + Sync {
    fn on_event(&self, project: &Project, task: &Task, event: TaskEvent);
}

impl<F> Listener for F
where
    F: Fn(&Project, &Task, TaskEvent) + Send + Sync,
{
    fn on_event(&self, project: &Project, task: &Task, event: TaskEvent) {
        self(project, task, event)
    }
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullListener;

impl Listener for NullListener {
    fn on_event(&self, _project: &Project, _task: &Task, _event: TaskEvent) {}
}

/// Stops dispatching new tasks once set; running tasks finish
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build options
#[derive(Clone)]
pub struct BuildOptions {
    /// Execute tasks; when false only expand and scan
    pub run: bool,
    /// Treat every task as stale
    pub force: bool,
    /// Number of parallel tasks (0 = number of CPUs)
    pub parallelism: usize,
    /// Consult and update the signature store
    pub cache: bool,
    pub listener: Arc<dyn Listener>,
    pub cancel: CancelFlag,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            run: true,
            force: false,
            parallelism: 0,
            cache: true,
            listener: Arc::new(NullListener),
            cancel: CancelFlag::default(),
        }
    }
}

impl BuildOptions {
    pub fn run(mut self, run: bool) -> Self {
        self.run = run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn listener(mut self, listener: impl Listener + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("run", &self.run)
            .field("force", &self.force)
            .field("parallelism", &self.parallelism)
            .field("cache", &self.cache)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Build `project`, returning one result per considered task
pub async fn build(project: &Project, options: BuildOptions) -> Result<Vec<BuildResult>> {
    Executor::new(project.clone(), options).execute().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Finished,
}

/// What a worker reports back
#[derive(Debug)]
struct Outcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
    duration: Duration,
}

impl Outcome {
    fn succeeded() -> Self {
        Self::failed(0, "")
    }

    fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    fn fault(message: impl fmt::Display) -> Self {
        Self::failed(FAULT_EXIT_CODE, format!("{FAULT_MARKER} {message}"))
    }
}

/// Scheduler bookkeeping for one `execute` call
struct Schedule {
    graph: TaskGraph,
    tasks: Vec<Arc<Task>>,
    states: Vec<State>,
    signatures: Vec<Option<Signature>>,
    /// Scan error per task whose scan failed
    scan_errors: HashMap<TaskId, String>,
    results: BTreeMap<TaskId, BuildResult>,
    passes: usize,
    /// Store changes not yet written to disk
    unflushed: usize,
}

impl Schedule {
    fn new() -> Self {
        Self {
            graph: TaskGraph::new(),
            tasks: Vec::new(),
            states: Vec::new(),
            signatures: Vec::new(),
            scan_errors: HashMap::new(),
            results: BTreeMap::new(),
            passes: 0,
            unflushed: 0,
        }
    }

    fn is_ready(&self, idx: usize) -> bool {
        let Some(id) = self.tasks[idx].id() else {
            return true;
        };
        self.graph
            .producers(id)
            .iter()
            .all(|p| self.states.get(p.index()) == Some(&State::Finished))
    }

    fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == State::Pending)
            .map(|(i, _)| i)
    }
}

/// Task executor
pub struct Executor {
    project: Project,
    options: BuildOptions,
}

impl Executor {
    /// Create a new executor
    pub fn new(project: Project, options: BuildOptions) -> Self {
        Self { project, options }
    }

    /// Expand, scan and (unless `run` is off) execute the project
    pub async fn execute(&self) -> Result<Vec<BuildResult>> {
        self.project.expand()?;

        let mut schedule = Schedule::new();
        self.absorb_new_tasks(&mut schedule)?;

        if !self.options.run {
            self.scan_all(&mut schedule)?;
            tracing::info!(tasks = schedule.tasks.len(), "expanded without running");
            return Ok(Vec::new());
        }

        let mut store = if self.options.cache {
            SignatureStore::load(self.project.build_dir()).await
        } else {
            SignatureStore::disabled()
        };

        let parallelism = if self.options.parallelism == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.options.parallelism
        };
        let semaphore = Arc::new(Semaphore::new(parallelism));

        let driven = self.drive(&mut schedule, &mut store, semaphore).await;
        if schedule.unflushed > 0 {
            if let Err(e) = store.flush().await {
                tracing::warn!(error = %e, "failed to persist signature store");
            }
        }
        driven?;

        let unstarted = schedule.pending().count();
        if unstarted > 0 {
            tracing::warn!(unstarted, "build cancelled before all tasks were dispatched");
        }

        let results: Vec<BuildResult> = schedule.results.into_values().collect();
        let ran = results.iter().filter(|r| r.ran).count();
        let failed = results.iter().filter(|r| !r.success()).count();
        tracing::info!(
            considered = results.len(),
            ran,
            failed,
            passes = schedule.passes,
            "build finished"
        );

        Ok(results)
    }

    /// Run the fixpoint until nothing is pending, running or newly added
    async fn drive(
        &self,
        schedule: &mut Schedule,
        store: &mut SignatureStore,
        semaphore: Arc<Semaphore>,
    ) -> Result<()> {
        let mut running: JoinSet<(usize, Outcome)> = JoinSet::new();

        loop {
            self.absorb_new_tasks(schedule)?;

            if !self.options.cancel.is_cancelled() {
                self.dispatch_ready(schedule, store, &semaphore, &mut running)?;
            }

            if running.is_empty() {
                if self.project.task_count() > schedule.tasks.len() {
                    continue;
                }
                break;
            }

            let Some(joined) = running.join_next().await else {
                continue;
            };
            match joined {
                Ok((idx, outcome)) => {
                    self.finish(schedule, store, idx, outcome).await;
                }
                Err(e) => {
                    // Workers catch callback panics themselves; this only
                    // triggers if the runtime is shutting down.
                    tracing::error!(error = %e, "worker terminated abnormally");
                }
            }
        }

        Ok(())
    }

    /// Link tasks added since the last look into the graph
    fn absorb_new_tasks(&self, schedule: &mut Schedule) -> Result<()> {
        let fresh = self.project.tasks_since(schedule.tasks.len());
        if fresh.is_empty() {
            return Ok(());
        }

        schedule.passes += 1;
        for task in &fresh {
            schedule.graph.add_task(task);
            schedule.states.push(State::Pending);
            schedule.signatures.push(None);
        }
        schedule.tasks.extend(fresh.iter().cloned());
        schedule.graph.check_acyclic()?;

        tracing::debug!(
            pass = schedule.passes,
            added = fresh.len(),
            total = schedule.tasks.len(),
            "expanded task graph"
        );
        Ok(())
    }

    /// Run the task's scanner. A failed scan is recorded and yields no
    /// dependencies.
    fn scan(&self, schedule: &mut Schedule, idx: usize) -> BTreeSet<PathBuf> {
        let task = &schedule.tasks[idx];
        let Some(scanner) = &task.scanner else {
            return BTreeSet::new();
        };

        match scanner.scan(task, &self.project) {
            Ok(deps) => {
                tracing::trace!(task = %task.label(), deps = deps.len(), "scanned");
                if let Some(id) = task.id() {
                    schedule.scan_errors.remove(&id);
                }
                deps
            }
            Err(e) => {
                tracing::warn!(task = %task.label(), error = %e, "dependency scan failed; task will run");
                if let Some(id) = task.id() {
                    schedule.scan_errors.insert(id, e.to_string());
                }
                BTreeSet::new()
            }
        }
    }

    /// Scan a ready task and settle its dependencies. Returns false when the
    /// scan found files whose producers have not finished yet; the task
    /// waits for them and is scanned again.
    fn settle_dependencies(&self, schedule: &mut Schedule, idx: usize) -> Result<bool> {
        let task = Arc::clone(&schedule.tasks[idx]);
        if task.is_scanned() {
            return Ok(true);
        }

        let deps = self.scan(schedule, idx);
        if let Some(id) = task.id() {
            schedule.graph.add_dependencies(id, &deps);
            schedule.graph.check_acyclic()?;
            if !schedule.is_ready(idx) {
                tracing::debug!(task = %task.label(), "waiting for generated dependencies");
                return Ok(false);
            }
        }

        task.set_dependencies(deps);
        Ok(true)
    }

    /// Scan every task without waiting on producers, for `run = false`
    fn scan_all(&self, schedule: &mut Schedule) -> Result<()> {
        for idx in 0..schedule.tasks.len() {
            let task = Arc::clone(&schedule.tasks[idx]);
            if task.is_scanned() {
                continue;
            }
            let deps = self.scan(schedule, idx);
            if let Some(id) = task.id() {
                schedule.graph.add_dependencies(id, &deps);
            }
            task.set_dependencies(deps);
        }
        schedule.graph.check_acyclic()
    }

    /// Dispatch every ready pending task, repeating while fresh tasks
    /// complete immediately and unblock others
    fn dispatch_ready(
        &self,
        schedule: &mut Schedule,
        store: &SignatureStore,
        semaphore: &Arc<Semaphore>,
        running: &mut JoinSet<(usize, Outcome)>,
    ) -> Result<()> {
        loop {
            let ready: Vec<usize> = schedule
                .pending()
                .filter(|&idx| schedule.is_ready(idx))
                .collect();
            let mut skipped_any = false;

            for idx in ready {
                if self.options.cancel.is_cancelled() {
                    return Ok(());
                }
                if !self.settle_dependencies(schedule, idx)? {
                    continue;
                }

                let task = Arc::clone(&schedule.tasks[idx]);
                let sig = signature::compute(&task);
                task.set_signature(sig);
                schedule.signatures[idx] = Some(sig);

                let staleness = match task.id() {
                    _ if self.options.force => Staleness::Forced,
                    Some(id) if schedule.scan_errors.contains_key(&id) => Staleness::ScanFailed,
                    _ => store.check(&task, &sig),
                };

                if !staleness.is_stale() {
                    tracing::debug!(task = %task.label(), "up to date, skipping");
                    schedule.states[idx] = State::Finished;
                    if let Some(id) = task.id() {
                        schedule.results.insert(id, BuildResult::skipped(task));
                    }
                    skipped_any = true;
                    continue;
                }

                tracing::debug!(task = %task.label(), reason = %staleness, "running");
                schedule.states[idx] = State::Running;

                let project = self.project.clone();
                let listener = Arc::clone(&self.options.listener);
                let sem = Arc::clone(semaphore);

                running.spawn(async move {
                    let _permit = sem.acquire_owned().await.ok();

                    listener.on_event(&project, &task, TaskEvent::Start);
                    let outcome = Self::execute_single_task(&project, &task).await;
                    listener.on_event(&project, &task, TaskEvent::Done);

                    (idx, outcome)
                });
            }

            if !skipped_any {
                return Ok(());
            }
        }
    }

    /// Record a worker's outcome
    async fn finish(
        &self,
        schedule: &mut Schedule,
        store: &mut SignatureStore,
        idx: usize,
        outcome: Outcome,
    ) {
        schedule.states[idx] = State::Finished;
        let task = Arc::clone(&schedule.tasks[idx]);

        if outcome.exit_code == 0 {
            if let Some(sig) = &schedule.signatures[idx] {
                let children = self.children_of(&task);
                store.record(&task, sig, outcome.duration.as_millis() as u64, children);
                schedule.unflushed += 1;
            }
        } else {
            tracing::debug!(task = %task.label(), code = outcome.exit_code, "task failed");
            store.forget(&task);
            schedule.unflushed += 1;
        }

        if schedule.unflushed >= FLUSH_INTERVAL {
            match store.flush().await {
                Ok(()) => schedule.unflushed = 0,
                Err(e) => tracing::warn!(error = %e, "failed to persist signature store"),
            }
        }

        let Some(id) = task.id() else {
            return;
        };
        let stderr = match schedule.scan_errors.get(&id) {
            Some(scan) if outcome.exit_code != 0 => format!("{}\nscan: {scan}", outcome.stderr),
            _ => outcome.stderr,
        };
        schedule.results.insert(
            id,
            BuildResult {
                task,
                ran: true,
                exit_code: outcome.exit_code,
                stdout: outcome.stdout,
                stderr,
                duration: outcome.duration,
            },
        );
    }

    /// Store keys of the tasks `task` added while it ran
    fn children_of(&self, task: &Task) -> Vec<String> {
        let (Some(id), TaskFunction::Callback(_)) = (task.id(), &task.function) else {
            return Vec::new();
        };
        self.project
            .tasks()
            .iter()
            .filter(|t| t.product_of() == Some(id))
            .map(|t| SignatureStore::key(t))
            .collect()
    }

    /// Execute a single task
    async fn execute_single_task(project: &Project, task: &Arc<Task>) -> Outcome {
        let start = Instant::now();

        if let Err(e) = Self::prepare_outputs(task).await {
            let mut outcome = Outcome::failed(1, format!("cannot create output directory: {e}"));
            outcome.duration = start.elapsed();
            return outcome;
        }

        let mut outcome = match &task.function {
            TaskFunction::Command { argv, timeout } => Self::execute_command(argv, *timeout).await,
            TaskFunction::Callback(_) => Self::execute_callback(project, task).await,
        };
        outcome.duration = start.elapsed();
        outcome
    }

    async fn prepare_outputs(task: &Task) -> std::io::Result<()> {
        for output in &task.outputs {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Run a callback on the blocking pool; errors and panics become faults
    async fn execute_callback(project: &Project, task: &Arc<Task>) -> Outcome {
        let (Some(id), TaskFunction::Callback(callback)) = (task.id(), &task.function) else {
            return Outcome::fault("callback task is not registered in a project");
        };

        let ctx = Context::for_task(project.clone(), id);
        let callback = Arc::clone(callback);
        let task = Arc::clone(task);

        match tokio::task::spawn_blocking(move || callback(&ctx, task.as_ref())).await {
            Ok(Ok(())) => Outcome::succeeded(),
            Ok(Err(report)) => {
                let mut message = report.to_string();
                for cause in report.chain().skip(1) {
                    message.push_str(&format!("\n  caused by: {cause}"));
                }
                Outcome::fault(message)
            }
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                Outcome::fault(format!("panic: {message}"))
            }
            Err(e) => Outcome::fault(e),
        }
    }

    /// Execute an argument vector as a subprocess
    async fn execute_command(argv: &[String], limit: Option<Duration>) -> Outcome {
        let Some((program, args)) = argv.split_first() else {
            return Outcome::failed(1, "empty command line");
        };

        let resolved = match which::which(program) {
            Ok(path) => path,
            Err(_) => {
                return Outcome::failed(
                    COMMAND_NOT_FOUND_EXIT_CODE,
                    format!("Command not found: {program}"),
                )
            }
        };

        let mut command = Command::new(&resolved);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match limit {
            Some(limit) => match timeout(limit, command.output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Outcome::failed(
                        TIMEOUT_EXIT_CODE,
                        format!("{} timed out after {:.1}s", display_program(&resolved), limit.as_secs_f64()),
                    )
                }
            },
            None => command.output().await,
        };

        match output {
            Ok(output) => Outcome {
                exit_code: output.status.code().unwrap_or(1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration: Duration::ZERO,
            },
            Err(e) => Outcome::failed(1, format!("failed to spawn {}: {e}", display_program(&resolved))),
        }
    }
}

fn display_program(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
