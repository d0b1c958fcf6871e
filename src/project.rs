//! Build data model
//!
//! A [`Project`] is one build session: its inputs, include search paths,
//! output root and registered generators, plus the append-only arena of
//! [`Task`]s expanded from them. Tasks refer to each other by [`TaskId`]
//! only, so a task spawned by another task holds no ownership over it.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use crate::error::{BobError, Result};
use crate::generator::{Generators, TaskFactory};
use crate::scan::Scanner;
use crate::signature::Signature;
use crate::substitute::Vars;

/// Exit code reported when an in-process callback faults
pub const FAULT_EXIT_CODE: i32 = 10;

/// Prefix of the `stderr` text of a faulted callback
pub const FAULT_MARKER: &str = "Fault:";

/// Stable handle of a task inside its project's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// In-process unit of work
pub type Callback = Arc<dyn Fn(&Context, &Task) -> miette::Result<()> + Send + Sync>;

/// What a task does when it runs
#[derive(Clone)]
pub enum TaskFunction {
    /// Spawn an external process with this argument vector
    Command {
        argv: Vec<String>,
        timeout: Option<Duration>,
    },
    /// Call back into the host
    Callback(Callback),
}

impl TaskFunction {
    pub fn command(argv: Vec<String>) -> Self {
        TaskFunction::Command {
            argv,
            timeout: None,
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Context, &Task) -> miette::Result<()> + Send + Sync + 'static,
    {
        TaskFunction::Callback(Arc::new(f))
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFunction::Command { argv, timeout } => f
                .debug_struct("Command")
                .field("argv", argv)
                .field("timeout", timeout)
                .finish(),
            TaskFunction::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

static NO_DEPENDENCIES: BTreeSet<PathBuf> = BTreeSet::new();

/// One unit of buildable work
pub struct Task {
    pub name: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub function: TaskFunction,
    /// Configuration that shaped `function`; part of the signature
    pub config: Vars,
    pub scanner: Option<Arc<dyn Scanner>>,
    id: Option<TaskId>,
    product_of: Option<TaskId>,
    dependencies: OnceLock<BTreeSet<PathBuf>>,
    signature: OnceLock<Signature>,
}

impl Task {
    pub fn new(name: impl Into<String>, function: TaskFunction) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            function,
            config: Vars::new(),
            scanner: None,
            id: None,
            product_of: None,
            dependencies: OnceLock::new(),
            signature: OnceLock::new(),
        }
    }

    pub fn inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.inputs = inputs.into_iter().map(|p| normalize(p.as_ref())).collect();
        self
    }

    pub fn outputs<I, P>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.outputs = outputs.into_iter().map(|p| normalize(p.as_ref())).collect();
        self
    }

    pub fn config(mut self, config: Vars) -> Self {
        self.config = config;
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Arena handle, assigned when the task is added to a project
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// The task whose execution created this one
    pub fn product_of(&self) -> Option<TaskId> {
        self.product_of
    }

    /// Indirect inputs found by scanning; empty until scanned
    pub fn dependencies(&self) -> &BTreeSet<PathBuf> {
        self.dependencies.get().unwrap_or(&NO_DEPENDENCIES)
    }

    pub fn is_scanned(&self) -> bool {
        self.dependencies.get().is_some()
    }

    /// Returns false if dependencies were already set
    pub(crate) fn set_dependencies(&self, deps: BTreeSet<PathBuf>) -> bool {
        self.dependencies.set(deps).is_ok()
    }

    pub fn signature(&self) -> Option<Signature> {
        self.signature.get().copied()
    }

    pub(crate) fn set_signature(&self, signature: Signature) {
        let _ = self.signature.set(signature);
    }

    /// Short label for progress output
    pub fn label(&self) -> String {
        match self.outputs.first() {
            Some(out) => format!("{} {}", self.name, out.display()),
            None => self.name.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependencies", self.dependencies())
            .field("product_of", &self.product_of)
            .field("function", &self.function)
            .finish()
    }
}

/// Outcome of one considered task in a build pass
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub task: Arc<Task>,
    pub ran: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl BuildResult {
    pub(crate) fn skipped(task: Arc<Task>) -> Self {
        Self {
            task,
            ran: false,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The task was an in-process callback that faulted
    pub fn is_fault(&self) -> bool {
        self.exit_code == FAULT_EXIT_CODE && self.stderr.starts_with(FAULT_MARKER)
    }
}

struct ProjectState {
    build_dir: PathBuf,
    inputs: BTreeSet<PathBuf>,
    includes: Vec<String>,
    generators: RwLock<Generators>,
    tasks: RwLock<Vec<Arc<Task>>>,
    expanded: AtomicBool,
}

/// One build session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Project {
    state: Arc<ProjectState>,
}

impl Project {
    /// Create a project. Paths are normalized lexically; no file is touched.
    pub fn new<I, P, S>(build_dir: impl AsRef<Path>, inputs: I, includes: S) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            state: Arc::new(ProjectState {
                build_dir: normalize(build_dir.as_ref()),
                inputs: inputs.into_iter().map(|p| normalize(p.as_ref())).collect(),
                includes: includes.into_iter().map(Into::into).collect(),
                generators: RwLock::new(Generators::default()),
                tasks: RwLock::new(Vec::new()),
                expanded: AtomicBool::new(false),
            }),
        }
    }

    pub fn build_dir(&self) -> &Path {
        &self.state.build_dir
    }

    pub fn inputs(&self) -> &BTreeSet<PathBuf> {
        &self.state.inputs
    }

    pub fn includes(&self) -> &[String] {
        &self.state.includes
    }

    /// Register a factory for an extension (`".c"`, `"c"` or `"*"`)
    pub fn register(&self, ext: &str, factory: impl TaskFactory + 'static) {
        self.register_arc(ext, Arc::new(factory));
    }

    pub fn register_arc(&self, ext: &str, factory: Arc<dyn TaskFactory>) {
        self.state
            .generators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ext, factory);
    }

    /// Factory responsible for `path`, falling back to the wildcard
    pub fn generator_for(&self, path: &Path) -> Option<Arc<dyn TaskFactory>> {
        self.state
            .generators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(path)
    }

    pub fn generator_extensions(&self) -> Vec<String> {
        self.state
            .generators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .extensions()
    }

    /// Append a task created outside of any running task
    pub fn add_task(&self, task: Task) -> Arc<Task> {
        self.push_task(task, None)
    }

    fn push_task(&self, mut task: Task, creator: Option<TaskId>) -> Arc<Task> {
        let mut tasks = self
            .state
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        task.id = Some(TaskId(tasks.len()));
        task.product_of = creator;
        let task = Arc::new(task);
        tasks.push(Arc::clone(&task));
        task
    }

    /// Snapshot of every task registered so far
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0)
            .cloned()
    }

    pub fn task_count(&self) -> usize {
        self.state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Tasks appended at or after arena position `start`
    pub(crate) fn tasks_since(&self, start: usize) -> Vec<Arc<Task>> {
        let tasks = self
            .state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Whether some registered task declares `path` as an output
    pub fn produces(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.state
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|task| task.outputs.contains(&path))
    }

    /// Mirror `path` under `build_dir` with a new extension
    pub fn change_ext(&self, path: impl AsRef<Path>, new_ext: &str) -> PathBuf {
        let path = normalize(path.as_ref());
        let relative = path.strip_prefix(self.build_dir()).unwrap_or(&path);

        let mut out = self.build_dir().to_path_buf();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                out.push(part);
            }
        }
        out.set_extension(new_ext.trim_start_matches('.'));
        out
    }

    /// Context for creating tasks outside of task execution
    pub fn context(&self) -> Context {
        Context {
            project: self.clone(),
            creator: None,
        }
    }

    /// Run every registered factory over `inputs` once.
    ///
    /// A missing factory aborts expansion with [`BobError::NoGenerator`].
    pub fn expand(&self) -> Result<()> {
        if self.state.expanded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ctx = self.context();
        for input in self.inputs() {
            ctx.generate(input)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("build_dir", &self.state.build_dir)
            .field("inputs", &self.state.inputs)
            .field("includes", &self.state.includes)
            .field("generators", &self.generator_extensions())
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// A project handle that remembers which task, if any, is creating tasks
pub struct Context {
    project: Project,
    creator: Option<TaskId>,
}

impl Context {
    pub(crate) fn for_task(project: Project, creator: TaskId) -> Self {
        Self {
            project,
            creator: Some(creator),
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn creator(&self) -> Option<TaskId> {
        self.creator
    }

    /// Append `task`, marking it as a product of the running task
    pub fn add_task(&self, task: Task) -> Arc<Task> {
        self.project.push_task(task, self.creator)
    }

    /// Route `input` through the factory registered for its extension
    pub fn generate(&self, input: &Path) -> Result<()> {
        let factory = self
            .project
            .generator_for(input)
            .ok_or_else(|| BobError::NoGenerator {
                ext: extension_key(input),
                input: input.to_path_buf(),
            })?;
        factory.generate(self, input).map_err(|e| {
            if e.is_configuration() {
                e
            } else {
                BobError::Generator {
                    input: input.to_path_buf(),
                    message: e.to_string(),
                }
            }
        })
    }
}

impl Deref for Context {
    type Target = Project;

    fn deref(&self) -> &Project {
        &self.project
    }
}

/// `.ext` form of a path's extension, or an empty string
pub(crate) fn extension_key(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Lexically clean a path: drop `.` and fold `name/..` pairs
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal = matches!(out.components().last(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Deduplicate while keeping first-seen order
pub(crate) fn dedup_paths(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TaskFunction {
        TaskFunction::callback(|_, _| Ok(()))
    }

    #[test]
    fn test_change_ext_mirrors_source_tree() {
        let p = Project::new("tmp_build", ["tmp/test_data/main.c"], Vec::<String>::new());
        assert_eq!(
            p.change_ext("tmp/test_data/main.c", ".o"),
            PathBuf::from("tmp_build/tmp/test_data/main.o")
        );
    }

    #[test]
    fn test_change_ext_of_generated_file_stays_in_build_dir() {
        let p = Project::new("tmp_build", Vec::<PathBuf>::new(), Vec::<String>::new());
        assert_eq!(
            p.change_ext("tmp_build/data/test_0.number", "numberc"),
            PathBuf::from("tmp_build/data/test_0.numberc")
        );
    }

    #[test]
    fn test_change_ext_never_escapes_build_dir() {
        let p = Project::new("out", Vec::<PathBuf>::new(), Vec::<String>::new());
        assert_eq!(p.change_ext("../src/a.c", ".o"), PathBuf::from("out/src/a.o"));
        assert_eq!(p.change_ext("/abs/a.c", ".o"), PathBuf::from("out/abs/a.o"));
    }

    #[test]
    fn test_inputs_are_normalized_and_deduplicated() {
        let p = Project::new("b", ["./src/a.c", "src/a.c", "src/x/../b.c"], ["inc"]);
        let inputs: Vec<_> = p.inputs().iter().cloned().collect();
        assert_eq!(inputs, vec![PathBuf::from("src/a.c"), PathBuf::from("src/b.c")]);
        assert_eq!(p.includes(), ["inc".to_string()]);
    }

    #[test]
    fn test_add_task_assigns_ids_and_provenance() {
        let p = Project::new("b", Vec::<PathBuf>::new(), Vec::<String>::new());
        let parent = p.add_task(Task::new("parent", noop()));
        assert_eq!(parent.id(), Some(TaskId(0)));
        assert_eq!(parent.product_of(), None);

        let ctx = Context::for_task(p.clone(), TaskId(0));
        let child = ctx.add_task(Task::new("child", noop()));
        assert_eq!(child.id(), Some(TaskId(1)));
        assert_eq!(child.product_of(), Some(TaskId(0)));
        assert_eq!(p.task_count(), 2);
        assert_eq!(p.tasks_since(1).len(), 1);
    }

    #[test]
    fn test_dependencies_set_once() {
        let t = Task::new("t", noop());
        assert!(t.dependencies().is_empty());
        assert!(t.set_dependencies(BTreeSet::from([PathBuf::from("a.h")])));
        assert!(!t.set_dependencies(BTreeSet::new()));
        assert_eq!(t.dependencies().len(), 1);
    }

    #[test]
    fn test_generate_without_factory_fails() {
        let p = Project::new("b", ["x.unknown"], Vec::<String>::new());
        let err = p.expand().unwrap_err();
        assert!(matches!(err, BobError::NoGenerator { ext, .. } if ext == ".unknown"));
    }

    #[test]
    fn test_factory_failure_names_the_input() {
        let p = Project::new("b", ["missing.list"], Vec::<String>::new());
        p.register(".list", |_: &Context, input: &Path| -> Result<()> {
            std::fs::read(input)?;
            Ok(())
        });

        let err = p.expand().unwrap_err();
        assert!(matches!(err, BobError::Generator { input, .. } if input == Path::new("missing.list")));
    }
}
