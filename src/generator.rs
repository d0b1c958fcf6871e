//! Task generators
//!
//! A [`TaskFactory`] turns one input path into zero or more tasks, adding
//! them through the [`Context`] it is given. Factories are registered per
//! file extension on a [`crate::Project`]; the same factory may be invoked
//! again from inside a running task to grow the graph dynamically.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::project::{extension_key, Context, Task, TaskFunction};
use crate::scan::Scanner;
use crate::substitute::{substitute, Vars};

/// Registry key matching any extension
pub const WILDCARD: &str = "*";

/// Turns an input path into tasks
pub trait TaskFactory: Send + Sync {
    fn generate(&self, ctx: &Context, input: &Path) -> Result<()>;
}

impl<F> TaskFactory for F
where
    F: Fn(&Context, &Path) -> Result<()> + Send + Sync,
{
    fn generate(&self, ctx: &Context, input: &Path) -> Result<()> {
        self(ctx, input)
    }
}

/// Extension to factory mapping
#[derive(Default, Clone)]
pub struct Generators {
    by_ext: HashMap<String, Arc<dyn TaskFactory>>,
}

impl Generators {
    pub fn insert(&mut self, ext: &str, factory: Arc<dyn TaskFactory>) {
        self.by_ext.insert(normalize_ext(ext), factory);
    }

    /// Factory for `path`'s extension, else the wildcard factory
    pub fn lookup(&self, path: &Path) -> Option<Arc<dyn TaskFactory>> {
        self.by_ext
            .get(&extension_key(path))
            .or_else(|| self.by_ext.get(WILDCARD))
            .cloned()
    }

    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<_> = self.by_ext.keys().cloned().collect();
        exts.sort();
        exts
    }
}

fn normalize_ext(ext: &str) -> String {
    if ext == WILDCARD || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

/// Data-driven generator: one subprocess task per input.
///
/// The command template is expanded with [`substitute`] against the
/// generator's vars overlaid with `INPUTS`, `OUTPUTS` and `INCLUDES`. The
/// merged mapping is kept on the task as its configuration snapshot, so any
/// change to it (include paths, flags) changes the task signature.
#[derive(Clone)]
pub struct CommandGenerator {
    name: String,
    template: String,
    output_ext: String,
    vars: Vars,
    scanner: Option<Arc<dyn Scanner>>,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    pub fn new(name: impl Into<String>, template: impl Into<String>, output_ext: &str) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            output_ext: output_ext.to_string(),
            vars: Vars::new(),
            scanner: None,
            timeout: None,
        }
    }

    pub fn vars(mut self, vars: Vars) -> Self {
        self.vars = vars;
        self
    }

    pub fn scanner(mut self, scanner: impl Scanner + 'static) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl TaskFactory for CommandGenerator {
    fn generate(&self, ctx: &Context, input: &Path) -> Result<()> {
        let output = ctx.change_ext(input, &self.output_ext);

        let mut config = self.vars.clone();
        config
            .set("INPUTS", vec![input.to_string_lossy().into_owned()])
            .set("OUTPUTS", vec![output.to_string_lossy().into_owned()])
            .set("INCLUDES", ctx.includes());

        let argv = substitute(&self.template, &[&config])?;
        tracing::debug!(generator = %self.name, input = %input.display(), ?argv, "generated command");

        let mut task = Task::new(
            self.name.clone(),
            TaskFunction::Command {
                argv,
                timeout: self.timeout,
            },
        )
        .inputs([input])
        .outputs([&output])
        .config(config);

        if let Some(scanner) = &self.scanner {
            task = task.scanner(Arc::clone(scanner));
        }

        ctx.add_task(task);
        Ok(())
    }
}

impl fmt::Debug for CommandGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGenerator")
            .field("name", &self.name)
            .field("template", &self.template)
            .field("output_ext", &self.output_ext)
            .field("vars", &self.vars)
            .field("scanner", &self.scanner.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::BobError;
    use crate::project::Project;

    #[test]
    fn test_command_generator_builds_mirrored_task() {
        let p = Project::new("tmp_build", ["tmp/test_data/main.c"], ["tmp/test_data/include"]);
        p.register(
            ".c",
            CommandGenerator::new(
                "cc",
                "${CC} -I${INCLUDES} -c ${INPUTS} -o ${OUTPUTS[0]}",
                ".o",
            )
            .vars(Vars::new().with("cc", "gcc")),
        );
        p.expand().unwrap();

        let tasks = p.tasks();
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.inputs, vec![PathBuf::from("tmp/test_data/main.c")]);
        assert_eq!(t.outputs, vec![PathBuf::from("tmp_build/tmp/test_data/main.o")]);
        match &t.function {
            TaskFunction::Command { argv, .. } => assert_eq!(
                argv,
                &[
                    "gcc",
                    "-Itmp/test_data/include",
                    "-c",
                    "tmp/test_data/main.c",
                    "-o",
                    "tmp_build/tmp/test_data/main.o"
                ]
            ),
            other => panic!("unexpected function {other:?}"),
        }
        assert!(t.config.get("includes").is_some());
    }

    #[test]
    fn test_lookup_prefers_extension_over_wildcard() {
        let mut gens = Generators::default();
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));

        let h = Arc::clone(&hits);
        gens.insert(
            "c",
            Arc::new(move |_: &Context, _: &Path| -> Result<()> {
                h.lock().unwrap().push("c");
                Ok(())
            }),
        );
        let h = Arc::clone(&hits);
        gens.insert(
            WILDCARD,
            Arc::new(move |_: &Context, _: &Path| -> Result<()> {
                h.lock().unwrap().push("*");
                Ok(())
            }),
        );

        let p = Project::new("b", Vec::<PathBuf>::new(), Vec::<String>::new());
        let ctx = p.context();
        gens.lookup(Path::new("a.c")).unwrap().generate(&ctx, Path::new("a.c")).unwrap();
        gens.lookup(Path::new("a.txt")).unwrap().generate(&ctx, Path::new("a.txt")).unwrap();

        assert_eq!(*hits.lock().unwrap(), vec!["c", "*"]);
        assert_eq!(gens.extensions(), vec!["*".to_string(), ".c".to_string()]);
    }

    #[test]
    fn test_undefined_template_key_fails_expansion() {
        let p = Project::new("b", ["a.c"], Vec::<String>::new());
        p.register(".c", CommandGenerator::new("cc", "${CC} ${INPUTS}", ".o"));
        let err = p.expand().unwrap_err();
        assert!(matches!(err, BobError::UndefinedKey { key } if key == "CC"));
    }
}
