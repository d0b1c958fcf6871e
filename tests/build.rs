//! End-to-end build behavior through the public API
#![cfg(unix)]

use std::path::{Path, PathBuf};

use bob::{
    build, BobError, BuildOptions, CommandGenerator, Context, IncludeScanner, Project, Task,
    TaskFunction,
};

struct Fixture {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/util.h"), "#define ANSWER 42\n").unwrap();
        std::fs::write(
            root.join("src/main.c"),
            "#include \"util.h\"\n#include <stdio.h>\nint main() { return ANSWER; }\n",
        )
        .unwrap();
        Self { _temp: temp, root }
    }

    fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    fn main_c(&self) -> PathBuf {
        self.root.join("src/main.c")
    }

    /// A project "compiling" main.c by copying it
    fn project(&self, includes: &[&str]) -> Project {
        let project = Project::new(self.build_dir(), [self.main_c()], includes.iter().copied());
        project.register(
            ".c",
            CommandGenerator::new("cp", "cp ${INPUTS} ${OUTPUTS[0]}", ".o").scanner(IncludeScanner),
        );
        project
    }

    fn object(&self, project: &Project) -> PathBuf {
        project.change_ext(self.main_c(), ".o")
    }
}

#[tokio::test]
async fn test_second_build_is_a_no_op() {
    let fx = Fixture::new();

    let project = fx.project(&[]);
    let first = build(&project, BuildOptions::default()).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].ran);
    assert_eq!(first[0].exit_code, 0, "{}", first[0].stderr);
    assert!(fx.object(&project).exists());

    let second = build(&fx.project(&[]), BuildOptions::default()).await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(!second[0].ran);
    assert_eq!(second[0].exit_code, 0);
}

#[tokio::test]
async fn test_header_change_triggers_rebuild() {
    let fx = Fixture::new();
    build(&fx.project(&[]), BuildOptions::default()).await.unwrap();

    let project = fx.project(&[]);
    build(&project, BuildOptions::default().run(false)).await.unwrap();
    let tasks = project.tasks();
    assert!(tasks[0].dependencies().contains(&fx.root.join("src/util.h")));

    std::fs::write(fx.root.join("src/util.h"), "#define ANSWER 43\n").unwrap();
    let results = build(&fx.project(&[]), BuildOptions::default()).await.unwrap();
    assert!(results[0].ran);
    assert!(results[0].success());
}

#[tokio::test]
async fn test_missing_output_triggers_rebuild() {
    let fx = Fixture::new();
    let project = fx.project(&[]);
    build(&project, BuildOptions::default()).await.unwrap();

    std::fs::remove_file(fx.object(&project)).unwrap();
    let results = build(&fx.project(&[]), BuildOptions::default()).await.unwrap();
    assert!(results[0].ran);
    assert!(fx.object(&project).exists());
}

#[tokio::test]
async fn test_configuration_change_triggers_rebuild() {
    let fx = Fixture::new();
    build(&fx.project(&["include"]), BuildOptions::default())
        .await
        .unwrap();

    let same = build(&fx.project(&["include"]), BuildOptions::default())
        .await
        .unwrap();
    assert!(!same[0].ran);

    let changed = build(&fx.project(&["include", "vendor"]), BuildOptions::default())
        .await
        .unwrap();
    assert!(changed[0].ran);
}

#[tokio::test]
async fn test_failures_are_never_cached() {
    let fx = Fixture::new();
    let failing = || {
        let project = Project::new(fx.build_dir(), [fx.main_c()], Vec::<String>::new());
        project.register(".c", CommandGenerator::new("fail", "false ${INPUTS}", ".o"));
        project
    };

    for _ in 0..2 {
        let results = build(&failing(), BuildOptions::default()).await.unwrap();
        assert!(results[0].ran);
        assert_eq!(results[0].exit_code, 1);
    }
}

#[tokio::test]
async fn test_force_reruns_up_to_date_tasks() {
    let fx = Fixture::new();
    build(&fx.project(&[]), BuildOptions::default()).await.unwrap();

    let forced = build(&fx.project(&[]), BuildOptions::default().force(true))
        .await
        .unwrap();
    assert!(forced[0].ran);
    assert!(forced[0].success());

    let after = build(&fx.project(&[]), BuildOptions::default()).await.unwrap();
    assert!(!after[0].ran);
}

#[tokio::test]
async fn test_unresolved_include_still_runs_the_task() {
    let fx = Fixture::new();
    std::fs::write(fx.main_c(), "#include \"missing.h\"\nint main() {}\n").unwrap();

    for _ in 0..2 {
        let results = build(&fx.project(&[]), BuildOptions::default()).await.unwrap();
        assert!(results[0].ran);
        assert!(results[0].success(), "{}", results[0].stderr);
    }
}

#[tokio::test]
async fn test_failing_task_reports_scan_error() {
    let fx = Fixture::new();
    std::fs::write(fx.main_c(), "#include \"missing.h\"\n").unwrap();

    let project = Project::new(fx.build_dir(), [fx.main_c()], Vec::<String>::new());
    project.register(
        ".c",
        CommandGenerator::new("fail", "false ${INPUTS}", ".o").scanner(IncludeScanner),
    );

    let results = build(&project, BuildOptions::default()).await.unwrap();
    assert_eq!(results[0].exit_code, 1);
    assert!(results[0].stderr.contains("scan:"), "{}", results[0].stderr);
    assert!(results[0].stderr.contains("missing.h"));
}

/// `gen.c` includes `gen.h`, which another task writes into the build dir
fn generated_header_project(root: &Path) -> Project {
    let build_dir = root.join("build");
    let source = root.join("gen.c");
    let header = build_dir.join("gen.h");

    let project = Project::new(
        &build_dir,
        [&source],
        [build_dir.to_string_lossy().into_owned()],
    );
    project.register(
        ".c",
        CommandGenerator::new("compile", "cp ${INPUTS} ${OUTPUTS[0]}", ".o").scanner(IncludeScanner),
    );
    project.add_task(
        Task::new(
            "genhdr",
            TaskFunction::callback(|_: &Context, task: &Task| {
                std::fs::write(&task.outputs[0], "#define GENERATED 1\n")
                    .map_err(|e| miette::miette!("{e}"))
            }),
        )
        .outputs([header]),
    );
    project
}

#[tokio::test]
async fn test_generated_header_is_a_dependency_on_first_build() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("gen.c"), "#include \"gen.h\"\n").unwrap();

    let project = generated_header_project(temp.path());
    let first = build(&project, BuildOptions::default()).await.unwrap();
    assert!(first.iter().all(|r| r.ran && r.success()), "{first:#?}");

    let tasks = project.tasks();
    let compile = tasks.iter().find(|t| t.name == "compile").unwrap();
    assert_eq!(
        compile.dependencies().iter().cloned().collect::<Vec<_>>(),
        vec![temp.path().join("build/gen.h")]
    );

    let second = build(&generated_header_project(temp.path()), BuildOptions::default())
        .await
        .unwrap();
    assert!(second.iter().all(|r| !r.ran), "{second:#?}");
}

#[tokio::test]
async fn test_dry_run_expands_without_executing() {
    let fx = Fixture::new();
    let project = fx.project(&[]);

    let results = build(&project, BuildOptions::default().run(false))
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(project.task_count(), 1);
    assert!(project.tasks()[0].is_scanned());
    assert!(!fx.object(&project).exists());
}

#[tokio::test]
async fn test_missing_generator_is_a_configuration_error() {
    let fx = Fixture::new();
    let project = Project::new(fx.build_dir(), [fx.root.join("src/util.h")], Vec::<String>::new());

    let err = build(&project, BuildOptions::default()).await.unwrap_err();
    assert!(matches!(err, BobError::NoGenerator { ref ext, .. } if ext == ".h"));
}

/// `.dynamic` files list numbers; each becomes a `.number` file which is
/// in turn multiplied into a `.numberc` file.
fn dynamic_project(root: &Path, manifest: &Path) -> Project {
    let build_dir = root.join("build");
    let project = Project::new(&build_dir, [manifest], Vec::<String>::new());

    project.register(".dynamic", |ctx: &Context, input: &Path| -> bob::Result<()> {
        let manifest = input.to_path_buf();
        let build_dir = ctx.build_dir().to_path_buf();
        ctx.add_task(
            Task::new(
                "expand",
                TaskFunction::callback(move |ctx: &Context, _task: &Task| {
                    let text = std::fs::read_to_string(&manifest).map_err(|e| miette::miette!("{e}"))?;
                    std::fs::create_dir_all(&build_dir).map_err(|e| miette::miette!("{e}"))?;
                    for (i, number) in text.split_whitespace().enumerate() {
                        let path = build_dir.join(format!("test_{i}.number"));
                        std::fs::write(&path, number).map_err(|e| miette::miette!("{e}"))?;
                        ctx.generate(&path)?;
                    }
                    Ok(())
                }),
            )
            .inputs([input]),
        );
        Ok(())
    });

    project.register(".number", |ctx: &Context, input: &Path| -> bob::Result<()> {
        let output = ctx.change_ext(input, ".numberc");
        ctx.add_task(
            Task::new(
                "multiply",
                TaskFunction::callback(|_: &Context, task: &Task| {
                    let text = std::fs::read_to_string(&task.inputs[0])
                        .map_err(|e| miette::miette!("{e}"))?;
                    let value: i64 = text.trim().parse().map_err(|e| miette::miette!("{e}"))?;
                    std::fs::write(&task.outputs[0], (value * 100).to_string())
                        .map_err(|e| miette::miette!("{e}"))
                }),
            )
            .inputs([input])
            .outputs([output]),
        );
        Ok(())
    });

    project
}

#[tokio::test]
async fn test_tasks_generated_during_build_run_with_provenance() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("test.dynamic");
    std::fs::write(&manifest, "10 20 30").unwrap();

    let project = dynamic_project(temp.path(), &manifest);
    let results = build(&project, BuildOptions::default()).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.ran && r.success()), "{results:#?}");

    let parent = results[0].task.id();
    for (i, expected) in ["1000", "2000", "3000"].iter().enumerate() {
        let child = &results[i + 1].task;
        assert_eq!(child.product_of(), parent);
        assert_eq!(std::fs::read_to_string(&child.outputs[0]).unwrap(), *expected);
        assert_eq!(
            child.outputs[0],
            temp.path().join(format!("build/test_{i}.numberc"))
        );
    }

    // Generated tasks are up to date, so their creator is too
    let again = build(&dynamic_project(temp.path(), &manifest), BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert!(!again[0].ran);
}

#[tokio::test]
async fn test_failed_generated_task_is_retried() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("test.dynamic");
    std::fs::write(&manifest, "10 oops").unwrap();

    for _ in 0..2 {
        let results = build(&dynamic_project(temp.path(), &manifest), BuildOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 3, "{results:#?}");

        let good = &results[1];
        let bad = &results[2];
        assert!(good.success());
        assert!(bad.ran);
        assert!(bad.is_fault());
    }
}

#[tokio::test]
async fn test_deleted_generated_output_is_rebuilt() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("test.dynamic");
    std::fs::write(&manifest, "10 20").unwrap();
    build(&dynamic_project(temp.path(), &manifest), BuildOptions::default())
        .await
        .unwrap();

    let output = temp.path().join("build/test_0.numberc");
    std::fs::remove_file(&output).unwrap();

    let results = build(&dynamic_project(temp.path(), &manifest), BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0].ran);
    assert!(results[1].ran);
    assert!(!results[2].ran);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "1000");
}

#[tokio::test]
async fn test_cycle_is_a_configuration_error() {
    let temp = tempfile::tempdir().unwrap();
    let project = Project::new(temp.path().join("build"), Vec::<PathBuf>::new(), Vec::<String>::new());
    let a = temp.path().join("a");
    let b = temp.path().join("b");
    project.add_task(Task::new("ab", TaskFunction::command(vec!["true".into()])).inputs([&a]).outputs([&b]));
    project.add_task(Task::new("ba", TaskFunction::command(vec!["true".into()])).inputs([&b]).outputs([&a]));

    let err = build(&project, BuildOptions::default()).await.unwrap_err();
    assert!(matches!(err, BobError::CyclicDependency { .. }));
}
