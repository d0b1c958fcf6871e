//! bob - a programmable build engine
//!
//! Reads a `bob.toml` build description and incrementally builds every
//! stale task:
//! - Signature-based staleness (content and configuration)
//! - Include scanning for implicit dependencies
//! - Tasks that spawn tasks while the build runs
//! - Parallel execution

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use bob::cli::{CacheCommands, Cli, Commands, GraphFormat};
use bob::config::Config;
use bob::{
    build, BuildOptions, BuildResult, Listener, Project, Result, SignatureStore, Task, TaskEvent,
    TaskGraph,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Set up panic handler for nice error messages
    miette::set_panic_hook();

    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}: {:?}", style("error").red().bold(), miette::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every task succeeded
async fn run(cli: Cli) -> Result<bool> {
    if let Some(cwd) = &cli.cwd {
        std::env::set_current_dir(cwd)?;
    }

    match cli.effective_command() {
        Commands::Build {
            dry_run,
            force,
            jobs,
        } => run_build(&cli, dry_run, force, jobs).await,

        Commands::Graph { format } => {
            let project = load_project(&cli)?;
            build(&project, BuildOptions::default().run(false)).await?;
            print_graph(&project, format)?;
            Ok(true)
        }

        Commands::Clean => {
            let project = load_project(&cli)?;
            let mut store = SignatureStore::load(project.build_dir()).await;
            let entries = store.stats().entries;
            store.clear().await?;
            if !cli.quiet {
                println!(
                    "{} Forgot {} signature(s) in {}",
                    style("✓").green(),
                    entries,
                    project.build_dir().display()
                );
            }
            Ok(true)
        }

        Commands::Cache {
            command: CacheCommands::Stats,
        } => {
            let project = load_project(&cli)?;
            let store = SignatureStore::load(project.build_dir()).await;
            println!("Signatures: {}", store.stats());
            Ok(true)
        }

        Commands::Check => {
            let (config, path) = Config::load(cli.config.as_deref())?;
            enter_config_dir(&path)?;
            let project = config.to_project()?;

            println!(
                "{} {} is valid ({} inputs, {} generators)",
                style("✓").green(),
                path.display(),
                project.inputs().len(),
                project.generator_extensions().len()
            );
            Ok(true)
        }
    }
}

async fn run_build(cli: &Cli, dry_run: bool, force: bool, jobs: usize) -> Result<bool> {
    let (config, path) = Config::load(cli.config.as_deref())?;
    enter_config_dir(&path)?;
    let project = config.to_project()?;

    let parallelism = if jobs == 0 {
        config.settings.parallelism
    } else {
        jobs
    };

    let listener = ConsoleListener::new(cli.quiet);
    let options = BuildOptions::default()
        .run(!dry_run)
        .force(force)
        .parallelism(parallelism)
        .cache(config.settings.cache)
        .listener(listener.clone());

    let results = build(&project, options).await?;
    listener.finish();

    if dry_run {
        for task in project.tasks() {
            println!("{}", format_task(&task));
        }
        return Ok(true);
    }

    if !cli.quiet {
        print_results(&results, cli.verbose);
    }

    Ok(results.iter().all(BuildResult::success))
}

fn load_project(cli: &Cli) -> Result<Project> {
    let (config, path) = Config::load(cli.config.as_deref())?;
    enter_config_dir(&path)?;
    config.to_project()
}

/// Paths in a description are relative to the file itself
fn enter_config_dir(path: &std::path::Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::env::set_current_dir(dir)?;
    }
    Ok(())
}

/// Prints task starts above a spinner
#[derive(Clone)]
struct ConsoleListener {
    spinner: Option<ProgressBar>,
    started: Arc<std::sync::atomic::AtomicUsize>,
}

impl ConsoleListener {
    fn new(quiet: bool) -> Self {
        let spinner = (!quiet).then(|| {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        });
        Self {
            spinner,
            started: Arc::default(),
        }
    }

    fn finish(&self) {
        if let Some(pb) = &self.spinner {
            pb.finish_and_clear();
        }
    }
}

impl Listener for ConsoleListener {
    fn on_event(&self, _project: &Project, task: &Task, event: TaskEvent) {
        let Some(pb) = &self.spinner else {
            return;
        };
        match event {
            TaskEvent::Start => {
                let n = self
                    .started
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                pb.println(format!("{} {}", style("▶").cyan(), task.label()));
                pb.set_message(format!("[{n}] {}", task.name));
            }
            TaskEvent::Done => pb.set_message(format!("done {}", task.name)),
        }
    }
}

fn format_task(task: &Task) -> String {
    let id = task.id().map(|id| id.to_string()).unwrap_or_default();
    let mut line = format!("{} {}", style(id).dim(), style(&task.name).cyan().bold());
    for input in &task.inputs {
        line.push_str(&format!(" {}", input.display()));
    }
    if !task.outputs.is_empty() {
        line.push_str(&format!(" {}", style("→").dim()));
        for output in &task.outputs {
            line.push_str(&format!(" {}", output.display()));
        }
    }
    line
}

fn print_results(results: &[BuildResult], verbose: bool) {
    let mut ran = 0;
    let mut failed = 0;

    for result in results {
        if !result.ran {
            if verbose {
                println!("{} {} (up to date)", style("·").dim(), result.task.label());
            }
            continue;
        }
        ran += 1;

        if result.success() {
            println!(
                "{} {} ({:.2}s)",
                style("✓").green(),
                result.task.label(),
                result.duration.as_secs_f64()
            );
            if verbose && !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
        } else {
            failed += 1;
            println!(
                "{} {} (exit code {})",
                style("✗").red(),
                result.task.label(),
                result.exit_code
            );
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr.trim_end());
            }
        }
    }

    let summary = format!(
        "{} task(s): {} ran, {} up to date, {} failed",
        results.len(),
        ran,
        results.len() - ran,
        failed
    );
    if failed > 0 {
        println!("{}", style(summary).red().bold());
    } else {
        println!("{}", style(summary).green().bold());
    }
}

fn print_graph(project: &Project, format: GraphFormat) -> Result<()> {
    let tasks = project.tasks();
    let graph = TaskGraph::from_tasks(tasks.iter().map(|t| t.as_ref()))?;
    let ordered = graph.ordered()?;

    match format {
        GraphFormat::Text => {
            println!("{}", style("Task dependency graph:").bold());
            println!();

            for node in &ordered {
                let Some(task) = project.task(node.id) else {
                    continue;
                };
                let producers: Vec<String> = graph
                    .producers(node.id)
                    .into_iter()
                    .map(|id| id.to_string())
                    .collect();

                if producers.is_empty() {
                    println!("  {}", format_task(&task));
                } else {
                    println!(
                        "  {} {} {}",
                        format_task(&task),
                        style("←").dim(),
                        producers.join(", ")
                    );
                }
            }
        }

        GraphFormat::Dot => {
            println!("digraph bob {{");
            println!("  rankdir=LR;");
            println!("  node [shape=box];");

            for node in &ordered {
                if let Some(task) = project.task(node.id) {
                    println!("  \"{}\" [label=\"{}\"];", node.id, task.label());
                }
            }
            for (from, to) in graph.edges() {
                println!("  \"{from}\" -> \"{to}\";");
            }

            println!("}}");
        }

        GraphFormat::Json => {
            let nodes: Vec<_> = ordered
                .iter()
                .filter_map(|node| project.task(node.id))
                .map(|task| {
                    serde_json::json!({
                        "id": task.id().map(|id| id.index()),
                        "name": task.name,
                        "inputs": task.inputs,
                        "outputs": task.outputs,
                        "dependencies": task.dependencies(),
                        "product_of": task.product_of().map(|id| id.index()),
                    })
                })
                .collect();
            let edges: Vec<_> = graph
                .edges()
                .into_iter()
                .map(|(from, to)| serde_json::json!({ "from": from.index(), "to": to.index() }))
                .collect();

            let output = serde_json::json!({
                "nodes": nodes,
                "edges": edges,
            });

            let text = serde_json::to_string_pretty(&output).map_err(std::io::Error::other)?;
            println!("{text}");
        }
    }

    Ok(())
}
