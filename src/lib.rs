//! bob - a programmable build engine
//!
//! This crate provides both a CLI tool and a library for incremental builds.
//!
//! # Features
//!
//! - **Task generators** - Map input extensions to factories that add tasks
//! - **Signature caching** - Skip tasks whose inputs, scanned dependencies
//!   and configuration did not change
//! - **Dynamic generation** - Tasks may add tasks while the build runs
//! - **Parallel execution** - Run independent tasks concurrently
//! - **Fault isolation** - A failing callback becomes a result, not a crash
//!
//! # Example
//!
//! ```toml
//! # bob.toml
//!
//! [project]
//! build_dir = "build"
//! inputs = ["src/*.c"]
//! includes = ["include"]
//!
//! [generators.c]
//! command = "cc -I${INCLUDES} -c ${INPUTS} -o ${OUTPUTS[0]}"
//! output_ext = ".o"
//! scanner = "include"
//! ```
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use bob::{build, BuildOptions, CommandGenerator, IncludeScanner, Project};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let project = Project::new("build", ["src/main.c"], ["include"]);
//!     project.register(
//!         ".c",
//!         CommandGenerator::new("cc", "cc -I${INCLUDES} -c ${INPUTS} -o ${OUTPUTS[0]}", ".o")
//!             .scanner(IncludeScanner),
//!     );
//!
//!     for result in build(&project, BuildOptions::default()).await? {
//!         println!("{} -> {}", result.task.label(), result.exit_code);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod generator;
pub mod graph;
pub mod project;
pub mod proto;
pub mod scan;
pub mod signature;
pub mod substitute;

// Re-export main types
pub use cache::{SignatureStore, Staleness};
pub use config::Config;
pub use error::{BobError, Result};
pub use executor::{
    build, BuildOptions, CancelFlag, Executor, Listener, NullListener, TaskEvent,
    COMMAND_NOT_FOUND_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use generator::{CommandGenerator, TaskFactory};
pub use graph::{TaskGraph, TaskNode};
pub use project::{
    BuildResult, Context, Project, Task, TaskFunction, TaskId, FAULT_EXIT_CODE, FAULT_MARKER,
};
pub use proto::{make_proto, ProtoGenerator};
pub use scan::{IncludeScanner, Scanner};
pub use signature::Signature;
pub use substitute::{substitute, Value, Vars};
