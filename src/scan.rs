//! Dependency scanning
//!
//! A [`Scanner`] discovers a task's indirect inputs (headers pulled in by
//! `#include`, for instance). The scanned set becomes
//! [`Task::dependencies`] and feeds the task signature, so editing a
//! transitively included file invalidates the task.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::error::{BobError, Result};
use crate::project::{normalize, Project, Task};

/// Discovers indirect inputs of a task
pub trait Scanner: Send + Sync {
    fn scan(&self, task: &Task, project: &Project) -> Result<BTreeSet<PathBuf>>;
}

impl<F> Scanner for F
where
    F: Fn(&Task, &Project) -> Result<BTreeSet<PathBuf>> + Send + Sync,
{
    fn scan(&self, task: &Task, project: &Project) -> Result<BTreeSet<PathBuf>> {
        self(task, project)
    }
}

/// Follows C preprocessor `#include` directives.
///
/// `"quoted"` names resolve next to the including file first, then along
/// the project's include paths, and are an error if neither has them.
/// `<angled>` names resolve along the include paths only; misses are taken
/// to be system headers and ignored.
///
/// A header another task declares as output resolves even before it is
/// generated. It is not read until it exists, so the scheduler rescans once
/// its producer has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeScanner;

#[derive(Debug, PartialEq, Eq)]
struct Include<'a> {
    name: &'a str,
    quoted: bool,
}

impl Scanner for IncludeScanner {
    fn scan(&self, task: &Task, project: &Project) -> Result<BTreeSet<PathBuf>> {
        let search: Vec<PathBuf> = project.includes().iter().map(PathBuf::from).collect();
        let mut found = BTreeSet::new();
        let mut visited: BTreeSet<PathBuf> = task.inputs.iter().cloned().collect();
        let mut queue: VecDeque<PathBuf> = task.inputs.iter().cloned().collect();

        while let Some(file) = queue.pop_front() {
            if !file.exists() && project.produces(&file) {
                tracing::trace!(header = %file.display(), "not generated yet");
                continue;
            }
            let content = std::fs::read(&file).map_err(|e| BobError::Scan {
                path: file.clone(),
                reason: e.to_string(),
            })?;
            let content = String::from_utf8_lossy(&content);

            for include in parse_includes(&content) {
                let Some(resolved) = resolve(&file, &include, &search, project) else {
                    if include.quoted {
                        return Err(BobError::Scan {
                            path: file.clone(),
                            reason: format!("cannot resolve include \"{}\"", include.name),
                        });
                    }
                    tracing::trace!(header = include.name, "skipping system header");
                    continue;
                };

                if visited.insert(resolved.clone()) {
                    found.insert(resolved.clone());
                    queue.push_back(resolved);
                }
            }
        }

        Ok(found)
    }
}

fn resolve(
    from: &Path,
    include: &Include<'_>,
    search: &[PathBuf],
    project: &Project,
) -> Option<PathBuf> {
    let local = include
        .quoted
        .then(|| from.parent().unwrap_or(Path::new("")).join(include.name));

    local
        .into_iter()
        .chain(search.iter().map(|dir| dir.join(include.name)))
        .map(|candidate| normalize(&candidate))
        .find(|candidate| candidate.is_file() || project.produces(candidate))
}

fn parse_includes(content: &str) -> Vec<Include<'_>> {
    content.lines().filter_map(parse_directive).collect()
}

fn parse_directive(line: &str) -> Option<Include<'_>> {
    let rest = line.trim_start().strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim_start();

    let (close, quoted) = match rest.chars().next()? {
        '"' => ('"', true),
        '<' => ('>', false),
        _ => return None,
    };
    let body = &rest[1..];
    let end = body.find(close)?;
    let name = body[..end].trim();

    (!name.is_empty()).then_some(Include { name, quoted })
}
