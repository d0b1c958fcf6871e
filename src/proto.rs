//! Resource transcoding
//!
//! [`make_proto`] builds a task factory that reads a resource written as
//! TOML text, lets a transform mutate the decoded message, and writes the
//! message in binary (CBOR) form next to the mirrored input path. The
//! message schema is any serde type.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use miette::IntoDiagnostic;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BobError, Result};
use crate::generator::TaskFactory;
use crate::project::{extension_key, Context, Task, TaskFunction};
use crate::substitute::Vars;

type Transform<M> = Arc<dyn Fn(&mut M) + Send + Sync>;

/// Factory for text-to-binary transcoding tasks, see [`make_proto`]
pub struct ProtoGenerator<M> {
    transform: Transform<M>,
    output_ext: Option<String>,
    _message: PhantomData<fn() -> M>,
}

/// Create a transcoding factory for message type `M`.
///
/// By default the binary is written with the input's extension plus a
/// trailing `c` (`.bob` becomes `.bobc`).
pub fn make_proto<M, F>(transform: F) -> ProtoGenerator<M>
where
    M: Serialize + DeserializeOwned + 'static,
    F: Fn(&mut M) + Send + Sync + 'static,
{
    ProtoGenerator {
        transform: Arc::new(transform),
        output_ext: None,
        _message: PhantomData,
    }
}

impl<M> ProtoGenerator<M> {
    /// Write binaries with this extension instead
    pub fn output_ext(mut self, ext: &str) -> Self {
        self.output_ext = Some(ext.to_string());
        self
    }
}

impl<M> TaskFactory for ProtoGenerator<M>
where
    M: Serialize + DeserializeOwned + 'static,
{
    fn generate(&self, ctx: &Context, input: &Path) -> Result<()> {
        let ext = self
            .output_ext
            .clone()
            .unwrap_or_else(|| format!("{}c", extension_key(input)));
        let output = ctx.change_ext(input, &ext);
        let message_type = short_type_name::<M>();

        let transform = Arc::clone(&self.transform);
        let function = TaskFunction::callback(move |_, task: &Task| {
            let message = transcode::<M>(&task.inputs[0], |m| transform(m))?;
            write_binary(&task.outputs[0], &message).into_diagnostic()
        });

        ctx.add_task(
            Task::new(format!("proto {message_type}"), function)
                .inputs([input])
                .outputs([output])
                .config(
                    Vars::new()
                        .with("message", std::any::type_name::<M>())
                        .with("output_ext", ext),
                ),
        );
        Ok(())
    }
}

impl<M> fmt::Debug for ProtoGenerator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtoGenerator")
            .field("message", &std::any::type_name::<M>())
            .field("output_ext", &self.output_ext)
            .finish()
    }
}

/// Decode a text resource and apply `transform`
fn transcode<M: DeserializeOwned>(path: &Path, transform: impl Fn(&mut M)) -> Result<M> {
    let text = std::fs::read_to_string(path)?;
    let mut message: M = toml::from_str(&text).map_err(|e| BobError::Transcode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    transform(&mut message);
    Ok(message)
}

/// Serialize `message` in binary form to `path`
pub fn write_binary<M: Serialize>(path: &Path, message: &M) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    ciborium::into_writer(message, &mut writer).map_err(|e| BobError::Transcode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    writer.flush()?;
    Ok(())
}

/// Decode a binary written by a transcoding task
pub fn read_binary<M: DeserializeOwned>(path: &Path) -> Result<M> {
    let file = BufReader::new(File::open(path)?);
    ciborium::from_reader(file).map_err(|e| BobError::Transcode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}
