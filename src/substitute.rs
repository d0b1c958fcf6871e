//! Command-line templating
//!
//! Expands `${KEY}` and `${KEY[i]}` placeholders against a stack of
//! configuration mappings and produces an argument vector. Later mappings
//! override earlier ones key for key. Keys are case-insensitive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BobError, Result};

/// A configuration value: either a single string or an ordered sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(String),
    List(Vec<String>),
}

impl Value {
    /// Stable textual form used for fingerprinting
    pub fn fingerprint_parts(&self) -> Vec<&str> {
        match self {
            Value::Scalar(s) => vec![s.as_str()],
            Value::List(items) => items.iter().map(String::as_str).collect(),
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(items) => Some(items),
            Value::Scalar(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Scalar(n.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(b.to_string())
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Scalar(p.to_string_lossy().into_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::List(items.into_iter().map(str::to_string).collect())
    }
}

impl From<&[String]> for Value {
    fn from(items: &[String]) -> Self {
        Value::List(items.to_vec())
    }
}

impl From<&[PathBuf]> for Value {
    fn from(items: &[PathBuf]) -> Self {
        Value::List(
            items
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        )
    }
}

/// A configuration mapping with upper-cased keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vars(BTreeMap<String, Value>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_uppercase(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&key.to_uppercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `other` onto `self`, last write wins
    pub fn extend(&mut self, other: &Vars) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Merge a stack of mappings into one
    pub fn merged(configs: &[&Vars]) -> Vars {
        let mut out = Vars::new();
        for config in configs {
            out.extend(config);
        }
        out
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Vars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Vars::new();
        for (k, v) in iter {
            vars.set(k.as_ref(), v);
        }
        vars
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Key(String),
    Index(String, usize),
}

/// Expand `template` against `configs` into an argument vector.
///
/// Each whitespace-separated word of the template is expanded on its own.
/// Scalar values are spliced in as text and the word is then re-split on
/// whitespace. A sequence value turns the word into one token per element,
/// repeating any surrounding text (`-I${INCLUDES}` gives `-Ia -Ib`).
///
/// ```
/// use bob::substitute::{substitute, Vars};
///
/// let base = Vars::new().with("cc", "gcc").with("opt", "-O2");
/// let task = Vars::new()
///     .with("opt", "-O0")
///     .with("in", vec!["a.c", "b.c"])
///     .with("out", vec!["x.o"]);
///
/// let argv = substitute("${CC} ${OPT} -c ${IN} -o ${OUT[0]}", &[&base, &task]).unwrap();
/// assert_eq!(argv, ["gcc", "-O0", "-c", "a.c", "b.c", "-o", "x.o"]);
/// ```
pub fn substitute(template: &str, configs: &[&Vars]) -> Result<Vec<String>> {
    let vars = Vars::merged(configs);
    let mut argv = Vec::new();

    for word in template.split_whitespace() {
        let segments = parse_word(word)?;
        let mut variants = vec![String::new()];
        let mut atomic = false;

        for segment in segments {
            match segment {
                Segment::Text(text) => {
                    for v in &mut variants {
                        v.push_str(text);
                    }
                }
                Segment::Key(key) => match lookup(&vars, &key)? {
                    Value::Scalar(s) => {
                        for v in &mut variants {
                            v.push_str(s);
                        }
                    }
                    Value::List(items) => {
                        atomic = true;
                        variants = variants
                            .iter()
                            .flat_map(|prefix| items.iter().map(move |i| format!("{prefix}{i}")))
                            .collect();
                    }
                },
                Segment::Index(key, index) => {
                    let items = lookup(&vars, &key)?.as_list().ok_or_else(|| {
                        BobError::Lookup {
                            key: key.clone(),
                            index,
                            reason: "value is not a sequence".to_string(),
                        }
                    })?;
                    let item = items.get(index).ok_or_else(|| BobError::Lookup {
                        key: key.clone(),
                        index,
                        reason: format!("index out of range (length {})", items.len()),
                    })?;
                    atomic = true;
                    for v in &mut variants {
                        v.push_str(item);
                    }
                }
            }
        }

        if atomic {
            argv.extend(variants);
        } else {
            for v in variants {
                argv.extend(v.split_whitespace().map(str::to_string));
            }
        }
    }

    Ok(argv)
}

fn lookup<'v>(vars: &'v Vars, key: &str) -> Result<&'v Value> {
    vars.get(key).ok_or_else(|| BobError::UndefinedKey {
        key: key.to_string(),
    })
}

/// Split one template word into literal text and placeholders
fn parse_word(word: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = word;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let inner = &rest[start + 2..start + 2 + len];
        segments.push(parse_placeholder(inner)?);
        rest = &rest[start + 2 + len + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    Ok(segments)
}

fn parse_placeholder(inner: &str) -> Result<Segment<'static>> {
    let Some(open) = inner.find('[') else {
        return Ok(Segment::Key(inner.trim().to_uppercase()));
    };

    let key = inner[..open].trim().to_uppercase();
    let index_text = inner[open + 1..].strip_suffix(']').unwrap_or(&inner[open + 1..]);
    let index = index_text
        .trim()
        .parse::<usize>()
        .map_err(|_| BobError::Lookup {
            key: key.clone(),
            index: 0,
            reason: format!("'{}' is not a valid index", index_text),
        })?;

    Ok(Segment::Index(key, index))
}
