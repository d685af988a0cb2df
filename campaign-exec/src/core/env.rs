//! Step environment specs: literal values and host pass-through variables.
//!
//! A step declares its environment either as a map of literal values:
//!
//! ```yaml
//! env:
//!   FOO: bar
//! ```
//!
//! or as a list mixing literals and bare names. A bare name passes the host
//! variable of that name through to the container:
//!
//! ```yaml
//! env:
//!   - GITHUB_TOKEN
//!   - FOO: bar
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MissingEnvVarError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvEntry {
    Literal { name: String, value: String },
    PassThrough(String),
}

impl EnvEntry {
    pub fn name(&self) -> &str {
        match self {
            EnvEntry::Literal { name, .. } => name,
            EnvEntry::PassThrough(name) => name,
        }
    }
}

/// Ordered environment declaration of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<EnvEntry>,
}

impl Environment {
    pub fn new(entries: Vec<EnvEntry>) -> Self {
        Self { entries }
    }

    pub fn literal(mut self, name: &str, value: &str) -> Self {
        self.entries.push(EnvEntry::Literal {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn pass_through(mut self, name: &str) -> Self {
        self.entries.push(EnvEntry::PassThrough(name.to_string()));
        self
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve entries to concrete values. Later entries override earlier ones.
    ///
    /// Only pass-through names are looked up, so unrelated variables never
    /// influence the result.
    pub fn resolve<F>(&self, lookup: F) -> Result<BTreeMap<String, String>, MissingEnvVarError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = BTreeMap::new();
        for entry in &self.entries {
            match entry {
                EnvEntry::Literal { name, value } => {
                    resolved.insert(name.clone(), value.clone());
                }
                EnvEntry::PassThrough(name) => {
                    let value = lookup(name).ok_or_else(|| MissingEnvVarError {
                        name: name.clone(),
                    })?;
                    resolved.insert(name.clone(), value);
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve against the current process environment.
    pub fn resolve_from_host(&self) -> Result<BTreeMap<String, String>, MissingEnvVarError> {
        self.resolve(|name| std::env::var(name).ok())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    Map(BTreeMap<String, String>),
    List(Vec<RawEnvEntry>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawEnvEntry {
    Name(String),
    Pair(BTreeMap<String, String>),
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvironment::deserialize(deserializer)?;
        let entries = match raw {
            RawEnvironment::Map(map) => map
                .into_iter()
                .map(|(name, value)| EnvEntry::Literal { name, value })
                .collect(),
            RawEnvironment::List(items) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        RawEnvEntry::Name(name) => entries.push(EnvEntry::PassThrough(name)),
                        RawEnvEntry::Pair(pair) => {
                            if pair.len() != 1 {
                                return Err(serde::de::Error::custom(format!(
                                    "env list entries must have exactly one key, got {}",
                                    pair.len()
                                )));
                            }
                            for (name, value) in pair {
                                entries.push(EnvEntry::Literal { name, value });
                            }
                        }
                    }
                }
                entries
            }
        };
        Ok(Environment { entries })
    }
}

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let items: Vec<RawEnvEntry> = self
            .entries
            .iter()
            .map(|entry| match entry {
                EnvEntry::PassThrough(name) => RawEnvEntry::Name(name.clone()),
                EnvEntry::Literal { name, value } => {
                    RawEnvEntry::Pair(BTreeMap::from([(name.clone(), value.clone())]))
                }
            })
            .collect();
        RawEnvironment::List(items).serialize(serializer)
    }
}
