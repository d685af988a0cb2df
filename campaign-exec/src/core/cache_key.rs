//! Deterministic execution cache keys.
//!
//! The key covers the repository revision and every step input that can change
//! the produced diff: image, script, mounted files, and the *resolved* values of
//! the environment the step declares. Host variables a step does not reference
//! never enter the key. The changeset template is deliberately excluded: specs
//! are rebuilt from the cached diff with the current template.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::types::{Repository, Task};
use crate::error::MissingEnvVarError;

/// Number of base64url characters kept from the digest.
const KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct KeyRepository {
    id: String,
    name: String,
    base_ref: String,
    rev: String,
    search_result_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct KeyStep {
    container: String,
    run: String,
    files: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

/// Fingerprint of a task's inputs. Serializes with sorted maps, so equal
/// inputs always produce equal JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionCacheKey {
    repository: KeyRepository,
    steps: Vec<KeyStep>,
}

impl ExecutionCacheKey {
    /// Build a key, resolving pass-through variables with `lookup`.
    pub fn new<F>(task: &Task, lookup: F) -> Result<Self, MissingEnvVarError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let steps = task
            .steps
            .iter()
            .map(|step| {
                Ok(KeyStep {
                    container: step.container.clone(),
                    run: step.run.clone(),
                    files: step.files.clone(),
                    env: step.env.resolve(&lookup)?,
                })
            })
            .collect::<Result<Vec<_>, MissingEnvVarError>>()?;
        Ok(Self {
            repository: key_repository(&task.repository),
            steps,
        })
    }

    /// Build a key against the current process environment.
    pub fn from_host(task: &Task) -> Result<Self, MissingEnvVarError> {
        Self::new(task, |name| std::env::var(name).ok())
    }

    /// `base64url(sha256(json(key)))`, truncated to 16 characters.
    pub fn key(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&json);
        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(KEY_LEN);
        encoded
    }
}

fn key_repository(repo: &Repository) -> KeyRepository {
    KeyRepository {
        id: repo.id.clone(),
        name: repo.name.clone(),
        base_ref: repo.base_ref().to_string(),
        rev: repo.rev().to_string(),
        search_result_paths: repo.search_result_paths(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::Environment;
    use crate::core::types::{Branch, ChangesetTemplate, CommitTemplate, Step};
    use std::collections::HashMap;

    fn task(env: Environment) -> Task {
        Task {
            repository: Repository {
                id: "UmVwbzox".to_string(),
                name: "github.com/acme/api".to_string(),
                default_branch: Branch {
                    name: "refs/heads/main".to_string(),
                    target_oid: "abc".to_string(),
                },
                file_matches: Default::default(),
            },
            steps: vec![Step {
                run: "echo x >> file.txt".to_string(),
                container: "alpine:3".to_string(),
                env,
                files: BTreeMap::new(),
            }],
            template: ChangesetTemplate {
                title: "title".to_string(),
                body: String::new(),
                branch: "my-branch".to_string(),
                commit: CommitTemplate {
                    message: "msg".to_string(),
                    author: None,
                },
                published: false,
            },
        }
    }

    fn key_with(task: &Task, host: &HashMap<&str, &str>) -> String {
        ExecutionCacheKey::new(task, |name| host.get(name).map(|v| v.to_string()))
            .expect("key")
            .key()
    }

    #[test]
    fn identical_inputs_produce_identical_keys() {
        let t = task(Environment::default().pass_through("TOKEN").literal("A", "1"));
        let host = HashMap::from([("TOKEN", "t1")]);
        let first = key_with(&t, &host);
        assert_eq!(first.len(), KEY_LEN);
        assert_eq!(first, key_with(&t.clone(), &host));
    }

    #[test]
    fn unrelated_host_variables_do_not_change_the_key() {
        let t = task(Environment::default().pass_through("TOKEN"));
        let before = HashMap::from([("TOKEN", "t1"), ("HOME", "/root")]);
        let after = HashMap::from([("TOKEN", "t1"), ("HOME", "/elsewhere"), ("NEW", "x")]);
        assert_eq!(key_with(&t, &before), key_with(&t, &after));
    }

    #[test]
    fn referenced_variable_value_changes_the_key() {
        let t = task(Environment::default().pass_through("TOKEN"));
        let before = HashMap::from([("TOKEN", "t1")]);
        let after = HashMap::from([("TOKEN", "t2")]);
        assert_ne!(key_with(&t, &before), key_with(&t, &after));
    }

    #[test]
    fn step_changes_change_the_key() {
        let host = HashMap::new();
        let a = task(Environment::default());
        let mut b = a.clone();
        b.steps[0].run = "echo y >> file.txt".to_string();
        let mut c = a.clone();
        c.steps[0].files.insert("/tmp/x".to_string(), "x".to_string());
        assert_ne!(key_with(&a, &host), key_with(&b, &host));
        assert_ne!(key_with(&a, &host), key_with(&c, &host));
    }

    #[test]
    fn template_changes_do_not_change_the_key() {
        let host = HashMap::new();
        let a = task(Environment::default());
        let mut b = a.clone();
        b.template.title = "another title".to_string();
        b.template.branch = "another-branch".to_string();
        assert_eq!(key_with(&a, &host), key_with(&b, &host));
    }

    #[test]
    fn missing_referenced_variable_is_an_error() {
        let t = task(Environment::default().pass_through("TOKEN"));
        let err = ExecutionCacheKey::new(&t, |_| None).unwrap_err();
        assert_eq!(err.name, "TOKEN");
    }
}
