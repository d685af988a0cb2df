//! Tasks, steps and the changeset artifacts they produce.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::env::Environment;

/// A repository branch as resolved by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Full ref name, e.g. `refs/heads/main`.
    pub name: String,
    /// Commit the branch pointed at when the repository was resolved.
    #[serde(default)]
    pub target_oid: String,
}

/// Repository metadata a task runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub default_branch: Branch,
    /// Paths that matched the search query which selected this repository.
    #[serde(default)]
    pub file_matches: BTreeSet<String>,
}

impl Repository {
    /// File-system friendly name (`github.com/a/b` -> `github.com-a-b`).
    pub fn slug(&self) -> String {
        self.name.replace('/', "-")
    }

    pub fn rev(&self) -> &str {
        &self.default_branch.target_oid
    }

    pub fn base_ref(&self) -> &str {
        &self.default_branch.name
    }

    /// Search result paths in stable (sorted) order.
    pub fn search_result_paths(&self) -> Vec<String> {
        self.file_matches.iter().cloned().collect()
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One containerized command plus its templated inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Script executed by the probed shell inside the container.
    pub run: String,
    /// Container image reference.
    pub container: String,
    #[serde(default)]
    pub env: Environment,
    /// In-container target path -> content template.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTemplate {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<GitAuthor>,
}

/// Metadata applied to every changeset a campaign produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetTemplate {
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub branch: String,
    pub commit: CommitTemplate,
    #[serde(default)]
    pub published: bool,
}

/// Immutable unit of work: one repository, its steps and the changeset template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub repository: Repository,
    pub steps: Vec<Step>,
    pub template: ChangesetTemplate,
}

/// Files touched by a single step, as reported by `git status --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepChanges {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    /// New paths of renamed files.
    pub renamed: Vec<String>,
}

impl StepChanges {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.added.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
    }
}

/// Output of one step, fed into the next step's template context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepResult {
    pub changes: StepChanges,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommitDescription {
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub diff: String,
}

/// Final per-repository artifact submitted to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetSpec {
    pub base_repository: String,
    pub base_rev: String,
    pub base_ref: String,
    pub head_repository: String,
    pub head_ref: String,
    pub title: String,
    pub body: String,
    pub commits: Vec<GitCommitDescription>,
    pub published: bool,
}

impl ChangesetSpec {
    /// Diff of the single commit this spec carries.
    pub fn diff(&self) -> Option<&str> {
        self.commits.first().map(|commit| commit.diff.as_str())
    }
}

/// What the execution cache stores for a task: the diff and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub diff: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_deserializes_from_camel_case() {
        let raw = r#"{
            "id": "UmVwbzox",
            "name": "github.com/acme/api",
            "defaultBranch": { "name": "refs/heads/main", "targetOid": "abc123" },
            "fileMatches": ["b.go", "a.go"]
        }"#;
        let repo: Repository = serde_json::from_str(raw).expect("parse");
        assert_eq!(repo.slug(), "github.com-acme-api");
        assert_eq!(repo.rev(), "abc123");
        assert_eq!(repo.search_result_paths(), vec!["a.go", "b.go"]);
    }

    #[test]
    fn step_defaults_env_and_files() {
        let step: Step =
            serde_json::from_str(r#"{"run": "echo hi", "container": "alpine:3"}"#).expect("parse");
        assert!(step.env.is_empty());
        assert!(step.files.is_empty());
    }

    #[test]
    fn step_changes_is_empty() {
        let mut changes = StepChanges::default();
        assert!(changes.is_empty());
        changes.renamed.push("new.txt".to_string());
        assert!(!changes.is_empty());
    }
}
