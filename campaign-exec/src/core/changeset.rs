//! Assembly of changeset specs from a task and its diff.

use crate::core::types::{ChangesetSpec, GitAuthor, GitCommitDescription, Task};

pub const DEFAULT_AUTHOR_NAME: &str = "campaign-exec";
pub const DEFAULT_AUTHOR_EMAIL: &str = "campaign-exec@localhost";

/// Build the spec for `task` from `diff`.
///
/// Pure function of its inputs: a cached diff combined with the task's current
/// template yields the same spec a fresh execution would.
pub fn build_changeset_spec(task: &Task, diff: &str) -> ChangesetSpec {
    let repo = &task.repository;
    let template = &task.template;
    let author = template.commit.author.clone().unwrap_or_else(|| GitAuthor {
        name: DEFAULT_AUTHOR_NAME.to_string(),
        email: DEFAULT_AUTHOR_EMAIL.to_string(),
    });

    ChangesetSpec {
        base_repository: repo.id.clone(),
        base_rev: repo.rev().to_string(),
        base_ref: repo.base_ref().to_string(),
        head_repository: repo.id.clone(),
        head_ref: head_ref(&template.branch),
        title: template.title.clone(),
        body: template.body.clone(),
        commits: vec![GitCommitDescription {
            message: template.commit.message.clone(),
            author_name: author.name,
            author_email: author.email,
            diff: diff.to_string(),
        }],
        published: template.published,
    }
}

fn head_ref(branch: &str) -> String {
    if branch.starts_with("refs/heads/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}
