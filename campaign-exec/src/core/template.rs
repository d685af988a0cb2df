//! Step templating.
//!
//! Scripts, file contents and env values are rendered with minijinja using
//! `${{ ... }}` for expressions, `${% ... %}` for blocks and `${# ... #}` for
//! comments, so ordinary shell syntax (`{}`, `$VAR`, `${VAR}`) passes through
//! untouched.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use minijinja::syntax::SyntaxConfig;
use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use minijinja::{Environment, UndefinedBehavior, context};

use crate::core::types::{Repository, StepResult};

/// Variables visible to a step's templates.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub repository: &'a Repository,
    /// Result of the step before this one, `None` for the first step.
    pub previous_step: Option<&'a StepResult>,
}

impl<'a> StepContext<'a> {
    pub fn new(repository: &'a Repository, previous_step: Option<&'a StepResult>) -> Self {
        Self {
            repository,
            previous_step,
        }
    }

    fn to_value(self) -> Value {
        let empty = StepResult::default();
        let prev = self.previous_step.unwrap_or(&empty);
        context! {
            repository => context! {
                name => self.repository.name.clone(),
                search_result_paths => PathList::value(self.repository.search_result_paths()),
            },
            previous_step => context! {
                modified_files => PathList::value(prev.changes.modified.clone()),
                added_files => PathList::value(prev.changes.added.clone()),
                deleted_files => PathList::value(prev.changes.deleted.clone()),
                renamed_files => PathList::value(prev.changes.renamed.clone()),
                stdout => prev.stdout.clone(),
                stderr => prev.stderr.clone(),
            },
        }
    }
}

/// List of paths that prints as a space-separated string but stays iterable.
#[derive(Debug)]
struct PathList(Vec<String>);

impl PathList {
    fn value(paths: Vec<String>) -> Value {
        Value::from_object(PathList(paths))
    }
}

impl Object for PathList {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Seq
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let idx = key.as_usize()?;
        self.0.get(idx).map(|path| Value::from(path.as_str()))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Seq(self.0.len())
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

fn environment<'source>() -> Result<Environment<'source>> {
    let syntax = SyntaxConfig::builder()
        .block_delimiters("${%", "%}")
        .variable_delimiters("${{", "}}")
        .comment_delimiters("${#", "#}")
        .build()
        .context("build template syntax")?;
    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    Ok(env)
}

/// Render `source` against the step context. Syntax errors and references to
/// unknown variables fail instead of producing empty output.
pub fn render_step_template(name: &str, source: &str, ctx: StepContext<'_>) -> Result<String> {
    let env = environment()?;
    let template = env
        .template_from_named_str(name, source)
        .with_context(|| format!("parse template {name}"))?;
    template
        .render(ctx.to_value())
        .with_context(|| format!("render template {name}"))
}
