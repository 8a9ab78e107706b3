use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("template `{0}` not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct PromptVars<'a> {
    pub task: &'a str,
    pub feedback: Option<&'a str>,
    pub siblings: Option<&'a str>,
    pub ancestors: Option<&'a str>,
}

/// Capability set for loading and composing phase prompt templates. Kept
/// separate from the pipeline's own `build_prompt` (which is the fallback
/// used when no template directory is configured) so projects can supply
/// their own prompt library without touching orchestrator code.
pub trait PromptLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<String, PromptError>;
    fn compose(&self, template: &str, vars: &PromptVars<'_>) -> String;
}

/// Reference implementation: templates are files under a directory, one per
/// phase name, with `{{task}}` / `{{feedback}}` / `{{siblings}}` /
/// `{{ancestors}}` placeholders substituted verbatim (no templating engine).
pub struct FilePromptLoader {
    templates_dir: PathBuf,
}

impl FilePromptLoader {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        FilePromptLoader {
            templates_dir: templates_dir.into(),
        }
    }

    fn template_path(&self, name: &str) -> PathBuf {
        self.templates_dir.join(format!("{name}.md"))
    }
}

impl PromptLoader for FilePromptLoader {
    fn load(&self, name: &str) -> Result<String, PromptError> {
        let path = self.template_path(name);
        if !path.exists() {
            return Err(PromptError::NotFound(name.to_string()));
        }
        Ok(fs::read_to_string(path)?)
    }

    fn compose(&self, template: &str, vars: &PromptVars<'_>) -> String {
        let mut substitutions: HashMap<&str, String> = HashMap::new();
        substitutions.insert("task", vars.task.to_string());
        substitutions.insert("feedback", vars.feedback.unwrap_or("").to_string());
        substitutions.insert("siblings", vars.siblings.unwrap_or("").to_string());
        substitutions.insert("ancestors", vars.ancestors.unwrap_or("").to_string());

        let mut out = template.to_string();
        for (key, value) in substitutions {
            out = out.replace(&format!("{{{{{key}}}}}"), &value);
        }
        out
    }
}
