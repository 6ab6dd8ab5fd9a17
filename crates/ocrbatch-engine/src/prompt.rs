//! Prompt template loading and rendering.
//!
//! Templates live in a registry directory, one subdirectory per prompt
//! name. The only substitution point is `{{ previous_context }}`,
//! filled with the formatted tail of the predecessor page's artifact
//! (empty for chain-starting pages).

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{NoExpand, Regex};

static PREVIOUS_CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*previous_context\s*\}\}").expect("valid placeholder regex")
});

/// A loaded prompt template with its registry identity.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub template_file: String,
    body: String,
}

impl PromptTemplate {
    /// Load `registry_dir/name/template_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template file cannot be read.
    pub fn load(registry_dir: &Path, name: &str, template_file: &str) -> Result<Self> {
        let path = registry_dir.join(name).join(template_file);
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read prompt template: {}", path.display()))?;
        Ok(Self {
            name: name.to_string(),
            template_file: template_file.to_string(),
            body,
        })
    }

    /// Build a template from an in-memory body (tests).
    #[must_use]
    pub fn from_body(name: &str, template_file: &str, body: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            template_file: template_file.to_string(),
            body: body.into(),
        }
    }

    /// Render the template, substituting `{{ previous_context }}`.
    /// `NoExpand` keeps `$` in OCR text from being read as a capture
    /// reference.
    #[must_use]
    pub fn render(&self, previous_context: Option<&str>) -> String {
        PREVIOUS_CONTEXT_RE
            .replace_all(&self.body, NoExpand(previous_context.unwrap_or("")))
            .into_owned()
    }
}
