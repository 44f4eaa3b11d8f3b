use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Error, Result, anyhow};
use handlebars::Handlebars;
use serde_json::{Map, Value};
use tracing::{debug, info};

const TEMPLATE_EXTENSION: &str = "hbs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub source: String,
}

/// Looks templates up by logical name.
pub trait TemplateSource: Send + Sync {
    fn get_template(&self, logical_path: &str) -> Result<Template, Error>;
}

/// Reads `<dir>/<logical_path>.hbs` on every lookup.
pub struct FileTemplateSource {
    root: PathBuf,
}

impl FileTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        if !root.is_dir() {
            return Err(anyhow!(
                "Template directory '{}' does not exist",
                root.display()
            ));
        }

        info!(root = %root.display(), "Template source initialized");

        Ok(Self { root })
    }

    fn resolve(&self, logical_path: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(logical_path);

        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("Invalid template path '{}'", logical_path));
        }

        Ok(self.root.join(relative).with_extension(TEMPLATE_EXTENSION))
    }
}

impl TemplateSource for FileTemplateSource {
    fn get_template(&self, logical_path: &str) -> Result<Template, Error> {
        let path = self.resolve(logical_path)?;

        let source = std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read template '{}': {}", path.display(), e))?;

        debug!(template = logical_path, path = %path.display(), "Template loaded");

        Ok(Template {
            name: logical_path.to_string(),
            source,
        })
    }
}

#[derive(Default)]
pub struct InMemoryTemplateSource {
    templates: HashMap<String, String>,
}

impl InMemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.templates.insert(name.into(), source.into());
        self
    }
}

impl TemplateSource for InMemoryTemplateSource {
    fn get_template(&self, logical_path: &str) -> Result<Template, Error> {
        self.templates
            .get(logical_path)
            .map(|source| Template {
                name: logical_path.to_string(),
                source: source.clone(),
            })
            .ok_or_else(|| anyhow!("Template '{}' not found", logical_path))
    }
}

/// Merges templates from a [`TemplateSource`] with a JSON context.
pub struct TemplateRenderer {
    source: Arc<dyn TemplateSource>,
    handlebars: Handlebars<'static>,
}

impl TemplateRenderer {
    pub fn new(source: Arc<dyn TemplateSource>) -> Self {
        Self {
            source,
            handlebars: Handlebars::new(),
        }
    }

    pub fn get_template(&self, logical_path: &str) -> Result<Template, Error> {
        self.source.get_template(logical_path)
    }

    pub fn render(&self, template: &Template, context: &Map<String, Value>) -> Result<String, Error> {
        debug!(
            template = %template.name,
            variable_count = context.len(),
            "Rendering template"
        );

        self.handlebars
            .render_template(&template.source, context)
            .map_err(|e| anyhow!("Failed to render template '{}': {}", template.name, e))
    }
}
