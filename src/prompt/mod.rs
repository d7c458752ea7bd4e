//! Prompt templates and rendering.
//!
//! Templates are loaded from a directory on disk (materializing built-in
//! defaults on first run), parsed once, and kept in a thread-safe registry.
//! Rendering never touches the filesystem; only [`TemplateRegistry::reload`]
//! does, and it's fully serialized so readers always see either the old or
//! the new parsed template, never a half-updated one.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use handlebars::Handlebars;

use crate::{prelude::*, schema::Schema};

pub mod truncate;

/// Default template bytes, materialized to disk the first time a named
/// template is requested and not found.
const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("title", include_str!("../../prompts/title_prompt.tmpl")),
    ("tag", include_str!("../../prompts/tag_prompt.tmpl")),
    (
        "correspondent",
        include_str!("../../prompts/correspondent_prompt.tmpl"),
    ),
    (
        "created_date",
        include_str!("../../prompts/created_date_prompt.tmpl"),
    ),
    (
        "custom_field",
        include_str!("../../prompts/custom_field_prompt.tmpl"),
    ),
    ("ocr", include_str!("../../prompts/ocr_prompt.tmpl")),
];

/// A named prompt template: its source text and the registered helper set
/// needed to render it. Installation is all-or-nothing; there is no partial
/// state between "absent" and "parsed".
#[derive(Clone)]
struct CompiledTemplate {
    /// The raw template source, kept around for `reload` diffing/debugging.
    source: String,
}

/// A thread-safe registry of named prompt templates.
///
/// Modeled as an explicit handle passed to the components that need it
/// (the suggestion engine, the OCR vision provider), rather than a
/// process-wide singleton, so tests can construct independent registries.
#[derive(Clone)]
pub struct TemplateRegistry {
    templates: Arc<RwLock<HashMap<String, CompiledTemplate>>>,
}

impl TemplateRegistry {
    /// Build a registry from the built-in defaults only (no filesystem
    /// access). Useful for tests and for the `schema` debug subcommand.
    pub fn with_defaults() -> Self {
        let templates = DEFAULT_TEMPLATES
            .iter()
            .map(|(name, source)| {
                (
                    (*name).to_owned(),
                    CompiledTemplate {
                        source: (*source).to_owned(),
                    },
                )
            })
            .collect();
        Self {
            templates: Arc::new(RwLock::new(templates)),
        }
    }

    /// Load a registry from a `prompts/` directory, materializing any
    /// missing default templates to disk first.
    #[instrument(level = "debug", skip_all, fields(dir = %dir.display()))]
    pub async fn load_from_dir(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create prompts directory {:?}", dir))?;

        let mut templates = HashMap::new();
        for (name, default_source) in DEFAULT_TEMPLATES {
            let path = dir.join(format!("{name}_prompt.tmpl"));
            let source = if path.exists() {
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read template at {:?}", path))?
            } else {
                tokio::fs::write(&path, default_source)
                    .await
                    .with_context(|| format!("failed to write default template to {:?}", path))?;
                (*default_source).to_owned()
            };
            // Parsing here (rather than lazily) means installation is
            // all-or-nothing: either every template compiles, or we fail at
            // startup instead of mid-request.
            validate_template(&source)
                .with_context(|| format!("template {name:?} failed to parse"))?;
            templates.insert((*name).to_owned(), CompiledTemplate { source });
        }

        Ok(Self {
            templates: Arc::new(RwLock::new(templates)),
        })
    }

    /// Reload a single template from disk. This is an explicit method call,
    /// not a filesystem watcher.
    #[instrument(level = "debug", skip(self))]
    pub async fn reload(&self, dir: &Path, name: &str) -> Result<()> {
        let path = dir.join(format!("{name}_prompt.tmpl"));
        let source = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read template at {:?}", path))?;
        validate_template(&source)
            .with_context(|| format!("template {name:?} failed to parse"))?;

        // Readers either see the old entry or this one; never a partial
        // write, because we parse before taking the write lock.
        let mut templates = self
            .templates
            .write()
            .expect("template registry lock poisoned");
        templates.insert(name.to_owned(), CompiledTemplate { source });
        Ok(())
    }

    /// Render a named template with the given data.
    pub fn render(&self, name: &str, data: &Value) -> Result<String> {
        let source = {
            let templates = self
                .templates
                .read()
                .expect("template registry lock poisoned");
            templates
                .get(name)
                .ok_or_else(|| anyhow!("no such prompt template: {name:?}"))?
                .source
                .clone()
        };
        let hb = handlebars_engine();
        hb.render_template(&source, data)
            .with_context(|| format!("failed to render template {name:?}"))
    }
}

/// Check that a template parses and renders against an empty context.
/// Because the engine runs in non-strict mode, a missing variable renders as
/// empty rather than failing, so this only catches genuine syntax errors.
fn validate_template(source: &str) -> Result<()> {
    let hb = handlebars_engine();
    hb.render_template(source, &json!({}))
        .map(|_| ())
        .map_err(|err| anyhow!(err))
}

handlebars::handlebars_helper!(join_helper: |list: array, sep: str = ", "| {
    list.iter()
        .map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string()))
        .collect::<Vec<_>>()
        .join(sep)
});

handlebars::handlebars_helper!(upper_helper: |s: str| s.to_uppercase());

handlebars::handlebars_helper!(default_helper: |value: Json, fallback: Json| {
    if value.is_null() { fallback.clone() } else { value.clone() }
});

/// Build a [`Handlebars`] engine with our fixed helper set. The helper set
/// is fixed at compile time; templates cannot register their own helpers.
fn handlebars_engine() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_helper("join", Box::new(join_helper));
    hb.register_helper("upper", Box::new(upper_helper));
    hb.register_helper("default", Box::new(default_helper));
    hb
}

/// Marker type: this [`ChatPrompt`] has not yet had its templates rendered.
#[derive(Debug, Clone, Copy)]
pub struct Unrendered;

/// Marker type: this [`ChatPrompt`] has been rendered to final text/images
/// and is ready to send to a model.
#[derive(Debug, Clone, Copy)]
pub struct Rendered;

/// One message in a chat prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// A user message, with optional text and zero or more images (as
    /// `data:` URLs, or provider-specific references).
    User {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default)]
        images: Vec<String>,
    },
    /// A synthetic assistant message, used for few-shot examples.
    Assistant { json: Value },
}

/// A chat prompt: an optional system/developer message, an ordered list of
/// messages, and the JSON Schema the final assistant message must conform
/// to.
///
/// `State` tracks whether template substitution has already happened, so
/// a [`ChatPrompt<Rendered>`] can be passed to a model driver without the
/// driver needing to worry about unexpanded template syntax.
#[derive(Debug, Clone)]
pub struct ChatPrompt<State = Rendered> {
    /// The system/developer message, if any.
    pub developer: Option<String>,
    /// The message history, ending in a user message.
    pub messages: Vec<Message>,
    /// The schema the assistant's final message must conform to.
    pub response_schema: Schema,
    _marker: PhantomData<State>,
}

impl ChatPrompt<Unrendered> {
    /// Build a prompt whose `developer` and user message text are
    /// handlebars templates, then render them with `data`.
    pub fn render(
        registry: &TemplateRegistry,
        template_name: &str,
        data: &Value,
        images: Vec<String>,
        response_schema: Schema,
    ) -> Result<ChatPrompt<Rendered>> {
        let text = registry.render(template_name, data)?;
        Ok(ChatPrompt {
            developer: None,
            messages: vec![Message::User {
                text: Some(text),
                images,
            }],
            response_schema,
            _marker: PhantomData,
        })
    }
}

impl ChatPrompt<Rendered> {
    /// Construct an already-rendered prompt directly, e.g. for tests or
    /// fixed OCR vision prompts that need no template substitution.
    pub fn new(
        developer: Option<String>,
        messages: Vec<Message>,
        response_schema: Schema,
    ) -> Self {
        Self {
            developer,
            messages,
            response_schema,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_template() {
        let registry = TemplateRegistry::with_defaults();
        let rendered = registry
            .render("title", &json!({"language": "English", "content": "hello"}))
            .unwrap();
        assert!(!rendered.is_empty());
    }

    #[test]
    fn test_render_unknown_template_errors() {
        let registry = TemplateRegistry::with_defaults();
        assert!(registry.render("nonexistent", &json!({})).is_err());
    }
}
