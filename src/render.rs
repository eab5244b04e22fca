use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("missing template variable: {0}")]
    MissingVariable(String),
}

/// `render(template_id, vars) -> (subject, html, text)`. Pure and
/// deterministic given its inputs; render errors are always non-retryable.
/// A full templating engine is an external collaborator — this crate ships
/// only the minimal implementation needed to drive the pipeline end to end.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        subject_override: Option<&str>,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedMessage, RenderError>;

    /// Used by preflight to check a template id resolves without needing
    /// a recipient's variables on hand.
    fn has_template(&self, template_id: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct Template {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Substitutes `{{var}}` placeholders with values from the recipient's
/// `vars` map. Missing variables are a render error, not a blank
/// substitution, so a broken template surfaces during the dry run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRenderer {
    templates: HashMap<String, Template>,
}

impl InMemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, id: impl Into<String>, template: Template) -> Self {
        self.templates.insert(id.into(), template);
        self
    }

    fn substitute(text: &str, vars: &HashMap<String, String>) -> Result<String, RenderError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = after_open[..end].trim();
            let value = vars
                .get(name)
                .ok_or_else(|| RenderError::MissingVariable(name.to_owned()))?;
            out.push_str(value);
            rest = &after_open[end + 2..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

impl Renderer for InMemoryRenderer {
    fn render(
        &self,
        template_id: &str,
        subject_override: Option<&str>,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedMessage, RenderError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| RenderError::UnknownTemplate(template_id.to_owned()))?;

        let subject = match subject_override {
            Some(s) => Self::substitute(s, vars)?,
            None => Self::substitute(&template.subject, vars)?,
        };

        Ok(RenderedMessage {
            subject,
            html: Self::substitute(&template.html, vars)?,
            text: Self::substitute(&template.text, vars)?,
        })
    }

    fn has_template(&self, template_id: &str) -> bool {
        self.templates.contains_key(template_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn renderer() -> InMemoryRenderer {
        InMemoryRenderer::new().with_template(
            "t1",
            Template {
                subject: "Hi {{name}}".to_owned(),
                html: "<p>Hello {{name}}</p>".to_owned(),
                text: "Hello {{name}}".to_owned(),
            },
        )
    }

    #[test]
    fn substitutes_known_variables() {
        let vars = HashMap::from([("name".to_owned(), "Ada".to_owned())]);
        let rendered = renderer().render("t1", None, &vars).unwrap();
        assert_eq!(rendered.subject, "Hi Ada");
        assert_eq!(rendered.html, "<p>Hello Ada</p>");
    }

    #[test]
    fn subject_override_is_still_substituted() {
        let vars = HashMap::from([("name".to_owned(), "Ada".to_owned())]);
        let rendered = renderer()
            .render("t1", Some("Override for {{name}}"), &vars)
            .unwrap();
        assert_eq!(rendered.subject, "Override for Ada");
    }

    #[test]
    fn missing_variable_is_a_render_error() {
        let rendered = renderer().render("t1", None, &HashMap::new());
        assert!(matches!(rendered, Err(RenderError::MissingVariable(_))));
    }

    #[test]
    fn unknown_template_is_a_render_error() {
        let rendered = renderer().render("missing", None, &HashMap::new());
        assert!(matches!(rendered, Err(RenderError::UnknownTemplate(_))));
    }
}
