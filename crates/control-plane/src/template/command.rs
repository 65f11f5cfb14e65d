//! Command argument rendering using minijinja.
//!
//! Worker commands may reference per-run values, e.g.
//! `["export", "--run", "{{ run_id }}", "--out", "{{ output_prefix }}"]`.
//! Undefined variables are errors, never empty strings.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{Environment, Error, UndefinedBehavior, Value};
use serde::Serialize;

use crate::contract::ContractError;

/// Values a command template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct CommandContext {
    pub run_id: String,
    pub bucket: String,
    /// Configured prefix, empty when none is set.
    pub prefix: String,
    pub scratch_dir: String,
    /// The run's own key partition.
    pub output_prefix: String,
}

/// Renders worker command lists.
pub struct CommandRenderer {
    env: Environment<'static>,
}

impl Default for CommandRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("b64encode", filter_b64encode);
        Self { env }
    }

    /// Render one argument.
    pub fn render(&self, template: &str, ctx: &CommandContext) -> Result<String, ContractError> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let tmpl = self
            .env
            .template_from_str(template)
            .map_err(|e| ContractError::Template(format!("parse error in '{template}': {e}")))?;

        tmpl.render(Value::from_serialize(ctx))
            .map_err(|e| ContractError::Template(format!("render error in '{template}': {e}")))
    }

    /// Render a full command list. An empty list is rejected.
    pub fn render_all(
        &self,
        commands: &[String],
        ctx: &CommandContext,
    ) -> Result<Vec<String>, ContractError> {
        if commands.is_empty() {
            return Err(ContractError::NoCommands);
        }
        commands.iter().map(|c| self.render(c, ctx)).collect()
    }
}

fn contains_template_syntax(s: &str) -> bool {
    s.contains("{{") || s.contains("{%") || s.contains("{#")
}

fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CommandContext {
        CommandContext {
            run_id: "4f0c1b3e-9a57-4e0e-8a61-2f5d3c0e7b11".to_string(),
            bucket: "bucket".to_string(),
            prefix: String::new(),
            scratch_dir: "/tmp".to_string(),
            output_prefix: "4f0c1b3e-9a57-4e0e-8a61-2f5d3c0e7b11".to_string(),
        }
    }

    #[test]
    fn test_plain_arguments_pass_through() {
        let renderer = CommandRenderer::new();
        let commands = vec!["pg-dd".to_string(), "upload".to_string()];
        assert_eq!(renderer.render_all(&commands, &ctx()).unwrap(), commands);
    }

    #[test]
    fn test_render_run_values() {
        let renderer = CommandRenderer::new();
        let out = renderer
            .render("s3://{{ bucket }}/{{ output_prefix }}/", &ctx())
            .unwrap();
        assert_eq!(out, "s3://bucket/4f0c1b3e-9a57-4e0e-8a61-2f5d3c0e7b11/");
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let renderer = CommandRenderer::new();
        let err = renderer.render("{{ database_url }}", &ctx()).unwrap_err();
        assert!(matches!(err, ContractError::Template(_)));
    }

    #[test]
    fn test_empty_command_list_rejected() {
        let renderer = CommandRenderer::new();
        assert_eq!(
            renderer.render_all(&[], &ctx()).unwrap_err(),
            ContractError::NoCommands
        );
    }

    #[test]
    fn test_b64encode_filter() {
        let renderer = CommandRenderer::new();
        assert_eq!(
            renderer.render("{{ bucket | b64encode }}", &ctx()).unwrap(),
            "YnVja2V0"
        );
    }
}
