//! Compose files rendered against a values file.
//!
//! The compose file is a Tera template; the parsed values document is
//! available to it as `values`. Rendering happens before parsing, so the
//! output must itself be valid YAML.

use std::error::Error as _;

use tera::{Context, Tera};
use thiserror::Error;

use crate::rotation::DecryptError;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("values file is not valid YAML: {0}")]
    Values(#[from] serde_yaml::Error),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    /// Tera's message plus every cause beneath it.
    #[error("{0}")]
    Render(String),
}

impl From<tera::Error> for TemplateError {
    fn from(err: tera::Error) -> Self {
        let mut message = err.to_string();
        let mut cause = err.source();
        while let Some(inner) = cause {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            cause = inner.source();
        }
        TemplateError::Render(message)
    }
}

/// Render `template` with `values` (YAML) bound to `values`.
pub fn render(template: &[u8], values: &[u8]) -> Result<Vec<u8>, TemplateError> {
    let template = std::str::from_utf8(template)?;
    let values: serde_yaml::Value = serde_yaml::from_slice(values)?;

    let mut context = Context::new();
    context.insert("values", &values);
    let rendered = Tera::one_off(template, &context, false)?;
    Ok(rendered.into_bytes())
}
