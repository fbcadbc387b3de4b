//! Username templates.
//!
//! Supported placeholders: `{{randomUsername}}`, `{{unixTimestamp}}` and
//! `{{identity.name}}`. Anything outside `[A-Za-z0-9_]` in the result is
//! replaced by `_` so it is safe to splice into SQL identifiers.

use coffer_crypto::random;

use crate::DynamicError;

/// Template used when a configuration has none.
pub const DEFAULT_TEMPLATE: &str = "{{randomUsername}}";

const RANDOM_USERNAME_LEN: usize = 32;
const MAX_USERNAME_LEN: usize = 63;

/// Renders `template` for a lease.
pub fn render_username(
    template: Option<&str>,
    identity_name: Option<&str>,
    now: u64,
) -> Result<String, DynamicError> {
    let template = template.unwrap_or(DEFAULT_TEMPLATE);
    let rendered = template
        .replace(
            "{{randomUsername}}",
            &random::generate_username(RANDOM_USERNAME_LEN),
        )
        .replace("{{unixTimestamp}}", &now.to_string())
        .replace("{{identity.name}}", identity_name.unwrap_or("unknown"));

    if rendered.contains("{{") {
        return Err(DynamicError::Invalid(format!(
            "unknown placeholder in username template '{}'",
            template
        )));
    }

    let sanitized: String = rendered
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_USERNAME_LEN)
        .collect();
    if sanitized.is_empty() {
        return Err(DynamicError::Invalid("username template renders empty".into()));
    }
    Ok(sanitized)
}

/// Checks a template without rendering a random part.
pub fn validate_template(template: &str) -> Result<(), DynamicError> {
    render_username(Some(template), Some("x"), 0).map(|_| ())
}
