//! Branch selection for template-valued edges.
//!
//! A `next_status` wrapped in `<%` and `%>` is a rule: its body is rendered
//! against the live record (bound as `vo`) and the trimmed output is the
//! status the record moves to.

use serde_json::Value;

use crate::error::FlowError;

pub const TEMPLATE_PREFIX: &str = "<%";
pub const TEMPLATE_SUFFIX: &str = "%>";
pub const RECORD_BINDING: &str = "vo";

#[must_use]
pub fn is_template(value: &str) -> bool {
    value.starts_with(TEMPLATE_PREFIX)
        && value.ends_with(TEMPLATE_SUFFIX)
        && value.len() >= TEMPLATE_PREFIX.len() + TEMPLATE_SUFFIX.len()
}

pub trait RuleResolver {
    /// Renders a template-valued status against `record`.
    ///
    /// # Errors
    /// Returns [`FlowError::RuleEvaluation`] when the template cannot be
    /// parsed or rendered, or renders to a blank status.
    fn render(&self, template: &str, record: &Value) -> Result<String, FlowError>;
}

/// Passes plain statuses through and renders templates.
///
/// # Errors
/// Propagates [`RuleResolver::render`] failures.
pub fn resolve_next_status(
    resolver: &dyn RuleResolver,
    next_status: &str,
    record: &Value,
) -> Result<String, FlowError> {
    if is_template(next_status) {
        resolver.render(next_status, record)
    } else {
        Ok(next_status.to_string())
    }
}

/// [`RuleResolver`] backed by Liquid templates with the standard filters.
pub struct LiquidRuleResolver {
    parser: liquid::Parser,
}

impl LiquidRuleResolver {
    /// # Errors
    /// Returns [`FlowError::RuleEvaluation`] if the parser cannot be built.
    pub fn new() -> Result<Self, FlowError> {
        let parser = liquid::ParserBuilder::with_stdlib()
            .build()
            .map_err(|err| FlowError::rule_evaluation(format!("failed to build parser: {err}")))?;
        Ok(Self { parser })
    }
}

impl RuleResolver for LiquidRuleResolver {
    fn render(&self, template: &str, record: &Value) -> Result<String, FlowError> {
        let body = template
            .strip_prefix(TEMPLATE_PREFIX)
            .and_then(|rest| rest.strip_suffix(TEMPLATE_SUFFIX))
            .unwrap_or(template);

        let parsed = self
            .parser
            .parse(body)
            .map_err(|err| FlowError::rule_evaluation(format!("malformed rule {template}: {err}")))?;

        let bound = liquid::model::to_value(record)
            .map_err(|err| FlowError::rule_evaluation(format!("record not bindable: {err}")))?;
        let mut globals = liquid::Object::new();
        globals.insert(RECORD_BINDING.into(), bound);

        let rendered = parsed
            .render(&globals)
            .map_err(|err| FlowError::rule_evaluation(format!("rule {template} failed: {err}")))?;

        let status = rendered.trim();
        if status.is_empty() {
            return Err(FlowError::rule_evaluation(format!(
                "rule {template} rendered an empty status"
            )));
        }
        Ok(status.to_string())
    }
}
