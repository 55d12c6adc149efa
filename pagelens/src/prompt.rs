//! Template-driven prompt construction.
//!
//! Templates declare their variables with type, required flag,
//! default, and validation rules. Building a prompt validates every
//! supplied value before substitution; a caller-supplied custom prompt
//! bypasses templating entirely and is wrapped only with a minimal
//! role description.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Variable value type accepted by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Text,
    Integer,
    Number,
    Boolean,
}

/// Declaration of one template variable.
#[derive(Debug, Clone)]
pub struct VarSpec {
    pub name: &'static str,
    pub var_type: VarType,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<&'static str>,
    pub one_of: Option<&'static [&'static str]>,
}

impl VarSpec {
    fn text(name: &'static str, required: bool) -> Self {
        Self {
            name,
            var_type: VarType::Text,
            required,
            default: None,
            min: None,
            max: None,
            pattern: None,
            one_of: None,
        }
    }

    fn integer(name: &'static str, default: i64, min: f64, max: f64) -> Self {
        Self {
            name,
            var_type: VarType::Integer,
            required: false,
            default: Some(Value::from(default)),
            min: Some(min),
            max: Some(max),
            pattern: None,
            one_of: None,
        }
    }

    fn enumeration(name: &'static str, default: &'static str, allowed: &'static [&'static str]) -> Self {
        Self {
            name,
            var_type: VarType::Text,
            required: false,
            default: Some(Value::from(default)),
            min: None,
            max: None,
            pattern: None,
            one_of: Some(allowed),
        }
    }
}

/// A parameterized prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: &'static str,
    pub description: &'static str,
    pub system: &'static str,
    pub user: &'static str,
    pub variables: Vec<VarSpec>,
}

/// Finished prompt pair handed to the provider layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

const JSON_FORMAT_INSTRUCTION: &str = "\
Respond with strict JSON only, no markdown fences:\n\
{\"summary\": \"the summary text\", \"key_points\": [\"point 1\", \"point 2\", \"point 3\"]}";

const CUSTOM_ROLE_PREAMBLE: &str =
    "You are a careful assistant that summarizes web articles accurately.";

const TONES: &[&str] = &["neutral", "formal", "casual"];

fn summary_variables() -> Vec<VarSpec> {
    vec![
        VarSpec::text("content", true),
        VarSpec::integer("max_words", 150, 30.0, 1000.0),
        VarSpec::enumeration("tone", "neutral", TONES),
    ]
}

/// Registry of the built-in templates, keyed by style id.
pub struct TemplateRegistry {
    templates: HashMap<&'static str, PromptTemplate>,
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();

        let entries = [
            PromptTemplate {
                id: "concise",
                description: "Short single-paragraph summary",
                system: "You are a summarizer that distills web articles into a single tight \
                         paragraph. Stay factual, keep the original meaning, never invent \
                         details. Use a {{tone}} tone.\n\n",
                user: "Summarize the following article in at most {{max_words}} words, then \
                       give 3-5 key points.\n\nARTICLE:\n{{content}}",
                variables: summary_variables(),
            },
            PromptTemplate {
                id: "detailed",
                description: "Multi-paragraph summary with context",
                system: "You are a summarizer that writes thorough, well-structured summaries \
                         of web articles. Preserve nuance and important numbers. Use a {{tone}} \
                         tone.\n\n",
                user: "Write a detailed summary of the following article in at most \
                       {{max_words}} words, covering background, main developments and \
                       implications, then give 5-7 key points.\n\nARTICLE:\n{{content}}",
                variables: summary_variables(),
            },
            PromptTemplate {
                id: "bullet_points",
                description: "Key points only",
                system: "You are a summarizer that reduces web articles to their essential \
                         points. No introductions, no filler. Use a {{tone}} tone.\n\n",
                user: "Extract the essential points of the following article. Keep the summary \
                       field to one sentence and put everything else in key_points (at most \
                       {{max_words}} words total).\n\nARTICLE:\n{{content}}",
                variables: summary_variables(),
            },
            PromptTemplate {
                id: "analytical",
                description: "Summary with analysis of claims and evidence",
                system: "You are an analyst. Summarize the article and note what evidence \
                         supports its central claims and what remains unverified. Use a \
                         {{tone}} tone.\n\n",
                user: "Analyze and summarize the following article in at most {{max_words}} \
                       words. Flag unsupported claims in the key points.\n\nARTICLE:\n{{content}}",
                variables: summary_variables(),
            },
            PromptTemplate {
                id: "news_digest",
                description: "Crawl digest entry for a news source",
                system: "You are a news editor compiling a digest. Summaries must be neutral, \
                         dateline-style, and self-contained. Use a {{tone}} tone.\n\n",
                user: "Write a digest entry for this article from {{source_name}} in at most \
                       {{max_words}} words, then give 3 key points.\n\nARTICLE:\n{{content}}",
                variables: {
                    let mut vars = summary_variables();
                    vars.push(VarSpec {
                        default: Some(Value::from("a news source")),
                        ..VarSpec::text("source_name", false)
                    });
                    vars
                },
            },
        ];

        for template in entries {
            templates.insert(template.id, template);
        }
        Self { templates }
    }

    pub fn get(&self, style_id: &str) -> Option<&PromptTemplate> {
        self.templates.get(style_id)
    }

    pub fn style_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.templates.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Build a prompt from a template, validating variables first.
    ///
    /// Fails with an `InvalidInput` error on a missing required
    /// variable, an unknown variable, or a value violating its rule.
    /// A non-"auto" language appends an explicit language instruction
    /// to the system prompt.
    pub fn build(
        &self,
        template_id: &str,
        variables: &HashMap<String, Value>,
        language: &str,
    ) -> Result<BuiltPrompt> {
        let template = self.get(template_id).ok_or_else(|| {
            PipelineError::InvalidInput(format!("unknown prompt template: {template_id}"))
        })?;

        for name in variables.keys() {
            if !template.variables.iter().any(|v| v.name == name) {
                return Err(PipelineError::InvalidInput(format!(
                    "template '{template_id}' does not declare variable '{name}'"
                )));
            }
        }

        let mut resolved: HashMap<&str, String> = HashMap::new();
        for spec in &template.variables {
            let value = match variables.get(spec.name) {
                Some(v) => Some(v.clone()),
                None => spec.default.clone(),
            };
            let Some(value) = value else {
                if spec.required {
                    return Err(PipelineError::InvalidInput(format!(
                        "missing required template variable '{}'",
                        spec.name
                    )));
                }
                resolved.insert(spec.name, String::new());
                continue;
            };
            resolved.insert(spec.name, validate_value(template_id, spec, &value)?);
        }

        let mut system_prompt = substitute(template.system, &resolved);
        let user_prompt = substitute(template.user, &resolved);

        system_prompt.push_str(JSON_FORMAT_INSTRUCTION);
        if !language.is_empty() && language != "auto" {
            system_prompt.push_str(&format!(
                "\nWrite the summary and key points in {language}."
            ));
        }

        debug!(template = template_id, "built prompt from template");
        Ok(BuiltPrompt {
            system_prompt,
            user_prompt,
        })
    }

    /// Wrap a caller-supplied custom prompt with a minimal role
    /// description, bypassing templating entirely.
    pub fn custom(custom_prompt: &str, content: &str, language: &str) -> BuiltPrompt {
        let mut system_prompt = format!("{CUSTOM_ROLE_PREAMBLE}\n{JSON_FORMAT_INSTRUCTION}");
        if !language.is_empty() && language != "auto" {
            system_prompt.push_str(&format!(
                "\nWrite the summary and key points in {language}."
            ));
        }
        BuiltPrompt {
            system_prompt,
            user_prompt: format!("{custom_prompt}\n\nARTICLE:\n{content}"),
        }
    }
}

/// Validate a value against its spec and render it for substitution.
fn validate_value(template_id: &str, spec: &VarSpec, value: &Value) -> Result<String> {
    let fail = |reason: String| {
        Err(PipelineError::InvalidInput(format!(
            "template '{template_id}' variable '{}': {reason}",
            spec.name
        )))
    };

    let rendered = match (spec.var_type, value) {
        (VarType::Text, Value::String(s)) => s.clone(),
        (VarType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
        (VarType::Number, Value::Number(n)) => n.to_string(),
        (VarType::Boolean, Value::Bool(b)) => b.to_string(),
        _ => return fail(format!("expected {:?} value, got {value}", spec.var_type)),
    };

    if let Some(number) = value.as_f64() {
        if let Some(min) = spec.min {
            if number < min {
                return fail(format!("value {number} below minimum {min}"));
            }
        }
        if let Some(max) = spec.max {
            if number > max {
                return fail(format!("value {number} above maximum {max}"));
            }
        }
    }

    if let Some(pattern) = spec.pattern {
        let re = Regex::new(pattern)
            .map_err(|e| PipelineError::Internal(format!("bad template pattern: {e}")))?;
        if !re.is_match(&rendered) {
            return fail(format!("value does not match pattern {pattern}"));
        }
    }

    if let Some(allowed) = spec.one_of {
        if !allowed.contains(&rendered.as_str()) {
            return fail(format!("value '{rendered}' not one of {allowed:?}"));
        }
    }

    Ok(rendered)
}

fn substitute(text: &str, resolved: &HashMap<&str, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in resolved {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(content: &str) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("content".to_string(), Value::from(content));
        map
    }

    #[test]
    fn builds_prompt_with_defaults() {
        let registry = TemplateRegistry::builtin();
        let prompt = registry
            .build("concise", &vars("Article body here."), "auto")
            .expect("build");

        assert!(prompt.user_prompt.contains("Article body here."));
        // Default max_words substituted
        assert!(prompt.user_prompt.contains("150 words"));
        // Default tone substituted
        assert!(prompt.system_prompt.contains("neutral tone"));
        assert!(prompt.system_prompt.contains("strict JSON"));
        assert!(!prompt.system_prompt.contains("{{"));
    }

    #[test]
    fn missing_required_variable_fails() {
        let registry = TemplateRegistry::builtin();
        let err = registry
            .build("concise", &HashMap::new(), "auto")
            .expect_err("should fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("content"));
    }

    #[test]
    fn unknown_template_and_variable_fail() {
        let registry = TemplateRegistry::builtin();
        assert!(registry.build("nope", &vars("x"), "auto").is_err());

        let mut extra = vars("x");
        extra.insert("bogus".to_string(), Value::from("y"));
        let err = registry.build("concise", &extra, "auto").expect_err("should fail");
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn range_rule_is_enforced() {
        let registry = TemplateRegistry::builtin();
        let mut v = vars("x");
        v.insert("max_words".to_string(), Value::from(5));
        let err = registry.build("concise", &v, "auto").expect_err("below min");
        assert!(err.to_string().contains("minimum"));

        let mut v = vars("x");
        v.insert("max_words".to_string(), Value::from(5000));
        assert!(registry.build("concise", &v, "auto").is_err());

        let mut v = vars("x");
        v.insert("max_words".to_string(), Value::from(300));
        assert!(registry.build("concise", &v, "auto").is_ok());
    }

    #[test]
    fn enum_rule_is_enforced() {
        let registry = TemplateRegistry::builtin();
        let mut v = vars("x");
        v.insert("tone".to_string(), Value::from("sarcastic"));
        let err = registry.build("concise", &v, "auto").expect_err("bad tone");
        assert!(err.to_string().contains("sarcastic"));

        let mut v = vars("x");
        v.insert("tone".to_string(), Value::from("formal"));
        let prompt = registry.build("concise", &v, "auto").expect("build");
        assert!(prompt.system_prompt.contains("formal tone"));
    }

    #[test]
    fn type_mismatch_fails() {
        let registry = TemplateRegistry::builtin();
        let mut v = vars("x");
        v.insert("max_words".to_string(), Value::from("many"));
        assert!(registry.build("concise", &v, "auto").is_err());
    }

    #[test]
    fn language_instruction_appended_when_not_auto() {
        let registry = TemplateRegistry::builtin();
        let auto = registry.build("concise", &vars("x"), "auto").expect("build");
        assert!(!auto.system_prompt.contains("Write the summary"));

        let french = registry.build("concise", &vars("x"), "French").expect("build");
        assert!(french.system_prompt.contains("in French"));
    }

    #[test]
    fn custom_prompt_bypasses_templates() {
        let prompt = TemplateRegistry::custom("Summarize as a haiku.", "Body text", "auto");
        assert!(prompt.system_prompt.starts_with(CUSTOM_ROLE_PREAMBLE));
        assert!(prompt.user_prompt.contains("Summarize as a haiku."));
        assert!(prompt.user_prompt.contains("Body text"));
        // No template machinery involved
        assert!(!prompt.user_prompt.contains("{{"));
    }

    #[test]
    fn all_builtin_styles_build() {
        let registry = TemplateRegistry::builtin();
        for id in registry.style_ids() {
            let prompt = registry.build(id, &vars("Some body"), "auto");
            assert!(prompt.is_ok(), "style {id} failed: {prompt:?}");
        }
    }
}
