//! `{{NAME}}` placeholder expansion for template entries.
//!
//! Rendering is a single pass over the input: every token whose name is a
//! known variable is replaced, every other token is copied through verbatim
//! and reported as a warning. Values are never re-scanned, so rendering is
//! idempotent on output that contains no further tokens.

use regex::bytes::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::platform::Platform;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").expect("token pattern is valid")
    })
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content: Vec<u8>,
    /// One message per distinct unknown token, in order of first appearance.
    pub warnings: Vec<String>,
}

/// Expand `{{NAME}}` tokens using `variables`.
pub fn render(content: &[u8], variables: &BTreeMap<String, String>) -> Rendered {
    let mut unknown: Vec<String> = Vec::new();

    let output = token_pattern().replace_all(content, |caps: &Captures<'_>| {
        let name = String::from_utf8_lossy(&caps[1]).into_owned();
        match variables.get(&name) {
            Some(value) => value.as_bytes().to_vec(),
            None => {
                if !unknown.contains(&name) {
                    unknown.push(name);
                }
                caps[0].to_vec()
            }
        }
    });

    let warnings = unknown
        .into_iter()
        .map(|name| format!("unknown template variable {{{{{name}}}}} left as-is"))
        .collect::<Vec<_>>();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    Rendered {
        content: output.into_owned(),
        warnings,
    }
}

/// True if `content` holds at least one `{{NAME}}` token.
pub fn contains_tokens(content: &[u8]) -> bool {
    token_pattern().is_match(content)
}

/// Variables available at render time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    variables: BTreeMap<String, String>,
}

impl TemplateContext {
    /// Resolve the built-in variables (HOME, USER, PLATFORM, HOSTNAME,
    /// CONFIG_DIR) for `platform`, then overlay `extra`.
    pub fn resolve(platform: Platform, extra: &BTreeMap<String, String>) -> Self {
        let mut variables = BTreeMap::new();

        if let Some(home) = dirs::home_dir() {
            variables.insert("HOME".to_string(), home.display().to_string());
        }
        if let Some(user) = std::env::var("USER")
            .ok()
            .or_else(|| std::env::var("USERNAME").ok())
        {
            variables.insert("USER".to_string(), user);
        }
        variables.insert("PLATFORM".to_string(), platform.to_string());
        variables.insert("HOSTNAME".to_string(), current_hostname());
        if let Some(config_dir) = platform.config_dir() {
            variables.insert("CONFIG_DIR".to_string(), config_dir.display().to_string());
        }

        variables.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        TemplateContext { variables }
    }

    pub fn from_variables(variables: BTreeMap<String, String>) -> Self {
        TemplateContext { variables }
    }

    /// Context for one entry: the shared variables plus the entry's own,
    /// which take precedence.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut variables = self.variables.clone();
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        variables
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

pub fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_unknown_token_left_verbatim_with_warning() {
        let ctx = TemplateContext::resolve(Platform::Linux, &BTreeMap::new());
        let out = render(b"os={{PLATFORM}} x={{UNKNOWN_VAR}}", ctx.variables());

        assert_eq!(out.content, b"os=linux x={{UNKNOWN_VAR}}");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("UNKNOWN_VAR"));
    }

    #[test]
    fn test_repeated_unknown_warns_once() {
        let out = render(b"{{A}} {{A}} {{B}}", &BTreeMap::new());
        assert_eq!(out.warnings.len(), 2);
        assert_eq!(out.content, b"{{A}} {{A}} {{B}}");
    }

    #[test]
    fn test_render_is_idempotent() {
        let v = vars(&[("USER", "ada"), ("HOME", "/home/ada")]);
        let once = render(b"[user]\n  name = {{USER}}\n  dir = {{HOME}}\n", &v);
        let twice = render(&once.content, &v);
        assert_eq!(once.content, twice.content);
        assert!(twice.warnings.is_empty());
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let v = vars(&[("A", "{{B}}"), ("B", "boom")]);
        let out = render(b"{{A}}", &v);
        assert_eq!(out.content, b"{{B}}");
    }

    #[test]
    fn test_non_identifier_braces_are_ignored() {
        let out = render(b"{{ spaced }} {{1abc}} {x}", &BTreeMap::new());
        assert_eq!(out.content, b"{{ spaced }} {{1abc}} {x}");
        assert!(out.warnings.is_empty());
        assert!(!contains_tokens(b"{{ spaced }}"));
        assert!(contains_tokens(b"email = {{EMAIL}}"));
    }

    #[test]
    fn test_non_utf8_content_survives() {
        let v = vars(&[("X", "y")]);
        let out = render(b"\xff\xfe{{X}}\x00", &v);
        assert_eq!(out.content, b"\xff\xfey\x00");
    }

    #[test]
    fn test_overrides_win() {
        let ctx = TemplateContext::from_variables(vars(&[("EMAIL", "a@x"), ("USER", "ada")]));
        let merged = ctx.with_overrides(&vars(&[("EMAIL", "b@y")]));
        assert_eq!(merged["EMAIL"], "b@y");
        assert_eq!(merged["USER"], "ada");
    }
}
