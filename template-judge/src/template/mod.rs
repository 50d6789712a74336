//! Template module - declarative build/run rules
//!
//! A template file lives at `<root>/template/<SRC>:<DES>:<CONDITION>.tmpl`
//! and holds a JSON body (with `//` comments and split string literals).
//!
//! - `catalog`: discovers and lazily parses template files
//! - `matcher`: matches a (source, destination) pair against a template name

pub mod catalog;
pub mod matcher;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use catalog::TemplateCatalog;
pub use matcher::{substitute_str, Bindings, TemplatePattern};

/// Parsed template, kept as a JSON tree until wildcards are known
#[derive(Debug, Clone)]
pub struct Template {
    /// Template name, `SRC:DES:CONDITION`
    pub name: String,
    /// File path relative to its data root (safe for messages)
    pub rel_path: String,
    pub src: String,
    pub des: String,
    pub condition: String,
    body: Value,
}

/// Template body with every wildcard already substituted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateBody {
    #[serde(rename = "REQUIRES", default)]
    pub requires: Vec<String>,
    #[serde(rename = "LOCAL-REQUIRES", default)]
    pub local_requires: Vec<String>,
    #[serde(rename = "REMOTE-REQUIRES", default)]
    pub remote_requires: Vec<String>,
    #[serde(rename = "CREATABLE", default)]
    pub creatable: Vec<String>,
    #[serde(rename = "COMMANDS", default)]
    pub commands: Vec<String>,
    #[serde(rename = "CHECKS", default)]
    pub checks: Vec<String>,
    #[serde(rename = "KEEP", default)]
    pub keep: Vec<String>,
    #[serde(rename = "SHOW", default)]
    pub show: Vec<String>,
    #[serde(rename = "CONDITION", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Template {
    /// Parse a template from its name and raw file text
    pub fn parse(name: &str, rel_path: &str, text: &str) -> Result<Self, String> {
        let (src, des, condition) =
            split_name(name).ok_or_else(|| format!("{}: template name is not SRC:DES:CONDITION", rel_path))?;

        let cleaned = strip_dialect(text);
        let body: Value = serde_json::from_str(&cleaned)
            .map_err(|e| format!("{}: cannot parse template: {}", rel_path, e))?;
        if !body.is_object() {
            return Err(format!("{}: template body is not a JSON object", rel_path));
        }

        // Validate the shape once, before any substitution happens
        let shape: TemplateBody = serde_json::from_value(body.clone())
            .map_err(|e| format!("{}: malformed template: {}", rel_path, e))?;
        if let Some(declared) = &shape.condition {
            if declared != condition {
                return Err(format!(
                    "{}: CONDITION {:?} does not match file name condition {:?}",
                    rel_path, declared, condition
                ));
            }
        }

        Ok(Self {
            name: name.to_string(),
            rel_path: rel_path.to_string(),
            src: src.to_string(),
            des: des.to_string(),
            condition: condition.to_string(),
            body,
        })
    }

    /// The `SRC:DES` part the matcher works on
    pub fn pattern_source(&self) -> String {
        format!("{}:{}", self.src, self.des)
    }

    /// Substitute wildcard bindings into every string of the body
    pub fn substitute(&self, bindings: &Bindings) -> Result<TemplateBody, String> {
        let value = substitute_value(&self.body, bindings);
        serde_json::from_value(value)
            .map_err(|e| format!("{}: malformed template: {}", self.rel_path, e))
    }
}

fn substitute_value(value: &Value, bindings: &Bindings) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, bindings)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, bindings)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Split `SRC:DES:CONDITION` (condition may be empty)
pub fn split_name(name: &str) -> Option<(&str, &str, &str)> {
    let mut parts = name.splitn(3, ':');
    let src = parts.next()?;
    let des = parts.next()?;
    let condition = parts.next()?;
    if src.is_empty() || des.is_empty() || condition.contains(':') {
        return None;
    }
    Some((src, des, condition))
}

/// Turn the template dialect into plain JSON.
///
/// Drops `//` line comments outside strings and joins a string literal that
/// is continued by another literal on a following line.
pub fn strip_dialect(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' => {
                    out.push(c);
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                    }
                    i += 2;
                    continue;
                }
                '"' => {
                    if let Some(resume) = continued_literal(&chars, i + 1) {
                        i = resume;
                        continue;
                    }
                    in_string = false;
                    out.push(c);
                }
                _ => out.push(c),
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// If whitespace containing a newline and then `"` follows `from`, return the
/// index just past that opening quote.
fn continued_literal(chars: &[char], from: usize) -> Option<usize> {
    let mut j = from;
    let mut saw_newline = false;
    while let Some(&c) = chars.get(j) {
        match c {
            '\n' => saw_newline = true,
            ' ' | '\t' | '\r' => {}
            '"' if saw_newline => return Some(j + 1),
            _ => return None,
        }
        j += 1;
    }
    None
}
