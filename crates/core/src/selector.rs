//! Element selector grammar shared by the intent parser and the browser back end.
//!
//! Two forms are accepted:
//! - `text=<label>`: the first visible element whose text or accessible label
//!   contains `<label>` (case-insensitive).
//! - anything else is treated as a CSS selector and checked for syntactic
//!   well-formedness (balanced brackets and quotes, no dangling combinators).

use serde::{Deserialize, Serialize};
use std::fmt;

const TEXT_PREFIX: &str = "text=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Selector {
    Css(String),
    Text(String),
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("selector is empty".to_string());
        }
        if raw.chars().any(|c| c.is_control()) {
            return Err(format!("selector '{}' contains control characters", raw));
        }

        if let Some(label) = raw.strip_prefix(TEXT_PREFIX) {
            let label = label.trim();
            if label.is_empty() {
                return Err("text selector has an empty label".to_string());
            }
            return Ok(Selector::Text(label.to_string()));
        }

        check_css(raw)?;
        Ok(Selector::Css(raw.to_string()))
    }

    /// Build a text selector for a spoken label.
    pub fn text(label: &str) -> String {
        format!("{}{}", TEXT_PREFIX, label.trim())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(css) => f.write_str(css),
            Selector::Text(label) => write!(f, "{}{}", TEXT_PREFIX, label),
        }
    }
}

fn check_css(css: &str) -> Result<(), String> {
    let first = css.chars().next().unwrap_or(' ');
    let last = css.chars().last().unwrap_or(' ');
    if matches!(first, '>' | '+' | '~' | ',') {
        return Err(format!("selector '{}' starts with a combinator", css));
    }
    if matches!(last, '>' | '+' | '~' | ',') {
        return Err(format!("selector '{}' ends with a combinator", css));
    }

    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in css.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '[' | '(' => stack.push(c),
            ']' => {
                if stack.pop() != Some('[') {
                    return Err(format!("selector '{}' has an unbalanced ']'", css));
                }
            }
            ')' => {
                if stack.pop() != Some('(') {
                    return Err(format!("selector '{}' has an unbalanced ')'", css));
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(format!("selector '{}' has an unterminated string", css));
    }
    if !stack.is_empty() {
        return Err(format!("selector '{}' has unclosed brackets", css));
    }
    Ok(())
}
