//! `${name.path}` reference templates in stack file strings.
//!
//! A string is split into literal text and references. `$$` escapes a
//! literal `$`. A reference's root is a resource or variable name and the
//! rest is a dotted path into its value; `[n]` indexes a list.

use crate::error::ConfigError;

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Literal(String),
    /// A reference to another entry's value.
    Reference(Reference),
}

/// A parsed `${root.path}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The referenced resource or variable.
    pub root: String,
    /// Dotted path into its value; empty for the whole value.
    pub path: String,
}

impl Reference {
    /// Renders the reference back to its source form.
    #[must_use]
    pub fn to_template(&self) -> String {
        if self.path.is_empty() {
            format!("${{{}}}", self.root)
        } else {
            format!("${{{}.{}}}", self.root, self.path)
        }
    }
}

/// Splits a string into literal and reference segments.
///
/// # Errors
///
/// Returns `InvalidReference` for an unterminated or empty reference.
pub fn parse_template(input: &str) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            literal.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                literal.push('$');
            }
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    body.push(inner);
                }
                if !closed {
                    return Err(ConfigError::InvalidReference {
                        reference: format!("${{{body}"),
                        reason: String::from("unterminated reference"),
                    });
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Reference(parse_reference(&body)?));
            }
            _ => literal.push('$'),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_reference(body: &str) -> Result<Reference, ConfigError> {
    let body = body.trim();
    let invalid = || ConfigError::InvalidReference {
        reference: format!("${{{body}}}"),
        reason: String::from("expected ${name} or ${name.path}"),
    };
    let dotted = indexes_to_dotted(body).ok_or_else(invalid)?;
    let (root, path) = dotted.split_once('.').unwrap_or((dotted.as_str(), ""));
    if root.is_empty() || (!path.is_empty() && path.split('.').any(str::is_empty)) {
        return Err(invalid());
    }
    Ok(Reference {
        root: root.to_string(),
        path: path.to_string(),
    })
}

/// Rewrites `passwords[0].value` as `passwords.0.value`.
fn indexes_to_dotted(body: &str) -> Option<String> {
    let mut dotted = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(open) = rest.find('[') {
        let close = open + rest[open..].find(']')?;
        let index = &rest[open + 1..close];
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        dotted.push_str(&rest[..open]);
        dotted.push('.');
        dotted.push_str(index);
        rest = &rest[close + 1..];
    }
    if rest.contains(']') {
        return None;
    }
    dotted.push_str(rest);
    Some(dotted)
}

/// Every reference in a string.
///
/// # Errors
///
/// As for [`parse_template`].
pub fn references(input: &str) -> Result<Vec<Reference>, ConfigError> {
    Ok(parse_template(input)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference(reference) => Some(reference),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Every reference inside a JSON value, depth first.
///
/// # Errors
///
/// As for [`parse_template`].
pub fn value_references(value: &serde_json::Value) -> Result<Vec<Reference>, ConfigError> {
    let mut found = Vec::new();
    collect_value_references(value, &mut found)?;
    Ok(found)
}

fn collect_value_references(
    value: &serde_json::Value,
    found: &mut Vec<Reference>,
) -> Result<(), ConfigError> {
    match value {
        serde_json::Value::String(s) => found.extend(references(s)?),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_value_references(item, found)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_value_references(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}
