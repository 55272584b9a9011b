//! A small dotted/bracketed path language over JSON values.
//!
//! ```text
//! a.b[1].c        property `a`, property `b`, index 1, property `c`
//! a.items[]       property `items`, must be an array (later segments map over it)
//! a.items[].name  `name` of every element of `items`
//! a["x.y"]        quoted key, dots inside brackets are not separators
//! ```

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PathError {
    #[error("property `{property}` not found")]
    MissingProperty { property: String },

    #[error("cannot read `{property}` from a non-object value")]
    NotAnObject { property: String },

    #[error("`{property}` is not an array")]
    NotAnArray { property: String },

    #[error("index {index} out of bounds for `{property}` (length {len})")]
    IndexOutOfBounds {
        property: String,
        index: usize,
        len: usize,
    },

    #[error("malformed path segment `{0}`")]
    Malformed(String),
}

/// Split a path on `.`, keeping `[...]` groups intact.
pub fn tokenize(path: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '.' if depth == 0 => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    tokens.push(current);
    tokens
}

/// Resolve `path` against `data`. An empty path returns `data` unchanged.
pub fn evaluate(path: &str, data: &Value) -> Result<Value, PathError> {
    let path = path.trim();
    if path.is_empty() {
        return Ok(data.clone());
    }

    let mut current = data.clone();
    for token in tokenize(path) {
        let token = token.trim();
        if token.is_empty() {
            return Err(PathError::Malformed(path.to_string()));
        }
        current = step(token, &current)?;
    }
    Ok(current)
}

fn step(token: &str, current: &Value) -> Result<Value, PathError> {
    // `prop[]` names an array-valued property
    if let Some(prop) = token.strip_suffix("[]") {
        let value = property(current, prop)?;
        return match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(PathError::NotAnArray {
                property: prop.to_string(),
            }),
        };
    }

    if let Value::Array(items) = current {
        return items
            .iter()
            .map(|item| step(token, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }

    if let Some(open) = token.find('[') {
        let (prop, brackets) = token.split_at(open);
        let mut value = if prop.is_empty() {
            current.clone()
        } else {
            property(current, prop)?.clone()
        };
        let label = if prop.is_empty() { token } else { prop };
        for inner in bracket_contents(brackets)? {
            value = index_into(&value, label, &inner)?;
        }
        return Ok(value);
    }

    property(current, token).cloned()
}

fn property<'a>(current: &'a Value, name: &str) -> Result<&'a Value, PathError> {
    match current {
        Value::Object(map) => map.get(name).ok_or_else(|| PathError::MissingProperty {
            property: name.to_string(),
        }),
        _ => Err(PathError::NotAnObject {
            property: name.to_string(),
        }),
    }
}

fn bracket_contents(brackets: &str) -> Result<Vec<String>, PathError> {
    let mut out = Vec::new();
    let mut rest = brackets;
    while !rest.is_empty() {
        let body = rest
            .strip_prefix('[')
            .ok_or_else(|| PathError::Malformed(brackets.to_string()))?;
        let close = body
            .find(']')
            .ok_or_else(|| PathError::Malformed(brackets.to_string()))?;
        out.push(body[..close].trim().to_string());
        rest = &body[close + 1..];
    }
    Ok(out)
}

fn index_into(value: &Value, label: &str, inner: &str) -> Result<Value, PathError> {
    if let Ok(index) = inner.parse::<usize>() {
        let items = value.as_array().ok_or_else(|| PathError::NotAnArray {
            property: label.to_string(),
        })?;
        return items
            .get(index)
            .cloned()
            .ok_or(PathError::IndexOutOfBounds {
                property: label.to_string(),
                index,
                len: items.len(),
            });
    }

    let key = inner.trim_matches(|c| c == '"' || c == '\'');
    if key.is_empty() {
        return Err(PathError::Malformed(format!("{label}[{inner}]")));
    }
    property(value, key).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_indexed_nested_lookup() {
        let data = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(evaluate("a.b[1].c", &data).unwrap(), json!(2));
    }

    #[test]
    fn test_array_suffix_returns_array() {
        let data = json!({"a": {"b": [1, 2, 3]}});
        assert_eq!(evaluate("a.b[]", &data).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_maps_over_arrays() {
        let data = json!({"users": [{"name": "ann"}, {"name": "bob"}]});
        assert_eq!(evaluate("users[].name", &data).unwrap(), json!(["ann", "bob"]));
        assert_eq!(evaluate("users.name", &data).unwrap(), json!(["ann", "bob"]));
    }

    #[test]
    fn test_mapping_fails_when_an_item_lacks_the_property() {
        let data = json!({"users": [{"name": "ann"}, {"age": 3}]});
        assert!(matches!(
            evaluate("users[].name", &data),
            Err(PathError::MissingProperty { .. })
        ));
    }

    #[test]
    fn test_missing_property_errors() {
        let data = json!({"a": {}});
        assert_eq!(
            evaluate("a.nope", &data),
            Err(PathError::MissingProperty {
                property: "nope".into()
            })
        );
    }

    #[test]
    fn test_out_of_range_and_non_array_index() {
        let data = json!({"a": [1], "s": "x"});
        assert!(matches!(
            evaluate("a[4]", &data),
            Err(PathError::IndexOutOfBounds { index: 4, len: 1, .. })
        ));
        assert!(matches!(evaluate("s[0]", &data), Err(PathError::NotAnArray { .. })));
        assert!(matches!(evaluate("s[]", &data), Err(PathError::NotAnArray { .. })));
    }

    #[test]
    fn test_empty_path_is_identity() {
        let data = json!({"x": 1});
        assert_eq!(evaluate("", &data).unwrap(), data);
    }

    #[test]
    fn test_quoted_keys_keep_dots() {
        let data = json!({"headers": {"content.type": "json"}});
        assert_eq!(
            evaluate("headers[\"content.type\"]", &data).unwrap(),
            json!("json")
        );
        assert_eq!(tokenize("a[\"b.c\"].d"), vec!["a[\"b.c\"]", "d"]);
    }

    #[test]
    fn test_chained_indices() {
        let data = json!({"grid": [[1, 2], [3, 4]]});
        assert_eq!(evaluate("grid[1][0]", &data).unwrap(), json!(3));
    }

    #[test]
    fn test_malformed_segments() {
        let data = json!({"a": {"b": 1}});
        assert!(matches!(evaluate("a..b", &data), Err(PathError::Malformed(_))));
        assert!(matches!(evaluate("a[0", &data), Err(PathError::Malformed(_))));
    }
}
