//! JSONPath subset used by `addKey.jsonPathExpression`.
//!
//! Accepts the kubectl template form (`{.credentials.uri}`) and the bare forms
//! (`$.uri`, `.uri`). Supported steps: `.field`, `['field']`, `["field"]`,
//! `[index]`, `[*]` and `.*`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Field(String),
    Index(usize),
    Wildcard,
}

/// A parsed expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    steps: Vec<Step>,
}

impl JsonPath {
    /// Parse an expression
    ///
    /// # Errors
    /// Returns a message describing the first unparseable part.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let mut rest = expression.trim();
        if let Some(inner) = rest.strip_prefix('{') {
            rest = inner
                .strip_suffix('}')
                .ok_or_else(|| format!("unterminated template in {expression:?}"))?
                .trim();
        }
        rest = rest.strip_prefix('$').unwrap_or(rest);

        let mut steps = Vec::new();
        while !rest.is_empty() {
            if let Some(after_dot) = rest.strip_prefix('.') {
                if let Some(after_star) = after_dot.strip_prefix('*') {
                    steps.push(Step::Wildcard);
                    rest = after_star;
                    continue;
                }
                let end = after_dot
                    .find(['.', '['])
                    .unwrap_or(after_dot.len());
                let field = &after_dot[..end];
                if field.is_empty() {
                    return Err(format!("empty field name in {expression:?}"));
                }
                steps.push(Step::Field(field.to_string()));
                rest = &after_dot[end..];
            } else if let Some(after_bracket) = rest.strip_prefix('[') {
                let end = after_bracket
                    .find(']')
                    .ok_or_else(|| format!("unterminated bracket in {expression:?}"))?;
                let inner = after_bracket[..end].trim();
                steps.push(parse_bracket(inner, expression)?);
                rest = &after_bracket[end + 1..];
            } else {
                return Err(format!("unexpected {rest:?} in {expression:?}"));
            }
        }
        Ok(Self { steps })
    }

    /// All values the expression selects in `document`
    #[must_use]
    pub fn select<'a>(&self, document: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![document];
        for step in &self.steps {
            current = current
                .into_iter()
                .flat_map(|value| apply(step, value))
                .collect();
        }
        current
    }
}

fn parse_bracket(inner: &str, expression: &str) -> Result<Step, String> {
    if inner == "*" {
        return Ok(Step::Wildcard);
    }
    for quote in ['\'', '"'] {
        if let Some(quoted) = inner.strip_prefix(quote) {
            let field = quoted
                .strip_suffix(quote)
                .ok_or_else(|| format!("unterminated quote in {expression:?}"))?;
            return Ok(Step::Field(field.to_string()));
        }
    }
    inner
        .parse::<usize>()
        .map(Step::Index)
        .map_err(|e| format!("unsupported subscript [{inner}] in {expression:?}: {e}"))
}

fn apply<'a>(step: &Step, value: &'a Value) -> Vec<&'a Value> {
    match (step, value) {
        (Step::Field(name), Value::Object(map)) => map.get(name).into_iter().collect(),
        (Step::Index(index), Value::Array(items)) => items.get(*index).into_iter().collect(),
        (Step::Wildcard, Value::Object(map)) => map.values().collect(),
        (Step::Wildcard, Value::Array(items)) => items.iter().collect(),
        _ => Vec::new(),
    }
}

/// Text rendering of selected values, space separated
///
/// Strings are used as-is; everything else is rendered as JSON.
#[must_use]
pub fn render(values: &[&Value]) -> String {
    values
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expression: &str, document: &Value) -> String {
        let path = JsonPath::parse(expression).expect("parses");
        render(&path.select(document))
    }

    #[test]
    fn test_template_and_bare_forms() {
        let doc = json!({"db": {"host": "pg.local", "port": 5432}});
        assert_eq!(eval("{.db.host}", &doc), "pg.local");
        assert_eq!(eval("$.db.port", &doc), "5432");
        assert_eq!(eval(".db['host']", &doc), "pg.local");
        assert_eq!(eval("{.db}", &doc), r#"{"host":"pg.local","port":5432}"#);
    }

    #[test]
    fn test_arrays_and_wildcards() {
        let doc = json!({"hosts": ["a", "b", "c"], "ports": {"x": 1}});
        assert_eq!(eval("{.hosts[1]}", &doc), "b");
        assert_eq!(eval("{.hosts[*]}", &doc), "a b c");
        assert_eq!(eval("{.ports.*}", &doc), "1");
    }

    #[test]
    fn test_no_match_selects_nothing() {
        let doc = json!({"a": 1});
        let path = JsonPath::parse("{.b.c}").expect("parses");
        assert!(path.select(&doc).is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("{.a").is_err());
        assert!(JsonPath::parse(".a[").is_err());
        assert!(JsonPath::parse(".a[x]").is_err());
        assert!(JsonPath::parse("a").is_err());
        assert!(JsonPath::parse("..a").is_err());
    }
}
