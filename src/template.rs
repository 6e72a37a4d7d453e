//! Prompt rendering: `{name}` placeholders resolved against an item's `input_data`.

use serde_json::{Map, Value};

use crate::error::EngineError;

/// Whole-input placeholder, used when `input_data` has no `input` key of its own.
const WHOLE_INPUT: &str = "input";

pub fn render(template: &str, input: &Map<String, Value>) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(EngineError::Template(format!(
                        "unterminated placeholder '{{{}'",
                        name
                    )));
                }
                out.push_str(&resolve(name.trim(), input)?);
            }
            '}' => {
                return Err(EngineError::Template(
                    "unmatched '}' in template".to_string(),
                ))
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

fn resolve(name: &str, input: &Map<String, Value>) -> Result<String, EngineError> {
    if name.is_empty() {
        return Err(EngineError::Template("empty placeholder '{}'".to_string()));
    }
    match input.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None if name == WHOLE_INPUT => Ok(Value::Object(input.clone()).to_string()),
        None => Err(EngineError::Template(format!(
            "unresolved variable '{}'",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_string_and_number() {
        let data = input(json!({"country": "France", "year": 2024}));
        let out = render("Capital of {country} in {year}?", &data).unwrap();
        assert_eq!(out, "Capital of France in 2024?");
    }

    #[test]
    fn test_render_escaped_braces() {
        let data = input(json!({"x": "1"}));
        assert_eq!(render("{{literal}} {x}", &data).unwrap(), "{literal} 1");
    }

    #[test]
    fn test_render_whole_input() {
        let data = input(json!({"q": "hi"}));
        assert_eq!(render("Input: {input}", &data).unwrap(), r#"Input: {"q":"hi"}"#);
    }

    #[test]
    fn test_input_key_takes_precedence() {
        let data = input(json!({"input": "explicit"}));
        assert_eq!(render("{input}", &data).unwrap(), "explicit");
    }

    #[test]
    fn test_unresolved_variable() {
        let data = input(json!({"a": "1"}));
        let err = render("{a} {b}", &data).unwrap_err();
        assert_eq!(err, EngineError::Template("unresolved variable 'b'".to_string()));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let data = Map::new();
        assert!(matches!(render("hello {name", &data), Err(EngineError::Template(_))));
    }

    #[test]
    fn test_unmatched_close_brace() {
        assert!(render("oops }", &Map::new()).is_err());
    }
}
