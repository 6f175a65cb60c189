/// Replace `${ENV_VAR}` and `${ENV_VAR:-default}` placeholders in config
/// string values.
///
/// Unresolvable variables with no default are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Replace placeholders using a custom lookup function.
///
/// This is the implementation used by [`substitute_env`]; the separate
/// signature makes it testable without mutating the process environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut body = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                body.push(c);
            }
            if closed && !body.is_empty() {
                let (name, default) = match body.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (body.as_str(), None),
                };
                match lookup(name) {
                    Some(val) => result.push_str(&val),
                    None => match default {
                        Some(default) => result.push_str(default),
                        None => {
                            // Leave unresolved placeholder as-is.
                            result.push_str("${");
                            result.push_str(&body);
                            result.push('}');
                        },
                    },
                }
            } else {
                // Malformed — emit literal.
                result.push_str("${");
                result.push_str(&body);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "RELAY_TEST_VAR" => Some("hello".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("key=${RELAY_TEST_VAR}", lookup),
            "key=hello"
        );
    }

    #[test]
    fn leaves_unknown_var_with_no_default() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("${RELAY_NONEXISTENT_XYZ}", lookup),
            "${RELAY_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        let lookup = |_: &str| None;
        assert_eq!(
            substitute_env_with("${RELAY_MISSING:-fallback}", lookup),
            "fallback"
        );
    }

    #[test]
    fn prefers_set_value_over_default() {
        let lookup = |name: &str| match name {
            "RELAY_SET" => Some("set-value".to_string()),
            _ => None,
        };
        assert_eq!(
            substitute_env_with("${RELAY_SET:-fallback}", lookup),
            "set-value"
        );
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
