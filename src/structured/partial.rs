// Progressive partial-JSON parsing. A prefix of a JSON document is repaired
// by closing whatever containers are still open, tracking string state so
// braces inside literals never count. Buffers that end inside a string are
// not repairable and yield `None`.

use serde_json::Value;

/// Parse a (possibly incomplete) JSON buffer.
///
/// Tries a plain parse first. On failure, scans the buffer tracking `"` and
/// `\` escaping, trims one trailing comma outside strings, appends the
/// closers for every unmatched `{`/`[`, and retries.
pub fn parse_partial(input: &str) -> Option<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    if in_string {
        return None;
    }

    let mut candidate = trimmed.trim_end().to_string();
    if candidate.ends_with(',') {
        candidate.pop();
    }
    for closer in closers.iter().rev() {
        candidate.push(*closer);
    }
    serde_json::from_str(&candidate).ok()
}

/// Merge `update` into `base`: objects merge key-wise, arrays are replaced,
/// primitives are overwritten.
pub fn deep_merge(base: &mut Value, update: Value) {
    match update {
        Value::Object(update_map) => {
            if let Value::Object(base_map) = base {
                for (key, value) in update_map {
                    match base_map.get_mut(&key) {
                        Some(slot) => deep_merge(slot, value),
                        None => {
                            base_map.insert(key, value);
                        }
                    }
                }
            } else {
                *base = Value::Object(update_map);
            }
        }
        other => *base = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_json_parses_directly() {
        assert_eq!(
            parse_partial(r#"{"a":1,"b":[1,2,3]}"#),
            Some(json!({"a":1,"b":[1,2,3]}))
        );
    }

    #[test]
    fn progressive_prefixes_yield_growing_partials() {
        assert_eq!(parse_partial(r#"{"a":1,"#), Some(json!({"a":1})));
        assert_eq!(
            parse_partial(r#"{"a":1,"b":[1,2"#),
            Some(json!({"a":1,"b":[1,2]}))
        );
        assert_eq!(
            parse_partial(r#"{"a":1,"b":[1,2,3]}"#),
            Some(json!({"a":1,"b":[1,2,3]}))
        );
    }

    #[test]
    fn braces_inside_strings_do_not_count() {
        assert_eq!(
            parse_partial(r#"{"text":"open { and [ here","n":[1"#),
            Some(json!({"text":"open { and [ here","n":[1]}))
        );
    }

    #[test]
    fn escaped_quotes_are_tracked() {
        assert_eq!(
            parse_partial(r#"{"quote":"she said \"{\" ","n":[2"#),
            Some(json!({"quote":"she said \"{\" ","n":[2]}))
        );
    }

    #[test]
    fn buffer_ending_inside_string_is_unparseable() {
        assert_eq!(parse_partial(r#"{"a":"unfini"#), None);
        assert_eq!(parse_partial(r#"{"a":1,"b"#), None);
    }

    #[test]
    fn dangling_value_is_unparseable() {
        assert_eq!(parse_partial(r#"{"a":tru"#), None);
        assert_eq!(parse_partial(""), None);
    }

    #[test]
    fn merge_objects_keywise() {
        let mut base = json!({"a":1,"b":{"x":1}});
        deep_merge(&mut base, json!({"b":{"y":2},"c":3}));
        assert_eq!(base, json!({"a":1,"b":{"x":1,"y":2},"c":3}));
    }

    #[test]
    fn merge_replaces_arrays_and_overwrites_primitives() {
        let mut base = json!({"list":[1,2],"n":1});
        deep_merge(&mut base, json!({"list":[3],"n":2}));
        assert_eq!(base, json!({"list":[3],"n":2}));
    }
}
