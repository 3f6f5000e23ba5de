//! Tolerant extraction of typed fields from untrusted JSON.
//!
//! Relays in the wild serve arbitrarily malformed NIP-11 documents; a
//! field is accepted only when it matches its declared type and is
//! silently dropped otherwise. No function here ever errors.

use serde_json::Value;

pub fn take_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)?.as_str().map(str::to_string)
}

pub fn take_int(data: &Value, key: &str) -> Option<i64> {
    data.get(key)?.as_i64()
}

pub fn take_bool(data: &Value, key: &str) -> Option<bool> {
    data.get(key)?.as_bool()
}

pub fn take_f64(data: &Value, key: &str) -> Option<f64> {
    let value = data.get(key)?;
    // Booleans are not numbers; serde_json keeps them distinct already.
    value.as_f64().filter(|f| f.is_finite())
}

/// String list with non-string elements filtered out; empty results are
/// dropped entirely.
pub fn take_str_list(data: &Value, key: &str) -> Option<Vec<String>> {
    let items: Vec<String> = data
        .get(key)?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Integer list with non-integer elements filtered out; empty results
/// are dropped entirely.
pub fn take_int_list(data: &Value, key: &str) -> Option<Vec<i64>> {
    let items: Vec<i64> = data
        .get(key)?
        .as_array()?
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn take_str_drops_wrong_types() {
        let data = json!({"name": "relay", "version": 2});
        assert_eq!(take_str(&data, "name").as_deref(), Some("relay"));
        assert_eq!(take_str(&data, "version"), None);
        assert_eq!(take_str(&data, "missing"), None);
    }

    #[test]
    fn take_int_rejects_bools_and_floats() {
        let data = json!({"a": 3, "b": true, "c": 1.5, "d": "7"});
        assert_eq!(take_int(&data, "a"), Some(3));
        assert_eq!(take_int(&data, "b"), None);
        assert_eq!(take_int(&data, "c"), None);
        assert_eq!(take_int(&data, "d"), None);
    }

    #[test]
    fn take_bool_strict() {
        let data = json!({"a": true, "b": 1, "c": "true"});
        assert_eq!(take_bool(&data, "a"), Some(true));
        assert_eq!(take_bool(&data, "b"), None);
        assert_eq!(take_bool(&data, "c"), None);
    }

    #[test]
    fn take_f64_accepts_ints() {
        let data = json!({"a": 1.5, "b": 2});
        assert_eq!(take_f64(&data, "a"), Some(1.5));
        assert_eq!(take_f64(&data, "b"), Some(2.0));
    }

    #[test]
    fn take_str_list_filters_elements() {
        let data = json!({"tags": ["a", 1, "b", null], "empty": [2, 3], "not_list": "x"});
        assert_eq!(
            take_str_list(&data, "tags"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(take_str_list(&data, "empty"), None);
        assert_eq!(take_str_list(&data, "not_list"), None);
    }

    #[test]
    fn take_int_list_filters_elements() {
        let data = json!({"nips": [1, "x", 11], "none": ["a"]});
        assert_eq!(take_int_list(&data, "nips"), Some(vec![1, 11]));
        assert_eq!(take_int_list(&data, "none"), None);
    }
}
