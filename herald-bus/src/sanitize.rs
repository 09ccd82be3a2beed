//! Removes credentials from message bodies before they reach a log line.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde_json::Value;

/// Keys dropped anywhere in a JSON tree, compared case-insensitively.
static SENSITIVE_FIELDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "token",
        "accesstoken",
        "refreshtoken",
        "idtoken",
        "password",
        "secret",
        "clientsecret",
        "authorization",
        "apikey",
    ]
    .into_iter()
    .collect()
});

pub fn is_sensitive(key: &str) -> bool {
    SENSITIVE_FIELDS.contains(key.to_ascii_lowercase().as_str())
}

/// Drop every sensitive key, at any depth.
pub fn strip_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !is_sensitive(key));
            for (_, child) in map.iter_mut() {
                strip_sensitive(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                strip_sensitive(child);
            }
        }
        _ => {}
    }
}

/// Render a raw body for a trace. Bodies that are not JSON are never echoed.
pub fn sanitized_body(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(mut value) => {
            strip_sensitive(&mut value);
            value.to_string()
        }
        Err(_) => format!("<{} bytes, non-JSON body>", body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_nested_credentials() {
        let mut value = json!({
            "orderId": 7,
            "accessToken": "abc",
            "transactionContext": {
                "principal": { "subject": "u-1", "Password": "hunter2" }
            },
            "items": [{ "sku": "x", "secret": "s" }]
        });

        strip_sensitive(&mut value);

        assert_eq!(
            value,
            json!({
                "orderId": 7,
                "transactionContext": { "principal": { "subject": "u-1" } },
                "items": [{ "sku": "x" }]
            })
        );
    }

    #[test]
    fn non_json_bodies_are_summarised() {
        assert_eq!(sanitized_body(b"\x00\x01token"), "<7 bytes, non-JSON body>");
        assert_eq!(sanitized_body(br#"{"token":"t","a":1}"#), r#"{"a":1}"#);
    }
}
