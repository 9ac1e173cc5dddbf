//! Error-payload decoding for coordinator and object-storage responses.
//!
//! Error bodies are decoded as JSON first (`{"message": ...}` where the
//! message is a plain string or a field-to-errors map), then as the XML
//! `<Error><Code/><Message/></Error>` envelope object-storage providers
//! return, and finally fall back to the raw HTTP status text.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Response;

/// Extract the most readable error message a response can offer. Consumes
/// the body.
pub(crate) async fn error_message(response: Response) -> String {
    let status = response.status();
    let status_text = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string();

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default();

    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(_) => return status_text,
    };

    let decoded = match content_type.as_str() {
        "application/json" => json_error_message(&body),
        "application/xml" | "text/xml" => xml_error_message(&body),
        _ => None,
    };

    match decoded {
        Some(message) if !message.is_empty() => format!("{status_text} ({message})"),
        _ => status_text,
    }
}

/// `{"message": "..."}"` or `{"message": {"field": ["err1", "err2"]}}`.
fn json_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let message = value.get("message")?;

    match message {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Object(fields) => {
            let mut parts: Vec<String> = fields
                .iter()
                .map(|(field, errors)| {
                    let joined = match errors {
                        serde_json::Value::Array(items) => items
                            .iter()
                            .map(value_to_text)
                            .collect::<Vec<_>>()
                            .join("; "),
                        other => value_to_text(other),
                    };
                    format!("{field}: {joined}")
                })
                .collect();
            parts.sort();
            Some(parts.join(", "))
        }
        _ => None,
    }
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Object-storage style `<Error><Code>..</Code><Message>..</Message></Error>`.
fn xml_error_message(body: &[u8]) -> Option<String> {
    static CODE: OnceLock<Regex> = OnceLock::new();
    static MESSAGE: OnceLock<Regex> = OnceLock::new();

    let text = std::str::from_utf8(body).ok()?;
    let code = CODE
        .get_or_init(|| Regex::new(r"<Code>([^<]*)</Code>").unwrap())
        .captures(text)
        .map(|c| c[1].to_string())?;
    let message = MESSAGE
        .get_or_init(|| Regex::new(r"<Message>([^<]*)</Message>").unwrap())
        .captures(text)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    if message.is_empty() {
        Some(code)
    } else {
        Some(format!("{code}: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_plain_message() {
        let body = br#"{"message": "403 Forbidden"}"#;
        assert_eq!(json_error_message(body).unwrap(), "403 Forbidden");
    }

    #[test]
    fn test_json_field_errors() {
        let body = br#"{"message": {"token": ["is invalid", "is expired"], "name": ["too long"]}}"#;
        assert_eq!(
            json_error_message(body).unwrap(),
            "name: too long, token: is invalid; is expired"
        );
    }

    #[test]
    fn test_json_garbage_is_ignored() {
        assert_eq!(json_error_message(b"not json"), None);
        assert_eq!(json_error_message(br#"{"message": 42}"#), None);
    }

    #[test]
    fn test_xml_error_envelope() {
        let body = br#"<?xml version="1.0"?><Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>"#;
        assert_eq!(
            xml_error_message(body).unwrap(),
            "AccessDenied: Access Denied"
        );
    }

    #[test]
    fn test_xml_code_only() {
        let body = br#"<Error><Code>SlowDown</Code></Error>"#;
        assert_eq!(xml_error_message(body).unwrap(), "SlowDown");
    }
}
