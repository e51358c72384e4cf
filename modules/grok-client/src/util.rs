use reqwest::header::HeaderMap;
use serde_json::Value;

/// Extract the text content from an upstream response body, trying the
/// `/responses` shape first (`output[0].content[].text`) and falling back to
/// `/chat/completions` (`choices[0].message.content`).
pub fn extract_response_text(body: &Value) -> String {
    if let Some(output) = body.get("output").and_then(Value::as_array) {
        if let Some(content) = output.first().and_then(|o| o.get("content")) {
            if let Some(items) = content.as_array() {
                let text_item = items
                    .iter()
                    .find(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
                    .or_else(|| items.first());
                if let Some(text) = text_item
                    .and_then(|c| c.get("text"))
                    .and_then(Value::as_str)
                {
                    return text.to_string();
                }
            }
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }

    if let Some(choices) = body.get("choices").and_then(Value::as_array) {
        if let Some(content) = choices
            .first()
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
        {
            return content.to_string();
        }
    }

    String::new()
}

/// Pull the first `{...}` span out of model text and parse it.
/// Models wrap JSON in prose often enough that strict parsing loses data.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Pull the first `[...]` span out of model text and parse it.
pub fn extract_json_array(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;
    parsed.is_array().then_some(parsed)
}

/// Upstream request id, checked across the header names xAI and proxies use.
pub fn extract_upstream_request_id(headers: &HeaderMap) -> Option<String> {
    const CANDIDATES: [&str; 4] = ["x-request-id", "xai-request-id", "x-correlation-id", "request-id"];
    for name in CANDIDATES {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_chat_completions_text() {
        let body = json!({
            "choices": [{ "message": { "content": "hello" } }]
        });
        assert_eq!(extract_response_text(&body), "hello");
    }

    #[test]
    fn extracts_responses_output_text() {
        let body = json!({
            "output": [{ "content": [
                { "type": "reasoning", "text": "thinking" },
                { "type": "output_text", "text": "answer" }
            ]}]
        });
        assert_eq!(extract_response_text(&body), "answer");
    }

    #[test]
    fn missing_content_yields_empty() {
        assert_eq!(extract_response_text(&json!({"ok": true})), "");
    }

    #[test]
    fn json_object_is_pulled_from_prose() {
        let text = "Here you go:\n{\"keywords\": [\"soap\"]}\nEnjoy!";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["keywords"][0], "soap");
    }

    #[test]
    fn json_array_is_pulled_from_prose() {
        let text = "```json\n[{\"company_name\": \"Acme\"}]\n```";
        let arr = extract_json_array(text).unwrap();
        assert_eq!(arr[0]["company_name"], "Acme");
    }

    #[test]
    fn non_array_span_is_rejected() {
        assert!(extract_json_array("[not json]").is_none());
    }
}
