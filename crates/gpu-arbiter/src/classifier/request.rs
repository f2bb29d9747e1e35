use serde_json::Map;
use serde_json::Value;

pub const GENERATE_PATH: &str = "/api/generate";
pub const CHAT_PATH: &str = "/api/chat";
pub const EMBEDDINGS_PATH: &str = "/api/embeddings";
pub const LOAD_PATH: &str = "/api/load";
pub const PULL_PATH: &str = "/api/pull";

/// Decode a request body as a JSON object.
///
/// Empty, malformed, or non-object bodies decode to an empty object so that
/// classification falls back to its defaults.
pub fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::debug!("request body is not a JSON object, classifying with defaults");
            Value::Object(Map::new())
        }
    }
}

/// Whether a request needs exclusive use of the GPU.
pub fn is_gpu_intensive(path: &str, body: &Value) -> bool {
    if path == GENERATE_PATH && keep_alive_is_zero(body) {
        tracing::debug!("Detected model unload request via {GENERATE_PATH}");
        return false;
    }
    if path == CHAT_PATH && keep_alive_is_zero(body) && has_empty_messages(body) {
        tracing::debug!("Detected model unload request via {CHAT_PATH}");
        return false;
    }

    match path {
        GENERATE_PATH | CHAT_PATH | EMBEDDINGS_PATH | LOAD_PATH => true,
        PULL_PATH => body.get("stream").map_or(true, is_truthy),
        _ => false,
    }
}

fn keep_alive_is_zero(body: &Value) -> bool {
    body.get("keep_alive")
        .and_then(Value::as_f64)
        .is_some_and(|v| v == 0.0)
}

fn has_empty_messages(body: &Value) -> bool {
    body.get("messages")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
