/*!
Payload builders for agent tests

SenML command frames as the control plane sends them, terminal bodies with
their base64 wrapping, and bootstrap service replies.
*/

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

/// `[{"bn":"<uuid>:","n":"<kind>","vs":"<body>"}]`
pub fn command(uuid: &str, kind: &str, body: &str) -> Vec<u8> {
    json!([{ "bn": format!("{uuid}:"), "n": kind, "vs": body }])
        .to_string()
        .into_bytes()
}

/// Body of a `term` command: base64 of `open`, `close` or `c,<input>`
pub fn term_body(text: &str) -> String {
    BASE64_STANDARD.encode(text)
}

pub fn term(uuid: &str, text: &str) -> Vec<u8> {
    command(uuid, "term", &term_body(text))
}

/// Base64 body of a `config,save` command
pub fn config_blob(toml: &str) -> String {
    BASE64_STANDARD.encode(toml)
}

/// Builder for bootstrap service replies
pub struct BootstrapReplyBuilder {
    thing_id: String,
    thing_key: String,
    channels: Vec<Value>,
    content: Value,
}

impl BootstrapReplyBuilder {
    pub fn new(thing_id: &str, thing_key: &str) -> Self {
        Self {
            thing_id: thing_id.to_string(),
            thing_key: thing_key.to_string(),
            channels: Vec::new(),
            content: Value::Null,
        }
    }

    pub fn channel(mut self, id: &str, kind: &str) -> Self {
        self.channels.push(json!({ "id": id, "metadata": { "type": kind } }));
        self
    }

    /// `content` document (`{agent, export}`), sent JSON-encoded as a string
    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn build(&self) -> Value {
        let content = if self.content.is_null() {
            String::new()
        } else {
            self.content.to_string()
        };
        json!({
            "thing_id": self.thing_id,
            "thing_key": self.thing_key,
            "channels": self.channels,
            "content": content,
            "client_cert": "",
            "client_key": "",
            "ca_cert": "",
        })
    }
}
