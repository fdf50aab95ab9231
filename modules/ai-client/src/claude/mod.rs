mod client;
pub(crate) mod types;

use client::ClaudeClient;
use types::*;

use crate::error::{AiError, Result};

/// Output of a forced-tool extraction: the tool call's input payload,
/// which the API guarantees conforms to the supplied schema.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub value: serde_json::Value,
}

/// Claude (Anthropic Messages API) client configured for one model.
#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    temperature: Option<f32>,
    base_url: Option<String>,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            base_url: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> ClaudeClient {
        let client = ClaudeClient::new(&self.api_key);
        if let Some(ref url) = self.base_url {
            client.with_base_url(url)
        } else {
            client
        }
    }

    /// Extract structured data from `user_prompt` by forcing the model to
    /// call a single tool whose `input_schema` is supplied by the caller.
    pub async fn extract(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tool_name: &str,
        tool_description: &str,
        input_schema: serde_json::Value,
    ) -> Result<Extraction> {
        let mut request = ChatRequest::new(&self.model)
            .system(system_prompt)
            .message(WireMessage::user(user_prompt))
            .tool(ToolDefinitionWire {
                name: tool_name.to_string(),
                description: tool_description.to_string(),
                input_schema,
            });
        if let Some(temperature) = self.temperature {
            request = request.temperature(temperature);
        }
        request.tool_choice = Some(serde_json::json!({
            "type": "tool",
            "name": tool_name,
        }));

        let response = self.client().chat(&request).await?;

        if response.content.is_empty() {
            return Err(AiError::EmptyResponse);
        }

        let value = response
            .tool_input()
            .cloned()
            .ok_or(AiError::NoStructuredOutput)?;

        Ok(Extraction { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_new() {
        let ai = Claude::new("sk-ant-test", "claude-sonnet-4-5-20250929");
        assert_eq!(ai.model(), "claude-sonnet-4-5-20250929");
        assert!(ai.temperature.is_none());
    }

    #[test]
    fn claude_with_base_url() {
        let ai = Claude::new("sk-ant-test", "claude-sonnet-4-5-20250929")
            .with_base_url("https://custom.api.com");
        assert_eq!(ai.base_url, Some("https://custom.api.com".to_string()));
    }

    #[test]
    fn tool_input_picks_first_tool_use() {
        let response: ChatResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "thinking..."},
                {"type": "tool_use", "id": "tu_1", "name": "record", "input": {"ok": true}}
            ],
            "stop_reason": "tool_use"
        }))
        .unwrap();

        assert_eq!(
            response.tool_input(),
            Some(&serde_json::json!({"ok": true}))
        );
    }
}
