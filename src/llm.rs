//! Chat-completions client for the LLM that drives the bot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://api.z.ai/api/coding/paas/v4";
pub const DEFAULT_MODEL: &str = "glm-4-flash";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Function name, only for `Role::Function` turns.
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), name: None }
    }

    pub fn function(name: &str, content: impl Into<String>) -> Self {
        Self { role: Role::Function, content: content.into(), name: Some(name.to_string()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

/// A callable function advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Empty response")]
    Empty,
}

/// LLM chat capability used by the bot engine.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
    ) -> Result<ProviderResponse, ProviderError>;
}

/// OpenAI-compatible chat-completions client (Z.AI GLM by default).
pub struct Client {
    api_key: String,
    endpoint: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a FunctionSpec,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Deserialize)]
struct ToolFunction {
    name: String,
    /// JSON-encoded argument object.
    arguments: String,
}

impl Client {
    pub fn new(api_key: String, endpoint: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            http: reqwest::Client::new(),
        }
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        functions: &'a [FunctionSpec],
    ) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                    name: m.name.as_deref(),
                })
                .collect(),
            tools: functions
                .iter()
                .map(|f| ApiTool { kind: "function", function: f })
                .collect(),
            stream: false,
        }
    }
}

/// Take the first choice, and its first tool call if any.
fn parse_response(api_response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = api_response.choices.into_iter().next().ok_or(ProviderError::Empty)?;

    let function_call = match choice.message.tool_calls.into_iter().next() {
        Some(call) => {
            let arguments = if call.function.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.function.arguments)
                    .map_err(|e| ProviderError::Parse(format!("function arguments: {e}")))?
            };
            Some(FunctionCall { name: call.function.name, arguments })
        }
        None => None,
    };

    Ok(ProviderResponse {
        content: choice.message.content.unwrap_or_default(),
        function_call,
    })
}

#[async_trait]
impl ChatProvider for Client {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(messages, functions);
        debug!("LLM request: {} messages, {} functions", messages.len(), functions.len());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let client = Client::new("key".into(), None, None);
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::function("searchCars", "Hasil fungsi searchCars: []"),
        ];
        let functions = vec![FunctionSpec {
            name: "searchCars".into(),
            description: "Cari mobil".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];

        let body = serde_json::to_value(client.build_request(&messages, &functions)).unwrap();
        assert_eq!(body["model"], "glm-4-flash");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][2]["role"], "function");
        assert_eq!(body["messages"][2]["name"], "searchCars");
        assert!(body["messages"][0].get("name").is_none());
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "searchCars");
    }

    #[test]
    fn test_request_without_functions_omits_tools() {
        let client = Client::new("key".into(), None, Some("glm-4".into()));
        let messages = vec![ChatMessage::user("hi")];
        let body = serde_json::to_value(client.build_request(&messages, &[])).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["model"], "glm-4");
    }

    #[test]
    fn test_parse_tool_call() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "searchCars", "arguments": "{\"brand\":\"Toyota\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let parsed = parse_response(serde_json::from_value(raw).unwrap()).unwrap();
        let call = parsed.function_call.unwrap();
        assert_eq!(call.name, "searchCars");
        assert_eq!(call.arguments["brand"], "Toyota");
    }

    #[test]
    fn test_parse_plain_text_and_null_content() {
        let raw = json!({"choices": [{"message": {"content": "Halo!"}}]});
        let parsed = parse_response(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(parsed.content, "Halo!");
        assert!(parsed.function_call.is_none());

        let raw = json!({"choices": [{"message": {"content": null}}]});
        let parsed = parse_response(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(parsed.content, "");
    }

    #[test]
    fn test_parse_errors() {
        let raw = json!({"choices": []});
        assert!(matches!(
            parse_response(serde_json::from_value(raw).unwrap()),
            Err(ProviderError::Empty)
        ));

        let raw = json!({"choices": [{"message": {"tool_calls": [
            {"function": {"name": "x", "arguments": "{not json"}}
        ]}}]});
        assert!(matches!(
            parse_response(serde_json::from_value(raw).unwrap()),
            Err(ProviderError::Parse(_))
        ));
    }
}
