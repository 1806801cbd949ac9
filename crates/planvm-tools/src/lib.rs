//! Builtin tools registered with every engine instance.
//!
//! Three base tools back the standard namespaces: `llm_generate` (text
//! generation through the configured standard model),
//! `retrieve_knowledge_graph` and `vector_search` (HTTP calls to the
//! retrieval service). Additional tools implement
//! [`planvm_core::tools::Tool`] and register the same way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use planvm_core::error::VmError;
use planvm_core::llm::TextGenerator;
use planvm_core::tools::{require_params, ResultShape, Tool, ToolMeta, ToolRegistry};

/// Generate text with the standard model.
///
/// With a single output variable the whole response (text or JSON) is bound
/// to it; with several, the engine passes a `response_format` hint and the
/// reply is unpacked as a keyed mapping.
pub struct LlmGenerateTool {
    generator: Arc<dyn TextGenerator>,
}

impl LlmGenerateTool {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Tool for LlmGenerateTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta::new(
            "llm_generate",
            "Generate a response with the language model. Use ${var} references \
             in the prompt to include earlier results; ask for JSON and list \
             several output_vars to unpack a structured reply.",
        )
        .with_required(&["prompt"])
        .with_result(ResultShape::Keyed)
    }

    async fn invoke(&self, params: Map<String, Value>) -> Result<Value, VmError> {
        require_params(&self.meta(), &params)?;
        let prompt = string_param(&params, "prompt")?;
        let context = match params.get("context") {
            Some(Value::Null) | None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };

        let mut full_prompt = prompt;
        if let Some(format) = params.get("response_format").and_then(Value::as_str) {
            full_prompt.push_str("\n\n");
            full_prompt.push_str(format);
        }

        let reply = self
            .generator
            .generate(&full_prompt, context.as_deref())
            .await?;
        Ok(Value::String(reply))
    }
}

/// Shared configuration for the retrieval-service tools.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Knowledge-base identifier forwarded to the service.
    pub kb_id: Option<String>,
    pub timeout: Duration,
}

impl RetrievalConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            kb_id: None,
            timeout: Duration::from_secs(30),
        }
    }

    fn client(&self) -> Result<reqwest::Client, VmError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| VmError::tool_failed(e.to_string()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

async fn read_json_response(response: reqwest::Response) -> Result<Value, VmError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(VmError::tool_failed(format!("HTTP {}: {}", status, body)));
    }
    response
        .json()
        .await
        .map_err(|e| VmError::tool_failed(format!("invalid JSON response: {}", e)))
}

/// Knowledge-graph lookup: returns nodes and the relationships between them.
pub struct KnowledgeGraphTool {
    config: RetrievalConfig,
}

impl KnowledgeGraphTool {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for KnowledgeGraphTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta::new(
            "retrieve_knowledge_graph",
            "Retrieve entities and relationships from the knowledge graph for \
             a query string.",
        )
        .with_required(&["query"])
        .with_result(ResultShape::Single)
    }

    async fn invoke(&self, params: Map<String, Value>) -> Result<Value, VmError> {
        require_params(&self.meta(), &params)?;
        let query = string_param(&params, "query")?;

        let url = format!("{}/api/v1/graph/search", self.config.base_url);
        let body = json!({
            "query": query,
            "include_meta": false,
            "depth": 2,
            "with_degree": false,
            "kb_id": self.config.kb_id,
        });
        tracing::debug!(%url, "knowledge graph lookup");
        let request = self.config.authorize(self.config.client()?.post(&url)).json(&body);
        let response = request
            .send()
            .await
            .map_err(|e| VmError::tool_failed(format!("graph search request failed: {}", e)))?;
        read_json_response(response).await
    }
}

/// Embedding retrieval over the knowledge base.
pub struct VectorSearchTool {
    config: RetrievalConfig,
}

impl VectorSearchTool {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for VectorSearchTool {
    fn meta(&self) -> ToolMeta {
        ToolMeta::new(
            "vector_search",
            "Retrieve the top_k most similar knowledge chunks for a query \
             string.",
        )
        .with_required(&["query", "top_k"])
        .with_result(ResultShape::Single)
    }

    async fn invoke(&self, params: Map<String, Value>) -> Result<Value, VmError> {
        require_params(&self.meta(), &params)?;
        let query = string_param(&params, "query")?;
        // Forwarded verbatim; the service decides what zero or negative
        // values mean.
        let top_k = params.get("top_k").cloned().unwrap_or(json!(5));

        let url = format!("{}/api/v1/embedding_retrieve", self.config.base_url);
        let mut request = self
            .config
            .authorize(self.config.client()?.get(&url))
            .query(&[("question", query.as_str())])
            .query(&[("top_k", top_k.to_string().as_str())]);
        if let Some(kb_id) = &self.config.kb_id {
            request = request.query(&[("kb_id", kb_id.as_str())]);
        }
        tracing::debug!(%url, top_k = %top_k, "vector search");
        let response = request
            .send()
            .await
            .map_err(|e| VmError::tool_failed(format!("vector search request failed: {}", e)))?;
        read_json_response(response).await
    }
}

fn string_param(params: &Map<String, Value>, name: &str) -> Result<String, VmError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(VmError::tool_failed(format!(
            "missing required parameter '{}'",
            name
        ))),
    }
}

/// Build a registry holding the three base tools.
pub fn base_registry(
    generator: Arc<dyn TextGenerator>,
    retrieval: RetrievalConfig,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(LlmGenerateTool::new(generator)));
    registry.register(Arc::new(KnowledgeGraphTool::new(retrieval.clone())));
    registry.register(Arc::new(VectorSearchTool::new(retrieval)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseGenerator;

    #[async_trait]
    impl TextGenerator for UppercaseGenerator {
        async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String, VmError> {
            Ok(match context {
                Some(context) => format!("{}|{}", prompt.to_uppercase(), context),
                None => prompt.to_uppercase(),
            })
        }
    }

    #[test]
    fn test_llm_generate_combines_prompt_and_response_format() {
        tokio_test::block_on(async {
            let tool = LlmGenerateTool::new(Arc::new(UppercaseGenerator));
            let mut params = Map::new();
            params.insert("prompt".to_string(), json!("hello"));
            params.insert("response_format".to_string(), json!("respond as json"));
            let reply = tool.invoke(params).await.unwrap();
            assert_eq!(reply, json!("HELLO\n\nRESPOND AS JSON"));
        });
    }

    #[test]
    fn test_llm_generate_passes_context() {
        tokio_test::block_on(async {
            let tool = LlmGenerateTool::new(Arc::new(UppercaseGenerator));
            let mut params = Map::new();
            params.insert("prompt".to_string(), json!("hi"));
            params.insert("context".to_string(), json!("background"));
            let reply = tool.invoke(params).await.unwrap();
            assert_eq!(reply, json!("HI|background"));
        });
    }

    #[test]
    fn test_llm_generate_requires_prompt() {
        tokio_test::block_on(async {
            let tool = LlmGenerateTool::new(Arc::new(UppercaseGenerator));
            let err = tool.invoke(Map::new()).await.unwrap_err();
            assert!(err.message.contains("prompt"));
        });
    }

    #[test]
    fn test_base_registry_contains_base_tools() {
        let registry = base_registry(
            Arc::new(UppercaseGenerator),
            RetrievalConfig::new("http://localhost:5000"),
        );
        assert_eq!(
            registry.names(),
            vec!["llm_generate", "retrieve_knowledge_graph", "vector_search"]
        );
    }
}
