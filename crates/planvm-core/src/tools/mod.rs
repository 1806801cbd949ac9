//! Tool abstraction: named external capabilities callable from `calling`
//! instructions, plus per-task namespace allow-lists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, VmError};

/// Shape of a tool's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// A single value bound to one output variable.
    Single,
    /// A mapping whose entries are unpacked into several output variables.
    Keyed,
}

/// Registration metadata: name, schema and a description for the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub name: String,
    pub description: String,
    /// Argument names that must be present in `tool_params`.
    pub required_params: Vec<String>,
    pub result: ResultShape,
}

impl ToolMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_params: Vec::new(),
            result: ResultShape::Single,
        }
    }

    pub fn with_required(mut self, params: &[&str]) -> Self {
        self.required_params = params.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_result(mut self, result: ResultShape) -> Self {
        self.result = result;
        self
    }
}

/// A named callable. Implementations must be idempotent from the engine's
/// viewpoint: repeated calls are treated as independent.
#[async_trait]
pub trait Tool: Send + Sync {
    fn meta(&self) -> ToolMeta;

    /// Execute with fully interpolated parameters.
    async fn invoke(&self, params: Map<String, Value>) -> Result<Value, VmError>;
}

/// Check that every required argument is present. Tools call this at the top
/// of `invoke`.
pub fn require_params(meta: &ToolMeta, params: &Map<String, Value>) -> Result<(), VmError> {
    for name in &meta.required_params {
        if !params.contains_key(name) {
            return Err(VmError::tool_failed(format!(
                "tool '{}' missing required parameter '{}'",
                meta.name, name
            )));
        }
    }
    Ok(())
}

/// Registry mapping tool names to handlers. Read-only after startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.meta().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata of every registered tool, for planner prompts.
    pub fn catalog(&self) -> Vec<ToolMeta> {
        let mut metas: Vec<ToolMeta> = self.tools.values().map(|t| t.meta()).collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// Resolve a tool for a task, enforcing namespace visibility.
    pub fn resolve(&self, name: &str, namespace: &Namespace) -> Result<Arc<dyn Tool>, VmError> {
        let Some(tool) = self.get(name) else {
            return Err(VmError::new(
                ErrorKind::ToolNotFound,
                format!("tool '{}' is not registered", name),
            ));
        };
        if !namespace.allows(name) {
            return Err(VmError::new(
                ErrorKind::ToolNotAllowed,
                format!(
                    "tool '{}' is not visible in namespace '{}'",
                    name, namespace.name
                ),
            ));
        }
        Ok(tool)
    }

    /// The subset of the catalog visible to a namespace.
    pub fn catalog_for(&self, namespace: &Namespace) -> Vec<ToolMeta> {
        self.catalog()
            .into_iter()
            .filter(|meta| namespace.allows(&meta.name))
            .collect()
    }
}

/// Name of the namespace every task falls back to.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A named allow-list of tool names constraining a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub allowed_tools: Vec<String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, allowed_tools: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            allowed_tools,
        }
    }

    /// The default namespace exposes the three base tools.
    pub fn default_namespace() -> Self {
        Self {
            name: DEFAULT_NAMESPACE.to_string(),
            description: "Base tools available to every task".to_string(),
            allowed_tools: vec![
                "llm_generate".to_string(),
                "retrieve_knowledge_graph".to_string(),
                "vector_search".to_string(),
            ],
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn meta(&self) -> ToolMeta {
            ToolMeta::new("echo", "returns its input").with_required(&["text"])
        }

        async fn invoke(&self, params: Map<String, Value>) -> Result<Value, VmError> {
            require_params(&self.meta(), &params)?;
            Ok(params["text"].clone())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[test]
    fn test_resolve_checks_registry_and_namespace() {
        let registry = registry();
        let open = Namespace::new("open", vec!["echo".to_string()]);
        let closed = Namespace::new("closed", vec![]);

        assert!(registry.resolve("echo", &open).is_ok());

        let err = match registry.resolve("echo", &closed) {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert_eq!(err.kind, ErrorKind::ToolNotAllowed);

        let err = match registry.resolve("nope", &open) {
            Err(e) => e,
            Ok(_) => panic!("expected resolve to fail"),
        };
        assert_eq!(err.kind, ErrorKind::ToolNotFound);
    }

    #[test]
    fn test_require_params_reports_missing_argument() {
        tokio_test::block_on(async {
            let tool = EchoTool;
            let err = tool.invoke(Map::new()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::ToolFailed);
            assert!(err.message.contains("text"));

            let mut params = Map::new();
            params.insert("text".to_string(), json!("hi"));
            assert_eq!(tool.invoke(params).await.unwrap(), json!("hi"));
        });
    }

    #[test]
    fn test_default_namespace_exposes_base_tools() {
        let ns = Namespace::default_namespace();
        assert!(ns.allows("llm_generate"));
        assert!(ns.allows("retrieve_knowledge_graph"));
        assert!(ns.allows("vector_search"));
        assert!(!ns.allows("shell"));
    }
}
