//! Tool trait and registry.
//!
//! Tools are what let the model reach outside the conversation: fetch a
//! company's financial statements, search recent papers, and so on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use crate::schema::{ParameterSchema, ToolParams};

/// The core Tool trait.
///
/// Each adapter implements this trait and is registered in a
/// [`ToolRegistry`]. `execute` receives arguments that already passed the
/// tool's [`ParameterSchema`] and returns one flattened text result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "get_stock_info").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// Declared parameters.
    fn parameters(&self) -> ParameterSchema;

    /// Execute the tool with validated parameters.
    async fn execute(&self, params: ToolParams) -> Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Per-tool call counters.
#[derive(Debug, Default)]
struct ToolStats {
    calls: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

impl ToolStats {
    fn record(&self, elapsed: Duration, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self, name: &str) -> ToolStatsSnapshot {
        let call_count = self.calls.load(Ordering::Relaxed);
        let total_ms = self.total_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        ToolStatsSnapshot {
            name: name.to_string(),
            call_count,
            failure_count: self.failures.load(Ordering::Relaxed),
            total_duration_ms: total_ms,
            avg_duration_ms: if call_count == 0 {
                0.0
            } else {
                total_ms / call_count as f64
            },
        }
    }
}

/// Point-in-time view of one tool's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatsSnapshot {
    pub name: String,
    pub call_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
}

struct RegisteredTool {
    tool: Box<dyn Tool>,
    definition: ToolDefinition,
    stats: ToolStats,
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the model, in registration order
/// 2. Validate and dispatch the calls the model makes
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
    timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            timeout: None,
        }
    }

    /// Bound every dispatch by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let definition = tool.to_definition();
        if self.index.contains_key(&definition.name) {
            return Err(ToolError::Duplicate(definition.name));
        }
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            tool,
            definition,
            stats: ToolStats::default(),
        });
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.entry(name).map(|t| t.tool.as_ref())
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// All tool definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    /// List all registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.definition.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `arguments` against the tool's schema and run it.
    pub async fn dispatch(&self, name: &str, arguments: &serde_json::Value) -> Result<String, ToolError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let started = Instant::now();
        let result = match entry.definition.parameters.validate(arguments) {
            Ok(params) => self.run(entry, params).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();
        entry.stats.record(elapsed, result.is_ok());

        match &result {
            Ok(output) => info!(
                tool = name,
                duration_ms = elapsed.as_millis() as u64,
                output_len = output.len(),
                "Tool executed"
            ),
            Err(e) => warn!(
                tool = name,
                duration_ms = elapsed.as_millis() as u64,
                error = %e,
                "Tool failed"
            ),
        }
        result
    }

    async fn run(&self, entry: &RegisteredTool, params: ToolParams) -> Result<String, ToolError> {
        debug!(tool = %entry.definition.name, ?params, "Dispatching tool");
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, entry.tool.execute(params))
                .await
                .unwrap_or_else(|_| {
                    Err(ToolError::Timeout {
                        tool_name: entry.definition.name.clone(),
                        timeout_secs: limit.as_secs(),
                    })
                }),
            None => entry.tool.execute(params).await,
        }
    }

    /// Call counters for every registered tool.
    pub fn stats(&self) -> Vec<ToolStatsSnapshot> {
        self.tools
            .iter()
            .map(|t| t.stats.snapshot(&t.definition.name))
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ParamSpec, ParamType};
    use serde_json::json;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters(&self) -> ParameterSchema {
            ParameterSchema::new().param(ParamSpec::required("text", ParamType::String, "Text to echo"))
        }
        async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
            Ok(params.str("text").unwrap_or_default().to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> ParameterSchema {
            ParameterSchema::new()
        }
        async fn execute(&self, _params: ToolParams) -> Result<String, ToolError> {
            Err(ToolError::failed("flaky", "upstream returned 502"))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes in time"
        }
        fn parameters(&self) -> ParameterSchema {
            ParameterSchema::new()
        }
        async fn execute(&self, _params: ToolParams) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        let err = registry.register(Box::new(EchoTool)).unwrap_err();
        assert_eq!(err, ToolError::Duplicate("echo".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn definitions_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FailingTool)).unwrap();
        registry.register(Box::new(EchoTool)).unwrap();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["flaky", "echo"]);
        assert_eq!(registry.names(), vec!["flaky", "echo"]);
    }

    #[test]
    fn registered_definition_listed_once_unchanged() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs.iter().filter(|d| d.name == "echo").count(), 1);
        assert_eq!(defs[0], EchoTool.to_definition());
    }

    #[tokio::test]
    async fn dispatch_runs_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        let output = registry
            .dispatch("echo", &json!({"text": "hello world"}))
            .await
            .unwrap();
        assert_eq!(output, "hello world");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.dispatch("foo", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(ref n) if n == "foo"));
    }

    #[tokio::test]
    async fn dispatch_validates_before_running() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        let err = registry.dispatch("echo", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref field, .. } if field == "text"));
    }

    #[tokio::test]
    async fn stats_count_calls_and_failures() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        registry.register(Box::new(FailingTool)).unwrap();

        registry.dispatch("echo", &json!({"text": "a"})).await.unwrap();
        registry.dispatch("echo", &json!({"text": "b"})).await.unwrap();
        let _ = registry.dispatch("flaky", &json!({})).await;

        let stats = registry.stats();
        assert_eq!(stats[0].name, "echo");
        assert_eq!(stats[0].call_count, 2);
        assert_eq!(stats[0].failure_count, 0);
        assert_eq!(stats[1].call_count, 1);
        assert_eq!(stats[1].failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out() {
        let mut registry = ToolRegistry::new().with_timeout(Duration::from_secs(5));
        registry.register(Box::new(SlowTool)).unwrap();
        let err = registry.dispatch("slow", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ToolError::Timeout {
                tool_name: "slow".into(),
                timeout_secs: 5
            }
        );
    }
}
