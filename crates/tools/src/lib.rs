//! Tool implementations for stockchat.
//!
//! Two tools are available to the model:
//! - `get_stock_info`: financial report sections for an A-share symbol (Xueqiu)
//! - `search_arxiv_papers`: newest arXiv papers for a query
//!
//! Both sit on a data-source trait so tests can swap in fakes. The HTTP
//! clients are built once in [`ToolClients`] and shared read-only; every
//! session gets its own [`ToolRegistry`] on top of them.

pub mod arxiv_search;
pub mod error;
pub mod stock_info;

use std::sync::Arc;
use std::time::Duration;

use stockchat_config::ToolsConfig;
use stockchat_core::error::ToolError;
use stockchat_core::tool::ToolRegistry;

pub use arxiv_search::{ArxivClient, ArxivSearchTool, Paper, PaperSource};
pub use error::DataSourceError;
pub use stock_info::{FinancialDataSource, FinancialSection, StockInfoTool, XueqiuClient};

/// Shared upstream clients behind the tools.
#[derive(Clone)]
pub struct ToolClients {
    pub financial: Arc<dyn FinancialDataSource>,
    pub papers: Arc<dyn PaperSource>,
    pub max_papers: u32,
}

impl ToolClients {
    pub fn new(financial: Arc<dyn FinancialDataSource>, papers: Arc<dyn PaperSource>, max_papers: u32) -> Self {
        Self {
            financial,
            papers,
            max_papers,
        }
    }

    /// Build the real HTTP clients from configuration.
    pub fn from_config(config: &ToolsConfig) -> Result<Self, DataSourceError> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let financial = XueqiuClient::new(&config.xueqiu_base_url, config.xueqiu_token.clone(), timeout)?;
        let papers = ArxivClient::new(&config.arxiv_base_url, timeout)?;
        if config.xueqiu_token.is_none() {
            tracing::warn!("No Xueqiu token configured; get_stock_info calls will fail");
        }
        Ok(Self::new(Arc::new(financial), Arc::new(papers), config.max_papers))
    }

    /// A fresh registry holding both tools, in advertisement order.
    pub fn registry(&self, tool_timeout: Option<Duration>) -> Result<ToolRegistry, ToolError> {
        let mut registry = ToolRegistry::new();
        if let Some(timeout) = tool_timeout {
            registry = registry.with_timeout(timeout);
        }
        registry.register(Box::new(StockInfoTool::new(Arc::clone(&self.financial))))?;
        registry.register(Box::new(ArxivSearchTool::new(Arc::clone(&self.papers), self.max_papers)))?;
        Ok(registry)
    }
}

/// Create a registry with both tools backed by the configured HTTP clients.
pub fn default_registry(config: &ToolsConfig) -> Result<ToolRegistry, ToolError> {
    let clients = ToolClients::from_config(config).map_err(|e| ToolError::failed("registry", e))?;
    clients.registry(None)
}
