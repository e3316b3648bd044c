//! arXiv paper search tool.
//!
//! Queries the public arXiv API (an Atom feed) for the newest papers
//! matching a query and formats them for the model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stockchat_core::error::ToolError;
use stockchat_core::schema::{ParamSpec, ParamType, ParameterSchema, ToolParams};
use stockchat_core::tool::Tool;
use tracing::debug;

use crate::error::{DataSourceError, snippet};

pub const DEFAULT_NUM_PAPERS: i64 = 5;

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Paper {
    pub title: String,
    pub authors: Vec<String>,
    pub summary: String,
    /// Submission date as `YYYY-MM-DD`.
    pub published: Option<String>,
    pub link: String,
}

/// Where papers come from.
#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, DataSourceError>;
}

/// HTTP client for the arXiv query API.
pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
}

impl ArxivClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<Paper>, DataSourceError> {
        debug!(query, max_results, "Searching arXiv");
        let max_results = max_results.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", query),
                ("start", "0"),
                ("max_results", max_results.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DataSourceError::Status {
                code: status.as_u16(),
                body: snippet(&body),
            });
        }
        parse_feed(&body)
    }
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(rename = "author", default)]
    authors: Vec<AtomAuthor>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    #[serde(default)]
    name: String,
}

/// Parse an arXiv Atom feed into papers.
///
/// arXiv reports query errors as a feed with a single entry whose id
/// points at `/api/errors`; that is returned as an upstream error.
pub fn parse_feed(xml: &str) -> Result<Vec<Paper>, DataSourceError> {
    let feed: AtomFeed = quick_xml::de::from_str(xml).map_err(|e| DataSourceError::Decode(e.to_string()))?;

    if let Some(error) = feed.entries.iter().find(|e| e.id.contains("/api/errors")) {
        return Err(DataSourceError::Upstream(collapse_whitespace(&error.summary)));
    }

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| Paper {
            title: collapse_whitespace(&entry.title),
            authors: entry
                .authors
                .iter()
                .map(|a| collapse_whitespace(&a.name))
                .filter(|name| !name.is_empty())
                .collect(),
            summary: collapse_whitespace(&entry.summary),
            published: entry
                .published
                .as_deref()
                .map(str::trim)
                .and_then(|p| p.get(..10))
                .map(str::to_string),
            link: entry.id.trim().to_string(),
        })
        .collect())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct ArxivSearchTool {
    source: Arc<dyn PaperSource>,
    max_papers: u32,
}

impl ArxivSearchTool {
    pub fn new(source: Arc<dyn PaperSource>, max_papers: u32) -> Self {
        Self {
            source,
            max_papers: max_papers.max(1),
        }
    }
}

#[async_trait]
impl Tool for ArxivSearchTool {
    fn name(&self) -> &str {
        "search_arxiv_papers"
    }

    fn description(&self) -> &str {
        "Search arXiv for academic papers and return the most recent matching papers."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .param(ParamSpec::required(
                "query",
                ParamType::String,
                "Search keywords (must be in English)",
            ))
            .param(
                ParamSpec::optional("num_papers", ParamType::Integer, "Number of papers to return")
                    .with_default(serde_json::json!(DEFAULT_NUM_PAPERS)),
            )
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let query = params.str("query").unwrap_or_default().trim();
        if query.is_empty() {
            return Err(ToolError::invalid("query", "search query must not be empty"));
        }
        let requested = params.i64("num_papers").unwrap_or(DEFAULT_NUM_PAPERS);
        if requested <= 0 {
            return Err(ToolError::invalid("num_papers", "must be a positive integer"));
        }
        let num_papers = u32::try_from(requested).unwrap_or(u32::MAX).min(self.max_papers);
        if i64::from(num_papers) < requested {
            debug!(requested, num_papers, "Clamped arXiv result count");
        }

        let papers = self
            .source
            .search(query, num_papers)
            .await
            .map_err(|e| ToolError::failed("search_arxiv_papers", e))?;

        if papers.is_empty() {
            return Ok(format!("No papers found for '{query}'"));
        }
        Ok(papers.iter().map(format_paper).collect::<Vec<_>>().join("\n\n"))
    }
}

fn format_paper(paper: &Paper) -> String {
    let authors = if paper.authors.is_empty() {
        "unknown".to_string()
    } else {
        paper.authors.join(", ")
    };
    format!(
        "Title: {}\nAuthors: {}\nSummary: {}\nPublished: {}\nLink: {}\n{}",
        paper.title,
        authors,
        paper.summary,
        paper.published.as_deref().unwrap_or("unknown"),
        paper.link,
        "-".repeat(80),
    )
}
