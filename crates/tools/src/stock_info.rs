//! Stock information tool backed by Xueqiu financial data.
//!
//! One call gathers seven report sections for an A-share symbol and
//! renders them into a single text report for the model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use stockchat_core::error::ToolError;
use stockchat_core::schema::{ParamSpec, ParamType, ParameterSchema, ToolParams};
use stockchat_core::tool::Tool;
use tracing::debug;

use crate::error::{DataSourceError, snippet};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// The report sections, in the order they appear in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinancialSection {
    CashFlow,
    Income,
    Business,
    TopHolders,
    MainIndicator,
    OrgHoldingChange,
    IndustryCompare,
}

impl FinancialSection {
    pub const ALL: [FinancialSection; 7] = [
        FinancialSection::CashFlow,
        FinancialSection::Income,
        FinancialSection::Business,
        FinancialSection::TopHolders,
        FinancialSection::MainIndicator,
        FinancialSection::OrgHoldingChange,
        FinancialSection::IndustryCompare,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            FinancialSection::CashFlow => "Cash flow",
            FinancialSection::Income => "Income statement",
            FinancialSection::Business => "Business composition",
            FinancialSection::TopHolders => "Top ten holders",
            FinancialSection::MainIndicator => "Main indicators",
            FinancialSection::OrgHoldingChange => "Institutional holding changes",
            FinancialSection::IndustryCompare => "Industry comparison",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            FinancialSection::CashFlow => "/v5/stock/finance/cn/cash_flow.json",
            FinancialSection::Income => "/v5/stock/finance/cn/income.json",
            FinancialSection::Business => "/v5/stock/f10/cn/business.json",
            FinancialSection::TopHolders => "/v5/stock/f10/cn/top_holders.json",
            FinancialSection::MainIndicator => "/v5/stock/f10/cn/indicator.json",
            FinancialSection::OrgHoldingChange => "/v5/stock/f10/cn/org_holding/change.json",
            FinancialSection::IndustryCompare => "/v5/stock/f10/cn/industry/compare.json",
        }
    }

    fn query(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            FinancialSection::CashFlow => &[("type", "all"), ("is_detail", "true"), ("count", "5")],
            FinancialSection::Income => &[("type", "Q4"), ("is_detail", "true"), ("count", "1")],
            FinancialSection::Business => &[("count", "1")],
            FinancialSection::TopHolders => &[("circula", "0")],
            FinancialSection::MainIndicator => &[],
            FinancialSection::OrgHoldingChange => &[],
            FinancialSection::IndustryCompare => &[("type", "single")],
        }
    }

    /// Pull the interesting part out of a `{"data": {...}}` envelope.
    fn payload(&self, body: &Value) -> Value {
        let data = &body["data"];
        let picked = match self {
            FinancialSection::CashFlow | FinancialSection::Income | FinancialSection::Business => &data["list"],
            FinancialSection::TopHolders | FinancialSection::OrgHoldingChange => &data["items"],
            FinancialSection::MainIndicator | FinancialSection::IndustryCompare => data,
        };
        picked.clone()
    }
}

/// Where financial sections come from.
#[async_trait]
pub trait FinancialDataSource: Send + Sync {
    async fn fetch(&self, section: FinancialSection, symbol: &str) -> Result<Value, DataSourceError>;
}

/// HTTP client for the Xueqiu (snowball) stock API.
pub struct XueqiuClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl XueqiuClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, DataSourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }
}

#[async_trait]
impl FinancialDataSource for XueqiuClient {
    async fn fetch(&self, section: FinancialSection, symbol: &str) -> Result<Value, DataSourceError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| DataSourceError::MissingCredentials("xq_a_token is not configured".into()))?;

        let url = format!("{}{}", self.base_url, section.path());
        debug!(section = section.title(), symbol, "Fetching Xueqiu section");

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .query(section.query())
            .header(reqwest::header::COOKIE, format!("xq_a_token={token}"))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(DataSourceError::Status {
                code: status.as_u16(),
                body: snippet(&text),
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| DataSourceError::Decode(format!("{}: {e}", section.title())))?;
        check_error_code(&body)?;
        Ok(section.payload(&body))
    }
}

fn check_error_code(body: &Value) -> Result<(), DataSourceError> {
    let code = body["error_code"].as_i64().unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let description = body["error_description"].as_str().unwrap_or("unknown error");
    Err(DataSourceError::Upstream(format!("error_code {code}: {description}")))
}

/// Upper-case and check an exchange-prefixed A-share code like `SH600519`.
pub fn normalize_symbol(raw: &str) -> Result<String, ToolError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(ToolError::invalid("symbol", "stock symbol must not be empty"));
    }
    let exchange = symbol.get(..2).unwrap_or_default();
    let code = symbol.get(2..).unwrap_or_default();
    let valid = matches!(exchange, "SH" | "SZ") && code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit());
    if !valid {
        return Err(ToolError::invalid(
            "symbol",
            format!("'{raw}' is not a symbol like SH600519 or SZ000001"),
        ));
    }
    Ok(symbol)
}

pub struct StockInfoTool {
    source: Arc<dyn FinancialDataSource>,
}

impl StockInfoTool {
    pub fn new(source: Arc<dyn FinancialDataSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for StockInfoTool {
    fn name(&self) -> &str {
        "get_stock_info"
    }

    fn description(&self) -> &str {
        "Get detailed stock information: cash flow, income statement, business composition, \
         top holders, main indicators, institutional holding changes and industry comparison."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().param(ParamSpec::required(
            "symbol",
            ParamType::String,
            "Stock symbol with exchange prefix, e.g. SH600519 (Kweichow Moutai) or SZ000001 (Ping An Bank)",
        ))
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let symbol = normalize_symbol(params.str("symbol").unwrap_or_default())?;

        let fetches = FinancialSection::ALL.iter().map(|section| {
            let symbol = symbol.as_str();
            async move {
                self.source
                    .fetch(*section, symbol)
                    .await
                    .map(|payload| (*section, payload))
                    .map_err(|e| ToolError::failed("get_stock_info", format!("{}: {e}", section.title())))
            }
        });
        let sections = try_join_all(fetches).await?;

        Ok(render_report(&symbol, &sections))
    }
}

fn render_report(symbol: &str, sections: &[(FinancialSection, Value)]) -> String {
    let body = sections
        .iter()
        .map(|(section, payload)| {
            let rendered = match payload {
                Value::Null => "No data".to_string(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            };
            format!("{}:\n{rendered}", section.title())
        })
        .collect::<Vec<_>>()
        .join("\n---\n");
    format!("Stock symbol: {symbol}\n{body}")
}
