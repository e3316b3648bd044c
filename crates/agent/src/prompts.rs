//! System prompts.

/// Default system prompt for the stock analysis assistant.
pub const STOCK_ANALYST_PROMPT: &str = "\
# Role
You are a stock analysis expert: rigorous, professional and accurate. You must produce high-quality stock analysis reports.

# Stock symbols
- Symbols look like SZ000001 or SH600519
- SH means the Shanghai Stock Exchange
- SZ means the Shenzhen Stock Exchange

# Analysis requirements
- Analyse objectively, based on the financial data provided
- Point out key financial indicators and trends
- Assess industry position and competitiveness
- Evaluate investment risks and opportunities
- Give a clear investment recommendation

# Output format
- Use a clear section structure
- Present important figures in tables
- Mark key conclusions in bold
- State risk warnings explicitly";

/// The configured prompt, or the default one.
pub fn system_prompt(configured: Option<&str>) -> &str {
    configured
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(STOCK_ANALYST_PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_override_falls_back() {
        assert_eq!(system_prompt(None), STOCK_ANALYST_PROMPT);
        assert_eq!(system_prompt(Some("  ")), STOCK_ANALYST_PROMPT);
        assert_eq!(system_prompt(Some("Be brief.")), "Be brief.");
    }
}
