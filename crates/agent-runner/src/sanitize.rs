//! Redaction of secrets that leak into tool output

use std::sync::OnceLock;

use regex::Regex;

const REDACTED: &str = "***REDACTED***";

struct Rule {
    pattern: Regex,
    replacement: String,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"(?i)(JIRA_API_TOKEN|JIRA_EMAIL|GITHUB_TOKEN|SLACK_BOT_TOKEN|SLACK_WEBHOOK_SECRET|GITHUB_WEBHOOK_SECRET|JIRA_WEBHOOK_SECRET)\s*=\s*(\S+)",
                format!("${{1}}={}", REDACTED),
            ),
            (
                r"(?i)(password|passwd|pwd|token|secret|api_key|apikey|access_token|refresh_token)\s*[:=]\s*(\S+)",
                format!("${{1}}={}", REDACTED),
            ),
            (
                r"(?i)(Authorization:\s*Bearer\s+)(\S+)",
                format!("${{1}}{}", REDACTED),
            ),
            (
                r"(?i)(Authorization:\s*Basic\s+)(\S+)",
                format!("${{1}}{}", REDACTED),
            ),
            (
                r#"(?i)(["']?token["']?\s*[:=]\s*["']?)([^"'\s]+)(["']?)"#,
                format!("${{1}}{}${{3}}", REDACTED),
            ),
            (
                r#"(?i)(["']?password["']?\s*[:=]\s*["']?)([^"'\s]+)(["']?)"#,
                format!("${{1}}{}${{3}}", REDACTED),
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|pattern| Rule {
                pattern,
                replacement,
            })
        })
        .collect()
    })
}

fn indicators() -> &'static [Regex] {
    static INDICATORS: OnceLock<Vec<Regex>> = OnceLock::new();
    INDICATORS.get_or_init(|| {
        [
            r"(?i)JIRA_API_TOKEN\s*=",
            r"(?i)GITHUB_TOKEN\s*=",
            r"(?i)SLACK_BOT_TOKEN\s*=",
            r#"(?i)password["']?\s*[:=]"#,
            r#"(?i)token["']?\s*[:=]"#,
            r#"(?i)secret["']?\s*[:=]"#,
            r"(?i)Authorization:\s*(Bearer|Basic)",
        ]
        .into_iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Cheap screen run before [`sanitize_sensitive_content`]
pub fn contains_sensitive_data(content: &str) -> bool {
    !content.is_empty() && indicators().iter().any(|re| re.is_match(content))
}

/// Replace secret values with a redaction marker, keeping the key visible
pub fn sanitize_sensitive_content(content: &str) -> String {
    rules().iter().fold(content.to_string(), |text, rule| {
        rule.pattern
            .replace_all(&text, rule.replacement.as_str())
            .into_owned()
    })
}

/// Screen and redact in one step
pub fn redact(content: &str) -> String {
    if contains_sensitive_data(content) {
        sanitize_sensitive_content(content)
    } else {
        content.to_string()
    }
}
