//! Post-hoc classification and cleanup of agent output

use std::sync::OnceLock;

use regex::Regex;

/// Agents may mark where their user-facing answer starts
pub const FINAL_RESPONSE_MARKER: &str = "<!-- FINAL_RESPONSE -->";

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn auth_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            r"(?i)authentication_error",
            r"(?i)OAuth token has expired",
            r"API Error: 401\b",
            r"Failed to authenticate",
            r"(?i)invalid.*api.?key",
            r"(?i)unauthorized",
        ])
    })
}

fn narration_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        compile(&[
            r"(?m)^I'll (?:start by )?follow(?:ing)? the [Dd]iscovery [Pp]rotocol.*$",
            r"(?m)^I'll (?:start|begin|process|handle).*$",
            r"(?m)^I need to (?:understand|check|look|read|analyze|investigate).*$",
            r"(?m)^Let me .*$",
            r"(?m)^Now (?:let me|I'll|I need to|I have|I can|that I).*$",
            r"(?m)^(?:First|Next|Finally),? (?:let me|I'll|I need to).*$",
            r"(?m)^Looking at (?:the |this ).*$",
            r"(?m)^Based on (?:my |the ).*$",
            r"(?m)^\[.*?\]$",
            r"(?m)^\[TOOL\].*$",
            r"(?m)^\[TOOL RESULT\].*$",
            r"(?m)^\[TOOL ERROR\].*$",
            r"(?m)^\[LOG\].*$",
            r"(?m)^\[CLI\].*$",
            r"(?m)^\*\*User\*\*:.*$",
            r"(?m)^.*(?:Reading|Loading) (?:manifest|agent|skill).*$",
        ])
    })
}

/// First credential-failure signature found in the output
pub fn detect_auth_failure(output: &str) -> Option<String> {
    auth_patterns()
        .iter()
        .find_map(|re| re.find(output))
        .map(|m| m.as_str().to_string())
}

/// Text after the last [`FINAL_RESPONSE_MARKER`], if present and non-empty
pub fn extract_final_response(output: &str) -> Option<String> {
    let (_, tail) = output.rsplit_once(FINAL_RESPONSE_MARKER)?;
    let tail = tail.trim();
    (!tail.is_empty()).then(|| tail.to_string())
}

/// Remove `[TOOL] ... [TOOL RESULT] ...` spans. A span ends right before a
/// blank line, the next `[TOOL]` annotation or the end of the text.
fn strip_tool_blocks(text: &str) -> String {
    const START: &str = "[TOOL]";
    const RESULT: &str = "[TOOL RESULT]";

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find(START) {
        let start = cursor + offset;
        let Some(result_offset) = text[start + START.len()..].find(RESULT) else {
            break;
        };
        let mut end = start + START.len() + result_offset + RESULT.len();
        while end < text.len()
            && !text[end..].starts_with("\n\n")
            && !text[end..].starts_with("\n[TOOL]")
        {
            end += text[end..].chars().next().map_or(1, char::len_utf8);
        }
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Strip tool annotations and agent narration, keeping the user-facing
/// answer. An explicit final-response marker wins over heuristics.
pub fn clean_agent_output(output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }
    if let Some(final_response) = extract_final_response(output) {
        return final_response;
    }

    let mut cleaned = strip_tool_blocks(output);
    for pattern in narration_patterns() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }

    cleaned
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
