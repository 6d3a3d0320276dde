//! Response extraction: turning raw terminal scrollback into a relayable
//! agent message, via the Anthropic Messages API with a regex fallback.

use std::sync::LazyLock;
use std::time::Duration;

/// Budget of preprocessed text handed to the LLM.
const PREPROCESS_CHAR_CAP: usize = 10_000;

/// Regex fallback shape: last 50 meaningful lines, 200 chars each.
const FALLBACK_LINE_COUNT: usize = 50;
const FALLBACK_LINE_WIDTH: usize = 200;

pub static ANSI_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?x)\x1b
        (?:
            \[[0-9;?]*[a-zA-Z]      # CSI sequences (including DEC private modes like ?2026h)
          | \][^\x07]*\x07          # OSC terminated by BEL (e.g. window title)
          | \][^\x1b]*\x1b\\        # OSC terminated by ST (ESC \)
          | [()\#][0-9a-zA-Z]       # Character set / line attrs
          | [a-zA-Z><=]             # Simple ESC sequences
        )",
    )
    .unwrap()
});

static NOISE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?x)
          ^\s*[>❯$\#]\s*$
        | ^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏⣾⣽⣻⢿⡿⣟⣯⣷]
        | ^\s*[|/\-\\]\s\S.{0,30}$
        | ^[\s─━=~_*]{6,}$
        | ^[\s\-]{6,}$
        | ^\s*⏵
        | ^\s*[❯>]\s+\S
        | ^\s*[✢-✿]
        | ^\s*⏺
        ",
    )
    .unwrap()
});

const SYSTEM_PROMPT: &str = "You are extracting an AI coding agent's response from raw terminal output. \
The terminal contains tool calls, file contents, command output, spinner artifacts, \
and UI chrome mixed with the agent's actual response to the user.\n\n\
Extract ONLY the agent's final response text — the message it wrote to communicate \
its results to the user. Exclude:\n\
- Tool call invocations and their output\n\
- File contents being read or written\n\
- Command output (test results, build logs, etc.)\n\
- Spinner lines, progress indicators, UI decorations\n\
- Status lines like 'Read file X' or 'Edit file Y'\n\n\
Return the response text as-is, preserving formatting. \
If you cannot identify a clear response, return the last meaningful \
text the agent produced.";

/// Strip ANSI escape sequences from terminal output.
pub fn strip_ansi(raw: &str) -> String {
    ANSI_RE.replace_all(raw, "").into_owned()
}

fn meaningful_lines(raw: &str) -> Vec<&str> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !NOISE_RE.is_match(line))
        .collect()
}

/// Strip ANSI codes, filter noise lines, and keep the last ~10K chars of
/// meaningful content.
pub fn preprocess_output(raw: &str) -> String {
    let cleaned = strip_ansi(raw);
    let meaningful = meaningful_lines(&cleaned);

    let mut kept: Vec<&str> = Vec::new();
    let mut total = 0;
    for line in meaningful.iter().rev() {
        if total + line.len() + 1 > PREPROCESS_CHAR_CAP {
            break;
        }
        kept.push(line);
        total += line.len() + 1;
    }
    kept.reverse();
    kept.join("\n")
}

/// Regex-based response extraction fallback: the last 50 meaningful lines,
/// each truncated to 200 chars. Returns `None` when nothing meaningful remains.
pub fn extract_response_regex(raw: &str) -> Option<String> {
    let cleaned = strip_ansi(raw);
    let meaningful = meaningful_lines(&cleaned);
    if meaningful.is_empty() {
        return None;
    }
    let start = meaningful.len().saturating_sub(FALLBACK_LINE_COUNT);
    let tail: Vec<String> = meaningful[start..]
        .iter()
        .map(|line| truncate_chars(line, FALLBACK_LINE_WIDTH))
        .collect();
    Some(tail.join("\n"))
}

fn truncate_chars(line: &str, width: usize) -> String {
    line.chars().take(width).collect()
}

/// Options for the LLM extraction path.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// The user's most recent message, included for context when present.
    pub user_question: String,
}

/// Call the Anthropic Messages API to extract the agent's response.
///
/// Returns `None` on any failure (timeout, HTTP error, empty content); the
/// caller falls back to [`extract_response_regex`].
pub async fn extract_response(raw_output: &str, options: &ExtractOptions) -> Option<String> {
    let preprocessed = preprocess_output(raw_output);
    if preprocessed.trim().is_empty() {
        return None;
    }

    let mut prompt = String::new();
    if !options.user_question.trim().is_empty() {
        prompt.push_str(&format!(
            "The user asked:\n{}\n\n",
            options.user_question.trim()
        ));
    }
    prompt.push_str(&format!(
        "Extract the agent's response from this terminal output:\n\n```\n{preprocessed}\n```"
    ));

    messages_api_call(
        &options.api_key,
        &options.model,
        options.max_tokens,
        options.timeout,
        SYSTEM_PROMPT,
        &prompt,
    )
    .await
}

/// Shared Anthropic Messages API call for extraction and summarization.
///
/// Any failure logs at debug and resolves to `None`; LLM assistance is
/// always optional.
pub async fn messages_api_call(
    api_key: &str,
    model: &str,
    max_tokens: u32,
    timeout: Duration,
    system: &str,
    user_content: &str,
) -> Option<String> {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::debug!(%error, "failed to build http client");
            return None;
        }
    };

    let body = serde_json::json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": system,
        "messages": [{"role": "user", "content": user_content}],
    });

    let response = match client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(%error, "messages api call failed");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::debug!(status = %response.status(), "messages api returned error status");
        return None;
    }

    let data: serde_json::Value = match response.json().await {
        Ok(data) => data,
        Err(error) => {
            tracing::debug!(%error, "failed to parse messages api response");
            return None;
        }
    };

    let parts: Vec<&str> = data
        .get("content")?
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn strips_csi_and_osc_sequences() {
        let raw = "\x1b[31mred\x1b[0m \x1b]0;title\x07plain \x1b[?2026hrest";
        assert_eq!(strip_ansi(raw), "red plain rest");
    }

    #[test]
    fn preprocess_drops_noise_lines() {
        let raw = indoc! {"
            ─────────────────────
            ⏺ Read src/main.rs
            ✳ Churning…
            I fixed the login bug by correcting the session check.
            >
        "};
        let out = preprocess_output(raw);
        assert_eq!(out, "I fixed the login bug by correcting the session check.");
    }

    #[test]
    fn preprocess_respects_char_budget() {
        let long_line = "x".repeat(400);
        let raw = (0..100).map(|_| long_line.as_str()).collect::<Vec<_>>().join("\n");
        let out = preprocess_output(&raw);
        assert!(out.len() <= PREPROCESS_CHAR_CAP);
        assert!(!out.is_empty());
    }

    #[test]
    fn regex_extraction_takes_meaningful_tail() {
        let mut lines: Vec<String> = (0..60).map(|i| format!("line number {i}")).collect();
        lines.push("⠋ spinner".into());
        let raw = lines.join("\n");

        let out = extract_response_regex(&raw).unwrap();
        let extracted: Vec<&str> = out.lines().collect();
        assert_eq!(extracted.len(), FALLBACK_LINE_COUNT);
        assert_eq!(extracted[0], "line number 10");
        assert_eq!(*extracted.last().unwrap(), "line number 59");
    }

    #[test]
    fn regex_extraction_truncates_wide_lines() {
        let raw = "y".repeat(500);
        let out = extract_response_regex(&raw).unwrap();
        assert_eq!(out.len(), FALLBACK_LINE_WIDTH);
    }

    #[test]
    fn regex_extraction_returns_none_for_pure_noise() {
        let raw = "────────\n> \n⏺\n";
        assert_eq!(extract_response_regex(raw), None);
        assert_eq!(extract_response_regex(""), None);
    }

    #[test]
    fn tool_invocation_lines_are_noise() {
        assert!(NOISE_RE.is_match("❯ cargo test"));
        assert!(NOISE_RE.is_match("  ✽ Thinking"));
        assert!(!NOISE_RE.is_match("The tests pass now."));
    }
}
