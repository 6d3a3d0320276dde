//! LLM-based activity summarization of agent terminal output.

use crate::extract;
use std::time::Duration;

/// Meaningful lines handed to the summarizer.
const SUMMARY_LINE_BUDGET: usize = 80;

const SYSTEM_PROMPT: &str = "You are a concise status reporter for a software engineering agent. \
Given terminal output from a coding agent session, extract a short summary \
of what happened. Focus on: what the agent did, what was the result, \
are there errors or blockers, what does the agent need next. \
Write 2-5 concise lines in plain text. Do not fabricate information. \
If the output is unclear or empty, say so briefly.";

/// Options for the LLM summarizer.
#[derive(Debug, Clone)]
pub struct SummarizeOptions {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

fn preprocess(raw: &str) -> String {
    let preprocessed = extract::preprocess_output(raw);
    let lines: Vec<&str> = preprocessed.lines().collect();
    let start = lines.len().saturating_sub(SUMMARY_LINE_BUDGET);
    lines[start..].join("\n")
}

/// Summarize terminal output via the Anthropic Messages API.
///
/// Returns `None` on any failure; callers fall back to the regex summary.
pub async fn summarize_output(output: &str, options: &SummarizeOptions) -> Option<String> {
    let preprocessed = preprocess(output);
    if preprocessed.trim().is_empty() {
        return None;
    }

    extract::messages_api_call(
        &options.api_key,
        &options.model,
        options.max_tokens,
        options.timeout,
        SYSTEM_PROMPT,
        &format!("Summarize this agent's terminal output:\n\n```\n{preprocessed}\n```"),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_caps_line_count() {
        let raw = (0..200).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let out = preprocess(&raw);
        assert_eq!(out.lines().count(), SUMMARY_LINE_BUDGET);
        assert!(out.starts_with("line 120"));
    }

    #[test]
    fn preprocess_of_noise_is_empty() {
        assert!(preprocess("────────\n> \n").trim().is_empty());
    }
}
