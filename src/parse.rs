//! Helpers for turning free-form model output into structured values.
//!
//! Every structured parse returns `Result<T, RawText>`: on failure the caller
//! gets the original text back and must build a deterministic fallback from it.

use serde::de::DeserializeOwned;

/// Model output that could not be parsed into the requested structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawText(pub String);

impl RawText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Slices the outermost `{ ... }` span out of `text`.
pub fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("missing `{{`"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("missing `}}`"))?;
    if end <= start {
        anyhow::bail!("invalid json object span");
    }
    Ok(&text[start..=end])
}

/// Parses the JSON object embedded in `raw`, handing the raw text back on failure.
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Result<T, RawText> {
    let Ok(json) = extract_json_object(raw) else {
        return Err(RawText(raw.to_owned()));
    };
    match serde_json::from_str(json) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::debug!(error = %err, "structured reply did not match schema");
            Err(RawText(raw.to_owned()))
        }
    }
}

/// Extracts bullet (`-`, `*`, `•`, `+`) and numbered (`1.`, `2)`) list items.
pub fn extract_list_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| strip_list_marker(line.trim()))
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

fn strip_list_marker(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "• ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest);
        }
    }

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ")
        .or_else(|| rest.strip_prefix(") "))
        .or_else(|| rest.strip_prefix(": "))
}

/// Drops a surrounding Markdown code fence, if the whole reply is fenced.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body_start) = rest.find('\n') else {
        return trimmed;
    };
    let body = &rest[body_start + 1..];
    body.strip_suffix("```").unwrap_or(body).trim()
}
