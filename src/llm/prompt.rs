//! Prompt construction and response parsing for LLM classification.

use serde::Deserialize;

/// Max tokens for the classification call (runs on every unmatched message).
pub const CLASSIFY_MAX_TOKENS: u64 = 256;

/// Temperature for classification.
pub const CLASSIFY_TEMPERATURE: f64 = 0.0;

/// Characters of body preview sent to the model.
const BODY_PREVIEW_CHARS: usize = 1000;

pub const SYSTEM_PROMPT: &str = "You are an email labelling engine. \
You are given an email subject, a body preview, and a list of allowed label names. \
Choose every label that clearly applies.\n\n\
Respond with ONLY a JSON object, one of:\n\
{\"labels\": [\"<label>\", ...]}\n\
{\"unclassifiable\": true}\n\n\
Rules:\n\
- Only use label names from the allowed list, spelled exactly\n\
- An empty list is fine when nothing applies\n\
- Use unclassifiable only when the content is unreadable or empty";

/// Build the user prompt for one message.
pub fn build_user_prompt(subject: &str, body_preview: &str, candidates: &[String]) -> String {
    let mut prompt = String::with_capacity(512);

    prompt.push_str("Allowed labels:\n");
    for name in candidates {
        prompt.push_str(&format!("- {}\n", name));
    }

    prompt.push_str(&format!("\nSubject: {}\n", subject));

    let preview: String = body_preview.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nBody:\n{}", preview));

    prompt
}

/// Raw model reply.
#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    unclassifiable: bool,
}

/// Parse a model reply into a verdict, keeping only names in `candidates`.
///
/// Names are matched case-insensitively and returned in their configured spelling.
pub fn parse_verdict(raw: &str, candidates: &[String]) -> Result<super::LlmVerdict, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    if response.unclassifiable {
        return Ok(super::LlmVerdict::Unclassifiable);
    }

    let mut labels: Vec<String> = Vec::new();
    for suggested in &response.labels {
        let Some(name) = candidates
            .iter()
            .find(|c| c.eq_ignore_ascii_case(suggested.trim()))
        else {
            tracing::debug!(label = %suggested, "Dropping label outside candidate set");
            continue;
        };
        if !labels.contains(name) {
            labels.push(name.clone());
        }
    }

    Ok(super::LlmVerdict::Labels(labels))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
