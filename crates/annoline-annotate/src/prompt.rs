//! Prompt construction and expression extraction

use std::io;
use std::path::Path;

/// System prompt used when no guideline document is configured.
pub const DEFAULT_GUIDELINE: &str = "\
You convert English sentences into MeTTa expressions.
Represent entities as symbols and relations as s-expressions of the form
(relation subject object). Use lowercase, hyphen-separated symbols.
Emit one expression per line and nothing else.";

const FENCE: &str = "```";

/// Read the guideline document, falling back to [`DEFAULT_GUIDELINE`].
pub fn load_guideline(path: Option<&Path>) -> io::Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p),
        None => Ok(DEFAULT_GUIDELINE.to_string()),
    }
}

/// User message for a sentence, with optional extra context appended.
pub fn user_prompt(text: &str, context: Option<&str>) -> String {
    let mut prompt = format!(
        "Turn the following statement into MeTTa expressions that represents the same meaning: \
         \"{text}\". Return only valid MeTTa expressions with no comments."
    );
    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(ctx);
    }
    prompt
}

/// Context for the second sentence of a pair, so both expressions share symbols.
pub fn pair_context(premise: &str, premise_expression: &str, hypothesis: &str) -> String {
    format!(
        "The premise \"{premise}\" was already converted into this MeTTa expression:\n\
         {premise_expression}\n\
         Now convert the hypothesis \"{hypothesis}\" reusing the same symbols, so the two \
         expressions can be checked against each other for contradiction."
    )
}

/// Drop a leading and a trailing code-fence line, then trim.
///
/// Only whole lines are dropped; backticks inside the expression survive.
pub fn strip_code_fence(raw: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if lines.first().is_some_and(|l| l.contains(FENCE)) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.contains(FENCE)) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Why a response held no usable expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("response had no content")]
    NoContent,
    #[error("response held no expression after removing code fences")]
    EmptyExpression,
}

/// Fence-stripped, non-empty expression from a model response.
pub fn extract_expression(content: Option<&str>) -> Result<String, ExtractError> {
    let content = content.filter(|c| !c.is_empty()).ok_or(ExtractError::NoContent)?;
    let expression = strip_code_fence(content);
    if expression.is_empty() {
        return Err(ExtractError::EmptyExpression);
    }
    Ok(expression)
}
