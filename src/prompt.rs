//! Grounded prompt assembly.
//!
//! Section order and the refusal sentence are a fixed contract with every
//! answering provider.

use crate::error::AskError;

pub const REFUSAL_SENTENCE: &str =
    "I could not find enough information in the document to answer that question.";

pub const EXCERPT_HEADING: &str = "Primary excerpt (highlighted):";
pub const SUPPLEMENTARY_HEADING: &str = "Supplementary relevant context:";
pub const QUESTION_HEADING: &str = "Question:";

pub const MAX_CONTEXT_CHARS: usize = 10_000;
pub const MAX_QUESTION_CHARS: usize = 1_000;

/// Excerpt and supplementary sections, omitting whichever is empty.
pub fn grounding_context(excerpt: &str, supplementary: &[String]) -> String {
    let mut sections = Vec::with_capacity(2);

    let excerpt = excerpt.trim();
    if !excerpt.is_empty() {
        sections.push(format!("{EXCERPT_HEADING}\n{excerpt}"));
    }

    if !supplementary.is_empty() {
        sections.push(format!("{SUPPLEMENTARY_HEADING}\n{}", supplementary.join("\n\n")));
    }

    sections.join("\n\n")
}

/// Full prompt from an already assembled grounding context.
pub fn assemble_prompt(context: &str, question: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    let context = context.trim();
    if !context.is_empty() {
        parts.push(context.to_string());
    }
    parts.push(format!("{QUESTION_HEADING}\n{}", question.trim()));
    parts.push(grounding_instruction());
    parts.join("\n\n")
}

pub fn build_prompt(excerpt: &str, supplementary: &[String], question: &str) -> String {
    assemble_prompt(&grounding_context(excerpt, supplementary), question)
}

fn grounding_instruction() -> String {
    format!(
        "Instructions: Answer using the primary excerpt first. Use the supplementary context \
         only if the primary excerpt is insufficient or absent. If neither contains enough \
         information, reply exactly: \"{REFUSAL_SENTENCE}\""
    )
}

/// Trimmed question, or a validation error for blank or oversized input.
pub fn validate_question(question: &str) -> Result<&str, AskError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AskError::Validation("question must not be empty".to_string()));
    }

    let len = question.chars().count();
    if len > MAX_QUESTION_CHARS {
        return Err(AskError::Validation(format!(
            "question is {len} characters; the limit is {MAX_QUESTION_CHARS}"
        )));
    }

    Ok(question)
}

pub fn validate_context(context: &str) -> Result<(), AskError> {
    let len = context.chars().count();
    if len > MAX_CONTEXT_CHARS {
        return Err(AskError::Validation(format!(
            "context is {len} characters; the limit is {MAX_CONTEXT_CHARS}"
        )));
    }
    Ok(())
}
