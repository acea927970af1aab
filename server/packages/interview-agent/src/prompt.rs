use crate::types::CodeContext;

const INTERROGATIVES: &[&str] = &["what", "why", "how", "when", "where", "which", "who"];
const CODE_CONSTRUCTS: &[&str] = &["function", "class", "variable", "error", "bug", "implement"];

/// Prepends the candidate's current file to the message.
pub fn enrich_message(message: &str, context: Option<&CodeContext>) -> String {
    let Some(context) = context else {
        return message.to_string();
    };
    let file_name = context.file_name.as_deref().unwrap_or("untitled");
    let language = context.language.as_deref().unwrap_or("");
    format!(
        "Current file: {file_name}\n```{language}\n{}\n```\n\n{message}",
        context.content.trim_end()
    )
}

/// Heuristic score in `[1, 5]` for how well a candidate phrased a request.
pub fn prompt_quality_score(message: &str, has_code_context: bool) -> f32 {
    let words: Vec<String> = message
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_ascii_lowercase()
        })
        .collect();
    let word_count = words.len();
    let lower = message.to_ascii_lowercase();

    let mut score = 3.0_f32;
    if word_count < 5 {
        score -= 1.0;
    }
    if has_code_context {
        score += 0.5;
    }
    let asks_question = message.contains('?')
        || words
            .iter()
            .any(|word| INTERROGATIVES.contains(&word.as_str()));
    if asks_question {
        score += 0.5;
    }
    if CODE_CONSTRUCTS.iter().any(|construct| lower.contains(construct)) {
        score += 0.5;
    }
    if (10..=50).contains(&word_count) {
        score += 0.5;
    }
    if word_count > 100 {
        score -= 0.5;
    }
    score.clamp(1.0, 5.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CodeContext {
        CodeContext {
            file_name: Some("solution.py".to_string()),
            language: Some("python".to_string()),
            content: "def solve(xs):\n    return xs[0]\n".to_string(),
        }
    }

    #[test]
    fn short_message_scores_two() {
        assert_eq!(prompt_quality_score("fix", false), 2.0);
    }

    #[test]
    fn well_formed_question_scores_five() {
        let message = "why does this function throw an error when called with empty input?";
        assert_eq!(prompt_quality_score(message, true), 5.0);
    }

    #[test]
    fn long_rambling_message_is_penalized() {
        let message = "word ".repeat(120);
        assert_eq!(prompt_quality_score(&message, false), 2.5);
    }

    #[test]
    fn score_never_leaves_range() {
        assert!(prompt_quality_score("", false) >= 1.0);
        let message = "How should I implement this class so the bug in the function goes away?";
        assert!(prompt_quality_score(message, true) <= 5.0);
    }

    #[test]
    fn enrichment_prepends_code_block() {
        let enriched = enrich_message("What is wrong?", Some(&context()));
        assert_eq!(
            enriched,
            "Current file: solution.py\n```python\ndef solve(xs):\n    return xs[0]\n```\n\nWhat is wrong?"
        );
        assert_eq!(enrich_message("hi", None), "hi");
    }
}
