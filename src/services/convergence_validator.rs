//! Completion-criteria analysis for convergence prompts.
//!
//! Pure text functions: whether a prompt declares how a convergence loop
//! ends, and whether a piece of executor output carries the completion
//! promise.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::models::{CompletionType, ValidationConfig, ValidationResult};

/// Phrases that hint at completion without being checkable signals.
const IMPLICIT_COMPLETION_PHRASES: &[&str] = &[
    "all tests pass",
    "tests are passing",
    "build succeeds",
    "build passes",
    "no errors remain",
    "until it works",
    "until done",
];

/// Promise texts too common to be a reliable signal.
const GENERIC_PROMISE_WORDS: &[&str] = &["done", "ok", "okay", "yes", "complete", "completed", "finished", "true"];

fn promise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<promise>\s*(.*?)\s*</promise>").expect("valid promise regex"))
}

fn max_iteration_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)--max-iterations(?:\s+|=)(\d+)",
            r"(?i)\bmax[_ ]iterations\s*[:=]\s*(\d+)",
            r"(?i)\bmaximum\s+of\s+(\d+)\s+iterations?\b",
            r"(?i)\b(\d+)\s+iterations?\s+max(?:imum)?\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid max-iterations regex"))
        .collect()
    })
}

fn when_complete_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:#+\s*)?\**when\s+complete\**\s*:?\**\s*$").expect("valid heading regex")
    })
}

fn bullet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+?)\s*$").expect("valid bullet regex"))
}

/// Text of the first non-empty `<promise>` tag in `output`.
pub fn extract_completion_signal(output: &str) -> Option<String> {
    promise_regex()
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// First positive inline iteration cap in `prompt`.
pub fn find_max_iterations(prompt: &str) -> Option<u32> {
    max_iteration_regexes()
        .iter()
        .filter_map(|re| re.captures(prompt))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .find(|n| *n > 0)
}

/// Bullets under a "When complete:" heading, in order.
pub fn find_success_criteria(prompt: &str) -> Vec<String> {
    let mut lines = prompt.lines().skip_while(|line| !when_complete_regex().is_match(line));
    if lines.next().is_none() {
        return Vec::new();
    }

    let mut criteria = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            if criteria.is_empty() {
                continue;
            }
            break;
        }
        match bullet_regex().captures(line).and_then(|caps| caps.get(1)) {
            Some(item) => criteria.push(item.as_str().to_string()),
            None => break,
        }
    }
    criteria
}

fn find_implicit_phrases(prompt: &str) -> Vec<&'static str> {
    let lower = prompt.to_lowercase();
    IMPLICIT_COMPLETION_PHRASES
        .iter()
        .copied()
        .filter(|phrase| lower.contains(phrase))
        .collect()
}

/// Whether a promise text is too generic to be trusted.
pub fn is_generic_promise(text: &str) -> bool {
    let normalized = text.trim().trim_end_matches(['.', '!']).to_lowercase();
    GENERIC_PROMISE_WORDS.contains(&normalized.as_str())
}

/// Check whether `prompt` declares how a convergence loop terminates.
///
/// Rules apply in precedence order (promise tag, iteration cap, "When
/// complete" criteria, implicit phrases); the first match sets
/// `completion_type`, but every rule is still scanned so later matches can
/// contribute criteria and warnings.
pub fn validate(prompt: &str, config: &ValidationConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if let Some(promise) = extract_completion_signal(prompt) {
        result.is_valid = true;
        result.completion_type = CompletionType::Promise;
        if is_generic_promise(&promise) {
            result.warnings.push(format!(
                "Promise text \"{promise}\" is generic and may appear in output by accident; prefer a distinctive token"
            ));
        }
        result.promise_text = Some(promise);
    } else if promise_regex().is_match(prompt) {
        result.warnings.push("Empty <promise></promise> tag ignored".to_string());
    }

    result.max_iterations = config.max_iterations.filter(|n| *n > 0).or_else(|| find_max_iterations(prompt));
    if result.max_iterations.is_some() && !result.is_valid {
        result.is_valid = true;
        result.completion_type = CompletionType::MaxIterations;
    }

    let criteria = find_success_criteria(prompt);
    if !criteria.is_empty() {
        result.success_criteria = criteria;
        if !result.is_valid {
            result.is_valid = true;
            result.completion_type = CompletionType::Criteria;
        }
    }

    let implicit = find_implicit_phrases(prompt);
    if !implicit.is_empty() {
        if config.strict {
            result.warnings.push(format!(
                "Implicit completion phrase \"{}\" is not an explicit completion signal",
                implicit[0]
            ));
        } else if !result.is_valid {
            result.is_valid = true;
            result.completion_type = CompletionType::Implicit;
        }
    }

    if result.is_valid {
        if result.max_iterations.is_none() {
            result.warnings.push(
                "No iteration cap declared; the loop relies on the configured default to terminate".to_string(),
            );
        }
    } else {
        result.errors.push("No completion criteria found in prompt".to_string());
        result.suggestions = vec![
            "Ask for an explicit completion signal, e.g. \"Output <promise>TESTS_GREEN</promise> when finished\"".to_string(),
            "Add a \"When complete:\" section followed by a bulleted list of verifiable criteria".to_string(),
            "Add an iteration cap, e.g. \"--max-iterations 10\"".to_string(),
        ];
    }

    result
}
