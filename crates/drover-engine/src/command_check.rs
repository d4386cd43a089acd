//! Syntactic gate for substitute commands.
//!
//! Reasoning backends are told to return a bare executable command, but they
//! occasionally return prose instructions anyway. Anything that fails this
//! check is discarded in favor of the original command rather than executed.

use std::sync::OnceLock;

use regex::Regex;

const MAX_COMMAND_LEN: usize = 200;

/// Phrases that mark instructional prose rather than a command.
const INSTRUCTION_PHRASES: &[&str] = &[
    "run this",
    "try running",
    "execute this",
    "start the",
    "in a separate",
    "in the background",
    "then run",
    "first run",
    "make sure",
    "please run",
    "you should",
    "to do this",
    "need to",
    "should be",
    "might need",
];

fn leading_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_/.-]+(\s|$)").expect("valid regex"))
}

/// Whether `text` looks like a single executable command rather than
/// instructions for a human.
pub fn is_executable_command(text: &str) -> bool {
    let cmd = text.trim();
    if cmd.is_empty() {
        return false;
    }

    let lower = cmd.to_lowercase();
    if INSTRUCTION_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }

    // Must open with something shaped like a program name.
    if !leading_token_re().is_match(cmd) {
        return false;
    }

    if cmd.len() > MAX_COMMAND_LEN {
        return false;
    }

    // Multi-sentence text is prose, not a command.
    if cmd.contains(". ") && !cmd.ends_with('.') {
        return false;
    }

    true
}
