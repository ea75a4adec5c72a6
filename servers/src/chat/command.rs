//! # Command Interpreter
//!
//! A pure function classifying an outbound chat payload as ordinary chat or
//! a stock-quote command. No state, trivially unit-tested.

const COMMAND_PREFIX: &str = "/stock=";
const STOCK_CODE_MIN: usize = 1;
const STOCK_CODE_MAX: usize = 20;

/// Result of classifying a trimmed chat payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// An ordinary chat message, to be persisted and broadcast.
    Chat,
    /// A stock-quote command; the code is the conservative-charset token
    /// that followed the `/stock=` prefix.
    Command { stock_code: String },
    /// Began with the command prefix but the remainder failed validation.
    Invalid,
}

/// Classifies `content` (already trimmed by the caller) as chat, command,
/// or invalid.
///
/// Rules:
/// - trimmed content starting with the literal, case-sensitive prefix
///   `/stock=` is a command candidate;
/// - the remainder must be 1–20 chars of `[A-Za-z0-9.-]`, else `Invalid`;
/// - anything else is ordinary `Chat`.
pub fn classify(content: &str) -> Classification {
    let Some(rest) = content.strip_prefix(COMMAND_PREFIX) else {
        return Classification::Chat;
    };

    let len = rest.chars().count();
    if len < STOCK_CODE_MIN || len > STOCK_CODE_MAX {
        return Classification::Invalid;
    }

    if !rest.chars().all(is_stock_code_char) {
        return Classification::Invalid;
    }

    Classification::Command {
        stock_code: rest.to_string(),
    }
}

fn is_stock_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}
