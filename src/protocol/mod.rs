//! Line protocol spoken by the task device.
//!
//! Every message is one ASCII line. The first character (the *sigil*)
//! decides how the line is handled:
//!
//! | Sigil | Kind | Elements |
//! |-------|------|----------|
//! | `.` | [`MessageKind::Debug`] | no |
//! | `>` | [`MessageKind::Info`] | no |
//! | `@` | [`MessageKind::Config`] | yes |
//! | `+` | [`MessageKind::Result`] | yes |
//! | `*` | [`MessageKind::Error`] | no |
//! | `<` | [`MessageKind::Output`] | no |
//! | other | [`MessageKind::Plain`] | no |
//!
//! Config and result bodies are further split on [`DELIMITER`] into
//! *elements*. Result elements follow the grammar parsed by [`ResultParser`]:
//!
//! ```text
//! <status>                      e.g. hit
//! <value><signed integer>       e.g. wait250
//! <array>[<int>(,<int>)*]       e.g. lick[12,45,67] or lick[]
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Message kinds and classified messages |
//! | `event` | Events raised by a connection |
//! | `result` | Result-element token parser |

// ============================================================================
// Submodules
// ============================================================================

/// Events raised by a connection.
pub mod event;

/// Message kinds and classified messages.
pub mod message;

/// Result-element token parser.
pub mod result;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::{ConnectionState, Event};
pub use message::{Message, MessageKind, ReturnKind};
pub use result::{ParseEvent, ResultNames, ResultParser, ResultRecord};

// ============================================================================
// Constants
// ============================================================================

/// Sigil of debug lines.
pub const DEBUG: char = '.';

/// Sigil of info lines.
pub const INFO: char = '>';

/// Sigil of config lines.
pub const CONFIG: char = '@';

/// Sigil of result lines.
pub const RESULT: char = '+';

/// Sigil of error lines.
pub const ERROR: char = '*';

/// Sigil of output lines.
pub const OUTPUT: char = '<';

/// Separator between elements of config and result bodies.
pub const DELIMITER: char = ';';

/// Command that asks the device for its help/settings listing.
pub const HELP: &str = "?";

/// Default line terminator appended to outbound commands.
pub const LINE_TERMINATOR: &str = "\n";

// ============================================================================
// Rules
// ============================================================================

/// Classifies a line by its first character.
///
/// The sigil is stripped and the body trimmed for every kind except
/// [`MessageKind::Plain`], whose body is the whole line. Classification is
/// total: every line maps to exactly one kind.
#[must_use]
pub fn classify(line: &str) -> (MessageKind, &str) {
    let mut chars = line.chars();
    match chars.next().and_then(MessageKind::from_sigil) {
        Some(kind) => (kind, chars.as_str().trim()),
        None => (MessageKind::Plain, line),
    }
}

/// Splits a body into its trimmed, non-empty elements, in order.
pub fn split_elements(body: &str) -> impl Iterator<Item = &str> {
    body.split(DELIMITER)
        .map(str::trim)
        .filter(|element| !element.is_empty())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_classify_each_sigil() {
        assert_eq!(classify(".dbg"), (MessageKind::Debug, "dbg"));
        assert_eq!(classify(">ready"), (MessageKind::Info, "ready"));
        assert_eq!(classify("@d500;f1000"), (MessageKind::Config, "d500;f1000"));
        assert_eq!(classify("+hit"), (MessageKind::Result, "hit"));
        assert_eq!(classify("*bad command"), (MessageKind::Error, "bad command"));
        assert_eq!(classify("<raw"), (MessageKind::Output, "raw"));
    }

    #[test]
    fn test_classify_plain_keeps_whole_line() {
        assert_eq!(classify("hello"), (MessageKind::Plain, "hello"));
        assert_eq!(classify("#x"), (MessageKind::Plain, "#x"));
    }

    #[test]
    fn test_classify_trims_body() {
        assert_eq!(classify("+ hit ;miss "), (MessageKind::Result, "hit ;miss"));
    }

    #[test]
    fn test_classify_sigil_only() {
        assert_eq!(classify("+"), (MessageKind::Result, ""));
    }

    #[test]
    fn test_split_elements_drops_empty() {
        let elements: Vec<_> = split_elements(" hit ;; wait250 ; ;lick[1,2]").collect();
        assert_eq!(elements, vec!["hit", "wait250", "lick[1,2]"]);
    }

    #[test]
    fn test_split_elements_empty_body() {
        assert_eq!(split_elements("").count(), 0);
        assert_eq!(split_elements(" ; ").count(), 0);
    }

    fn sigil() -> impl Strategy<Value = char> {
        prop::sample::select(vec![DEBUG, INFO, CONFIG, RESULT, ERROR, OUTPUT])
    }

    proptest! {
        #[test]
        fn prop_sigiled_lines_strip_sigil(s in sigil(), rest in "[ -~]{0,40}") {
            let line = format!("{s}{rest}");
            let (kind, body) = classify(&line);
            prop_assert_eq!(kind.sigil(), Some(s));
            prop_assert_eq!(body, rest.trim());
        }

        #[test]
        fn prop_other_lines_are_plain(line in "[a-zA-Z0-9#$%&][ -~]{0,40}") {
            let (kind, body) = classify(&line);
            prop_assert_eq!(kind, MessageKind::Plain);
            prop_assert_eq!(body, line.as_str());
        }

        #[test]
        fn prop_split_matches_joined_elements(
            elements in prop::collection::vec("[a-z]{1,6}[0-9]{0,3}", 0..8)
        ) {
            let body = elements.join(" ; ");
            let split: Vec<_> = split_elements(&body).collect();
            prop_assert_eq!(split, elements.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }
}
