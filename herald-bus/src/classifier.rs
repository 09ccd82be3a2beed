//! Maps a handler failure to the `(reason, description)` pair attached to a
//! dead-lettered message.

use herald_core::HandlerError;
use serde::Serialize;

pub const OPTIMISTIC_CONFLICT_REASON: &str = "Optimistic conflict error occurred";
pub const INVALID_INPUT_REASON: &str = "Invalid (message) input errors occurred";
pub const BUSINESS_VALIDATION_REASON: &str = "Critical business errors occurred";
pub const AUTHORIZATION_REASON: &str = "Authorization error occurred";
pub const UNHANDLED_REASON: &str = "General unhandled exception";

/// Longest description the transport accepts, in chars.
pub const MAX_DESCRIPTION_CHARS: usize = 4096;
/// Chars kept when a description has to be cut.
pub const TRUNCATED_DESCRIPTION_CHARS: usize = 4092;
pub const TRUNCATION_SUFFIX: &str = "(..)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub reason: &'static str,
    /// Never longer than [`MAX_DESCRIPTION_CHARS`].
    pub description: String,
}

pub struct DeadLetterClassifier;

impl DeadLetterClassifier {
    pub fn classify(error: &HandlerError) -> Classification {
        let (reason, description) = match error {
            HandlerError::OptimisticConflict(critic) => {
                (OPTIMISTIC_CONFLICT_REASON, to_json(critic))
            }
            HandlerError::InvalidInput(critics) => (INVALID_INPUT_REASON, to_json(critics)),
            HandlerError::BusinessValidation(critics) => {
                (BUSINESS_VALIDATION_REASON, to_json(critics))
            }
            HandlerError::Authorization(message) => (AUTHORIZATION_REASON, message.clone()),
            HandlerError::Unhandled(text) => (UNHANDLED_REASON, text.clone()),
        };

        Classification {
            reason,
            description: truncate_description(description),
        }
    }
}

/// Cut to 4092 chars plus `(..)` once the text exceeds 4096 chars.
pub fn truncate_description(description: String) -> String {
    if description.chars().count() <= MAX_DESCRIPTION_CHARS {
        return description;
    }

    let mut cut: String = description.chars().take(TRUNCATED_DESCRIPTION_CHARS).collect();
    cut.push_str(TRUNCATION_SUFFIX);
    cut
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable critics: {e}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::Critic;
    use proptest::prelude::*;

    #[test]
    fn conflict_carries_single_critic_as_json() {
        let err = HandlerError::optimistic_conflict("version", "stale version 3");
        let c = DeadLetterClassifier::classify(&err);

        assert_eq!(c.reason, OPTIMISTIC_CONFLICT_REASON);
        let critic: Critic = serde_json::from_str(&c.description).unwrap();
        assert_eq!(critic.field.as_deref(), Some("version"));
    }

    #[test]
    fn input_and_business_critics_serialize_as_arrays() {
        let critics = vec![
            Critic::error("Required", "name is required").with_field("name"),
            Critic::error("Range", "qty must be positive").with_field("qty"),
        ];

        let input = DeadLetterClassifier::classify(&HandlerError::invalid_input(critics.clone()));
        assert_eq!(input.reason, INVALID_INPUT_REASON);
        let parsed: Vec<Critic> = serde_json::from_str(&input.description).unwrap();
        assert_eq!(parsed, critics);

        let business = DeadLetterClassifier::classify(&HandlerError::business(critics));
        assert_eq!(business.reason, BUSINESS_VALIDATION_REASON);
    }

    #[test]
    fn everything_else_is_unhandled_with_full_text() {
        let err =
            HandlerError::normalize(anyhow::anyhow!("socket closed").context("calling ledger"));
        let c = DeadLetterClassifier::classify(&err);

        assert_eq!(c.reason, UNHANDLED_REASON);
        assert_eq!(c.description, "calling ledger: socket closed");
    }

    #[test]
    fn authorization_has_its_own_reason() {
        let c = DeadLetterClassifier::classify(&HandlerError::unauthorized("lacks role admin"));
        assert_eq!(c.reason, AUTHORIZATION_REASON);
        assert_eq!(c.description, "lacks role admin");
    }

    #[test]
    fn long_description_is_cut_to_exactly_4096() {
        let c = DeadLetterClassifier::classify(&HandlerError::unhandled("e".repeat(5000)));

        assert_eq!(c.description.chars().count(), 4096);
        assert!(c.description.ends_with("(..)"));
        assert_eq!(&c.description[..4092], "e".repeat(4092));
    }

    #[test]
    fn boundary_lengths() {
        let exact = "a".repeat(4096);
        assert_eq!(truncate_description(exact.clone()), exact);

        let over = "a".repeat(4097);
        assert_eq!(truncate_description(over).chars().count(), 4096);
    }

    proptest! {
        #[test]
        fn truncation_never_exceeds_limit(text in ".{0,6000}") {
            let len = text.chars().count();
            let out = truncate_description(text.clone());

            prop_assert!(out.chars().count() <= MAX_DESCRIPTION_CHARS);
            if len <= MAX_DESCRIPTION_CHARS {
                prop_assert_eq!(out, text);
            } else {
                prop_assert_eq!(out.chars().count(), MAX_DESCRIPTION_CHARS);
                prop_assert!(out.ends_with(TRUNCATION_SUFFIX));
                let kept: String = text.chars().take(TRUNCATED_DESCRIPTION_CHARS).collect();
                prop_assert!(out.starts_with(&kept));
            }
        }
    }
}
