//! Scheduled action keys and their token encoding
//!
//! Internally a scheduled invocation is identified by a typed [`ActionKey`].
//! The string form `"{evaluation_id}/{ACTION_TYPE}"` exists only at the task
//! queue boundary: encoded once when scheduling, decoded once when fired.

use crate::{ActionType, EvaluationId, TokenError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the evaluation id and the action type.
///
/// Neither a decimal id nor an upper-case action name can contain it.
pub const ACTION_TOKEN_SEPARATOR: char = '/';

/// Composite identity of one scheduled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub evaluation_id: EvaluationId,
    pub action_type: ActionType,
}

impl ActionKey {
    pub fn new(evaluation_id: EvaluationId, action_type: ActionType) -> Self {
        Self {
            evaluation_id,
            action_type,
        }
    }

    /// Every key that can exist for one evaluation.
    pub fn all_for(evaluation_id: EvaluationId) -> [ActionKey; 4] {
        ActionType::ALL.map(|action_type| ActionKey::new(evaluation_id, action_type))
    }

    /// Encode into the opaque token handed to the task queue.
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            self.evaluation_id,
            ACTION_TOKEN_SEPARATOR,
            self.action_type.as_db_str()
        )
    }

    /// Decode a token received from the task queue.
    ///
    /// # Errors
    /// `TokenError::Malformed` when the separator is missing, the id is not a
    /// valid evaluation id, the action type is unknown or the token is not in
    /// the exact form [`encode`](Self::encode) produces (`+42`, `042`). Such
    /// tokens are stale or foreign and should be dropped, not treated as fatal.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let malformed = |reason: String| TokenError::Malformed {
            kind: "action",
            token: token.to_string(),
            reason,
        };

        let (id, action) = token
            .split_once(ACTION_TOKEN_SEPARATOR)
            .ok_or_else(|| malformed(format!("missing '{}' separator", ACTION_TOKEN_SEPARATOR)))?;
        let evaluation_id = id.parse::<EvaluationId>().map_err(|e| malformed(e.to_string()))?;
        let action_type = action.parse::<ActionType>().map_err(|e| malformed(e.to_string()))?;

        let key = Self::new(evaluation_id, action_type);
        if key.encode() != token {
            return Err(malformed(format!("id {:?} is not in canonical form", id)));
        }
        Ok(key)
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_action_type() -> impl Strategy<Value = ActionType> {
        prop_oneof![
            Just(ActionType::Created),
            Just(ActionType::Active),
            Just(ActionType::Reminder),
            Just(ActionType::Viewable),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// decode(encode(key)) == key for every valid key.
        #[test]
        fn prop_action_token_roundtrip(raw in 1i64..i64::MAX, action_type in arb_action_type()) {
            let key = ActionKey::new(EvaluationId::new(raw).unwrap(), action_type);
            prop_assert_eq!(ActionKey::decode(&key.encode()).unwrap(), key);
        }

        /// Any string without the separator is malformed, never a panic.
        #[test]
        fn prop_separator_less_tokens_are_malformed(token in "[^/]*") {
            let is_malformed = matches!(ActionKey::decode(&token), Err(TokenError::Malformed { .. }));
            prop_assert!(is_malformed);
        }

        /// Arbitrary input never panics, and whatever decodes encodes back
        /// to the same token.
        #[test]
        fn prop_decode_is_total(token in ".*") {
            if let Ok(key) = ActionKey::decode(&token) {
                prop_assert_eq!(key.encode(), token);
            }
        }

        /// Signed or zero-padded ids are rejected.
        #[test]
        fn prop_padded_ids_are_malformed(raw in 1i64..1_000_000, action_type in arb_action_type()) {
            let plus = format!("+{}/{}", raw, action_type);
            let padded = format!("0{}/{}", raw, action_type);
            prop_assert!(ActionKey::decode(&plus).is_err());
            prop_assert!(ActionKey::decode(&padded).is_err());
        }
    }
}
