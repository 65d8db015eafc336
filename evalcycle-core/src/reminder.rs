//! Reminder batch progress
//!
//! A reminder run walks the not-yet-responded recipient groups in a stable
//! order. Its position is kept as a `"{total}:{current}:{group_id}"` token so a
//! run interrupted by a node restart resumes where it stopped.

use crate::{EvalError, EvalResult, GroupId, TokenError};
use serde::{Deserialize, Serialize};

/// Separator between the fields of a reminder token.
pub const REMINDER_TOKEN_SEPARATOR: char = ':';

/// Position within one reminder fan-out.
///
/// `current` is 1-based: it names the group about to be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ReminderBatchStatusDe")]
pub struct ReminderBatchStatus {
    total: u32,
    current: u32,
    group_id: GroupId,
}

#[derive(Debug, Deserialize)]
struct ReminderBatchStatusDe {
    total: u32,
    current: u32,
    group_id: GroupId,
}

impl TryFrom<ReminderBatchStatusDe> for ReminderBatchStatus {
    type Error = EvalError;

    fn try_from(raw: ReminderBatchStatusDe) -> Result<Self, Self::Error> {
        Self::new(raw.total, raw.current, raw.group_id)
    }
}

impl ReminderBatchStatus {
    /// # Errors
    /// `InvalidArgument` when `total` or `current` is zero, `current > total`
    /// or `group_id` is empty.
    pub fn new(total: u32, current: u32, group_id: impl Into<GroupId>) -> EvalResult<Self> {
        let group_id = group_id.into();
        if let Some((field, reason)) = Self::violation(total, current, &group_id) {
            return Err(EvalError::invalid_argument(field, reason));
        }
        Ok(Self {
            total,
            current,
            group_id,
        })
    }

    fn violation(total: u32, current: u32, group_id: &str) -> Option<(&'static str, String)> {
        if total == 0 {
            return Some(("total", "must be positive".to_string()));
        }
        if current == 0 {
            return Some(("current", "must be positive".to_string()));
        }
        if current > total {
            return Some(("current", format!("{} exceeds total {}", current, total)));
        }
        if group_id.is_empty() {
            return Some(("group_id", "must not be empty".to_string()));
        }
        None
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Encode into the persisted token form.
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.total,
            self.current,
            self.group_id,
            sep = REMINDER_TOKEN_SEPARATOR
        )
    }

    /// Validate then encode in one step.
    pub fn encode_parts(total: u32, current: u32, group_id: &str) -> EvalResult<String> {
        Ok(Self::new(total, current, group_id)?.encode())
    }

    /// Decode a persisted token.
    ///
    /// Splits on the first two separators only, so group ids may themselves
    /// contain `:`.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let malformed = |reason: String| TokenError::Malformed {
            kind: "reminder",
            token: token.to_string(),
            reason,
        };

        let mut parts = token.splitn(3, REMINDER_TOKEN_SEPARATOR);
        let (Some(total), Some(current), Some(group_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected total:current:group".to_string()));
        };

        let total = total
            .parse::<u32>()
            .map_err(|_| malformed(format!("total {:?} is not a count", total)))?;
        let current = current
            .parse::<u32>()
            .map_err(|_| malformed(format!("current {:?} is not a count", current)))?;
        if let Some((field, reason)) = Self::violation(total, current, group_id) {
            return Err(malformed(format!("{} {}", field, reason)));
        }

        Ok(Self {
            total,
            current,
            group_id: group_id.to_string(),
        })
    }

    /// Status for the next group, or `None` once the run is complete.
    pub fn advance(&self, next_group: impl Into<GroupId>) -> Option<EvalResult<Self>> {
        (self.current < self.total).then(|| Self::new(self.total, self.current + 1, next_group))
    }

    /// Zero-based index in `groups` at which a resumed run should continue.
    ///
    /// The group list is re-read on resume and may have shrunk as groups
    /// responded, so the recorded group is located by id first and by
    /// position second.
    pub fn resume_index(&self, groups: &[GroupId]) -> usize {
        groups
            .iter()
            .position(|g| *g == self.group_id)
            .unwrap_or_else(|| (self.current.saturating_sub(1) as usize).min(groups.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_example_token() {
        let status = ReminderBatchStatus::decode("5:2:groupA").unwrap();
        assert_eq!(status.total(), 5);
        assert_eq!(status.current(), 2);
        assert_eq!(status.group_id(), "groupA");
    }

    #[test]
    fn test_reencode_with_next_position() {
        let status = ReminderBatchStatus::decode("5:2:groupA").unwrap();
        let next = ReminderBatchStatus::new(status.total(), 3, status.group_id()).unwrap();
        assert_eq!(next.encode(), "5:3:groupA");
    }

    #[test]
    fn test_encode_rejects_invalid_arguments() {
        assert!(ReminderBatchStatus::new(0, 1, "g").is_err());
        assert!(ReminderBatchStatus::new(3, 0, "g").is_err());
        assert!(ReminderBatchStatus::new(3, 4, "g").is_err());
        assert!(matches!(
            ReminderBatchStatus::encode_parts(3, 1, ""),
            Err(EvalError::Validation(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for token in ["", "5", "5:2", "x:2:g", "5:y:g", "5:-1:g", "5:6:g", "0:0:g", "5:2:"] {
            assert!(
                matches!(
                    ReminderBatchStatus::decode(token),
                    Err(TokenError::Malformed { kind: "reminder", .. })
                ),
                "token {:?} should be malformed",
                token
            );
        }
    }

    #[test]
    fn test_group_id_may_contain_separator() {
        let status = ReminderBatchStatus::decode("3:1:site:section-2").unwrap();
        assert_eq!(status.group_id(), "site:section-2");
        assert_eq!(status.encode(), "3:1:site:section-2");
    }

    #[test]
    fn test_advance_stops_at_total() {
        let status = ReminderBatchStatus::new(2, 1, "a").unwrap();
        let next = status.advance("b").unwrap().unwrap();
        assert_eq!(next.encode(), "2:2:b");
        assert!(next.advance("c").is_none());
    }

    #[test]
    fn test_resume_index() {
        let groups: Vec<GroupId> = vec!["a".into(), "c".into(), "d".into()];
        let status = ReminderBatchStatus::new(4, 3, "c").unwrap();
        assert_eq!(status.resume_index(&groups), 1);

        let gone = ReminderBatchStatus::new(4, 2, "b").unwrap();
        assert_eq!(gone.resume_index(&groups), 1);

        let past_end = ReminderBatchStatus::new(9, 9, "z").unwrap();
        assert_eq!(past_end.resume_index(&groups), 3);
    }

    #[test]
    fn test_deserialize_validates() {
        let status: ReminderBatchStatus =
            serde_json::from_str(r#"{"total":5,"current":2,"group_id":"groupA"}"#).unwrap();
        assert_eq!(status, ReminderBatchStatus::new(5, 2, "groupA").unwrap());
        assert_eq!(
            serde_json::from_str::<ReminderBatchStatus>(&serde_json::to_string(&status).unwrap())
                .unwrap(),
            status
        );

        for json in [
            r#"{"total":5,"current":0,"group_id":"g"}"#,
            r#"{"total":0,"current":0,"group_id":"g"}"#,
            r#"{"total":2,"current":3,"group_id":"g"}"#,
            r#"{"total":2,"current":1,"group_id":""}"#,
        ] {
            assert!(
                serde_json::from_str::<ReminderBatchStatus>(json).is_err(),
                "{} should be rejected",
                json
            );
        }
    }
}
