//! Task states and the notifications that announce them.

use std::fmt;
use std::str::FromStr;

use obsflow_bus::{BusError, Message};
use serde::{Deserialize, Serialize};

/// Subject prefix of status-change notifications.
pub const STATUS_SUBJECT_PREFIX: &str = "TaskStatus.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Scheduled,
    Queued,
    Active,
    Completing,
    Finished,
    Aborted,
    Conflict,
    OnHold,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
            Self::Conflict => "conflict",
            Self::OnHold => "on_hold",
        }
    }

    /// States that mean the task's jobs must go.
    pub fn is_abort_like(&self) -> bool {
        matches!(self, Self::Aborted | Self::Conflict | Self::OnHold)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != ' ')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completing" => Ok(Self::Completing),
            "finished" => Ok(Self::Finished),
            "aborted" => Ok(Self::Aborted),
            "conflict" => Ok(Self::Conflict),
            "onhold" => Ok(Self::OnHold),
            _ => Err(format!("unknown task status '{s}'")),
        }
    }
}

/// Payload of a status-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusNotification {
    #[serde(rename = "treeID")]
    pub tree_id: u32,
    #[serde(default)]
    pub time_of_change: Option<String>,
    pub state: String,
}

impl TaskStatusNotification {
    pub fn new(tree_id: u32, state: TaskStatus, time_of_change: Option<String>) -> Self {
        Self {
            tree_id,
            time_of_change,
            state: state.as_str().to_string(),
        }
    }

    pub fn status(&self) -> Result<TaskStatus, String> {
        self.state.parse()
    }

    /// Message with subject `TaskStatus.<state>`.
    pub fn to_message(&self) -> Result<Message, BusError> {
        Ok(Message::new(
            format!("{STATUS_SUBJECT_PREFIX}{}", self.state),
            self,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_loosely() {
        assert_eq!("Scheduled".parse::<TaskStatus>(), Ok(TaskStatus::Scheduled));
        assert_eq!("on_hold".parse::<TaskStatus>(), Ok(TaskStatus::OnHold));
        assert_eq!("OnHold".parse::<TaskStatus>(), Ok(TaskStatus::OnHold));
        assert!("prescheduled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn abort_like_states() {
        assert!(TaskStatus::Aborted.is_abort_like());
        assert!(TaskStatus::Conflict.is_abort_like());
        assert!(TaskStatus::OnHold.is_abort_like());
        assert!(!TaskStatus::Scheduled.is_abort_like());
        assert!(!TaskStatus::Finished.is_abort_like());
    }

    #[test]
    fn notification_message_subject_and_payload() {
        let n = TaskStatusNotification::new(
            42,
            TaskStatus::Scheduled,
            Some("2016-03-01 10:00:00".into()),
        );
        let msg = n.to_message().unwrap();
        assert_eq!(msg.subject, "TaskStatus.scheduled");
        let back: TaskStatusNotification = msg.decode().unwrap();
        assert_eq!(back, n);
    }
}
