use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid turn role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Completion state of a turn. Only a streaming assistant turn is ever
/// pending; everything the store hands back is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TurnStatus {
    Pending,
    Complete,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Complete => "complete",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_final(self) -> bool {
        self != TurnStatus::Pending
    }
}

impl AsRef<str> for TurnStatus {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TurnStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TurnStatus::Pending),
            "complete" => Ok(TurnStatus::Complete),
            "cancelled" => Ok(TurnStatus::Cancelled),
            _ => Err(format!("invalid turn status: {value}")),
        }
    }
}

impl TryFrom<String> for TurnStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<TurnStatus> for String {
    fn from(value: TurnStatus) -> Self {
        value.as_str().to_string()
    }
}

/// One message within a session: who said it, what was said, and whether
/// the text is settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// A finished user turn. User input never streams, so it is complete
    /// from the moment it is created.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            status: TurnStatus::Complete,
            created_at: Utc::now(),
        }
    }

    /// The single in-progress assistant turn that accumulates streamed
    /// fragments until it is finalized.
    pub fn pending_assistant() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            status: TurnStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TurnStatus::Pending
    }

    pub fn append_fragment(&mut self, fragment: &str) {
        debug_assert!(self.is_pending(), "fragments only land on a pending turn");
        self.content.push_str(fragment);
    }

    /// Settle the turn. After this the text is immutable.
    pub fn finalize(&mut self, status: TurnStatus) {
        debug_assert!(status.is_final(), "finalize requires a final status");
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_role_strings_are_rejected() {
        assert!(Role::try_from("system").is_err());
        assert!(TurnStatus::try_from("streaming").is_err());
    }

    #[test]
    fn user_turns_are_complete_on_creation() {
        let turn = Turn::user("hello");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.status, TurnStatus::Complete);
    }

    #[test]
    fn pending_turn_accumulates_fragments_until_finalized() {
        let mut turn = Turn::pending_assistant();
        assert!(turn.is_pending());
        turn.append_fragment("Hi");
        turn.append_fragment(" there");
        turn.finalize(TurnStatus::Complete);
        assert_eq!(turn.content, "Hi there");
        assert!(turn.status.is_final());
    }
}
