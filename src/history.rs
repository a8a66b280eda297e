use std::collections::VecDeque;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  User,
  Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
  pub role: Role,
  pub content: String,
  pub timestamp: DateTime<Utc>,
}

/// Most recent exchanges with a learner, capped at [`HISTORY_LIMIT`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct ConversationHistory {
  entries: VecDeque<HistoryEntry>,
}

impl ConversationHistory {
  pub fn push(&mut self, role: Role, content: impl Into<String>, now: DateTime<Utc>) {
    self.entries.push_back(HistoryEntry {
      role,
      content: content.into(),
      timestamp: now,
    });
    while self.entries.len() > HISTORY_LIMIT {
      self.entries.pop_front();
    }
  }

  pub fn entries(&self) -> impl ExactSizeIterator<Item = &HistoryEntry> {
    self.entries.iter()
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::ConversationHistory;
  use super::HISTORY_LIMIT;
  use super::Role;

  #[test]
  fn keeps_only_latest_entries_in_order() {
    let mut history = ConversationHistory::default();
    let now = Utc::now();
    for i in 0 .. 25 {
      let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
      history.push(role, format!("message {i}"), now);
    }

    assert_eq!(history.entries().len(), HISTORY_LIMIT);
    let contents: Vec<&str> = history.entries().map(|entry| entry.content.as_str()).collect();
    let expected: Vec<String> = (5 .. 25).map(|i| format!("message {i}")).collect();
    assert_eq!(contents, expected);
  }

  #[test]
  fn empty_history_has_no_entries() {
    let history = ConversationHistory::default();
    assert_eq!(history.entries().len(), 0);
  }
}
