//! Conversation transcript shown in the terminal.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn label(self) -> &'static str {
        match self {
            Sender::User => "You",
            Sender::Assistant => "Prism",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub sender: Sender,
    pub text: String,
    pub at: DateTime<Local>,
}

impl ConversationTurn {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            at: Local::now(),
        }
    }
}

impl fmt::Display for ConversationTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.at.format("%H:%M:%S"),
            self.sender.label(),
            self.text
        )
    }
}

/// Append-only chat history.
#[derive(Debug, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// Most recent user turns, newest first.
    pub fn user_queries(&self) -> impl Iterator<Item = &str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.sender == Sender::User)
            .map(|t| t.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_tail_in_order() {
        let mut conversation = Conversation::new();
        for i in 0..5 {
            conversation.push(ConversationTurn::new(Sender::User, format!("q{i}")));
        }
        let tail: Vec<_> = conversation.recent(2).iter().map(|t| t.text.as_str()).collect();
        assert_eq!(tail, ["q3", "q4"]);
        assert_eq!(conversation.recent(50).len(), 5);
    }

    #[test]
    fn user_queries_skip_assistant_turns() {
        let mut conversation = Conversation::new();
        conversation.push(ConversationTurn::new(Sender::User, "first"));
        conversation.push(ConversationTurn::new(Sender::Assistant, "answer"));
        conversation.push(ConversationTurn::new(Sender::User, "second"));
        let queries: Vec<_> = conversation.user_queries().collect();
        assert_eq!(queries, ["second", "first"]);
    }

    #[test]
    fn display_names_the_sender() {
        let turn = ConversationTurn::new(Sender::Assistant, "hi");
        assert!(turn.to_string().ends_with("Prism: hi"));
    }
}
