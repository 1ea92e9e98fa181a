// ABOUTME: Conversation history storage for agents.
// ABOUTME: History only grows through append/extend, is replaced whole by set, and emptied by clear.

use switchyard_core::ConversationTurn;

/// Ordered storage of an agent's turns. Implementations never edit a stored turn in place.
pub trait Memory: Send + Sync {
    fn append(&mut self, turn: ConversationTurn);

    fn extend(&mut self, turns: Vec<ConversationTurn>);

    /// Replace the whole history.
    fn set(&mut self, turns: Vec<ConversationTurn>);

    fn get(&self) -> &[ConversationTurn];

    fn clear(&mut self);
}

/// In-memory history backed by a Vec.
#[derive(Debug, Clone, Default)]
pub struct SimpleMemory {
    turns: Vec<ConversationTurn>,
}

impl SimpleMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<ConversationTurn>) -> Self {
        Self { turns }
    }
}

impl Memory for SimpleMemory {
    fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    fn extend(&mut self, turns: Vec<ConversationTurn>) {
        self.turns.extend(turns);
    }

    fn set(&mut self, turns: Vec<ConversationTurn>) {
        self.turns = turns;
    }

    fn get(&self) -> &[ConversationTurn] {
        &self.turns
    }

    fn clear(&mut self) {
        self.turns.clear();
    }
}
