//! Turn aggregation: decides which recognition events start a response.
//!
//! Recognition engines deliver interim hypotheses, several end-of-turn
//! variants of the same utterance (raw then formatted) and occasionally
//! redeliver a final turn verbatim. Only a finalized, non-empty transcript
//! that differs from the last accepted one may supersede the running reply.

use crate::pipeline::messages::Turn;

/// What the session should do with one recognition turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnDecision {
    /// Empty or not final enough to act on.
    Ignore,
    /// Interim hypothesis, display only.
    Interim(String),
    /// Same text as the last accepted turn.
    Duplicate(String),
    /// New finalized utterance: interrupt whatever runs and respond to it.
    Accept(String),
}

/// Per-session dedup cursor and finalization policy.
#[derive(Debug, Clone)]
pub struct TurnAggregator {
    require_formatted: bool,
    last_processed: Option<String>,
    accepted: u64,
    duplicates: u64,
}

impl TurnAggregator {
    /// Create an aggregator.
    ///
    /// With `require_formatted`, an end-of-turn event only counts once the
    /// engine has delivered the formatted transcript.
    pub fn new(require_formatted: bool) -> Self {
        Self {
            require_formatted,
            last_processed: None,
            accepted: 0,
            duplicates: 0,
        }
    }

    /// Whether `turn` is a finalized utterance under this policy.
    pub fn is_finalized(&self, turn: &Turn) -> bool {
        turn.end_of_turn && (turn.turn_is_formatted || !self.require_formatted)
    }

    /// Classify a turn and advance the dedup cursor on acceptance.
    pub fn observe(&mut self, turn: &Turn) -> TurnDecision {
        let text = turn.transcript.trim();
        if text.is_empty() {
            return TurnDecision::Ignore;
        }

        if !self.is_finalized(turn) {
            if turn.end_of_turn {
                // Raw end-of-turn; the formatted variant follows.
                return TurnDecision::Ignore;
            }
            return TurnDecision::Interim(text.to_owned());
        }

        if self.last_processed.as_deref() == Some(text) {
            self.duplicates += 1;
            return TurnDecision::Duplicate(text.to_owned());
        }

        self.last_processed = Some(text.to_owned());
        self.accepted += 1;
        TurnDecision::Accept(text.to_owned())
    }

    /// Most recently accepted transcript.
    pub fn last_processed(&self) -> Option<&str> {
        self.last_processed.as_deref()
    }

    /// Number of accepted turns so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Number of suppressed duplicates so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
