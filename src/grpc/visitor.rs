//! Legal frame orders for envelope streams.
//!
//! Tunnel envelopes are `oneof` messages whose variants must arrive in a fixed
//! order: a header before any message, nothing but an error after a trailer,
//! and so on. An [`Automaton`] lists, per variant (by field number), which
//! variants may follow it and whether the stream may end there.

use tonic::Status;

/// One row of a transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: u32,
    pub next: &'static [u32],
    pub eof_allowed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Automaton {
    pub name: &'static str,
    pub transitions: &'static [Transition],
}

impl Automaton {
    pub fn start(&'static self, state: u32) -> VisitState {
        VisitState {
            automaton: self,
            current: state,
        }
    }

    fn row(&self, state: u32) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.from == state)
    }
}

/// Position of one stream within its automaton.
#[derive(Debug, Clone, Copy)]
pub struct VisitState {
    automaton: &'static Automaton,
    current: u32,
}

impl VisitState {
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Move to `next`, rejecting an out-of-order frame.
    pub fn advance(&mut self, next: u32) -> Result<(), Status> {
        let allowed = self
            .automaton
            .row(self.current)
            .is_some_and(|t| t.next.contains(&next));
        if !allowed {
            return Err(Status::invalid_argument(format!(
                "{}: transition from {} to {} is not allowed",
                self.automaton.name, self.current, next
            )));
        }
        self.current = next;
        Ok(())
    }

    /// Check that the stream may end in the current state.
    pub fn finish(&self) -> Result<(), Status> {
        if self.automaton.row(self.current).is_some_and(|t| t.eof_allowed) {
            return Ok(());
        }
        Err(Status::invalid_argument(format!(
            "{}: unexpected end of stream in state {}",
            self.automaton.name, self.current
        )))
    }
}
