//! Aggregate traits for event-sourced stock state.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events applied so far (the stream revision).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for a stream append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// The stream must currently be at this exact revision.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stream moved underneath the writer (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Pure decide/evolve contract.
///
/// `handle` inspects state and returns the events a command would produce,
/// without mutating anything. `apply` folds one event into state and must
/// bump `version()` by one. Neither may perform IO.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;

    /// Evolve state from a single, already-accepted event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events a command produces.
    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>>;

    /// Decide, then apply the resulting events to `self`.
    ///
    /// Used on scratch copies when several commands must observe each
    /// other's effects before anything is committed.
    fn execute(&mut self, command: &Self::Command) -> DomainResult<Vec<Self::Event>> {
        let events = self.handle(command)?;
        for event in &events {
            self.apply(event);
        }
        Ok(events)
    }

    /// Fold a full history into `self` (rehydration).
    fn replay<'a, I>(mut self, history: I) -> Self
    where
        Self: Sized,
        Self::Event: 'a,
        I: IntoIterator<Item = &'a Self::Event>,
    {
        for event in history {
            self.apply(event);
        }
        self
    }
}
