use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use depotledger_events::StreamId;

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend};

/// In-memory append-only event store.
///
/// Intended for tests/dev and for embedding the engine in a single process.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn check_batch(batch: &StreamAppend) -> Result<(), EventStoreError> {
        for (idx, e) in batch.events.iter().enumerate() {
            if e.stream != batch.stream {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch for {} contains an event for {} (index {idx})",
                    batch.stream, e.stream
                )));
            }
        }
        Ok(())
    }
}

impl EventStore for InMemoryEventStore {
    fn append_all(&self, batches: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut seen = BTreeSet::new();
        for batch in &batches {
            Self::check_batch(batch)?;
            if !seen.insert(batch.stream) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream {} appears twice in one transaction",
                    batch.stream
                )));
            }
        }

        let mut streams = self.streams.write().map_err(|_| EventStoreError::Poisoned)?;

        // Check every expectation before writing anything.
        for batch in &batches {
            let current = streams
                .get(&batch.stream)
                .map(|s| Self::current_version(s))
                .unwrap_or(0);
            if !batch.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "{}: expected {:?}, found {current}",
                    batch.stream, batch.expected_version
                )));
            }
        }

        let mut committed = Vec::new();
        for batch in batches {
            if batch.events.is_empty() {
                continue;
            }
            let stream = streams.entry(batch.stream).or_default();
            let mut next = Self::current_version(stream) + 1;
            for e in batch.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    stream: e.stream,
                    aggregate_type: e.stream.aggregate_type().to_string(),
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, stream: StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(streams.get(&stream).cloned().unwrap_or_default())
    }

    fn streams(&self) -> Result<Vec<StreamId>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| EventStoreError::Poisoned)?;
        let mut ids: Vec<StreamId> = streams
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
