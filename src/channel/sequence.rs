use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Array {id} is too far ahead of expected id {expected}")]
pub struct SequenceError {
    pub id: i64,
    pub expected: i64,
}

/// Puts server arrays back in id order, dropping duplicates.
///
/// Arrays ahead of the next expected id wait in a bounded window until the gap
/// fills.
#[derive(Debug)]
pub struct ArraySequencer {
    last: i64,
    held: BTreeMap<i64, Value>,
    window: usize,
}

impl ArraySequencer {
    pub fn new(window: usize) -> Self {
        Self {
            last: -1,
            held: BTreeMap::new(),
            window,
        }
    }

    /// Id of the last array released in order
    pub fn last_array_id(&self) -> i64 {
        self.last
    }

    /// Accepts one array and returns every array now releasable, in order
    pub fn accept(&mut self, id: i64, payload: Value) -> Result<Vec<(i64, Value)>, SequenceError> {
        if id <= self.last || self.held.contains_key(&id) {
            tracing::trace!(id, last = self.last, "Dropping duplicate array");
            return Ok(Vec::new());
        }

        let expected = self.last + 1;
        if id > expected {
            if id - expected > self.window as i64 || self.held.len() >= self.window {
                return Err(SequenceError { id, expected });
            }
            tracing::debug!(id, expected, "Holding out of order array");
            self.held.insert(id, payload);
            return Ok(Vec::new());
        }

        let mut released = vec![(id, payload)];
        self.last = id;
        while let Some(next) = self.held.remove(&(self.last + 1)) {
            self.last += 1;
            released.push((self.last, next));
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{quickcheck, TestResult};
    use serde_json::json;

    use super::*;

    #[test]
    fn releases_after_gap_fills() {
        let mut seq = ArraySequencer::new(64);
        assert_eq!(seq.accept(0, json!(["c"])).unwrap().len(), 1);
        assert!(seq.accept(2, json!(["b"])).unwrap().is_empty());
        assert!(seq.accept(0, json!(["c"])).unwrap().is_empty());
        let released = seq.accept(1, json!(["a"])).unwrap();
        assert_eq!(
            released,
            vec![(1, json!(["a"])), (2, json!(["b"]))]
        );
        assert_eq!(seq.last_array_id(), 2);
    }

    #[test]
    fn window_overflow_is_an_error() {
        let mut seq = ArraySequencer::new(4);
        assert_eq!(
            seq.accept(10, json!([])),
            Err(SequenceError {
                id: 10,
                expected: 0
            })
        );
    }

    quickcheck! {
        fn delivers_each_id_once_in_order(order: Vec<u8>) -> TestResult {
            // Ids 0..16 in an arbitrary order with arbitrary repeats
            let mut ids: Vec<i64> = order.iter().map(|i| (*i % 16) as i64).collect();
            ids.extend(0..16);
            let mut seq = ArraySequencer::new(64);
            let mut delivered = Vec::new();
            for id in ids {
                match seq.accept(id, Value::from(id)) {
                    Ok(released) => delivered.extend(released.into_iter().map(|(id, _)| id)),
                    Err(_) => return TestResult::failed(),
                }
            }
            TestResult::from_bool(delivered == (0..16).collect::<Vec<_>>())
        }
    }
}
