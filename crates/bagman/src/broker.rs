//! Broker contract (spec §6) and an in-memory reference implementation.
//!
//! The broker itself is explicitly out of scope (spec §1): production
//! deployments point Bagman at a real at-least-once pub/sub with per-message
//! attempt counts and visibility timeouts. `InMemoryBroker` here is a
//! same-process stand-in good enough to run the whole pipeline end-to-end in
//! tests and small single-node deployments, grounded on the same
//! `Arc<Mutex<_>>`-guarded sharing the teacher uses for its in-process
//! publish state in `engine_parallel.rs`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A message handed out by the broker. Holding this past a handler's
/// terminal branch is a bug (spec §9 design note): every branch must call
/// exactly one of `touch`/`finish`/`requeue` before returning.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub id: String,
    pub topic: String,
    pub payload: String,
    pub attempt: u32,
}

impl BrokerMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("failed to decode broker message {} on {}", self.id, self.topic))
    }
}

pub trait Broker: Send + Sync {
    fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()>;
    /// Pop the next visible message on `topic`, if any, marking it in
    /// flight until `touch`/`finish`/`requeue` is called.
    fn receive(&self, topic: &str) -> Result<Option<BrokerMessage>>;
    /// Reset the message's visibility timer without altering its attempt
    /// count or position — called periodically during long I/O.
    fn touch(&self, msg: &BrokerMessage) -> Result<()>;
    /// Acknowledge permanent completion (success or abandonment).
    fn finish(&self, msg: &BrokerMessage) -> Result<()>;
    /// Return the message to its topic, visible again after `delay`, with
    /// its attempt counter incremented.
    fn requeue(&self, msg: BrokerMessage, delay: Duration) -> Result<()>;
}

struct Entry {
    id: String,
    payload: String,
    attempt: u32,
    ready_at: Instant,
}

struct TopicQueue {
    ready: VecDeque<Entry>,
    in_flight: HashMap<String, ()>,
}

impl Default for TopicQueue {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }
}

struct State {
    topics: HashMap<String, TopicQueue>,
    next_id: u64,
}

/// Same-process broker: each topic is a FIFO queue of JSON payloads with a
/// delayed-requeue mechanism standing in for a real visibility timeout.
pub struct InMemoryBroker {
    state: Mutex<State>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                topics: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Number of messages currently ready (visible) on `topic`. Intended for
    /// tests and the discoverer's "is there already pending work" checks.
    pub fn ready_len(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }
}

impl Broker for InMemoryBroker {
    fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload).context("failed to encode broker payload")?;
        let mut state = self.state.lock().unwrap();
        let id = {
            state.next_id += 1;
            format!("msg-{}", state.next_id)
        };
        state.topics.entry(topic.to_string()).or_default().ready.push_back(Entry {
            id,
            payload: body,
            attempt: 1,
            ready_at: Instant::now(),
        });
        Ok(())
    }

    fn receive(&self, topic: &str) -> Result<Option<BrokerMessage>> {
        let mut state = self.state.lock().unwrap();
        let queue = state.topics.entry(topic.to_string()).or_default();
        let now = Instant::now();
        let idx = queue.ready.iter().position(|e| e.ready_at <= now);
        let Some(idx) = idx else {
            return Ok(None);
        };
        let entry = queue.ready.remove(idx).unwrap();
        queue.in_flight.insert(entry.id.clone(), ());
        Ok(Some(BrokerMessage {
            id: entry.id,
            topic: topic.to_string(),
            payload: entry.payload,
            attempt: entry.attempt,
        }))
    }

    fn touch(&self, msg: &BrokerMessage) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state
            .topics
            .get(&msg.topic)
            .map(|q| q.in_flight.contains_key(&msg.id))
            .unwrap_or(false)
        {
            bail!("touch on unknown/not-in-flight message {}", msg.id);
        }
        Ok(())
    }

    fn finish(&self, msg: &BrokerMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.topics.get_mut(&msg.topic) {
            queue.in_flight.remove(&msg.id);
        }
        Ok(())
    }

    fn requeue(&self, msg: BrokerMessage, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let queue = state.topics.entry(msg.topic.clone()).or_default();
        queue.in_flight.remove(&msg.id);
        queue.ready.push_back(Entry {
            id: msg.id,
            payload: msg.payload,
            attempt: msg.attempt + 1,
            ready_at: Instant::now() + delay,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        n: u32,
    }

    #[test]
    fn publish_then_receive_round_trips() {
        let broker = InMemoryBroker::new();
        broker.publish("t", &Payload { n: 7 }).unwrap();
        let msg = broker.receive("t").unwrap().unwrap();
        assert_eq!(msg.decode::<Payload>().unwrap(), Payload { n: 7 });
        assert_eq!(msg.attempt, 1);
        broker.finish(&msg).unwrap();
    }

    #[test]
    fn requeue_with_delay_is_not_immediately_visible() {
        let broker = InMemoryBroker::new();
        broker.publish("t", &Payload { n: 1 }).unwrap();
        let msg = broker.receive("t").unwrap().unwrap();
        broker.requeue(msg, Duration::from_secs(3600)).unwrap();
        assert!(broker.receive("t").unwrap().is_none());
        assert_eq!(broker.ready_len("t"), 1);
    }

    #[test]
    fn requeue_increments_attempt_counter() {
        let broker = InMemoryBroker::new();
        broker.publish("t", &Payload { n: 1 }).unwrap();
        let msg = broker.receive("t").unwrap().unwrap();
        broker.requeue(msg, Duration::ZERO).unwrap();
        let msg2 = broker.receive("t").unwrap().unwrap();
        assert_eq!(msg2.attempt, 2);
    }

    #[test]
    fn empty_topic_returns_none() {
        let broker = InMemoryBroker::new();
        assert!(broker.receive("nothing-here").unwrap().is_none());
    }
}
