use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use task_queue_core::{Priority, TaskId, TaskMessage};

/// A message wrapper ordering by ready time, then priority, then arrival
#[derive(Clone)]
struct ScheduledMessage {
    ready_at: Option<DateTime<Utc>>,
    priority: Priority,
    seq: u64,
    message: TaskMessage,
}

impl PartialEq for ScheduledMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledMessage {}

impl PartialOrd for ScheduledMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest ready time must compare greatest.
        // Messages without an ETA sort before any scheduled one.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<ScheduledMessage>,
    removed: HashSet<u64>,
    next_seq: u64,
}

/// In-memory queue of task messages honoring their ETA
pub struct MessageQueue {
    state: RwLock<QueueState>,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue {
            state: RwLock::new(QueueState {
                heap: BinaryHeap::new(),
                removed: HashSet::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn push(&self, message: TaskMessage) {
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(ScheduledMessage {
            ready_at: message.ready_at(),
            priority: message.priority.unwrap_or_default(),
            seq,
            message,
        });
    }

    /// Pop the earliest message whose ETA has passed at `now`
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Option<TaskMessage> {
        let mut state = self.state.write();
        Self::skip_removed(&mut state);

        let ready = state
            .heap
            .peek()
            .map_or(false, |top| top.ready_at.map_or(true, |at| at <= now));
        if ready {
            state.heap.pop().map(|s| s.message)
        } else {
            None
        }
    }

    /// Pop the earliest message regardless of its ETA
    pub fn pop_any(&self) -> Option<TaskMessage> {
        let mut state = self.state.write();
        Self::skip_removed(&mut state);
        state.heap.pop().map(|s| s.message)
    }

    /// Take every queued message with `task_id` out of the queue
    pub fn remove(&self, task_id: &TaskId) -> Vec<TaskMessage> {
        let mut state = self.state.write();
        let taken: Vec<(u64, TaskMessage)> = state
            .heap
            .iter()
            .filter(|s| &s.message.id == task_id && !state.removed.contains(&s.seq))
            .map(|s| (s.seq, s.message.clone()))
            .collect();

        let mut messages = Vec::with_capacity(taken.len());
        for (seq, message) in taken {
            state.removed.insert(seq);
            messages.push(message);
        }
        messages
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.heap.len() - state.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn skip_removed(state: &mut QueueState) {
        while let Some(top) = state.heap.peek() {
            let seq = top.seq;
            if !state.removed.remove(&seq) {
                break;
            }
            state.heap.pop();
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fifo_for_immediate_messages() {
        let queue = MessageQueue::new();

        let first = TaskMessage::builder("t1").build();
        let second = TaskMessage::builder("t2").build();

        queue.push(first.clone());
        queue.push(second.clone());

        let now = Utc::now();
        assert_eq!(queue.pop_ready(now).unwrap().id, first.id);
        assert_eq!(queue.pop_ready(now).unwrap().id, second.id);
        assert!(queue.pop_ready(now).is_none());
    }

    #[test]
    fn test_scheduled_messages() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let future = TaskMessage::builder("future").eta(now + Duration::hours(1)).build();
        let immediate = TaskMessage::builder("immediate").build();

        queue.push(future.clone());
        queue.push(immediate.clone());

        // Should get the immediate message first even though it arrived later
        assert_eq!(queue.pop_ready(now).unwrap().id, immediate.id);

        // Future message shouldn't be available yet
        assert!(queue.pop_ready(now).is_none());
        assert_eq!(queue.len(), 1);

        assert_eq!(
            queue.pop_ready(now + Duration::hours(2)).unwrap().id,
            future.id
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_priority_among_ready_messages() {
        let queue = MessageQueue::new();

        let low = TaskMessage::builder("low").priority(Priority::low()).build();
        let plain = TaskMessage::builder("plain").build();
        let high = TaskMessage::builder("high").priority(Priority::high()).build();
        queue.push(low.clone());
        queue.push(plain.clone());
        queue.push(high.clone());

        let now = Utc::now();
        assert_eq!(queue.pop_ready(now).unwrap().id, high.id);
        assert_eq!(queue.pop_ready(now).unwrap().id, plain.id);
        assert_eq!(queue.pop_ready(now).unwrap().id, low.id);
    }

    #[test]
    fn test_remove_message() {
        let queue = MessageQueue::new();

        let message = TaskMessage::builder("test").build();
        let other = TaskMessage::builder("other").build();
        queue.push(message.clone());
        queue.push(other.clone());
        assert_eq!(queue.len(), 2);

        let removed = queue.remove(&message.id);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].task, "test");
        assert!(queue.remove(&message.id).is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_any().unwrap().id, other.id);
        assert!(queue.is_empty());
    }
}
