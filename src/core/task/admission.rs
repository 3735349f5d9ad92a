use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::request::DownloadId;
use super::state::Priority;

#[derive(Debug, PartialEq, Eq)]
struct Admission {
    priority: Priority,
    sequence: u64,
    id: DownloadId,
}

impl Ord for Admission {
    fn cmp(&self, other: &Self) -> Ordering {
        // 优先级高的先出队，同优先级按提交顺序
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Admission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 等待调度的任务
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    heap: BinaryHeap<Admission>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: DownloadId, priority: Priority, sequence: u64) {
        self.heap.push(Admission { priority, sequence, id });
    }

    pub fn pop(&mut self) -> Option<DownloadId> {
        self.heap.pop().map(|a| a.id)
    }

    pub fn remove(&mut self, id: DownloadId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|a| a.id != id);
        before != self.heap.len()
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        self.heap.iter().any(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = AdmissionQueue::new();
        queue.push(DownloadId::from(1), Priority::Low, 1);
        queue.push(DownloadId::from(2), Priority::High, 2);
        queue.push(DownloadId::from(3), Priority::Low, 3);
        queue.push(DownloadId::from(4), Priority::High, 4);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|id| id.as_u64()).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_resume_keeps_original_sequence() {
        let mut queue = AdmissionQueue::new();
        queue.push(DownloadId::from(5), Priority::Medium, 9);
        queue.push(DownloadId::from(6), Priority::Medium, 3);
        assert_eq!(queue.pop(), Some(DownloadId::from(6)));
    }

    #[test]
    fn test_remove() {
        let mut queue = AdmissionQueue::new();
        queue.push(DownloadId::from(1), Priority::Medium, 1);
        queue.push(DownloadId::from(2), Priority::Immediate, 2);
        assert!(queue.remove(DownloadId::from(2)));
        assert!(!queue.remove(DownloadId::from(2)));
        assert!(!queue.contains(DownloadId::from(2)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(DownloadId::from(1)));
        assert!(queue.is_empty());
    }
}
