//! Deterministic hash-based worker assignment.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use clippy_utilities::NumericCast;

use super::worker_client::WorkerInfo;

/// Assigns a file to a worker by hashing its path over the current active
/// worker set. Deterministic for a fixed worker set: the same path always
/// lands on the same worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashBasedWorkerAssignPolicy;

impl HashBasedWorkerAssignPolicy {
    /// Pick a worker for `path`, or `None` when no worker is available.
    #[must_use]
    pub fn pick_worker<'a>(&self, path: &str, workers: &'a [WorkerInfo]) -> Option<&'a WorkerInfo> {
        if workers.is_empty() {
            return None;
        }
        let mut sorted: Vec<&WorkerInfo> = workers.iter().collect();
        sorted.sort_by_key(|worker| worker.id);
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let index: usize = (hasher.finish() % sorted.len().numeric_cast::<u64>()).numeric_cast();
        sorted.get(index).copied()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn workers(count: u64) -> Vec<WorkerInfo> {
        (0..count)
            .map(|id| WorkerInfo {
                id,
                address: format!("worker-{id}:29999"),
            })
            .collect()
    }

    #[test]
    fn test_no_worker() {
        let policy = HashBasedWorkerAssignPolicy;
        assert!(policy.pick_worker("/a", &[]).is_none());
    }

    #[test]
    fn test_deterministic() {
        let policy = HashBasedWorkerAssignPolicy;
        let workers = workers(5);
        let first = policy.pick_worker("/data/part-00000", &workers).unwrap();
        let second = policy.pick_worker("/data/part-00000", &workers).unwrap();
        assert_eq!(first, second);

        // The order the workers are listed in does not matter.
        let mut shuffled = workers.clone();
        shuffled.reverse();
        let third = policy.pick_worker("/data/part-00000", &shuffled).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_spreads_over_workers() {
        let policy = HashBasedWorkerAssignPolicy;
        let workers = workers(8);
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let worker = policy
                .pick_worker(&format!("/data/part-{i:05}"), &workers)
                .unwrap();
            seen.insert(worker.id);
        }
        assert!(seen.len() > 1);
    }
}
