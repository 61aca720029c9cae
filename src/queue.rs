use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use uuid::Uuid;

use crate::model::{Job, JobDescriptor, Priority};

struct Lanes {
    lanes: [VecDeque<Job>; 4],
    closed: bool,
}

impl Lanes {
    fn lane_mut(&mut self, p: Priority) -> &mut VecDeque<Job> {
        &mut self.lanes[p as usize]
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Single-consumer, multi-producer ordered queue over four priority lanes.
/// `get()` is a condition-variable wait, matching the dedicated worker thread
/// that drives it: FIFO within a lane, lanes drained highest priority first.
pub struct PriorityQueue {
    state: Mutex<Lanes>,
    not_empty: Condvar,
    max_len: usize,
}

impl PriorityQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(Lanes {
                lanes: Default::default(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            max_len,
        }
    }

    /// Enqueues `job`. Fails without mutating the queue if it is already at
    /// capacity across all lanes.
    pub fn put(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock().unwrap();
        if state.len() >= self.max_len {
            return Err(job);
        }
        state.lane_mut(job.priority).push_back(job);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until a job is available, then pops the highest-priority,
    /// oldest-submitted head. Returns `None` once the queue has been closed
    /// and drained (used to stop the worker thread on shutdown).
    pub fn get(&self) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        loop {
            for lane in Priority::ALL {
                if let Some(job) = state.lane_mut(lane).pop_front() {
                    return Some(job);
                }
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Removes a queued job by id. Returns `true` if it was found (and thus
    /// removed) while still queued; running jobs are not visible here.
    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        for lane in Priority::ALL {
            let deque = state.lane_mut(lane);
            if let Some(pos) = deque.iter().position(|j| j.id == job_id) {
                return deque.remove(pos);
            }
        }
        None
    }

    /// Moves a queued job to a new priority lane, preserving its original
    /// submission time so FIFO-within-lane ordering still holds.
    pub fn update_priority(&self, job_id: Uuid, new_priority: Priority) -> bool {
        let mut state = self.state.lock().unwrap();
        for lane in Priority::ALL {
            let deque = state.lane_mut(lane);
            if let Some(pos) = deque.iter().position(|j| j.id == job_id) {
                let mut job = deque.remove(pos).unwrap();
                job.priority = new_priority;
                state.lane_mut(new_priority).push_back(job);
                return true;
            }
        }
        false
    }

    /// Atomic point-in-time view suitable for the `queue:state` broadcast.
    pub fn snapshot(&self) -> Vec<JobDescriptor> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(state.len());
        for lane in Priority::ALL {
            for job in &state.lanes[lane as usize] {
                out.push(JobDescriptor {
                    id: job.id,
                    priority: job.priority,
                    source: job.params.type_name().to_string(),
                });
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every queued job, marking each canceled. Used by `shutdown()`
    /// and wakes up the blocked consumer so it observes `closed` and exits.
    pub fn close_and_drain(&self) -> Vec<Job> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        let mut drained = Vec::new();
        for lane in Priority::ALL {
            drained.extend(state.lane_mut(lane).drain(..));
        }
        self.not_empty.notify_all();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobParams;

    fn job(priority: Priority) -> Job {
        Job::new(
            "corr".into(),
            priority,
            JobParams::ModeSwitch(crate::model::ModeSwitchParams { mode: "m".into() }),
            None,
        )
    }

    #[test]
    fn drains_highest_priority_first() {
        let q = PriorityQueue::new(64);
        q.put(job(Priority::Batch)).unwrap();
        q.put(job(Priority::Urgent)).unwrap();
        q.put(job(Priority::Normal)).unwrap();

        assert_eq!(q.get().unwrap().priority, Priority::Urgent);
        assert_eq!(q.get().unwrap().priority, Priority::Normal);
        assert_eq!(q.get().unwrap().priority, Priority::Batch);
    }

    #[test]
    fn fifo_within_lane() {
        let q = PriorityQueue::new(64);
        let a = job(Priority::Normal);
        let a_id = a.id;
        q.put(a).unwrap();
        let b = job(Priority::Normal);
        let b_id = b.id;
        q.put(b).unwrap();

        assert_eq!(q.get().unwrap().id, a_id);
        assert_eq!(q.get().unwrap().id, b_id);
    }

    #[test]
    fn rejects_beyond_capacity_without_mutating() {
        let q = PriorityQueue::new(1);
        q.put(job(Priority::Normal)).unwrap();
        let rejected = q.put(job(Priority::Normal));
        assert!(rejected.is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_by_id() {
        let q = PriorityQueue::new(64);
        let a = job(Priority::Normal);
        let a_id = a.id;
        q.put(a).unwrap();
        q.put(job(Priority::Normal)).unwrap();

        assert!(q.remove(a_id).is_some());
        assert_eq!(q.len(), 1);
        assert!(q.remove(a_id).is_none());
    }

    #[test]
    fn update_priority_moves_lane() {
        let q = PriorityQueue::new(64);
        let a = job(Priority::Background);
        let a_id = a.id;
        q.put(a).unwrap();
        q.put(job(Priority::Urgent)).unwrap();

        assert!(q.update_priority(a_id, Priority::Urgent));
        // `a` now ties with the existing urgent job but was enqueued later, so
        // it should drain second among urgent-lane entries.
        let first = q.get().unwrap();
        let second = q.get().unwrap();
        assert_eq!(first.priority, Priority::Urgent);
        assert_eq!(second.id, a_id);
    }

    #[test]
    fn close_and_drain_cancels_queued() {
        let q = PriorityQueue::new(64);
        q.put(job(Priority::Normal)).unwrap();
        q.put(job(Priority::Batch)).unwrap();
        let drained = q.close_and_drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.get(), None);
    }
}
