// Author: Lukas Bower
// Purpose: Poll-task queue and budget split for interrupt groups.

use std::sync::Mutex;

use crate::mac::Events;

/// Budget for one receive poll pass over a group.
pub(crate) const RX_POLL_WEIGHT: usize = 64;
/// Budget for one transmit reclaim pass over a group.
pub(crate) const TX_POLL_WEIGHT: usize = 64;

/// Which completion direction a poll task serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Rx,
    Tx,
}

/// One scheduled poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollTask {
    pub group: usize,
    pub dir: Direction,
}

/// Per-group software state: queue membership, the pending-completion word
/// carried across budget-exhausted polls, and the scheduled latches that
/// keep each (group, direction) task enqueued at most once.
#[derive(Debug, Default)]
pub(crate) struct GroupState {
    pub rx_queues: Vec<usize>,
    pub tx_queues: Vec<usize>,
    pub pending_rx: Events,
    pub pending_tx: Events,
    pub rx_scheduled: bool,
    pub tx_scheduled: bool,
}

/// Bounded FIFO of poll tasks. Interrupt dispatch pushes, the service loop
/// pops; a task that exhausts its budget re-enqueues itself instead of
/// re-arming interrupts, which is the cooperative-yield half of the
/// scheduling contract.
#[derive(Debug, Default)]
pub(crate) struct PollScheduler {
    tasks: Mutex<heapless::Deque<PollTask, 8>>,
}

impl PollScheduler {
    pub fn push(&self, task: PollTask) {
        let mut tasks = self.lock();
        // The scheduled latches upstream keep duplicates out; a full queue
        // here would mean the latches were bypassed.
        if tasks.push_back(task).is_err() {
            log::error!("poll scheduler overflow, task dropped: {task:?}");
        }
    }

    pub fn pop(&self) -> Option<PollTask> {
        self.lock().pop_front()
    }

    pub fn clear(&self) {
        let mut tasks = self.lock();
        while tasks.pop_front().is_some() {}
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, heapless::Deque<PollTask, 8>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Divide a group budget evenly across its active queues. Integer division;
/// the remainder is deliberately left unused rather than granted to any one
/// queue, so no queue is systematically favored.
#[must_use]
pub(crate) fn split_budget(budget: usize, active_queues: usize) -> usize {
    if active_queues == 0 {
        return 0;
    }
    budget / active_queues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_pop_in_push_order() {
        let sched = PollScheduler::default();
        sched.push(PollTask { group: 0, dir: Direction::Rx });
        sched.push(PollTask { group: 1, dir: Direction::Tx });
        assert_eq!(sched.pop(), Some(PollTask { group: 0, dir: Direction::Rx }));
        assert_eq!(sched.pop(), Some(PollTask { group: 1, dir: Direction::Tx }));
        assert_eq!(sched.pop(), None);
    }

    #[test]
    fn budget_split_discards_remainder() {
        assert_eq!(split_budget(64, 3), 21);
        assert_eq!(split_budget(64, 1), 64);
        assert_eq!(split_budget(5, 8), 0);
        assert_eq!(split_budget(64, 0), 0);
    }
}
