//! Overview of scheduling during recording:
//!
//! We honour priorities set by setpriority(2), even in situations where the
//! kernel doesn't, e.g. when a non-privileged task tries to increase its
//! priority. Normally priorities are honored strictly by scheduling the
//! highest priority runnable task; tasks with equal priorities are scheduled
//! in round-robin fashion. Strict priority scheduling helps find bugs due to
//! starvation.
//!
//! When a task calls sched_yield we temporarily switch to a completely
//! fair scheduler that ignores priorities. All tasks are placed on a queue
//! and while the queue is non-empty we take the next task from the queue and
//! run it for a quantum if it's runnable. We do this because tasks calling
//! sched_yield are often expecting some kind of fair scheduling and may
//! deadlock (e.g. trying to acquire a spinlock) if some other tasks don't
//! get a chance to run.
//!
//! The scheduler only runs during recording. During replay we're just
//! replaying the recorded scheduling decisions.
//!
//! The main interface to the scheduler is `reschedule`. This gets called
//! after every recorded event to decide which task to run next.
//!
//! The scheduler gives the current task a 'timeslice', a ticks deadline
//! after which we will try to switch to another task. So `reschedule` first
//! checks whether the currently running task has exceeded that deadline. If
//! not, and the current task is runnable, we schedule it again. If it's
//! blocked or has exceeded its deadline, we search for another task to run:
//! taking tasks from the round-robin queue until we find one that's
//! runnable, and then if the round-robin queue is empty, choosing the
//! highest-priority task that's runnable. If the highest-priority runnable
//! task has the same priority as the current task, choose the next runnable
//! task after the current task (so equal priority tasks run in round-robin
//! order).
//!
//! The main parameter to the scheduler is `max_ticks_`, which controls the
//! length of each timeslice.

use crate::{
    event::Switchable,
    log::LogLevel::LogDebug,
    session::Session,
    ticks::Ticks,
    util::monotonic_now_sec,
    wait_status::WaitStatus,
};
use libc::{pid_t, __WALL};
use rand::Rng;
use std::collections::{BTreeSet, VecDeque};

/// Like most task schedulers, there are conflicting goals to balance. Lower
/// max-ticks generally makes the application more "interactive", generally
/// speaking lower latency, and creates more opportunity for bugs to arise in
/// multi-threaded/process applications. This comes at the cost of more
/// overhead from scheduling and context switching, since context switches
/// during recording require switching to the supervisor and then to the next
/// tracee task. Using ticks (retired conditional branches) to compute
/// timeslices is quite crude, since they don't correspond to any unit of
/// time in general. Empirical data suggest a distribution of insns/rcb
/// massed around 10, which for a nominal 2GHz CPU implies ~50,000 ticks per
/// millisecond. The default gives us 10ms timeslices, i.e. 500,000 ticks.
pub const DEFAULT_MAX_TICKS: Ticks = 500_000;

/// Tasks sorted by priority.
type TaskPrioritySet = BTreeSet<(i32, pid_t)>;
type TaskQueue = VecDeque<pid_t>;

#[derive(Copy, Clone, Default, Debug)]
pub struct Rescheduled {
    /// The task chosen, by rec_tid; None when every tracee is dead.
    pub tid: Option<pid_t>,
    /// True when runnability was determined by observing a waitpid status
    /// change. That status must be consumed by the caller without re-probing
    /// runnability, because the state could change again.
    pub by_waitpid: bool,
    /// True when the blocking wait was interrupted by a signal to the
    /// supervisor.
    pub interrupted_by_signal: bool,
}

pub struct Scheduler {
    /// Every task of the session is either in task_priority_set
    /// (when in_round_robin_queue is false), or in task_round_robin_queue
    /// (when in_round_robin_queue is true).
    ///
    /// task_priority_set is a set of pairs of (task->priority, tid). This
    /// lets us efficiently iterate over the tasks with a given priority, or
    /// all tasks in priority order.
    task_priority_set: TaskPrioritySet,
    task_round_robin_queue: TaskQueue,

    /// The currently scheduled task. This may be None if the last scheduled
    /// task has been destroyed.
    current_: Option<pid_t>,
    current_timeslice_end_: Ticks,

    /// At this time (or later) we should refresh these values.
    high_priority_only_intervals_refresh_time: f64,
    high_priority_only_intervals_start: f64,
    high_priority_only_intervals_duration: f64,
    high_priority_only_intervals_period: f64,
    /// At this time (or later) we should rerandomize task priorities.
    priorities_refresh_time: f64,

    max_ticks_: Ticks,

    /// When a waitpid status change chose the task, it must be run next;
    /// re-probing its runnability could consume a state change.
    must_run_task: Option<pid_t>,

    pretend_num_cores_: u32,

    /// When true, context switch at every possible point.
    always_switch: bool,
    /// When true, make random scheduling decisions to try to increase the
    /// probability of finding buggy schedules.
    enable_chaos: bool,

    last_reschedule_in_high_priority_only_interval: bool,
}

impl Scheduler {
    pub fn new(max_ticks: Ticks) -> Scheduler {
        Scheduler {
            task_priority_set: Default::default(),
            task_round_robin_queue: Default::default(),
            current_: None,
            current_timeslice_end_: 0,
            high_priority_only_intervals_refresh_time: 0.0,
            high_priority_only_intervals_start: 0.0,
            high_priority_only_intervals_duration: 0.0,
            high_priority_only_intervals_period: 0.0,
            priorities_refresh_time: 0.0,
            max_ticks_: max_ticks,
            must_run_task: None,
            pretend_num_cores_: 1,
            always_switch: false,
            enable_chaos: false,
            last_reschedule_in_high_priority_only_interval: false,
        }
    }

    pub fn set_max_ticks(&mut self, max_ticks: Ticks) {
        self.max_ticks_ = max_ticks;
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks_
    }

    pub fn set_always_switch(&mut self, always_switch: bool) {
        self.always_switch = always_switch;
    }

    pub fn set_enable_chaos(&mut self, enable_chaos: bool) {
        self.enable_chaos = enable_chaos;
        if enable_chaos {
            // Pretend to have one core so tracees don't spin expecting
            // parallelism that chaos scheduling will never grant.
            self.pretend_num_cores_ = 1;
        } else {
            self.pretend_num_cores_ = std::cmp::max(1, num_cores() / 2);
        }
    }

    /// The number of cores we report to applications.
    pub fn pretend_num_cores(&self) -> u32 {
        self.pretend_num_cores_
    }

    pub fn current(&self) -> Option<pid_t> {
        self.current_
    }

    pub fn set_current(&mut self, tid: Option<pid_t>) {
        self.current_ = tid;
    }

    pub fn current_timeslice_end(&self) -> Ticks {
        self.current_timeslice_end_
    }

    pub fn expire_timeslice(&mut self) {
        self.current_timeslice_end_ = 0;
    }

    /// How long to let the tracee run before a chaos-mode preemption check,
    /// in seconds.
    pub fn interrupt_after_elapsed_time(&self) -> f64 {
        if self.enable_chaos {
            0.001
        } else {
            1.0
        }
    }

    pub fn on_create(&mut self, tid: pid_t, priority: i32) {
        debug_assert!(self.must_run_task != Some(tid));
        if self.enable_chaos {
            let priority = choose_random_priority();
            self.task_priority_set.insert((priority, tid));
        } else {
            self.task_priority_set.insert((priority, tid));
        }
    }

    /// De-register a thread. This function should be called when a thread
    /// exits.
    pub fn on_destroy(&mut self, tid: pid_t, priority: i32) {
        if self.current_ == Some(tid) {
            self.current_ = None;
        }
        if self.must_run_task == Some(tid) {
            self.must_run_task = None;
        }
        self.task_priority_set.remove(&(priority, tid));
        self.task_round_robin_queue.retain(|&t| t != tid);
    }

    /// Set the priority of the task to `value` and update related state.
    pub fn update_task_priority(&mut self, tid: pid_t, old_value: i32, value: i32) {
        if self.task_priority_set.remove(&(old_value, tid)) {
            self.task_priority_set.insert((value, tid));
        }
        // A task in the round-robin queue keeps its queue position; the new
        // priority takes effect when the queue drains.
    }

    /// Do one round of round-robin scheduling if we're not already doing
    /// one. If we start round-robin scheduling now, make last_task the last
    /// task to be scheduled. If the task_round_robin_queue is empty this
    /// moves all tasks into it, putting last_task last.
    pub fn schedule_one_round_robin(&mut self, last_tid: pid_t, last_priority: i32) {
        if !self.task_round_robin_queue.is_empty() {
            return;
        }

        for &(_, tid) in self.task_priority_set.iter() {
            if tid != last_tid {
                self.task_round_robin_queue.push_back(tid);
            }
        }
        self.task_round_robin_queue.push_back(last_tid);
        self.task_priority_set.clear();
        let _ = last_priority;
        self.expire_timeslice();
    }

    /// Schedule a new runnable task (which may be the same as the current
    /// one).
    ///
    /// The chosen task is guaranteed to either have already been runnable,
    /// or have been made runnable by a waitpid status change (in which case
    /// `by_waitpid` is true).
    pub fn reschedule(&mut self, session: &dyn Session, switchable: Switchable) -> Rescheduled {
        let mut result = Rescheduled::default();
        let now = monotonic_now_sec();

        self.must_run_task = None;
        if self.enable_chaos {
            self.maybe_reset_priorities(session, now);
            self.maybe_reset_high_priority_only_intervals(now);
            self.last_reschedule_in_high_priority_only_interval =
                self.in_high_priority_only_interval(now);
        }

        if switchable == Switchable::PreventSwitch {
            if let Some(current) = self.current_ {
                log!(LogDebug, "  (switching disabled, sticking with {})", current);
                let mut by_waitpid = false;
                if !self.is_task_runnable(session, current, &mut by_waitpid) {
                    // The no-switch task is blocked; we have no choice but
                    // to wait for it.
                    self.wait_for(session, current, &mut result);
                    if result.interrupted_by_signal {
                        return result;
                    }
                    result.by_waitpid = true;
                }
                result.by_waitpid |= by_waitpid;
                result.tid = Some(current);
                if result.by_waitpid {
                    self.must_run_task = Some(current);
                }
                return result;
            }
        }

        loop {
            let mut by_waitpid = false;
            let next = self.find_next_runnable_task(session, &mut by_waitpid);

            if let Some(next) = next {
                result.tid = Some(next);
                result.by_waitpid = by_waitpid;
                if by_waitpid {
                    self.must_run_task = Some(next);
                }
                if self.current_ != Some(next) {
                    log!(LogDebug, "  switching to task {}", next);
                    self.expire_timeslice();
                }
                self.current_ = Some(next);
                if self.current_timeslice_end_ == 0 {
                    self.setup_new_timeslice(session, next);
                }
                return result;
            }

            if self.task_priority_set.is_empty() && self.task_round_robin_queue.is_empty() {
                // Every tracee is dead.
                return result;
            }

            // All tasks are blocked; block in waitpid until one of them
            // changes state.
            log!(LogDebug, "  all tasks blocked, waiting for any status change");
            let mut raw_status: i32 = 0;
            let ret = unsafe { libc::waitpid(-1, &mut raw_status, __WALL) };
            if ret < 0 {
                // EINTR: recording is being terminated by a signal to the
                // supervisor.
                result.interrupted_by_signal = true;
                return result;
            }
            let status = WaitStatus::new(raw_status);
            if let Some(t) = session.find_task_from_rec_tid(ret) {
                t.borrow_mut().as_task_inner_mut().did_waitpid(status);
                result.by_waitpid = true;
                self.must_run_task = Some(ret);
                result.tid = Some(ret);
                if self.current_ != Some(ret) {
                    self.expire_timeslice();
                }
                self.current_ = Some(ret);
                if self.current_timeslice_end_ == 0 {
                    self.setup_new_timeslice(session, ret);
                }
                return result;
            }
            // A status for a task we don't know (yet); drop it and retry.
        }
    }

    // --- Selection --------------------------------------------------------

    /// Pull a task from the round-robin queue if available. Otherwise,
    /// find the highest-priority task that is runnable. If the
    /// highest-priority runnable task has the same priority as the current
    /// task, return the next runnable task after the current task in
    /// round-robin order.
    fn find_next_runnable_task(
        &mut self,
        session: &dyn Session,
        by_waitpid: &mut bool,
    ) -> Option<pid_t> {
        // Round-robin queue first. One full rotation with nothing runnable
        // means everyone in the queue is blocked.
        if !self.task_round_robin_queue.is_empty() {
            for _ in 0..self.task_round_robin_queue.len() {
                let tid = *self.task_round_robin_queue.front().unwrap();
                if self.is_task_runnable(session, tid, by_waitpid) {
                    return Some(tid);
                }
                // Head is blocked; rotate it to the back so others get
                // their quantum.
                self.task_round_robin_queue.pop_front();
                self.task_round_robin_queue.push_back(tid);
            }
            return None;
        }

        let now = monotonic_now_sec();
        let in_high_priority_window = self.enable_chaos && self.in_high_priority_only_interval(now);

        let priorities: Vec<i32> = {
            let mut ps: Vec<i32> = self.task_priority_set.iter().map(|&(p, _)| p).collect();
            ps.dedup();
            ps
        };

        for priority in priorities {
            if in_high_priority_window {
                if let Some(&(min_priority, _)) = self.task_priority_set.iter().next() {
                    if priority > min_priority {
                        // Within a high-priority-only window, lower-priority
                        // tasks are frozen to surface starvation bugs.
                        break;
                    }
                }
            }

            let same_priority: Vec<pid_t> = self
                .task_priority_set
                .iter()
                .filter(|&&(p, _)| p == priority)
                .map(|&(_, tid)| tid)
                .collect();

            // Round-robin within the priority band: start after the current
            // task when it belongs to this band.
            let ordered = rotate_after(&same_priority, self.current_);

            for tid in ordered {
                if self.is_task_runnable(session, tid, by_waitpid) {
                    return Some(tid);
                }
            }
        }
        None
    }

    /// Runnability probe. A state change observed here sets `by_waitpid`
    /// and the task must then be scheduled without re-probing.
    fn is_task_runnable(
        &mut self,
        session: &dyn Session,
        tid: pid_t,
        by_waitpid: &mut bool,
    ) -> bool {
        debug_assert!(self.must_run_task.is_none() || self.must_run_task == Some(tid));

        let t = match session.find_task_from_rec_tid(tid) {
            Some(t) => t,
            None => return false,
        };
        let mut task = t.borrow_mut();
        let inner = task.as_task_inner_mut();
        if inner.is_stopped() {
            return true;
        }
        if inner.try_wait() {
            *by_waitpid = true;
            return true;
        }
        false
    }

    fn wait_for(&mut self, session: &dyn Session, tid: pid_t, result: &mut Rescheduled) {
        let t = match session.find_task_from_rec_tid(tid) {
            Some(t) => t,
            None => return,
        };
        let mut task = t.borrow_mut();
        let inner = task.as_task_inner_mut();
        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(tid, &mut raw_status, __WALL) };
        if ret < 0 {
            result.interrupted_by_signal = true;
            return;
        }
        inner.did_waitpid(WaitStatus::new(raw_status));
    }

    fn setup_new_timeslice(&mut self, session: &dyn Session, tid: pid_t) {
        let mut max_timeslice = self.max_ticks_;
        if self.enable_chaos {
            // Hypothesis: some bugs require short timeslices to expose. But
            // maybe some bugs require long timeslices to expose. So, try
            // both.
            let mut rng = rand::thread_rng();
            if rng.gen::<bool>() {
                max_timeslice = rng.gen_range(1, self.max_ticks_);
            }
        }
        let ticks_now = session
            .find_task_from_rec_tid(tid)
            .map(|t| t.borrow().tick_count())
            .unwrap_or(0);
        self.current_timeslice_end_ = ticks_now + max_timeslice;
    }

    fn maybe_reset_priorities(&mut self, session: &dyn Session, now: f64) {
        if now < self.priorities_refresh_time {
            return;
        }
        // Reset task priorities again at some point in the future.
        let mut rng = rand::thread_rng();
        self.priorities_refresh_time = now + rng.gen::<f64>() * 0.5;
        let tids: Vec<(i32, pid_t)> = self.task_priority_set.iter().copied().collect();
        self.task_priority_set.clear();
        for (_, tid) in tids {
            self.task_priority_set.insert((choose_random_priority(), tid));
        }
        let _ = session;
    }

    fn maybe_reset_high_priority_only_intervals(&mut self, now: f64) {
        if now < self.high_priority_only_intervals_refresh_time {
            return;
        }
        let mut rng = rand::thread_rng();
        let duration_step = rng.gen_range(1, 11) as f64;
        self.high_priority_only_intervals_duration = 0.0001 * 6.0f64.powf(duration_step);
        self.high_priority_only_intervals_period =
            self.high_priority_only_intervals_duration / 0.08;
        self.high_priority_only_intervals_start =
            now + rng.gen::<f64>() * self.high_priority_only_intervals_period;
        self.high_priority_only_intervals_refresh_time = now + 8.0;
    }

    fn in_high_priority_only_interval(&self, now: f64) -> bool {
        if now < self.high_priority_only_intervals_start
            || self.high_priority_only_intervals_period == 0.0
        {
            return false;
        }
        let mod_time = (now - self.high_priority_only_intervals_start)
            % self.high_priority_only_intervals_period;
        mod_time < self.high_priority_only_intervals_duration
    }

    pub fn in_round_robin_mode(&self) -> bool {
        !self.task_round_robin_queue.is_empty()
    }

    /// The task's round-robin quantum is over; return it to the priority
    /// set. When the queue drains, normal priority scheduling resumes.
    pub fn maybe_pop_round_robin_task(&mut self, tid: pid_t, priority: i32) {
        if self.task_round_robin_queue.front() == Some(&tid) {
            self.task_round_robin_queue.pop_front();
            self.task_priority_set.insert((priority, tid));
        }
    }
}

/// Rotate `tids` so iteration starts just after `current` (round-robin
/// successor order). When `current` isn't in the band, the order is
/// unchanged.
fn rotate_after(tids: &[pid_t], current: Option<pid_t>) -> Vec<pid_t> {
    let pos = match current.and_then(|c| tids.iter().position(|&t| t == c)) {
        Some(p) => p,
        None => return tids.to_vec(),
    };
    let mut result = Vec::with_capacity(tids.len());
    result.extend_from_slice(&tids[pos + 1..]);
    result.extend_from_slice(&tids[..=pos]);
    result
}

fn choose_random_priority() -> i32 {
    let mut rng = rand::thread_rng();
    // Negative niceness is possible here where the kernel would refuse it;
    // starving a "privileged" task is exactly the kind of schedule chaos
    // mode wants to explore.
    rng.gen_range(-4, 20)
}

fn num_cores() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        1
    } else {
        n as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_robin_successor_order() {
        let tids = vec![10, 11, 12];
        assert_eq!(vec![11, 12, 10], rotate_after(&tids, Some(10)));
        assert_eq!(vec![10, 11, 12], rotate_after(&tids, Some(12)));
        assert_eq!(vec![10, 11, 12], rotate_after(&tids, None));
        assert_eq!(vec![10, 11, 12], rotate_after(&tids, Some(99)));
    }

    #[test]
    fn priority_set_orders_by_priority_then_tid() {
        let mut s = Scheduler::new(DEFAULT_MAX_TICKS);
        s.on_create(30, 1);
        s.on_create(10, 0);
        s.on_create(20, 0);
        let order: Vec<(i32, pid_t)> = s.task_priority_set.iter().copied().collect();
        assert_eq!(vec![(0, 10), (0, 20), (1, 30)], order);
    }

    #[test]
    fn destroy_removes_everywhere() {
        let mut s = Scheduler::new(DEFAULT_MAX_TICKS);
        s.on_create(10, 0);
        s.on_create(11, 0);
        s.set_current(Some(10));
        s.schedule_one_round_robin(10, 0);
        assert!(s.in_round_robin_mode());
        s.on_destroy(10, 0);
        assert_eq!(None, s.current());
        assert!(!s.task_round_robin_queue.contains(&10));
    }

    #[test]
    fn round_robin_puts_last_task_last() {
        let mut s = Scheduler::new(DEFAULT_MAX_TICKS);
        s.on_create(10, 0);
        s.on_create(11, 0);
        s.on_create(12, 0);
        s.schedule_one_round_robin(11, 0);
        let q: Vec<pid_t> = s.task_round_robin_queue.iter().copied().collect();
        assert_eq!(vec![10, 12, 11], q);
        assert!(s.task_priority_set.is_empty());
    }

    #[test]
    fn update_priority_moves_band() {
        let mut s = Scheduler::new(DEFAULT_MAX_TICKS);
        s.on_create(10, 0);
        s.update_task_priority(10, 0, 5);
        let order: Vec<(i32, pid_t)> = s.task_priority_set.iter().copied().collect();
        assert_eq!(vec![(5, 10)], order);
    }
}
