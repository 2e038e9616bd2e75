//! Scheduling: next-task selection, the timer tick, and the sleep/timer
//! calls that feed it.
//!
//! Selection:
//! - alarms that have expired raise SIGALRM
//! - interruptible sleepers with an unblocked pending signal become runnable
//! - the runnable task with the largest remaining `counter` wins, lowest
//!   slot on ties; the idle task only runs when nothing else can
//! - if every runnable task has used up its slice, all tasks are refilled
//!   with `counter = counter / 2 + priority`, which favours sleepers

use super::context::Switch;
use super::table::TaskTable;
use super::{Pid, TaskError, TaskState, WaitChannel};
use crate::config::{HZ, IDLE_SLOT};
use crate::kernel::Kernel;
use crate::signal::constants::SIGALRM;

impl TaskTable {
    /// Choose the next task and make it current.
    pub fn schedule(&mut self, jiffies: u64) -> Switch {
        for (slot, task) in self.iter_mut() {
            if slot == IDLE_SLOT {
                continue;
            }
            if task.alarm != 0 && task.alarm <= jiffies {
                task.signals.set_pending(SIGALRM);
                task.alarm = 0;
            }
            if task.state == TaskState::InterruptibleWait && task.signals.has_deliverable_signals() {
                task.state = TaskState::Runnable;
                task.wait_channel = None;
            }
        }

        let next = loop {
            match self.pick_next() {
                None => break IDLE_SLOT,
                Some((slot, counter)) if counter > 0 => break slot,
                Some(_) => {
                    for (_, task) in self.iter_mut() {
                        task.counter = task.counter / 2 + task.priority;
                    }
                }
            }
        };
        self.switch_to(next)
    }

    /// Runnable non-idle task with the highest counter, lowest slot first.
    pub fn pick_next(&self) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32)> = None;
        for (slot, task) in self.iter() {
            if slot == IDLE_SLOT || task.state != TaskState::Runnable {
                continue;
            }
            if best.map_or(true, |(_, counter)| task.counter > counter) {
                best = Some((slot, task.counter));
            }
        }
        best
    }
}

impl Kernel {
    pub fn schedule(&mut self) -> Switch {
        let switch = self.tasks.schedule(self.jiffies);
        if switch.switched() {
            self.stats.context_switches += 1;
        }
        #[cfg(feature = "testing")]
        if let Err(e) = self.check_invariants() {
            log::error!("invariant broken after schedule: {}", e);
            panic!("kernel invariant violated: {}", e);
        }
        switch
    }

    /// Timer tick. Charges the current task and preempts it when its slice
    /// runs out, but only if the tick interrupted user mode.
    pub fn timer_interrupt(&mut self, user_mode: bool) -> Option<Switch> {
        self.jiffies += 1;
        let slot = self.tasks.current_slot();
        let task = self.tasks.task_mut(slot)?;
        if user_mode {
            task.times.utime += 1;
        } else {
            task.times.stime += 1;
        }
        task.counter = task.counter.saturating_sub(1);
        if task.counter > 0 || !user_mode {
            return None;
        }
        Some(self.schedule())
    }

    /// Arrange SIGALRM after `seconds` (0 cancels). Returns the whole
    /// seconds that were left on the previous alarm.
    pub fn alarm(&mut self, pid: Pid, seconds: u32) -> Result<u32, TaskError> {
        let jiffies = self.jiffies;
        let task = self.live_task_mut(pid)?;
        let old = if task.alarm > jiffies {
            ((task.alarm - jiffies) / HZ) as u32
        } else {
            0
        };
        task.alarm = if seconds > 0 {
            jiffies + seconds as u64 * HZ
        } else {
            0
        };
        Ok(old)
    }

    /// Sleep until a signal arrives. Returns the switch if `pid` was current.
    pub fn pause(&mut self, pid: Pid) -> Result<Option<Switch>, TaskError> {
        let slot = self.live_slot(pid)?;
        if slot == IDLE_SLOT {
            return Ok(None);
        }
        if let Some(task) = self.tasks.task_mut(slot) {
            task.state = TaskState::InterruptibleWait;
            task.wait_channel = Some(WaitChannel::Pause);
        }
        if slot == self.tasks.current_slot() {
            return Ok(Some(self.schedule()));
        }
        Ok(None)
    }

    /// Lower the task's priority by `increment`, never below 1.
    pub fn nice(&mut self, pid: Pid, increment: u32) -> Result<u32, TaskError> {
        let task = self.live_task_mut(pid)?;
        if task.priority > increment {
            task.priority -= increment;
        }
        Ok(task.priority)
    }

    /// Put the current task to sleep on `channel` and reschedule.
    pub fn sleep_on(&mut self, channel: WaitChannel, interruptible: bool) -> Option<Switch> {
        self.tasks.sleep_on(channel, interruptible)?;
        Some(self.schedule())
    }

    pub fn wake_up(&mut self, channel: WaitChannel) -> usize {
        self.tasks.wake_up(channel)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::KernelConfig;
    use crate::kernel::Kernel;
    use crate::task::{Pid, TaskState};

    fn kernel_with_children(n: usize) -> (Kernel, Vec<Pid>) {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pids = (0..n).map(|_| kernel.fork(Pid::ROOT).unwrap()).collect();
        (kernel, pids)
    }

    #[test]
    fn ties_go_to_the_lowest_slot() {
        let (mut kernel, pids) = kernel_with_children(3);
        let switch = kernel.schedule();
        assert_eq!(switch.to, pids[0]);
    }

    #[test]
    fn highest_counter_wins() {
        let (mut kernel, pids) = kernel_with_children(3);
        kernel.tasks.get_mut(pids[2]).unwrap().counter = 40;
        assert_eq!(kernel.schedule().to, pids[2]);
    }

    #[test]
    fn idle_runs_when_nothing_else_can() {
        let (mut kernel, pids) = kernel_with_children(1);
        kernel.tasks.get_mut(pids[0]).unwrap().state = TaskState::UninterruptibleWait;
        assert_eq!(kernel.schedule().to, Pid::ROOT);
    }

    #[test]
    fn exhausted_slices_are_refilled_with_half_carry() {
        let (mut kernel, pids) = kernel_with_children(2);
        for &pid in &pids {
            kernel.tasks.get_mut(pid).unwrap().counter = 0;
        }
        // A sleeper keeps half of its unused slice
        let sleeper = kernel.fork(Pid::ROOT).unwrap();
        let task = kernel.tasks.get_mut(sleeper).unwrap();
        task.counter = 10;
        task.state = TaskState::InterruptibleWait;

        let switch = kernel.schedule();
        assert_eq!(switch.to, pids[0]);
        assert_eq!(kernel.tasks.get(pids[0]).unwrap().counter(), 15);
        assert_eq!(kernel.tasks.get(sleeper).unwrap().counter(), 5 + 15);
    }

    #[test]
    fn timer_preempts_only_user_mode_at_slice_end() {
        let (mut kernel, pids) = kernel_with_children(2);
        kernel.schedule();
        assert_eq!(kernel.tasks.current_pid(), pids[0]);
        kernel.tasks.get_mut(pids[0]).unwrap().counter = 1;
        assert_eq!(kernel.timer_interrupt(false), None, "kernel mode is never preempted");
        let task = kernel.tasks.get(pids[0]).unwrap();
        assert_eq!((task.counter(), task.times().stime), (0, 1));

        kernel.tasks.get_mut(pids[0]).unwrap().counter = 1;
        let switch = kernel.timer_interrupt(true).unwrap();
        assert_eq!(switch.to, pids[1]);
        assert_eq!(kernel.jiffies(), 2);
    }

    #[test]
    fn alarm_raises_sigalrm_and_wakes_paused_task() {
        let (mut kernel, pids) = kernel_with_children(1);
        let pid = pids[0];
        kernel.schedule();
        assert_eq!(kernel.alarm(pid, 1), Ok(0));
        kernel.pause(pid).unwrap();
        assert_eq!(kernel.tasks.get(pid).unwrap().state(), TaskState::InterruptibleWait);
        for _ in 0..crate::config::HZ {
            kernel.timer_interrupt(false);
        }
        let switch = kernel.schedule();
        assert_eq!(switch.to, pid);
        let task = kernel.tasks.get(pid).unwrap();
        assert!(task.signals().is_pending(crate::signal::constants::SIGALRM));
        assert_eq!(task.alarm(), 0);
    }

    #[test]
    fn alarm_reports_remaining_seconds() {
        let (mut kernel, pids) = kernel_with_children(1);
        kernel.alarm(pids[0], 5).unwrap();
        for _ in 0..(2 * crate::config::HZ) {
            kernel.timer_interrupt(false);
        }
        assert_eq!(kernel.alarm(pids[0], 0), Ok(3));
    }

    #[test]
    fn nice_never_drops_priority_to_zero() {
        let (mut kernel, pids) = kernel_with_children(1);
        assert_eq!(kernel.nice(pids[0], 5), Ok(10));
        assert_eq!(kernel.nice(pids[0], 10), Ok(10));
        assert_eq!(kernel.nice(pids[0], 9), Ok(1));
    }
}
