//! Scheduling over many timer ticks.

mod common;

use common::*;
use vmcore::config::HZ;
use vmcore::signal::constants::{SIGALRM, SIGUSR1};
use vmcore::signal::SignalOutcome;
use vmcore::task::{TaskState, WaitChannel};
use vmcore::{Kernel, KernelConfig, Pid};

fn kernel_with_tasks(n: usize) -> (Kernel, Vec<Pid>) {
    let mut kernel = kernel(KernelConfig::default());
    let pids = (0..n).map(|_| kernel.fork(Pid::ROOT).unwrap()).collect();
    (kernel, pids)
}

/// Equal priorities get equal CPU time in whole slices.
#[test]
fn equal_tasks_share_the_cpu_evenly() {
    let (mut kernel, pids) = kernel_with_tasks(3);
    kernel.schedule();
    for _ in 0..(3 * 15 * 10) {
        kernel.timer_interrupt(true);
        assert_consistent(&kernel);
    }
    let times: Vec<u64> = pids
        .iter()
        .map(|&pid| kernel.tasks().get(pid).unwrap().times().utime)
        .collect();
    assert_eq!(times, vec![150, 150, 150]);
    assert_eq!(kernel.tasks().get(Pid::ROOT).unwrap().times().utime, 0);
}

#[test]
fn lower_priority_gets_shorter_slices() {
    let (mut kernel, pids) = kernel_with_tasks(2);
    kernel.nice(pids[1], 10).unwrap();
    kernel.schedule();
    for _ in 0..400 {
        kernel.timer_interrupt(true);
    }
    let fast = kernel.tasks().get(pids[0]).unwrap().times().utime;
    let slow = kernel.tasks().get(pids[1]).unwrap().times().utime;
    assert!(fast > 2 * slow, "priority 15 ran {} ticks, priority 5 ran {}", fast, slow);
}

/// A task that slept through a refill keeps half its slice as a bonus and
/// runs first once woken.
#[test]
fn woken_sleeper_is_preferred() {
    let (mut kernel, pids) = kernel_with_tasks(3);
    kernel.switch_to(pids[1]).unwrap();
    let switch = kernel.sleep_on(WaitChannel::Event(1), true).unwrap();
    assert_eq!(switch.to, pids[0]);

    for _ in 0..30 {
        kernel.timer_interrupt(true);
    }
    assert_eq!(kernel.tasks().get(pids[1]).unwrap().counter(), 15 / 2 + 15);
    assert_eq!(kernel.wake_up(WaitChannel::Event(1)), 1);
    assert_eq!(kernel.schedule().to, pids[1]);
}

#[test]
fn uninterruptible_sleep_ignores_signals() {
    let (mut kernel, pids) = kernel_with_tasks(1);
    kernel.switch_to(pids[0]).unwrap();
    kernel.sleep_on(WaitChannel::Event(9), false).unwrap();
    kernel.kill(pids[0], SIGUSR1).unwrap();
    assert_eq!(kernel.schedule().to, Pid::ROOT);
    assert_eq!(
        kernel.tasks().get(pids[0]).unwrap().state(),
        TaskState::UninterruptibleWait
    );
}

#[test]
fn paused_task_wakes_on_signal() {
    let (mut kernel, pids) = kernel_with_tasks(1);
    kernel.pause(pids[0]).unwrap();
    assert_eq!(kernel.schedule().to, Pid::ROOT);
    kernel.kill(pids[0], SIGUSR1).unwrap();
    assert_eq!(kernel.schedule().to, pids[0]);
}

#[test]
fn expired_alarm_terminates_by_default() {
    let (mut kernel, pids) = kernel_with_tasks(1);
    kernel.alarm(pids[0], 2).unwrap();
    for _ in 0..(2 * HZ) {
        kernel.timer_interrupt(false);
    }
    kernel.schedule();
    assert!(kernel.tasks().get(pids[0]).unwrap().signals().is_pending(SIGALRM));
    assert_eq!(
        kernel.return_to_user(pids[0]),
        Some(SignalOutcome::Terminated {
            signal: SIGALRM,
            code: -(SIGALRM as i32)
        })
    );
    assert_consistent(&kernel);
}
