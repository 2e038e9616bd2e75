//! The kernel logger: early buffering, then replay to the console.

use std::fmt;
use std::sync::Mutex;
use vmcore::{logger, Kernel, KernelConfig, Pid};

static CONSOLE: Mutex<String> = Mutex::new(String::new());

fn console(args: fmt::Arguments<'_>) {
    CONSOLE.lock().unwrap().push_str(&args.to_string());
}

#[test]
fn records_are_buffered_until_the_console_attaches() {
    logger::init(log::LevelFilter::Debug).expect("first logger");

    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    let child = kernel.fork(Pid::ROOT).unwrap();
    let early = logger::buffered();
    assert!(early.contains("kernel: 64 task slots"), "missing boot line in {:?}", early);
    assert!(early.contains(&format!("fork: task 0 -> child {}", child)));
    assert!(CONSOLE.lock().unwrap().is_empty());

    assert!(logger::set_console(console));
    assert!(!logger::set_console(console), "only one console");
    {
        let replayed = CONSOLE.lock().unwrap();
        assert!(replayed.starts_with("--- early log ("));
        assert!(replayed.ends_with("--- end of early log ---\n"));
        assert!(replayed.contains("fork: task 0"));
    }

    kernel.exit(child, 1).unwrap();
    assert!(CONSOLE.lock().unwrap().contains(&format!("task {} exited with code 1", child)));
    assert!(!logger::buffered().contains("exited"), "later records bypass the buffer");
}
