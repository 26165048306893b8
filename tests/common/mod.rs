#![allow(dead_code)]

use procshell::{Shell, ShellOpts};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A shell whose errors panic, as in a script.
pub fn strict_shell() -> Shell {
    init_tracing();
    Shell::new(ShellOpts::default().handle_signals(false))
}

/// A shell whose errors are returned.
pub fn lenient_shell() -> Shell {
    init_tracing();
    Shell::new(
        ShellOpts::default()
            .continue_on_error(true)
            .handle_signals(false)
            .cleanup_grace(Duration::from_millis(200)),
    )
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// Minimal runner for test binaries without the standard harness. Runs
/// every case, prints a libtest-like summary, and exits non-zero if any
/// case panicked.
pub fn run_cases(cases: &[(&str, fn())]) {
    let mut failed = Vec::new();
    println!("\nrunning {} tests", cases.len());
    for (name, case) in cases {
        match panic::catch_unwind(AssertUnwindSafe(case)) {
            Ok(()) => println!("test {} ... ok", name),
            Err(_) => {
                println!("test {} ... FAILED", name);
                failed.push(*name);
            }
        }
    }
    if failed.is_empty() {
        println!("\ntest result: ok. {} passed\n", cases.len());
        return;
    }
    println!("\nfailures:");
    for name in &failed {
        println!("    {}", name);
    }
    println!(
        "\ntest result: FAILED. {} passed; {} failed\n",
        cases.len() - failed.len(),
        failed.len()
    );
    std::process::exit(1);
}
