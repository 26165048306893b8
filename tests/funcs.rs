//! Tests for registered functions run in re-executed children.
//!
//! This binary is its own child: `main` calls `init_main` before anything
//! else, so it needs `harness = false`.

mod common;

use common::{lenient_shell, run_cases, strict_shell};
use procshell::child::{send_ready, send_vars};
use procshell::{init_main, Error, PipeMode, Pipeline, Registry, Signal, Vars};
use std::io::{self, BufRead, Read, Write};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut r = Registry::new();
        r.register("cat", || -> io::Result<()> {
            io::copy(&mut io::stdin().lock(), &mut io::stdout().lock())?;
            Ok(())
        })
        .unwrap();
        r.register("echo", |s: String| println!("{}", s)).unwrap();
        r.register("write_stdout_stderr", |out: String, err: String| {
            print!("{}", out);
            _ = io::stdout().flush();
            eprint!("{}", err);
        })
        .unwrap();
        r.register("exit", |code: i32| -> Result<(), String> { std::process::exit(code) })
            .unwrap();
        r.register("fail", |msg: String| -> Result<(), String> { Err(msg) })
            .unwrap();
        r.register("sleep", |d: Duration| thread::sleep(d)).unwrap();
        r.register("write_loop", || -> io::Result<()> {
            let mut out = io::stdout().lock();
            loop {
                writeln!(out, "loop")?;
            }
        })
        .unwrap();
        r.register("send_vars", |vars: Vars, then_sleep: bool| {
            send_vars(vars);
            if then_sleep {
                thread::sleep(Duration::from_secs(100));
            }
        })
        .unwrap();
        r.register("ready_then_read", || -> io::Result<()> {
            send_ready();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            print!("{}", line);
            Ok(())
        })
        .unwrap();
        r.register("print_env", |name: String| {
            println!("{}", std::env::var(&name).unwrap_or_default());
        })
        .unwrap();
        r
    })
}

fn main() {
    init_main(registry());
    common::init_tracing();
    run_cases(&[
        ("fn_stdout", fn_stdout),
        ("fn_stdout_stderr", fn_stdout_stderr),
        ("fn_stdin", fn_stdin),
        ("fn_exit_code", fn_exit_code),
        ("fn_error_exits_1", fn_error_exits_1),
        ("fn_bad_args", fn_bad_args),
        ("fn_await_vars", fn_await_vars),
        ("fn_await_vars_partial", fn_await_vars_partial),
        ("fn_await_ready", fn_await_ready),
        ("fn_pipeline_closed_pipe", fn_pipeline_closed_pipe),
        ("fn_pipeline_of_funcs", fn_pipeline_of_funcs),
        ("fn_terminate", fn_terminate),
        ("fn_reserved_vars_removed", fn_reserved_vars_removed),
        ("fn_exit_after", fn_exit_after),
    ]);
}

fn fn_stdout() {
    let sh = strict_shell();
    let mut c = sh.fn_cmd(registry(), "echo", ("hello",)).unwrap();
    assert_eq!(c.stdout().unwrap(), "hello\n");
    sh.cleanup();
}

fn fn_stdout_stderr() {
    let sh = strict_shell();
    let mut c = sh
        .fn_cmd(registry(), "write_stdout_stderr", ("out", "err"))
        .unwrap();
    assert_eq!(c.stdout_stderr().unwrap(), ("out".to_string(), "err".to_string()));
    sh.cleanup();
}

fn fn_stdin() {
    let sh = strict_shell();
    let mut c = sh.fn_cmd(registry(), "cat", ()).unwrap();
    c.set_stdin_bytes("through a function").unwrap();
    assert_eq!(c.stdout().unwrap(), "through a function");
    sh.cleanup();
}

fn fn_exit_code() {
    let sh = lenient_shell();
    let mut c = sh.fn_cmd(registry(), "exit", (7,)).unwrap();
    match c.run() {
        Err(Error::Exit(e)) => assert_eq!(e.code, Some(7)),
        other => panic!("unexpected result: {:?}", other),
    }
    sh.cleanup();
}

fn fn_error_exits_1() {
    let sh = lenient_shell();
    let mut c = sh.fn_cmd(registry(), "fail", ("boom",)).unwrap();
    let mut stderr_pipe = c.stderr_pipe().unwrap();
    assert!(c.run().is_err());
    let mut stderr = String::new();
    stderr_pipe.read_to_string(&mut stderr).unwrap();
    assert!(stderr.contains("boom"), "{}", stderr);
    match c.err() {
        Some(Error::Exit(e)) => assert_eq!(e.code, Some(1)),
        other => panic!("unexpected error: {:?}", other),
    }
    sh.cleanup();
}

fn fn_bad_args() {
    let sh = lenient_shell();
    assert!(matches!(
        sh.fn_cmd(registry(), "echo", (1, 2)),
        Err(Error::ArgCount { .. })
    ));
    assert!(matches!(
        sh.fn_cmd(registry(), "exit", ("not a number",)),
        Err(Error::ArgType { index: 0, .. })
    ));
    assert!(matches!(
        sh.fn_cmd(registry(), "no_such_function", ()),
        Err(Error::UnknownFunction(_))
    ));
    sh.cleanup();
}

fn fn_await_vars() {
    let sh = strict_shell();
    let vars = Vars::from([("addr".to_string(), "127.0.0.1:1234".to_string())]);
    let mut c = sh.fn_cmd(registry(), "send_vars", (vars, true)).unwrap();
    c.start().unwrap();
    let got = c.await_vars(&["addr"]).unwrap();
    assert_eq!(got.get("addr").map(String::as_str), Some("127.0.0.1:1234"));
    c.terminate(Signal::SIGTERM).unwrap();
    sh.cleanup();
}

fn fn_await_vars_partial() {
    let sh = lenient_shell();
    let vars = Vars::from([("a".to_string(), "1".to_string())]);
    let mut c = sh.fn_cmd(registry(), "send_vars", (vars, false)).unwrap();
    c.start().unwrap();
    assert!(matches!(c.await_vars(&["a", "b"]), Err(Error::ProcessExited)));
    c.wait().unwrap();
    sh.cleanup();
}

fn fn_await_ready() {
    let sh = strict_shell();
    let mut c = sh.fn_cmd(registry(), "ready_then_read", ()).unwrap();
    let mut stdin = c.stdin_pipe().unwrap();
    let mut stdout = c.stdout_pipe().unwrap();
    c.start().unwrap();
    c.await_ready().unwrap();
    stdin.write_all(b"after ready\n").unwrap();
    c.wait().unwrap();
    let mut out = String::new();
    stdout.read_to_string(&mut out).unwrap();
    assert_eq!(out, "after ready\n");
    sh.cleanup();
}

fn fn_pipeline_closed_pipe() {
    let sh = strict_shell();
    let mut p = Pipeline::new(
        sh.fn_cmd(registry(), "write_loop", ()).unwrap(),
        [sh.cmd("head", ["-n", "1"]).unwrap()],
    )
    .unwrap();
    assert_eq!(p.stdout().unwrap(), "loop\n");
    sh.cleanup();
}

fn fn_pipeline_of_funcs() {
    let sh = strict_shell();
    let mut p = Pipeline::new(sh.fn_cmd(registry(), "echo", ("relay",)).unwrap(), []).unwrap();
    p.pipe_to(sh.fn_cmd(registry(), "cat", ()).unwrap(), PipeMode::Stdout)
        .unwrap();
    p.pipe_to(sh.fn_cmd(registry(), "cat", ()).unwrap(), PipeMode::Stdout)
        .unwrap();
    assert_eq!(p.stdout().unwrap(), "relay\n");
    sh.cleanup();
}

fn fn_terminate() {
    let sh = strict_shell();
    let mut c = sh
        .fn_cmd(registry(), "sleep", (Duration::from_secs(100),))
        .unwrap();
    c.start().unwrap();
    c.terminate(Signal::SIGINT).unwrap();
    sh.cleanup();
}

fn fn_reserved_vars_removed() {
    let sh = strict_shell();
    let mut c = sh
        .fn_cmd(registry(), "print_env", ("PROCSHELL_INVOCATION",))
        .unwrap();
    assert_eq!(c.stdout().unwrap(), "\n");
    let mut c = sh
        .fn_cmd(registry(), "print_env", ("PROCSHELL_WATCH_PARENT",))
        .unwrap();
    assert_eq!(c.stdout().unwrap(), "\n");
    sh.cleanup();
}

fn fn_exit_after() {
    let sh = lenient_shell();
    let mut c = sh
        .fn_cmd(registry(), "sleep", (Duration::from_secs(100),))
        .unwrap();
    c.set_exit_after(Some(Duration::from_millis(100)));
    match c.run() {
        Err(Error::Exit(e)) => assert_eq!(e.code, Some(1)),
        other => panic!("unexpected result: {:?}", other),
    }
    sh.cleanup();
}
