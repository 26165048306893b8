//! Registered functions that a re-executed copy of the current binary can
//! run instead of its normal `main`.
//!
//! The parent encodes a function name and its arguments into an
//! [`Invocation`] string and passes it to the child in the
//! [`ENV_INVOCATION`] environment variable (see [`crate::Shell::fn_cmd()`]).
//! The child calls [`init_main()`] first thing in `main`, which notices the
//! variable, runs the function and exits.
//!
//! Functions are registered as typed closures. Parameter types must be
//! `serde` deserializable and the return type must be `()` or
//! `Result<(), E>` with a displayable `E`; both are enforced at compile time.

use crate::child::init_child_main;
use crate::envconfig::ENV_INVOCATION;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static CALLED_INIT_MAIN: AtomicBool = AtomicBool::new(false);

/// Return types accepted for registered functions.
pub trait FuncResult {
    fn into_result(self) -> std::result::Result<(), String>;
}

impl FuncResult for () {
    fn into_result(self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> FuncResult for std::result::Result<(), E> {
    fn into_result(self) -> std::result::Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// Implemented for closures of up to six deserializable parameters. `Args`
/// is the tuple of parameter types.
pub trait Handler<Args>: Send + Sync + 'static {
    const ARITY: usize;

    /// Checks that every argument decodes to its parameter type. On failure
    /// returns the index of the offending argument and the decode error.
    fn check(args: &[Value]) -> std::result::Result<(), (usize, String)>;

    fn call(&self, args: Vec<Value>) -> std::result::Result<(), String>;
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! impl_handler {
    ($($arg:ident),*) => {
        impl<F, R, $($arg,)*> Handler<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: FuncResult,
            $($arg: DeserializeOwned,)*
        {
            const ARITY: usize = count!($($arg)*);

            #[allow(unused_variables, unused_mut, unused_assignments)]
            fn check(args: &[Value]) -> std::result::Result<(), (usize, String)> {
                let mut i = 0;
                $(
                    serde_json::from_value::<$arg>(args[i].clone()).map_err(|e| (i, e.to_string()))?;
                    i += 1;
                )*
                Ok(())
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn call(&self, args: Vec<Value>) -> std::result::Result<(), String> {
                let mut it = args.into_iter();
                $(
                    let $arg: $arg = it
                        .next()
                        .ok_or_else(|| "too few arguments".to_string())
                        .and_then(|v| serde_json::from_value(v).map_err(|e| e.to_string()))?;
                )*
                (self)($($arg),*).into_result()
            }
        }
    };
}

impl_handler!();
impl_handler!(A1);
impl_handler!(A1, A2);
impl_handler!(A1, A2, A3);
impl_handler!(A1, A2, A3, A4);
impl_handler!(A1, A2, A3, A4, A5);
impl_handler!(A1, A2, A3, A4, A5, A6);

trait ErasedFunc: Send + Sync {
    fn arity(&self) -> usize;
    fn check(&self, args: &[Value]) -> std::result::Result<(), (usize, String)>;
    fn call(&self, args: Vec<Value>) -> std::result::Result<(), String>;
}

struct Typed<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

impl<F: Handler<Args>, Args> ErasedFunc for Typed<F, Args> {
    fn arity(&self) -> usize {
        F::ARITY
    }

    fn check(&self, args: &[Value]) -> std::result::Result<(), (usize, String)> {
        F::check(args)
    }

    fn call(&self, args: Vec<Value>) -> std::result::Result<(), String> {
        self.f.call(args)
    }
}

/// Named functions that can be invoked in a re-executed child.
///
/// Parent and child must build the same registry, typically in a function
/// called from `main` in both cases:
///
/// ```no_run
/// use procshell::{init_main, Registry, Shell, ShellOpts};
///
/// fn registry() -> Registry {
///     let mut r = Registry::new();
///     r.register("greet", |name: String| println!("hello, {}", name))
///         .unwrap();
///     r
/// }
///
/// fn main() {
///     let registry = registry();
///     init_main(&registry);
///
///     let sh = Shell::new(ShellOpts::default());
///     let mut c = sh.fn_cmd(&registry, "greet", ("world",)).unwrap();
///     assert_eq!(c.stdout().unwrap(), "hello, world\n");
///     sh.cleanup();
/// }
/// ```
#[derive(Default, Clone)]
pub struct Registry {
    funcs: HashMap<String, Arc<dyn ErasedFunc>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("funcs", &names).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`. Fails if the name is taken.
    pub fn register<Args, F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Handler<Args>,
        Args: 'static,
    {
        let name = name.into();
        if self.funcs.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        let func = Typed {
            f,
            _args: PhantomData,
        };
        self.funcs.insert(name, Arc::new(func));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn ErasedFunc>> {
        self.funcs
            .get(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    fn check_call(&self, name: &str, args: &[Value]) -> Result<()> {
        let func = self.get(name)?;
        if args.len() != func.arity() {
            return Err(Error::ArgCount {
                name: name.to_string(),
                expected: func.arity(),
                got: args.len(),
            });
        }
        func.check(args).map_err(|(index, message)| Error::ArgType {
            name: name.to_string(),
            index,
            message,
        })
    }

    /// Checks `args` against the signature registered for `name` and encodes
    /// the call into a string that is safe to put in an environment
    /// variable.
    ///
    /// `args` is serialized to JSON first. An array (a tuple, `Vec` or
    /// slice) is the argument list and `null` (`()` or `None`) means no
    /// arguments; any other value is a single argument. So a lone argument
    /// that is itself a sequence or an `Option` must be wrapped in a
    /// 1-tuple: `(vec![1, 2],)`, `(None::<i32>,)`.
    pub fn encode<A: Serialize>(&self, name: &str, args: A) -> Result<String> {
        let args = match serde_json::to_value(args).map_err(|e| Error::Codec(e.to_string()))? {
            Value::Array(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        self.check_call(name, &args)?;
        Invocation {
            name: name.to_string(),
            args,
        }
        .encode()
    }

    /// Calls the function registered as `name`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.check_call(name, &args)?;
        self.get(name)?.call(args).map_err(|message| Error::Func {
            name: name.to_string(),
            message,
        })
    }
}

/// A function name plus its serialized arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<Value>,
}

impl Invocation {
    /// Encodes as base64 of the JSON form.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(s: &str) -> Result<Self> {
        let json = STANDARD
            .decode(s)
            .map_err(|e| Error::Codec(format!("failed to decode invocation: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::Codec(format!("failed to decode invocation: {}", e)))
    }
}

pub(crate) fn called_init_main() -> bool {
    CALLED_INIT_MAIN.load(Ordering::SeqCst)
}

/// Must be called early in `main`, before argument parsing. In a parent
/// process it returns immediately. In a child started by
/// [`crate::Shell::fn_cmd()`] it runs the requested function from
/// `registry`, then exits: with status 0 on success, 1 otherwise.
///
/// Panics if called twice.
pub fn init_main(registry: &Registry) {
    if CALLED_INIT_MAIN.swap(true, Ordering::SeqCst) {
        panic!("already called procshell::init_main");
    }
    let Some(encoded) = std::env::var_os(ENV_INVOCATION) else {
        return;
    };
    std::env::remove_var(ENV_INVOCATION);
    restore_default_sigpipe();
    init_child_main();
    let res = encoded
        .to_str()
        .ok_or_else(|| Error::Codec("invocation is not valid unicode".to_string()))
        .and_then(Invocation::decode)
        .and_then(|inv| registry.call(&inv.name, inv.args));
    // process::exit skips the flush that returning from main would do.
    _ = std::io::stdout().flush();
    match res {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("procshell: {}", e);
            std::process::exit(1);
        }
    }
}

// The Rust runtime ignores SIGPIPE. A registered function should behave like
// an ordinary program at the head of a pipeline and die quietly once its
// reader is gone.
fn restore_default_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: installs the default disposition; no handler code runs.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        tracing::warn!(error = %e, "failed to restore SIGPIPE");
    }
}
