//! Start, pipe, signal and tear down child processes from a parent program.
//!
//! A [`Shell`] holds the environment, error policy and resources shared by
//! the commands created from it. [`Cmd`] is the heart of this crate: it
//! starts one child in its own process group, tees its output to whatever
//! is attached and to bounded head/tail buffers, and receives messages the
//! child writes to stderr (see [`child`]). [`Pipeline`] connects commands
//! through OS pipes and copes with the closed pipes that early-exiting
//! stages leave behind. The [`registry`] module lets the current binary
//! re-execute itself to run a registered Rust function as a child, via
//! [`Shell::fn_cmd()`] and [`init_main()`].
//!
//! Errors are routed through [`Shell::handle_error()`]: by default they
//! panic, which suits tests and script-like programs; with
//! [`ShellOpts::continue_on_error`] they are returned instead.
//!
//! On SIGINT, SIGQUIT and SIGTERM every live shell is cleaned up before the
//! process exits, so children do not outlive the parent.

mod buffered_pipe;
/// Functions meant to be called from a child process.
pub mod child;
mod cmd;
/// Environment variables of shells and commands.
pub mod envconfig;
mod error;
mod ioconfig;
/// The child-to-parent message format.
pub mod msg;
mod pipeline;
/// Functions a binary can run in a re-executed copy of itself.
pub mod registry;
mod ring_buffer;
mod shell;
mod signals;
mod sys;

// re-exports
pub use buffered_pipe::BufferedPipe;
pub use cmd::{Cmd, CmdState};
pub use envconfig::Vars;
pub use error::{Error, ExitError, Result};
pub use nix::sys::signal::Signal;
pub use pipeline::{PipeMode, Pipeline};
pub use registry::{init_main, Invocation, Registry};
pub use ring_buffer::{HeadTail, RingBuffer};
pub use shell::{Shell, ShellOpts};
