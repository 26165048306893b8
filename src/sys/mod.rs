//! Operating-system process control. One implementation per target family,
//! chosen at build time.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(not(unix))]
compile_error!("procshell only supports unix targets");
