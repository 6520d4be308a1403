//! The shim: launches a single container process through the runtime binary and stays
//! around as its parent until it exits, so the supervisor can come and go.
//!
//! A shim is started by the supervisor with the process state directory as its working
//! directory. It reports through files in that directory and the `exit` fifo only.

mod cli;
mod io;
mod process;

pub use cli::{Args, shim_main};
pub use process::run;
