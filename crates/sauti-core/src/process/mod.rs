//! Child process plumbing: spawning, timeout-bounded execution, and the
//! supervisor for long-running child servers.

mod executor;
mod runner;
mod supervisor;

pub use executor::Executor;
pub use runner::{ByteReader, ProcessRunner, RunningProcess, TokioRunner, WaitFuture};
pub use supervisor::{ServerSpec, ServerSupervisor};
