//! Common error-handling support.
//!
//! Misuse that would be a null/invalid-argument assertion in a C kernel
//! (a mailbox message given a `src_task`, a reserved mmap region name, a
//! duplicate task) is always a plain `Err` here, in every build profile --
//! the caller gets a `Result` back and can recover by dropping the
//! offending message rather than taking the whole node down. Internal
//! bookkeeping invariants that a caller can never trigger through the
//! public API (a task list that lost its priority ordering) are instead
//! a bare `debug_assert!` at the point of mutation: fatal in a debug
//! build, compiled out in release, and never part of any `Result`
//! contract a caller is expected to handle.

pub use abi::Error as KernelError;

pub type KernResult<T> = Result<T, KernelError>;
