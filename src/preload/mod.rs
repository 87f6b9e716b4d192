//! The preload library: the in-tracee fast path.
//!
//! This module is compiled into the cdylib that gets LD_PRELOADed into
//! recorded applications. It replaces libc syscall wrappers with
//! implementations that save nondeterministic outparams in a fixed-size
//! per-thread ring buffer. When the buffer is full or the application
//! invokes an un-buffered syscall or receives a signal, we trap to the
//! supervisor and it records the state of the buffer.
//!
//! During replay, the supervisor refills the buffer with the recorded data
//! when it reaches the flush events, then the code here restores the client
//! data from the refilled buffer.
//!
//! Because this code runs in the tracee's address space and overrides
//! system calls, it is delicate:
//!
//! - all syscalls invoked by this code must be raw kernel entries, not libc
//!   wrappers (which this library may itself override);
//! - within a buffer transaction, control must stay inside this module: no
//!   allocation, no panicking paths, no libc calls.

pub mod syscallbuf;
