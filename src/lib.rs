#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
#[macro_use]
pub mod kernel_abi;

pub mod auto_remote_syscalls;
pub mod bindings;
pub mod commands;
pub mod emu_fs;
pub mod event;
pub mod extra_registers;
pub mod flags;
pub mod kernel_metadata;
pub mod monkey_patcher;
pub mod perf_counters;
pub mod preload;
pub mod preload_interface;
pub mod registers;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod scheduler;
pub mod scoped_fd;
pub mod session;
pub mod sig;
pub mod task_set;
pub mod taskish_uid;
pub mod thread_group;
pub mod ticks;
pub mod trace;
pub mod util;
pub mod wait_status;
