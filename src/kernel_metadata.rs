use crate::{
    bindings::ptrace::{
        PTRACE_EVENT_CLONE, PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, PTRACE_EVENT_FORK,
        PTRACE_EVENT_SECCOMP, PTRACE_EVENT_STOP, PTRACE_EVENT_VFORK, PTRACE_EVENT_VFORK_DONE,
    },
    kernel_abi,
    kernel_abi::SupportedArch,
};

pub fn syscall_name(no: i32, arch: SupportedArch) -> String {
    kernel_abi::syscall_name(no, arch)
}

pub fn signal_name(sig: i32) -> String {
    // strsignal() would be nice to use here, but it provides TMI.
    if (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&sig) {
        return format!("SIGRT{}", sig - libc::SIGRTMIN());
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    match event {
        PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::E2BIG => "E2BIG".into(),
        libc::ENOEXEC => "ENOEXEC".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::ENOTBLK => "ENOTBLK".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::EXDEV => "EXDEV".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::ENOTTY => "ENOTTY".into(),
        libc::ETXTBSY => "ETXTBSY".into(),
        libc::EFBIG => "EFBIG".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::ESPIPE => "ESPIPE".into(),
        libc::EROFS => "EROFS".into(),
        libc::EMLINK => "EMLINK".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::EDOM => "EDOM".into(),
        libc::ERANGE => "ERANGE".into(),
        libc::EDEADLK => "EDEADLK".into(),
        libc::ENAMETOOLONG => "ENAMETOOLONG".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::ELOOP => "ELOOP".into(),
        libc::ECONNRESET => "ECONNRESET".into(),
        libc::ECONNREFUSED => "ECONNREFUSED".into(),
        libc::ETIMEDOUT => "ETIMEDOUT".into(),
        _ => format!("errno({})", err),
    }
}

/// The errno that a negative raw kernel return value encodes, or 0.
pub fn errno_from_raw_result(ret: isize) -> i32 {
    if -4096 < ret && ret < 0 {
        (-ret) as i32
    } else {
        0
    }
}

pub fn is_sigreturn(no: i32, arch: SupportedArch) -> bool {
    kernel_abi::is_sigreturn_syscall(no, arch)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!("SIGSEGV", signal_name(libc::SIGSEGV));
        assert_eq!("EINVAL", errno_name(libc::EINVAL));
        assert_eq!("PTRACE_EVENT_EXIT", ptrace_event_name(6));
    }

    #[test]
    fn raw_result_errno() {
        assert_eq!(libc::ENOENT, errno_from_raw_result(-(libc::ENOENT as isize)));
        assert_eq!(0, errno_from_raw_result(12));
        assert_eq!(0, errno_from_raw_result(-0x10000));
    }
}
