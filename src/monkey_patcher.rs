//! Rewriting syscall instructions at known call sites so the next execution
//! jumps into the preload hook instead of trapping to us.
//!
//! The preload library publishes a table of byte-pattern patches during
//! rtcall_init_preload: each entry names the instruction bytes that may
//! follow a syscall instruction and the hook to divert to. When a traced
//! syscall's following bytes match a pattern, the syscall instruction plus
//! the following instruction are replaced with a call to the hook; the
//! displaced tail is folded into the hook's own code.

use crate::{
    kernel_abi::syscall_instruction_length,
    log::LogLevel::LogDebug,
    preload_interface::{syscall_patch_hook, NEXT_INSTRUCTION_BYTES_LEN},
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::task::{write_mem, Task},
};

/// x86 call-relative opcode.
const CALL_REL32: u8 = 0xe8;
const NOP: u8 = 0x90;
const CALL_INSN_LEN: usize = 5;

pub struct MonkeyPatcher {
    syscall_hooks: Vec<syscall_patch_hook>,
    /// Addresses we already patched or decided never to patch; never retry.
    tried_to_patch: Vec<RemoteCodePtr>,
}

impl Default for MonkeyPatcher {
    fn default() -> Self {
        MonkeyPatcher::new()
    }
}

impl MonkeyPatcher {
    pub fn new() -> MonkeyPatcher {
        MonkeyPatcher {
            syscall_hooks: Vec::new(),
            tried_to_patch: Vec::new(),
        }
    }

    /// Adopt the hook table published by the preload library.
    pub fn set_syscall_hooks(&mut self, hooks: Vec<syscall_patch_hook>) {
        self.syscall_hooks = hooks;
    }

    pub fn has_hooks(&self) -> bool {
        !self.syscall_hooks.is_empty()
    }

    /// Try to patch the syscall instruction the tracee just entered. The
    /// task must be stopped at a syscall entry, with $ip just after the
    /// syscall instruction. Returns true when the site was rewritten; the
    /// caller records a PatchSyscall event and resumes at the patch.
    pub fn try_patch_syscall(&mut self, t: &mut dyn Task) -> bool {
        if self.syscall_hooks.is_empty() {
            return false;
        }

        let arch = t.arch();
        let after_syscall = t.ip();
        let syscall_start =
            after_syscall.decrement_by_bytes(syscall_instruction_length(arch));
        if self.tried_to_patch.contains(&syscall_start) {
            return false;
        }
        self.tried_to_patch.push(syscall_start);

        let mut following_bytes = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        if !t.read_bytes_fallible(after_syscall.to_data_ptr::<Void>(), &mut following_bytes) {
            return false;
        }

        let hook = match self.find_matching_hook(&following_bytes) {
            Some(h) => h,
            None => return false,
        };

        self.patch_site(t, syscall_start, &hook);
        log!(
            LogDebug,
            "patched syscall at {} to call hook {:#x}",
            syscall_start,
            hook.hook_address
        );
        true
    }

    /// Apply the recorded patch during replay: same rewrite, no pattern
    /// search needed since the recorder already decided.
    pub fn apply_patch_at(&mut self, t: &mut dyn Task, syscall_start: RemoteCodePtr) -> bool {
        let after_syscall =
            syscall_start.increment_by_bytes(syscall_instruction_length(t.arch()));
        let mut following_bytes = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        if !t.read_bytes_fallible(after_syscall.to_data_ptr::<Void>(), &mut following_bytes) {
            return false;
        }
        let hook = match self.find_matching_hook(&following_bytes) {
            Some(h) => h,
            None => return false,
        };
        self.patch_site(t, syscall_start, &hook);
        true
    }

    fn find_matching_hook(&self, following_bytes: &[u8]) -> Option<syscall_patch_hook> {
        for hook in &self.syscall_hooks {
            let len = hook.next_instruction_length as usize;
            if len <= following_bytes.len()
                && following_bytes[..len] == hook.next_instruction_bytes[..len]
            {
                return Some(*hook);
            }
        }
        None
    }

    fn patch_site(&self, t: &mut dyn Task, syscall_start: RemoteCodePtr, hook: &syscall_patch_hook) {
        let arch = t.arch();
        let patch_region_len =
            syscall_instruction_length(arch) + hook.next_instruction_length as usize;
        debug_assert!(patch_region_len >= CALL_INSN_LEN);

        // call rel32 is relative to the end of the call instruction.
        let call_end = syscall_start.as_usize() + CALL_INSN_LEN;
        let offset = hook.hook_address as i64 - call_end as i64;
        let offset32 = offset as i32;
        debug_assert_eq!(offset32 as i64, offset);

        let mut patch = Vec::with_capacity(patch_region_len);
        patch.push(CALL_REL32);
        patch.extend_from_slice(&offset32.to_le_bytes());
        while patch.len() < patch_region_len {
            patch.push(NOP);
        }

        write_mem(
            t,
            RemotePtr::<Void>::new(syscall_start.as_usize()),
            &patch,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hook_with_bytes(bytes: &[u8], addr: u64) -> syscall_patch_hook {
        let mut h = syscall_patch_hook::default();
        h.next_instruction_length = bytes.len() as u8;
        h.next_instruction_bytes[..bytes.len()].copy_from_slice(bytes);
        h.hook_address = addr;
        h
    }

    #[test]
    fn hook_matching_prefers_first_match() {
        let mut patcher = MonkeyPatcher::new();
        patcher.set_syscall_hooks(vec![
            hook_with_bytes(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff], 0x1000),
            hook_with_bytes(&[0x90, 0x90, 0x90], 0x2000),
        ]);

        let mut following = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        following[..6].copy_from_slice(&[0x48, 0x3d, 0x01, 0xf0, 0xff, 0xff]);
        let hook = patcher.find_matching_hook(&following).unwrap();
        assert_eq!(0x1000, hook.hook_address);

        let mut nops = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        nops[..3].copy_from_slice(&[0x90, 0x90, 0x90]);
        let hook = patcher.find_matching_hook(&nops).unwrap();
        assert_eq!(0x2000, hook.hook_address);
    }

    #[test]
    fn no_match_returns_none() {
        let mut patcher = MonkeyPatcher::new();
        patcher.set_syscall_hooks(vec![hook_with_bytes(&[0x5a, 0x5e, 0xc3], 0x3000)]);
        let following = [0u8; NEXT_INSTRUCTION_BYTES_LEN];
        assert!(patcher.find_matching_hook(&following).is_none());
    }
}
