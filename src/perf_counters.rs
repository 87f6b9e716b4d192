//! The hardware performance counter that drives ticks: retired conditional
//! branches, programmed to deliver a signal when the timeslice deadline
//! elapses.

use crate::{
    bindings::{
        fcntl::{f_owner_ex, F_OWNER_TID, F_SETOWN_EX, F_SETSIG},
        perf_event::{
            perf_event_attr, ticks_attr, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE,
            PERF_EVENT_IOC_PERIOD, PERF_EVENT_IOC_RESET, PERF_TYPE_RAW,
        },
    },
    flags::Flags,
    log::LogLevel::{LogDebug, LogInfo},
    scoped_fd::ScopedFd,
    sig,
    sig::Sig,
    ticks::Ticks,
};
use libc::{c_void, fcntl, ioctl, pid_t, F_SETFL, O_ASYNC};
use raw_cpuid::CpuId;

/// This choice is fairly arbitrary; linux doesn't use SIGSTKFLT so we
/// hope that tracees don't either.
pub const TIME_SLICE_SIGNAL: Sig = sig::SIGSTKFLT;

/// The hardware counter fires this many ticks early at worst; advancing to
/// an exact tick target must fall back to single-stepping within this
/// window.
const SKID_SIZE: Ticks = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksSemantics {
    TicksRetiredConditionalBranches,
    TicksTakenBranches,
}

use TicksSemantics::*;

/// Find out the cpu model using the cpuid instruction.
/// Full list of CPUIDs at <http://sandpile.org/x86/cpuid.htm>
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CpuMicroarch {
    UnknownCpu,
    IntelMerom,
    IntelPenryn,
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelGoldmont,
    IntelKabylake,
    IntelCometlake,
    AMDRyzen,
}

use CpuMicroarch::*;

struct PmuConfig {
    uarch: CpuMicroarch,
    name: &'static str,
    /// Event selector for retired conditional branches.
    rcb_cntr_event: u64,
    supported: bool,
}

static PMU_CONFIGS: &[PmuConfig] = &[
    PmuConfig { uarch: IntelMerom, name: "Merom", rcb_cntr_event: 0, supported: false },
    PmuConfig { uarch: IntelPenryn, name: "Penryn", rcb_cntr_event: 0, supported: false },
    PmuConfig { uarch: IntelNehalem, name: "Nehalem", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelWestmere, name: "Westmere", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelSandyBridge, name: "Sandy Bridge", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelIvyBridge, name: "Ivy Bridge", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelHaswell, name: "Haswell", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelBroadwell, name: "Broadwell", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelSkylake, name: "Skylake", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelSilvermont, name: "Silvermont", rcb_cntr_event: 0x517ec4, supported: true },
    PmuConfig { uarch: IntelGoldmont, name: "Goldmont", rcb_cntr_event: 0x517ec4, supported: true },
    PmuConfig { uarch: IntelKabylake, name: "Kaby Lake", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: IntelCometlake, name: "Comet Lake", rcb_cntr_event: 0x5101c4, supported: true },
    PmuConfig { uarch: AMDRyzen, name: "Ryzen", rcb_cntr_event: 0x5100d1, supported: true },
];

lazy_static! {
    static ref TICKS_ATTR: perf_event_attr = init_ticks_attr();
}

pub fn init_pmu() {
    let attr = &*TICKS_ATTR;
    log!(
        LogDebug,
        "Initialized PMU (rcb event {:#x})",
        attr.config
    );
}

/// Return the detected, known microarchitecture of this CPU, or don't
/// return; i.e. never return UnknownCpu.
fn get_cpu_microarch() -> CpuMicroarch {
    if let Some(forced_uarch) = Flags::get().forced_uarch.as_ref().map(|u| u.to_lowercase()) {
        for pmu in PMU_CONFIGS {
            let name = pmu.name.to_lowercase();
            if name.find(&forced_uarch).is_some() {
                log!(LogInfo, "Using forced uarch {}", pmu.name);
                return pmu.uarch;
            }
        }

        clean_fatal!(
            "Forced uarch {} isn't known",
            Flags::get().forced_uarch.as_ref().unwrap()
        );
    }

    let cpuid = CpuId::new();
    let vendor_info_string = cpuid.get_vendor_info().unwrap().as_string().to_owned();

    if vendor_info_string != "GenuineIntel" && vendor_info_string != "AuthenticAMD" {
        clean_fatal!("Unknown CPU vendor '{}'", vendor_info_string);
    }

    let cpuid_data = cpuid.get_feature_info().unwrap();
    let cpu_type: u32 = ((cpuid_data.model_id() as u32) << 4)
        + ((cpuid_data.family_id() as u32) << 8)
        + ((cpuid_data.extended_model_id() as u32) << 16);
    let ext_family: u8 = cpuid_data.extended_family_id();

    match cpu_type {
        0x006F0 | 0x10660 => return IntelMerom,
        0x10670 | 0x106D0 => return IntelPenryn,
        0x106A0 | 0x106E0 | 0x206E0 => return IntelNehalem,
        0x20650 | 0x206C0 | 0x206F0 => return IntelWestmere,
        0x206A0 | 0x206D0 | 0x306e0 => return IntelSandyBridge,
        0x306A0 => return IntelIvyBridge,
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => return IntelHaswell,
        0x306D0 | 0x40670 | 0x406F0 | 0x50660 => return IntelBroadwell,
        0x406e0 | 0x50650 | 0x506e0 => return IntelSkylake,
        0x30670 | 0x406c0 | 0x50670 => return IntelSilvermont,
        0x506f0 => return IntelGoldmont,
        0x806e0 | 0x906e0 => return IntelKabylake,
        0xa0660 => return IntelCometlake,
        0x00f10 => {
            if ext_family == 8 {
                if !Flags::get().suppress_environment_warnings {
                    eprintln!(
                        "Warning: Ryzen retired-conditional-branch counting has known \
                         accuracy limits; recording may be unreliable."
                    );
                }
                return AMDRyzen;
            }
        }
        _ => (),
    }

    if vendor_info_string == "AuthenticAMD" {
        clean_fatal!("AMD CPU type {:#x} unknown", cpu_type);
    } else {
        clean_fatal!("Intel CPU type {:#x} unknown", cpu_type);
    }
}

fn init_ticks_attr() -> perf_event_attr {
    let uarch = get_cpu_microarch();
    let pmu = match PMU_CONFIGS.iter().find(|p| p.uarch == uarch) {
        Some(p) => p,
        None => clean_fatal!("CPU microarch {:?} has no counter configuration", uarch),
    };
    if !pmu.supported {
        clean_fatal!("CPU microarch {} is not supported", pmu.name);
    }

    ticks_attr(PERF_TYPE_RAW, pmu.rcb_cntr_event, 0)
}

fn perf_event_open(attr: &perf_event_attr, tid: pid_t) -> i32 {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            tid,
            -1i32, // any cpu
            -1i32, // no group
            0u64,
        ) as i32
    }
}

/// The ticks counter of one task. Opened against the task's tid; the
/// counter delivers TIME_SLICE_SIGNAL to the task when the programmed
/// period elapses, which the supervisor observes as a ptrace signal stop.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks: ScopedFd,
    started: bool,
    counting_period: Ticks,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks: ScopedFd::new(),
            started: false,
            counting_period: 0,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        debug_assert!(!self.started);
        self.tid = tid;
    }

    pub fn default_ticks_semantics() -> TicksSemantics {
        TicksRetiredConditionalBranches
    }

    pub fn supports_ticks_semantics(semantics: TicksSemantics) -> bool {
        semantics == TicksRetiredConditionalBranches
    }

    pub fn skid_size() -> Ticks {
        SKID_SIZE
    }

    /// (Re)start counting with a signal after `ticks_period` ticks; 0 means
    /// count without interrupting.
    pub fn reset(&mut self, ticks_period: Ticks) {
        if !self.started {
            let mut attr = *TICKS_ATTR;
            attr.sample_period = if ticks_period == 0 {
                // An "infinite" period; the counter still counts.
                1 << 60
            } else {
                ticks_period
            };

            let fd = perf_event_open(&attr, self.tid);
            if fd < 0 {
                fatal!("Failed to initialize ticks counter for tid {}", self.tid);
            }
            self.fd_ticks = ScopedFd::from_raw(fd);

            // Program signal delivery to the task itself so a timeslice
            // expiry interrupts it even while the supervisor is elsewhere.
            if unsafe { fcntl(self.fd_ticks.as_raw(), F_SETFL, O_ASYNC) } != 0 {
                fatal!("Failed to make ticks counter ASYNC");
            }
            if unsafe {
                fcntl(
                    self.fd_ticks.as_raw(),
                    F_SETSIG,
                    TIME_SLICE_SIGNAL.as_raw(),
                )
            } != 0
            {
                fatal!("Failed to fcntl(SETSIG) the ticks counter");
            }
            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe {
                fcntl(
                    self.fd_ticks.as_raw(),
                    F_SETOWN_EX,
                    &own as *const f_owner_ex,
                )
            } != 0
            {
                fatal!("Failed to fcntl(SETOWN_EX) the ticks counter");
            }

            if unsafe { ioctl(self.fd_ticks.as_raw(), PERF_EVENT_IOC_ENABLE, 0) } != 0 {
                fatal!("Failed to ENABLE ticks counter");
            }
        } else {
            if unsafe { ioctl(self.fd_ticks.as_raw(), PERF_EVENT_IOC_RESET, 0) } != 0 {
                fatal!("Failed to RESET ticks counter");
            }
            let mut period: u64 = if ticks_period == 0 { 1 << 60 } else { ticks_period };
            if unsafe {
                ioctl(
                    self.fd_ticks.as_raw(),
                    PERF_EVENT_IOC_PERIOD,
                    &mut period as *mut u64,
                )
            } != 0
            {
                fatal!("Failed to set ticks period");
            }
            if unsafe { ioctl(self.fd_ticks.as_raw(), PERF_EVENT_IOC_ENABLE, 0) } != 0 {
                fatal!("Failed to ENABLE ticks counter");
            }
        }

        self.started = true;
        self.counting_period = ticks_period;
    }

    /// Suspend counting until the next reset.
    pub fn stop_counting(&mut self) {
        if !self.started {
            return;
        }
        if unsafe { ioctl(self.fd_ticks.as_raw(), PERF_EVENT_IOC_DISABLE, 0) } != 0 {
            fatal!("Failed to DISABLE ticks counter");
        }
    }

    /// Close the counter; used at task death.
    pub fn stop(&mut self) {
        if self.started {
            self.fd_ticks.close();
            self.started = false;
        }
    }

    /// The ticks accumulated since the last reset.
    pub fn read_ticks(&self) -> Ticks {
        if !self.started {
            return 0;
        }
        let mut value: u64 = 0;
        let nread = unsafe {
            libc::read(
                self.fd_ticks.as_raw(),
                &mut value as *mut u64 as *mut c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if nread != std::mem::size_of::<u64>() as isize {
            fatal!("Failed to read ticks counter");
        }
        value
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop();
    }
}
