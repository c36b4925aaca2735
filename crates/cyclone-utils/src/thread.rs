use core_affinity::CoreId;
#[cfg(target_os = "linux")]
use libc::{SCHED_FIFO, sched_param, sched_setscheduler};
use tracing::warn;

/// Realtime priority request for a worker thread.
///
/// Anything other than `OsDefault` asks the kernel for `SCHED_FIFO`
/// scheduling, which requires `CAP_SYS_NICE`. If the request fails the
/// thread keeps running under the default scheduler (CFS); this is a
/// best-effort knob, not a guarantee.
#[derive(Clone, Copy, Debug, Default)]
pub enum ThreadPriority {
    #[default]
    OsDefault,
    Low,
    Medium,
    High,
    Custom(i32),
}

#[cfg(target_os = "linux")]
impl ThreadPriority {
    fn to_sched_param(self) -> Option<sched_param> {
        let prio = match self {
            ThreadPriority::OsDefault => return None,
            ThreadPriority::Low => 10,
            ThreadPriority::Medium => 40,
            ThreadPriority::High => 75,
            ThreadPriority::Custom(p) => p,
        };
        Some(sched_param { sched_priority: prio })
    }
}

#[cfg(target_os = "linux")]
fn set_thread_prio(prio: ThreadPriority) {
    if let Some(param) = prio.to_sched_param() {
        unsafe {
            let code = sched_setscheduler(0, SCHED_FIFO, &param);
            if code != 0 {
                warn!(%code, ?param, "couldn't set thread priority");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_prio(prio: ThreadPriority) {
    if !matches!(prio, ThreadPriority::OsDefault) {
        warn!(?prio, "thread priority setting only supported on linux");
    }
}

fn set_thread_affinity(core: usize) {
    if !core_affinity::set_for_current(CoreId { id: core }) {
        warn!(?core, "couldn't pin worker thread to requested core");
    }
}

/// Pin the calling thread to `core` (if given) and request `prio`. Called
/// first thing inside a worker/master thread's entry point, mirroring how
/// the C++ source configures each `WorkThread` before entering its reactor
/// loop.
pub fn thread_boot(core: Option<usize>, prio: ThreadPriority) {
    if let Some(core) = core {
        set_thread_affinity(core);
    }
    set_thread_prio(prio);
}
