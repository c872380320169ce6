//! Best-effort real-time scheduling for the render thread.
//!
//! Elevation is attempted once per `CallbackEngine`, from inside the first
//! callback, so it applies to whatever thread the backend renders on.
//! Failure is never fatal: the stream keeps running at normal priority.
//!
//! | Platform | Method |
//! |----------|--------|
//! | Linux | `SCHED_FIFO` 80 → `SCHED_RR` 70 → `pthread_setschedparam` FIFO 50 |
//! | other | unsupported |

#![allow(unsafe_code)]

use serde::Serialize;

/// Outcome of one elevation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityOutcome {
    Elevated,
    /// The OS refused (usually missing `CAP_SYS_NICE`).
    Failed,
    Unsupported,
}

/// Signature of a priority elevator, injectable through `EngineConfig`.
pub type PriorityElevator = fn() -> PriorityOutcome;

/// Elevate the calling thread using the platform's real-time policy.
pub fn elevate_current_thread() -> PriorityOutcome {
    platform_elevate()
}

/// Elevator that never touches the scheduler.
pub fn no_elevation() -> PriorityOutcome {
    PriorityOutcome::Unsupported
}

#[cfg(target_os = "linux")]
fn platform_elevate() -> PriorityOutcome {
    use libc::{
        pthread_self, pthread_setschedparam, sched_param, sched_setscheduler, SCHED_FIFO,
        SCHED_RR,
    };
    use tracing::debug;

    let mut param = sched_param { sched_priority: 80 };
    // SAFETY: `param` is a valid, initialised sched_param; pid 0 targets the
    // calling thread.
    if unsafe { sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return PriorityOutcome::Elevated;
    }
    debug!("SCHED_FIFO refused, trying SCHED_RR");

    param.sched_priority = 70;
    // SAFETY: as above.
    if unsafe { sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return PriorityOutcome::Elevated;
    }
    debug!("SCHED_RR refused, trying pthread_setschedparam");

    param.sched_priority = 50;
    // SAFETY: pthread_self() always returns the calling thread's handle.
    let rc = unsafe { pthread_setschedparam(pthread_self(), SCHED_FIFO, &param) };
    if rc == 0 {
        PriorityOutcome::Elevated
    } else {
        debug!(errno = rc, "all real-time scheduling methods refused");
        PriorityOutcome::Failed
    }
}

#[cfg(not(target_os = "linux"))]
fn platform_elevate() -> PriorityOutcome {
    PriorityOutcome::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_elevation_reports_unsupported() {
        assert_eq!(no_elevation(), PriorityOutcome::Unsupported);
    }

    #[test]
    fn platform_elevation_never_panics() {
        // Runs on a scratch thread so a granted SCHED_FIFO does not leak
        // into the rest of the test binary.
        let outcome = std::thread::spawn(elevate_current_thread).join().unwrap();
        assert!(matches!(
            outcome,
            PriorityOutcome::Elevated | PriorityOutcome::Failed | PriorityOutcome::Unsupported
        ));
    }
}
