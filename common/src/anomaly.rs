//! Syscall drift against learned security profiles.
//!
//! A container with a profile attached has the set of syscalls it is
//! expected to make. Every other syscall sets a bit in the per-tgid drift
//! state; once a bit has been pending for `SyscallDriftPeriod`, the set is
//! reported as SYSCALL_DRIFT and cleared. Profiles in the kill state also
//! SIGKILL the offender and report at once.

use crate::consts::{event_flags, RuntimeConst, MAX_SYSCALL_NR, SIGKILL, SYSCALL_BITMAP_BYTES};
use crate::container::ContainerId;
use crate::emit::send_event_with;
use crate::event::{EventType, SyscallDriftEvent};
use crate::kernel::{plain, zeroed, Kernel, Map, Next, UpdateFlag};
use crate::process;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileState {
    Learning = 0,
    Stable = 1,
    Kill = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecurityProfile {
    pub cookie: u64,
    pub state: u32,
    pub _pad: u32,
    pub syscalls: [u8; SYSCALL_BITMAP_BYTES],
}

impl SecurityProfile {
    pub fn allows(&self, nr: u32) -> bool {
        bit_is_set(&self.syscalls, nr)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallDriftState {
    pub syscalls: [u8; SYSCALL_BITMAP_BYTES],
    /// When the oldest pending bit was set.
    pub first_seen: u64,
}

plain!(SecurityProfile, SyscallDriftState);

pub fn bit_is_set(bitmap: &[u8; SYSCALL_BITMAP_BYTES], nr: u32) -> bool {
    nr < MAX_SYSCALL_NR && bitmap[(nr / 8) as usize] & (1 << (nr % 8)) != 0
}

pub fn set_bit(bitmap: &mut [u8; SYSCALL_BITMAP_BYTES], nr: u32) {
    if nr < MAX_SYSCALL_NR {
        bitmap[(nr / 8) as usize] |= 1 << (nr % 8);
    }
}

/// `raw_syscalls/sys_enter`.
pub fn hook_sys_enter<K: Kernel>(k: &K, nr: u32) -> Next {
    if nr >= MAX_SYSCALL_NR || k.is_agent() {
        return Next::Done;
    }
    let tgid = k.tgid();
    let container = process::container_of(k, tgid);
    if container.is_empty() {
        return Next::Done;
    }
    let Some(profile) = k
        .security_profiles()
        .lookup(&ContainerId(container.container_id))
    else {
        return Next::Done;
    };
    if profile.state == ProfileState::Learning as u32 || profile.allows(nr) {
        return Next::Done;
    }

    let now = k.now_ns();
    let mut killed = false;
    if profile.state == ProfileState::Kill as u32 && k.constant(RuntimeConst::SendSignalAvailable) != 0 {
        killed = k.send_signal(SIGKILL);
    }

    let mut state = k.syscall_drift().lookup(&tgid).unwrap_or_else(|| SyscallDriftState {
        syscalls: [0; SYSCALL_BITMAP_BYTES],
        first_seen: 0,
    });
    set_bit(&mut state.syscalls, nr);
    if state.first_seen == 0 {
        state.first_seen = now;
    }
    let period = k.constant(RuntimeConst::SyscallDriftPeriod);
    if !killed && now.saturating_sub(state.first_seen) < period {
        let _ = k.syscall_drift().store(&tgid, &state, UpdateFlag::Any);
        return Next::Done;
    }

    let mut event: SyscallDriftEvent = zeroed();
    event.syscalls = state.syscalls;
    event.profile_cookie = profile.cookie;
    event.killed = killed as u32;
    event.base.container = container;
    let flags = if killed {
        event_flags::ANOMALY_DETECTION_EVENT
    } else {
        0
    };
    send_event_with(k, EventType::SyscallDrift, &mut event, 0, flags);
    let _ = k.syscall_drift().delete(&tgid);
    Next::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ContainerContext;
    use crate::sim::SimKernel;

    const PERIOD: u64 = 5_000_000_000;

    fn setup(state: ProfileState) -> SimKernel {
        let k = SimKernel::new();
        k.enable_events(&[EventType::SyscallDrift]);
        k.set_constant(RuntimeConst::SyscallDriftPeriod, PERIOD);
        k.set_constant(RuntimeConst::SendSignalAvailable, 1);
        k.set_current(100, 100);
        let id = ContainerId::from_bytes(b"c0ffee");
        process::set_container(
            &k,
            100,
            &ContainerContext {
                container_id: id.0,
                ..ContainerContext::default()
            },
        );
        let mut profile = SecurityProfile {
            cookie: 42,
            state: state as u32,
            _pad: 0,
            syscalls: [0; SYSCALL_BITMAP_BYTES],
        };
        set_bit(&mut profile.syscalls, 0);
        set_bit(&mut profile.syscalls, 1);
        k.security_profiles().store(&id, &profile, UpdateFlag::Any).unwrap();
        k
    }

    #[test]
    fn profiled_syscalls_are_ignored() {
        let k = setup(ProfileState::Stable);
        hook_sys_enter(&k, 1);
        assert!(!k.syscall_drift().contains(&100));
    }

    #[test]
    fn drift_is_reported_after_the_period() {
        let k = setup(ProfileState::Stable);
        hook_sys_enter(&k, 59);
        hook_sys_enter(&k, 62);
        assert!(k.events_of(EventType::SyscallDrift).is_empty());

        k.advance(PERIOD);
        hook_sys_enter(&k, 59);
        let events = k.events_of(EventType::SyscallDrift);
        assert_eq!(events.len(), 1);
        let ev: SyscallDriftEvent = events[0].decode();
        assert!(bit_is_set(&ev.syscalls, 59));
        assert!(bit_is_set(&ev.syscalls, 62));
        assert!(!bit_is_set(&ev.syscalls, 1));
        assert_eq!(ev.profile_cookie, 42);
        assert_eq!(ev.killed, 0);
        assert!(!k.syscall_drift().contains(&100));
    }

    #[test]
    fn kill_state_signals_and_reports_at_once() {
        let k = setup(ProfileState::Kill);
        hook_sys_enter(&k, 59);
        assert_eq!(k.signals_sent(), vec![(100, SIGKILL)]);
        let ev: SyscallDriftEvent = k.events_of(EventType::SyscallDrift)[0].decode();
        assert_eq!(ev.killed, 1);
        assert_ne!(ev.base.header.flags & event_flags::ANOMALY_DETECTION_EVENT, 0);
    }

    #[test]
    fn learning_profiles_never_drift() {
        let k = setup(ProfileState::Learning);
        hook_sys_enter(&k, 59);
        assert!(!k.syscall_drift().contains(&100));
    }
}
