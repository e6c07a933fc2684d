//! Network device registration and veth pair tracking.
//!
//! `veth_newlink` registers the peer first, then the host side:
//!
//! ```text
//!   veth_newlink enter ──► NEWLINK
//!   register_netdevice exit (peer) ──► REGISTER_PEER
//!   register_netdevice exit (host) ──► COMPLETE ──► VETH_PAIR
//!   veth_newlink exit ──► state dropped
//! ```
//!
//! Registrations outside a veth setup use a transient state that only
//! carries the device pointer from entry to exit.

use crate::emit::send_event;
use crate::event::{Device, EventBase, EventType, NetDeviceEvent, SyscallContext, VethPairEvent};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};
use crate::kobj;

pub const VETH_STATE_NONE: u32 = 0;
pub const VETH_STATE_NEWLINK: u32 = 1;
pub const VETH_STATE_REGISTER_PEER: u32 = 2;
pub const VETH_STATE_COMPLETE: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VethState {
    pub state: u32,
    pub _pad: u32,
    /// `struct net_device` being registered.
    pub pending: u64,
    pub peer: Device,
    pub host: Device,
}

plain!(VethState);

pub fn handle_veth_newlink_enter<K: Kernel>(k: &K) {
    let state = VethState {
        state: VETH_STATE_NEWLINK,
        ..VethState::default()
    };
    let _ = k.veth_state().store(&k.pid_tgid(), &state, UpdateFlag::Any);
}

pub fn handle_veth_newlink_exit<K: Kernel>(k: &K) {
    let _ = k.veth_state().delete(&k.pid_tgid());
}

pub fn handle_register_netdevice_enter<K: Kernel>(k: &K, dev: u64) {
    let key = k.pid_tgid();
    if k.veth_state().with_mut(&key, |s| s.pending = dev).is_some() {
        return;
    }
    let state = VethState {
        pending: dev,
        ..VethState::default()
    };
    let _ = k.veth_state().store(&key, &state, UpdateFlag::Any);
}

fn emit_device<K: Kernel>(k: &K, device: Device, retval: i64) {
    let mut ev = NetDeviceEvent {
        base: EventBase::default(),
        syscall: SyscallContext {
            retval,
            ..SyscallContext::default()
        },
        device,
    };
    send_event(k, EventType::NetDevice, &mut ev);
}

fn emit_veth_pair<K: Kernel>(k: &K, state: &VethState) {
    let mut ev = VethPairEvent {
        base: EventBase::default(),
        syscall: SyscallContext::default(),
        host_device: state.host,
        peer_device: state.peer,
    };
    send_event(k, EventType::VethPair, &mut ev);
}

pub fn handle_register_netdevice_exit<K: Kernel>(k: &K, retval: i64) {
    let key = k.pid_tgid();
    let Some(mut state) = k.veth_state().lookup(&key) else {
        return;
    };
    let device = kobj::read_device(k, state.pending);
    if retval == 0 && device.ifindex != 0 {
        let _ = k.ifindex_netns().store(&device.ifindex, &device.netns, UpdateFlag::Any);
    }
    emit_device(k, device, retval);

    if state.state == VETH_STATE_NONE {
        let _ = k.veth_state().delete(&key);
        return;
    }
    if retval != 0 {
        return;
    }
    state.pending = 0;
    match state.state {
        VETH_STATE_NEWLINK => {
            state.peer = device;
            state.state = VETH_STATE_REGISTER_PEER;
        }
        VETH_STATE_REGISTER_PEER => {
            state.host = device;
            state.state = VETH_STATE_COMPLETE;
            emit_veth_pair(k, &state);
        }
        _ => {}
    }
    let _ = k.veth_state().store(&key, &state, UpdateFlag::Any);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    fn name(device: &Device) -> &str {
        let end = device.name.iter().position(|&b| b == 0).unwrap_or(device.name.len());
        core::str::from_utf8(&device.name[..end]).unwrap()
    }

    #[test]
    fn registration_maps_ifindex_to_netns() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::NetDevice]);
        k.set_current(10, 10);
        let dev = k.alloc_net_device("eth1", 7, 4026532001);
        handle_register_netdevice_enter(&k, dev);
        handle_register_netdevice_exit(&k, 0);

        assert_eq!(k.ifindex_netns().lookup(&7), Some(4026532001));
        let ev: NetDeviceEvent = k.events_of(EventType::NetDevice)[0].decode();
        assert_eq!(name(&ev.device), "eth1");
        assert!(k.veth_state().lookup(&k.pid_tgid()).is_none());
    }

    #[test]
    fn veth_pair_is_reported_once_both_ends_exist() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::VethPair]);
        k.set_current(10, 10);
        let peer = k.alloc_net_device("eth0", 12, 4026532500);
        let host = k.alloc_net_device("veth1a2b", 13, 4026531992);

        handle_veth_newlink_enter(&k);
        handle_register_netdevice_enter(&k, peer);
        handle_register_netdevice_exit(&k, 0);
        assert!(k.events_of(EventType::VethPair).is_empty());

        handle_register_netdevice_enter(&k, host);
        handle_register_netdevice_exit(&k, 0);
        handle_veth_newlink_exit(&k);

        let events = k.events_of(EventType::VethPair);
        assert_eq!(events.len(), 1);
        let ev: VethPairEvent = events[0].decode();
        assert_eq!(name(&ev.peer_device), "eth0");
        assert_eq!(ev.peer_device.netns, 4026532500);
        assert_eq!(name(&ev.host_device), "veth1a2b");
        assert!(k.veth_state().lookup(&k.pid_tgid()).is_none());
    }

    #[test]
    fn failed_peer_registration_does_not_advance() {
        let k = SimKernel::new();
        k.enable_events(&[EventType::VethPair]);
        k.set_current(10, 10);
        let peer = k.alloc_net_device("eth0", 12, 1);
        handle_veth_newlink_enter(&k);
        handle_register_netdevice_enter(&k, peer);
        handle_register_netdevice_exit(&k, -17);
        let state = k.veth_state().lookup(&k.pid_tgid()).unwrap();
        assert_eq!(state.state, VETH_STATE_NEWLINK);
        assert!(k.ifindex_netns().lookup(&12).is_none());
    }
}
