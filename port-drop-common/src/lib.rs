#![no_std]

// Layouts shared between the control plane and the XDP object it loads.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

/// XDP entry point that drops TCP segments addressed to the configured port.
pub const XDP_PROGRAM: &str = "drop_tcp_on_port";
/// Array map holding the destination port to filter.
pub const MAP_PORT_CONFIG: &str = "port_map";
/// Array map holding the number of dropped segments.
pub const MAP_DROP_COUNTER: &str = "drop_cnt";
/// Both maps are single-slot arrays.
pub const CONTROL_SLOT: u32 = 0;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PortConfig {
    pub port: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DropCounter {
    pub packets: u64,
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` so the types work with aya's typed
// map APIs. The eBPF side never pulls in userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    use super::{DropCounter, PortConfig};
    use aya::Pod;

    unsafe impl Pod for PortConfig {}
    unsafe impl Pod for DropCounter {}
}
