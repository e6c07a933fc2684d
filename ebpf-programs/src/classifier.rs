//! TC entry points.

use core::ffi::c_void;

use aya_ebpf::helpers::gen;
use aya_ebpf::macros::classifier;
use aya_ebpf::programs::TcContext;

use secwatch_common::net::classify;
use secwatch_common::net::packet::{Direction, PacketReader};

use crate::kernel::BpfKernel;
use crate::tail::verdict;

/// The socket buffer behind a classifier context.
pub struct Skb<'a>(pub &'a TcContext);

impl PacketReader for Skb<'_> {
    #[inline(always)]
    fn len(&self) -> u32 {
        self.0.len()
    }

    #[inline(always)]
    fn load(&self, offset: u32, dst: &mut [u8]) -> bool {
        matches!(self.0.load_bytes(offset as usize, dst), Ok(n) if n == dst.len())
    }

    #[inline(always)]
    fn ifindex(&self) -> u32 {
        unsafe { (*self.0.skb.skb).ifindex }
    }

    #[inline(always)]
    fn socket_cookie(&self) -> u64 {
        unsafe { gen::bpf_get_socket_cookie(self.0.skb.skb as *mut c_void) }
    }
}

#[classifier]
pub fn classifier_ingress(ctx: TcContext) -> i32 {
    let next = classify(&BpfKernel, &Skb(&ctx), Direction::Ingress);
    verdict(&ctx, next)
}

#[classifier]
pub fn classifier_egress(ctx: TcContext) -> i32 {
    let next = classify(&BpfKernel, &Skb(&ctx), Direction::Egress);
    verdict(&ctx, next)
}
