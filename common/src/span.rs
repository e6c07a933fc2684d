//! Span TLS: per-thread trace context published by instrumented programs.
//!
//! A thread group registers `{format, max_threads, base}` through eRPC. The
//! slot of thread `tid` lives at `base + (tid % max_threads) * 24` in user
//! memory and holds `span_id, trace_id_lo, trace_id_hi`.

use crate::consts::SPAN_TLS_FORMAT_DEFAULT;
use crate::event::SpanContext;
use crate::kernel::{plain, Kernel, Map, UpdateFlag};

pub const SPAN_SLOT_LEN: u64 = 24;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpanTls {
    pub format: u64,
    pub max_threads: u64,
    pub base: u64,
}

plain!(SpanTls);

pub fn register_span_tls<K: Kernel>(k: &K, tgid: u32, tls: &SpanTls) -> bool {
    if tls.format != SPAN_TLS_FORMAT_DEFAULT || tls.max_threads == 0 || tls.base == 0 {
        return false;
    }
    k.span_tls().store(&tgid, tls, UpdateFlag::Any).is_ok()
}

pub fn unregister_span_tls<K: Kernel>(k: &K, tgid: u32) {
    let _ = k.span_tls().delete(&tgid);
}

/// Span of thread `tid`; zero when unregistered or unreadable.
pub fn span_context<K: Kernel>(k: &K, tgid: u32, tid: u32) -> SpanContext {
    let Some(tls) = k.span_tls().lookup(&tgid) else {
        return SpanContext::default();
    };
    let slot = tls.base + (tid as u64 % tls.max_threads) * SPAN_SLOT_LEN;
    match k.read_user_value::<[u64; 3]>(slot) {
        Some([span_id, lo, hi]) => SpanContext {
            span_id,
            trace_id: [lo, hi],
        },
        None => SpanContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn thread_slot_is_read_from_user_memory() {
        let k = SimKernel::new();
        let base = k.alloc_user(4 * SPAN_SLOT_LEN);
        let slot = base + 2 * SPAN_SLOT_LEN;
        k.write_user_bytes(slot, &[7u64, 8, 9].map(u64::to_ne_bytes).concat());
        let tls = SpanTls {
            format: SPAN_TLS_FORMAT_DEFAULT,
            max_threads: 4,
            base,
        };
        assert!(register_span_tls(&k, 10, &tls));

        let span = span_context(&k, 10, 6);
        assert_eq!(span.span_id, 7);
        assert_eq!(span.trace_id, [8, 9]);
        assert_eq!(span_context(&k, 11, 6), SpanContext::default());

        unregister_span_tls(&k, 10);
        assert_eq!(span_context(&k, 10, 6), SpanContext::default());
    }

    #[test]
    fn unknown_formats_are_refused() {
        let k = SimKernel::new();
        let tls = SpanTls {
            format: 3,
            max_threads: 4,
            base: 0x1000,
        };
        assert!(!register_span_tls(&k, 10, &tls));
    }
}
