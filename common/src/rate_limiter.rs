//! Per-dump sampling budget.
//!
//! Each dump cookie owns one [`RateLimiterCtx`]. The algorithm is picked
//! from the low bits of the clock whenever a period starts, so the shape of
//! the budget changes from one period to the next.

use crate::consts::{RATE_LIMITER_HALF_PERIOD_NS, RATE_LIMITER_PERIOD_NS};
use crate::kernel::{plain, Kernel, Map, UpdateFlag};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimiterAlgo {
    /// Up to `rate` per second.
    Basic = 0,
    /// Up to `rate / 2` per half second.
    BasicHalf = 1,
    /// First quarter free, then dropped with probability `counter / rate`.
    DecreasingDroprate = 2,
    /// First quarter free, then dropped with probability `1 - counter / rate`.
    IncreasingDroprate = 3,
}

impl RateLimiterAlgo {
    pub fn from_u32(v: u32) -> Self {
        match v & 3 {
            0 => RateLimiterAlgo::Basic,
            1 => RateLimiterAlgo::BasicHalf,
            2 => RateLimiterAlgo::DecreasingDroprate,
            _ => RateLimiterAlgo::IncreasingDroprate,
        }
    }

    /// Algorithm of a period starting at `now`.
    pub fn for_period(now: u64) -> Self {
        Self::from_u32(now as u32)
    }

    pub fn period(self) -> u64 {
        match self {
            RateLimiterAlgo::BasicHalf => RATE_LIMITER_HALF_PERIOD_NS,
            _ => RATE_LIMITER_PERIOD_NS,
        }
    }

    pub fn cap(self, rate: u32) -> u32 {
        match self {
            RateLimiterAlgo::BasicHalf => rate / 2,
            _ => rate,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimiterCtx {
    pub period_start: u64,
    pub counter: u32,
    pub algo: u32,
}

plain!(RateLimiterCtx);

impl RateLimiterCtx {
    fn new(now: u64) -> Self {
        Self {
            period_start: now,
            counter: 0,
            algo: RateLimiterAlgo::for_period(now) as u32,
        }
    }

    fn admits<K: Kernel>(&self, k: &K, rate: u32) -> bool {
        let algo = RateLimiterAlgo::from_u32(self.algo);
        if self.counter >= algo.cap(rate) {
            return false;
        }
        match algo {
            RateLimiterAlgo::Basic | RateLimiterAlgo::BasicHalf => true,
            _ if self.counter < rate / 4 => true,
            RateLimiterAlgo::DecreasingDroprate => k.random_u32() % rate >= self.counter,
            RateLimiterAlgo::IncreasingDroprate => k.random_u32() % rate < self.counter,
        }
    }
}

/// Consumes one unit of the budget of `cookie`. A zero rate admits nothing.
pub fn allow<K: Kernel>(k: &K, cookie: u64, rate: u32) -> bool {
    if rate == 0 {
        return false;
    }
    let now = k.now_ns();
    if !k.rate_limiters().contains(&cookie) {
        let ctx = RateLimiterCtx::new(now);
        if k.rate_limiters().store(&cookie, &ctx, UpdateFlag::NoExist).is_err()
            && !k.rate_limiters().contains(&cookie)
        {
            return false;
        }
    }
    k.rate_limiters()
        .with_mut(&cookie, |ctx| {
            let period = RateLimiterAlgo::from_u32(ctx.algo).period();
            if now.saturating_sub(ctx.period_start) >= period {
                *ctx = RateLimiterCtx::new(now);
            }
            let admitted = ctx.admits(k, rate);
            if admitted {
                ctx.counter += 1;
            }
            admitted
        })
        .unwrap_or(false)
}

pub fn reset<K: Kernel>(k: &K, cookie: u64) {
    let _ = k.rate_limiters().delete(&cookie);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    fn admitted(k: &SimKernel, cookie: u64, rate: u32, attempts: u32) -> u32 {
        (0..attempts).filter(|_| allow(k, cookie, rate)).count() as u32
    }

    /// Moves the clock to the next instant whose low bits select `algo`.
    fn pin(k: &SimKernel, algo: RateLimiterAlgo) {
        while RateLimiterAlgo::for_period(k.now_ns()) != algo {
            k.advance(1);
        }
    }

    #[test]
    fn basic_caps_at_rate() {
        let k = SimKernel::new();
        pin(&k, RateLimiterAlgo::Basic);
        assert_eq!(admitted(&k, 1, 10, 50), 10);
    }

    #[test]
    fn basic_half_caps_at_half_rate() {
        let k = SimKernel::new();
        pin(&k, RateLimiterAlgo::BasicHalf);
        assert_eq!(admitted(&k, 1, 10, 50), 5);
    }

    #[test]
    fn drop_rate_variants_never_exceed_rate() {
        for algo in [RateLimiterAlgo::DecreasingDroprate, RateLimiterAlgo::IncreasingDroprate] {
            let k = SimKernel::new();
            pin(&k, algo);
            let n = admitted(&k, 1, 40, 400);
            assert!(n >= 10, "{algo:?} admitted {n}");
            assert!(n <= 40, "{algo:?} admitted {n}");
        }
    }

    #[test]
    fn budget_refills_on_the_next_period() {
        let k = SimKernel::new();
        pin(&k, RateLimiterAlgo::Basic);
        assert_eq!(admitted(&k, 1, 3, 10), 3);
        k.advance(RATE_LIMITER_PERIOD_NS);
        pin(&k, RateLimiterAlgo::Basic);
        assert_eq!(admitted(&k, 1, 3, 10), 3);
    }

    #[test]
    fn zero_rate_admits_nothing() {
        let k = SimKernel::new();
        assert!(!allow(&k, 1, 0));
    }
}
