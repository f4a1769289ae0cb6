use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter
};
use nonzero_ext::nonzero;
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
};

/// A rate limiter for connection attempts per peer IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared across instances.
    limiter: Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, QuantaClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a new `ConnectionRateLimiter` allowing `per_second` connections
    /// per second from each IP, with bursts of the same size. Zero is treated as one.
    pub fn new(per_second: u32) -> Self {
        let burst_size = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));

        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(burst_size))),
        }
    }

    /// Checks whether a connection from `ip` is allowed right now.
    ///
    /// Never waits: the accept loop must not stall on one noisy peer.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    /// Forgets peers whose quota has fully replenished.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }

    /// Number of peers the limiter currently keeps state for.
    pub fn tracked_peers(&self) -> usize {
        self.limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_limited_per_ip() {
        let limiter = ConnectionRateLimiter::new(2);
        let noisy: IpAddr = [10, 0, 0, 1].into();
        let quiet: IpAddr = [10, 0, 0, 2].into();

        assert!(limiter.check(noisy));
        assert!(limiter.check(noisy));
        assert!(!limiter.check(noisy));
        assert!(limiter.check(quiet));
    }

    #[test]
    fn zero_rate_still_admits_one() {
        let limiter = ConnectionRateLimiter::new(0);
        let ip: IpAddr = [10, 0, 0, 3].into();
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn prune_forgets_replenished_peers() {
        let limiter = ConnectionRateLimiter::new(1000);
        for last in 1..=20u8 {
            assert!(limiter.check([10, 0, 1, last].into()));
        }
        assert_eq!(limiter.tracked_peers(), 20);

        std::thread::sleep(std::time::Duration::from_millis(20));
        limiter.prune();
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
