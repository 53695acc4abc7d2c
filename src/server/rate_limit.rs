//! Rate limiting for the public verification endpoint.
//!
//! ```toml
//! [rate_limit]
//! enabled = true
//! verify_rpm = 100   # verification requests per minute per client IP
//! burst_size = 5     # short bursts above the steady rate
//! ```
//!
//! Keys are client IPs taken by `SmartIpKeyExtractor`, which honours
//! `X-Forwarded-For`/`X-Real-IP` before the peer address. The server must be
//! started with `into_make_service_with_connect_info::<SocketAddr>()`.

use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;

pub use tower_governor::key_extractor::SmartIpKeyExtractor;
pub use tower_governor::GovernorLayer;

use crate::config::RateLimitConfig;

/// Replenish interval in milliseconds for a requests-per-minute budget.
fn replenish_interval_ms(rpm: u64) -> u64 {
    if rpm > 0 {
        (60_000 / rpm).max(1)
    } else {
        60_000
    }
}

/// Build the verification rate limiter.
///
/// Returns `None` if the configuration is rejected by `governor`
/// (e.g. a zero burst size).
pub fn create_verify_rate_limiter(
    config: &RateLimitConfig,
) -> Option<GovernorLayer<SmartIpKeyExtractor, NoOpMiddleware>> {
    let governor_config = GovernorConfigBuilder::default()
        .per_millisecond(replenish_interval_ms(config.verify_rpm))
        .burst_size(config.burst_size)
        .key_extractor(SmartIpKeyExtractor)
        .finish()?;

    Some(GovernorLayer {
        config: Arc::new(governor_config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_config_defaults() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.verify_rpm, 100);
        assert_eq!(config.burst_size, 5);
    }

    #[test]
    fn replenish_interval() {
        assert_eq!(replenish_interval_ms(100), 600);
        assert_eq!(replenish_interval_ms(0), 60_000);
        assert_eq!(replenish_interval_ms(1_000_000), 1);
    }

    #[test]
    fn create_verify_rate_limiter_accepts_defaults() {
        assert!(create_verify_rate_limiter(&RateLimitConfig::default()).is_some());
    }

    #[test]
    fn zero_burst_is_rejected() {
        let config = RateLimitConfig {
            burst_size: 0,
            ..RateLimitConfig::default()
        };
        assert!(create_verify_rate_limiter(&config).is_none());
    }
}
