use chrono::Duration;

/// Tunables for the Moment protocol. Defaults match the product contract:
/// 24 h capture window, 72 h ceiling, a small bounded pool of concurrently
/// active Moments per couple.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capture window applied when `initiate` gets no explicit ttl.
    pub default_ttl: Duration,
    /// Hard ceiling on any requested ttl.
    pub max_ttl: Duration,
    /// Ceiling on non-terminal Moments per couple.
    pub max_active_per_couple: u32,
    /// Attempts for the optimistic capture/expire write before giving up
    /// with `ConcurrencyConflict`.
    pub write_retry_limit: u32,
    /// Attempts for the async fusion job before it is parked as
    /// failed-fusion awaiting a later retry.
    pub fusion_retry_limit: u32,
    /// Pause between fusion attempts.
    pub fusion_retry_delay: std::time::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::hours(24),
            max_ttl: Duration::hours(72),
            max_active_per_couple: 3,
            write_retry_limit: 3,
            fusion_retry_limit: 3,
            fusion_retry_delay: std::time::Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    /// Clamp a requested ttl into the allowed window.
    pub fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(ttl) if ttl > self.max_ttl => self.max_ttl,
            Some(ttl) if ttl > Duration::zero() => ttl,
            Some(_) => self.default_ttl,
            None => self.default_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_clamps_to_the_maximum() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.clamp_ttl(None), Duration::hours(24));
        assert_eq!(cfg.clamp_ttl(Some(Duration::hours(100))), Duration::hours(72));
        assert_eq!(cfg.clamp_ttl(Some(Duration::seconds(1))), Duration::seconds(1));
        assert_eq!(cfg.clamp_ttl(Some(Duration::zero())), Duration::hours(24));
    }
}
