use rand::Rng as _;

/// Exponential backoff with jitter between broker reconnect attempts, so a
/// restarting broker isn't hammered by every client at the same instant.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl ReconnectPolicy {
    /// Compute the delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^attempt, max_delay) + random_jitter(0..base_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp_delay = self
            .base_delay_secs
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = exp_delay.min(self.max_delay_secs);
        let jitter = if self.base_delay_secs > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_secs)
        } else {
            0
        };
        std::time::Duration::from_secs(capped + jitter)
    }
}
