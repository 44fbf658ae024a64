//! Client-wide exponential backoff with jitter. Defaults: 1s base, x1.6,
//! 120s cap, +/-20% jitter; retries reset on a successful response.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
	pub base: Duration,
	pub multiplier: f64,
	pub max: Duration,
	pub jitter: f64,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			multiplier: 1.6,
			max: Duration::from_secs(120),
			jitter: 0.2,
		}
	}
}

impl BackoffConfig {
	/// `attempt` is 0-indexed: the first retry after an initial failure.
	pub fn delay(&self, attempt: u32) -> Duration {
		let unjittered = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
		let unjittered = unjittered.min(self.max.as_secs_f64());
		let jitter_span = unjittered * self.jitter;
		let jittered = rand::rng().random_range((unjittered - jitter_span)..=(unjittered + jitter_span));
		Duration::from_secs_f64(jittered.max(0.0))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_attempt_is_roughly_base() {
		let b = BackoffConfig::default();
		let d = b.delay(0);
		assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
	}

	#[test]
	fn delay_is_capped() {
		let b = BackoffConfig::default();
		let d = b.delay(30);
		assert!(d <= Duration::from_secs(144)); // 120s + 20% jitter headroom
	}
}
