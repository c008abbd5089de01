use std::{collections::VecDeque, time::Duration};

use tokio::{
  sync::Mutex,
  time::{sleep_until, Instant},
};

use crate::metrics::http_server;

/// Sliding-window throttle shared by all outbound ScoreSaber requests.
///
/// `acquire` guarantees that no more than `max_calls` acquisitions are
/// timestamped inside any trailing window of `period`.  The window slides: a
/// call made at t counts against every window covering t, not just the fixed
/// bucket it lands in.
pub struct RateLimiter {
  max_calls: usize,
  period: Duration,
  calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
  pub fn new(max_calls: usize, period: Duration) -> Self {
    assert!(max_calls > 0, "rate limiter window must admit at least one call");
    RateLimiter {
      max_calls,
      period,
      calls: Mutex::new(VecDeque::with_capacity(max_calls)),
    }
  }

  /// Waits until one more outbound call fits inside the trailing window, then
  /// records it.  The wait happens with the internal lock released so other
  /// workers can queue up behind the same window.
  pub async fn acquire(&self) {
    let wait_start = Instant::now();
    loop {
      let deadline = {
        let mut calls = self.calls.lock().await;
        let now = Instant::now();
        while let Some(&oldest) = calls.front() {
          if now.duration_since(oldest) >= self.period {
            calls.pop_front();
          } else {
            break;
          }
        }

        if calls.len() < self.max_calls {
          calls.push_back(now);
          None
        } else {
          // Sleep until the oldest recorded call leaves the window, then
          // re-prune and try again.
          Some(*calls.front().unwrap() + self.period)
        }
      };

      match deadline {
        None => {
          http_server::rate_limiter_wait_time_seconds().observe(wait_start.elapsed().as_nanos() as u64);
          return;
        },
        Some(deadline) => sleep_until(deadline).await,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;

  /// No trailing window of `period` may contain more than `max_calls`
  /// timestamps.  With acquisitions sorted ascending this is equivalent to
  /// `ts[i + max_calls] - ts[i] >= period` for every i.
  fn assert_window_property(mut timestamps: Vec<Instant>, max_calls: usize, period: Duration) {
    timestamps.sort();
    for (ix, &start) in timestamps.iter().enumerate() {
      let Some(&next_window_start) = timestamps.get(ix + max_calls) else {
        break;
      };
      assert!(
        next_window_start.duration_since(start) >= period,
        "calls {ix} and {} are {}ms apart, violating {max_calls} per {}ms",
        ix + max_calls,
        next_window_start.duration_since(start).as_millis(),
        period.as_millis()
      );
    }
  }

  #[tokio::test(start_paused = true)]
  async fn first_window_admits_calls_without_waiting() {
    let limiter = RateLimiter::new(5, Duration::from_secs(60));
    let start = Instant::now();
    for _ in 0..5 {
      limiter.acquire().await;
    }
    assert_eq!(Instant::now(), start);
  }

  #[tokio::test(start_paused = true)]
  async fn blocks_until_oldest_call_expires() {
    let limiter = RateLimiter::new(2, Duration::from_secs(10));
    let start = Instant::now();
    limiter.acquire().await;
    limiter.acquire().await;
    limiter.acquire().await;
    assert_eq!(Instant::now().duration_since(start), Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_callers_never_exceed_the_window() {
    const WORKERS: usize = 20;
    const CALLS_PER_WORKER: usize = 50;
    const MAX_CALLS: usize = 10;
    const PERIOD: Duration = Duration::from_secs(1);

    let limiter = Arc::new(RateLimiter::new(MAX_CALLS, PERIOD));
    let timestamps = Arc::new(Mutex::new(Vec::with_capacity(WORKERS * CALLS_PER_WORKER)));

    let mut handles = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
      let limiter = Arc::clone(&limiter);
      let timestamps = Arc::clone(&timestamps);
      handles.push(tokio::spawn(async move {
        for _ in 0..CALLS_PER_WORKER {
          limiter.acquire().await;
          timestamps.lock().await.push(Instant::now());
        }
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    let timestamps = Arc::try_unwrap(timestamps).unwrap().into_inner();
    assert_eq!(timestamps.len(), WORKERS * CALLS_PER_WORKER);
    assert_window_property(timestamps, MAX_CALLS, PERIOD);
  }
}
