use foundations::telemetry::metrics::{metrics, Counter, Gauge, HistogramBuilder, TimeHistogram};

#[metrics]
pub mod http_server {
  /// Number of HTTP requests.
  pub fn requests_total(endpoint_name: &'static str) -> Counter;

  /// Number of successful HTTP requests.
  pub fn requests_success_total(endpoint_name: &'static str) -> Counter;

  /// Number of failed requests.
  pub fn requests_failed_total(endpoint_name: &'static str) -> Counter;

  /// Number of requests made to the ScoreSaber API.
  pub fn scoresaber_api_requests_total(endpoint_name: &'static str) -> Counter;

  /// Number of failed requests made to the ScoreSaber API.
  pub fn scoresaber_api_requests_failed_total(
    endpoint_name: &'static str,
    status_code: u16,
  ) -> Counter;

  /// Distribution of response times for the ScoreSaber API.
  #[ctor = HistogramBuilder {
    buckets: &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
  }]
  pub fn scoresaber_api_response_time_seconds(endpoint_name: &'static str) -> TimeHistogram;

  /// Time spent waiting on the outbound rate limiter.
  #[ctor = HistogramBuilder {
    buckets: &[0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0],
  }]
  pub fn rate_limiter_wait_time_seconds() -> TimeHistogram;

  /// Number of refresh cycles started.
  pub fn refresh_cycles_total() -> Counter;

  /// Number of refresh cycles that failed and retained the previous snapshot.
  pub fn refresh_cycles_failed_total() -> Counter;

  /// Distribution of full refresh cycle durations.
  #[ctor = HistogramBuilder {
    buckets: &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0],
  }]
  pub fn refresh_cycle_duration_seconds() -> TimeHistogram;

  /// Number of per-player score batches merged into the store.
  pub fn store_merge_batches_total() -> Counter;

  /// Number of per-player score batches that failed to merge and were rolled
  /// back.
  pub fn store_merge_batches_failed_total() -> Counter;

  /// Number of players currently present in the published custom ranking.
  pub fn custom_ranking_players() -> Gauge;
}
