use foundations::{settings::settings, telemetry::settings::TelemetrySettings};
use serde_default_utils::*;

fn default_country() -> String { "BR".to_owned() }

fn default_playlist_title() -> String { "BSBR Ranked Maps".to_owned() }

fn default_playlist_author() -> String { "BSBR Team".to_owned() }

#[settings]
pub struct SqlSettings {
  pub db_url: String,
}

/// Sliding-window throttle for outbound ScoreSaber requests.  The upstream
/// limit is ~400 calls per 60 seconds; the default leaves a margin for clock
/// skew and burst latency.
#[settings]
pub struct RateLimitSettings {
  #[serde(default = "default_usize::<350>")]
  pub max_calls: usize,
  #[serde(default = "default_u64::<60>")]
  pub period_secs: u64,
}

#[settings]
pub struct RefreshSettings {
  /// Seconds between refresh cycles.  The first cycle runs immediately on
  /// startup.
  #[serde(default = "default_u64::<1800>")]
  pub interval_secs: u64,
  /// Number of top official players whose full score history is kept in sync
  /// with the score store each cycle.
  #[serde(default = "default_usize::<50>")]
  pub top_players: usize,
  /// Page bound for the incremental "recent" fetch of players that already
  /// have persisted scores.  First-time backfills are unbounded.
  #[serde(default = "default_usize::<5>")]
  pub recent_pages: usize,
  /// Worker pool size for concurrent page fetches within one leaderboard or
  /// player history.
  #[serde(default = "default_usize::<10>")]
  pub page_fetch_workers: usize,
  /// Worker pool size for concurrent per-player history syncs.
  #[serde(default = "default_usize::<10>")]
  pub player_fetch_workers: usize,
}

#[settings]
pub struct PlaylistSettings {
  #[serde(default = "default_playlist_title")]
  pub title: String,
  #[serde(default = "default_playlist_author")]
  pub author: String,
  /// Public base URL of this service; used to build the playlist sync URL.
  /// Leave empty to omit the sync URL.
  pub base_url: String,
}

#[settings]
pub struct ServerSettings {
  /// Telemetry settings.
  pub telemetry: TelemetrySettings,

  /// Port that the HTTP server will listen on.
  #[serde(default = "default_u16::<4520>")]
  pub port: u16,
  /// Country code used for all country-filtered upstream queries.
  #[serde(default = "default_country")]
  pub country: String,
  pub sql: SqlSettings,
  pub rate_limit: RateLimitSettings,
  pub refresh: RefreshSettings,
  pub playlist: PlaylistSettings,
}
