use std::{cmp::Reverse, fmt::Display, sync::Arc, time::Duration};

use axum::http::StatusCode;
use float_ord::FloatOrd;
use lazy_static::lazy_static;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use tokio::{sync::Semaphore, time::Instant};

use crate::{metrics::http_server, ratelimiter::RateLimiter, server::APIError};

const BASE_URL: &str = "https://scoresaber.com/api";
/// Applied once after an upstream 429 before the single bounded retry.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);
const ITEMS_PER_PAGE: u32 = 100;

lazy_static! {
  static ref REQWEST_CLIENT: Client = Client::new();
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
  pub total: u32,
  pub page: u32,
  pub items_per_page: u32,
}

impl PageMetadata {
  fn total_pages(&self) -> u32 {
    if self.total == 0 || self.items_per_page == 0 {
      return 1;
    }
    self.total.div_ceil(self.items_per_page)
  }
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreStats {
  pub ranked_play_count: u32,
  // pub total_score: i64,
  // pub total_ranked_score: i64,
  // pub average_ranked_accuracy: f64,
  // pub total_play_count: u32,
  // pub replays_watched: u32,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResponse {
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  pub country: Option<String>,
  pub pp: f64,
  pub country_rank: i32,
  // pub rank: i32,
  // pub histories: String,
  // pub banned: bool,
  #[serde(default)]
  pub score_stats: Option<ScoreStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayersPage {
  players: Vec<PlayerResponse>,
  metadata: PageMetadata,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPlayerInfo {
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  pub country: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardScore {
  pub rank: u32,
  pub base_score: i64,
  pub modified_score: i64,
  /// Comma-separated modifier acronyms like "NF,DA".
  pub modifiers: String,
  pub time_set: String,
  pub leaderboard_player_info: LeaderboardPlayerInfo,
  // pub bad_cuts: u32,
  // pub missed_notes: u32,
  // pub max_combo: u32,
  // pub full_combo: bool,
}

impl LeaderboardScore {
  pub fn has_modifier(&self, acronym: &str) -> bool {
    self.modifiers.split(',').any(|m| m == acronym)
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardScoresPage {
  scores: Vec<LeaderboardScore>,
  metadata: PageMetadata,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerScoreBody {
  pub id: i64,
  /// Map-global rank of this score on its leaderboard.
  pub rank: i64,
  pub pp: f64,
  pub weight: f64,
  pub modified_score: i64,
  pub modifiers: String,
  pub time_set: String,
  // pub base_score: i64,
  // pub bad_cuts: u32,
  // pub missed_notes: u32,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerScoreLeaderboard {
  pub id: i64,
  pub song_name: String,
  pub song_author_name: String,
  pub level_author_name: String,
  pub cover_image: String,
  pub max_score: i64,
  pub stars: f64,
  pub ranked: bool,
  pub difficulty: LeaderboardDifficulty,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDifficulty {
  pub difficulty: i32,
  pub difficulty_raw: String,
}

impl LeaderboardDifficulty {
  /// Difficulty label as stored and displayed, e.g. "Expert+".
  pub fn label(&self) -> String {
    let name = match self.difficulty {
      1 => "Easy",
      3 => "Normal",
      5 => "Hard",
      7 => "Expert",
      9 => "ExpertPlus",
      _ => return format!("{}", self.difficulty),
    };
    name.replace("Plus", "+")
  }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerScoreRow {
  pub score: PlayerScoreBody,
  pub leaderboard: PlayerScoreLeaderboard,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerScoresPage {
  player_scores: Vec<PlayerScoreRow>,
  metadata: PageMetadata,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardInfo {
  pub id: i64,
  pub song_name: String,
  pub song_hash: String,
  pub cover_image: String,
  pub level_author_name: String,
  pub max_score: i64,
}

/// Sort order for per-player score history pages.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PlayerScoreSort {
  /// Sorted by PP; used for first-time full backfills.
  Top,
  /// Most recent first; used for incremental refreshes of known players.
  Recent,
}

impl Display for PlayerScoreSort {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", match self {
      PlayerScoreSort::Top => "top",
      PlayerScoreSort::Recent => "recent",
    })
  }
}

/// Typed client for the ScoreSaber REST API.  All requests pass through one
/// shared [`RateLimiter`]; multi-page fetches fan out across a bounded worker
/// pool and re-sort merged rows by the upstream rank/PP field, since
/// concurrent completion order is not authoritative order.
#[derive(Clone)]
pub struct ScoreSaberClient {
  limiter: Arc<RateLimiter>,
  page_fetch_workers: usize,
}

impl ScoreSaberClient {
  pub fn new(limiter: Arc<RateLimiter>, page_fetch_workers: usize) -> Self {
    ScoreSaberClient {
      limiter,
      page_fetch_workers: page_fetch_workers.max(1),
    }
  }

  /// One rate-limited GET + parse.  An upstream 429 gets a single bounded
  /// retry after a fixed backoff; any other failure is returned to the
  /// caller, which decides whether the enclosing operation survives it.
  async fn get_json<T: DeserializeOwned>(
    &self,
    endpoint_name: &'static str,
    url: &str,
  ) -> Result<T, APIError> {
    let mut retried = false;
    loop {
      self.limiter.acquire().await;

      http_server::scoresaber_api_requests_total(endpoint_name).inc();
      let now = Instant::now();
      let res = REQWEST_CLIENT
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|err| {
          error!("Failed to fetch {url}: {err}");
          http_server::scoresaber_api_requests_failed_total(
            endpoint_name,
            err.status().map(|s| s.as_u16()).unwrap_or(0),
          )
          .inc();
          APIError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Failed to fetch {endpoint_name}"),
          }
        })?;
      let status_code = res.status();
      let res_text = res.text().await.map_err(|err| {
        error!(?status_code, "Failed to read {endpoint_name} response: {err}");
        http_server::scoresaber_api_requests_failed_total(endpoint_name, status_code.as_u16()).inc();
        APIError {
          status: StatusCode::INTERNAL_SERVER_ERROR,
          message: format!("Failed to read {endpoint_name} response"),
        }
      })?;

      http_server::scoresaber_api_response_time_seconds(endpoint_name)
        .observe(now.elapsed().as_nanos() as u64);

      if status_code == reqwest::StatusCode::TOO_MANY_REQUESTS && !retried {
        warn!("Rate limited by upstream on {endpoint_name}; backing off and retrying once");
        retried = true;
        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
        continue;
      }

      if !status_code.is_success() {
        error!(?status_code, "Failed to fetch {endpoint_name}; res: {res_text}");
        http_server::scoresaber_api_requests_failed_total(endpoint_name, status_code.as_u16()).inc();
        return Err(APIError {
          status: StatusCode::from_u16(status_code.as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
          message: format!("Failed to fetch {endpoint_name}"),
        });
      }

      let deserializer = &mut serde_json::Deserializer::from_str(&res_text);
      return match serde_path_to_error::deserialize(deserializer) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
          error!("Failed to parse {endpoint_name} response; res: {res_text}; err: {err}");
          http_server::scoresaber_api_requests_failed_total(endpoint_name, status_code.as_u16())
            .inc();
          Err(APIError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Failed to parse {endpoint_name} response"),
          })
        },
      };
    }
  }

  /// Walks country player pages sequentially until a page comes back empty or
  /// the running total reaches the reported total.  A page error ends the
  /// walk with whatever has been collected so far; partial results are
  /// acceptable.
  pub async fn fetch_country_players(&self, country: &str) -> Vec<PlayerResponse> {
    let mut players: Vec<PlayerResponse> = Vec::new();
    let mut page = 1u32;

    loop {
      let url = format!("{BASE_URL}/players?countries={country}&page={page}");
      let res: PlayersPage = match self.get_json("fetch_country_players", &url).await {
        Ok(res) => res,
        Err(err) => {
          error!(
            "Failed to fetch player page {page} for {country}; returning {} players collected so \
             far: {err:?}",
            players.len()
          );
          break;
        },
      };

      if res.players.is_empty() {
        break;
      }
      players.extend(res.players);
      if players.len() as u32 >= res.metadata.total {
        break;
      }
      page += 1;
    }

    players
  }

  /// Fetches all country-filtered scores for one leaderboard.  Page 1 is
  /// fetched first to learn the page count; any remaining pages fan out
  /// across the bounded worker pool.  A failed page contributes an empty
  /// page rather than aborting the whole call, and merged rows are re-sorted
  /// by the upstream rank field.
  pub async fn fetch_leaderboard_scores(
    &self,
    leaderboard_id: i64,
    country: &str,
  ) -> Vec<LeaderboardScore> {
    let url = page_url(leaderboard_id, country, 1);
    let first_page: LeaderboardScoresPage =
      match self.get_json("fetch_leaderboard_scores", &url).await {
        Ok(res) => res,
        Err(err) => {
          error!("Failed to fetch scores page 1 for leaderboard {leaderboard_id}: {err:?}");
          return Vec::new();
        },
      };

    let total_pages = first_page.metadata.total_pages();
    let mut all_scores = first_page.scores;
    if total_pages <= 1 {
      return all_scores;
    }

    let semaphore = Arc::new(Semaphore::new(self.page_fetch_workers));
    let mut handles = Vec::with_capacity(total_pages as usize - 1);
    for page in 2..=total_pages {
      let client = self.clone();
      let semaphore = Arc::clone(&semaphore);
      let country = country.to_owned();
      handles.push(tokio::spawn(async move {
        let _permit = semaphore.acquire().await.expect("page fetch semaphore closed");
        let url = page_url(leaderboard_id, &country, page);
        match client
          .get_json::<LeaderboardScoresPage>("fetch_leaderboard_scores", &url)
          .await
        {
          Ok(res) => res.scores,
          Err(err) => {
            error!("Failed to fetch scores page {page} for leaderboard {leaderboard_id}: {err:?}");
            Vec::new()
          },
        }
      }));
    }

    for handle in handles {
      match handle.await {
        Ok(scores) => all_scores.extend(scores),
        Err(err) => error!("Leaderboard page fetch task panicked: {err}"),
      }
    }

    all_scores.sort_unstable_by_key(|score| score.rank);
    all_scores
  }

  /// Fetches a player's score history, `max_pages` bounding the walk when
  /// set.  Same page-1-then-fan-out pattern as leaderboard scores; the merge
  /// is re-sorted by PP ("top") or set time ("recent") to restore the
  /// authoritative order.
  pub async fn fetch_player_scores(
    &self,
    player_id: &str,
    sort: PlayerScoreSort,
    max_pages: Option<usize>,
  ) -> Vec<PlayerScoreRow> {
    let url = player_scores_url(player_id, sort, 1);
    let first_page: PlayerScoresPage = match self.get_json("fetch_player_scores", &url).await {
      Ok(res) => res,
      Err(err) => {
        error!("Failed to fetch scores page 1 for player {player_id}: {err:?}");
        return Vec::new();
      },
    };

    let mut total_pages = first_page.metadata.total_pages();
    if let Some(max_pages) = max_pages {
      total_pages = total_pages.min(max_pages.max(1) as u32);
    }
    let mut all_rows = first_page.player_scores;

    if total_pages > 1 {
      let semaphore = Arc::new(Semaphore::new(self.page_fetch_workers));
      let mut handles = Vec::with_capacity(total_pages as usize - 1);
      for page in 2..=total_pages {
        let client = self.clone();
        let semaphore = Arc::clone(&semaphore);
        let player_id = player_id.to_owned();
        handles.push(tokio::spawn(async move {
          let _permit = semaphore.acquire().await.expect("page fetch semaphore closed");
          let url = player_scores_url(&player_id, sort, page);
          match client
            .get_json::<PlayerScoresPage>("fetch_player_scores", &url)
            .await
          {
            Ok(res) => res.player_scores,
            Err(err) => {
              error!("Failed to fetch scores page {page} for player {player_id}: {err:?}");
              Vec::new()
            },
          }
        }));
      }

      for handle in handles {
        match handle.await {
          Ok(rows) => all_rows.extend(rows),
          Err(err) => error!("Player score page fetch task panicked: {err}"),
        }
      }
    }

    match sort {
      PlayerScoreSort::Top =>
        all_rows.sort_unstable_by_key(|row| Reverse(FloatOrd(row.score.pp))),
      PlayerScoreSort::Recent =>
        all_rows.sort_unstable_by(|a, b| b.score.time_set.cmp(&a.score.time_set)),
    }
    all_rows
  }

  /// Single-request full profile lookup.  A 404 is a defined "not found"
  /// outcome; any other failure is logged and also surfaces as absent rather
  /// than crossing this boundary as an error.
  pub async fn fetch_player_full(&self, player_id: &str) -> Option<PlayerResponse> {
    let url = format!("{BASE_URL}/player/{player_id}/full");
    match self.get_json::<PlayerResponse>("fetch_player_full", &url).await {
      Ok(player) => Some(player),
      Err(err) if err.status == StatusCode::NOT_FOUND => None,
      Err(err) => {
        error!("Failed to fetch full profile for player {player_id}: {err:?}");
        None
      },
    }
  }

  /// Leaderboard metadata lookup; used for playlist hash resolution.
  pub async fn fetch_leaderboard_info(&self, leaderboard_id: i64) -> Option<LeaderboardInfo> {
    let url = format!("{BASE_URL}/leaderboard/by-id/{leaderboard_id}/info");
    match self.get_json::<LeaderboardInfo>("fetch_leaderboard_info", &url).await {
      Ok(info) => Some(info),
      Err(err) => {
        error!("Failed to fetch leaderboard info for {leaderboard_id}: {err:?}");
        None
      },
    }
  }
}

fn page_url(leaderboard_id: i64, country: &str, page: u32) -> String {
  format!("{BASE_URL}/leaderboard/by-id/{leaderboard_id}/scores?countries={country}&page={page}")
}

fn player_scores_url(player_id: &str, sort: PlayerScoreSort, page: u32) -> String {
  format!(
    "{BASE_URL}/player/{player_id}/scores?limit={ITEMS_PER_PAGE}&sort={sort}&page={page}&withMetadata=false"
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn total_pages_rounds_up_and_handles_empty_metadata() {
    let meta = PageMetadata {
      total: 0,
      page: 1,
      items_per_page: 0,
    };
    assert_eq!(meta.total_pages(), 1);

    let meta = PageMetadata {
      total: 250,
      page: 1,
      items_per_page: 100,
    };
    assert_eq!(meta.total_pages(), 3);

    let meta = PageMetadata {
      total: 300,
      page: 1,
      items_per_page: 100,
    };
    assert_eq!(meta.total_pages(), 3);
  }

  #[test]
  fn modifier_matching_is_exact_per_acronym() {
    let score = LeaderboardScore {
      rank: 1,
      base_score: 0,
      modified_score: 0,
      modifiers: "DA,NF".to_owned(),
      time_set: String::new(),
      leaderboard_player_info: LeaderboardPlayerInfo {
        id: "1".to_owned(),
        name: "p".to_owned(),
        profile_picture: String::new(),
        country: None,
      },
    };
    assert!(score.has_modifier("NF"));
    assert!(score.has_modifier("DA"));
    assert!(!score.has_modifier("F"));
    assert!(!score.has_modifier("N"));
  }

  #[test]
  fn difficulty_labels_match_display_convention() {
    let diff = |d| LeaderboardDifficulty {
      difficulty: d,
      difficulty_raw: String::new(),
    };
    assert_eq!(diff(1).label(), "Easy");
    assert_eq!(diff(7).label(), "Expert");
    assert_eq!(diff(9).label(), "Expert+");
    assert_eq!(diff(4).label(), "4");
  }
}
