//! Owns the published ranking snapshot and the background refresh loop.
//!
//! Readers always observe either the previous complete snapshot or the next
//! complete one; a cycle failure keeps the previous snapshot published and
//! returns the loop to idle.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
  },
  time::Duration,
};

use arc_swap::ArcSwap;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use serde::Serialize;
use tokio::{sync::watch, sync::Semaphore, time::Instant};

use crate::{
  metrics::http_server,
  ranking::{
    build_ranking, build_star_bands, parse_stars_label, BandScore, MapScore, Player, PlayerDetail,
    RankingEntry, StarBandEntry,
  },
  scoresaber_api::{PlayerScoreRow, PlayerScoreSort, ScoreSaberClient},
  server::APIError,
  settings::ServerSettings,
  store::{self, RankedMap, StoredScore},
};

/// The read-only bundle served to all consumers.  Replaced wholesale at the
/// end of each successful refresh cycle, never mutated in place.
#[derive(Default)]
pub struct CacheSnapshot {
  pub official_ranking: Vec<Player>,
  pub custom_ranking: Vec<RankingEntry>,
  pub maps: Vec<RankedMap>,
  /// Keyed by player id; scores on curated maps only.
  pub player_details: FxHashMap<String, PlayerDetail>,
  /// Keyed by player id; persisted scores on any leaderboard, PP-descending.
  pub global_scores: FxHashMap<String, Vec<StoredScore>>,
  pub last_updated: Option<DateTime<Utc>>,
}

struct RefreshConfig {
  country: String,
  interval: Duration,
  top_players: usize,
  recent_pages: usize,
  player_fetch_workers: usize,
}

/// Service object owning the snapshot and the refresh lifecycle.  Constructed
/// once at startup; handles are shared by reference.
pub struct RankingCache {
  snapshot: ArcSwap<CacheSnapshot>,
  is_refreshing: AtomicBool,
  client: ScoreSaberClient,
  config: RefreshConfig,
  stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl RankingCache {
  pub fn new(client: ScoreSaberClient, settings: &ServerSettings) -> Self {
    RankingCache {
      snapshot: ArcSwap::new(Arc::new(CacheSnapshot::default())),
      is_refreshing: AtomicBool::new(false),
      client,
      config: RefreshConfig {
        country: settings.country.clone(),
        interval: Duration::from_secs(settings.refresh.interval_secs),
        top_players: settings.refresh.top_players,
        recent_pages: settings.refresh.recent_pages,
        player_fetch_workers: settings.refresh.player_fetch_workers.max(1),
      },
      stop_tx: Mutex::new(None),
    }
  }

  pub(crate) fn client(&self) -> &ScoreSaberClient { &self.client }

  /// Spawns the refresh loop.  The first cycle runs immediately; afterwards
  /// the loop sleeps `interval` between cycles.
  pub fn start(self: &Arc<Self>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    *self.stop_tx.lock().unwrap() = Some(stop_tx);

    let this = Arc::clone(self);
    tokio::spawn(async move {
      info!(
        "Starting ranking refresh loop; interval={}s",
        this.config.interval.as_secs()
      );
      loop {
        this.refresh_once().await;

        // The stop signal is only observed here, between cycles, so a
        // running cycle always completes and publishes (or fails and is
        // logged) before the loop exits.
        tokio::select! {
          _ = tokio::time::sleep(this.config.interval) => {},
          _ = stop_rx.changed() => {
            info!("Ranking refresh loop stopped");
            return;
          },
        }
      }
    });
  }

  /// Signals the refresh loop to exit after the current cycle.
  pub fn stop(&self) {
    if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
      let _ = stop_tx.send(true);
    }
  }

  pub fn snapshot(&self) -> Arc<CacheSnapshot> { self.snapshot.load_full() }

  pub fn is_refreshing(&self) -> bool { self.is_refreshing.load(Ordering::SeqCst) }

  /// Runs one full refresh cycle.  Failures are logged and leave the
  /// previous snapshot untouched; the in-progress flag always clears.
  pub async fn refresh_once(&self) {
    http_server::refresh_cycles_total().inc();
    self.is_refreshing.store(true, Ordering::SeqCst);
    let start = Instant::now();

    match self.run_cycle().await {
      Ok(()) => {
        http_server::refresh_cycle_duration_seconds().observe(start.elapsed().as_nanos() as u64);
        info!("Refresh cycle completed in {:?}", start.elapsed());
      },
      Err(err) => {
        http_server::refresh_cycles_failed_total().inc();
        error!("Refresh cycle failed; previous snapshot remains published: {err:?}");
      },
    }

    self.is_refreshing.store(false, Ordering::SeqCst);
  }

  async fn run_cycle(&self) -> Result<(), APIError> {
    let pool = store::db_pool();

    info!("Fetching official {} player list...", self.config.country);
    let official: Vec<Player> = self
      .client
      .fetch_country_players(&self.config.country)
      .await
      .iter()
      .map(Player::from)
      .collect();
    info!("Fetched {} official players", official.len());

    let maps = store::load_ranked_maps(pool).await.map_err(|err| {
      error!("Failed to load ranked map catalog: {err}");
      APIError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Failed to load ranked map catalog".to_owned(),
      }
    })?;

    info!("Fetching country scores for {} ranked maps...", maps.len());
    let mut scores_by_map = FxHashMap::default();
    for map in &maps {
      let scores = self
        .client
        .fetch_leaderboard_scores(map.leaderboard_id, &self.config.country)
        .await;
      scores_by_map.insert(map.leaderboard_id, scores);
    }

    let outcome = build_ranking(&maps, &scores_by_map);
    info!("Computed custom ranking with {} players", outcome.ranking.len());

    self.sync_global_scores(&official).await;

    let global_scores = store::load_score_index(pool).await.map_err(|err| {
      error!("Failed to reload the score store: {err}");
      APIError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Failed to reload the score store".to_owned(),
      }
    })?;

    http_server::custom_ranking_players().set(outcome.ranking.len() as u64);

    // Single swap; no reader ever sees a half-updated snapshot.
    self.snapshot.store(Arc::new(CacheSnapshot {
      official_ranking: official,
      custom_ranking: outcome.ranking,
      maps,
      player_details: outcome.details,
      global_scores,
      last_updated: Some(Utc::now()),
    }));

    Ok(())
  }

  /// Brings the persisted score history of the top official players up to
  /// date.  Players with persisted scores get a bounded "recent" refresh;
  /// new players get a full "top" backfill.  Each player's batch merges in
  /// its own transaction so one failure cannot touch another player's rows.
  async fn sync_global_scores(&self, official: &[Player]) {
    let top_players: Vec<Player> =
      official.iter().take(self.config.top_players).cloned().collect();
    info!("Syncing global score history for top {} players...", top_players.len());

    let semaphore = Arc::new(Semaphore::new(self.config.player_fetch_workers));
    let mut handles = Vec::with_capacity(top_players.len());
    for player in top_players {
      let client = self.client.clone();
      let semaphore = Arc::clone(&semaphore);
      let recent_pages = self.config.recent_pages;
      handles.push(tokio::spawn(async move {
        let _permit = semaphore.acquire().await.expect("player sync semaphore closed");
        sync_player_scores(&client, &player, recent_pages).await;
      }));
    }

    for handle in handles {
      if let Err(err) = handle.await {
        error!("Player score sync task panicked: {err}");
      }
    }
  }

  /// Resolves a player profile against the published snapshot, falling back
  /// to a direct upstream lookup for players outside the official list.
  /// Returns `None` only when the player does not exist upstream either.
  pub async fn get_player_detail(&self, player_id: &str) -> Option<PlayerProfile> {
    let snapshot = self.snapshot.load_full();

    let official = match snapshot.official_ranking.iter().find(|p| p.id == player_id) {
      Some(player) => player.clone(),
      None => Player::from(&self.client.fetch_player_full(player_id).await?),
    };

    let custom = snapshot.custom_ranking.iter().find(|entry| entry.id == player_id);
    let detail = snapshot.player_details.get(player_id);

    Some(PlayerProfile {
      id: official.id.clone(),
      name: official.name.clone(),
      profile_picture: official.profile_picture.clone(),
      official_rank: official.country_rank,
      official_pp: official.pp,
      custom_rank: custom.map(|entry| entry.pos),
      custom_pp: custom.map(|entry| entry.pp),
      medals: detail.map(|d| d.medals).unwrap_or(0),
      scores: detail.map(|d| d.scores.clone()).unwrap_or_default(),
    })
  }

  /// Stars ranking over curated-map scores only.
  pub fn curated_star_bands(&self) -> Vec<StarBandEntry> {
    let snapshot = self.snapshot.load_full();
    let scores = snapshot
      .player_details
      .values()
      .flat_map(|detail| {
        detail.scores.iter().map(move |score| BandScore {
          player_name: detail.name.clone(),
          player_avatar: detail.profile_picture.clone(),
          pp: score.pp,
          acc: score.acc,
          stars: parse_stars_label(&score.stars).unwrap_or(0.),
          stars_label: score.stars.clone(),
          map_name: score.map_name.clone(),
          diff: score.diff.clone(),
          cover: score.map_cover.clone(),
        })
      })
      .collect();
    build_star_bands(scores)
  }

  /// Stars ranking over every persisted global score.
  pub fn global_star_bands(&self) -> Vec<StarBandEntry> {
    let snapshot = self.snapshot.load_full();
    let mut scores = Vec::new();
    for (player_id, player_scores) in &snapshot.global_scores {
      let (name, avatar) = resolve_identity(&snapshot, player_id);
      for score in player_scores {
        scores.push(BandScore {
          player_name: name.clone(),
          player_avatar: avatar.clone(),
          pp: score.pp,
          acc: score.acc,
          stars: parse_stars_label(&score.stars).unwrap_or(0.),
          stars_label: score.stars.clone(),
          map_name: score.map_name.clone(),
          diff: score.diff.clone(),
          cover: score.map_cover.clone(),
        });
      }
    }
    build_star_bands(scores)
  }
}

/// A player's full profile as served by the read API.
#[derive(Serialize)]
pub struct PlayerProfile {
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  pub official_rank: i32,
  pub official_pp: f64,
  pub custom_rank: Option<usize>,
  pub custom_pp: Option<f64>,
  pub medals: u32,
  pub scores: Vec<MapScore>,
}

fn resolve_identity(snapshot: &CacheSnapshot, player_id: &str) -> (String, String) {
  if let Some(entry) = snapshot.custom_ranking.iter().find(|entry| entry.id == player_id) {
    return (entry.name.clone(), entry.profile_picture.clone());
  }
  if let Some(player) = snapshot.official_ranking.iter().find(|p| p.id == player_id) {
    return (player.name.clone(), player.profile_picture.clone());
  }
  (player_id.to_owned(), String::new())
}

async fn sync_player_scores(client: &ScoreSaberClient, player: &Player, recent_pages: usize) {
  let pool = store::db_pool();

  let known = match store::player_has_scores(pool, &player.id).await {
    Ok(known) => known,
    Err(err) => {
      error!("Failed to check persisted scores for {}: {err}", player.name);
      return;
    },
  };

  let (sort, max_pages) = if known {
    (PlayerScoreSort::Recent, Some(recent_pages))
  } else {
    (PlayerScoreSort::Top, None)
  };
  let rows = client.fetch_player_scores(&player.id, sort, max_pages).await;

  let fetched: Vec<StoredScore> = rows
    .iter()
    .filter(|row| row.score.pp > 0.)
    .map(|row| stored_score_from_row(&player.id, row))
    .collect();
  if fetched.is_empty() {
    return;
  }

  if let Err(err) = store::merge_player_scores(pool, &player.id, &fetched).await {
    http_server::store_merge_batches_failed_total().inc();
    error!(
      "Failed to merge {} scores for {}; batch rolled back: {err}",
      fetched.len(),
      player.name
    );
  }
}

pub(crate) fn stored_score_from_row(player_id: &str, row: &PlayerScoreRow) -> StoredScore {
  let leaderboard = &row.leaderboard;
  let acc = if leaderboard.max_score > 0 {
    row.score.modified_score as f64 / leaderboard.max_score as f64 * 100.
  } else {
    0.
  };

  StoredScore {
    player_id: player_id.to_owned(),
    leaderboard_id: leaderboard.id,
    map_name: leaderboard.song_name.clone(),
    map_cover: leaderboard.cover_image.clone(),
    diff: leaderboard.difficulty.label(),
    stars: format!("{:.2}★", leaderboard.stars),
    acc,
    pp: row.score.pp,
    score: row.score.modified_score,
    map_rank: row.score.rank,
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::scoresaber_api::{LeaderboardDifficulty, PlayerScoreBody, PlayerScoreLeaderboard};

  fn row(pp: f64, modified_score: i64, max_score: i64, stars: f64) -> PlayerScoreRow {
    PlayerScoreRow {
      score: PlayerScoreBody {
        id: 1,
        rank: 4,
        pp,
        weight: 1.,
        modified_score,
        modifiers: String::new(),
        time_set: String::new(),
      },
      leaderboard: PlayerScoreLeaderboard {
        id: 99,
        song_name: "song".to_owned(),
        song_author_name: "artist".to_owned(),
        level_author_name: "mapper".to_owned(),
        cover_image: "cover.png".to_owned(),
        max_score,
        stars,
        ranked: true,
        difficulty: LeaderboardDifficulty {
          difficulty: 9,
          difficulty_raw: String::new(),
        },
      },
    }
  }

  #[test]
  fn history_rows_convert_to_stored_scores() {
    let stored = stored_score_from_row("p1", &row(412.5, 950_000, 1_000_000, 11.3));
    assert_eq!(stored.player_id, "p1");
    assert_eq!(stored.leaderboard_id, 99);
    assert_eq!(stored.diff, "Expert+");
    assert_eq!(stored.stars, "11.30★");
    assert_abs_diff_eq!(stored.acc, 95., epsilon = 1e-9);
    assert_eq!(stored.score, 950_000);
    assert_eq!(stored.map_rank, 4);
  }

  #[test]
  fn zero_max_score_history_rows_get_zero_accuracy() {
    let stored = stored_score_from_row("p1", &row(10., 950_000, 0, 1.));
    assert_eq!(stored.acc, 0.);
  }
}
