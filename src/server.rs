use std::{sync::Arc, time::Duration};

use axum::{
  extract::{Path, Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json, Router,
};
use chrono::{DateTime, Utc};
use foundations::BootstrapResult;
use serde::{Deserialize, Serialize};
use tower_http::{
  cors,
  trace::{DefaultMakeSpan, DefaultOnResponse},
};
use tracing::Level;

use crate::{
  cache::{PlayerProfile, RankingCache},
  metrics::http_server,
  playlist::{self, Playlist},
  ranking::{Player, RankingEntry, StarBandEntry},
  ratelimiter::RateLimiter,
  scoresaber_api::ScoreSaberClient,
  settings::ServerSettings,
  store::RankedMap,
};

#[derive(Debug)]
pub struct APIError {
  pub status: StatusCode,
  pub message: String,
}

impl IntoResponse for APIError {
  fn into_response(self) -> Response { (self.status, self.message).into_response() }
}

async fn index() -> &'static str {
  http_server::requests_total("index").inc();
  http_server::requests_success_total("index").inc();
  "scoresaber-ranking-engine up and running successfully!"
}

/// Envelope for snapshot-backed list responses.  Staleness is visible, never
/// an error: readers always get the last successfully published snapshot.
#[derive(Serialize)]
struct SnapshotResponse<T> {
  last_updated: Option<DateTime<Utc>>,
  is_refreshing: bool,
  entries: Vec<T>,
}

async fn get_official_ranking(
  State(cache): State<Arc<RankingCache>>,
) -> Json<SnapshotResponse<Player>> {
  let endpoint_name = "get_official_ranking";
  http_server::requests_total(endpoint_name).inc();
  let snapshot = cache.snapshot();
  http_server::requests_success_total(endpoint_name).inc();
  Json(SnapshotResponse {
    last_updated: snapshot.last_updated,
    is_refreshing: cache.is_refreshing(),
    entries: snapshot.official_ranking.clone(),
  })
}

async fn get_custom_ranking(
  State(cache): State<Arc<RankingCache>>,
) -> Json<SnapshotResponse<RankingEntry>> {
  let endpoint_name = "get_custom_ranking";
  http_server::requests_total(endpoint_name).inc();
  let snapshot = cache.snapshot();
  http_server::requests_success_total(endpoint_name).inc();
  Json(SnapshotResponse {
    last_updated: snapshot.last_updated,
    is_refreshing: cache.is_refreshing(),
    entries: snapshot.custom_ranking.clone(),
  })
}

async fn get_maps(State(cache): State<Arc<RankingCache>>) -> Json<SnapshotResponse<RankedMap>> {
  let endpoint_name = "get_maps";
  http_server::requests_total(endpoint_name).inc();
  let snapshot = cache.snapshot();
  http_server::requests_success_total(endpoint_name).inc();
  Json(SnapshotResponse {
    last_updated: snapshot.last_updated,
    is_refreshing: cache.is_refreshing(),
    entries: snapshot.maps.clone(),
  })
}

async fn get_player(
  State(cache): State<Arc<RankingCache>>,
  Path(player_id): Path<String>,
) -> Result<Json<PlayerProfile>, APIError> {
  let endpoint_name = "get_player";
  http_server::requests_total(endpoint_name).inc();

  match cache.get_player_detail(&player_id).await {
    Some(profile) => {
      http_server::requests_success_total(endpoint_name).inc();
      Ok(Json(profile))
    },
    None => {
      http_server::requests_failed_total(endpoint_name).inc();
      Err(APIError {
        status: StatusCode::NOT_FOUND,
        message: format!("Player {player_id} not found"),
      })
    },
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum StarsScope {
  Curated,
  Global,
}

#[derive(Deserialize)]
struct StarsQueryParams {
  scope: Option<StarsScope>,
}

async fn get_stars_ranking(
  State(cache): State<Arc<RankingCache>>,
  Query(params): Query<StarsQueryParams>,
) -> Json<SnapshotResponse<StarBandEntry>> {
  let endpoint_name = "get_stars_ranking";
  http_server::requests_total(endpoint_name).inc();
  let snapshot = cache.snapshot();
  let entries = match params.scope.unwrap_or(StarsScope::Curated) {
    StarsScope::Curated => cache.curated_star_bands(),
    StarsScope::Global => cache.global_star_bands(),
  };
  http_server::requests_success_total(endpoint_name).inc();
  Json(SnapshotResponse {
    last_updated: snapshot.last_updated,
    is_refreshing: cache.is_refreshing(),
    entries,
  })
}

async fn get_playlist(State(cache): State<Arc<RankingCache>>) -> Json<Playlist> {
  let endpoint_name = "get_playlist";
  http_server::requests_total(endpoint_name).inc();
  let snapshot = cache.snapshot();
  let playlist_settings = PLAYLIST_SETTINGS.load_full();
  let playlist =
    playlist::generate_playlist(&snapshot.maps, cache.client(), &playlist_settings).await;
  http_server::requests_success_total(endpoint_name).inc();
  Json(playlist)
}

lazy_static::lazy_static! {
  static ref PLAYLIST_SETTINGS: arc_swap::ArcSwap<crate::settings::PlaylistSettings> =
    arc_swap::ArcSwap::new(Arc::new(Default::default()));
}

pub async fn start_server(settings: &ServerSettings) -> BootstrapResult<()> {
  crate::store::init_db_pool(&settings.sql.db_url).await?;

  PLAYLIST_SETTINGS.store(Arc::new(settings.playlist.clone()));

  let limiter = Arc::new(RateLimiter::new(
    settings.rate_limit.max_calls,
    Duration::from_secs(settings.rate_limit.period_secs),
  ));
  let client = ScoreSaberClient::new(limiter, settings.refresh.page_fetch_workers);
  let cache = Arc::new(RankingCache::new(client, settings));
  cache.start();

  let router = Router::new()
    .route("/", axum::routing::get(index))
    .route("/rankings/official", axum::routing::get(get_official_ranking))
    .route("/rankings/custom", axum::routing::get(get_custom_ranking))
    .route("/rankings/stars", axum::routing::get(get_stars_ranking))
    .route("/maps", axum::routing::get(get_maps))
    .route("/players/{player_id}", axum::routing::get(get_player))
    .route("/playlist", axum::routing::get(get_playlist))
    .with_state(Arc::clone(&cache))
    .layer(
      tower_http::cors::CorsLayer::new()
        .allow_origin(cors::Any)
        .allow_headers(cors::Any)
        .allow_methods(cors::Any),
    )
    .layer(
      tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::default().level(Level::INFO)),
    );

  let addr = format!("0.0.0.0:{}", settings.port);
  info!("Server is listening on http://{}", addr);
  let listener = tokio::net::TcpListener::bind(addr).await?;
  axum::serve(listener, router).await?;
  Ok(())
}
