use std::cmp::Reverse;

use float_ord::FloatOrd;
use foundations::BootstrapResult;
use fxhash::FxHashMap;
use serde::Serialize;
use sqlx::{Executor, MySql, MySqlPool, QueryBuilder};
use tokio::sync::OnceCell;

use crate::metrics::http_server;

static DB_POOL: OnceCell<MySqlPool> = OnceCell::const_new();

pub(crate) async fn init_db_pool(db_url: &str) -> BootstrapResult<()> {
  let pool = MySqlPool::connect(db_url).await?;
  DB_POOL.set(pool).unwrap();
  Ok(())
}

pub(crate) fn db_pool() -> &'static MySqlPool { DB_POOL.get().expect("DB pool not initialized") }

// CREATE TABLE ranked_maps (
//   leaderboard_id BIGINT NOT NULL PRIMARY KEY,
//   map_id VARCHAR(31) NOT NULL,
//   map_name VARCHAR(255) NOT NULL,
//   map_author VARCHAR(255) NOT NULL,
//   difficulty VARCHAR(31) NOT NULL,
//   stars DOUBLE NOT NULL,
//   max_score BIGINT NOT NULL,
//   cover_image VARCHAR(511) NOT NULL
// );
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct RankedMap {
  pub leaderboard_id: i64,
  /// BeatSaver key; several difficulties of one map share it.
  pub map_id: String,
  pub map_name: String,
  pub map_author: String,
  pub difficulty: String,
  pub stars: f64,
  pub max_score: i64,
  pub cover_image: String,
}

impl RankedMap {
  /// Difficulty label as displayed, e.g. "Expert+".
  pub fn diff_label(&self) -> String { self.difficulty.replace("Plus", "+") }

  /// Star rating as displayed and as persisted on score rows, e.g. "8.00★".
  pub fn stars_label(&self) -> String { format!("{:.2}★", self.stars) }
}

// CREATE TABLE player_scores (
//   player_id VARCHAR(31) NOT NULL,
//   leaderboard_id BIGINT NOT NULL,
//   map_name VARCHAR(255) NOT NULL,
//   map_cover VARCHAR(511) NOT NULL,
//   diff VARCHAR(31) NOT NULL,
//   stars VARCHAR(15) NOT NULL,
//   acc DOUBLE NOT NULL,
//   pp DOUBLE NOT NULL,
//   score BIGINT NOT NULL,
//   map_rank BIGINT NOT NULL,
//   PRIMARY KEY (player_id, leaderboard_id)
// );
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct StoredScore {
  pub player_id: String,
  pub leaderboard_id: i64,
  pub map_name: String,
  pub map_cover: String,
  pub diff: String,
  /// Star rating display string, e.g. "8.00★".
  pub stars: String,
  pub acc: f64,
  pub pp: f64,
  pub score: i64,
  pub map_rank: i64,
}

pub(crate) async fn load_ranked_maps(pool: &MySqlPool) -> sqlx::Result<Vec<RankedMap>> {
  sqlx::query_as::<_, RankedMap>(
    "SELECT leaderboard_id, map_id, map_name, map_author, difficulty, stars, max_score, \
     cover_image FROM ranked_maps",
  )
  .fetch_all(pool)
  .await
}

pub(crate) async fn player_has_scores(pool: &MySqlPool, player_id: &str) -> sqlx::Result<bool> {
  let count: i64 =
    sqlx::query_scalar("SELECT COUNT(*) FROM player_scores WHERE player_id = ?")
      .bind(player_id)
      .fetch_one(pool)
      .await?;
  Ok(count > 0)
}

/// Loads every persisted score grouped per player, each player's list sorted
/// PP-descending.  This is the in-memory index the published snapshot serves
/// global score queries from.
pub(crate) async fn load_score_index(
  pool: &MySqlPool,
) -> sqlx::Result<FxHashMap<String, Vec<StoredScore>>> {
  let rows = sqlx::query_as::<_, StoredScore>(
    "SELECT player_id, leaderboard_id, map_name, map_cover, diff, stars, acc, pp, score, \
     map_rank FROM player_scores",
  )
  .fetch_all(pool)
  .await?;

  let mut index: FxHashMap<String, Vec<StoredScore>> = FxHashMap::default();
  for row in rows {
    index.entry(row.player_id.clone()).or_default().push(row);
  }
  for scores in index.values_mut() {
    scores.sort_unstable_by_key(|s| Reverse(FloatOrd(s.pp)));
  }

  Ok(index)
}

pub(crate) enum MergeAction {
  Insert(StoredScore),
  Update(StoredScore),
}

/// Decides which fetched rows to write, given the raw scores already stored
/// for this player (`existing`, keyed by leaderboard id).  A new (player,
/// map) pair is inserted; an existing pair is overwritten only when the
/// fetched raw score is strictly greater.  Replaying the same batch over its
/// own result therefore plans nothing, which keeps the merge idempotent.
pub(crate) fn plan_merge(
  existing: &FxHashMap<i64, i64>,
  fetched: &[StoredScore],
) -> Vec<MergeAction> {
  let mut plan = Vec::new();
  let mut staged: FxHashMap<i64, i64> = existing.clone();

  for row in fetched {
    match staged.get(&row.leaderboard_id).copied() {
      None => {
        staged.insert(row.leaderboard_id, row.score);
        plan.push(MergeAction::Insert(row.clone()));
      },
      Some(stored_score) if row.score > stored_score => {
        staged.insert(row.leaderboard_id, row.score);
        plan.push(MergeAction::Update(row.clone()));
      },
      Some(_) => (),
    }
  }

  plan
}

/// Merges one player's fetched score batch into the store inside a single
/// transaction.  A failure rolls back this player's batch only; other
/// players' batches are unaffected.
pub(crate) async fn merge_player_scores(
  pool: &MySqlPool,
  player_id: &str,
  fetched: &[StoredScore],
) -> sqlx::Result<()> {
  let existing_rows: Vec<(i64, i64)> = sqlx::query_as(
    "SELECT leaderboard_id, score FROM player_scores WHERE player_id = ?",
  )
  .bind(player_id)
  .fetch_all(pool)
  .await?;
  let existing: FxHashMap<i64, i64> = existing_rows.into_iter().collect();

  let plan = plan_merge(&existing, fetched);
  if plan.is_empty() {
    return Ok(());
  }

  let mut inserts = Vec::new();
  let mut updates = Vec::new();
  for action in plan {
    match action {
      MergeAction::Insert(row) => inserts.push(row),
      MergeAction::Update(row) => updates.push(row),
    }
  }

  let mut txn = pool.begin().await?;

  for chunk in inserts.chunks(50) {
    let mut qb: QueryBuilder<'_, MySql> = QueryBuilder::new(
      "INSERT INTO player_scores (player_id, leaderboard_id, map_name, map_cover, diff, stars, \
       acc, pp, score, map_rank) ",
    );
    qb.push_values(chunk, |mut b, row| {
      b.push_bind(&row.player_id)
        .push_bind(row.leaderboard_id)
        .push_bind(&row.map_name)
        .push_bind(&row.map_cover)
        .push_bind(&row.diff)
        .push_bind(&row.stars)
        .push_bind(row.acc)
        .push_bind(row.pp)
        .push_bind(row.score)
        .push_bind(row.map_rank);
    });
    let query = qb.build();
    txn.execute(query).await?;
  }

  for row in &updates {
    // The score guard re-checks strict improvement so a concurrent writer
    // cannot regress a better score committed since the plan was computed.
    sqlx::query(
      "UPDATE player_scores SET map_name = ?, map_cover = ?, diff = ?, stars = ?, acc = ?, pp = \
       ?, score = ?, map_rank = ? WHERE player_id = ? AND leaderboard_id = ? AND score < ?",
    )
    .bind(&row.map_name)
    .bind(&row.map_cover)
    .bind(&row.diff)
    .bind(&row.stars)
    .bind(row.acc)
    .bind(row.pp)
    .bind(row.score)
    .bind(row.map_rank)
    .bind(player_id)
    .bind(row.leaderboard_id)
    .bind(row.score)
    .execute(&mut *txn)
    .await?;
  }

  txn.commit().await?;
  http_server::store_merge_batches_total().inc();
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn score(leaderboard_id: i64, raw: i64, pp: f64) -> StoredScore {
    StoredScore {
      player_id: "76561198000000000".to_owned(),
      leaderboard_id,
      map_name: format!("map {leaderboard_id}"),
      map_cover: String::new(),
      diff: "Expert+".to_owned(),
      stars: "8.00★".to_owned(),
      acc: 95.,
      pp,
      score: raw,
      map_rank: 1,
    }
  }

  fn apply(existing: &mut FxHashMap<i64, i64>, plan: &[MergeAction]) {
    for action in plan {
      match action {
        MergeAction::Insert(row) | MergeAction::Update(row) => {
          existing.insert(row.leaderboard_id, row.score);
        },
      }
    }
  }

  #[test]
  fn new_pairs_insert_and_existing_pairs_update_only_on_strict_improvement() {
    let existing: FxHashMap<i64, i64> = [(10, 900_000), (20, 800_000)].into_iter().collect();
    let fetched = vec![
      score(10, 950_000, 340.), // improved
      score(20, 800_000, 300.), // tied, must not overwrite
      score(30, 700_000, 250.), // new pair
    ];

    let plan = plan_merge(&existing, &fetched);
    assert_eq!(plan.len(), 2);
    assert!(matches!(&plan[0], MergeAction::Update(row) if row.leaderboard_id == 10));
    assert!(matches!(&plan[1], MergeAction::Insert(row) if row.leaderboard_id == 30));
  }

  #[test]
  fn replaying_a_batch_is_idempotent() {
    let mut existing: FxHashMap<i64, i64> = [(10, 900_000)].into_iter().collect();
    let fetched = vec![score(10, 950_000, 340.), score(30, 700_000, 250.)];

    let first = plan_merge(&existing, &fetched);
    assert_eq!(first.len(), 2);
    apply(&mut existing, &first);

    let second = plan_merge(&existing, &fetched);
    assert!(second.is_empty());
    assert_eq!(existing[&10], 950_000);
    assert_eq!(existing[&30], 700_000);
  }

  #[test]
  fn duplicate_rows_within_one_batch_keep_the_best_score() {
    let existing = FxHashMap::default();
    let fetched = vec![score(10, 900_000, 330.), score(10, 950_000, 340.), score(10, 920_000, 335.)];

    let plan = plan_merge(&existing, &fetched);
    assert_eq!(plan.len(), 2);
    assert!(matches!(&plan[0], MergeAction::Insert(row) if row.score == 900_000));
    assert!(matches!(&plan[1], MergeAction::Update(row) if row.score == 950_000));
  }

  #[test]
  fn worse_scores_never_touch_the_store() {
    let existing: FxHashMap<i64, i64> = [(10, 950_000)].into_iter().collect();
    let plan = plan_merge(&existing, &[score(10, 900_000, 330.)]);
    assert!(plan.is_empty());
  }
}
