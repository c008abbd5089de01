//! Folds per-map country scores into the custom weighted ranking, per-player
//! details with medal totals, and the best-score-per-star-band views.
//!
//! Everything here is pure over already-fetched rows; the refresh cycle owns
//! all I/O.

use std::cmp::Reverse;

use float_ord::FloatOrd;
use fxhash::FxHashMap;
use serde::Serialize;

use crate::{
  pp::{compute_pp, weighted_total, WEIGHT_COEFFICIENT},
  scoresaber_api::{LeaderboardScore, PlayerResponse},
  store::RankedMap,
};

/// Medal points awarded per map placement.
pub const MEDAL_TABLE: [(u32, u32); 8] =
  [(1, 10), (2, 8), (3, 6), (4, 5), (5, 4), (6, 3), (7, 2), (8, 1)];

/// Width of one star band in the stars ranking.
pub const STAR_BAND_WIDTH: f64 = 0.5;

pub fn medal_points(placement: u32) -> u32 {
  match placement {
    1 => 10,
    2 => 8,
    3 => 6,
    4 => 5,
    5 => 4,
    6 => 3,
    7 => 2,
    8..=10 => 1,
    _ => 0,
  }
}

/// Official player identity as replaced wholesale each refresh cycle.
#[derive(Clone, Serialize)]
pub struct Player {
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  pub country_rank: i32,
  pub pp: f64,
  #[serde(skip)]
  pub ranked_play_count: u32,
}

impl From<&PlayerResponse> for Player {
  fn from(res: &PlayerResponse) -> Self {
    Player {
      id: res.id.clone(),
      name: res.name.clone(),
      profile_picture: res.profile_picture.clone(),
      country_rank: res.country_rank,
      pp: res.pp,
      ranked_play_count: res
        .score_stats
        .as_ref()
        .map(|stats| stats.ranked_play_count)
        .unwrap_or(0),
    }
  }
}

/// One row of the custom ranking.  Position is 1-based; ties keep first-seen
/// order.
#[derive(Clone, Serialize)]
pub struct RankingEntry {
  pub pos: usize,
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  pub pp: f64,
  pub play_count: usize,
}

/// A player's processed score on one curated map.
#[derive(Clone, Serialize)]
pub struct MapScore {
  pub leaderboard_id: i64,
  pub map_name: String,
  pub map_cover: String,
  pub diff: String,
  pub stars: String,
  pub acc: f64,
  pub pp: f64,
  pub score: i64,
  /// 1-based placement among this map's counted country scores.
  pub map_rank: u32,
  /// PP discounted by this score's position in the player's own PP-sorted
  /// list; display-only.
  pub weighted_pp: f64,
}

#[derive(Clone, Serialize)]
pub struct PlayerDetail {
  pub id: String,
  pub name: String,
  pub profile_picture: String,
  /// Sorted PP-descending.
  pub scores: Vec<MapScore>,
  pub medals: u32,
}

pub struct RankingOutcome {
  pub ranking: Vec<RankingEntry>,
  /// Keyed by player id.
  pub details: FxHashMap<String, PlayerDetail>,
}

/// Folds country-filtered per-map scores into the custom ranking and the
/// per-player detail index.
///
/// PP lists aggregate by display name to match upstream identity resolution
/// at aggregation time; the first-seen identity metadata wins for a name.
/// "No fail" scores do not count.  Maps with a zero max score produce zero
/// accuracy rather than dividing by it.
pub fn build_ranking(
  maps: &[RankedMap],
  scores_by_map: &FxHashMap<i64, Vec<LeaderboardScore>>,
) -> RankingOutcome {
  let mut player_pps: FxHashMap<String, Vec<f64>> = FxHashMap::default();
  let mut player_infos: FxHashMap<String, (String, String)> = FxHashMap::default();
  let mut name_order: Vec<String> = Vec::new();
  let mut details: FxHashMap<String, PlayerDetail> = FxHashMap::default();

  for map in maps {
    let Some(scores) = scores_by_map.get(&map.leaderboard_id) else {
      continue;
    };

    let mut placement = 0u32;
    for score in scores {
      if score.has_modifier("NF") {
        continue;
      }
      placement += 1;

      let accuracy = if map.max_score > 0 {
        score.modified_score as f64 / map.max_score as f64 * 100.
      } else {
        0.
      };
      let pp = compute_pp(map.stars, accuracy);

      let player = &score.leaderboard_player_info;
      player_pps
        .entry(player.name.clone())
        .or_insert_with(|| {
          name_order.push(player.name.clone());
          Vec::new()
        })
        .push(pp);
      player_infos
        .entry(player.name.clone())
        .or_insert_with(|| (player.id.clone(), player.profile_picture.clone()));

      let detail = details.entry(player.id.clone()).or_insert_with(|| PlayerDetail {
        id: player.id.clone(),
        name: player.name.clone(),
        profile_picture: player.profile_picture.clone(),
        scores: Vec::new(),
        medals: 0,
      });
      detail.medals += medal_points(placement);
      detail.scores.push(MapScore {
        leaderboard_id: map.leaderboard_id,
        map_name: map.map_name.clone(),
        map_cover: map.cover_image.clone(),
        diff: map.diff_label(),
        stars: map.stars_label(),
        acc: (accuracy * 100.).round() / 100.,
        pp,
        score: score.modified_score,
        map_rank: placement,
        weighted_pp: pp,
      });
    }
  }

  for detail in details.values_mut() {
    detail.scores.sort_unstable_by_key(|s| Reverse(FloatOrd(s.pp)));
    for (ix, score) in detail.scores.iter_mut().enumerate() {
      score.weighted_pp = score.pp * WEIGHT_COEFFICIENT.powi(ix as i32);
    }
  }

  let mut ranking: Vec<RankingEntry> = name_order
    .into_iter()
    .map(|name| {
      let pps = player_pps.get_mut(&name).unwrap();
      pps.sort_unstable_by_key(|&pp| Reverse(FloatOrd(pp)));
      let total_pp = weighted_total(pps, 0);
      let (id, profile_picture) = player_infos.remove(&name).unwrap();
      RankingEntry {
        pos: 0,
        id,
        name,
        profile_picture,
        pp: total_pp,
        play_count: pps.len(),
      }
    })
    .collect();

  // Stable sort keeps first-seen order for equal totals.
  ranking.sort_by_key(|entry| Reverse(FloatOrd(entry.pp)));
  for (ix, entry) in ranking.iter_mut().enumerate() {
    entry.pos = ix + 1;
  }

  RankingOutcome { ranking, details }
}

/// One flattened score considered for the stars ranking.
#[derive(Clone, Serialize)]
pub struct BandScore {
  pub player_name: String,
  pub player_avatar: String,
  pub pp: f64,
  pub acc: f64,
  pub stars: f64,
  pub stars_label: String,
  pub map_name: String,
  pub diff: String,
  pub cover: String,
}

#[derive(Clone, Serialize)]
pub struct StarBandEntry {
  /// E.g. "7.50-8.00".
  pub range: String,
  pub score: BandScore,
}

/// Keeps the highest-PP score inside each 0.5-star band, ordered by band.
/// Zero-star scores carry no band and are skipped.
pub fn build_star_bands(scores: Vec<BandScore>) -> Vec<StarBandEntry> {
  let mut best_by_band: FxHashMap<i64, BandScore> = FxHashMap::default();

  for score in scores {
    if score.stars == 0. {
      continue;
    }
    let band = (score.stars / STAR_BAND_WIDTH).floor() as i64;
    match best_by_band.get(&band) {
      Some(best) if best.pp >= score.pp => (),
      _ => {
        best_by_band.insert(band, score);
      },
    }
  }

  let mut bands: Vec<(i64, BandScore)> = best_by_band.into_iter().collect();
  bands.sort_unstable_by_key(|(band, _)| *band);
  bands
    .into_iter()
    .map(|(band, score)| {
      let start = band as f64 * STAR_BAND_WIDTH;
      StarBandEntry {
        range: format!("{:.2}-{:.2}", start, start + STAR_BAND_WIDTH),
        score,
      }
    })
    .collect()
}

/// Parses a persisted star display string like "8.00★" back to its numeric
/// value.
pub fn parse_stars_label(label: &str) -> Option<f64> {
  label.trim_end_matches('★').parse().ok()
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::scoresaber_api::LeaderboardPlayerInfo;

  fn map(leaderboard_id: i64, stars: f64, max_score: i64) -> RankedMap {
    RankedMap {
      leaderboard_id,
      map_id: format!("bsr{leaderboard_id}"),
      map_name: format!("map {leaderboard_id}"),
      map_author: "author".to_owned(),
      difficulty: "ExpertPlus".to_owned(),
      stars,
      max_score,
      cover_image: String::new(),
    }
  }

  fn score(name: &str, id: &str, modified_score: i64, modifiers: &str) -> LeaderboardScore {
    LeaderboardScore {
      rank: 0,
      base_score: modified_score,
      modified_score,
      modifiers: modifiers.to_owned(),
      time_set: String::new(),
      leaderboard_player_info: LeaderboardPlayerInfo {
        id: id.to_owned(),
        name: name.to_owned(),
        profile_picture: format!("{id}.png"),
        country: Some("BR".to_owned()),
      },
    }
  }

  #[test]
  fn medal_table_matches_placements() {
    for (placement, points) in MEDAL_TABLE {
      assert_eq!(medal_points(placement), points);
    }
    assert_eq!(medal_points(9), 1);
    assert_eq!(medal_points(10), 1);
    assert_eq!(medal_points(11), 0);
    assert_eq!(medal_points(200), 0);
  }

  #[test]
  fn two_firsts_and_a_twelfth_earn_twenty_medal_points() {
    let maps = vec![map(1, 5., 100_000), map(2, 6., 100_000), map(3, 7., 100_000)];
    let mut scores_by_map = FxHashMap::default();
    // First on maps 1 and 2.
    scores_by_map.insert(1, vec![score("alice", "a1", 95_000, "")]);
    scores_by_map.insert(2, vec![score("alice", "a1", 95_000, "")]);
    // Twelfth on map 3.
    let mut third_map = Vec::new();
    for ix in 0..11i64 {
      third_map.push(score(&format!("filler{ix}"), &format!("f{ix}"), 96_000 - ix, ""));
    }
    third_map.push(score("alice", "a1", 80_000, ""));
    scores_by_map.insert(3, third_map);

    let outcome = build_ranking(&maps, &scores_by_map);
    assert_eq!(outcome.details["a1"].medals, 20);
  }

  #[test]
  fn aggregates_by_display_name_and_ranks_by_weighted_total() {
    let maps = vec![map(1, 8., 1_000_000), map(2, 4., 1_000_000)];
    let mut scores_by_map = FxHashMap::default();
    scores_by_map.insert(1, vec![
      score("alice", "a1", 950_000, ""),
      score("bob", "b1", 900_000, ""),
    ]);
    scores_by_map.insert(2, vec![
      score("bob", "b1", 950_000, ""),
      score("alice", "a1", 900_000, ""),
    ]);

    let outcome = build_ranking(&maps, &scores_by_map);
    assert_eq!(outcome.ranking.len(), 2);

    let first = &outcome.ranking[0];
    let second = &outcome.ranking[1];
    assert_eq!(first.pos, 1);
    assert_eq!(first.name, "alice");
    assert_eq!(first.play_count, 2);
    assert_eq!(second.pos, 2);
    assert_eq!(second.name, "bob");

    // alice: 95% on 8★ plus 90% on 4★, the second discounted once.
    let expected = compute_pp(8., 95.) + compute_pp(4., 90.) * WEIGHT_COEFFICIENT;
    assert_abs_diff_eq!(first.pp, expected, epsilon = 1e-9);
  }

  #[test]
  fn no_fail_scores_do_not_count_or_consume_placements() {
    let maps = vec![map(1, 8., 1_000_000)];
    let mut scores_by_map = FxHashMap::default();
    scores_by_map.insert(1, vec![
      score("quitter", "q1", 990_000, "NF"),
      score("alice", "a1", 950_000, "DA"),
    ]);

    let outcome = build_ranking(&maps, &scores_by_map);
    assert_eq!(outcome.ranking.len(), 1);
    assert_eq!(outcome.ranking[0].name, "alice");
    // alice moves up to first place once the NF score is discarded.
    assert_eq!(outcome.details["a1"].medals, 10);
    assert_eq!(outcome.details["a1"].scores[0].map_rank, 1);
    assert!(!outcome.details.contains_key("q1"));
  }

  #[test]
  fn zero_max_score_yields_zero_accuracy() {
    let maps = vec![map(1, 8., 0)];
    let mut scores_by_map = FxHashMap::default();
    scores_by_map.insert(1, vec![score("alice", "a1", 950_000, "")]);

    let outcome = build_ranking(&maps, &scores_by_map);
    assert_eq!(outcome.details["a1"].scores[0].acc, 0.);
    assert_eq!(outcome.details["a1"].scores[0].pp, 0.);
  }

  #[test]
  fn details_are_sorted_by_pp_with_positional_weights() {
    let maps = vec![map(1, 4., 1_000_000), map(2, 8., 1_000_000)];
    let mut scores_by_map = FxHashMap::default();
    scores_by_map.insert(1, vec![score("alice", "a1", 950_000, "")]);
    scores_by_map.insert(2, vec![score("alice", "a1", 950_000, "")]);

    let outcome = build_ranking(&maps, &scores_by_map);
    let detail = &outcome.details["a1"];
    assert_eq!(detail.scores.len(), 2);
    // The 8★ score sorts first despite being fetched second.
    assert_eq!(detail.scores[0].leaderboard_id, 2);
    assert_abs_diff_eq!(detail.scores[0].weighted_pp, detail.scores[0].pp, epsilon = 1e-12);
    assert_abs_diff_eq!(
      detail.scores[1].weighted_pp,
      detail.scores[1].pp * WEIGHT_COEFFICIENT,
      epsilon = 1e-12
    );
  }

  #[test]
  fn no_players_produce_an_empty_ranking() {
    let maps = vec![map(1, 8., 1_000_000)];
    let scores_by_map = FxHashMap::default();
    let outcome = build_ranking(&maps, &scores_by_map);
    assert!(outcome.ranking.is_empty());
    assert!(outcome.details.is_empty());
  }

  fn band_score(name: &str, pp: f64, stars: f64) -> BandScore {
    BandScore {
      player_name: name.to_owned(),
      player_avatar: String::new(),
      pp,
      acc: 95.,
      stars,
      stars_label: format!("{stars:.2}★"),
      map_name: "map".to_owned(),
      diff: "Expert+".to_owned(),
      cover: String::new(),
    }
  }

  #[test]
  fn star_bands_keep_the_best_score_per_half_star() {
    let bands = build_star_bands(vec![
      band_score("alice", 120., 7.6),
      band_score("bob", 150., 7.9),
      band_score("carol", 90., 7.2),
      band_score("dave", 80., 0.),
    ]);

    assert_eq!(bands.len(), 2);
    assert_eq!(bands[0].range, "7.00-7.50");
    assert_eq!(bands[0].score.player_name, "carol");
    assert_eq!(bands[1].range, "7.50-8.00");
    assert_eq!(bands[1].score.player_name, "bob");
  }

  #[test]
  fn stars_labels_round_trip() {
    assert_eq!(parse_stars_label("8.00★"), Some(8.));
    assert_eq!(parse_stars_label("12.35★"), Some(12.35));
    assert_eq!(parse_stars_label("?"), None);
  }
}
