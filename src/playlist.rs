//! Builds the installable playlist (bplist JSON) for the curated map catalog.

use fxhash::FxHashMap;
use serde::Serialize;

use crate::{scoresaber_api::ScoreSaberClient, settings::PlaylistSettings, store::RankedMap};

#[derive(Serialize)]
pub struct PlaylistDifficulty {
  pub characteristic: String,
  pub name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSong {
  pub song_name: String,
  pub level_author_name: String,
  pub hash: String,
  pub levelid: String,
  pub difficulties: Vec<PlaylistDifficulty>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistCustomData {
  pub sync_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
  pub playlist_title: String,
  pub playlist_author: String,
  pub custom_data: PlaylistCustomData,
  pub songs: Vec<PlaylistSong>,
  pub image: String,
}

/// In-game difficulty identifier: no spaces, "Expert+" spelled out.
fn playlist_diff_name(difficulty: &str) -> String {
  let name = difficulty.replace(' ', "");
  if name == "Expert+" {
    return "ExpertPlus".to_owned();
  }
  name
}

/// Assembles the playlist from the catalog and the song hashes already
/// resolved per BeatSaver key.  Maps whose hash could not be resolved are
/// left out.  One song entry is emitted per BeatSaver key, carrying every
/// curated difficulty of that map; the catalog's order decides song order.
pub fn build_playlist(
  maps: &[RankedMap],
  hashes: &FxHashMap<String, String>,
  settings: &PlaylistSettings,
) -> Playlist {
  let mut songs: Vec<PlaylistSong> = Vec::new();
  let mut song_ix_by_map_id: FxHashMap<String, usize> = FxHashMap::default();

  for map in maps {
    let Some(hash) = hashes.get(&map.map_id) else {
      continue;
    };

    let ix = *song_ix_by_map_id.entry(map.map_id.clone()).or_insert_with(|| {
      songs.push(PlaylistSong {
        song_name: map.map_name.clone(),
        level_author_name: map.map_author.clone(),
        hash: hash.clone(),
        levelid: format!("custom_level_{hash}"),
        difficulties: Vec::new(),
      });
      songs.len() - 1
    });
    songs[ix].difficulties.push(PlaylistDifficulty {
      characteristic: "Standard".to_owned(),
      name: playlist_diff_name(&map.diff_label()),
    });
  }

  let sync_url = if settings.base_url.is_empty() {
    String::new()
  } else {
    format!("{}/playlist", settings.base_url.trim_end_matches('/'))
  };

  Playlist {
    playlist_title: settings.title.clone(),
    playlist_author: settings.author.clone(),
    custom_data: PlaylistCustomData { sync_url },
    songs,
    image: String::new(),
  }
}

/// Resolves song hashes for the catalog (one upstream lookup per BeatSaver
/// key) and builds the playlist.  Hash lookup failures skip that map with a
/// log line rather than failing the whole playlist.
pub async fn generate_playlist(
  maps: &[RankedMap],
  client: &ScoreSaberClient,
  settings: &PlaylistSettings,
) -> Playlist {
  let mut hashes: FxHashMap<String, String> = FxHashMap::default();

  for map in maps {
    if hashes.contains_key(&map.map_id) {
      continue;
    }
    match client.fetch_leaderboard_info(map.leaderboard_id).await {
      Some(info) => {
        hashes.insert(map.map_id.clone(), info.song_hash);
      },
      None => {
        error!(
          "Failed to resolve hash for {} ({}); leaving it out of the playlist",
          map.map_name, map.leaderboard_id
        );
      },
    }
  }

  build_playlist(maps, &hashes, settings)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn map(leaderboard_id: i64, map_id: &str, difficulty: &str) -> RankedMap {
    RankedMap {
      leaderboard_id,
      map_id: map_id.to_owned(),
      map_name: format!("map {map_id}"),
      map_author: "mapper".to_owned(),
      difficulty: difficulty.to_owned(),
      stars: 8.,
      max_score: 1_000_000,
      cover_image: String::new(),
    }
  }

  fn settings(base_url: &str) -> PlaylistSettings {
    PlaylistSettings {
      title: "BSBR Ranked Maps".to_owned(),
      author: "BSBR Team".to_owned(),
      base_url: base_url.to_owned(),
    }
  }

  #[test]
  fn difficulties_of_one_map_share_a_song_entry() {
    let maps = vec![
      map(1, "abc1", "Expert"),
      map(2, "abc1", "ExpertPlus"),
      map(3, "def2", "Hard"),
    ];
    let hashes: FxHashMap<String, String> = [
      ("abc1".to_owned(), "HASH1".to_owned()),
      ("def2".to_owned(), "HASH2".to_owned()),
    ]
    .into_iter()
    .collect();

    let playlist = build_playlist(&maps, &hashes, &settings(""));
    assert_eq!(playlist.songs.len(), 2);

    let first = &playlist.songs[0];
    assert_eq!(first.hash, "HASH1");
    assert_eq!(first.levelid, "custom_level_HASH1");
    assert_eq!(first.difficulties.len(), 2);
    assert_eq!(first.difficulties[0].name, "Expert");
    assert_eq!(first.difficulties[1].name, "ExpertPlus");
    assert_eq!(playlist.songs[1].difficulties.len(), 1);
  }

  #[test]
  fn maps_without_resolved_hashes_are_left_out() {
    let maps = vec![map(1, "abc1", "Expert"), map(2, "missing", "Hard")];
    let hashes: FxHashMap<String, String> =
      [("abc1".to_owned(), "HASH1".to_owned())].into_iter().collect();

    let playlist = build_playlist(&maps, &hashes, &settings(""));
    assert_eq!(playlist.songs.len(), 1);
    assert_eq!(playlist.songs[0].hash, "HASH1");
  }

  #[test]
  fn sync_url_comes_from_the_base_url() {
    let playlist = build_playlist(&[], &FxHashMap::default(), &settings("https://bsbr.example/"));
    assert_eq!(playlist.custom_data.sync_url, "https://bsbr.example/playlist");

    let playlist = build_playlist(&[], &FxHashMap::default(), &settings(""));
    assert_eq!(playlist.custom_data.sync_url, "");
  }
}
