// Album-artist inference for one directory of tracks

use std::collections::{BTreeSet, HashMap};

use crate::constants::{FEATURING_SEPARATORS, MAX_INFERENCE_GROUP};
use crate::parser::TrackTags;

/// How the album artist of a directory's tracks is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumArtist {
    /// Every track's album artist is its own track artist
    PerTrack,
    /// One album artist for the whole group; None marks a compilation
    Shared(Option<String>),
}

/// Decide the album artist for a group of tracks from the same directory.
pub fn decide(tracks: &[TrackTags]) -> AlbumArtist {
    let artists: BTreeSet<&str> = tracks.iter().map(|t| t.artist.as_str()).collect();
    let albums: BTreeSet<&str> = tracks.iter().map(|t| t.album.as_str()).collect();

    let mixed_albums = albums.len() > 1;
    let no_album = albums.iter().all(|a| a.is_empty());
    let single_artist = artists.len() <= 1;
    let too_large = tracks.len() > MAX_INFERENCE_GROUP;

    if mixed_albums || no_album || single_artist || too_large {
        return AlbumArtist::PerTrack;
    }

    AlbumArtist::Shared(infer_shared_artist(tracks))
}

/// The one primary artist credited on every track, if there is one.
fn infer_shared_artist(tracks: &[TrackTags]) -> Option<String> {
    let mut tally: HashMap<&str, usize> = HashMap::new();
    for track in tracks {
        *tally.entry(primary_artist(&track.artist)).or_insert(0) += 1;
    }

    tally
        .into_iter()
        .find(|(_, count)| *count == tracks.len())
        .map(|(artist, _)| artist.to_string())
}

/// Strip a "featuring" credit: "A feat. B" -> "A".
///
/// Separators are tried in order and must start a word; matching ignores ASCII case.
pub fn primary_artist(artist: &str) -> &str {
    let lower = artist.to_ascii_lowercase();
    for sep in FEATURING_SEPARATORS {
        let at_word_start = lower.match_indices(sep).map(|(idx, _)| idx).find(|&idx| {
            lower[..idx]
                .chars()
                .next_back()
                .map_or(true, char::is_whitespace)
        });
        if let Some(idx) = at_word_start {
            let head = artist[..idx].trim();
            if !head.is_empty() {
                return head;
            }
        }
    }
    artist.trim()
}
