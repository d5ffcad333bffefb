// Records emitted by the scanner, one JSON object per line

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScanEvent {
    /// Total work units, for progress only
    Itemcount { count: u64 },
    Folder {
        path: String,
        #[serde(default)]
        mtime: Option<i64>,
    },
    Tags(TrackTags),
    Image(ImageTags),
    Playlist { path: String },
    Dud,
    Compilation,
    #[serde(other)]
    Unknown,
}

/// Metadata of one file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackTags {
    pub path: String,
    #[serde(rename = "uniqueid")]
    pub unique_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub composer: String,
    pub year: Option<i32>,
    #[serde(rename = "track")]
    pub track_number: Option<i64>,
    #[serde(rename = "discnumber")]
    pub disc_number: Option<i64>,
    pub comment: String,
    pub bpm: Option<f64>,
    pub bitrate: Option<i64>,
    pub length: Option<i64>,
    pub samplerate: Option<i64>,
    pub filesize: Option<i64>,
    pub filetype: Option<String>,
    /// File modification time, Unix seconds
    pub mtime: Option<i64>,
    #[serde(rename = "albumgain")]
    pub album_gain: Option<f64>,
    #[serde(rename = "albumpeakgain")]
    pub album_peak_gain: Option<f64>,
    #[serde(rename = "trackgain")]
    pub track_gain: Option<f64>,
    #[serde(rename = "trackpeakgain")]
    pub track_peak_gain: Option<f64>,
}

/// A cover image and the (artist, album) pairs it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageTags {
    pub path: String,
    #[serde(rename = "list", default)]
    pub albums: Vec<(String, String)>,
}
