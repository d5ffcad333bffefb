// Streaming scanner-output parser
//
// Bytes arrive in arbitrary chunks. Complete lines are decoded as they appear,
// track records are grouped by parent directory, and each finished group is
// handed to the sink as one batch.

pub mod event;

use std::path::Path;

pub use event::{ImageTags, ScanEvent, TrackTags};

use crate::error::{CollectionError, Result};

/// Receives decoded scan results in emission order.
pub trait ScanResultSink {
    fn item_count(&mut self, count: u64);
    fn add_directory(&mut self, path: &str, mtime: Option<i64>) -> Result<()>;
    /// All consecutive tracks of one directory.
    fn process_directory(&mut self, tracks: Vec<TrackTags>) -> Result<()>;
    fn add_images(&mut self, images: Vec<ImageTags>) -> Result<()>;
    fn playlist(&mut self, path: &str) -> Result<()>;
    /// One work unit finished.
    fn progress(&mut self) {}
}

/// Line-oriented JSON decoder that keeps an incomplete trailing line buffered.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    line_no: u64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and decode every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<ScanEvent>> {
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            self.line_no += 1;
            if let Some(event) = decode_line(&self.buf[start..end], self.line_no)? {
                events.push(event);
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        Ok(events)
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Result<Option<ScanEvent>> {
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        self.line_no += 1;
        match serde_json::from_slice::<ScanEvent>(&rest) {
            Ok(event) => Ok(Some(event)),
            Err(e) => Err(CollectionError::StreamDecode(format!(
                "stream ended mid-record at line {}: {}",
                self.line_no, e
            ))),
        }
    }

    /// Discard a partial line. Returns how many bytes were dropped.
    pub fn reset(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }

    #[cfg(test)]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(line: &[u8], line_no: u64) -> Result<Option<ScanEvent>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice::<ScanEvent>(line) {
        Ok(event) => Ok(Some(event)),
        Err(e) if e.is_eof() => {
            log::warn!("Skipping truncated scanner record at line {}: {}", line_no, e);
            Ok(None)
        }
        Err(e) => Err(CollectionError::StreamDecode(format!("line {}: {}", line_no, e))),
    }
}

/// Parent directory of a track path, as used for grouping.
pub fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Decoder plus directory grouping and image batching for one scan.
#[derive(Debug, Default)]
pub struct ScanParser {
    decoder: StreamDecoder,
    group_dir: Option<String>,
    group: Vec<TrackTags>,
    images: Vec<ImageTags>,
    events: u64,
}

impl ScanParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records handled so far.
    pub fn event_count(&self) -> u64 {
        self.events
    }

    pub fn feed(&mut self, bytes: &[u8], sink: &mut dyn ScanResultSink) -> Result<()> {
        for event in self.decoder.push(bytes)? {
            self.handle(event, sink)?;
        }
        Ok(())
    }

    /// Forget a record cut off by a crashed scanner; the restarted one begins on a fresh line.
    pub fn reset_decoder(&mut self) {
        let dropped = self.decoder.reset();
        if dropped > 0 {
            log::debug!("Discarded {} bytes of an interrupted scanner record", dropped);
        }
    }

    /// End of stream: decode the tail and flush the trailing group and images.
    pub fn finish(&mut self, sink: &mut dyn ScanResultSink) -> Result<()> {
        if let Some(event) = self.decoder.finish()? {
            self.handle(event, sink)?;
        }
        self.flush_group(sink)?;
        self.flush_images(sink)
    }

    fn handle(&mut self, event: ScanEvent, sink: &mut dyn ScanResultSink) -> Result<()> {
        self.events += 1;
        match event {
            ScanEvent::Itemcount { count } => sink.item_count(count),
            ScanEvent::Folder { path, mtime } => sink.add_directory(&path, mtime)?,
            ScanEvent::Tags(tags) => {
                let dir = parent_dir(&tags.path);
                if self.group_dir.as_deref() != Some(dir.as_str()) {
                    self.flush_group(sink)?;
                    self.group_dir = Some(dir);
                }
                self.group.push(tags);
                sink.progress();
            }
            ScanEvent::Image(image) => {
                if image.albums.is_empty() {
                    log::debug!("Ignoring image without albums: {}", image.path);
                } else {
                    self.images.push(image);
                }
            }
            ScanEvent::Playlist { path } => {
                sink.playlist(&path)?;
                sink.progress();
            }
            ScanEvent::Dud => {
                self.flush_images(sink)?;
                sink.progress();
            }
            ScanEvent::Compilation => self.flush_images(sink)?,
            ScanEvent::Unknown => log::warn!("Ignoring unknown scanner record"),
        }
        Ok(())
    }

    fn flush_group(&mut self, sink: &mut dyn ScanResultSink) -> Result<()> {
        self.group_dir = None;
        if self.group.is_empty() {
            return Ok(());
        }
        sink.process_directory(std::mem::take(&mut self.group))
    }

    fn flush_images(&mut self, sink: &mut dyn ScanResultSink) -> Result<()> {
        if self.images.is_empty() {
            return Ok(());
        }
        sink.add_images(std::mem::take(&mut self.images))
    }
}

#[cfg(test)]
mod tests;
