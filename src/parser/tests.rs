use super::*;

/// Records everything the parser hands over.
#[derive(Default)]
struct RecordingSink {
    total: Option<u64>,
    directories: Vec<(String, Option<i64>)>,
    groups: Vec<Vec<String>>,
    images: Vec<Vec<String>>,
    playlists: Vec<String>,
    progress: u64,
}

impl ScanResultSink for RecordingSink {
    fn item_count(&mut self, count: u64) {
        self.total = Some(count);
    }

    fn add_directory(&mut self, path: &str, mtime: Option<i64>) -> Result<()> {
        self.directories.push((path.to_string(), mtime));
        Ok(())
    }

    fn process_directory(&mut self, tracks: Vec<TrackTags>) -> Result<()> {
        self.groups.push(tracks.into_iter().map(|t| t.path).collect());
        Ok(())
    }

    fn add_images(&mut self, images: Vec<ImageTags>) -> Result<()> {
        self.images.push(images.into_iter().map(|i| i.path).collect());
        Ok(())
    }

    fn playlist(&mut self, path: &str) -> Result<()> {
        self.playlists.push(path.to_string());
        Ok(())
    }

    fn progress(&mut self) {
        self.progress += 1;
    }
}

fn tags_line(path: &str) -> String {
    format!(r#"{{"type":"tags","path":"{}","artist":"A","album":"X","uniqueid":"uid-{}"}}"#, path, path)
}

fn stream(lines: &[String]) -> Vec<u8> {
    let mut out = lines.join("\n");
    out.push('\n');
    out.into_bytes()
}

#[test]
fn test_decodes_all_record_types() {
    let input = concat!(
        r#"{"type":"itemcount","count":3}"#, "\n",
        r#"{"type":"folder","path":"/m/a","mtime":100}"#, "\n",
        r#"{"type":"tags","path":"/m/a/1.mp3","title":"One","track":1,"bitrate":320,"trackgain":-6.5,"year":1999,"uniqueid":"u1"}"#, "\n",
        r#"{"type":"image","path":"/m/a/cover.jpg","list":[["A","X"]]}"#, "\n",
        r#"{"type":"playlist","path":"/m/a/list.m3u"}"#, "\n",
        r#"{"type":"dud"}"#, "\n",
        r#"{"type":"compilation"}"#, "\n",
    );
    let mut decoder = StreamDecoder::new();
    let events = decoder.push(input.as_bytes()).unwrap();
    assert_eq!(events.len(), 7);
    assert_eq!(events[0], ScanEvent::Itemcount { count: 3 });
    match &events[2] {
        ScanEvent::Tags(t) => {
            assert_eq!(t.title, "One");
            assert_eq!(t.track_number, Some(1));
            assert_eq!(t.bitrate, Some(320));
            assert_eq!(t.track_gain, Some(-6.5));
            assert_eq!(t.year, Some(1999));
            assert_eq!(t.unique_id, "u1");
            assert_eq!(t.samplerate, None, "Absent optional fields stay unset");
        }
        other => panic!("Expected tags, got {:?}", other),
    }
    match &events[3] {
        ScanEvent::Image(i) => assert_eq!(i.albums, vec![("A".to_string(), "X".to_string())]),
        other => panic!("Expected image, got {:?}", other),
    }
    assert_eq!(events[5], ScanEvent::Dud);
    assert_eq!(decoder.pending_bytes(), 0);
}

#[test]
fn test_partial_lines_wait_for_more_data() {
    let line = tags_line("/m/a/1.mp3");
    let bytes = format!("{}\n", line).into_bytes();
    let (head, tail) = bytes.split_at(10);

    let mut decoder = StreamDecoder::new();
    assert!(decoder.push(head).unwrap().is_empty());
    assert_eq!(decoder.pending_bytes(), 10);
    let events = decoder.push(tail).unwrap();
    assert_eq!(events.len(), 1);
}

#[test]
fn test_malformed_line_is_fatal() {
    let mut decoder = StreamDecoder::new();
    let result = decoder.push(b"{\"type\":\"folder\",\"path\":}\n");
    assert!(matches!(result, Err(CollectionError::StreamDecode(_))));
}

#[test]
fn test_truncated_line_is_skipped() {
    let mut decoder = StreamDecoder::new();
    let events = decoder
        .push(b"{\"type\":\"folder\",\"path\":\"/m\n{\"type\":\"dud\"}\n")
        .unwrap();
    assert_eq!(events, vec![ScanEvent::Dud]);
}

#[test]
fn test_unknown_record_is_tolerated() {
    let mut decoder = StreamDecoder::new();
    let events = decoder.push(b"{\"type\":\"lyrics\",\"path\":\"/m/a.lrc\"}\n\n").unwrap();
    assert_eq!(events, vec![ScanEvent::Unknown]);
}

#[test]
fn test_finish_rejects_dangling_record() {
    let mut decoder = StreamDecoder::new();
    decoder.push(b"{\"type\":\"dud\"").unwrap();
    assert!(decoder.finish().is_err());

    let mut decoder = StreamDecoder::new();
    decoder.push(b"{\"type\":\"dud\"}").unwrap();
    assert_eq!(decoder.finish().unwrap(), Some(ScanEvent::Dud));
}

#[test]
fn test_groups_consecutive_tracks_by_directory() {
    let input = stream(&[
        tags_line("/m/a/1.mp3"),
        tags_line("/m/a/2.mp3"),
        tags_line("/m/b/1.mp3"),
        tags_line("/m/a/3.mp3"),
    ]);
    let mut parser = ScanParser::new();
    let mut sink = RecordingSink::default();
    parser.feed(&input, &mut sink).unwrap();

    // The last group is still open
    assert_eq!(sink.groups.len(), 2);
    parser.finish(&mut sink).unwrap();

    assert_eq!(
        sink.groups,
        vec![
            vec!["/m/a/1.mp3".to_string(), "/m/a/2.mp3".to_string()],
            vec!["/m/b/1.mp3".to_string()],
            vec!["/m/a/3.mp3".to_string()],
        ]
    );
    assert_eq!(sink.progress, 4);
}

#[test]
fn test_images_flush_on_marker_and_at_end() {
    let input = concat!(
        r#"{"type":"image","path":"/m/a/cover.jpg","list":[["A","X"]]}"#, "\n",
        r#"{"type":"image","path":"/m/a/empty.jpg","list":[]}"#, "\n",
        r#"{"type":"compilation"}"#, "\n",
        r#"{"type":"image","path":"/m/b/cover.jpg","list":[["B","Y"]]}"#, "\n",
    );
    let mut parser = ScanParser::new();
    let mut sink = RecordingSink::default();
    parser.feed(input.as_bytes(), &mut sink).unwrap();
    assert_eq!(sink.images, vec![vec!["/m/a/cover.jpg".to_string()]]);

    parser.finish(&mut sink).unwrap();
    assert_eq!(sink.images.len(), 2);
    assert_eq!(sink.images[1], vec!["/m/b/cover.jpg".to_string()]);
}

#[test]
fn test_restart_discards_interrupted_record() {
    let first = tags_line("/m/a/1.mp3");
    let second = tags_line("/m/a/2.mp3");

    let mut parser = ScanParser::new();
    let mut sink = RecordingSink::default();

    // Scanner dies halfway through the second record
    let crashed = format!("{}\n{}", first, &second[..20]);
    parser.feed(crashed.as_bytes(), &mut sink).unwrap();
    parser.reset_decoder();

    // The resumed scanner emits the record again from the start
    parser.feed(format!("{}\n", second).as_bytes(), &mut sink).unwrap();
    parser.finish(&mut sink).unwrap();

    assert_eq!(
        sink.groups,
        vec![vec!["/m/a/1.mp3".to_string(), "/m/a/2.mp3".to_string()]]
    );
}

#[test]
fn test_folders_playlists_and_counts_are_forwarded() {
    let input = concat!(
        r#"{"type":"itemcount","count":12}"#, "\n",
        r#"{"type":"folder","path":"/m/a","mtime":42}"#, "\n",
        r#"{"type":"folder","path":"/m/b"}"#, "\n",
        r#"{"type":"playlist","path":"/m/a/list.m3u"}"#, "\n",
    );
    let mut parser = ScanParser::new();
    let mut sink = RecordingSink::default();
    parser.feed(input.as_bytes(), &mut sink).unwrap();

    assert_eq!(sink.total, Some(12));
    assert_eq!(
        sink.directories,
        vec![("/m/a".to_string(), Some(42)), ("/m/b".to_string(), None)]
    );
    assert_eq!(sink.playlists, vec!["/m/a/list.m3u".to_string()]);
    assert_eq!(parser.event_count(), 4);
}
