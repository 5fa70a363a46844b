//! Reading and writing M3U, extended M3U and PLS playlist files.

use std::fs;
use std::path::{Path, PathBuf};

use common::uri;

use crate::db::TrackDb;
use crate::playlist::Playlist;
use crate::LibraryError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaylistFormat {
    M3u,
    ExtM3u,
    Pls,
}

impl PlaylistFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "m3u" | "m3u8" => Some(PlaylistFormat::M3u),
            "pls" => Some(PlaylistFormat::Pls),
            _ => None,
        }
    }

    pub fn sniff(contents: &str) -> Option<Self> {
        let first = contents
            .trim_start_matches('\u{feff}')
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())?;
        if first.eq_ignore_ascii_case("#EXTM3U") {
            Some(PlaylistFormat::ExtM3u)
        } else if first.eq_ignore_ascii_case("[playlist]") {
            Some(PlaylistFormat::Pls)
        } else {
            None
        }
    }

    /// Contents win over the extension; a `.m3u` file without a header is
    /// plain M3U.
    pub fn detect(path: &Path, contents: &str) -> Option<Self> {
        Self::sniff(contents).or_else(|| Self::from_extension(path))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaylistEntry {
    pub uri: String,
    pub title: Option<String>,
    /// Seconds; `None` when unknown.
    pub length: Option<f64>,
}

impl PlaylistEntry {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: None,
            length: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaylistFile {
    pub name: String,
    pub entries: Vec<PlaylistEntry>,
}

impl PlaylistFile {
    /// Entries for every item of `playlist`, titled and timed from `db`
    /// where the track is known.
    pub fn from_playlist(playlist: &Playlist, db: &TrackDb) -> Self {
        let entries = playlist
            .uris()
            .iter()
            .map(|uri| match db.get(uri) {
                Some(track) => PlaylistEntry {
                    uri: uri.clone(),
                    title: Some(track.display_name()),
                    length: track.length(),
                },
                None => PlaylistEntry::new(uri.clone()),
            })
            .collect();
        Self {
            name: playlist.name().to_string(),
            entries,
        }
    }

    pub fn into_playlist(self) -> Playlist {
        let uris = self.entries.into_iter().map(|entry| entry.uri).collect();
        Playlist::with_uris(&self.name, uris)
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.uri.as_str())
    }
}

pub fn read_playlist(path: &Path) -> Result<PlaylistFile, LibraryError> {
    let bytes = fs::read(path)?;
    let contents = String::from_utf8_lossy(&bytes);
    let format = PlaylistFormat::detect(path, &contents).ok_or_else(|| LibraryError::Playlist {
        path: path.to_path_buf(),
        reason: "unrecognized playlist format".to_string(),
    })?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut playlist = parse(&contents, format, &base).map_err(|reason| LibraryError::Playlist {
        path: path.to_path_buf(),
        reason,
    })?;
    if playlist.name.is_empty() {
        playlist.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
    }
    Ok(playlist)
}

/// Parses playlist text. Relative entries resolve against `base`.
/// Entries that cannot be turned into a URI are skipped.
pub fn parse(contents: &str, format: PlaylistFormat, base: &Path) -> Result<PlaylistFile, String> {
    let contents = contents.trim_start_matches('\u{feff}');
    match format {
        PlaylistFormat::M3u | PlaylistFormat::ExtM3u => Ok(parse_m3u(contents, base)),
        PlaylistFormat::Pls => parse_pls(contents, base),
    }
}

fn parse_m3u(contents: &str, base: &Path) -> PlaylistFile {
    let mut playlist = PlaylistFile::default();
    let mut pending: Option<(Option<f64>, Option<String>)> = None;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            pending = Some(parse_extinf(info));
            continue;
        }
        if let Some(name) = line.strip_prefix("#PLAYLIST:") {
            playlist.name = name.trim().to_string();
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let (length, title) = pending.take().unwrap_or((None, None));
        match resolve(line, base) {
            Some(uri) => playlist.entries.push(PlaylistEntry { uri, title, length }),
            None => tracing::warn!(entry = line, "skipping unusable playlist entry"),
        }
    }
    playlist
}

fn parse_extinf(info: &str) -> (Option<f64>, Option<String>) {
    let (secs, title) = match info.split_once(',') {
        Some((secs, title)) => (secs, Some(title.trim().to_string())),
        None => (info, None),
    };
    let length = secs.trim().parse::<f64>().ok().filter(|secs| *secs >= 0.0);
    (length, title.filter(|title| !title.is_empty()))
}

fn parse_pls(contents: &str, base: &Path) -> Result<PlaylistFile, String> {
    let mut lines = contents.lines().map(str::trim).filter(|line| !line.is_empty());
    match lines.next() {
        Some(header) if header.eq_ignore_ascii_case("[playlist]") => {}
        _ => return Err("missing [playlist] header".to_string()),
    }

    // Entries are numbered from 1 but may appear in any order.
    let mut slots: Vec<(usize, Option<String>, Option<String>, Option<f64>)> = Vec::new();
    let mut slot = |n: usize| -> usize {
        match slots.iter().position(|(m, ..)| *m == n) {
            Some(idx) => idx,
            None => {
                slots.push((n, None, None, None));
                slots.len() - 1
            }
        }
    };
    let mut name = String::new();
    let mut assignments = Vec::new();
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key == "x-name" || key == "name" {
            name = value.to_string();
            continue;
        }
        for field in ["file", "title", "length"] {
            if let Some(n) = key.strip_prefix(field).and_then(|n| n.parse::<usize>().ok()) {
                assignments.push((slot(n), field, value.to_string()));
            }
        }
    }
    for (idx, field, value) in assignments {
        let entry = &mut slots[idx];
        match field {
            "file" => entry.1 = Some(value),
            "title" => entry.2 = Some(value).filter(|v| !v.is_empty()),
            _ => entry.3 = value.parse::<f64>().ok().filter(|secs| *secs >= 0.0),
        }
    }
    slots.sort_by_key(|(n, ..)| *n);

    let mut playlist = PlaylistFile {
        name,
        entries: Vec::new(),
    };
    for (_, file, title, length) in slots {
        let Some(file) = file else {
            continue;
        };
        match resolve(&file, base) {
            Some(uri) => playlist.entries.push(PlaylistEntry { uri, title, length }),
            None => tracing::warn!(entry = %file, "skipping unusable playlist entry"),
        }
    }
    Ok(playlist)
}

fn resolve(entry: &str, base: &Path) -> Option<String> {
    if uri::has_scheme(entry) {
        return uri::normalize(entry).ok();
    }
    let path = Path::new(entry);
    let path: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    uri::from_path(&path).ok()
}

/// Local tracks are written as filesystem paths, everything else as URIs.
fn location(entry: &PlaylistEntry) -> String {
    uri::to_path(&entry.uri)
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|| entry.uri.clone())
}

pub fn render(playlist: &PlaylistFile, format: PlaylistFormat) -> String {
    let mut out = String::new();
    match format {
        PlaylistFormat::M3u => {
            for entry in &playlist.entries {
                out.push_str(&location(entry));
                out.push('\n');
            }
        }
        PlaylistFormat::ExtM3u => {
            out.push_str("#EXTM3U\n");
            if !playlist.name.is_empty() {
                out.push_str(&format!("#PLAYLIST:{}\n", playlist.name));
            }
            for entry in &playlist.entries {
                let secs = entry.length.map(|secs| secs.round() as i64).unwrap_or(-1);
                let title = entry.title.as_deref().unwrap_or_default();
                out.push_str(&format!("#EXTINF:{secs},{title}\n{}\n", location(entry)));
            }
        }
        PlaylistFormat::Pls => {
            out.push_str("[playlist]\n");
            if !playlist.name.is_empty() {
                out.push_str(&format!("X-Name={}\n", playlist.name));
            }
            for (idx, entry) in playlist.entries.iter().enumerate() {
                let n = idx + 1;
                out.push_str(&format!("File{n}={}\n", location(entry)));
                if let Some(title) = &entry.title {
                    out.push_str(&format!("Title{n}={title}\n"));
                }
                let secs = entry.length.map(|secs| secs.round() as i64).unwrap_or(-1);
                out.push_str(&format!("Length{n}={secs}\n"));
            }
            out.push_str(&format!("NumberOfEntries={}\n", playlist.entries.len()));
            out.push_str("Version=2\n");
        }
    }
    out
}

/// Writes next to the target and renames over it.
pub fn write_playlist(
    path: &Path,
    playlist: &PlaylistFile,
    format: PlaylistFormat,
) -> Result<(), LibraryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, render(playlist, format))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Track;

    #[test]
    fn detects_by_header_before_extension() {
        let path = Path::new("/tmp/list.m3u");
        assert_eq!(
            PlaylistFormat::detect(path, "#EXTM3U\n/a.mp3\n"),
            Some(PlaylistFormat::ExtM3u)
        );
        assert_eq!(
            PlaylistFormat::detect(path, "/a.mp3\n"),
            Some(PlaylistFormat::M3u)
        );
        assert_eq!(
            PlaylistFormat::detect(Path::new("/tmp/list.txt"), "\n[playlist]\nFile1=/a.mp3\n"),
            Some(PlaylistFormat::Pls)
        );
        assert_eq!(PlaylistFormat::detect(Path::new("/tmp/list.txt"), "/a.mp3"), None);
    }

    #[test]
    fn extended_m3u_keeps_titles_and_resolves_relative_entries() {
        let text = "#EXTM3U\n#EXTINF:215,Artist - Song\nsub/song.mp3\n\n# comment\n/abs/other.flac\nhttp://radio.example/stream\n";
        let playlist = parse(text, PlaylistFormat::ExtM3u, Path::new("/music/lists")).unwrap();
        assert_eq!(playlist.entries.len(), 3);
        assert_eq!(playlist.entries[0].uri, "file:///music/lists/sub/song.mp3");
        assert_eq!(playlist.entries[0].title.as_deref(), Some("Artist - Song"));
        assert_eq!(playlist.entries[0].length, Some(215.0));
        assert_eq!(playlist.entries[1].uri, "file:///abs/other.flac");
        assert_eq!(playlist.entries[1].title, None);
        assert_eq!(playlist.entries[2].uri, "http://radio.example/stream");
    }

    #[test]
    fn negative_extinf_length_is_unknown() {
        let playlist = parse("#EXTM3U\n#EXTINF:-1,Live\n/a.mp3\n", PlaylistFormat::ExtM3u, Path::new("/"))
            .unwrap();
        assert_eq!(playlist.entries[0].length, None);
        assert_eq!(playlist.entries[0].title.as_deref(), Some("Live"));
    }

    #[test]
    fn pls_entries_are_ordered_by_number() {
        let text = "[playlist]\nFile2=b.ogg\nTitle2=Second\nFile1=/m/a.ogg\nLength1=60\nNumberOfEntries=2\nVersion=2\n";
        let playlist = parse(text, PlaylistFormat::Pls, Path::new("/m")).unwrap();
        let uris: Vec<&str> = playlist.uris().collect();
        assert_eq!(uris, vec!["file:///m/a.ogg", "file:///m/b.ogg"]);
        assert_eq!(playlist.entries[0].length, Some(60.0));
        assert_eq!(playlist.entries[1].title.as_deref(), Some("Second"));
    }

    #[test]
    fn pls_without_header_is_rejected() {
        assert!(parse("File1=/a.ogg\n", PlaylistFormat::Pls, Path::new("/")).is_err());
    }

    #[test]
    fn extended_m3u_output_carries_duration_and_title() {
        let playlist = PlaylistFile {
            name: "Mix".into(),
            entries: vec![
                PlaylistEntry {
                    uri: "file:///m/a%20b.mp3".into(),
                    title: Some("A B".into()),
                    length: Some(181.6),
                },
                PlaylistEntry::new("http://radio.example/stream"),
            ],
        };
        let text = render(&playlist, PlaylistFormat::ExtM3u);
        assert_eq!(
            text,
            "#EXTM3U\n#PLAYLIST:Mix\n#EXTINF:182,A B\n/m/a b.mp3\n#EXTINF:-1,\nhttp://radio.example/stream\n"
        );
    }

    #[test]
    fn written_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = TrackDb::in_memory("test");
        let song = dir.path().join("song.mp3");
        let mut track = Track::new(uri::from_path(&song).unwrap()).unwrap();
        track.set_tag("title", ["Song"]).unwrap();
        track.set_number("__length", 90.0);
        db.put(track).unwrap();

        let mut list = Playlist::new("Evening");
        list.append(uri::from_path(&song).unwrap());
        list.append("http://radio.example/stream");
        let file = PlaylistFile::from_playlist(&list, &db);

        for (name, format) in [
            ("a.m3u", PlaylistFormat::M3u),
            ("b.m3u", PlaylistFormat::ExtM3u),
            ("c.pls", PlaylistFormat::Pls),
        ] {
            let path = dir.path().join(name);
            write_playlist(&path, &file, format).unwrap();
            let read = read_playlist(&path).unwrap();
            let uris: Vec<&str> = read.uris().collect();
            assert_eq!(uris, list.uris(), "{name}");
            if format != PlaylistFormat::M3u {
                assert_eq!(read.entries[0].title.as_deref(), Some("Song"), "{name}");
                assert_eq!(read.entries[0].length, Some(90.0), "{name}");
            }
        }
        assert!(!dir.path().join("b.m3u.tmp").exists());

        let loaded = read_playlist(&dir.path().join("a.m3u")).unwrap().into_playlist();
        assert_eq!(loaded.name(), "a");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn unknown_format_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello\n").unwrap();
        assert!(matches!(
            read_playlist(&path),
            Err(LibraryError::Playlist { .. })
        ));
    }
}
