use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use walkdir::WalkDir;

use crate::config::SnapshotFormat;
use crate::snapshot::{Snapshot, SnapshotInfo};

const SNAPSHOT_SUFFIXES: &[&str] = &[".snapshot.json", ".snapshot.yaml", ".snapshot.yml"];

/// Reads and writes snapshots under a base directory, organized by service
/// and endpoint:
///
/// `<base>/<service>/<METHOD>_<sanitized-url>/<NNN>_<id>.snapshot.<ext>`
#[derive(Debug, Clone)]
pub struct Store {
    base_dir: PathBuf,
    format: SnapshotFormat,
}

impl Store {
    pub fn new(base_dir: impl Into<PathBuf>, format: SnapshotFormat) -> Self {
        Self {
            base_dir: base_dir.into(),
            format,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Writes a snapshot to disk, allocating the next sequence number in its
    /// endpoint directory. Returns the path written.
    pub fn save(&self, snap: &Snapshot) -> anyhow::Result<PathBuf> {
        let dir = self.dir_for_snapshot(snap);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create snapshot directory {}", dir.display()))?;

        let seq = next_seq_number(&dir);
        let filename = format!(
            "{seq:03}_{}.snapshot.{}",
            sanitize_for_filename(&snap.id),
            self.format.extension()
        );
        let path = dir.join(filename);

        let data = self.marshal(snap)?;
        fs::write(&path, data)
            .with_context(|| format!("write snapshot file {}", path.display()))?;

        Ok(path)
    }

    /// Reads a snapshot from a specific file path. JSON is tried first, then
    /// YAML, so either format loads regardless of the configured one.
    pub fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<Snapshot> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("read snapshot file {}", path.display()))?;

        if let Ok(snap) = serde_json::from_slice::<Snapshot>(&data) {
            return Ok(snap);
        }
        serde_yaml::from_slice(&data)
            .with_context(|| format!("parse snapshot file {}", path.display()))
    }

    /// Reads every snapshot under the base directory. A missing base
    /// directory yields the empty set.
    pub fn load_all(&self) -> anyhow::Result<(Vec<Snapshot>, Vec<PathBuf>)> {
        let mut snapshots = Vec::new();
        let mut paths = Vec::new();

        if !self.base_dir.exists() {
            return Ok((snapshots, paths));
        }

        for entry in WalkDir::new(&self.base_dir) {
            let entry = entry.context("walk snapshot directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !SNAPSHOT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                continue;
            }

            let snap = self
                .load(entry.path())
                .with_context(|| format!("load {}", entry.path().display()))?;
            snapshots.push(snap);
            paths.push(entry.path().to_path_buf());
        }

        Ok((snapshots, paths))
    }

    /// Loads all snapshots that carry at least one of the given tags.
    pub fn load_by_tag(&self, tags: &[String]) -> anyhow::Result<(Vec<Snapshot>, Vec<PathBuf>)> {
        let (all, all_paths) = self.load_all()?;

        let mut filtered = Vec::new();
        let mut filtered_paths = Vec::new();
        for (snap, path) in all.into_iter().zip(all_paths) {
            if snap.tags.iter().any(|tag| tags.contains(tag)) {
                filtered.push(snap);
                filtered_paths.push(path);
            }
        }
        Ok((filtered, filtered_paths))
    }

    /// Overwrites the snapshot file at `path` with the current format.
    pub fn update(&self, path: impl AsRef<Path>, snap: &Snapshot) -> anyhow::Result<()> {
        let path = path.as_ref();
        let data = self.marshal(snap)?;
        fs::write(path, data)
            .with_context(|| format!("write snapshot file {}", path.display()))
    }

    /// Returns listing metadata for every stored snapshot, sorted by path.
    pub fn list(&self) -> anyhow::Result<Vec<SnapshotInfo>> {
        let (all, paths) = self.load_all()?;

        let mut infos: Vec<SnapshotInfo> = all
            .into_iter()
            .zip(paths)
            .map(|(snap, path)| SnapshotInfo {
                id: snap.id,
                path: path.display().to_string(),
                service: snap.service,
                method: snap.request.method,
                url: snap.request.url,
                status: snap.response.status,
                tags: snap.tags,
                timestamp: snap.timestamp,
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    fn dir_for_snapshot(&self, snap: &Snapshot) -> PathBuf {
        let endpoint = format!(
            "{}_{}",
            snap.request.method,
            sanitize_for_filename(&snap.request.url)
        );
        self.base_dir
            .join(sanitize_for_filename(&snap.service))
            .join(endpoint)
    }

    fn marshal(&self, snap: &Snapshot) -> anyhow::Result<Vec<u8>> {
        match self.format {
            SnapshotFormat::Json => {
                serde_json::to_vec_pretty(snap).context("serialize snapshot as JSON")
            }
            SnapshotFormat::Yaml => serde_yaml::to_string(snap)
                .map(String::into_bytes)
                .context("serialize snapshot as YAML"),
        }
    }
}

/// Highest `NNN_` prefix among the directory's entries, plus one. Starts at 1
/// for a missing or empty directory.
fn next_seq_number(dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 1;
    };

    let mut max = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = parse_seq_prefix(name) {
            max = max.max(seq);
        }
    }
    max + 1
}

fn parse_seq_prefix(name: &str) -> Option<u32> {
    let bytes = name.as_bytes();
    if bytes.len() < 4 || bytes[3] != b'_' {
        return None;
    }
    name[..3].parse().ok()
}

fn sanitize_for_filename(raw: &str) -> String {
    let sanitized = raw
        .replace(['/', ':'], "_")
        .replace(' ', "-");
    let sanitized = sanitized.trim_start_matches('_');
    if sanitized.is_empty() {
        "root".to_owned()
    } else {
        sanitized.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use chrono::Utc;
    use serde_json::json;

    use super::{Store, parse_seq_prefix, sanitize_for_filename};
    use crate::config::SnapshotFormat;
    use crate::snapshot::{HttpRequest, HttpResponse, Snapshot};

    fn sample_snapshot(id: &str, url: &str) -> Snapshot {
        let mut users_row = serde_json::Map::new();
        users_row.insert("id".to_owned(), json!(1));
        users_row.insert("name".to_owned(), json!("Alice"));

        let mut db_state = BTreeMap::new();
        db_state.insert("users".to_owned(), vec![users_row]);

        Snapshot {
            id: id.to_owned(),
            timestamp: Utc::now(),
            service: "users-api".to_owned(),
            tags: vec!["smoke".to_owned()],
            db_state_before: db_state.clone(),
            request: HttpRequest {
                method: "GET".to_owned(),
                url: url.to_owned(),
                headers: BTreeMap::from([(
                    "accept".to_owned(),
                    "application/json".to_owned(),
                )]),
                body: serde_json::Value::Null,
            },
            outgoing_requests: Vec::new(),
            response: HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: json!({"id": 1, "name": "Alice"}),
            },
            db_state_after: db_state,
            db_diff: BTreeMap::new(),
        }
    }

    #[test]
    fn save_and_load_round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        let snap = sample_snapshot("abc123", "/api/users/1");
        let path = store.save(&snap).unwrap();

        assert!(
            path.to_string_lossy()
                .contains("users-api/GET_api_users_1/001_abc123.snapshot.json"),
            "unexpected path: {}",
            path.display()
        );

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn save_and_load_round_trips_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Yaml);

        let mut snap = sample_snapshot("ffee00", "/api/users");
        snap.request.body = json!({"data": "AAEC/w==", "encoding": "base64"});
        let path = store.save(&snap).unwrap();
        assert!(path.extension().is_some_and(|ext| ext == "yaml"));

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn binary_bodies_survive_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        let raw = [0x00u8, 0x01, 0x02, 0xff];
        let mut snap = sample_snapshot("bin001", "/api/upload");
        snap.request.body = crate::body::parse_body(&raw, "application/octet-stream");

        let path = store.save(&snap).unwrap();
        let loaded = store.load(&path).unwrap();
        assert_eq!(crate::body::decode_body(&loaded.request.body).unwrap(), raw);
    }

    #[test]
    fn sequence_numbers_continue_past_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        let snap = sample_snapshot("seq001", "/api/users/1");
        let first = store.save(&snap).unwrap();
        let endpoint_dir = first.parent().unwrap().to_path_buf();

        // Simulate an out-of-band snapshot at sequence 3.
        fs::write(endpoint_dir.join("003_manual.snapshot.json"), b"{}").unwrap();

        let next = store.save(&snap).unwrap();
        assert!(
            next.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("004_"),
            "expected 004_ prefix, got {}",
            next.display()
        );
    }

    #[test]
    fn load_all_finds_snapshots_in_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        store.save(&sample_snapshot("one111", "/api/users/1")).unwrap();
        store.save(&sample_snapshot("two222", "/api/orders")).unwrap();

        let (snapshots, paths) = store.load_all().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn load_all_on_missing_base_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("missing"), SnapshotFormat::Json);
        let (snapshots, paths) = store.load_all().unwrap();
        assert!(snapshots.is_empty());
        assert!(paths.is_empty());
    }

    #[test]
    fn load_by_tag_filters_on_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        let tagged = sample_snapshot("tag001", "/api/users/1");
        let mut untagged = sample_snapshot("tag002", "/api/orders");
        untagged.tags = vec!["nightly".to_owned()];

        store.save(&tagged).unwrap();
        store.save(&untagged).unwrap();

        let (found, _) = store.load_by_tag(&["smoke".to_owned()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "tag001");

        let (none, _) = store.load_by_tag(&["missing".to_owned()]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn update_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        let mut snap = sample_snapshot("upd001", "/api/users/1");
        let path = store.save(&snap).unwrap();

        snap.response.status = 404;
        store.update(&path, &snap).unwrap();

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.response.status, 404);
    }

    #[test]
    fn list_is_sorted_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), SnapshotFormat::Json);

        store.save(&sample_snapshot("zzz999", "/api/zebras")).unwrap();
        store.save(&sample_snapshot("aaa111", "/api/ants")).unwrap();

        let infos = store.list().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].path < infos[1].path);
        assert_eq!(infos[0].url, "/api/ants");
    }

    #[test]
    fn sanitize_replaces_separators_and_defaults_to_root() {
        assert_eq!(sanitize_for_filename("/api/users/1"), "api_users_1");
        assert_eq!(sanitize_for_filename("a:b c"), "a_b-c");
        assert_eq!(sanitize_for_filename("/"), "root");
        assert_eq!(sanitize_for_filename(""), "root");
    }

    #[test]
    fn seq_prefix_requires_three_digits_and_underscore() {
        assert_eq!(parse_seq_prefix("001_x.snapshot.json"), Some(1));
        assert_eq!(parse_seq_prefix("123_y"), Some(123));
        assert_eq!(parse_seq_prefix("12_y"), None);
        assert_eq!(parse_seq_prefix("abcd"), None);
        assert_eq!(parse_seq_prefix("1234_x"), None);
    }
}
