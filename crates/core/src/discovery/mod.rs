use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::Result;

/// Extension of the clips picked up from watched directories.
pub const CLIP_EXTENSION: &str = "wav";

/// Interval poller that queues `.wav` files appearing in watched directories.
///
/// A path is queued the first time a scan sees it and never again: the seen
/// set only grows, so a file deleted after consumption and re-created under
/// the same name is not picked up a second time.
#[derive(Debug)]
pub struct ClipWatcher {
    dirs: Vec<PathBuf>,
    /// path -> whether the clip has been handed out
    seen: HashMap<PathBuf, bool>,
    queue: VecDeque<PathBuf>,
    interval: Duration,
    last_scan: Option<Instant>,
}

impl Default for ClipWatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ClipWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            dirs: Vec::new(),
            seen: HashMap::new(),
            queue: VecDeque::new(),
            interval,
            last_scan: None,
        }
    }

    /// Starts watching `dir`. Clips already present are marked as seen without
    /// being queued. Returns `false` when the directory does not exist.
    pub fn watch(&mut self, dir: impl Into<PathBuf>) -> Result<bool> {
        let dir = dir.into();
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "watch directory does not exist");
            return Ok(false);
        }

        for path in list_clips(&dir)? {
            self.seen.entry(path).or_insert(false);
        }
        tracing::info!(dir = %dir.display(), "watching for clips");
        self.dirs.push(dir);
        Ok(true)
    }

    /// Scans if at least one interval has passed since the previous scan.
    /// Returns the number of newly queued clips.
    pub fn poll(&mut self, now: Instant) -> Result<usize> {
        let due = self
            .last_scan
            .map(|last| now.saturating_duration_since(last) >= self.interval)
            .unwrap_or(true);
        if !due {
            return Ok(0);
        }
        self.last_scan = Some(now);
        self.scan()
    }

    /// Scans every watched directory immediately.
    pub fn scan(&mut self) -> Result<usize> {
        let mut added = 0;
        for dir in &self.dirs {
            let clips = match list_clips(dir) {
                Ok(clips) => clips,
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "failed to scan directory");
                    continue;
                }
            };

            for path in clips {
                if self.seen.contains_key(&path) {
                    continue;
                }
                tracing::info!(path = %path.display(), "discovered clip");
                self.seen.insert(path.clone(), false);
                self.queue.push_back(path);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Takes the oldest queued clip.
    pub fn pop(&mut self) -> Option<PathBuf> {
        let path = self.queue.pop_front()?;
        if let Some(notified) = self.seen.get_mut(&path) {
            *notified = true;
        }
        Some(path)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_seen(&self, path: &Path) -> bool {
        self.seen.contains_key(path)
    }

    /// Whether `path` was queued and later handed out by [`ClipWatcher::pop`].
    pub fn was_notified(&self, path: &Path) -> bool {
        self.seen.get(path).copied().unwrap_or(false)
    }

    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

/// Regular `.wav` files in `dir`, sorted by file name.
fn list_clips(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut clips = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_clip = path
            .extension()
            .map(|ext| ext == CLIP_EXTENSION)
            .unwrap_or(false);
        if is_clip && entry.file_type()?.is_file() {
            clips.push(path);
        }
    }
    clips.sort();
    Ok(clips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    #[test]
    fn queues_new_clips_once_in_listing_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = ClipWatcher::new(Duration::from_secs(1));
        assert!(watcher.watch(dir.path()).unwrap());

        let b = touch(dir.path(), "b.wav");
        let a = touch(dir.path(), "a.wav");
        touch(dir.path(), "notes.txt");

        let start = Instant::now();
        assert_eq!(watcher.poll(start).unwrap(), 2);
        assert_eq!(watcher.poll(start + Duration::from_secs(2)).unwrap(), 0);
        assert_eq!(watcher.poll(start + Duration::from_secs(4)).unwrap(), 0);

        assert_eq!(watcher.pop(), Some(a.clone()));
        assert_eq!(watcher.pop(), Some(b));
        assert_eq!(watcher.pop(), None);
        assert!(watcher.was_notified(&a));
    }

    #[test]
    fn respects_the_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = ClipWatcher::new(Duration::from_secs(1));
        watcher.watch(dir.path()).unwrap();

        let start = Instant::now();
        assert_eq!(watcher.poll(start).unwrap(), 0);
        touch(dir.path(), "late.wav");
        assert_eq!(watcher.poll(start + Duration::from_millis(500)).unwrap(), 0);
        assert_eq!(watcher.poll(start + Duration::from_millis(1_000)).unwrap(), 1);
    }

    #[test]
    fn existing_clips_are_seen_but_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let existing = touch(dir.path(), "existing.wav");

        let mut watcher = ClipWatcher::default();
        watcher.watch(dir.path()).unwrap();
        assert!(watcher.is_seen(&existing));
        assert_eq!(watcher.scan().unwrap(), 0);
        assert!(watcher.is_empty());
    }

    #[test]
    fn recreated_files_are_not_queued_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = ClipWatcher::default();
        watcher.watch(dir.path()).unwrap();

        let clip = touch(dir.path(), "again.wav");
        assert_eq!(watcher.scan().unwrap(), 1);
        watcher.pop();
        std::fs::remove_file(&clip).unwrap();
        touch(dir.path(), "again.wav");
        assert_eq!(watcher.scan().unwrap(), 0);
    }

    #[test]
    fn ignores_missing_directories() {
        let mut watcher = ClipWatcher::default();
        assert!(!watcher.watch("/definitely/not/here").unwrap());
        assert!(watcher.watched_dirs().is_empty());
    }
}
