//! `FileResultStore` — the default Result Store backend (§4.6): one file per
//! key under a directory, using `tempfile`'s write-then-rename pattern for
//! atomicity, with keys addressed by their namespaced path (`sub/<id>`,
//! `stage/<sub-id>/<ordinal>`, `task/<task-id>`, `cache/<fingerprint>`,
//! `lease/<fingerprint>`, `queue/<routing-key>/…`, §6.3). Every value on disk
//! is length-prefixed JSON, per §6.3's persisted state layout. Disk I/O is
//! gated by a `CircuitBreaker` (§2 item 10) so a struggling filesystem
//! fails fast with `queue-unavailable`-style backpressure instead of
//! piling up blocked callers.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{ExecutorError, ExecutorResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};
use crate::store::ResultStore;

/// Directory-of-files Result Store. Cheap to clone: the path and a mutex
/// guarding compare-and-set/sequence operations are the only state.
pub struct FileResultStore {
    root: PathBuf,
    // Coarse single-process lock serializing read-modify-write sequences
    // (compare_and_set, next_sequence). The default backend targets
    // single-host deployments (§4.5); cross-process CAS is not claimed.
    cas_lock: Mutex<()>,
    breaker: CircuitBreaker,
}

impl FileResultStore {
    pub async fn open(root: impl Into<PathBuf>) -> ExecutorResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ExecutorError::internal(e))?;
        Ok(Self {
            root,
            cas_lock: Mutex::new(()),
            breaker: CircuitBreaker::new("file-result-store".to_string(), CircuitBreakerConfig::default()),
        })
    }

    fn path_for(&self, key: &str) -> ExecutorResult<PathBuf> {
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(ExecutorError::InvalidSchema(format!(
                "invalid result store key: {key}"
            )));
        }
        Ok(self.root.join(key))
    }

    /// `Err` when the breaker is currently open; callers should fail the
    /// operation with `queue-unavailable` without touching the disk.
    fn check_breaker(&self) -> ExecutorResult<()> {
        if !self.breaker.should_allow() {
            return Err(ExecutorError::QueueUnavailable(format!(
                "{} circuit breaker is open",
                self.breaker.name()
            )));
        }
        Ok(())
    }

    async fn read_raw(&self, path: &Path) -> ExecutorResult<Option<Vec<u8>>> {
        self.check_breaker()?;
        let start = Instant::now();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                self.breaker.record_success(start.elapsed());
                Ok(Some(decode_length_prefixed(&bytes)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.breaker.record_success(start.elapsed());
                Ok(None)
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn write_raw(&self, path: &Path, value: &[u8]) -> ExecutorResult<()> {
        self.check_breaker()?;
        let parent = path.parent().ok_or_else(|| {
            ExecutorError::InvalidSchema("result store key has no parent directory".to_string())
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecutorError::internal(e))?;

        let encoded = encode_length_prefixed(value);
        let dir = parent.to_path_buf();
        let target = path.to_path_buf();
        let start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            use std::io::Write;
            tmp.write_all(&encoded)?;
            tmp.flush()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.breaker.record_success(start.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                Err(ExecutorError::internal(e))
            }
        }
    }

    async fn walk(dir: PathBuf, out: &mut Vec<String>, root: &Path) -> ExecutorResult<()> {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ExecutorError::internal(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| ExecutorError::internal(e))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| ExecutorError::internal(e))?;
            if file_type.is_dir() {
                Box::pin(Self::walk(path, out, root)).await?;
            } else if file_type.is_file() && !path.extension().map(|e| e == "tmp").unwrap_or(false) {
                if let Ok(rel) = path.strip_prefix(root) {
                    if let Some(key) = rel.to_str() {
                        out.push(key.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn encode_length_prefixed(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&(value.len() as u64).to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_length_prefixed(bytes: &[u8]) -> ExecutorResult<Vec<u8>> {
    if bytes.len() < 8 {
        return Err(ExecutorError::internal(anyhow::anyhow!(
            "result store record truncated (missing length prefix)"
        )));
    }
    let (len_bytes, rest) = bytes.split_at(8);
    let len = u64::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() != len {
        return Err(ExecutorError::internal(anyhow::anyhow!(
            "result store record length mismatch: expected {len}, found {}",
            rest.len()
        )));
    }
    Ok(rest.to_vec())
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn put(&self, key: &str, value: &[u8]) -> ExecutorResult<()> {
        let path = self.path_for(key)?;
        self.write_raw(&path, value).await
    }

    async fn get(&self, key: &str) -> ExecutorResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        self.read_raw(&path).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> ExecutorResult<bool> {
        let path = self.path_for(key)?;
        let _guard = self.cas_lock.lock().await;
        let current = self.read_raw(&path).await?;
        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(c), Some(e)) => c.as_slice() == e,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        self.write_raw(&path, value).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> ExecutorResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecutorError::internal(e)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> ExecutorResult<Vec<String>> {
        let mut out = Vec::new();
        Self::walk(self.root.clone(), &mut out, &self.root).await?;
        out.retain(|key| key.starts_with(prefix));
        Ok(out)
    }

    async fn next_sequence(&self, name: &str) -> ExecutorResult<u64> {
        let key = format!("_seq/{name}");
        let path = self.path_for(&key)?;
        let _guard = self.cas_lock.lock().await;
        let current = self.read_raw(&path)
            .await?
            .map(|bytes| {
                std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let next = current + 1;
        self.write_raw(&path, next.to_string().as_bytes()).await?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        store.put("sub/1", b"hello").await.unwrap();
        assert_eq!(store.get("sub/1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("sub/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        store.put("cache/fp1", b"v1").await.unwrap();
        let applied = store
            .compare_and_set("cache/fp1", Some(b"wrong"), b"v2")
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get("cache/fp1").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn compare_and_set_requires_absence_for_none_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        assert!(store
            .compare_and_set("lease/fp1", None, b"owner-a")
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("lease/fp1", None, b"owner-b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scan_prefix_finds_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        store.put("stage/1/0", b"a").await.unwrap();
        store.put("stage/1/1", b"b").await.unwrap();
        store.put("stage/2/0", b"c").await.unwrap();
        let mut keys = store.scan_prefix("stage/1/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["stage/1/0".to_string(), "stage/1/1".to_string()]);
    }

    #[tokio::test]
    async fn next_sequence_is_monotonic_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        assert_eq!(store.next_sequence("submission").await.unwrap(), 1);
        assert_eq!(store.next_sequence("submission").await.unwrap(), 2);

        let reopened = FileResultStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.next_sequence("submission").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        assert!(store.put("../escape", b"x").await.is_err());
    }

    #[tokio::test]
    async fn forced_open_breaker_fails_fast_without_touching_disk() {
        use crate::resilience::CircuitBreakerBehavior;
        let dir = tempfile::tempdir().unwrap();
        let store = FileResultStore::open(dir.path()).await.unwrap();
        store.breaker.force_open();
        let err = store.put("sub/1", b"hello").await.unwrap_err();
        assert_eq!(err.kind(), "queue-unavailable");
    }
}
