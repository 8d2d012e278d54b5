//! Credential store adapter
//!
//! The pipeline reads and writes exactly two keys (`ACCESS_TOKEN_KEY`,
//! `REFRESH_TOKEN_KEY`) through the `CredentialStore` trait. Implementations
//! are pass-through: there is no cache in front of the backing store, so every
//! `get` observes the latest `set` from any task sharing the store.
//!
//! `FileCredentialStore` keeps a JSON object on disk and reads it on every
//! call, so separate instances or processes sharing the file see each other's
//! writes. All writes use atomic temp-file + rename.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};
use crate::token::TokenPair;

/// Boxed future returned by store operations (keeps the trait dyn-compatible).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable key/value store for session credentials.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pipeline can hold an
/// `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// Read a value. `None` when the key has never been set or was removed.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Secret<String>>>;

    /// Write a value, replacing any previous one.
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()>;

    /// Delete a value. Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}

/// Overwrite both credential keys with a freshly minted pair.
pub async fn persist_pair(store: &dyn CredentialStore, pair: &TokenPair) -> Result<()> {
    store.set(ACCESS_TOKEN_KEY, pair.access.expose()).await?;
    store.set(REFRESH_TOKEN_KEY, pair.refresh.expose()).await?;
    debug!("persisted refreshed credential pair");
    Ok(())
}

/// Remove both credential keys.
///
/// Attempts both removals even if the first fails; returns the first error.
pub async fn clear_pair(store: &dyn CredentialStore) -> Result<()> {
    let access = store.remove(ACCESS_TOKEN_KEY).await;
    let refresh = store.remove(REFRESH_TOKEN_KEY).await;
    access.and(refresh)?;
    debug!("cleared credential pair");
    Ok(())
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store already holding a credential pair.
    pub fn with_pair(access: &str, refresh: &str) -> Self {
        let state = HashMap::from([
            (ACCESS_TOKEN_KEY.to_string(), access.to_string()),
            (REFRESH_TOKEN_KEY.to_string(), refresh.to_string()),
        ]);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Secret<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(key).cloned().map(Secret::new))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().await.remove(key);
            Ok(())
        })
    }
}

/// File-backed store.
///
/// Holds no copy of the credentials: `get` reads the file on every call and
/// `set`/`remove` re-read it, apply the change and write it back. The Mutex
/// only serializes this instance's read-modify-write cycles.
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Open the store at the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (signed-out cold start).
    /// An existing file is parsed once so a corrupt file fails here.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let entries = read_entries(&path).await?;
            info!(path = %path.display(), keys = entries.len(), "loaded session credentials");
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            write_atomic(&path, &HashMap::new()).await?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Secret<String>>> {
        Box::pin(async move {
            let mut entries = read_entries(&self.path).await?;
            Ok(entries.remove(key).map(Secret::new))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut entries = read_entries(&self.path).await?;
            entries.insert(key.to_string(), value.to_string());
            debug!(key, "stored credential");
            write_atomic(&self.path, &entries).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut entries = read_entries(&self.path).await?;
            if entries.remove(key).is_some() {
                debug!(key, "removed credential");
                write_atomic(&self.path, &entries).await?;
            }
            Ok(())
        })
    }
}

/// Read the credential file. A missing file reads as empty.
async fn read_entries(path: &Path) -> Result<HashMap<String, String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
    };
    serde_json::from_str(&contents)
        .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
}

/// Distinguishes temp files of concurrent writers within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write the store to a file atomically.
///
/// Writes to a temporary file next to the target, named after it, then
/// renames it over the target. Sets file permissions to 0600 since the file
/// holds tokens. The temp file is removed if any step after creating it fails.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("credential path has no file name".into()))?
        .to_string_lossy();

    let tmp_path = dir.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    if let Err(e) = finish_write(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

async fn finish_write(tmp_path: &Path, path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(suffix: &str) -> TokenPair {
        TokenPair::new(format!("at_{suffix}"), format!("rt_{suffix}"))
    }

    #[tokio::test]
    async fn file_store_roundtrips_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        persist_pair(&store, &pair("1")).await.unwrap();

        let reloaded = FileCredentialStore::load(path).await.unwrap();
        let access = reloaded.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap();
        let refresh = reloaded.get(REFRESH_TOKEN_KEY).await.unwrap().unwrap();
        assert_eq!(access.expose(), "at_1");
        assert_eq!(refresh.expose(), "rt_1");
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        assert!(!path.exists());
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = FileCredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn clear_pair_removes_both_keys_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        persist_pair(&store, &pair("1")).await.unwrap();
        clear_pair(&store).await.unwrap();

        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).await.unwrap().is_none());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty(), "file still holds keys: {parsed:?}");
    }

    #[tokio::test]
    async fn stores_sharing_a_file_see_each_others_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let a = FileCredentialStore::load(path.clone()).await.unwrap();
        let b = FileCredentialStore::load(path.clone()).await.unwrap();

        a.set(ACCESS_TOKEN_KEY, "at_from_a").await.unwrap();
        assert_eq!(
            b.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap().expose(),
            "at_from_a"
        );

        b.set(REFRESH_TOKEN_KEY, "rt_from_b").await.unwrap();
        assert_eq!(
            a.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap().expose(),
            "at_from_a",
            "b's write must not drop a's credential"
        );
        assert_eq!(
            a.get(REFRESH_TOKEN_KEY).await.unwrap().unwrap().expose(),
            "rt_from_b"
        );

        b.remove(ACCESS_TOKEN_KEY).await.unwrap();
        assert!(a.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sibling_files_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let first = std::sync::Arc::new(
            FileCredentialStore::load(dir.path().join("first.json"))
                .await
                .unwrap(),
        );
        let second = std::sync::Arc::new(
            FileCredentialStore::load(dir.path().join("second.json"))
                .await
                .unwrap(),
        );

        let mut handles = vec![];
        for i in 0..10 {
            let first = first.clone();
            let second = second.clone();
            handles.push(tokio::spawn(async move {
                first.set(ACCESS_TOKEN_KEY, &format!("first-{i}")).await.unwrap();
                second.set(ACCESS_TOKEN_KEY, &format!("second-{i}")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let first_value = first.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap();
        let second_value = second.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap();
        assert!(first_value.expose().starts_with("first-"));
        assert!(second_value.expose().starts_with("second-"));

        let mut leftovers = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.contains(".tmp."), "temp file left behind: {name}");
        }
    }

    #[tokio::test]
    async fn persist_pair_overwrites_previous_values() {
        let store = MemoryCredentialStore::with_pair("at_old", "rt_old");
        persist_pair(&store, &pair("new")).await.unwrap();

        let access = store.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap();
        let refresh = store.get(REFRESH_TOKEN_KEY).await.unwrap().unwrap();
        assert_eq!(access.expose(), "at_new");
        assert_eq!(refresh.expose(), "rt_new");
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn removing_missing_key_is_ok() {
        let store = MemoryCredentialStore::new();
        store.remove(ACCESS_TOKEN_KEY).await.unwrap();
        clear_pair(&store).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set(ACCESS_TOKEN_KEY, "at_1").await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = std::sync::Arc::new(FileCredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("key-{i}");
                store.set(&key, &format!("value-{i}")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
