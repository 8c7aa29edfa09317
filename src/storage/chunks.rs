//! Reassembly of files uploaded as indexed chunks across many requests.
//!
//! Each upload id owns a session in a [`ChunkAssembler`]'s registry and a
//! temp directory `chunks/<upload_id>/` holding one `chunk_<index>` file per
//! received index. When the set of received indices covers `0..total`, the
//! chunk files are streamed in index order through the content writer into
//! the target object and the session is torn down.
//!
//! Sessions are keyed by upload id; the registry lock is only held for map
//! lookups, while each session has its own lock so chunks of different
//! uploads never contend and chunks of the same upload serialize only around
//! bookkeeping and finalization.
//!
//! An upload id that completed or was discarded stays in the registry as a
//! tombstone until the stale sweep evicts it, so late or retried chunks for
//! it fail with [`StorageError::UploadClosed`] instead of opening a fresh
//! session that could overwrite the finished object.

use super::{
    FileStore, StorageError, StorageResult, path,
    writer::{COPY_BUFFER_SIZE, write_atomic},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    fs::{self, File},
    sync::Mutex,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Default idle time after which an unfinished upload is swept.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const CHUNK_FILE_PREFIX: &str = "chunk_";

fn chunk_file_name(index: u32) -> String {
    format!("{CHUNK_FILE_PREFIX}{index}")
}

/// Lookup of the version currently recorded for an object.
///
/// Finalization asks this before writing so the superseded content can be
/// archived under its version number.
pub trait VersionCatalog: Send + Sync {
    fn current_version(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> impl Future<Output = StorageResult<Option<i64>>> + Send;
}

/// One chunk as described by the request headers.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub filename: String,
    pub bucket_id: String,
}

impl ChunkUpload {
    fn validate(&self) -> StorageResult<()> {
        if self.upload_id.is_empty() {
            return Err(StorageError::InvalidChunkHeaders("upload id is empty".into()));
        }
        if self.filename.is_empty() {
            return Err(StorageError::InvalidChunkHeaders("filename is empty".into()));
        }
        if self.total_chunks < 1 {
            return Err(StorageError::InvalidChunkHeaders(
                "total chunks must be at least 1".into(),
            ));
        }
        if self.index >= self.total_chunks {
            return Err(StorageError::InvalidChunkHeaders(format!(
                "chunk index {} out of range 0..{}",
                self.index, self.total_chunks
            )));
        }
        Ok(())
    }
}

/// The object produced by a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledObject {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    /// Version that was archived before the write, if the object existed.
    pub superseded_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Pending { received: u32, total: u32 },
    Complete(AssembledObject),
}

struct SessionState {
    received: BTreeSet<u32>,
    last_activity: Instant,
}

struct Session {
    bucket_id: String,
    filename: String,
    total_chunks: u32,
    /// Set once, without the state lock, when the session completes or is
    /// discarded. Checked under the state lock before any bookkeeping.
    closed: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(upload: &ChunkUpload, filename: String) -> Self {
        Self {
            bucket_id: upload.bucket_id.clone(),
            filename,
            total_chunks: upload.total_chunks,
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                received: BTreeSet::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    /// Mark closed; returns whether this call did it.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Registry {
    open: HashMap<String, Arc<Session>>,
    /// Upload ids that completed or were discarded, with the closing time.
    closed: HashMap<String, Instant>,
}

impl Registry {
    /// Move `upload_id` from the open set to the tombstones.
    fn retire(&mut self, upload_id: &str) -> Option<Arc<Session>> {
        let session = self.open.remove(upload_id);
        self.closed.insert(upload_id.to_string(), Instant::now());
        session
    }
}

/// Tracks in-progress chunked uploads. Clones share the same registry.
#[derive(Clone)]
pub struct ChunkAssembler {
    store: FileStore,
    registry: Arc<Mutex<Registry>>,
}

impl ChunkAssembler {
    pub fn new(store: FileStore) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Number of uploads currently accepting chunks.
    pub async fn active_sessions(&self) -> usize {
        self.registry.lock().await.open.len()
    }

    /// Persist one chunk and finalize the upload once every index is present.
    ///
    /// Re-sending an index overwrites that chunk's bytes and does not change
    /// the received count. Any I/O failure discards the whole session and its
    /// temp directory; the client has to start over with a new upload id.
    pub async fn accept_chunk<C, S>(
        &self,
        catalog: &C,
        upload: ChunkUpload,
        body: S,
    ) -> StorageResult<ChunkOutcome>
    where
        C: VersionCatalog,
        S: Stream<Item = io::Result<Bytes>>,
    {
        upload.validate()?;
        let filename = path::normalize(&upload.filename)?;
        self.store.object_path(&upload.bucket_id, &filename)?;
        let upload_dir = self.store.chunk_dir(&upload.upload_id)?;

        let session = self.open_session(&upload, filename).await?;

        let chunk_path = upload_dir.join(chunk_file_name(upload.index));
        if let Err(err) = write_atomic(&chunk_path, body).await {
            warn!(
                upload_id = %upload.upload_id,
                index = upload.index,
                error = %err,
                "failed to persist chunk, discarding upload"
            );
            self.discard(&upload.upload_id, &upload_dir).await;
            return Err(err);
        }

        let mut state = session.state.lock().await;
        if session.is_closed() {
            drop(state);
            // Whoever closed the session already removed the directory; this
            // chunk's write may have recreated it.
            remove_upload_dir(&upload_dir).await;
            return Err(StorageError::UploadClosed(upload.upload_id));
        }

        state.received.insert(upload.index);
        state.last_activity = Instant::now();
        let received = state.received.len() as u32;
        debug!(
            upload_id = %upload.upload_id,
            index = upload.index,
            received,
            total = session.total_chunks,
            "stored chunk"
        );
        if received < session.total_chunks {
            return Ok(ChunkOutcome::Pending {
                received,
                total: session.total_chunks,
            });
        }

        let result = self.finalize(catalog, &session, &upload_dir).await;
        let closed_here = session.close();
        self.registry.lock().await.retire(&upload.upload_id);
        remove_upload_dir(&upload_dir).await;
        drop(state);

        match result {
            Ok(_) if !closed_here => {
                warn!(upload_id = %upload.upload_id, "upload was discarded during finalization");
                Err(StorageError::UploadClosed(upload.upload_id))
            }
            Ok(assembled) => {
                info!(
                    upload_id = %upload.upload_id,
                    bucket = %session.bucket_id,
                    path = %assembled.path,
                    size = assembled.size,
                    "chunked upload complete"
                );
                Ok(ChunkOutcome::Complete(assembled))
            }
            Err(err) => {
                warn!(upload_id = %upload.upload_id, error = %err, "chunked upload failed");
                Err(err)
            }
        }
    }

    /// Close every session targeting `bucket_id` and remove its temp directory.
    pub async fn discard_bucket(&self, bucket_id: &str) -> usize {
        let dropped: Vec<String> = {
            let mut registry = self.registry.lock().await;
            let ids: Vec<String> = registry
                .open
                .iter()
                .filter(|(_, session)| session.bucket_id == bucket_id)
                .map(|(upload_id, _)| upload_id.clone())
                .collect();
            for upload_id in &ids {
                if let Some(session) = registry.retire(upload_id) {
                    session.close();
                }
            }
            ids
        };

        for upload_id in &dropped {
            if let Ok(dir) = self.store.chunk_dir(upload_id) {
                remove_upload_dir(&dir).await;
            }
        }
        dropped.len()
    }

    /// Remove sessions idle for at least `ttl`, plus chunk directories no
    /// session owns whose modification time is at least `ttl` old. Tombstones
    /// older than `ttl` are forgotten.
    pub async fn sweep_stale(&self, ttl: Duration) -> StorageResult<usize> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut registry = self.registry.lock().await;
            registry
                .closed
                .retain(|_, closed_at| now.duration_since(*closed_at) < ttl);

            let ids: Vec<String> = registry
                .open
                .iter()
                .filter(|(_, session)| match session.state.try_lock() {
                    Ok(state) => now.duration_since(state.last_activity) >= ttl,
                    // Busy sessions are not idle.
                    Err(_) => false,
                })
                .map(|(upload_id, _)| upload_id.clone())
                .collect();
            for upload_id in &ids {
                if let Some(session) = registry.retire(upload_id) {
                    session.close();
                }
            }
            ids
        };

        let mut removed = 0;
        for upload_id in &expired {
            if let Ok(dir) = self.store.chunk_dir(upload_id) {
                remove_upload_dir(&dir).await;
            }
            removed += 1;
        }

        let mut entries = match fs::read_dir(self.store.chunks_root()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let upload_id = entry.file_name().to_string_lossy().into_owned();
            if self.registry.lock().await.open.contains_key(&upload_id) {
                continue;
            }
            let dir = entry.path();
            match modified_age(&dir).await? {
                Some(age) if age >= ttl => {
                    remove_upload_dir(&dir).await;
                    removed += 1;
                }
                _ => {}
            }
        }

        if removed > 0 {
            info!(removed, "swept stale chunked uploads");
        }
        Ok(removed)
    }

    async fn open_session(&self, upload: &ChunkUpload, filename: String) -> StorageResult<Arc<Session>> {
        let mut registry = self.registry.lock().await;
        if registry.closed.contains_key(&upload.upload_id) {
            return Err(StorageError::UploadClosed(upload.upload_id.clone()));
        }
        let session = registry
            .open
            .entry(upload.upload_id.clone())
            .or_insert_with(|| {
                debug!(upload_id = %upload.upload_id, total = upload.total_chunks, "opened chunked upload");
                Arc::new(Session::new(upload, filename.clone()))
            });

        if session.bucket_id != upload.bucket_id
            || session.filename != filename
            || session.total_chunks != upload.total_chunks
        {
            return Err(StorageError::InvalidChunkHeaders(format!(
                "upload `{}` was started as {} chunks of `{}` in bucket `{}`",
                upload.upload_id, session.total_chunks, session.filename, session.bucket_id
            )));
        }
        Ok(Arc::clone(session))
    }

    async fn finalize<C: VersionCatalog>(
        &self,
        catalog: &C,
        session: &Session,
        upload_dir: &Path,
    ) -> StorageResult<AssembledObject> {
        let superseded = catalog
            .current_version(&session.bucket_id, &session.filename)
            .await?;
        if let Some(version) = superseded {
            self.store
                .archive(&session.bucket_id, &session.filename, version)
                .await?;
        }

        let outcome = self
            .store
            .stream_write(
                &session.bucket_id,
                &session.filename,
                concatenated(upload_dir.to_path_buf(), session.total_chunks),
            )
            .await?;

        Ok(AssembledObject {
            path: session.filename.clone(),
            size: outcome.size,
            sha256: outcome.sha256,
            superseded_version: superseded,
        })
    }

    async fn discard(&self, upload_id: &str, upload_dir: &Path) {
        if let Some(session) = self.registry.lock().await.retire(upload_id) {
            session.close();
        }
        remove_upload_dir(upload_dir).await;
    }
}

/// Chunk files `0..total` as one byte stream, opened lazily in index order.
fn concatenated(dir: PathBuf, total: u32) -> impl Stream<Item = io::Result<Bytes>> {
    stream::iter(0..total)
        .then(move |index| {
            let chunk_path = dir.join(chunk_file_name(index));
            async move { File::open(chunk_path).await }
        })
        .map_ok(|file| ReaderStream::with_capacity(file, COPY_BUFFER_SIZE))
        .try_flatten()
}

/// Time since `path` was last modified, or `None` if it no longer exists.
async fn modified_age(path: &Path) -> io::Result<Option<Duration>> {
    match fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(meta.modified()?.elapsed().unwrap_or_default())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn remove_upload_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove chunk directory {}: {}", dir.display(), err),
    }
}
