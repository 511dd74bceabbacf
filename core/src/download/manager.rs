//! Download manager: fetches model artifacts with progress and validation.
//!
//! Single-file models are fetched with one GET, resuming from a partial
//! `.part` file via a `Range` header when one exists, then SHA-256 verified
//! when the catalog carries a checksum.
//!
//! Directory-package models are fetched file-by-file from a manifest. A 404
//! on an individual file is logged and skipped (optional files legitimately
//! do not exist for every variant); any other non-2xx status aborts the
//! whole task. Progress is reported as files completed over total files,
//! not bytes; byte-exact aggregation across the manifest is a known
//! limitation.
//!
//! The manager never retries internally; retry policy belongs to callers.
//! Re-invoking a download is idempotent per file (existing files are
//! overwritten), and a failed directory download leaves a partially
//! populated destination.

use super::strategy::{DownloadStrategy, MlPackageStrategy, WhisperBundleStrategy};
use crate::error::{LumenError, LumenResult};
use crate::registry::ModelInfo;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Connection timeout for artifact fetches.
const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Response handed back by a transport.
pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Transport capable of fetching artifact bytes.
///
/// Production uses the `ureq`-backed [`HttpTransport`]; tests inject fakes
/// to script status codes deterministically.
pub trait DownloadTransport: Send + Sync {
    /// Fetch a URL, optionally resuming from `range_start` bytes in.
    fn fetch(&self, url: &str, range_start: Option<u64>) -> LumenResult<TransportResponse>;
}

/// HTTP transport backed by a shared `ureq` agent.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(CONNECT_TIMEOUT_MS))
            .timeout(timeout)
            .build();
        Self { agent }
    }
}

impl DownloadTransport for HttpTransport {
    fn fetch(&self, url: &str, range_start: Option<u64>) -> LumenResult<TransportResponse> {
        let mut request = self.agent.get(url);
        if let Some(offset) = range_start {
            request = request.set("Range", &format!("bytes={}-", offset));
        }
        match request.call() {
            Ok(response) => {
                let content_length = response
                    .header("Content-Length")
                    .and_then(|v| v.parse().ok());
                Ok(TransportResponse {
                    status: response.status(),
                    content_length,
                    reader: Box::new(response.into_reader()),
                })
            }
            // Keep status errors as responses so callers can apply the
            // 404-tolerance rule; only transport-level failures error here.
            Err(ureq::Error::Status(status, _)) => Ok(TransportResponse {
                status,
                content_length: None,
                reader: Box::new(io::empty()),
            }),
            Err(e) => Err(LumenError::DownloadFailed(format!("{}: {}", url, e))),
        }
    }
}

/// Shared, atomically updated state of an in-flight download.
#[derive(Default)]
pub struct TaskState {
    cancelled: AtomicBool,
    files_completed: AtomicUsize,
    total_files: AtomicUsize,
    bytes_downloaded: AtomicU64,
    total_bytes: AtomicU64,
}

impl TaskState {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn begin(&self, total_files: usize) {
        self.total_files.store(total_files, Ordering::SeqCst);
        self.files_completed.store(0, Ordering::SeqCst);
    }

    fn file_done(&self) {
        self.files_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn add_bytes(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::SeqCst);
    }

    fn set_total_bytes(&self, n: u64) {
        self.total_bytes.store(n, Ordering::SeqCst);
    }

    pub fn progress(&self) -> DownloadProgress {
        let total = self.total_files.load(Ordering::SeqCst);
        let done = self.files_completed.load(Ordering::SeqCst);
        let fraction = if total == 0 {
            0.0
        } else {
            done as f32 / total as f32
        };
        let total_bytes = self.total_bytes.load(Ordering::SeqCst);
        DownloadProgress {
            files_completed: done,
            total_files: total,
            fraction,
            bytes_downloaded: self.bytes_downloaded.load(Ordering::SeqCst),
            total_bytes: (total_bytes > 0).then_some(total_bytes),
        }
    }
}

/// Progress snapshot. The fraction is file-count based for directory
/// packages; byte totals are informational.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub files_completed: usize,
    pub total_files: usize,
    /// files_completed / total_files, 0.0 to 1.0.
    pub fraction: f32,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

/// Handle to an in-flight or completed download.
///
/// Created by `LumenRuntime::download_model`; the terminal result is
/// consumed exactly once via [`wait`](Self::wait).
pub struct DownloadTask {
    model_id: String,
    destination: PathBuf,
    state: Arc<TaskState>,
    handle: tokio::task::JoinHandle<LumenResult<PathBuf>>,
}

impl DownloadTask {
    pub(crate) fn new(
        model_id: String,
        destination: PathBuf,
        state: Arc<TaskState>,
        handle: tokio::task::JoinHandle<LumenResult<PathBuf>>,
    ) -> Self {
        Self {
            model_id,
            destination,
            state,
            handle,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn progress(&self) -> DownloadProgress {
        self.state.progress()
    }

    /// Request cancellation. The worker observes the flag between chunks
    /// and between files.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Await the terminal result.
    pub async fn wait(self) -> LumenResult<PathBuf> {
        self.handle
            .await
            .map_err(|e| LumenError::DownloadFailed(format!("download task panicked: {}", e)))?
    }
}

/// Fetches model artifacts. Blocking; the orchestrator runs it on the
/// blocking pool.
pub struct DownloadManager {
    transport: Arc<dyn DownloadTransport>,
    strategies: RwLock<Vec<Arc<dyn DownloadStrategy>>>,
}

impl DownloadManager {
    pub fn new(transport: Arc<dyn DownloadTransport>) -> Self {
        let strategies: Vec<Arc<dyn DownloadStrategy>> =
            vec![Arc::new(WhisperBundleStrategy), Arc::new(MlPackageStrategy)];
        Self {
            transport,
            strategies: RwLock::new(strategies),
        }
    }

    /// Register a custom strategy. Consulted before the built-ins.
    pub fn register_strategy(&self, strategy: Arc<dyn DownloadStrategy>) {
        self.strategies
            .write()
            .expect("strategy lock poisoned")
            .insert(0, strategy);
    }

    /// Download a model's artifact(s) into `dest_root/<model id>`.
    ///
    /// Returns the validated artifact path (file for single-file models,
    /// directory for packages).
    pub fn download(
        &self,
        model: &ModelInfo,
        dest_root: &Path,
        state: &TaskState,
    ) -> LumenResult<PathBuf> {
        if model.format.is_directory() {
            self.download_directory(model, dest_root, state)
        } else {
            self.download_single(model, dest_root, state)
        }
    }

    fn download_single(
        &self,
        model: &ModelInfo,
        dest_root: &Path,
        state: &TaskState,
    ) -> LumenResult<PathBuf> {
        let url = model
            .download_url
            .clone()
            .ok_or_else(|| LumenError::DownloadFailed(format!("{}: no download URL", model.id)))?;

        let model_dir = dest_root.join(&model.id);
        fs::create_dir_all(&model_dir)?;
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&model.id)
            .to_string();
        let final_path = model_dir.join(&file_name);
        let part_path = model_dir.join(format!("{}.part", file_name));

        state.begin(1);

        // Primary URL first, then fallbacks in order.
        let mut last_err = None;
        let mut candidates = vec![url];
        candidates.extend(model.alternate_urls.iter().cloned());
        for candidate in &candidates {
            if let Err(e) = url::Url::parse(candidate) {
                log::warn!("skipping malformed URL {}: {}", candidate, e);
                last_err = Some(LumenError::DownloadFailed(format!(
                    "{}: malformed URL",
                    candidate
                )));
                continue;
            }
            match self.fetch_single_file(candidate, &part_path, state) {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    log::warn!("fetch failed for {}: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        if let Some(expected) = &model.checksum {
            verify_sha256(&part_path, expected)?;
        }
        fs::rename(&part_path, &final_path)?;
        state.file_done();
        Ok(final_path)
    }

    fn fetch_single_file(
        &self,
        url: &str,
        part_path: &Path,
        state: &TaskState,
    ) -> LumenResult<()> {
        // Resume from an existing partial file when the server honors it.
        let resume_from = fs::metadata(part_path).map(|m| m.len()).ok().filter(|n| *n > 0);
        let response = self.transport.fetch(url, resume_from)?;

        match response.status {
            200 => {
                // Full body; any partial content is stale.
                if let Some(total) = response.content_length {
                    state.set_total_bytes(total);
                }
                let file = File::create(part_path)?;
                copy_with_cancel(response.reader, file, state)
            }
            206 => {
                if let Some(len) = response.content_length {
                    state.set_total_bytes(resume_from.unwrap_or(0) + len);
                }
                let file = OpenOptions::new().append(true).open(part_path)?;
                copy_with_cancel(response.reader, file, state)
            }
            status => Err(LumenError::DownloadFailed(format!(
                "{}: HTTP {}",
                url, status
            ))),
        }
    }

    fn download_directory(
        &self,
        model: &ModelInfo,
        dest_root: &Path,
        state: &TaskState,
    ) -> LumenResult<PathBuf> {
        let strategies = self.strategies.read().expect("strategy lock poisoned");
        let strategy = strategies
            .iter()
            .find(|s| s.applies_to(model))
            .cloned()
            .ok_or_else(|| {
                LumenError::DownloadFailed(format!(
                    "{}: no download strategy for format {}",
                    model.id,
                    model.format.as_str()
                ))
            })?;
        drop(strategies);

        let root = strategy.remote_root(model).ok_or_else(|| {
            LumenError::DownloadFailed(format!("{}: no download URL", model.id))
        })?;
        let manifest = strategy.manifest(model);
        if manifest.is_empty() {
            return Err(LumenError::DownloadFailed(format!(
                "{}: empty file manifest",
                model.id
            )));
        }

        let model_dir = dest_root.join(&model.id);
        fs::create_dir_all(&model_dir)?;
        state.begin(manifest.len());

        for rel in &manifest {
            if state.is_cancelled() {
                return Err(LumenError::DownloadFailed(format!(
                    "{}: cancelled",
                    model.id
                )));
            }
            let url = format!("{}/{}", root, rel);
            let response = self.transport.fetch(&url, None)?;
            match response.status {
                200 => {
                    let dest = model_dir.join(rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let file = File::create(&dest)?;
                    copy_with_cancel(response.reader, file, state)?;
                    state.file_done();
                }
                404 => {
                    // Optional file for this variant; skip, still counts
                    // toward progress so the fraction reaches 1.0.
                    log::info!("optional file missing (404), skipping: {}", url);
                    state.file_done();
                }
                status => {
                    return Err(LumenError::DownloadFailed(format!(
                        "{}: HTTP {}",
                        url, status
                    )));
                }
            }
        }

        Ok(model_dir)
    }
}

/// Stream `reader` into `writer` in chunks, honoring cancellation between
/// chunks and accounting bytes into the task state.
fn copy_with_cancel(
    mut reader: Box<dyn Read + Send>,
    mut writer: impl Write,
    state: &TaskState,
) -> LumenResult<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        if state.is_cancelled() {
            return Err(LumenError::DownloadFailed("cancelled".into()));
        }
        let n = reader.read(&mut buf).map_err(LumenError::Io)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        state.add_bytes(n as u64);
    }
    writer.flush()?;
    Ok(())
}

/// Verify a file against a hex-encoded SHA-256 checksum.
pub fn verify_sha256(path: &Path, expected_hex: &str) -> LumenResult<()> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let actual = hex_encode(&hasher.finalize());
    if actual.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(LumenError::ValidationFailed(format!(
            "checksum mismatch: expected {}, got {}",
            expected_hex, actual
        )))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Framework;
    use crate::registry::ModelFormat;
    use crate::testing::MockTransport;
    use tempfile::TempDir;

    fn gguf(url: &str) -> ModelInfo {
        ModelInfo::new("phi-3-mini", "Phi 3 Mini", ModelFormat::Gguf, Framework::LlamaCpp)
            .with_download_url(url)
    }

    fn whisper(url: &str) -> ModelInfo {
        ModelInfo::new(
            "whisper-tiny",
            "Whisper Tiny",
            ModelFormat::WhisperBundle,
            Framework::WhisperKit,
        )
        .with_download_url(url)
    }

    #[test]
    fn single_file_download_writes_and_renames() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.on("https://models.test/phi-3-mini.gguf", 200, b"weights");
        let manager = DownloadManager::new(Arc::new(transport));

        let state = TaskState::default();
        let path = manager
            .download(&gguf("https://models.test/phi-3-mini.gguf"), dir.path(), &state)
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"weights");
        assert_eq!(state.progress().fraction, 1.0);
        assert!(path.ends_with("phi-3-mini/phi-3-mini.gguf"));
    }

    #[test]
    fn single_file_404_fails_the_task() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.on("https://models.test/phi-3-mini.gguf", 404, b"");
        let manager = DownloadManager::new(Arc::new(transport));

        let err = manager
            .download(&gguf("https://models.test/phi-3-mini.gguf"), dir.path(), &TaskState::default())
            .unwrap_err();
        assert!(matches!(err, LumenError::DownloadFailed(_)));
    }

    #[test]
    fn checksum_mismatch_is_validation_failure() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.on("https://models.test/phi-3-mini.gguf", 200, b"weights");
        let manager = DownloadManager::new(Arc::new(transport));

        let model = gguf("https://models.test/phi-3-mini.gguf")
            .with_checksum("00".repeat(32));
        let err = manager
            .download(&model, dir.path(), &TaskState::default())
            .unwrap_err();
        assert!(matches!(err, LumenError::ValidationFailed(_)));
    }

    #[test]
    fn checksum_match_passes() {
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(b"weights");
            hex_encode(&hasher.finalize())
        };

        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.on("https://models.test/phi-3-mini.gguf", 200, b"weights");
        let manager = DownloadManager::new(Arc::new(transport));

        let model = gguf("https://models.test/phi-3-mini.gguf").with_checksum(digest);
        assert!(manager
            .download(&model, dir.path(), &TaskState::default())
            .is_ok());
    }

    #[test]
    fn alternate_url_is_tried_after_primary_failure() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.on("https://primary.test/phi-3-mini.gguf", 500, b"");
        transport.on("https://mirror.test/phi-3-mini.gguf", 200, b"weights");
        let manager = DownloadManager::new(Arc::new(transport));

        let mut model = gguf("https://primary.test/phi-3-mini.gguf");
        model.alternate_urls = vec!["https://mirror.test/phi-3-mini.gguf".into()];
        let path = manager
            .download(&model, dir.path(), &TaskState::default())
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"weights");
    }

    #[test]
    fn directory_download_skips_404_files() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        // The short id in the catalog URL maps to the canonical remote dir.
        let root = "https://models.test/openai_whisper-tiny";
        transport.on(&format!("{}/config.json", root), 200, b"{}");
        transport.on(&format!("{}/model.safetensors", root), 200, b"tensors");
        transport.on(&format!("{}/tokenizer.json", root), 404, b"");
        transport.on(&format!("{}/generation_config.json", root), 200, b"{}");
        transport.on(&format!("{}/preprocessor_config.json", root), 200, b"{}");
        let manager = DownloadManager::new(Arc::new(transport));

        let state = TaskState::default();
        let model_dir = manager
            .download(&whisper("https://models.test/whisper-tiny"), dir.path(), &state)
            .unwrap();

        assert!(model_dir.join("config.json").exists());
        assert!(model_dir.join("model.safetensors").exists());
        assert!(!model_dir.join("tokenizer.json").exists());
        assert_eq!(state.progress().fraction, 1.0);
    }

    #[test]
    fn directory_download_aborts_on_server_error() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let root = "https://models.test/openai_whisper-tiny";
        transport.on(&format!("{}/config.json", root), 200, b"{}");
        transport.on(&format!("{}/model.safetensors", root), 500, b"");
        let manager = DownloadManager::new(Arc::new(transport));

        let err = manager
            .download(
                &whisper("https://models.test/whisper-tiny"),
                dir.path(),
                &TaskState::default(),
            )
            .unwrap_err();
        assert!(matches!(err, LumenError::DownloadFailed(_)));
    }

    #[test]
    fn progress_is_file_count_based() {
        let state = TaskState::default();
        state.begin(4);
        state.file_done();
        let progress = state.progress();
        assert_eq!(progress.files_completed, 1);
        assert_eq!(progress.total_files, 4);
        assert!((progress.fraction - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn cancellation_aborts_between_files() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let root = "https://models.test/whisper-tiny";
        transport.on(&format!("{}/config.json", root), 200, b"{}");
        let manager = DownloadManager::new(Arc::new(transport));

        let state = TaskState::default();
        state.cancel();
        let err = manager.download(&whisper(root), dir.path(), &state).unwrap_err();
        assert!(matches!(err, LumenError::DownloadFailed(_)));
    }
}
