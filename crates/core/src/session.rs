//! Inference sessions and the factory that creates them.
//!
//! A session owns exactly one engine handle from a successful `init` until
//! [`InferenceSession::release`]. `process` calls hold a shared claim on the
//! session state for as long as their compute job runs (including when the
//! caller stops awaiting), and `release` takes the exclusive claim, so a
//! handle is never disposed while the engine is still using it.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use image::{ImageError, ImageReader};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assembler::{self, CanonicalImage};
use crate::assets::{self, AssetSource};
use crate::engine::{EngineHandle, EngineInitParams, InferenceEngine};
use crate::error::{Error, Result};
use crate::inference_config::InferenceConfig;
use crate::scheduler::ComputeScheduler;

/// Creates sessions against one engine, one compute pool and one model root.
#[derive(Clone)]
pub struct Upscaler {
    engine: Arc<dyn InferenceEngine>,
    scheduler: Arc<ComputeScheduler>,
    model_root: PathBuf,
}

impl Upscaler {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        scheduler: Arc<ComputeScheduler>,
        model_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            model_root: model_root.into(),
        }
    }

    pub fn model_root(&self) -> &Path {
        &self.model_root
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Materializes the variant's model files, then initialises the engine.
    /// No session exists unless both steps succeed.
    pub async fn create_session(
        &self,
        config: InferenceConfig,
        assets: Arc<dyn AssetSource>,
    ) -> Result<InferenceSession> {
        let variant = config.variant();
        let model_root = self.model_root.clone();
        blocking("materialize model assets", move || {
            assets::materialize(assets.as_ref(), variant, &model_root)
        })
        .await??;

        let params = EngineInitParams {
            model_root: self.model_root.clone(),
            model_dir: variant.dir().to_string(),
            denoise: config.denoise(),
            scale: config.scale(),
            sync_gap: variant.effective_sync_gap(config.sync_gap()),
            augment: config.augment(),
            device: config.device(),
        };
        let engine = Arc::clone(&self.engine);
        let init = blocking("initialise engine", move || {
            let status = engine.init(&params);
            EngineHandle::from_status(status)
                .map(|handle| PendingHandle {
                    engine,
                    handle,
                    claimed: false,
                })
                .ok_or(status)
        })
        .await?;
        let handle = match init {
            Ok(pending) => pending.claim(),
            Err(status) => {
                error!(
                    engine = self.engine.name(),
                    variant = %variant,
                    status,
                    "Engine initialisation failed"
                );
                return Err(Error::EngineInit { status });
            }
        };

        let id = Uuid::new_v4();
        let reentrant = self.engine.is_reentrant();
        info!(
            session = %id,
            %handle,
            engine = self.engine.name(),
            variant = %variant,
            scale = config.scale(),
            denoise = config.denoise(),
            device = config.device(),
            reentrant,
            "Session ready"
        );

        Ok(InferenceSession {
            id,
            config,
            engine: Arc::clone(&self.engine),
            scheduler: Arc::clone(&self.scheduler),
            state: Arc::new(RwLock::new(SessionState::Ready(handle))),
            compute_lock: (!reentrant).then(|| Arc::new(Mutex::new(()))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ready(EngineHandle),
    Released,
}

pub struct InferenceSession {
    id: Uuid,
    config: InferenceConfig,
    engine: Arc<dyn InferenceEngine>,
    scheduler: Arc<ComputeScheduler>,
    state: Arc<RwLock<SessionState>>,
    /// Present when the engine cannot run `compute` concurrently on one handle.
    compute_lock: Option<Arc<Mutex<()>>>,
}

impl InferenceSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn scale(&self) -> u32 {
        self.config.scale().unsigned_abs()
    }

    /// The live handle, or `None` once released.
    pub async fn handle(&self) -> Option<EngineHandle> {
        match *self.state.read().await {
            SessionState::Ready(handle) => Some(handle),
            SessionState::Released => None,
        }
    }

    pub async fn is_released(&self) -> bool {
        self.handle().await.is_none()
    }

    /// Upscales one compressed image into a `(w * scale) × (h * scale)` RGBA
    /// image. Per-call failures leave the session usable.
    pub async fn process(&self, image: Vec<u8>) -> Result<CanonicalImage> {
        let state = Arc::clone(&self.state).read_owned().await;
        let SessionState::Ready(handle) = *state else {
            return Err(Error::SessionClosed);
        };

        let started = Instant::now();
        let ((src_w, src_h), image) =
            blocking("decode image header", move || decode_dimensions(&image).map(|d| (d, image)))
                .await??;
        let (out_w, out_h) = output_dimensions(src_w, src_h, self.scale())?;
        debug!(session = %self.id, %handle, src_w, src_h, out_w, out_h, "Processing image");

        let serial = match &self.compute_lock {
            Some(lock) => Some(Arc::clone(lock).lock_owned().await),
            None => None,
        };
        let engine = Arc::clone(&self.engine);
        let raw = self
            .scheduler
            .run(move || compute_job(engine, state, serial, handle, image))
            .await?;

        let canonical = blocking("assemble pixel buffer", move || {
            assembler::assemble(raw, out_w, out_h)
        })
        .await??;

        info!(
            session = %self.id,
            width = out_w,
            height = out_h,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscaled image ready"
        );
        Ok(canonical)
    }

    /// Disposes the engine handle once all in-flight `process` calls have
    /// finished. Calling it again is a no-op.
    pub async fn release(&self) {
        let mut state = self.state.write().await;
        let SessionState::Ready(handle) = *state else {
            return;
        };
        *state = SessionState::Released;

        let engine = Arc::clone(&self.engine);
        if let Err(err) = blocking("dispose engine handle", move || engine.dispose(handle)).await {
            error!(session = %self.id, %handle, error = %err, "Engine dispose did not complete");
            return;
        }
        info!(session = %self.id, %handle, "Session released");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DropCheck {
    Released,
    Leaked(EngineHandle),
    Contended,
}

impl InferenceSession {
    fn drop_check(&self) -> DropCheck {
        match self.state.try_read() {
            Ok(state) => match *state {
                SessionState::Ready(handle) => DropCheck::Leaked(handle),
                SessionState::Released => DropCheck::Released,
            },
            Err(_) => DropCheck::Contended,
        }
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        match self.drop_check() {
            DropCheck::Released => {}
            DropCheck::Leaked(handle) => error!(
                session = %self.id,
                %handle,
                "Session dropped without release; engine handle leaked"
            ),
            DropCheck::Contended => error!(
                session = %self.id,
                "Session dropped without release while its state was locked; engine handle leaked"
            ),
        }
    }
}

/// A handle returned by `init` that no session owns yet. If `create_session`
/// is abandoned while `init` runs, the blocking task drops this and the
/// handle is disposed instead of leaking.
struct PendingHandle {
    engine: Arc<dyn InferenceEngine>,
    handle: EngineHandle,
    claimed: bool,
}

impl PendingHandle {
    fn claim(mut self) -> EngineHandle {
        self.claimed = true;
        self.handle
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if !self.claimed {
            warn!(handle = %self.handle, "Session creation abandoned; disposing engine handle");
            self.engine.dispose(self.handle);
        }
    }
}

fn output_dimensions(src_w: u32, src_h: u32, scale: u32) -> Result<(u32, u32)> {
    match (src_w.checked_mul(scale), src_h.checked_mul(scale)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(Error::EngineCompute {
            reason: format!("output size of {src_w}x{src_h} at x{scale} overflows"),
        }),
    }
}

fn compute_job(
    engine: Arc<dyn InferenceEngine>,
    _state: OwnedRwLockReadGuard<SessionState>,
    _serial: Option<OwnedMutexGuard<()>>,
    handle: EngineHandle,
    image: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    engine.compute(handle, &image)
}

fn decode_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| Error::Decode(ImageError::IoError(err)))?
        .into_dimensions()
        .map_err(Error::Decode)
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Internal(format!("{what}: task join error: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;
    use image::{DynamicImage, ImageFormat, RgbImage};

    use super::*;
    use crate::assets::MemoryAssetSource;
    use crate::scheduler::ComputeConfig;
    use crate::variant::ModelVariant;

    /// Returns `channels` bytes per output pixel, records concurrency and
    /// fails the first `failing_computes` calls.
    struct FakeEngine {
        status: i64,
        reentrant: bool,
        delay: Duration,
        init_delay: Duration,
        channels: usize,
        failing_computes: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        disposed: AtomicUsize,
        last_init: std::sync::Mutex<Option<EngineInitParams>>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                status: 1,
                reentrant: true,
                delay: Duration::ZERO,
                init_delay: Duration::ZERO,
                channels: 4,
                failing_computes: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
                last_init: std::sync::Mutex::new(None),
            }
        }
    }

    impl InferenceEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        fn init(&self, params: &EngineInitParams) -> i64 {
            *self.last_init.lock().unwrap() = Some(params.clone());
            std::thread::sleep(self.init_delay);
            self.status
        }

        fn compute(&self, _handle: EngineHandle, image: &[u8]) -> anyhow::Result<Vec<u8>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failing_computes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                bail!("kernel failed");
            }
            let (w, h) = decode_dimensions(image)?;
            Ok(vec![7; (w * 2 * h * 2) as usize * self.channels])
        }

        fn dispose(&self, _handle: EngineHandle) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_reentrant(&self) -> bool {
            self.reentrant
        }
    }

    fn png(w: u32, h: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn assets() -> Arc<dyn AssetSource> {
        Arc::new(
            MemoryAssetSource::new()
                .with_file("models-se", "up2x-conservative.param", b"p".to_vec())
                .with_file("models-se", "up2x-conservative.bin", b"b".to_vec())
                .with_file("models-nose", "up2x-no-denoise.param", b"p".to_vec())
                .with_file("models-nose", "up2x-no-denoise.bin", b"b".to_vec()),
        )
    }

    fn upscaler(engine: Arc<FakeEngine>, root: &Path) -> Upscaler {
        let scheduler = ComputeScheduler::new(ComputeConfig {
            max_threads: 4,
            priority_boost: false,
        })
        .unwrap();
        Upscaler::new(engine, Arc::new(scheduler), root)
    }

    #[tokio::test]
    async fn create_passes_config_to_engine() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let upscaler = upscaler(Arc::clone(&engine), root.path());

        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();
        assert_eq!(session.handle().await.map(EngineHandle::raw), Some(1));
        assert!(root.path().join("models-se/up2x-conservative.bin").is_file());

        let params = engine.last_init.lock().unwrap().clone().unwrap();
        assert_eq!(params.model_root, root.path());
        assert_eq!(params.model_dir, "models-se");
        assert_eq!((params.scale, params.denoise, params.sync_gap), (2, -1, 3));
        assert_eq!((params.device, params.augment), (0, false));
        session.release().await;
    }

    #[tokio::test]
    async fn nose_runs_without_sync_gap() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let config = InferenceConfig::new(ModelVariant::Nose, 2, 0, 3, 0, false).unwrap();

        let session = upscaler.create_session(config, assets()).await.unwrap();
        let params = engine.last_init.lock().unwrap().clone().unwrap();
        assert_eq!(params.sync_gap, 0);
        assert_eq!(session.config().sync_gap(), 3);
        session.release().await;
    }

    #[tokio::test]
    async fn init_status_below_one_yields_no_session() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            status: 0,
            ..FakeEngine::new()
        });
        let upscaler = upscaler(engine, root.path());
        let err = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::EngineInit { status: 0 }));
    }

    #[tokio::test]
    async fn missing_assets_abort_before_init() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let config = InferenceConfig::new(ModelVariant::Pro, 2, -1, 3, 0, false).unwrap();

        let err = upscaler.create_session(config, assets()).await.err().unwrap();
        assert!(matches!(err, Error::AssetMaterialization(_)));
        assert!(engine.last_init.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn process_scales_dimensions() {
        let root = tempfile::tempdir().unwrap();
        let upscaler = upscaler(Arc::new(FakeEngine::new()), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        let image = session.process(png(10, 6)).await.unwrap();
        assert_eq!((image.width(), image.height()), (20, 12));
        assert_eq!(image.as_bytes().len(), 20 * 12 * 4);
        session.release().await;
    }

    #[tokio::test]
    async fn decode_failure_keeps_session_ready() {
        let root = tempfile::tempdir().unwrap();
        let upscaler = upscaler(Arc::new(FakeEngine::new()), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        let err = session.process(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{err:?}");
        assert!(!session.is_released().await);
        assert!(session.process(png(2, 2)).await.is_ok());
        session.release().await;
    }

    #[tokio::test]
    async fn release_is_idempotent_and_closes_session() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        session.release().await;
        session.release().await;
        assert_eq!(engine.disposed.load(Ordering::SeqCst), 1);
        assert!(session.is_released().await);
        assert!(matches!(
            session.process(png(2, 2)).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reentrant_engine_runs_calls_concurrently() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            delay: Duration::from_millis(100),
            ..FakeEngine::new()
        });
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            session.process(png(4, 4)),
            session.process(png(4, 4)),
            session.process(png(4, 4)),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(engine.max_active.load(Ordering::SeqCst) > 1);
        session.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn non_reentrant_engine_is_serialized() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            reentrant: false,
            delay: Duration::from_millis(20),
            ..FakeEngine::new()
        });
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            session.process(png(4, 4)),
            session.process(png(4, 4)),
            session.process(png(4, 4)),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
        session.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_waits_for_in_flight_compute() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            delay: Duration::from_millis(150),
            ..FakeEngine::new()
        });
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let session = Arc::new(
            upscaler
                .create_session(InferenceConfig::default(), assets())
                .await
                .unwrap(),
        );

        let worker = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.process(png(4, 4)).await })
        };
        while engine.active.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        session.release().await;
        assert_eq!(engine.active.load(Ordering::SeqCst), 0);
        assert_eq!(engine.disposed.load(Ordering::SeqCst), 1);
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn compute_failure_keeps_session_ready() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            failing_computes: AtomicUsize::new(1),
            ..FakeEngine::new()
        });
        let upscaler = upscaler(Arc::clone(&engine), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();

        let err = session.process(png(4, 4)).await.unwrap_err();
        assert!(
            matches!(err, Error::EngineCompute { ref reason } if reason.contains("kernel failed")),
            "{err:?}"
        );
        assert!(!session.is_released().await);

        let image = session.process(png(4, 4)).await.unwrap();
        assert_eq!((image.width(), image.height()), (8, 8));
        session.release().await;
        assert_eq!(engine.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_dimensions_reject_overflow() {
        assert_eq!(output_dimensions(100, 80, 4).unwrap(), (400, 320));
        let err = output_dimensions(u32::MAX / 2 + 1, 1, 2).unwrap_err();
        assert!(matches!(err, Error::EngineCompute { ref reason } if reason.contains("overflows")));
        assert!(output_dimensions(1, u32::MAX, 3).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_creation_disposes_initialised_handle() {
        let root = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            init_delay: Duration::from_millis(100),
            ..FakeEngine::new()
        });
        let upscaler = upscaler(Arc::clone(&engine), root.path());

        let creating = tokio::spawn(async move {
            upscaler
                .create_session(InferenceConfig::default(), assets())
                .await
        });
        while engine.last_init.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        creating.abort();
        assert!(creating.await.err().unwrap().is_cancelled());

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.disposed.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "abandoned handle was never disposed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_check_reports_leak_while_compute_holds_state() {
        let root = tempfile::tempdir().unwrap();
        let upscaler = upscaler(Arc::new(FakeEngine::new()), root.path());
        let session = upscaler
            .create_session(InferenceConfig::default(), assets())
            .await
            .unwrap();
        let handle = session.handle().await.unwrap();

        let in_flight = Arc::clone(&session.state).read_owned().await;
        assert_eq!(session.drop_check(), DropCheck::Leaked(handle));
        drop(in_flight);

        let writer = session.state.write().await;
        assert_eq!(session.drop_check(), DropCheck::Contended);
        drop(writer);

        session.release().await;
        assert_eq!(session.drop_check(), DropCheck::Released);
    }
}
