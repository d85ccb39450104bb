use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Local, NaiveDate, NaiveDateTime};
use image::RgbImage;
use rollcall_core::{
    encode_jpeg, Annotator, BoundingBox, CosineMatcher, FaceEncoder, Gallery, LumaImage,
    MatchResult, PipelineError,
};
use rollcall_hw::{Frame, FrameSession, FrameSource};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

/// Pause before reopening the camera after a capture failure.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Latest output of the live stream, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSlot {
    /// No frame has been produced for the current viewers yet.
    Pending,
    /// An annotated JPEG frame.
    Jpeg(Bytes),
    /// Capture failed; open streams should end.
    Ended,
}

/// One face found in a submitted image and how it matched the gallery.
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

#[derive(Debug, Clone, Default)]
pub struct Recognition {
    /// Faces in detection order.
    pub faces: Vec<RecognizedFace>,
}

impl Recognition {
    /// Identity of the first face that matched the gallery.
    pub fn first_match(&self) -> Option<&str> {
        self.faces.iter().find_map(|f| f.result.identity.as_deref())
    }
}

/// An identity recognized in the live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub identity: String,
    pub at: NaiveDateTime,
}

/// Async face recognition for submitted images.
#[async_trait]
pub trait FaceIdentifier: Send + Sync {
    async fn recognize(&self, image: RgbImage) -> Result<Recognition, EngineError>;
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Recognize {
        image: RgbImage,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

#[async_trait]
impl FaceIdentifier for EngineHandle {
    async fn recognize(&self, image: RgbImage) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Identities already reported on the current local day.
#[derive(Debug, Default)]
struct DailySeen {
    day: Option<NaiveDate>,
    names: HashSet<String>,
}

impl DailySeen {
    /// True the first time `name` is seen on `today`. Clears on date change.
    fn first_today(&mut self, name: &str, today: NaiveDate) -> bool {
        if self.day != Some(today) {
            self.names.clear();
            self.day = Some(today);
        }
        self.names.insert(name.to_string())
    }
}

/// Encoder, gallery and annotation state owned by the engine thread.
pub struct LiveRecognizer<E> {
    encoder: E,
    gallery: Gallery,
    threshold: f32,
    matcher: CosineMatcher,
    annotator: Annotator,
    jpeg_quality: u8,
    seen: DailySeen,
}

impl<E: FaceEncoder> LiveRecognizer<E> {
    pub fn new(
        encoder: E,
        gallery: Gallery,
        threshold: f32,
        annotator: Annotator,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            encoder,
            gallery,
            threshold,
            matcher: CosineMatcher,
            annotator,
            jpeg_quality,
            seen: DailySeen::default(),
        }
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.len()
    }

    fn identify(&mut self, luma: &LumaImage<'_>) -> Result<Recognition, PipelineError> {
        let faces = self.encoder.encode_faces(luma)?;
        let faces = faces
            .into_iter()
            .map(|face| RecognizedFace {
                result: self.gallery.identify(&face.embedding, &self.matcher, self.threshold),
                bbox: face.bbox,
            })
            .collect();
        Ok(Recognition { faces })
    }

    /// Recognize every face in a submitted image.
    pub fn recognize(&mut self, image: &RgbImage) -> Result<Recognition, EngineError> {
        let luma = rollcall_hw::frame::rgb_to_grayscale(image);
        let recognition = self.identify(&LumaImage::new(&luma, image.width(), image.height()))?;
        tracing::debug!(
            faces = recognition.faces.len(),
            top_confidence = ?recognition.faces.first().map(|f| f.bbox.confidence),
            matched = ?recognition.first_match(),
            "submitted image recognized"
        );
        Ok(recognition)
    }

    /// Annotate a live frame and encode it as JPEG.
    ///
    /// Returns the JPEG together with the identities recognized for the
    /// first time on `now`'s date. Dark frames are streamed without running
    /// recognition.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        now: NaiveDateTime,
    ) -> Result<(Bytes, Vec<String>), EngineError> {
        let mut canvas = frame.rgb.clone();
        let mut fresh = Vec::new();

        if !frame.is_dark {
            match self.identify(&LumaImage::new(&frame.luma, frame.width, frame.height)) {
                Ok(recognition) => {
                    for face in &recognition.faces {
                        self.annotator.draw_face(
                            &mut canvas,
                            &face.bbox,
                            face.result.label(),
                            face.result.matched,
                        );
                        if let Some(identity) = face.result.identity.as_deref() {
                            if self.seen.first_today(identity, now.date()) {
                                fresh.push(identity.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, error = %e, "frame recognition failed")
                }
            }
        }

        let jpeg = encode_jpeg(&canvas, self.jpeg_quality)?;
        Ok((Bytes::from(jpeg), fresh))
    }
}

/// Running engine: the request handle plus the live frame channel.
pub struct Engine {
    pub handle: EngineHandle,
    /// `None` when the engine runs without a camera.
    pub frames: Option<Arc<watch::Sender<FrameSlot>>>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// With a camera, the thread reads frames only while at least one stream
/// viewer is subscribed to `frames`, and reports first sightings of the day
/// on `sightings`. Without one it only serves recognition requests.
pub fn spawn_engine<E, S>(
    live: LiveRecognizer<E>,
    camera: Option<S>,
    sightings: mpsc::Sender<Sighting>,
    idle_poll: Duration,
) -> Result<Engine, EngineError>
where
    E: FaceEncoder + Send + 'static,
    S: FrameSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let frames = camera
        .is_some()
        .then(|| Arc::new(watch::Sender::new(FrameSlot::Pending)));
    let thread_frames = frames.clone();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(camera = camera.is_some(), "engine thread started");
            match (camera, thread_frames) {
                (Some(camera), Some(frames)) => {
                    stream_loop(live, &camera, rx, &frames, &sightings, idle_poll)
                }
                _ => request_loop(live, rx),
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(Engine { handle: EngineHandle { tx }, frames })
}

fn handle_request<E: FaceEncoder>(live: &mut LiveRecognizer<E>, req: EngineRequest) {
    match req {
        EngineRequest::Recognize { image, reply } => {
            let _ = reply.send(live.recognize(&image));
        }
    }
}

fn request_loop<E: FaceEncoder>(mut live: LiveRecognizer<E>, mut rx: mpsc::Receiver<EngineRequest>) {
    while let Some(req) = rx.blocking_recv() {
        handle_request(&mut live, req);
    }
}

fn stream_loop<E: FaceEncoder, S: FrameSource>(
    mut live: LiveRecognizer<E>,
    camera: &S,
    mut rx: mpsc::Receiver<EngineRequest>,
    frames: &watch::Sender<FrameSlot>,
    sightings: &mpsc::Sender<Sighting>,
    idle_poll: Duration,
) {
    let mut session: Option<S::Session<'_>> = None;

    loop {
        loop {
            match rx.try_recv() {
                Ok(req) => handle_request(&mut live, req),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if frames.receiver_count() == 0 {
            if session.take().is_some() {
                tracing::info!("no stream viewers; capture session closed");
            }
            std::thread::sleep(idle_poll);
            continue;
        }

        if session.is_none() {
            match camera.open_session() {
                Ok(started) => {
                    tracing::info!(viewers = frames.receiver_count(), "capture session opened");
                    session = Some(started);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to start capture session");
                    frames.send_replace(FrameSlot::Ended);
                    std::thread::sleep(CAPTURE_RETRY_DELAY);
                    continue;
                }
            }
        }
        let Some(active) = session.as_mut() else { continue };

        let frame = match active.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "frame capture failed; ending stream");
                session = None;
                frames.send_replace(FrameSlot::Ended);
                std::thread::sleep(CAPTURE_RETRY_DELAY);
                continue;
            }
        };

        let now = Local::now().naive_local();
        match live.process_frame(&frame, now) {
            Ok((jpeg, fresh)) => {
                for identity in fresh {
                    tracing::info!(identity = %identity, "recognized in stream");
                    if sightings.blocking_send(Sighting { identity, at: now }).is_err() {
                        tracing::warn!("attendance recorder stopped; sighting dropped");
                    }
                }
                frames.send_replace(FrameSlot::Jpeg(jpeg));
            }
            Err(e) => tracing::warn!(sequence = frame.sequence, error = %e, "frame dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{DetectedFace, Embedding, GalleryEntry};
    use rollcall_hw::CameraError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One full-frame face per non-black frame; bright frames encode as
    /// `[1, 0]`, darker ones as `[0, 1]`.
    struct ToneEncoder;

    impl FaceEncoder for ToneEncoder {
        fn encode_faces(&mut self, frame: &LumaImage<'_>) -> Result<Vec<DetectedFace>, PipelineError> {
            let mean = frame.data.iter().map(|&p| p as f32).sum::<f32>() / frame.data.len() as f32;
            if mean == 0.0 {
                return Ok(Vec::new());
            }
            let values = if mean > 128.0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 1.0,
                    y: 1.0,
                    width: frame.width as f32 - 2.0,
                    height: frame.height as f32 - 2.0,
                    confidence: 0.9,
                    landmarks: None,
                },
                embedding: Embedding { values, model_version: None },
            }])
        }
    }

    fn live() -> LiveRecognizer<ToneEncoder> {
        let gallery = Gallery::new(vec![GalleryEntry {
            identity: "alice".into(),
            embedding: Embedding { values: vec![1.0, 0.0], model_version: None },
            source: PathBuf::from("known_faces/alice.jpg"),
        }]);
        LiveRecognizer::new(ToneEncoder, gallery, 0.4, Annotator::without_font(), 80)
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn frame(value: u8) -> Frame {
        Frame::from_rgb(RgbImage::from_pixel(32, 24, image::Rgb([value; 3])), 0)
    }

    #[test]
    fn test_recognize_submitted_image() {
        let mut live = live();
        let known = live.recognize(&RgbImage::from_pixel(16, 16, image::Rgb([220; 3]))).unwrap();
        assert_eq!(known.first_match(), Some("alice"));

        let stranger = live.recognize(&RgbImage::from_pixel(16, 16, image::Rgb([90; 3]))).unwrap();
        assert_eq!(stranger.faces.len(), 1);
        assert_eq!(stranger.first_match(), None);
        assert_eq!(stranger.faces[0].result.label(), "Unknown");

        let empty = live.recognize(&RgbImage::new(16, 16)).unwrap();
        assert!(empty.faces.is_empty());
    }

    #[test]
    fn test_first_match_skips_unknown_faces() {
        let unknown = RecognizedFace {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0, landmarks: None },
            result: MatchResult { matched: false, similarity: 0.1, identity: None },
        };
        let known = RecognizedFace {
            result: MatchResult { matched: true, similarity: 0.8, identity: Some("bob".into()) },
            ..unknown.clone()
        };
        let recognition = Recognition { faces: vec![unknown, known] };
        assert_eq!(recognition.first_match(), Some("bob"));
    }

    #[test]
    fn test_process_frame_reports_once_per_day() {
        let mut live = live();

        let (jpeg, fresh) = live.process_frame(&frame(220), at("2024-03-01", "09:00:00")).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(fresh, vec!["alice".to_string()]);

        let (_, fresh) = live.process_frame(&frame(220), at("2024-03-01", "09:05:00")).unwrap();
        assert!(fresh.is_empty());

        let (_, fresh) = live.process_frame(&frame(220), at("2024-03-02", "08:00:00")).unwrap();
        assert_eq!(fresh, vec!["alice".to_string()]);
    }

    #[test]
    fn test_process_frame_unknown_and_dark() {
        let mut live = live();
        let (_, fresh) = live.process_frame(&frame(90), at("2024-03-01", "09:00:00")).unwrap();
        assert!(fresh.is_empty());

        // Dark frames still stream but are not recognized.
        let (jpeg, fresh) = live.process_frame(&frame(5), at("2024-03-01", "09:00:01")).unwrap();
        assert!(!jpeg.is_empty());
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_daily_seen_resets_on_date_change() {
        let mut seen = DailySeen::default();
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(seen.first_today("alice", day1));
        assert!(!seen.first_today("alice", day1));
        assert!(seen.first_today("bob", day1));
        assert!(seen.first_today("alice", day2));
    }

    #[tokio::test]
    async fn test_engine_without_camera_serves_requests() {
        let (sight_tx, _sight_rx) = mpsc::channel(4);
        let engine =
            spawn_engine(live(), None::<ScriptedCamera>, sight_tx, Duration::from_millis(10))
                .unwrap();
        assert!(engine.frames.is_none());

        let recognition = engine
            .handle
            .recognize(RgbImage::from_pixel(16, 16, image::Rgb([220; 3])))
            .await
            .unwrap();
        assert_eq!(recognition.first_match(), Some("alice"));
    }

    #[derive(Default)]
    struct CaptureLog {
        opened: AtomicUsize,
        open: AtomicUsize,
        reads: AtomicUsize,
    }

    impl CaptureLog {
        fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    /// Yields bright frames; read number `fail_on_read` (1-based, counted
    /// across sessions) fails instead.
    struct ScriptedCamera {
        log: Arc<CaptureLog>,
        fail_on_read: Option<usize>,
    }

    impl ScriptedCamera {
        fn new(fail_on_read: Option<usize>) -> (Self, Arc<CaptureLog>) {
            let log = Arc::new(CaptureLog::default());
            (Self { log: log.clone(), fail_on_read }, log)
        }
    }

    struct ScriptedSession<'a> {
        camera: &'a ScriptedCamera,
    }

    impl Drop for ScriptedSession<'_> {
        fn drop(&mut self) {
            self.camera.log.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for ScriptedCamera {
        type Session<'a> = ScriptedSession<'a>;

        fn open_session(&self) -> Result<ScriptedSession<'_>, CameraError> {
            self.log.opened.fetch_add(1, Ordering::SeqCst);
            self.log.open.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedSession { camera: self })
        }
    }

    impl FrameSession for ScriptedSession<'_> {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            let n = self.camera.log.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.camera.fail_on_read {
                return Err(CameraError::CaptureFailed("scripted failure".into()));
            }
            Ok(Frame::from_rgb(RgbImage::from_pixel(32, 24, image::Rgb([220; 3])), n as u32))
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn next_slot(viewer: &mut watch::Receiver<FrameSlot>) -> FrameSlot {
        tokio::time::timeout(WAIT, viewer.changed())
            .await
            .expect("no frame published")
            .expect("engine stopped");
        viewer.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_stream_reads_camera_only_while_watched() {
        let (camera, log) = ScriptedCamera::new(None);
        let (sight_tx, mut sight_rx) = mpsc::channel(4);
        let engine = spawn_engine(live(), Some(camera), sight_tx, Duration::from_millis(5)).unwrap();
        let frames = engine.frames.clone().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(CaptureLog::get(&log.opened), 0);
        assert_eq!(CaptureLog::get(&log.reads), 0);

        let mut viewer = frames.subscribe();
        match next_slot(&mut viewer).await {
            FrameSlot::Jpeg(jpeg) => assert_eq!(&jpeg[..2], &[0xFF, 0xD8]),
            other => panic!("expected a JPEG frame, got {other:?}"),
        }
        let sighting = tokio::time::timeout(WAIT, sight_rx.recv()).await.unwrap().unwrap();
        assert_eq!(sighting.identity, "alice");

        // Last viewer leaving closes the session and stops reads.
        drop(viewer);
        wait_for(|| CaptureLog::get(&log.open) == 0).await;
        let reads = CaptureLog::get(&log.reads);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(CaptureLog::get(&log.reads), reads);
        assert_eq!(CaptureLog::get(&log.opened), 1);

        // Dropping the handle stops the thread, which closes the sightings channel.
        drop(engine);
        drop(frames);
        let closed = tokio::time::timeout(WAIT, sight_rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_capture_failure_ends_stream_then_recovers() {
        let (camera, log) = ScriptedCamera::new(Some(3));
        let (sight_tx, _sight_rx) = mpsc::channel(4);
        let engine = spawn_engine(live(), Some(camera), sight_tx, Duration::from_millis(5)).unwrap();
        let frames = engine.frames.clone().unwrap();

        let mut viewer = frames.subscribe();
        let ended = tokio::time::timeout(WAIT, async {
            loop {
                viewer.changed().await.unwrap();
                if *viewer.borrow_and_update() == FrameSlot::Ended {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "stream never ended after the capture failure");
        assert_eq!(CaptureLog::get(&log.open), 0);
        drop(viewer);

        let mut next_viewer = frames.subscribe();
        assert!(matches!(next_slot(&mut next_viewer).await, FrameSlot::Jpeg(_)));
        assert_eq!(CaptureLog::get(&log.opened), 2);
    }
}
