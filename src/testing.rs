//! In-crate test doubles.

use crate::assistant::mic::MicMonitor;
use crate::audio::capture::{AudioSource, CaptureDevice};
use crate::audio::sink::{BufferedPlayer, SinkSession, StreamingSink};
use crate::client::connection::{Connector, DuplexLink, Inbound};
use crate::error::BridgeError;
use crate::speech::{AudioByteStream, SpeechSynthesizer};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use tokio::sync::Notify;
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub(crate) fn init_test_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(Level::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Ordered log shared between test doubles.
#[derive(Clone, Default)]
pub(crate) struct Timeline(Arc<StdMutex<Vec<String>>>);

impl Timeline {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Late-bound view of a microphone. Sources opened by [`ScriptedCapture`]
/// attach the monitor of whichever run opened them.
#[derive(Clone, Default)]
pub(crate) struct MicProbe(Arc<StdMutex<Option<MicMonitor>>>);

impl MicProbe {
    pub(crate) fn attach(&self, monitor: MicMonitor) {
        *self.0.lock().unwrap() = Some(monitor);
    }

    pub(crate) fn is_muted(&self) -> bool {
        self.0.lock().unwrap().as_ref().is_some_and(|m| m.is_muted())
    }

    pub(crate) fn transitions(&self) -> u64 {
        self.0.lock().unwrap().as_ref().map_or(0, |m| m.transitions())
    }
}

impl From<MicMonitor> for MicProbe {
    fn from(monitor: MicMonitor) -> Self {
        let probe = MicProbe::default();
        probe.attach(monitor);
        probe
    }
}

// ---- Link ----

#[derive(Default)]
pub(crate) struct MockLink {
    sent: StdMutex<Vec<String>>,
    inbound: StdMutex<VecDeque<Inbound>>,
    inbound_ready: Notify,
    fail_sends: AtomicBool,
    answer_pings: AtomicBool,
    fail_recv: AtomicBool,
    closes: AtomicUsize,
}

impl MockLink {
    pub(crate) fn push_inbound(&self, frame: Inbound) {
        self.inbound.lock().unwrap().push_back(frame);
        self.inbound_ready.notify_one();
    }

    pub(crate) fn push_text(&self, text: &str) {
        self.push_inbound(Inbound::Text(text.to_string()));
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// The next `recv` reports a transport error.
    pub(crate) fn fail_next_recv(&self) {
        self.fail_recv.store(true, Ordering::SeqCst);
        self.inbound_ready.notify_one();
    }

    pub(crate) fn answer_pings(&self) {
        self.answer_pings.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// The `type` field of every frame sent on this link.
    pub(crate) fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|raw| {
                serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_string))
                    .unwrap_or_default()
            })
            .collect()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl DuplexLink for MockLink {
    async fn send_text(&self, text: String) -> Result<(), BridgeError> {
        if self.fail_sends.load(Ordering::SeqCst) || self.is_closed() {
            return Err(BridgeError::SendError);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Inbound, BridgeError>> {
        loop {
            if self.fail_recv.swap(false, Ordering::SeqCst) {
                return Some(Err(BridgeError::ConnectionError("connection reset".to_string())));
            }
            if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
                return Some(Ok(frame));
            }
            if self.is_closed() {
                return None;
            }
            self.inbound_ready.notified().await;
        }
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::SendError);
        }
        if self.answer_pings.load(Ordering::SeqCst) {
            self.push_inbound(Inbound::Pong);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inbound_ready.notify_one();
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    links: StdMutex<Vec<Arc<MockLink>>>,
    opens: AtomicU32,
    fail_remaining: AtomicU32,
    next_inbound: StdMutex<Vec<Inbound>>,
    link_ready: Notify,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next_opens(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub(crate) fn queue_inbound_for_next_link(&self, frames: Vec<Inbound>) {
        *self.next_inbound.lock().unwrap() = frames;
    }

    pub(crate) fn open_attempts(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub(crate) fn link(&self, index: usize) -> Arc<MockLink> {
        self.links.lock().unwrap()[index].clone()
    }

    /// Waits until at least `count` links have been opened.
    pub(crate) async fn wait_for_links(&self, count: usize) -> Arc<MockLink> {
        loop {
            let notified = self.link_ready.notified();
            if self.link_count() >= count {
                return self.link(count - 1);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Arc<dyn DuplexLink>, BridgeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::ConnectionError("scripted failure".to_string()));
        }
        let link = Arc::new(MockLink::default());
        for frame in std::mem::take(&mut *self.next_inbound.lock().unwrap()) {
            link.push_inbound(frame);
        }
        self.links.lock().unwrap().push(link.clone());
        self.link_ready.notify_waiters();
        Ok(link)
    }
}

// ---- Speech ----

pub(crate) struct RecordingSynth {
    timeline: Timeline,
    mic: MicProbe,
    requests: StdMutex<Vec<String>>,
    failing: StdMutex<HashSet<String>>,
}

impl RecordingSynth {
    pub(crate) fn new(timeline: Timeline, mic: impl Into<MicProbe>) -> Self {
        Self {
            timeline,
            mic: mic.into(),
            requests: StdMutex::new(Vec::new()),
            failing: StdMutex::new(HashSet::new()),
        }
    }

    pub(crate) fn fail_on(&self, text: &str) {
        self.failing.lock().unwrap().insert(text.to_string());
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynth {
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream, BridgeError> {
        self.requests.lock().unwrap().push(text.to_string());
        if self.failing.lock().unwrap().contains(text) {
            return Err(BridgeError::Synthesis("scripted failure".to_string()));
        }
        self.timeline
            .push(format!("synth {} muted={}", text, self.mic.is_muted()));
        let chunks: Vec<Result<Bytes, BridgeError>> = vec![
            Ok(Bytes::from_static(b"audio:")),
            Ok(Bytes::from(text.as_bytes().to_vec())),
        ];
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

/// Streaming sink that records what it is fed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    unavailable: bool,
    fail_marker: Option<String>,
    timeline: Timeline,
    mic: MicProbe,
    aborted: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub(crate) fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Fails a write once the streamed bytes contain `marker`.
    pub(crate) fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn with_timeline(mut self, timeline: Timeline, mic: impl Into<MicProbe>) -> Self {
        self.timeline = timeline;
        self.mic = mic.into();
        self
    }

    pub(crate) fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingSink for RecordingSink {
    async fn open(&self) -> Result<Box<dyn SinkSession>, BridgeError> {
        if self.unavailable {
            return Err(BridgeError::SinkUnavailable("scripted".to_string()));
        }
        Ok(Box::new(RecordingSession {
            buffer: Vec::new(),
            fail_marker: self.fail_marker.clone(),
            timeline: self.timeline.clone(),
            muted: self.mic.is_muted(),
            aborted: self.aborted.clone(),
        }))
    }
}

struct RecordingSession {
    buffer: Vec<u8>,
    fail_marker: Option<String>,
    timeline: Timeline,
    muted: bool,
    aborted: Arc<AtomicUsize>,
}

#[async_trait]
impl SinkSession for RecordingSession {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), BridgeError> {
        self.buffer.extend_from_slice(chunk);
        if let Some(marker) = &self.fail_marker {
            if String::from_utf8_lossy(&self.buffer).contains(marker.as_str()) {
                return Err(BridgeError::Playback("scripted sink failure".to_string()));
            }
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), BridgeError> {
        let text = String::from_utf8_lossy(&self.buffer);
        self.timeline.push(format!(
            "stream {} muted={}",
            text.trim_start_matches("audio:"),
            self.muted
        ));
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct RecordingPlayer {
    timeline: Timeline,
    mic: MicProbe,
    played: StdMutex<Vec<Vec<u8>>>,
}

impl RecordingPlayer {
    pub(crate) fn new(timeline: Timeline, mic: impl Into<MicProbe>) -> Self {
        Self {
            timeline,
            mic: mic.into(),
            played: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl BufferedPlayer for RecordingPlayer {
    async fn play(&self, audio: &[u8]) -> Result<(), BridgeError> {
        let text = String::from_utf8_lossy(audio);
        self.timeline.push(format!(
            "buffered {} muted={}",
            text.trim_start_matches("audio:"),
            self.mic.is_muted()
        ));
        self.played.lock().unwrap().push(audio.to_vec());
        Ok(())
    }
}

// ---- Capture ----

/// Capture device whose sources replay a script, then repeat a fixed block
/// forever (or pend, when no block is set).
#[derive(Clone)]
pub(crate) struct ScriptedCapture {
    sample_rate: u32,
    channels: u16,
    script: Arc<StdMutex<VecDeque<Result<Vec<i16>, BridgeError>>>>,
    repeat: Option<Vec<i16>>,
    opens: Arc<AtomicU32>,
    discards: Arc<AtomicU32>,
    probe: MicProbe,
}

impl ScriptedCapture {
    pub(crate) fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            script: Arc::new(StdMutex::new(VecDeque::new())),
            repeat: None,
            opens: Arc::new(AtomicU32::new(0)),
            discards: Arc::new(AtomicU32::new(0)),
            probe: MicProbe::default(),
        }
    }

    pub(crate) fn with_probe(mut self, probe: MicProbe) -> Self {
        self.probe = probe;
        self
    }

    pub(crate) fn repeating(mut self, block: Vec<i16>) -> Self {
        self.repeat = Some(block);
        self
    }

    pub(crate) fn push(&self, block: Result<Vec<i16>, BridgeError>) {
        self.script.lock().unwrap().push_back(block);
    }

    pub(crate) fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn discards(&self) -> u32 {
        self.discards.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for ScriptedCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn open(&self, mic: MicMonitor) -> Result<Box<dyn AudioSource>, BridgeError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.attach(mic);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl AudioSource for ScriptedCapture {
    async fn read_chunk(&mut self) -> Result<Vec<i16>, BridgeError> {
        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(block), _) => block,
            (None, Some(block)) => Ok(block.clone()),
            (None, None) => std::future::pending().await,
        }
    }

    fn discard_pending(&mut self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }
}
