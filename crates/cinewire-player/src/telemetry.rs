//! Emotion telemetry router.
//!
//! Once playback starts, a fixed cadence decides where each captured sample
//! goes: the direct analysis channel when it is connected, the session
//! channel as a raw-frame relay when it is not, and a synthesized default
//! reading when neither a sample nor the direct channel is available. Every
//! reading produced on the direct path is also forwarded to the director so
//! it stays informed regardless of which path produced it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use cinewire_schema::{ClientMessage, EmotionReading};

use crate::frames::FrameSource;
use crate::{AnalysisChannel, DirectorPort};

pub(crate) struct TelemetryRouter {
    frames: Arc<dyn FrameSource>,
    analyzer: Arc<dyn AnalysisChannel>,
    director: Arc<dyn DirectorPort>,
    readings_tx: mpsc::Sender<EmotionReading>,
    interval: Duration,
}

/// Owned handle to a running telemetry cadence. Canceling (or dropping)
/// stops the loop and kills any in-flight classification so nothing stale
/// fires into a torn-down session.
pub(crate) struct RouterHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RouterHandle {
    pub fn cancel(self) {
        self.token.cancel();
        self.task.abort();
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

impl TelemetryRouter {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        analyzer: Arc<dyn AnalysisChannel>,
        director: Arc<dyn DirectorPort>,
        readings_tx: mpsc::Sender<EmotionReading>,
        interval: Duration,
    ) -> Self {
        Self {
            frames,
            analyzer,
            director,
            readings_tx,
            interval,
        }
    }

    pub fn spawn(self) -> RouterHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            self.run(loop_token).await;
        });
        RouterHandle { token, task }
    }

    async fn run(self, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::debug!("telemetry cadence stopped");
    }

    pub(crate) async fn tick(&self) {
        let sample = self.frames.capture_sample().await;
        match (sample, self.analyzer.is_connected()) {
            (Some(sample), true) => {
                let reading = self.analyzer.classify(&sample).await;
                self.deliver(reading).await;
            }
            (Some(sample), false) => {
                // Server-side analysis path.
                self.director.send(ClientMessage::Frame {
                    data: sample.image_base64,
                });
            }
            (None, false) => {
                // Total sensor unavailability must not starve progression.
                self.deliver(EmotionReading::fallback()).await;
            }
            (None, true) => {
                tracing::debug!("no capture sample this tick");
            }
        }
    }

    async fn deliver(&self, reading: EmotionReading) {
        let _ = self.readings_tx.send(reading.clone()).await;
        self.director.send(ClientMessage::Emotion { data: reading });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinewire_schema::{Attention, Emotion, FrameSample};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct RecordingPort {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl DirectorPort for RecordingPort {
        fn send(&self, msg: ClientMessage) {
            self.sent.lock().unwrap().push(msg);
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    struct ScriptedAnalyzer {
        connected: AtomicBool,
        reading: EmotionReading,
    }

    impl ScriptedAnalyzer {
        fn new(connected: bool, reading: EmotionReading) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                reading,
            })
        }
    }

    #[async_trait]
    impl AnalysisChannel for ScriptedAnalyzer {
        fn connect(&self) {
            self.connected.store(true, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn classify(&self, _sample: &FrameSample) -> EmotionReading {
            self.reading.clone()
        }
    }

    struct StaticFrames {
        available: bool,
    }

    #[async_trait]
    impl FrameSource for StaticFrames {
        async fn acquire(&self) -> bool {
            self.available
        }

        async fn release(&self) {}

        async fn capture_sample(&self) -> Option<FrameSample> {
            self.available.then(|| FrameSample {
                image_base64: "ZnJhbWU=".into(),
            })
        }
    }

    fn scripted_reading() -> EmotionReading {
        EmotionReading {
            primary_emotion: Emotion::Amused,
            intensity: 7,
            attention: Attention::Screen,
            confidence: 0.8,
            timestamp: None,
        }
    }

    fn router(
        available: bool,
        analyzer: Arc<ScriptedAnalyzer>,
        port: Arc<RecordingPort>,
        readings_tx: mpsc::Sender<EmotionReading>,
    ) -> TelemetryRouter {
        TelemetryRouter::new(
            Arc::new(StaticFrames { available }),
            analyzer,
            port,
            readings_tx,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn sample_with_direct_channel_classifies_and_relays_reading() {
        let port = RecordingPort::new();
        let analyzer = ScriptedAnalyzer::new(true, scripted_reading());
        let (tx, mut rx) = mpsc::channel(4);
        router(true, analyzer, port.clone(), tx).tick().await;

        assert_eq!(rx.recv().await, Some(scripted_reading()));
        let sent = port.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ClientMessage::Emotion { data } if *data == scripted_reading()));
    }

    #[tokio::test]
    async fn sample_without_direct_channel_relays_raw_frame() {
        let port = RecordingPort::new();
        let analyzer = ScriptedAnalyzer::new(false, scripted_reading());
        let (tx, mut rx) = mpsc::channel(4);
        router(true, analyzer, port.clone(), tx).tick().await;

        assert!(rx.try_recv().is_err());
        let sent = port.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ClientMessage::Frame { data } if data == "ZnJhbWU="));
    }

    #[tokio::test]
    async fn no_sample_no_channel_synthesizes_fallback() {
        let port = RecordingPort::new();
        let analyzer = ScriptedAnalyzer::new(false, scripted_reading());
        let (tx, mut rx) = mpsc::channel(4);
        router(false, analyzer, port.clone(), tx).tick().await;

        assert_eq!(rx.recv().await, Some(EmotionReading::fallback()));
        let sent = port.sent();
        assert_eq!(sent.len(), 1);
        assert!(
            matches!(&sent[0], ClientMessage::Emotion { data } if *data == EmotionReading::fallback())
        );
    }

    #[tokio::test]
    async fn no_sample_with_connected_channel_skips_tick() {
        let port = RecordingPort::new();
        let analyzer = ScriptedAnalyzer::new(true, scripted_reading());
        let (tx, mut rx) = mpsc::channel(4);
        router(false, analyzer, port.clone(), tx).tick().await;

        assert!(rx.try_recv().is_err());
        assert!(port.sent().is_empty());
    }
}
