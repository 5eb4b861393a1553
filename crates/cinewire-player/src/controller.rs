//! Playback state machine.
//!
//! One task owns every piece of session state: playback state, scene assets,
//! emotion history, the pending ending, and all timer handles. Timers and
//! collaborators never mutate state directly; they post commands back into
//! the owner, which re-reads current state when the command arrives.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use cinewire_schema::{
    ClientMessage, Emotion, EmotionHistory, EmotionReading, SceneAssets, SessionEvent,
};

use crate::frames::FrameSource;
use crate::telemetry::{RouterHandle, TelemetryRouter};
use crate::timer::TimerHandle;
use crate::{AnalysisChannel, DirectorPort};

const COMMAND_BUFFER: usize = 32;
const READING_BUFFER: usize = 32;
const NOTICE_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Calibrating,
    Playing,
    /// Advisory only: the state machine itself never enters this variant; it
    /// exists for callers that surface the director's deciding phase.
    Deciding,
    Ended,
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub genre: String,
    pub telemetry_interval: Duration,
    pub calibration_ticks: u8,
    pub reveal_delay: Duration,
    /// Grace added to the current scene duration before the ending fallback
    /// fires.
    pub ending_grace: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            genre: "mystery".to_string(),
            telemetry_interval: Duration::from_secs(10),
            calibration_ticks: 3,
            reveal_delay: Duration::from_millis(400),
            ending_grace: Duration::from_secs(4),
        }
    }
}

/// Observable snapshot of the session. Published on every change; observers
/// read it at their own pace and never hold a stale copy across a fire-time
/// decision.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PlayerView {
    pub state: PlaybackState,
    pub assets: Option<SceneAssets>,
    pub media_visible: bool,
    pub reading: Option<EmotionReading>,
    pub history: Vec<Emotion>,
    pub scenes_played: Vec<String>,
    pub ending: Option<String>,
    pub calibration_count: u8,
}

/// Advisory side events that never change playback state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerNotice {
    Deciding,
    DirectorError(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Start,
    Reset,
    MediaFinished,
    CalibrationTick,
    RevealScene,
    EndingFallbackDue,
}

#[derive(Debug)]
struct PendingEnding {
    ending: String,
    scenes_played: Vec<String>,
}

/// Handle to a running player task. Cheap to clone.
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<Command>,
    view_rx: watch::Receiver<PlayerView>,
    notice_tx: broadcast::Sender<PlayerNotice>,
}

impl PlayerHandle {
    pub async fn start(&self) {
        let _ = self.commands.send(Command::Start).await;
    }

    pub async fn reset(&self) {
        let _ = self.commands.send(Command::Reset).await;
    }

    /// Signal that the currently attached scene media finished naturally.
    pub async fn media_finished(&self) {
        let _ = self.commands.send(Command::MediaFinished).await;
    }

    pub fn view(&self) -> PlayerView {
        self.view_rx.borrow().clone()
    }

    pub fn view_watch(&self) -> watch::Receiver<PlayerView> {
        self.view_rx.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<PlayerNotice> {
        self.notice_tx.subscribe()
    }
}

pub struct Player;

impl Player {
    /// Spawn the owner task. `events_rx` is the typed event stream from the
    /// session channel.
    pub fn spawn(
        config: PlayerConfig,
        director: Arc<dyn DirectorPort>,
        analyzer: Arc<dyn AnalysisChannel>,
        frames: Arc<dyn FrameSource>,
        events_rx: mpsc::Receiver<SessionEvent>,
    ) -> PlayerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (readings_tx, readings_rx) = mpsc::channel(READING_BUFFER);
        let (view_tx, view_rx) = watch::channel(PlayerView::default());
        let (notice_tx, _) = broadcast::channel(NOTICE_BUFFER);

        let controller = Controller {
            cfg: config,
            director,
            analyzer,
            frames,
            commands_tx: commands_tx.clone(),
            readings_tx,
            view_tx,
            notice_tx: notice_tx.clone(),
            started: false,
            state: PlaybackState::Idle,
            assets: None,
            media_visible: false,
            reading: None,
            history: EmotionHistory::new(),
            scenes_played: Vec::new(),
            ending: None,
            calibration_count: 0,
            pending: None,
            calibration: None,
            reveal: None,
            ending_fallback: None,
            telemetry: None,
        };
        tokio::spawn(controller.run(commands_rx, events_rx, readings_rx));

        PlayerHandle {
            commands: commands_tx,
            view_rx,
            notice_tx,
        }
    }
}

struct Controller {
    cfg: PlayerConfig,
    director: Arc<dyn DirectorPort>,
    analyzer: Arc<dyn AnalysisChannel>,
    frames: Arc<dyn FrameSource>,
    commands_tx: mpsc::Sender<Command>,
    readings_tx: mpsc::Sender<EmotionReading>,
    view_tx: watch::Sender<PlayerView>,
    notice_tx: broadcast::Sender<PlayerNotice>,

    started: bool,
    state: PlaybackState,
    assets: Option<SceneAssets>,
    media_visible: bool,
    reading: Option<EmotionReading>,
    history: EmotionHistory,
    scenes_played: Vec<String>,
    ending: Option<String>,
    calibration_count: u8,
    pending: Option<PendingEnding>,

    calibration: Option<TimerHandle>,
    reveal: Option<TimerHandle>,
    ending_fallback: Option<TimerHandle>,
    telemetry: Option<RouterHandle>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::Receiver<SessionEvent>,
        mut readings_rx: mpsc::Receiver<EmotionReading>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                maybe = commands_rx.recv() => {
                    let Some(cmd) = maybe else { break };
                    self.on_command(cmd).await;
                }
                maybe = events_rx.recv(), if events_open => {
                    match maybe {
                        Some(event) => self.on_event(event).await,
                        None => events_open = false,
                    }
                }
                maybe = readings_rx.recv() => {
                    // The controller holds a sender clone, so this arm never
                    // closes while the loop runs.
                    if let Some(reading) = maybe {
                        self.apply_reading(reading);
                    }
                }
            }
        }
        tracing::debug!("player task exiting");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.on_start(),
            Command::Reset => self.on_reset().await,
            Command::MediaFinished => {
                if self.pending.is_some() {
                    self.finish_ending();
                } else {
                    tracing::debug!("media finished with no pending ending");
                }
            }
            Command::CalibrationTick => self.on_calibration_tick().await,
            Command::RevealScene => {
                // A reveal queued just before reset must not touch the
                // torn-down session.
                if self.state == PlaybackState::Playing {
                    self.media_visible = true;
                    self.publish();
                }
            }
            Command::EndingFallbackDue => {
                // No-op when the media-completion signal already cleared the
                // pending entry; the gate cannot double-fire.
                self.finish_ending();
            }
        }
    }

    fn on_start(&mut self) {
        if self.state != PlaybackState::Idle {
            tracing::debug!(state = ?self.state, "start ignored");
            return;
        }
        self.state = PlaybackState::Calibrating;
        self.calibration_count = self.cfg.calibration_ticks;
        self.calibration = Some(TimerHandle::every(
            Duration::from_secs(1),
            self.commands_tx.clone(),
            Command::CalibrationTick,
        ));
        self.publish();
    }

    async fn on_calibration_tick(&mut self) {
        if self.state != PlaybackState::Calibrating {
            return;
        }
        self.calibration_count = self.calibration_count.saturating_sub(1);
        if self.calibration_count == 0 {
            self.begin_playback().await;
        } else {
            self.publish();
        }
    }

    async fn begin_playback(&mut self) {
        if let Some(timer) = self.calibration.take() {
            timer.cancel();
        }
        if !self.frames.acquire().await {
            tracing::warn!("capture device denied, telemetry degrades to relay/fallback");
        }
        self.analyzer.connect();
        let router = TelemetryRouter::new(
            self.frames.clone(),
            self.analyzer.clone(),
            self.director.clone(),
            self.readings_tx.clone(),
            self.cfg.telemetry_interval,
        );
        self.telemetry = Some(router.spawn());
        self.director.send(ClientMessage::Start {
            genre: self.cfg.genre.clone(),
        });
        self.started = true;
        self.state = PlaybackState::Playing;
        self.publish();
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Scene { assets } => self.on_scene(assets),
            SessionEvent::Emotion { data } => self.apply_reading(data),
            SessionEvent::Deciding => {
                tracing::debug!("director deciding");
                let _ = self.notice_tx.send(PlayerNotice::Deciding);
            }
            SessionEvent::Complete {
                ending,
                scenes_played,
            } => self.on_complete(ending, scenes_played),
            SessionEvent::Error { message } => {
                tracing::error!(message = %message, "director error");
                let _ = self.notice_tx.send(PlayerNotice::DirectorError(message));
            }
        }
    }

    fn on_scene(&mut self, assets: SceneAssets) {
        if self.started && self.state != PlaybackState::Ended {
            // Hide the media, swap the assets wholesale, then reveal after a
            // short beat so the presentation layer re-renders the transition.
            self.media_visible = false;
            self.scenes_played.push(assets.scene_id.clone());
            self.assets = Some(assets);
            self.state = PlaybackState::Playing;
            self.reveal = Some(TimerHandle::once(
                self.cfg.reveal_delay,
                self.commands_tx.clone(),
                Command::RevealScene,
            ));
        } else {
            // A scene landing before start (or from a just-reset session) is
            // informational only: display it, promote nothing.
            tracing::debug!(scene = %assets.scene_id, "scene event outside active session");
            self.assets = Some(assets);
        }
        self.publish();
    }

    fn on_complete(&mut self, ending: String, scenes_played: Vec<String>) {
        if !self.started || self.state == PlaybackState::Ended {
            tracing::debug!("complete event ignored outside active session");
            return;
        }
        if self.pending.is_some() {
            tracing::warn!("superseding outstanding pending ending");
        }
        if let Some(timer) = self.ending_fallback.take() {
            timer.cancel();
        }
        // Hold the ending until the scene's media finishes, bounded by the
        // scene duration plus a grace period in case playback is blocked.
        let scene_secs = self
            .assets
            .as_ref()
            .map(|a| a.duration_seconds)
            .unwrap_or(0);
        let deadline = Duration::from_secs(scene_secs) + self.cfg.ending_grace;
        self.pending = Some(PendingEnding {
            ending,
            scenes_played,
        });
        self.ending_fallback = Some(TimerHandle::once(
            deadline,
            self.commands_tx.clone(),
            Command::EndingFallbackDue,
        ));
    }

    fn finish_ending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if let Some(timer) = self.ending_fallback.take() {
            timer.cancel();
        }
        self.ending = Some(pending.ending);
        self.scenes_played = pending.scenes_played;
        self.state = PlaybackState::Ended;
        self.media_visible = false;
        self.publish();
    }

    async fn on_reset(&mut self) {
        if self.state == PlaybackState::Idle {
            tracing::debug!("reset ignored while idle");
            return;
        }
        for timer in [
            self.calibration.take(),
            self.reveal.take(),
            self.ending_fallback.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
        if let Some(router) = self.telemetry.take() {
            router.cancel();
        }
        self.pending = None;
        self.analyzer.disconnect();
        self.frames.release().await;

        self.started = false;
        self.state = PlaybackState::Idle;
        self.assets = None;
        self.media_visible = false;
        self.reading = None;
        self.history.clear();
        self.scenes_played.clear();
        self.ending = None;
        self.calibration_count = 0;

        // The session channel itself stays connected across reset.
        self.director.send(ClientMessage::Reset);
        self.publish();
    }

    fn apply_reading(&mut self, reading: EmotionReading) {
        self.history.push(reading.primary_emotion);
        self.reading = Some(reading);
        self.publish();
    }

    fn publish(&self) {
        let view = PlayerView {
            state: self.state,
            assets: self.assets.clone(),
            media_visible: self.media_visible,
            reading: self.reading.clone(),
            history: self.history.iter().copied().collect(),
            scenes_played: self.scenes_played.clone(),
            ending: self.ending.clone(),
            calibration_count: self.calibration_count,
        };
        let _ = self.view_tx.send(view);
    }
}
