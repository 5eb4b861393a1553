//! Playback orchestration: the state machine that reconciles director
//! protocol events, emotion telemetry, and local media signals into one
//! consistent session.

mod controller;
mod frames;
mod telemetry;
mod timer;

pub use controller::{
    PlaybackState, Player, PlayerConfig, PlayerHandle, PlayerNotice, PlayerView,
};
pub use frames::{FrameSource, NullFrameSource};

use async_trait::async_trait;

use cinewire_analyzer::EmotionAnalyzer;
use cinewire_channel::SessionChannel;
use cinewire_schema::{ClientMessage, EmotionReading, FrameSample};

/// Outbound side of the session channel as seen by the player.
pub trait DirectorPort: Send + Sync {
    fn send(&self, msg: ClientMessage);
    fn is_connected(&self) -> bool;
}

impl DirectorPort for SessionChannel {
    fn send(&self, msg: ClientMessage) {
        SessionChannel::send(self, msg)
    }

    fn is_connected(&self) -> bool {
        SessionChannel::is_connected(self)
    }
}

/// The direct analysis channel as seen by the player and telemetry router.
#[async_trait]
pub trait AnalysisChannel: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    async fn classify(&self, sample: &FrameSample) -> EmotionReading;
}

#[async_trait]
impl AnalysisChannel for EmotionAnalyzer {
    fn connect(&self) {
        EmotionAnalyzer::connect(self)
    }

    fn disconnect(&self) {
        EmotionAnalyzer::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        EmotionAnalyzer::is_connected(self)
    }

    async fn classify(&self, sample: &FrameSample) -> EmotionReading {
        EmotionAnalyzer::classify(self, sample).await
    }
}
