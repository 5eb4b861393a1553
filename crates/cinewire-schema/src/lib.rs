use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The seven emotion labels the director service understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Engaged,
    Bored,
    Confused,
    Amused,
    Tense,
    Surprised,
    Neutral,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Engaged => "engaged",
            Emotion::Bored => "bored",
            Emotion::Confused => "confused",
            Emotion::Amused => "amused",
            Emotion::Tense => "tense",
            Emotion::Surprised => "surprised",
            Emotion::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Attention {
    Screen,
    Away,
    Uncertain,
}

/// One emotion sample, produced by the direct analysis channel, the director
/// service, or synthesized locally. Immutable value; no identity beyond its
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmotionReading {
    pub primary_emotion: Emotion,
    /// 1-10
    pub intensity: u8,
    pub attention: Attention,
    /// 0.0-1.0
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EmotionReading {
    /// The synthesized default used whenever no real reading can be obtained.
    pub fn fallback() -> Self {
        Self {
            primary_emotion: Emotion::Neutral,
            intensity: 5,
            attention: Attention::Screen,
            confidence: 0.5,
            timestamp: None,
        }
    }
}

/// Everything needed to present one scene. Replaced wholesale on each
/// `scene` event, never partially updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneAssets {
    pub scene_id: String,
    pub chapter: String,
    pub narration_text: String,
    pub mood: String,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub audio_base64: Option<String>,
    #[serde(default = "default_scene_duration")]
    pub duration_seconds: u64,
}

fn default_scene_duration() -> u64 {
    16
}

/// Messages received from the director service over the session channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Scene { assets: SceneAssets },
    Emotion { data: EmotionReading },
    Deciding,
    Complete { ending: String, scenes_played: Vec<String> },
    Error { message: String },
}

/// Messages sent to the director service over the session channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start { genre: String },
    Frame { data: String },
    Emotion { data: EmotionReading },
    Reset,
}

/// A captured sample: base64 JPEG without a data-URL prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    pub image_base64: String,
}

/// Bounded record of the most recent emotion labels, oldest first.
#[derive(Debug, Clone, Default)]
pub struct EmotionHistory {
    entries: VecDeque<Emotion>,
}

impl EmotionHistory {
    pub const CAPACITY: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, emotion: Emotion) {
        if self.entries.len() == Self::CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(emotion);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Emotion> {
        self.entries.iter()
    }

    /// Most frequent label in the window; ties broken by most recent
    /// occurrence.
    pub fn dominant(&self) -> Option<Emotion> {
        let mut best: Option<(Emotion, usize)> = None;
        for emotion in self.entries.iter() {
            let count = self.entries.iter().filter(|e| *e == emotion).count();
            match best {
                Some((_, best_count)) if count < best_count => {}
                _ => best = Some((*emotion, count)),
            }
        }
        best.map(|(emotion, _)| emotion)
    }
}
