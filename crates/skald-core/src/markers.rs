// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Marker vocabulary: reserved control names, emotion dimensions, validation
//! rules, and the emoji glyphs substituted into clean text.

/// Control names the runtime always accepts.
pub const RESERVED: &[&str] = &[
    "model-change",
    "ref",
    "unref",
    "pin",
    "unpin",
    "pages",
    "grep",
    "compact",
    "think",
    "relax",
    "thinking",
    "importance",
    "memory",
    "recall",
    "ctrl",
    "learn",
    "max-context",
    "sense",
    "view",
    "resize",
    "temp",
    "top_k",
    "top_p",
    "sleep",
    "wake",
    "listening",
    "reboot",
    "export",
];

/// Emotion dimensions: valid only with a numeric argument in `[0,1]`.
pub const EMOTION_DIMS: &[&str] = &[
    "joy",
    "sadness",
    "anger",
    "fear",
    "surprise",
    "disgust",
    "trust",
    "anticipation",
];

/// A control marker extracted from the model's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Control {
        name: String,
        arg: Option<String>,
    },
    /// The avatar variant `@@[clip:weight, ...]@@`.
    Avatar {
        weights: Vec<(String, f32)>,
    },
}

impl Marker {
    pub fn control(name: impl Into<String>, arg: Option<&str>) -> Self {
        Marker::Control {
            name: name.into(),
            arg: arg.map(str::to_string),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Marker::Control { name, .. } => name,
            Marker::Avatar { .. } => "avatar",
        }
    }
}

/// Validation verdict for a parsed control marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Reserved,
    Emotion,
    /// Unknown names pass through with a warning.
    Unknown,
    Invalid,
}

/// Validate a control name/arg pair.
pub fn validate(name: &str, arg: Option<&str>) -> Validity {
    if RESERVED.contains(&name) {
        return Validity::Reserved;
    }
    if EMOTION_DIMS.contains(&name) {
        let ok = arg
            .and_then(|a| a.parse::<f32>().ok())
            .map(|v| (0.0..=1.0).contains(&v))
            .unwrap_or(false);
        return if ok { Validity::Emotion } else { Validity::Invalid };
    }
    Validity::Unknown
}

/// The single emoji substituted into clean text in place of a marker.
pub fn glyph(name: &str) -> &'static str {
    match name {
        "model-change" => "🔀",
        "ref" => "📖",
        "unref" => "📕",
        "pin" => "📌",
        "unpin" => "🧷",
        "pages" => "📚",
        "grep" => "🔍",
        "compact" => "🗜",
        "think" => "🤔",
        "relax" => "😌",
        "thinking" => "🧠",
        "importance" => "⭐",
        "memory" => "🗃",
        "recall" => "💭",
        "ctrl" => "🎛",
        "learn" => "📝",
        "max-context" => "🧳",
        "sense" => "👁",
        "view" => "🎥",
        "resize" => "📐",
        "temp" => "🌡",
        "top_k" | "top_p" => "🎚",
        "sleep" => "😴",
        "wake" => "⏰",
        "listening" => "👂",
        "reboot" => "🔄",
        "export" => "📤",
        "avatar" => "🎭",
        name if EMOTION_DIMS.contains(&name) => "🙂",
        _ => "⚙",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
