// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming extraction of `@@name('arg')@@` control markers.
//!
//! The parser sits between the driver's token stream and every downstream
//! consumer.  Markers may split across arbitrary chunk boundaries; partial
//! candidates are buffered and never leak downstream.  Each recognized
//! marker is replaced by its emoji glyph in the clean text and handed to the
//! dispatcher exactly once, independent of how the stream was chunked.

use tracing::warn;

use crate::markers::{glyph, validate, Marker, Validity};

/// A marker candidate longer than this cannot be one; the buffered text is
/// released downstream instead of waiting for a closing `@@` forever.
const MAX_MARKER_LEN: usize = 512;

/// Byte budget processed between cooperative yields in the feed loop.
const FAIRNESS_BYTES: usize = 64 * 1024;

type TokenSink<'a> = Box<dyn FnMut(&str) + Send + 'a>;
type MarkerSink<'a> = Box<dyn FnMut(&Marker) -> anyhow::Result<()> + Send + 'a>;

pub struct MarkerParser<'a> {
    buf: String,
    clean: String,
    on_token: TokenSink<'a>,
    on_marker: MarkerSink<'a>,
    bytes_since_yield: usize,
}

impl<'a> MarkerParser<'a> {
    pub fn new(
        on_token: impl FnMut(&str) + Send + 'a,
        on_marker: impl FnMut(&Marker) -> anyhow::Result<()> + Send + 'a,
    ) -> Self {
        Self {
            buf: String::new(),
            clean: String::new(),
            on_token: Box::new(on_token),
            on_marker: Box::new(on_marker),
            bytes_since_yield: 0,
        }
    }

    /// Feed one streamed chunk.
    pub fn feed(&mut self, chunk: &str) {
        self.bytes_since_yield += chunk.len();
        self.buf.push_str(chunk);
        self.process(false);
    }

    /// End of stream: emit any remaining buffered text as clean output,
    /// abandoning partial markers.
    pub fn flush(&mut self) {
        self.process(true);
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
    }

    /// Everything emitted downstream so far (glyph substitutions included).
    pub fn clean_text(&self) -> &str {
        &self.clean
    }

    /// True once per `FAIRNESS_BYTES` of processed input; the caller yields
    /// to the scheduler when it reads true.
    pub fn take_yield_request(&mut self) -> bool {
        if self.bytes_since_yield >= FAIRNESS_BYTES {
            self.bytes_since_yield = 0;
            true
        } else {
            false
        }
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.clean.push_str(text);
        (self.on_token)(text);
    }

    fn dispatch(&mut self, marker: Marker) {
        // Handler failures never fail the turn.
        if let Err(e) = (self.on_marker)(&marker) {
            warn!(marker = marker.name(), error = %e, "marker handler failed");
        }
    }

    fn process(&mut self, flush: bool) {
        loop {
            let Some(open) = self.buf.find("@@") else {
                if !flush {
                    self.hold_partial_tail();
                }
                return;
            };

            // `\@@` disables interpretation: drop the backslash, pass the
            // `@@` through as literal text, and keep scanning after it.
            if open > 0 && self.buf.as_bytes()[open - 1] == b'\\' {
                let before: String = self.buf[..open - 1].to_string();
                self.emit(&before);
                self.emit("@@");
                self.buf.drain(..open + 2);
                continue;
            }

            // Emit the plain text ahead of the candidate.
            if open > 0 {
                let before: String = self.buf[..open].to_string();
                self.emit(&before);
                self.buf.drain(..open);
            }

            // Candidate starts at 0.  Find the closing `@@`.
            let Some(close_rel) = self.buf[2..].find("@@") else {
                if self.buf.len() > MAX_MARKER_LEN {
                    // Too long to ever be a marker: release the opener.
                    self.emit("@@");
                    self.buf.drain(..2);
                    continue;
                }
                if flush {
                    let rest = std::mem::take(&mut self.buf);
                    self.emit(&rest);
                }
                return;
            };
            let close = close_rel + 2;
            let inner: String = self.buf[2..close].to_string();
            let total = close + 2;

            match parse_inner(&inner) {
                Some(marker) => {
                    self.emit(glyph(marker.name()));
                    if matches!(
                        &marker,
                        Marker::Control { name, .. } if validate(name, marker_arg(&marker)) == Validity::Unknown
                    ) {
                        warn!(marker = marker.name(), "unknown marker passed through");
                    }
                    self.dispatch(marker);
                    self.buf.drain(..total);
                }
                None => {
                    // Not marker syntax after all; release the opener and
                    // rescan the rest as ordinary text.
                    warn!(candidate = %inner, "malformed marker candidate treated as text");
                    self.emit("@@");
                    self.buf.drain(..2);
                }
            }
        }
    }

    /// Keep only a tail that could still begin a marker (`@`) or an escape
    /// (`\`); emit everything ahead of it.
    fn hold_partial_tail(&mut self) {
        let bytes = self.buf.as_bytes();
        let mut keep = 0;
        if bytes.last() == Some(&b'@') {
            keep = 1;
            if bytes.len() >= 2 && bytes[bytes.len() - 2] == b'@' {
                keep = 2;
            }
            if bytes.len() > keep && bytes[bytes.len() - keep - 1] == b'\\' {
                keep += 1;
            }
        } else if bytes.last() == Some(&b'\\') {
            keep = 1;
        }
        if self.buf.len() > keep {
            let emit_to = self.buf.len() - keep;
            let before: String = self.buf[..emit_to].to_string();
            self.emit(&before);
            self.buf.drain(..emit_to);
        }
    }
}

fn marker_arg(marker: &Marker) -> Option<&str> {
    match marker {
        Marker::Control { arg, .. } => arg.as_deref(),
        Marker::Avatar { .. } => None,
    }
}

/// Parse the text between `@@` fences.  Returns `None` when the content is
/// not valid marker syntax (or fails emotion validation).
fn parse_inner(inner: &str) -> Option<Marker> {
    // Avatar variant: [clip:weight, ...]
    if let Some(body) = inner.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let mut weights = Vec::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = part.split_once(':')?;
            let weight: f32 = value.trim().parse().ok()?;
            weights.push((name.trim().to_string(), weight));
        }
        if weights.is_empty() {
            return None;
        }
        return Some(Marker::Avatar { weights });
    }

    // Control: name, optionally followed by ( arg ).
    let name_len = inner
        .char_indices()
        .take_while(|(i, c)| {
            if *i == 0 {
                c.is_ascii_alphabetic()
            } else {
                c.is_ascii_alphanumeric() || *c == '_' || *c == '-'
            }
        })
        .count();
    if name_len == 0 {
        return None;
    }
    let name = &inner[..name_len];
    let rest = &inner[name_len..];

    let arg = if rest.is_empty() {
        None
    } else {
        let body = rest.strip_prefix('(')?.strip_suffix(')')?;
        Some(unquote(body.trim()).to_string())
    };

    if validate(name, arg.as_deref()) == Validity::Invalid {
        return None;
    }
    Some(Marker::Control {
        name: name.to_string(),
        arg,
    })
}

fn unquote(s: &str) -> &str {
    let b = s.as_bytes();
    if b.len() >= 2 && (b[0] == b'\'' && b[b.len() - 1] == b'\'' || b[0] == b'"' && b[b.len() - 1] == b'"')
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// One-shot scan of a complete string (e.g. a tool-call string argument):
/// returns the clean text and every marker found.
pub fn scan_text(text: &str) -> (String, Vec<Marker>) {
    let mut markers = Vec::new();
    let mut clean = String::new();
    {
        let mut parser = MarkerParser::new(
            |t| clean.push_str(t),
            |m| {
                markers.push(m.clone());
                Ok(())
            },
        );
        parser.feed(text);
        parser.flush();
    }
    (clean, markers)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
