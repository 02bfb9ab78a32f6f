// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, warn};

use skald_model::{Message, Role};

use crate::page::{page_id, GrepMatch, GrepOptions, Page, PageMeta};

/// Content-addressed, optionally persisted store of compacted pages.
///
/// Semantics follow an append-only arena: pages are never mutated after
/// creation apart from `ref_count`/`pinned`, ids stay valid as historical
/// references even after physical removal (lookups then return `None`), and
/// a `sweep` pass reclaims fully unreferenced, unpinned pages.
///
/// Persistence is strictly best-effort.  Filesystem failures are logged as
/// warnings and never surface as errors: losing a page file degrades recall,
/// not correctness.
pub struct PageStore {
    pages: HashMap<String, Page>,
    /// Creation counter feeding the content-addressed id.
    created: u64,
    dir: Option<PathBuf>,
}

impl PageStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            created: 0,
            dir: None,
        }
    }

    /// Store persisting each page as `<dir>/<id>.json`.  Existing page files
    /// are loaded eagerly; unreadable files are skipped with a warning.
    pub fn with_dir(dir: PathBuf) -> Self {
        let mut store = Self {
            pages: HashMap::new(),
            created: 0,
            dir: Some(dir.clone()),
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create page dir; pages stay in memory");
            store.dir = None;
            return store;
        }
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().map(|e| e == "json") != Some(true) {
                        continue;
                    }
                    match std::fs::read_to_string(&path)
                        .map_err(anyhow::Error::from)
                        .and_then(|s| serde_json::from_str::<Page>(&s).map_err(Into::into))
                    {
                        Ok(page) => {
                            store.pages.insert(page.id.clone(), page);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "skipping unreadable page file");
                        }
                    }
                }
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot list page dir"),
        }
        store.created = store.pages.len() as u64;
        debug!(count = store.pages.len(), "page store loaded");
        store
    }

    /// Compact a raw span into a new page and return its id.
    pub fn create(
        &mut self,
        raw_messages: Vec<Message>,
        summary: impl Into<String>,
        label: impl Into<String>,
        token_count: usize,
    ) -> String {
        self.created += 1;
        let id = page_id(&raw_messages, self.created);
        let mut source_lane_counts: HashMap<Role, usize> = HashMap::new();
        for m in &raw_messages {
            *source_lane_counts.entry(m.role).or_default() += 1;
        }
        let page = Page {
            id: id.clone(),
            label: label.into(),
            summary: summary.into(),
            raw_messages,
            token_count,
            created_at: Utc::now(),
            ref_count: 0,
            pinned: false,
            source_lane_counts,
        };
        self.persist(&page);
        self.pages.insert(id.clone(), page);
        id
    }

    /// `None` if the id never existed or the page was physically removed.
    pub fn load(&self, id: &str) -> Option<&Page> {
        self.pages.get(id)
    }

    /// Increment the ref count.  Returns `false` for a dangling id.
    pub fn inc_ref(&mut self, id: &str) -> bool {
        match self.pages.get_mut(id) {
            Some(p) => {
                p.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the ref count.  Dropping to zero does not delete the page;
    /// reclamation happens in [`sweep`](Self::sweep).
    pub fn dec_ref(&mut self, id: &str) -> bool {
        match self.pages.get_mut(id) {
            Some(p) => {
                p.ref_count = p.ref_count.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn pin(&mut self, id: &str) -> bool {
        let persisted = match self.pages.get_mut(id) {
            Some(p) => {
                p.pinned = true;
                p.clone()
            }
            None => return false,
        };
        self.persist(&persisted);
        true
    }

    pub fn unpin(&mut self, id: &str) -> bool {
        let persisted = match self.pages.get_mut(id) {
            Some(p) => {
                p.pinned = false;
                p.clone()
            }
            None => return false,
        };
        self.persist(&persisted);
        true
    }

    /// Listing metadata, newest first.
    pub fn list(&self) -> Vec<PageMeta> {
        let mut metas: Vec<PageMeta> = self
            .pages
            .values()
            .map(|p| PageMeta {
                id: p.id.clone(),
                label: p.label.clone(),
                token_count: p.token_count,
                message_count: p.raw_messages.len(),
                created_at: p.created_at,
                ref_count: p.ref_count,
                pinned: p.pinned,
            })
            .collect();
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        metas
    }

    /// Search summaries and raw content across all pages.
    ///
    /// An invalid regex is reported as a warning and matches nothing; the
    /// caller sees an empty result rather than an error.
    pub fn grep(&self, pattern: &str, opts: &GrepOptions) -> Vec<GrepMatch> {
        let source = if opts.literal {
            regex::escape(pattern)
        } else {
            pattern.to_string()
        };
        let re = match regex::RegexBuilder::new(&source)
            .case_insensitive(opts.case_insensitive)
            .build()
        {
            Ok(re) => re,
            Err(e) => {
                warn!(%pattern, error = %e, "invalid grep pattern");
                return Vec::new();
            }
        };

        let mut results = Vec::new();
        let mut pages: Vec<&Page> = self.pages.values().collect();
        pages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for page in pages {
            let mut match_count = 0usize;
            let mut snippet = None;
            let mut scan = |text: &str| {
                for line in text.lines() {
                    let hits = re.find_iter(line).count();
                    if hits > 0 {
                        match_count += hits;
                        if snippet.is_none() {
                            snippet = Some(trim_snippet(line));
                        }
                    }
                }
            };
            scan(&page.summary);
            for m in &page.raw_messages {
                scan(&content_text(m));
            }
            if match_count > 0 {
                results.push(GrepMatch {
                    page_id: page.id.clone(),
                    label: page.label.clone(),
                    snippet: snippet.unwrap_or_default(),
                    match_count,
                    loaded: page.ref_count > 0,
                });
                if opts.max_matches > 0 && results.len() >= opts.max_matches {
                    break;
                }
            }
        }
        results
    }

    /// Physically remove all evictable pages (ref_count 0, unpinned) and
    /// return how many were reclaimed.  Their ids remain valid historical
    /// references: later lookups resolve to "page gone" (`None`).
    pub fn sweep(&mut self) -> usize {
        let victims: Vec<String> = self
            .pages
            .values()
            .filter(|p| p.evictable())
            .map(|p| p.id.clone())
            .collect();
        for id in &victims {
            self.pages.remove(id);
            if let Some(dir) = &self.dir {
                let path = dir.join(format!("{id}.json"));
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(page = %id, error = %e, "could not remove page file");
                    }
                }
            }
        }
        victims.len()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// All pages, for warm-state capture.
    pub fn snapshot(&self) -> Vec<Page> {
        let mut pages: Vec<Page> = self.pages.values().cloned().collect();
        pages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pages
    }

    /// Replace contents from a warm-state snapshot.
    pub fn restore(&mut self, pages: Vec<Page>) {
        self.pages = pages.into_iter().map(|p| (p.id.clone(), p)).collect();
        self.created = self.created.max(self.pages.len() as u64);
    }

    fn persist(&self, page: &Page) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(format!("{}.json", page.id));
        let result = serde_json::to_vec_pretty(page)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(Into::into));
        if let Err(e) = result {
            warn!(page = %page.id, error = %e, "page persistence failed");
        }
    }
}

impl Default for PageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_text(m: &Message) -> String {
    match &m.content {
        skald_model::MessageContent::Text(t) => t.clone(),
        skald_model::MessageContent::ToolCall { function, .. } => {
            format!("{}({})", function.name, function.arguments)
        }
        skald_model::MessageContent::ToolResult { content, .. } => content.clone(),
    }
}

fn trim_snippet(line: &str) -> String {
    const MAX: usize = 160;
    let trimmed = line.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut cut = MAX;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &trimmed[..cut])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
