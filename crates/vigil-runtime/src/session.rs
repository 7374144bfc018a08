//! Durable per-conversation transcripts.
//!
//! Each session is `sessions/<escaped key>.jsonl`, one [`Message`] per line.
//! The file is the source of truth. A bounded cache keeps the transcripts of
//! the most recently used sessions; it is filled lazily on first read and
//! only ever extended after a successful file append.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use vigil_core::paths::unescape_key;
use vigil_core::{Message, Result, Role, SessionKey, StatePaths, VigilError, jsonl};

/// Sessions kept in memory before the least recently used is evicted.
pub const SESSION_CACHE_CAPACITY: usize = 64;

struct CachedTranscript {
    messages: Vec<Message>,
    last_used: u64,
}

#[derive(Default)]
struct TranscriptCache {
    entries: HashMap<SessionKey, CachedTranscript>,
    clock: u64,
}

impl TranscriptCache {
    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &str) -> Option<&[Message]> {
        let now = self.touch();
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = now;
            entry.messages.as_slice()
        })
    }

    fn insert(&mut self, key: &str, messages: Vec<Message>, capacity: usize) {
        while self.entries.len() >= capacity.max(1) {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(session = %oldest, "session evicted from cache");
            self.entries.remove(&oldest);
        }
        let last_used = self.touch();
        self.entries
            .insert(key.to_string(), CachedTranscript { messages, last_used });
    }
}

pub struct SessionStore {
    paths: StatePaths,
    /// Held across the file write so appends are ordered.
    cache: Mutex<TranscriptCache>,
    capacity: usize,
}

impl SessionStore {
    pub fn new(paths: StatePaths) -> Self {
        Self::with_cache_capacity(paths, SESSION_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(paths: StatePaths, capacity: usize) -> Self {
        Self {
            paths,
            cache: Mutex::new(TranscriptCache::default()),
            capacity,
        }
    }

    pub fn append(&self, key: &str, message: Message) -> Result<()> {
        self.append_all(key, vec![message])
    }

    /// Append a user turn and its reply together. Either both land in the
    /// transcript or neither does.
    pub fn append_exchange(&self, key: &str, user: Message, reply: Message) -> Result<()> {
        self.append_all(key, vec![user, reply])
    }

    fn append_all(&self, key: &str, messages: Vec<Message>) -> Result<()> {
        if key.is_empty() {
            return Err(VigilError::Session("empty session key".into()));
        }
        let mut cache = self.cache.lock();
        jsonl::append_all(&self.paths.session_file(key), &messages)?;
        if let Some(entry) = cache.entries.get_mut(key) {
            entry.messages.extend(messages);
        }
        Ok(())
    }

    /// Run `f` over the transcript, loading it into the cache if needed.
    fn with_transcript<R>(&self, key: &str, f: impl FnOnce(&[Message]) -> R) -> Result<R> {
        let mut cache = self.cache.lock();
        if let Some(messages) = cache.get(key) {
            return Ok(f(messages));
        }
        let messages: Vec<Message> = jsonl::read_all(&self.paths.session_file(key))?;
        debug!(session = key, messages = messages.len(), "session loaded");
        let result = f(&messages);
        cache.insert(key, messages, self.capacity);
        Ok(result)
    }

    /// Full transcript, oldest first. Unknown keys read as empty.
    pub fn transcript(&self, key: &str) -> Result<Vec<Message>> {
        self.with_transcript(key, <[Message]>::to_vec)
    }

    /// The most recent whole turns that fit both bounds. See [`select_recent`].
    pub fn recent(&self, key: &str, max_turns: usize, max_chars: usize) -> Result<Vec<Message>> {
        self.with_transcript(key, |messages| select_recent(messages, max_turns, max_chars))
    }

    /// Number of transcripts currently held in memory.
    pub fn cached_sessions(&self) -> usize {
        self.cache.lock().entries.len()
    }

    /// Every session that has a transcript on disk, sorted.
    pub fn keys(&self) -> Result<Vec<SessionKey>> {
        let entries = match std::fs::read_dir(self.paths.sessions_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys: Vec<SessionKey> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "jsonl"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(unescape_key))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Move the transcript into `sessions/archive/` so the next message starts
    /// a fresh session. Returns the archive path, or `None` if there was
    /// nothing to archive.
    pub fn archive(&self, key: &str) -> Result<Option<PathBuf>> {
        let mut cache = self.cache.lock();
        let source = self.paths.session_file(key);
        if !source.exists() {
            cache.entries.remove(key);
            return Ok(None);
        }
        let dir = self.paths.session_archive_dir();
        std::fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let stem = vigil_core::paths::escape_key(key);
        let dest = dir.join(format!("{stem}.{stamp}.jsonl"));
        std::fs::rename(&source, &dest)?;
        cache.entries.remove(key);
        info!(session = key, archive = %dest.display(), "session archived");
        Ok(Some(dest))
    }
}

/// Select the tail of `messages` for replay.
///
/// Messages are grouped into turns (a user message plus the replies after
/// it; replies before the first user message form a turn of their own). The
/// last `max_turns` turns are kept, then whole turns are dropped from the old
/// end until the text fits in `max_chars`. Messages are never cut, so when
/// the newest turn alone is too large the result is empty.
pub fn select_recent(messages: &[Message], max_turns: usize, max_chars: usize) -> Vec<Message> {
    let mut turns: Vec<&[Message]> = Vec::new();
    let mut start = 0;
    for (i, message) in messages.iter().enumerate() {
        if message.role == Role::User && i > start {
            turns.push(&messages[start..i]);
            start = i;
        }
    }
    if start < messages.len() {
        turns.push(&messages[start..]);
    }

    let keep_from = turns.len().saturating_sub(max_turns);
    let mut kept = &turns[keep_from..];

    let turn_chars = |turn: &[Message]| turn.iter().map(Message::char_len).sum::<usize>();
    let mut total: usize = kept.iter().map(|t| turn_chars(*t)).sum();
    while total > max_chars && !kept.is_empty() {
        total -= turn_chars(kept[0]);
        kept = &kept[1..];
    }

    kept.iter().flat_map(|t| t.iter().cloned()).collect()
}
