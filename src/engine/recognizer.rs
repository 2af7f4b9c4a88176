//! Streaming marker recognition on worker output
//!
//! A [`Recognizer`] watches one byte pattern across any number of output
//! streams, keeping an independent match cursor per stream so that a marker
//! split over several chunks is still found. The [`OutputScanner`] fans each
//! chunk out to all attached recognizers and raw-output taps.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical name of a worker output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Primary output
    Stdout,
    /// Secondary (error) output
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// A full pattern match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEvent {
    /// Name of the recognizer that fired
    pub recognizer: String,
    /// Stream the marker appeared on
    pub stream: OutputStream,
    /// Bytes of the chunk after the match, when trailing collection is enabled
    pub trailing: Option<Vec<u8>>,
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback invoked on every match
pub type MarkerListener = Arc<dyn Fn(&MarkerEvent) + Send + Sync>;

/// Callback invoked with every raw output chunk
pub type OutputTap = Arc<dyn Fn(OutputStream, &[u8]) + Send + Sync>;

/// Single-pattern matcher with per-stream cursors
pub struct Recognizer {
    name: String,
    pattern: Vec<u8>,
    /// KMP failure table: longest proper prefix that is also a suffix
    fallback: Vec<usize>,
    collect_trailing: bool,
    cursors: Mutex<HashMap<OutputStream, usize>>,
    listeners: RwLock<Vec<(ListenerId, MarkerListener)>>,
}

impl Recognizer {
    /// Create a recognizer for a non-empty pattern.
    pub fn new(name: impl Into<String>, pattern: impl AsRef<[u8]>) -> Self {
        let pattern = pattern.as_ref().to_vec();
        let fallback = failure_table(&pattern);
        Self {
            name: name.into(),
            pattern,
            fallback,
            collect_trailing: false,
            cursors: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Deliver the rest of the chunk after each match to listeners.
    pub fn collecting_trailing(mut self) -> Self {
        self.collect_trailing = true;
        self
    }

    /// Recognizer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pattern bytes.
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Register a listener; safe to call while matching is in progress.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MarkerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Reset the match cursor of one stream.
    pub fn reset(&self, stream: OutputStream) {
        self.cursors.lock().remove(&stream);
    }

    /// Consume a chunk, firing listeners once per full match.
    ///
    /// Returns the number of matches found in this chunk.
    pub fn feed(&self, stream: OutputStream, chunk: &[u8]) -> usize {
        if self.pattern.is_empty() {
            return 0;
        }

        let mut ends = Vec::new();
        {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(stream).or_insert(0);
            for (index, byte) in chunk.iter().enumerate() {
                while *cursor > 0 && self.pattern[*cursor] != *byte {
                    *cursor = self.fallback[*cursor - 1];
                }
                if self.pattern[*cursor] == *byte {
                    *cursor += 1;
                }
                if *cursor == self.pattern.len() {
                    ends.push(index + 1);
                    *cursor = 0;
                }
            }
        }

        if ends.is_empty() {
            return 0;
        }

        let listeners: Vec<MarkerListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for end in &ends {
            let event = MarkerEvent {
                recognizer: self.name.clone(),
                stream,
                trailing: self.collect_trailing.then(|| chunk[*end..].to_vec()),
            };
            for listener in &listeners {
                listener(&event);
            }
        }

        ends.len()
    }
}

impl fmt::Debug for Recognizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recognizer")
            .field("name", &self.name)
            .field("pattern", &String::from_utf8_lossy(&self.pattern))
            .field("collect_trailing", &self.collect_trailing)
            .finish()
    }
}

fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

/// Fan-out point for worker output
///
/// Transports feed every chunk they read here; recognizers and taps may be
/// attached or detached at any time.
#[derive(Default)]
pub struct OutputScanner {
    recognizers: RwLock<Vec<Arc<Recognizer>>>,
    taps: RwLock<Vec<(ListenerId, OutputTap)>>,
}

impl OutputScanner {
    /// Create an empty scanner.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a recognizer to all streams.
    pub fn attach(&self, recognizer: Arc<Recognizer>) {
        self.recognizers.write().push(recognizer);
    }

    /// Detach all recognizers with the given name.
    pub fn detach(&self, name: &str) -> bool {
        let mut recognizers = self.recognizers.write();
        let before = recognizers.len();
        recognizers.retain(|recognizer| recognizer.name() != name);
        recognizers.len() != before
    }

    /// Look up an attached recognizer by name.
    pub fn recognizer(&self, name: &str) -> Option<Arc<Recognizer>> {
        self.recognizers
            .read()
            .iter()
            .find(|recognizer| recognizer.name() == name)
            .cloned()
    }

    /// Register a raw output tap.
    pub fn add_tap<F>(&self, tap: F) -> ListenerId
    where
        F: Fn(OutputStream, &[u8]) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.taps.write().push((id, Arc::new(tap)));
        id
    }

    /// Remove a raw output tap.
    pub fn remove_tap(&self, id: ListenerId) -> bool {
        let mut taps = self.taps.write();
        let before = taps.len();
        taps.retain(|(existing, _)| *existing != id);
        taps.len() != before
    }

    /// Feed a chunk read from `stream`.
    pub fn feed(&self, stream: OutputStream, chunk: &[u8]) {
        let taps: Vec<OutputTap> = self.taps.read().iter().map(|(_, tap)| tap.clone()).collect();
        for tap in taps {
            tap(stream, chunk);
        }

        let recognizers: Vec<Arc<Recognizer>> = self.recognizers.read().clone();
        for recognizer in recognizers {
            recognizer.feed(stream, chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(recognizer: &Recognizer) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        recognizer.add_listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_match_split_across_chunks() {
        let recognizer = Recognizer::new("prompt", "| ?- ");
        let count = counting(&recognizer);

        for byte in b"noise | ?- " {
            recognizer.feed(OutputStream::Stdout, &[*byte]);
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_near_miss_fires_once_at_correct_position() {
        let recognizer = Recognizer::new("prompt", "| ?- ").collecting_trailing();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        recognizer.add_listener(move |event| sink.lock().push(event.clone()));

        let fired = recognizer.feed(OutputStream::Stdout, b"| ?-X| ?- tail");

        assert_eq!(fired, 1);
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trailing.as_deref(), Some(&b"tail"[..]));
    }

    #[test]
    fn test_self_overlapping_pattern() {
        let recognizer = Recognizer::new("overlap", "aab");
        let count = counting(&recognizer);

        recognizer.feed(OutputStream::Stdout, b"aa");
        recognizer.feed(OutputStream::Stdout, b"ab");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_streams_do_not_share_cursors() {
        let recognizer = Recognizer::new("prompt", "?- ");
        let count = counting(&recognizer);

        recognizer.feed(OutputStream::Stdout, b"?-");
        recognizer.feed(OutputStream::Stderr, b" ");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        recognizer.feed(OutputStream::Stdout, b" ");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removal() {
        let recognizer = Recognizer::new("error", "***");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let id = recognizer.add_listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        recognizer.feed(OutputStream::Stdout, b"***");
        assert!(recognizer.remove_listener(id));
        recognizer.feed(OutputStream::Stdout, b"***");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!recognizer.remove_listener(id));
    }

    #[test]
    fn test_scanner_fans_out_to_recognizers_and_taps() {
        let scanner = OutputScanner::new();
        let prompt = Arc::new(Recognizer::new("prompt", "?- "));
        let count = counting(&prompt);
        scanner.attach(prompt);

        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        scanner.add_tap(move |_, chunk| sink.lock().extend_from_slice(chunk));

        scanner.feed(OutputStream::Stdout, b"hello\n?- ");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(captured.lock().as_slice(), b"hello\n?- ");
        assert!(scanner.detach("prompt"));
        assert!(scanner.recognizer("prompt").is_none());
    }

    proptest! {
        #[test]
        fn prop_pattern_split_anywhere_fires_once(
            prefix in "[a-z ]{0,20}",
            cuts in proptest::collection::vec(0usize..64, 0..8),
        ) {
            let pattern = "| ?- ";
            prop_assume!(!prefix.contains(pattern));
            let recognizer = Recognizer::new("prompt", pattern);
            let count = counting(&recognizer);

            let mut input = prefix.into_bytes();
            input.extend_from_slice(pattern.as_bytes());

            let mut points: Vec<usize> = cuts.into_iter().map(|cut| cut % (input.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut start = 0;
            for point in points {
                recognizer.feed(OutputStream::Stdout, &input[start..point]);
                start = point;
            }
            recognizer.feed(OutputStream::Stdout, &input[start..]);

            prop_assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
