//! Accumulated text of the serial log.
//!
//! Serial reads split data at arbitrary points, so decoding keeps partial UTF-8 sequences and
//! partial terminal escape sequences around until the next chunk arrives. ESP-IDF colours its
//! log output; colour codes are removed, as are carriage returns.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Default upper bound of stored text, in bytes.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

const ESC: char = '\u{1b}';

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    None,
    Start,
    Csi,
}

#[derive(Debug, Default)]
struct Decoder {
    pending: Vec<u8>,
    escape: Escape,
}

impl Decoder {
    fn decode(&mut self, input: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(input);

        let mut text = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    text.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));

                    match e.error_len() {
                        Some(n) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.filter(&text)
    }

    fn filter(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());

        for c in text.chars() {
            self.escape = match (self.escape, c) {
                (Escape::None, ESC) => Escape::Start,
                (Escape::None, '\r') => Escape::None,
                (Escape::None, c) => {
                    out.push(c);
                    Escape::None
                }
                (Escape::Start, '[') => Escape::Csi,
                // Two character sequences, e.g. `ESC c`
                (Escape::Start, _) => Escape::None,
                (Escape::Csi, '\u{40}'..='\u{7e}') => Escape::None,
                (Escape::Csi, _) => Escape::Csi,
            };
        }

        out
    }
}

#[derive(Debug)]
pub struct Transcript {
    text: String,
    capacity: usize,
    decoder: Decoder,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Transcript {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity,
            decoder: Decoder::default(),
        }
    }

    /// Decode raw serial bytes. Returns the text that was appended.
    pub fn push_bytes(&mut self, data: &[u8]) -> String {
        let text = self.decoder.decode(data);
        self.text.push_str(&text);
        self.trim();
        text
    }

    /// Append a line produced by the application itself, such as connection status.
    pub fn push_status(&mut self, line: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.text.push('\n');
        self.trim();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.text.as_bytes())
    }

    /// Drop whole lines from the front until under capacity.
    fn trim(&mut self) {
        if self.text.len() <= self.capacity {
            return;
        }

        let mut start = self.text.len() - self.capacity;
        while !self.text.is_char_boundary(start) {
            start += 1;
        }

        let cut = self.text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        self.text.drain(..cut);
    }
}

/// File name used when saving a transcript, e.g. `bitaxe-log-20240131-235959.txt`.
pub fn default_file_name<Tz>(now: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("bitaxe-log-{}.txt", now.format("%Y%m%d-%H%M%S"))
}

/// Transcript shared between the log reader thread and the application.
#[derive(Debug, Clone, Default)]
pub struct TranscriptHandle(Arc<Mutex<Transcript>>);

impl TranscriptHandle {
    /// A reader that panicked mid update leaves readable text behind, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Transcript> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_bytes(&self, data: &[u8]) -> String {
        self.lock().push_bytes(data)
    }

    pub fn push_status(&self, line: &str) {
        self.lock().push_status(line)
    }

    pub fn snapshot(&self) -> String {
        self.lock().as_str().to_string()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        self.lock().save(path)
    }
}
