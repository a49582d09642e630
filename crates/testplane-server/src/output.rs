// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Console output decoding.
//!
//! Test runner output arrives as raw byte chunks. Chunks are decoded as
//! incremental UTF-8; a partial multi-byte sequence at a chunk boundary is
//! carried into the next chunk. Once a byte sequence turns out not to be
//! UTF-8 at all, the remainder of the stream is buffered and decoded in one
//! piece at the end with a Windows-1252 fallback (the closest total decode
//! for console output from legacy runners). Lone LF is rewritten to CRLF so
//! browser terminals render line breaks consistently.

/// Incremental decoder for one child process output stream.
#[derive(Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
    fallback: Vec<u8>,
    last_was_cr: bool,
}

impl OutputDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the text decoded so far from it.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        if !self.fallback.is_empty() {
            self.fallback.extend_from_slice(bytes);
            return String::new();
        }
        self.pending.extend_from_slice(bytes);

        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                let decoded = self.normalize(&text);
                self.pending.clear();
                decoded
            }
            Err(err) => {
                let valid = err.valid_up_to();
                // Safe: `valid` bytes were just validated.
                let text = std::str::from_utf8(&self.pending[..valid])
                    .expect("validated prefix")
                    .to_string();
                let decoded = self.normalize(&text);
                let rest = self.pending.split_off(valid);
                self.pending.clear();
                match err.error_len() {
                    // Partial trailing sequence, may complete next chunk.
                    None => self.pending = rest,
                    // Hard invalid bytes: defer the rest to the fallback pass.
                    Some(_) => self.fallback = rest,
                }
                decoded
            }
        }
    }

    /// Flush everything still buffered, decoding non-UTF-8 leftovers with
    /// the fallback encoding.
    pub fn finish(&mut self) -> String {
        let leftover: Vec<u8> = self.pending.drain(..).chain(self.fallback.drain(..)).collect();
        if leftover.is_empty() {
            return String::new();
        }
        let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&leftover);
        let text = text.into_owned();
        self.normalize(&text)
    }

    fn normalize(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '\n' && !self.last_was_cr {
                out.push_str("\r\n");
            } else {
                out.push(c);
            }
            self.last_was_cr = c == '\r';
        }
        out
    }
}
