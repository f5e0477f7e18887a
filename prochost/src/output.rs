//! Output aggregation for redirected streams.
//!
//! Each redirected pipe gets one reader that runs from before the process
//! starts until the pipe breaks, feeding a stream-specific sequence and a
//! shared chronological one. Decoding is incremental so multi-byte
//! sequences split across pipe reads survive intact.

use std::sync::{Arc, Mutex};

use crate::descriptor::StreamEncoding;

/// The chronological merge of both streams, appended to by both readers.
pub(crate) type SharedLines = Arc<Mutex<Vec<String>>>;

/// Incremental bytes-to-lines decoder. Completed lines are stripped of
/// embedded NUL padding and trailing whitespace before delivery.
pub(crate) struct LineDecoder {
    encoding: StreamEncoding,
    carry: Vec<u8>,
    text: String,
}

impl LineDecoder {
    pub(crate) fn new(encoding: StreamEncoding) -> Self {
        Self {
            encoding,
            carry: Vec::new(),
            text: String::new(),
        }
    }

    /// Feeds a chunk of raw bytes, invoking `on_line` for every line
    /// completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8], on_line: &mut dyn FnMut(String)) {
        self.carry.extend_from_slice(chunk);
        match self.encoding {
            StreamEncoding::Utf8 => self.decode_utf8(),
            StreamEncoding::Utf16Le => self.decode_utf16le(),
        }
        self.emit_complete_lines(on_line);
    }

    /// Flushes whatever remains after end-of-stream as a final line.
    pub(crate) fn finish(mut self, on_line: &mut dyn FnMut(String)) {
        // An incomplete trailing sequence at EOF can only be garbage; decode
        // it lossily rather than dropping bytes silently.
        if !self.carry.is_empty() {
            match self.encoding {
                StreamEncoding::Utf8 => {
                    self.text.push_str(&String::from_utf8_lossy(&self.carry));
                }
                StreamEncoding::Utf16Le => {
                    let units: Vec<u16> = self
                        .carry
                        .chunks(2)
                        .map(|pair| u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
                        .collect();
                    self.text.push_str(&String::from_utf16_lossy(&units));
                }
            }
            self.carry.clear();
        }
        self.emit_complete_lines(on_line);
        if !self.text.is_empty() {
            let line = std::mem::take(&mut self.text);
            on_line(clean_line(&line));
        }
    }

    fn decode_utf8(&mut self) {
        match std::str::from_utf8(&self.carry) {
            Ok(s) => {
                self.text.push_str(s);
                self.carry.clear();
            }
            Err(err) => {
                let valid = err.valid_up_to();
                // SAFETY-free split: the prefix is known valid UTF-8.
                self.text
                    .push_str(std::str::from_utf8(&self.carry[..valid]).unwrap_or_default());
                match err.error_len() {
                    // Incomplete sequence at the tail; wait for more bytes.
                    None => {
                        self.carry.drain(..valid);
                    }
                    // Truly invalid bytes: replace and move on.
                    Some(len) => {
                        self.text.push(char::REPLACEMENT_CHARACTER);
                        self.carry.drain(..valid + len);
                    }
                }
            }
        }
    }

    fn decode_utf16le(&mut self) {
        let mut take = self.carry.len() & !1;
        if take >= 2 {
            // Withhold a trailing high surrogate; its partner may be in the
            // next chunk.
            let last = u16::from_le_bytes([self.carry[take - 2], self.carry[take - 1]]);
            if (0xD800..0xDC00).contains(&last) {
                take -= 2;
            }
        }
        if take == 0 {
            return;
        }
        let units: Vec<u16> = self.carry[..take]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.text.push_str(&String::from_utf16_lossy(&units));
        self.carry.drain(..take);
    }

    fn emit_complete_lines(&mut self, on_line: &mut dyn FnMut(String)) {
        while let Some(pos) = self.text.find('\n') {
            let rest = self.text.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.text, rest);
            line.truncate(line.len() - 1);
            if line.ends_with('\r') {
                line.truncate(line.len() - 1);
            }
            on_line(clean_line(&line));
        }
    }
}

/// Strips embedded NUL padding and trailing whitespace.
fn clean_line(line: &str) -> String {
    let stripped: String = line.chars().filter(|&c| c != '\0').collect();
    stripped.trim_end().to_string()
}

/// Reads a redirected pipe to exhaustion, appending each decoded line to
/// both the stream's own sequence and the shared chronological one. A
/// zero-length read and a broken pipe are both normal end-of-stream.
#[cfg(windows)]
pub(crate) fn drain_pipe(
    pipe: crate::handles::OwnedHandle,
    encoding: StreamEncoding,
    interleaved: SharedLines,
) -> crate::error::Result<Vec<String>> {
    use crate::error::{Error, LaunchPhase};
    use windows::Win32::Foundation::ERROR_BROKEN_PIPE;
    use windows::Win32::Storage::FileSystem::ReadFile;

    let mut lines = Vec::new();
    let mut decoder = LineDecoder::new(encoding);
    let mut buffer = vec![0u8; 4096];

    let mut sink = |line: String| {
        let mut merged = match interleaved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        merged.push(line.clone());
        lines.push(line);
    };

    loop {
        let mut read = 0u32;
        let result = unsafe { ReadFile(pipe.raw(), Some(&mut buffer), Some(&mut read), None) };
        match result {
            Ok(()) if read == 0 => break,
            Ok(()) => decoder.push(&buffer[..read as usize], &mut sink),
            Err(err) if err.code() == ERROR_BROKEN_PIPE.to_hresult() => break,
            Err(err) => return Err(Error::launch(LaunchPhase::Monitor, err)),
        }
    }
    decoder.finish(&mut sink);
    drop(sink);
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(encoding: StreamEncoding, chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = LineDecoder::new(encoding);
        let mut lines = Vec::new();
        let mut sink = |line: String| lines.push(line);
        for chunk in chunks {
            decoder.push(chunk, &mut sink);
        }
        decoder.finish(&mut sink);
        lines
    }

    #[test]
    fn lines_arrive_in_order() {
        let lines = collect(StreamEncoding::Utf8, &[b"A\r\nB\r\n"]);
        assert_eq!(lines, ["A", "B"]);
    }

    #[test]
    fn line_split_across_chunks() {
        let lines = collect(StreamEncoding::Utf8, &[b"hel", b"lo\nwor", b"ld\n"]);
        assert_eq!(lines, ["hello", "world"]);
    }

    #[test]
    fn final_line_without_newline_is_flushed() {
        let lines = collect(StreamEncoding::Utf8, &[b"no newline"]);
        assert_eq!(lines, ["no newline"]);
    }

    #[test]
    fn nul_padding_and_trailing_whitespace_are_stripped() {
        let lines = collect(StreamEncoding::Utf8, &[b"ok\0\0 \t \n"]);
        assert_eq!(lines, ["ok"]);
    }

    #[test]
    fn interior_blank_lines_survive() {
        let lines = collect(StreamEncoding::Utf8, &[b"a\n\nb\n"]);
        assert_eq!(lines, ["a", "", "b"]);
    }

    #[test]
    fn utf8_sequence_split_across_chunks() {
        // U+00E9 is 0xC3 0xA9.
        let lines = collect(StreamEncoding::Utf8, &[b"caf\xC3", b"\xA9\n"]);
        assert_eq!(lines, ["café"]);
    }

    #[test]
    fn utf16_line_decoding() {
        let bytes: Vec<u8> = "AB\r\nC\n"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let lines = collect(StreamEncoding::Utf16Le, &[&bytes]);
        assert_eq!(lines, ["AB", "C"]);
    }

    #[test]
    fn utf16_surrogate_pair_split_across_chunks() {
        let bytes: Vec<u8> = "𝄞\n"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        // Split between the high and low surrogate.
        let lines = collect(StreamEncoding::Utf16Le, &[&bytes[..2], &bytes[2..]]);
        assert_eq!(lines, ["𝄞"]);
    }
}
