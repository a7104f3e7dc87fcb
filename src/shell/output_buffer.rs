use std::time::{Duration, Instant};

use tracing::debug;

/// Flush a chunk once this many bytes are buffered.
pub const DEFAULT_CUT_LENGTH: usize = 100;

/// Flush whatever is buffered once the newest byte is this old.
pub const MAX_TIME_SINCE_LAST_APPEND: Duration = Duration::from_millis(100);

//
// Output is buffered here as it comes off the session's byte stream, and
// handed to the consumer in chunks that are worth emitting as events:
//
//  - at least DEFAULT_CUT_LENGTH bytes, or
//  - fewer, once they have been sitting for MAX_TIME_SINCE_LAST_APPEND, and
//  - never cut in the middle of a UTF-8 sequence while the data is fresh.
//
// Stale data is emitted regardless of encoding validity so that malformed
// input cannot starve the stream.
//
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    last_append: Option<Instant>,
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.last_append = Some(Instant::now());
        self.bytes.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the next ready chunk, with `"\r\n"` pairs normalized to
    /// `"\n"`, or `None` when nothing is ready yet.
    pub fn flush(&mut self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }

        let stale = self.time_since_last_append() >= MAX_TIME_SINCE_LAST_APPEND;
        if self.bytes.len() < DEFAULT_CUT_LENGTH && !stale {
            debug!(
                "only {} bytes in the buffer and they are recent - waiting",
                self.bytes.len()
            );
            return None;
        }

        Some(self.cut(!stale))
    }

    /// Flushes everything left in the buffer, ignoring freshness. Used when a
    /// directive has terminated and no more appends are coming.
    pub fn drain(&mut self, mut on_chunk: impl FnMut(&str)) {
        while !self.bytes.is_empty() {
            // keep the no-split guarantee for all but the final chunk
            let utf8_guard = self.bytes.len() > DEFAULT_CUT_LENGTH;
            on_chunk(&self.cut(utf8_guard));
        }
    }

    fn cut(&mut self, utf8_guard: bool) -> String {
        let mut cut_length = self.bytes.len().min(DEFAULT_CUT_LENGTH);

        //
        // A UTF-8 sequence is at most 4 bytes, so shrinking the cut by up to
        // 3 bytes is enough to avoid splitting one. If none of the four
        // candidates validate the input is genuinely malformed, and the
        // original cut is flushed as-is.
        //
        if utf8_guard {
            let mut candidate = cut_length;
            for _ in 0..4 {
                if std::str::from_utf8(&self.bytes[..candidate]).is_ok() {
                    cut_length = candidate;
                    break;
                }
                if candidate == 0 {
                    break;
                }
                candidate -= 1;
            }
        }

        let chunk: Vec<u8> = self.bytes.drain(..cut_length).collect();
        String::from_utf8_lossy(&chunk).replace("\r\n", "\n")
    }

    fn time_since_last_append(&self) -> Duration {
        match self.last_append {
            Some(at) => at.elapsed(),
            None => Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn empty_buffer_has_nothing_to_flush() {
        let mut buffer = OutputBuffer::new();
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn short_fresh_data_is_held_back() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"hello");
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn short_data_is_flushed_once_stale() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"hello");
        sleep(MAX_TIME_SINCE_LAST_APPEND + Duration::from_millis(10));
        assert_eq!(buffer.flush(), Some("hello".to_string()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn long_data_is_flushed_immediately_in_cut_lengths() {
        let mut buffer = OutputBuffer::new();
        buffer.append("a".repeat(250).as_bytes());

        assert_eq!(buffer.flush(), Some("a".repeat(100)));
        assert_eq!(buffer.flush(), Some("a".repeat(100)));
        // the remainder is short and fresh again
        assert_eq!(buffer.flush(), None);
        sleep(MAX_TIME_SINCE_LAST_APPEND + Duration::from_millis(10));
        assert_eq!(buffer.flush(), Some("a".repeat(50)));
    }

    #[test]
    fn fresh_flush_does_not_split_a_multibyte_sequence() {
        let mut buffer = OutputBuffer::new();
        // 99 ascii bytes, then a 2-byte sequence straddling the cut point
        let mut input = "x".repeat(99);
        input.push('š');
        buffer.append(input.as_bytes());
        buffer.append("tail".as_bytes());

        let chunk = buffer.flush().expect("ready");
        assert_eq!(chunk, "x".repeat(99));

        sleep(MAX_TIME_SINCE_LAST_APPEND + Duration::from_millis(10));
        assert_eq!(buffer.flush(), Some("štail".to_string()));
    }

    #[test]
    fn stale_malformed_data_still_makes_progress() {
        let mut buffer = OutputBuffer::new();
        buffer.append(&[0xff; 120]);
        sleep(MAX_TIME_SINCE_LAST_APPEND + Duration::from_millis(10));

        let chunk = buffer.flush().expect("ready");
        assert!(!chunk.is_empty());
        assert_eq!(buffer.len(), 20);
    }

    #[test]
    fn crlf_pairs_are_normalized() {
        let mut buffer = OutputBuffer::new();
        buffer.append(b"one\r\ntwo\r\n");
        sleep(MAX_TIME_SINCE_LAST_APPEND + Duration::from_millis(10));
        assert_eq!(buffer.flush(), Some("one\ntwo\n".to_string()));
    }

    #[test]
    fn multibyte_input_round_trips_across_flush_cycles() {
        let original = "čić".repeat(60);
        let mut buffer = OutputBuffer::new();
        buffer.append(original.as_bytes());

        let mut collected = String::new();
        loop {
            match buffer.flush() {
                Some(chunk) => {
                    // every chunk is valid on its own; no sequence was split
                    collected.push_str(&chunk);
                }
                None if buffer.is_empty() => break,
                None => sleep(Duration::from_millis(20)),
            }
        }

        assert_eq!(collected, original);
    }

    #[test]
    fn drain_empties_the_buffer_regardless_of_freshness() {
        let mut buffer = OutputBuffer::new();
        buffer.append("fresh and short".as_bytes());

        let mut collected = String::new();
        buffer.drain(|chunk| collected.push_str(chunk));

        assert_eq!(collected, "fresh and short");
        assert!(buffer.is_empty());
    }
}
