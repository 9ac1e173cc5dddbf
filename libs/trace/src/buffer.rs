//! Masked, size-limited log buffer.
//!
//! Bytes flow through a holdback stage before landing in the readable log:
//! whenever the tail of the pending bytes could still grow into a masked
//! value, it is withheld until more input settles the question. A secret
//! split across two writes therefore still masks. The log never grows past
//! its byte limit plus a one-time epilogue.

use std::sync::Mutex;

use bytes::Bytes;

const MASKED_TEXT: &[u8] = b"[MASKED]";

const ANSI_BOLD_YELLOW: &str = "\x1b[0;33;1m";
const ANSI_RESET: &str = "\x1b[0;m";

struct Inner {
    log: Vec<u8>,
    /// Tail withheld because it may be a prefix of a masked value.
    pending: Vec<u8>,
    masks: Vec<Vec<u8>>,
    bytes_limit: usize,
    limit_exceeded: bool,
}

/// Thread-safe log buffer with masking.
pub struct TraceBuffer {
    inner: Mutex<Inner>,
}

impl TraceBuffer {
    pub fn new(bytes_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                log: Vec::new(),
                pending: Vec::new(),
                masks: Vec::new(),
                bytes_limit,
                limit_exceeded: false,
            }),
        }
    }

    /// Replace the set of masked substrings. Affects subsequent writes only.
    pub fn set_masked(&self, values: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.masks = values
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(String::into_bytes)
            .collect();
    }

    /// Append bytes. Never blocks on anything but the internal lock; always
    /// reports the full count as written.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.extend_from_slice(data);
        inner.advance();
        data.len()
    }

    /// Flush any withheld tail. Called once the writer side is done.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.advance();
        let rest = std::mem::take(&mut inner.pending);
        inner.emit(&rest);
    }

    /// Bytes visible to readers so far.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }

    /// Snapshot of `[offset, offset+n)`, clamped to the current size.
    pub fn bytes(&self, offset: usize, n: usize) -> Bytes {
        let inner = self.inner.lock().unwrap();
        if offset >= inner.log.len() {
            return Bytes::new();
        }
        let end = (offset + n).min(inner.log.len());
        Bytes::copy_from_slice(&inner.log[offset..end])
    }
}

impl Inner {
    /// Move pending bytes into the log, replacing masked values and holding
    /// back any tail that is still a prefix of one.
    fn advance(&mut self) {
        loop {
            let Some((pos, len)) = self.earliest_mask_match() else {
                break;
            };
            let prefix: Vec<u8> = self.pending[..pos].to_vec();
            self.emit(&prefix);
            self.emit(MASKED_TEXT);
            self.pending.drain(..pos + len);
        }

        let keep = self.holdback_len();
        let flush = self.pending.len() - keep;
        if flush > 0 {
            let head: Vec<u8> = self.pending[..flush].to_vec();
            self.emit(&head);
            self.pending.drain(..flush);
        }
    }

    /// Earliest (and at ties, longest) full mask match in the pending bytes.
    fn earliest_mask_match(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for mask in &self.masks {
            if let Some(pos) = find(&self.pending, mask) {
                let better = match best {
                    None => true,
                    Some((best_pos, best_len)) => {
                        pos < best_pos || (pos == best_pos && mask.len() > best_len)
                    }
                };
                if better {
                    best = Some((pos, mask.len()));
                }
            }
        }
        best
    }

    /// Length of the longest pending suffix that is a strict prefix of some
    /// mask.
    fn holdback_len(&self) -> usize {
        let mut keep = 0;
        for mask in &self.masks {
            let max = mask.len().saturating_sub(1).min(self.pending.len());
            for len in (keep + 1)..=max {
                if self.pending[self.pending.len() - len..] == mask[..len] {
                    keep = len;
                }
            }
        }
        keep
    }

    fn emit(&mut self, data: &[u8]) {
        if self.limit_exceeded {
            return;
        }

        let room = self.bytes_limit.saturating_sub(self.log.len());
        let take = room.min(data.len());
        self.log.extend_from_slice(&data[..take]);

        if self.log.len() >= self.bytes_limit {
            self.limit_exceeded = true;
            let epilogue = format!(
                "\n{ANSI_BOLD_YELLOW}Job's log exceeded limit of {} bytes.\n\
                 Job execution will continue but no more output will be collected.{ANSI_RESET}\n",
                self.bytes_limit
            );
            self.log.extend_from_slice(epilogue.as_bytes());
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> TraceBuffer {
        TraceBuffer::new(4096)
    }

    fn contents(buffer: &TraceBuffer) -> String {
        String::from_utf8_lossy(&buffer.bytes(0, buffer.size())).into_owned()
    }

    #[test]
    fn test_plain_write_passes_through() {
        let buffer = buffer();
        assert_eq!(buffer.write(b"hello world\n"), 12);
        assert_eq!(buffer.size(), 12);
        assert_eq!(contents(&buffer), "hello world\n");
    }

    #[test]
    fn test_masks_full_value() {
        let buffer = buffer();
        buffer.set_masked(vec!["secret123".into()]);

        buffer.write(b"token=secret123 done\n");
        buffer.finish();
        assert_eq!(contents(&buffer), "token=[MASKED] done\n");
    }

    #[test]
    fn test_masks_value_split_across_writes() {
        let buffer = buffer();
        buffer.set_masked(vec!["secret123".into()]);

        buffer.write(b"token=secr");
        // The partial match is withheld, not leaked.
        assert_eq!(contents(&buffer), "token=");

        buffer.write(b"et123 done\n");
        buffer.finish();
        assert_eq!(contents(&buffer), "token=[MASKED] done\n");
    }

    #[test]
    fn test_partial_match_flushes_when_disproven() {
        let buffer = buffer();
        buffer.set_masked(vec!["secret123".into()]);

        buffer.write(b"secre");
        buffer.write(b"tariat\n");
        buffer.finish();
        assert_eq!(contents(&buffer), "secretariat\n");
    }

    #[test]
    fn test_multiple_masks_prefer_longest_at_same_position() {
        let buffer = buffer();
        buffer.set_masked(vec!["abc".into(), "abcdef".into()]);

        buffer.write(b"xx abcdef yy\n");
        buffer.finish();
        assert_eq!(contents(&buffer), "xx [MASKED] yy\n");
    }

    #[test]
    fn test_limit_appends_epilogue_once() {
        let buffer = TraceBuffer::new(64);

        buffer.write(&[b'a'; 100]);
        buffer.write(b"more");
        buffer.finish();

        let text = contents(&buffer);
        assert!(text.starts_with(&"a".repeat(64)));
        assert_eq!(text.matches("exceeded limit of 64 bytes").count(), 1);
        assert!(!text.contains("more"));

        // Bounded by limit plus the epilogue.
        assert!(buffer.size() < 64 + 200);
    }

    #[test]
    fn test_windowed_reads() {
        let buffer = buffer();
        buffer.write(b"0123456789");

        assert_eq!(&buffer.bytes(0, 4)[..], b"0123");
        assert_eq!(&buffer.bytes(4, 100)[..], b"456789");
        assert!(buffer.bytes(100, 10).is_empty());
    }

    #[test]
    fn test_set_masked_affects_subsequent_writes_only() {
        let buffer = buffer();
        buffer.write(b"secret123 ");
        buffer.set_masked(vec!["secret123".into()]);
        buffer.write(b"secret123");
        buffer.finish();
        assert_eq!(contents(&buffer), "secret123 [MASKED]");
    }
}
