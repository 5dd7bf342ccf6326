use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DataError, Result};
use crate::msg::Msg;

/// Length header of a binary entry: u64 little-endian.
pub const LENGTH_SIZE: usize = 8;

/// Default maximum binary value size accepted by the decoder: 16 MiB.
pub const DEFAULT_MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// A single decoded `key -> value` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key, lowercased.
    pub key: String,
    /// The raw value.
    pub value: Bytes,
}

/// Configuration for header message decoding.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Largest binary value accepted. Default: 16 MiB.
    pub max_value_len: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('=') || key.contains('\n') {
        return Err(DataError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Encode a message into its wire form.
///
/// ```text
/// scalar:  key '=' value '\n'                      (value has no '\n')
/// binary:  key '\n' len:u64-LE value[len]          (no trailing delimiter)
/// ```
pub fn encode(msg: &Msg) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(msg, &mut dst)?;
    Ok(dst.freeze())
}

/// Encode a message, appending to `dst`.
///
/// Nothing is written if any key is invalid.
pub fn encode_into(msg: &Msg, dst: &mut BytesMut) -> Result<()> {
    for (key, _) in msg.iter() {
        validate_key(key)?;
    }
    for (key, values) in msg.iter() {
        for value in values {
            if value.contains(&b'\n') {
                dst.reserve(key.len() + 1 + LENGTH_SIZE + value.len());
                dst.put_slice(key.as_bytes());
                dst.put_u8(b'\n');
                dst.put_u64_le(value.len() as u64);
                dst.put_slice(value);
            } else {
                dst.reserve(key.len() + value.len() + 2);
                dst.put_slice(key.as_bytes());
                dst.put_u8(b'=');
                dst.put_slice(value);
                dst.put_u8(b'\n');
            }
        }
    }
    Ok(())
}

fn decode_key(raw: &[u8]) -> Result<String> {
    let key = std::str::from_utf8(raw)
        .map_err(|_| DataError::InvalidUtf8(String::from_utf8_lossy(raw).into_owned()))?;
    if key.is_empty() {
        return Err(DataError::InvalidEntry(String::from_utf8_lossy(raw).into_owned()));
    }
    Ok(key.to_lowercase())
}

/// Decode one entry from the front of `src`.
///
/// Returns `Ok(None)` when `src` is empty, or when more bytes are needed and
/// `at_eof` is false. With `at_eof` set, an incomplete entry is an error,
/// except a final scalar line lacking its `\n`, which is accepted.
/// On success, also returns how many bytes the entry occupied.
pub fn decode_entry(
    src: &[u8],
    at_eof: bool,
    max_value_len: usize,
) -> Result<Option<(Entry, usize)>> {
    if src.is_empty() {
        return Ok(None);
    }

    let eol = src.iter().position(|b| *b == b'\n');
    let (line, line_end) = match eol {
        Some(i) => (&src[..i], i + 1),
        None if at_eof => (src, src.len()),
        None => return Ok(None),
    };

    if let Some(eq) = line.iter().position(|b| *b == b'=') {
        let key = decode_key(&line[..eq])?;
        let value = Bytes::copy_from_slice(&line[eq + 1..]);
        return Ok(Some((Entry { key, value }, line_end)));
    }

    if eol.is_none() {
        // Unterminated line without '=' at end of input.
        return Err(DataError::InvalidEntry(
            String::from_utf8_lossy(line).into_owned(),
        ));
    }
    let key = decode_key(line)?;

    let len_start = line_end;
    if src.len() < len_start + LENGTH_SIZE {
        if at_eof {
            return Err(DataError::MissingLength { key });
        }
        return Ok(None);
    }

    let mut len_bytes = &src[len_start..len_start + LENGTH_SIZE];
    let size = len_bytes.get_u64_le();
    if size > max_value_len as u64 {
        return Err(DataError::ValueTooLarge {
            key,
            size,
            max: max_value_len,
        });
    }

    let value_start = len_start + LENGTH_SIZE;
    let available = src.len() - value_start;
    let size = size as usize;
    if available < size {
        if at_eof {
            return Err(DataError::Truncated {
                key,
                expected: size as u64,
                got: available,
            });
        }
        return Ok(None);
    }

    let value = Bytes::copy_from_slice(&src[value_start..value_start + size]);
    Ok(Some((Entry { key, value }, value_start + size)))
}

/// Incremental decoder for header messages read in pieces.
///
/// Bytes are fed as they arrive; complete entries are handed out one by one,
/// and [`MsgDecoder::finish`] drains the rest once input has ended.
#[derive(Debug, Default)]
pub struct MsgDecoder {
    buf: BytesMut,
    config: DecodeConfig,
    consumed: usize,
}

impl MsgDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DecodeConfig) -> Self {
        Self {
            buf: BytesMut::new(),
            config,
            consumed: 0,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete entry, or `None` if more input is needed.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.take(false)
    }

    /// Signal end of input and decode every remaining entry.
    pub fn finish(mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.take(true)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Bytes fed but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes decoded into entries so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn take(&mut self, at_eof: bool) -> Result<Option<Entry>> {
        match decode_entry(&self.buf, at_eof, self.config.max_value_len)? {
            Some((entry, used)) => {
                self.buf.advance(used);
                self.consumed += used;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_binary_entries_on_the_wire() {
        let mut msg = Msg::new();
        msg.add("Name", "stdout");
        msg.add("script", "echo a\necho b");

        let wire = encode(&msg).expect("encode should succeed");

        let mut expected = Vec::new();
        expected.extend_from_slice(b"name=stdout\n");
        expected.extend_from_slice(b"script\n");
        expected.extend_from_slice(&13u64.to_le_bytes());
        expected.extend_from_slice(b"echo a\necho b");
        assert_eq!(wire.as_ref(), expected.as_slice());
    }

    #[test]
    fn empty_message_encodes_to_nothing() {
        let wire = encode(&Msg::new()).expect("encode should succeed");
        assert!(wire.is_empty());
    }

    #[test]
    fn invalid_keys_are_rejected() {
        for key in ["a=b", "a\nb"] {
            let mut msg = Msg::new();
            msg.add(key, "v");
            assert!(
                matches!(encode(&msg), Err(DataError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
        let mut msg = Msg::new();
        msg.add("", "v");
        assert!(matches!(encode(&msg), Err(DataError::InvalidKey(_))));
    }

    #[test]
    fn decode_entry_needs_more_bytes() {
        assert!(decode_entry(b"name=std", false, DEFAULT_MAX_VALUE_LEN)
            .unwrap()
            .is_none());
        assert!(decode_entry(b"blob\n\x05\x00", false, DEFAULT_MAX_VALUE_LEN)
            .unwrap()
            .is_none());

        let mut partial = b"blob\n".to_vec();
        partial.extend_from_slice(&5u64.to_le_bytes());
        partial.extend_from_slice(b"ab");
        assert!(decode_entry(&partial, false, DEFAULT_MAX_VALUE_LEN)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decode_entry_at_eof_reports_errors() {
        let err = decode_entry(b"blob\n\x05\x00", true, DEFAULT_MAX_VALUE_LEN).unwrap_err();
        assert!(matches!(err, DataError::MissingLength { ref key } if key == "blob"));

        let mut partial = b"blob\n".to_vec();
        partial.extend_from_slice(&5u64.to_le_bytes());
        partial.extend_from_slice(b"ab");
        let err = decode_entry(&partial, true, DEFAULT_MAX_VALUE_LEN).unwrap_err();
        assert!(matches!(
            err,
            DataError::Truncated {
                expected: 5,
                got: 2,
                ..
            }
        ));

        let err = decode_entry(b"garbage", true, DEFAULT_MAX_VALUE_LEN).unwrap_err();
        assert!(matches!(err, DataError::InvalidEntry(_)));
    }

    #[test]
    fn final_scalar_without_newline_is_accepted_at_eof() {
        let (entry, used) = decode_entry(b"status=0", true, DEFAULT_MAX_VALUE_LEN)
            .unwrap()
            .expect("entry should decode");
        assert_eq!(entry.key, "status");
        assert_eq!(entry.value.as_ref(), b"0");
        assert_eq!(used, 8);
    }

    #[test]
    fn scalar_splits_on_first_equals() {
        let (entry, _) = decode_entry(b"Expr=a=b\n", false, DEFAULT_MAX_VALUE_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(entry.key, "expr");
        assert_eq!(entry.value.as_ref(), b"a=b");
    }

    #[test]
    fn oversized_binary_value_is_rejected() {
        let mut wire = b"blob\n".to_vec();
        wire.extend_from_slice(&1024u64.to_le_bytes());
        let err = decode_entry(&wire, false, 16).unwrap_err();
        assert!(matches!(err, DataError::ValueTooLarge { size: 1024, max: 16, .. }));
    }

    #[test]
    fn decoder_yields_entries_as_bytes_arrive() {
        let mut msg = Msg::new();
        msg.add("a", "1");
        msg.add("b", "two\nlines");
        msg.add("c", "3");
        let wire = encode(&msg).unwrap();

        let mut decoder = MsgDecoder::new();
        let mut entries = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk);
            while let Some(entry) = decoder.next_entry().unwrap() {
                entries.push(entry);
            }
        }
        entries.extend(decoder.finish().unwrap());

        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(entries[1].value.as_ref(), b"two\nlines");
    }

    #[test]
    fn decoder_finish_fails_on_partial_entry() {
        let mut decoder = MsgDecoder::new();
        decoder.feed(b"ok=1\nblob\n\x01");
        assert!(decoder.next_entry().unwrap().is_some());
        assert!(decoder.next_entry().unwrap().is_none());
        assert_eq!(decoder.consumed(), 5);
        assert!(matches!(
            decoder.finish(),
            Err(DataError::MissingLength { .. })
        ));
    }
}
