use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use bytes::Bytes;

use crate::codec::{self, DecodeConfig, MsgDecoder};
use crate::error::{DataError, Result};

/// Case-insensitive multimap of keys to ordered byte-string values.
///
/// Keys are lowercased on every access, so `Name` and `name` address the same
/// entry. Values are raw bytes: nested messages and file contents round-trip
/// unchanged. Iteration is in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    entries: BTreeMap<String, Vec<Bytes>>,
}

fn normalize(key: &str) -> String {
    key.to_lowercase()
}

impl Msg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to `key`.
    pub fn add(&mut self, key: &str, value: impl AsRef<[u8]>) {
        self.entries
            .entry(normalize(key))
            .or_default()
            .push(Bytes::copy_from_slice(value.as_ref()));
    }

    /// Replace all values of `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl AsRef<[u8]>) {
        self.entries.insert(
            normalize(key),
            vec![Bytes::copy_from_slice(value.as_ref())],
        );
    }

    /// Replace all values of `key`. An empty list keeps the key present
    /// locally, but a key without values encodes to nothing, so it does not
    /// survive [`Msg::encode`].
    pub fn set_all<I, V>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let values = values
            .into_iter()
            .map(|v| Bytes::copy_from_slice(v.as_ref()))
            .collect();
        self.entries.insert(normalize(key), values);
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(&normalize(key)).and_then(|v| v.first())
    }

    /// First value of `key` as UTF-8, `None` if absent or not UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All values of `key`, empty if absent.
    pub fn get_all(&self, key: &str) -> &[Bytes] {
        self.entries
            .get(&normalize(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(&normalize(key))
    }

    pub fn del(&mut self, key: &str) {
        self.entries.remove(&normalize(key));
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys and their values, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Bytes])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Parse the first value of `key` as a signed decimal integer.
    ///
    /// Surrounding spaces and tabs are ignored. A missing key is an error.
    pub fn get_int(&self, key: &str) -> Result<i64> {
        let raw = self.trimmed(key)?;
        raw.parse().map_err(|_| DataError::InvalidInt {
            key: normalize(key),
            value: raw.to_string(),
        })
    }

    /// Parse the first value of `key` as an unsigned decimal integer.
    pub fn get_uint(&self, key: &str) -> Result<u64> {
        let raw = self.trimmed(key)?;
        raw.parse().map_err(|_| DataError::InvalidInt {
            key: normalize(key),
            value: raw.to_string(),
        })
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn set_uint(&mut self, key: &str, value: u64) {
        self.set(key, value.to_string());
    }

    fn trimmed(&self, key: &str) -> Result<&str> {
        let raw: &[u8] = self.get(key).map(|v| &v[..]).unwrap_or_default();
        let text = std::str::from_utf8(raw)
            .map_err(|_| DataError::InvalidUtf8(normalize(key)))?;
        Ok(text.trim_matches(|c| c == ' ' || c == '\t'))
    }

    /// Decode the first value of `key` as a nested message.
    ///
    /// A missing key yields an empty message.
    pub fn get_msg(&self, key: &str) -> Result<Msg> {
        match self.get(key) {
            Some(raw) => Ok(Msg::decode(raw)?.0),
            None => Ok(Msg::new()),
        }
    }

    /// Encode `value` and store it as the single value of `key`.
    pub fn set_msg(&mut self, key: &str, value: &Msg) -> Result<()> {
        let encoded = value.encode()?;
        self.entries.insert(normalize(key), vec![encoded]);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        codec::encode(self)
    }

    /// Decode a complete message. `src` is treated as the whole input.
    pub fn decode(src: &[u8]) -> Result<(Msg, usize)> {
        Self::decode_with_config(src, &DecodeConfig::default())
    }

    pub fn decode_with_config(src: &[u8], config: &DecodeConfig) -> Result<(Msg, usize)> {
        let mut msg = Msg::new();
        let mut pos = 0;
        while let Some((entry, used)) =
            codec::decode_entry(&src[pos..], true, config.max_value_len)?
        {
            msg.push(entry);
            pos += used;
        }
        Ok((msg, pos))
    }

    /// Read and decode entries from `src` until it reaches end of file.
    pub fn read_from<R: Read>(src: R) -> Result<Msg> {
        Self::read_from_with_config(src, DecodeConfig::default())
    }

    pub fn read_from_with_config<R: Read>(mut src: R, config: DecodeConfig) -> Result<Msg> {
        let mut decoder = MsgDecoder::with_config(config);
        let mut msg = Msg::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            decoder.feed(&buf[..n]);
            while let Some(entry) = decoder.next_entry()? {
                msg.push(entry);
            }
        }
        for entry in decoder.finish()? {
            msg.push(entry);
        }
        Ok(msg)
    }

    pub(crate) fn push(&mut self, entry: codec::Entry) {
        self.entries.entry(entry.key).or_default().push(entry.value);
    }

    /// One-line rendering for logs: `k=v1,v2 k2=first line...`.
    pub fn short_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.entries.len());
        for (key, values) in &self.entries {
            let short: Vec<String> = values
                .iter()
                .map(|v| {
                    let text = String::from_utf8_lossy(v);
                    match text.split_once('\n') {
                        Some((first, _)) => format!("{first}..."),
                        None => text.into_owned(),
                    }
                })
                .collect();
            parts.push(format!("{key}={}", short.join(",")));
        }
        parts.join(" ")
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_string())
    }
}

impl<K: AsRef<str>, V: AsRef<[u8]>> FromIterator<(K, V)> for Msg {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut msg = Msg::new();
        for (k, v) in iter {
            msg.add(k.as_ref(), v);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut msg = Msg::new();
        msg.add("Content-Type", "beam-job");
        assert_eq!(msg.get_str("content-type"), Some("beam-job"));
        assert_eq!(msg.get_str("CONTENT-TYPE"), Some("beam-job"));
        assert!(msg.exists("content-TYPE"));

        msg.del("CONTENT-type");
        assert!(!msg.exists("content-type"));
        assert!(msg.is_empty());
    }

    #[test]
    fn repeated_values_keep_order() {
        let mut msg = Msg::new();
        msg.add("args", "-l");
        msg.add("ARGS", "/tmp");
        msg.add("args", "-a");

        let all: Vec<&[u8]> = msg.get_all("args").iter().map(|v| v.as_ref()).collect();
        assert_eq!(all, [b"-l".as_ref(), b"/tmp", b"-a"]);

        let (decoded, used) = Msg::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, msg.encode().unwrap().len());
    }

    #[test]
    fn binary_values_round_trip() {
        let mut msg = Msg::new();
        msg.add("text", "line1\nline2");
        msg.add("raw", [0u8, 159, 146, 150, b'\n', 255]);
        msg.add("plain", "x");

        let wire = msg.encode().unwrap();
        let (decoded, _) = Msg::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(
            decoded.get("raw").unwrap().as_ref(),
            &[0u8, 159, 146, 150, b'\n', 255]
        );
        assert_eq!(decoded.get_str("raw"), None);
    }

    #[test]
    fn set_replaces_values() {
        let mut msg = Msg::new();
        msg.add("k", "a");
        msg.add("k", "b");
        msg.set("K", "c");
        assert_eq!(msg.get_all("k").len(), 1);
        assert_eq!(msg.get_str("k"), Some("c"));

        msg.set_all("empty", Vec::<&str>::new());
        assert!(msg.exists("empty"));
        assert!(msg.get("empty").is_none());
    }

    #[test]
    fn keys_without_values_are_not_encoded() {
        let mut msg = Msg::new();
        msg.set("name", "x");
        msg.set_all("flags", Vec::<&str>::new());
        assert!(msg.exists("flags"));

        let (decoded, _) = Msg::decode(&msg.encode().unwrap()).unwrap();
        assert!(!decoded.exists("flags"));
        assert_eq!(decoded.get_str("name"), Some("x"));
    }

    #[test]
    fn integers_are_trimmed_and_parsed() {
        let mut msg = Msg::new();
        msg.set("id", " \t42\t ");
        msg.set("neg", "-7");
        msg.set("bad", "4x");
        assert_eq!(msg.get_uint("id").unwrap(), 42);
        assert_eq!(msg.get_int("neg").unwrap(), -7);
        assert!(matches!(
            msg.get_int("bad"),
            Err(DataError::InvalidInt { ref value, .. }) if value == "4x"
        ));
        assert!(msg.get_uint("neg").is_err());
        assert!(msg.get_int("missing").is_err());

        msg.set_int("status", 127);
        assert_eq!(msg.get_str("status"), Some("127"));
    }

    #[test]
    fn nested_messages() {
        let mut header = Msg::new();
        header.add("name", "stdout");
        header.add("note", "multi\nline");

        let mut info = Msg::new();
        info.set_uint("id", 3);
        info.set_msg("header", &header).unwrap();

        let (decoded, _) = Msg::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(decoded.get_uint("id").unwrap(), 3);
        assert_eq!(decoded.get_msg("header").unwrap(), header);
        assert!(decoded.get_msg("parent-id").unwrap().is_empty());
    }

    #[test]
    fn short_string_cuts_multiline_values() {
        let msg: Msg = [("name", "stdout"), ("script", "echo a\necho b"), ("name", "x")]
            .into_iter()
            .collect();
        assert_eq!(msg.short_string(), "name=stdout,x script=echo a...");
        assert_eq!(msg.to_string(), msg.short_string());
    }

    #[test]
    fn read_from_reader_until_eof() {
        let mut msg = Msg::new();
        msg.add("stdout", "first\nsecond");
        msg.set_int("status", 0);
        let wire = msg.encode().unwrap();

        let decoded = Msg::read_from(std::io::Cursor::new(wire.to_vec())).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn read_from_reports_truncation() {
        let mut wire = b"blob\n".to_vec();
        wire.extend_from_slice(&10u64.to_le_bytes());
        wire.extend_from_slice(b"abc");
        let err = Msg::read_from(std::io::Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, DataError::Truncated { expected: 10, got: 3, .. }));
    }
}
