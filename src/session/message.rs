//! Wire codec for daemon frames.
//!
//! A frame is one line of UTF-8: an operation name, then `?`, then
//! ordered `key=value` pairs joined with `&`, all percent-encoded.
//! Example: `find-packages?query=zlib&rqid=7`. Every response frame
//! echoes the `rqid` of the call it belongs to.

use std::fmt;

use crate::error::{Error, Result};

/// Key carried by every frame tying it to its logical call.
pub const RQID: &str = "rqid";

/// One framed key/value message, field order preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    op: String,
    fields: Vec<(String, String)>,
}

impl Message {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            fields: Vec::new(),
        }
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    /// Appends a field. Duplicate keys are kept in order; [`get`]
    /// returns the first occurrence.
    ///
    /// [`get`]: Message::get
    pub fn add(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Appends a field only when the flag has a value.
    pub fn add_opt_bool(self, key: &str, value: Option<bool>) -> Self {
        match value {
            Some(v) => self.add(key, v),
            None => self,
        }
    }

    pub fn set_rqid(self, rqid: u64) -> Self {
        self.add(RQID, rqid)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeated key, in wire order.
    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn rqid(&self) -> Option<u64> {
        self.get(RQID).and_then(|v| v.parse().ok())
    }

    /// Encodes to one line (no trailing newline).
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&urlencoding::encode(&self.op));
        out.push('?');
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(&urlencoding::encode(k));
            out.push('=');
            out.push_str(&urlencoding::encode(v));
        }
        out
    }

    /// Decodes one line. A malformed frame is a protocol error: the
    /// session treats it as fatal and tears the connection down.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (op, rest) = line
            .split_once('?')
            .ok_or_else(|| Error::Protocol(format!("frame has no operation separator: {line}")))?;
        let op = urlencoding::decode(op)
            .map_err(|e| Error::Protocol(format!("bad operation encoding: {e}")))?;
        if op.is_empty() {
            return Err(Error::Protocol("frame has empty operation".into()));
        }

        let mut fields = Vec::new();
        for pair in rest.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| Error::Protocol(format!("field without '=': {pair}")))?;
            let k = urlencoding::decode(k)
                .map_err(|e| Error::Protocol(format!("bad key encoding: {e}")))?;
            let v = urlencoding::decode(v)
                .map_err(|e| Error::Protocol(format!("bad value encoding: {e}")))?;
            fields.push((k.into_owned(), v.into_owned()));
        }

        Ok(Self {
            op: op.into_owned(),
            fields,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_order_and_values() {
        let msg = Message::new("find-packages")
            .add("query", "zlib & friends")
            .add("location", "https://feed/x?a=b")
            .set_rqid(42);

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.get("query"), Some("zlib & friends"));
        assert_eq!(decoded.rqid(), Some(42));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode("no-separator").is_err());
        assert!(Message::decode("?x=1").is_err());
        assert!(Message::decode("op?novalue").is_err());
    }

    #[test]
    fn test_empty_field_list() {
        let decoded = Message::decode("restarting?").unwrap();
        assert_eq!(decoded.op(), "restarting");
        assert_eq!(decoded.rqid(), None);
    }

    #[test]
    fn test_duplicate_keys_enumerate_in_order() {
        let msg = Message::new("r").add("pkg", "a").add("pkg", "b");
        let decoded = Message::decode(&msg.encode()).unwrap();
        let all: Vec<_> = decoded.get_all("pkg").collect();
        assert_eq!(all, vec!["a", "b"]);
        assert_eq!(decoded.get("pkg"), Some("a"));
    }
}
