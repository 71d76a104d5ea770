//! tus `Upload-Metadata` header encoding: a comma-separated list of
//! `key base64(value)` pairs. Malformed entries are dropped, never fail the
//! request.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub type Metadata = BTreeMap<String, Vec<u8>>;

/// Keys the server injects or strips; clients may never set these directly.
pub const KEY_REMOTE_IP: &str = "RemoteIP";
pub const KEY_ACCOUNT: &str = "account";
pub const KEY_ISSUER: &str = "issuer";
pub const KEY_EXTJWT: &str = "extjwt";

pub fn parse(header: &str) -> Metadata {
    let mut out = Metadata::new();
    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, ' ');
        let Some(key) = parts.next() else { continue };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = match parts.next() {
            Some(encoded) => match BASE64.decode(encoded.trim()) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            },
            // a bare key with no value is valid tus metadata (empty value)
            None => Vec::new(),
        };
        out.insert(key.to_owned(), value);
    }
    out
}

pub fn serialize(meta: &Metadata) -> String {
    meta.iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{} {}", k, BASE64.encode(v))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Strips client-supplied server-controlled keys and injects the resolved
/// identity, returning the sanitized map ready for storage in the sidecar.
pub fn sanitize(mut meta: Metadata, remote_ip: &str, account: &str, issuer: &str) -> Metadata {
    meta.remove(KEY_REMOTE_IP);
    meta.remove(KEY_ACCOUNT);
    meta.remove(KEY_ISSUER);
    meta.remove(KEY_EXTJWT);

    if !remote_ip.is_empty() {
        meta.insert(KEY_REMOTE_IP.to_owned(), remote_ip.as_bytes().to_vec());
    }
    if !account.is_empty() {
        meta.insert(KEY_ACCOUNT.to_owned(), account.as_bytes().to_vec());
    }
    if !issuer.is_empty() {
        meta.insert(KEY_ISSUER.to_owned(), issuer.as_bytes().to_vec());
    }
    meta
}

pub fn get_str<'a>(meta: &'a Metadata, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(|v| std::str::from_utf8(v).ok())
}

/// Pulls the `extjwt` token out of a raw `Upload-Metadata` header value,
/// ahead of `sanitize` stripping the key for storage.
pub fn extract_extjwt(header: &str) -> Option<String> {
    parse(header).remove(KEY_EXTJWT).and_then(|v| String::from_utf8(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_values() {
        let mut meta = Metadata::new();
        meta.insert("filename".to_owned(), b"hello world.txt".to_vec());
        meta.insert("filetype".to_owned(), b"text/plain".to_vec());
        meta.insert("empty-value".to_owned(), Vec::new());

        let wire = serialize(&meta);
        let parsed = parse(&wire);
        assert_eq!(parsed, meta);
    }

    #[test]
    fn drops_entries_with_invalid_base64() {
        let meta = parse("filename aGVsbG8=,bad !!!not-base64!!!,filetype dGV4dC9wbGFpbg==");
        assert_eq!(meta.get("filename").map(Vec::as_slice), Some(&b"hello"[..]));
        assert!(!meta.contains_key("bad"));
        assert_eq!(meta.get("filetype").map(Vec::as_slice), Some(&b"text/plain"[..]));
    }

    #[test]
    fn sanitize_strips_and_injects_server_controlled_keys() {
        let mut meta = Metadata::new();
        meta.insert(KEY_REMOTE_IP.to_owned(), b"1.2.3.4".to_vec());
        meta.insert(KEY_ACCOUNT.to_owned(), b"attacker".to_vec());
        meta.insert(KEY_EXTJWT.to_owned(), b"token".to_vec());
        meta.insert("filename".to_owned(), b"a.txt".to_vec());

        let sanitized = sanitize(meta, "203.0.113.5", "alice", "issuer.example");

        assert_eq!(get_str(&sanitized, KEY_REMOTE_IP), Some("203.0.113.5"));
        assert_eq!(get_str(&sanitized, KEY_ACCOUNT), Some("alice"));
        assert_eq!(get_str(&sanitized, KEY_ISSUER), Some("issuer.example"));
        assert!(!sanitized.contains_key(KEY_EXTJWT));
        assert_eq!(get_str(&sanitized, "filename"), Some("a.txt"));
    }

    #[test]
    fn extract_extjwt_reads_the_token_out_of_the_raw_header() {
        let header = format!("filename {},extjwt {}", BASE64.encode(b"a.txt"), BASE64.encode(b"the.jwt.token"));
        assert_eq!(extract_extjwt(&header).as_deref(), Some("the.jwt.token"));
        assert_eq!(extract_extjwt("filename aGVsbG8="), None);
    }
}
