/// Whether the request host is a loopback address rather than a real
/// (sub)domain. Hosts like `127.0.0.1:8080` would otherwise be taken
/// for a subdomain of `0.0.1:8080`.
pub fn is_loopback_subdomain(host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    host == "localhost"
        || host == "127.0.0.1"
        || host == "0.0.0.0"
        || host == "::1"
        || host.ends_with(".localhost")
}

/// Percent-decode a path or query component. When `plus_as_space` is
/// set, `+` decodes to a space (query semantics).
pub(crate) fn decode_component(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Public decoding entrypoint used by the context's path accessors.
pub fn decode_path(input: &str) -> String {
    decode_component(input, false)
}

/// Public decoding entrypoint used by query parameter accessors.
pub fn decode_query(input: &str) -> String {
    decode_component(input, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback() {
        assert!(is_loopback_subdomain("127.0.0.1:8080"));
        assert!(is_loopback_subdomain("localhost"));
        assert!(!is_loopback_subdomain("admin.example.com"));
    }

    #[test]
    fn decoding() {
        assert_eq!(decode_path("/a%20b"), "/a b");
        assert_eq!(decode_query("a+b%21"), "a b!");
        assert_eq!(decode_path("/100%"), "/100%");
    }
}
