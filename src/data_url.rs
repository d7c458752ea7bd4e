//! Converting binary data to and from a `data:` URL.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    // Some sources indicate that the Base64 data should be percent-encoded, but
    // in practice this breaks Gemini and probably several other LLMs.
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Parse a `data:{mime_type};base64,{data}` URL back into its MIME type and
/// decoded bytes. Returns `None` if `s` isn't a base64 data URL we recognize.
pub fn parse_data_url(s: &str) -> Option<(String, Vec<u8>)> {
    let rest = s.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    let data = BASE64_STANDARD.decode(data).ok()?;
    Some((mime_type.to_owned(), data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let url = data_url("image/png", b"hello");
        let (mime_type, data) = parse_data_url(&url).unwrap();
        assert_eq!(mime_type, "image/png");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_parse_rejects_non_data_url() {
        assert!(parse_data_url("https://example.com/image.png").is_none());
    }
}
