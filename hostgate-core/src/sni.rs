//! TLS ClientHello parsing for SNI extraction.
//!
//! The parser walks a raw TLS record per RFC 6066 and reports three-way
//! outcomes: a hostname, "need more bytes", or a definite failure. The peek
//! driver in [`crate::peek`] feeds it incrementally as bytes arrive.

use std::fmt;
use std::io;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;

/// Largest TLS record length accepted before the stream is treated as
/// something other than TLS.
const MAX_RECORD_LEN: usize = 16 * 1024;

/// Errors that can occur while peeking the SNI out of a TLS ClientHello.
#[derive(Debug)]
pub enum SniError {
    /// I/O failure while reading the handshake bytes
    Read(io::Error),
    /// The first bytes are not a TLS handshake record
    NotTls,
    /// The handshake message is not a ClientHello
    NotClientHello,
    /// The ClientHello is structurally invalid or ended early
    MalformedHello,
    /// No server_name extension within the peek window
    SniNotFound,
}

impl fmt::Display for SniError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniError::Read(e) => write!(f, "read error: {}", e),
            SniError::NotTls => write!(f, "not a TLS handshake"),
            SniError::NotClientHello => write!(f, "not a ClientHello"),
            SniError::MalformedHello => write!(f, "malformed ClientHello"),
            SniError::SniNotFound => write!(f, "SNI not found"),
        }
    }
}

impl std::error::Error for SniError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SniError::Read(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SniError {
    fn from(err: io::Error) -> Self {
        SniError::Read(err)
    }
}

/// Parses the server name out of a possibly incomplete TLS ClientHello.
///
/// `Ok(Some(name))` carries the first host_name entry of the server_name
/// extension, lowercased. `Ok(None)` means the bytes seen so far are a valid
/// prefix of a ClientHello but the extension has not arrived yet; the caller
/// should read more and retry. Errors are final.
///
/// # Examples
///
/// ```
/// use hostgate_core::parse_sni;
///
/// // Too short to even hold a record header: keep reading
/// assert!(parse_sni(&[0x16, 0x03]).unwrap().is_none());
///
/// // An HTTP request is immediately rejected
/// assert!(parse_sni(b"GET / HTTP/1.1\r\n").is_err());
/// ```
pub fn parse_sni(buf: &[u8]) -> Result<Option<String>, SniError> {
    if buf.len() < 5 {
        return Ok(None);
    }

    if buf[0] != TLS_HANDSHAKE || buf[1] != TLS_VERSION_MAJOR {
        return Err(SniError::NotTls);
    }

    let record_len = ((buf[3] as usize) << 8) | (buf[4] as usize);
    if record_len > MAX_RECORD_LEN {
        return Err(SniError::NotTls);
    }

    // The walk is bounded two ways: `have` is what has actually arrived,
    // `record_end` is what the header promises. Crossing `record_end` is a
    // malformed hello; crossing only `have` means more bytes are needed.
    let record_end = 5 + record_len;
    let have = buf.len().min(record_end);

    if have < 6 {
        return Ok(None);
    }
    if buf[5] != CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }

    if have < 9 {
        return Ok(None);
    }
    let handshake_len =
        ((buf[6] as usize) << 16) | ((buf[7] as usize) << 8) | (buf[8] as usize);
    if 9 + handshake_len > record_end {
        return Err(SniError::MalformedHello);
    }
    let hello_end = 9 + handshake_len;

    // client_version(2) + random(32)
    let mut pos = 9 + 2 + 32;

    // session_id
    if pos + 1 > hello_end {
        return Err(SniError::MalformedHello);
    }
    if pos + 1 > have {
        return Ok(None);
    }
    pos += 1 + buf[pos] as usize;

    // cipher_suites
    if pos + 2 > hello_end {
        return Err(SniError::MalformedHello);
    }
    if pos + 2 > have {
        return Ok(None);
    }
    pos += 2 + (((buf[pos] as usize) << 8) | (buf[pos + 1] as usize));

    // compression_methods
    if pos + 1 > hello_end {
        return Err(SniError::MalformedHello);
    }
    if pos + 1 > have {
        return Ok(None);
    }
    pos += 1 + buf[pos] as usize;

    // extensions
    if pos + 2 > hello_end {
        return Err(SniError::MalformedHello);
    }
    if pos + 2 > have {
        return Ok(None);
    }
    let extensions_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > hello_end {
        return Err(SniError::MalformedHello);
    }

    while pos + 4 <= extensions_end {
        if pos + 4 > have {
            return Ok(None);
        }
        let extension_type = ((buf[pos] as u16) << 8) | (buf[pos + 1] as u16);
        let extension_len = ((buf[pos + 2] as usize) << 8) | (buf[pos + 3] as usize);
        pos += 4;

        if pos + extension_len > extensions_end {
            return Err(SniError::MalformedHello);
        }

        if extension_type == SNI_EXTENSION {
            if pos + extension_len > have {
                return Ok(None);
            }
            return parse_server_name_list(&buf[pos..pos + extension_len]).map(Some);
        }

        pos += extension_len;
    }

    Err(SniError::SniNotFound)
}

/// Walks the server_name list and returns the first host_name entry.
fn parse_server_name_list(data: &[u8]) -> Result<String, SniError> {
    if data.len() < 2 {
        return Err(SniError::MalformedHello);
    }
    let list_len = ((data[0] as usize) << 8) | (data[1] as usize);
    let list_end = 2 + list_len;
    if list_end > data.len() {
        return Err(SniError::MalformedHello);
    }

    let mut pos = 2;
    while pos + 3 <= list_end {
        let name_type = data[pos];
        let name_len = ((data[pos + 1] as usize) << 8) | (data[pos + 2] as usize);
        pos += 3;

        if pos + name_len > list_end {
            return Err(SniError::MalformedHello);
        }

        if name_type == HOST_NAME_TYPE {
            return hostname_from_bytes(&data[pos..pos + name_len]);
        }

        pos += name_len;
    }

    Err(SniError::SniNotFound)
}

/// Validates and normalizes a host_name entry: non-empty, ASCII, no control
/// bytes, lowercased.
fn hostname_from_bytes(raw: &[u8]) -> Result<String, SniError> {
    if raw.is_empty() {
        return Err(SniError::MalformedHello);
    }
    if raw
        .iter()
        .any(|b| !b.is_ascii() || b.is_ascii_control())
    {
        return Err(SniError::MalformedHello);
    }
    let name = std::str::from_utf8(raw)
        .map_err(|_| SniError::MalformedHello)?
        .to_ascii_lowercase();
    Ok(name)
}

/// Extracts the SNI from a complete TLS ClientHello record.
///
/// Unlike [`parse_sni`], a record that is still incomplete is an error here.
/// Useful when the whole record is already in hand.
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    match parse_sni(record)? {
        Some(sni) => Ok(sni),
        None => Err(SniError::MalformedHello),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a valid ClientHello record carrying the given SNI.
    pub(crate) fn build_client_hello(domain: &str) -> Vec<u8> {
        let domain_bytes = domain.as_bytes();
        let domain_len = domain_bytes.len() as u16;

        let sni_list_len = 3 + domain_len;
        let sni_ext_len = 2 + sni_list_len;
        let extensions_len = 4 + sni_ext_len;
        let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
        let record_len = 4 + handshake_len;

        let mut record = vec![
            0x16,
            0x03,
            0x03,
            (record_len >> 8) as u8,
            (record_len & 0xff) as u8,
            0x01,
            ((handshake_len as u32) >> 16) as u8,
            (handshake_len >> 8) as u8,
            (handshake_len & 0xff) as u8,
            0x03,
            0x03,
        ];
        record.extend_from_slice(&[0; 32]); // Random
        record.extend_from_slice(&[
            0x00, // Session ID length
            0x00,
            0x02, // Cipher suites length
            0x00,
            0x00, // Cipher suite
            0x01,
            0x00, // Compression methods
            (extensions_len >> 8) as u8,
            (extensions_len & 0xff) as u8,
            0x00,
            0x00, // SNI extension type
            (sni_ext_len >> 8) as u8,
            (sni_ext_len & 0xff) as u8,
            (sni_list_len >> 8) as u8,
            (sni_list_len & 0xff) as u8,
            0x00, // Host name type
            (domain_len >> 8) as u8,
            (domain_len & 0xff) as u8,
        ]);
        record.extend_from_slice(domain_bytes);
        record
    }

    #[test]
    fn test_extract_sni_simple() {
        let record = build_client_hello("example.com");
        assert_eq!(extract_sni(&record).unwrap(), "example.com");
    }

    #[test]
    fn test_extract_sni_longer_domain() {
        let domain = "very.long.subdomain.example.com";
        let record = build_client_hello(domain);
        assert_eq!(extract_sni(&record).unwrap(), domain);
    }

    #[test]
    fn test_sni_is_lowercased() {
        let record = build_client_hello("Example.COM");
        assert_eq!(extract_sni(&record).unwrap(), "example.com");
    }

    #[test]
    fn test_non_ascii_sni_rejected() {
        let mut record = build_client_hello("exampl\u{7f}.com");
        match extract_sni(&record) {
            Err(SniError::MalformedHello) => {}
            other => panic!("expected MalformedHello, got: {:?}", other),
        }

        // Same with a high byte in the name
        let len = record.len();
        record[len - 4] = 0xC3;
        match extract_sni(&record) {
            Err(SniError::MalformedHello) => {}
            other => panic!("expected MalformedHello, got: {:?}", other),
        }
    }

    #[test]
    fn test_partial_record_wants_more() {
        let record = build_client_hello("example.com");

        // Every strict prefix is either "need more" or an error never seen
        // on a valid hello
        for cut in 0..record.len() {
            match parse_sni(&record[..cut]) {
                Ok(None) => {}
                other => panic!("prefix of len {} gave {:?}", cut, other),
            }
        }
        assert_eq!(parse_sni(&record).unwrap().unwrap(), "example.com");
    }

    #[test]
    fn test_not_tls() {
        match parse_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n") {
            Err(SniError::NotTls) => {}
            other => panic!("expected NotTls, got: {:?}", other),
        }

        // Alert record (0x15), not handshake
        let record = [0x15, 0x03, 0x01, 0x00, 0x02, 0x01, 0x00];
        match parse_sni(&record) {
            Err(SniError::NotTls) => {}
            other => panic!("expected NotTls, got: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_record_is_not_tls() {
        // Declared record length beyond 16 KiB
        let record = [0x16, 0x03, 0x01, 0x50, 0x00, 0x01];
        match parse_sni(&record) {
            Err(SniError::NotTls) => {}
            other => panic!("expected NotTls, got: {:?}", other),
        }
    }

    #[test]
    fn test_not_client_hello() {
        // ServerHello (0x02) in an otherwise plausible record
        let record = [0x16, 0x03, 0x03, 0x00, 0x30, 0x02, 0x00, 0x00, 0x2C];
        match parse_sni(&record) {
            Err(SniError::NotClientHello) => {}
            other => panic!("expected NotClientHello, got: {:?}", other),
        }
    }

    #[test]
    fn test_no_sni_extension() {
        let mut record = vec![
            0x16, 0x03, 0x03, 0x00, 0x2F, // record: 47 bytes of handshake
            0x01, 0x00, 0x00, 0x2B, // ClientHello, 43 bytes
            0x03, 0x03, // client_version
        ];
        record.extend_from_slice(&[0; 32]); // Random
        record.extend_from_slice(&[
            0x00, // Session ID length
            0x00, 0x02, // Cipher suites length
            0x00, 0x00, // Cipher suite
            0x01, 0x00, // Compression methods
            0x00, 0x00, // Extensions length: none
        ]);

        match parse_sni(&record) {
            Err(SniError::SniNotFound) => {}
            other => panic!("expected SniNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_other_extension_before_sni() {
        let domain = "example.net";
        let mut record = build_client_hello(domain);

        // Grow the extensions block with a leading extended_master_secret
        // extension so the SNI walk has to skip past it.
        let domain_len = domain.len() as u16;
        let sni_list_len = 3 + domain_len;
        let sni_ext_len = 2 + sni_list_len;
        let extensions_len = 4 + 4 + sni_ext_len; // dummy ext + SNI ext
        let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
        let record_len = 4 + handshake_len;

        record[3] = (record_len >> 8) as u8;
        record[4] = (record_len & 0xff) as u8;
        record[6] = ((handshake_len as u32) >> 16) as u8;
        record[7] = (handshake_len >> 8) as u8;
        record[8] = (handshake_len & 0xff) as u8;

        // Extensions length sits right before the SNI extension header
        let ext_len_at = 9 + 2 + 32 + 1 + 2 + 2 + 2;
        record[ext_len_at] = (extensions_len >> 8) as u8;
        record[ext_len_at + 1] = (extensions_len & 0xff) as u8;
        // Splice in the dummy extension header (type 0x0017, empty)
        record.splice(
            ext_len_at + 2..ext_len_at + 2,
            [0x00, 0x17, 0x00, 0x00],
        );

        assert_eq!(extract_sni(&record).unwrap(), domain);
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut record = build_client_hello("example.com");
        // Shrink the declared record length so the handshake no longer fits
        record[3] = 0x00;
        record[4] = 0x10;
        match parse_sni(&record) {
            Err(SniError::MalformedHello) => {}
            other => panic!("expected MalformedHello, got: {:?}", other),
        }
    }

    #[test]
    fn test_sni_error_display() {
        assert_eq!(SniError::NotTls.to_string(), "not a TLS handshake");
        assert_eq!(SniError::NotClientHello.to_string(), "not a ClientHello");
        assert_eq!(
            SniError::MalformedHello.to_string(),
            "malformed ClientHello"
        );
        assert_eq!(SniError::SniNotFound.to_string(), "SNI not found");
    }
}
