use hostgate_config::Config;
use hostgate_core::{AdmissionFilter, ProxyMetrics, SniError, extract_sni};

/// Builds a complete TLS ClientHello record with the given SNI.
fn build_client_hello(domain: &str) -> Vec<u8> {
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
        0x03, // TLS 1.2
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01, // ClientHello
        ((handshake_len as u32) >> 16) as u8,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03,
        0x03, // TLS version
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
fn test_config_feeds_filter() {
    let config_str = r#"
listeners:
  http: "0.0.0.0:80"
  https: "0.0.0.0:443"
allowlist:
  hosts:
    - "example.com"
    - "www.google.com"
  snis:
    - "example.com"
"#;

    let config = Config::parse(config_str).expect("failed to parse config");
    let filter = AdmissionFilter::new(config.allowlist.hosts, config.allowlist.snis);

    assert!(filter.allow_http("example.com"));
    assert!(filter.allow_http("www.google.com:8080"));
    assert!(!filter.allow_http("evil.test"));

    assert!(filter.allow_sni("example.com"));
    assert!(!filter.allow_sni("www.google.com"));
}

#[test]
fn test_sni_extraction_integration() {
    let domain = "integration-test.example.com";
    let record = build_client_hello(domain);

    let extracted = extract_sni(&record).expect("failed to extract SNI");
    assert_eq!(extracted, domain);
}

#[test]
fn test_error_types_integration() {
    // Not a handshake record at all
    let alert = vec![0x15, 0x03, 0x01, 0x00, 0x02, 0x01, 0x00];
    match extract_sni(&alert) {
        Err(SniError::NotTls) => {}
        other => panic!("expected NotTls, got: {:?}", other),
    }

    // Truncated record: incomplete, which a complete-record read treats as
    // malformed
    let truncated = vec![0x16, 0x03];
    match extract_sni(&truncated) {
        Err(SniError::MalformedHello) => {}
        other => panic!("expected MalformedHello, got: {:?}", other),
    }
}

#[test]
fn test_gauges_visible_through_prometheus_registry() {
    use prometheus::{Encoder, TextEncoder};

    let registry = prometheus::Registry::new();
    let metrics = ProxyMetrics::new();
    metrics.register(&registry).expect("failed to register gauges");
    metrics.http_connections.add(3);

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .expect("failed to encode metrics");
    let exposition = String::from_utf8(buffer).unwrap();

    for expected in [
        "client_proxy_connections",
        "proxy_server_connections",
        "proxy_haproxy_connections",
        "http_connections",
        "https_connections",
    ] {
        assert!(exposition.contains(expected), "missing {expected}");
    }
    assert!(exposition.contains("http_connections 3"), "{exposition}");
}

#[test]
fn test_reload_swaps_allowlists_atomically() {
    let filter = AdmissionFilter::new(
        vec!["example.com".to_string()],
        vec!["example.com".to_string()],
    );
    let initial = filter.last_reload();

    filter.reload(
        vec!["replacement.example.org".to_string()],
        vec![],
    );

    assert!(!filter.allow_http("example.com"));
    assert!(!filter.allow_sni("example.com"));
    assert!(filter.allow_http("replacement.example.org"));
    assert!(!filter.allow_sni("replacement.example.org"));
    assert!(filter.last_reload() >= initial);
}
