//! Address and port helpers shared across the provisioner.

use std::collections::HashMap;

/// Extract the host portion of a node address such as
/// `http://10.10.10.10:4243`. Returns an empty string for empty input.
pub fn url_to_host(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = rest.split('/').next().unwrap_or("");
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}

/// Format a listen address suffix from an option map, defaulting to port 0.
pub fn bind_port(opts: &HashMap<String, String>) -> String {
    match opts.get("port") {
        Some(port) => format!(":{port}"),
        None => ":0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_to_host_cases() {
        let cases = [
            ("http://localhost:8081", "localhost"),
            ("http://localhost:3234", "localhost"),
            ("http://10.10.10.10:4243", "10.10.10.10"),
            ("https://node.example.com:2376", "node.example.com"),
            ("http://10.10.10.10:4243/path", "10.10.10.10"),
            ("10.10.10.10:4243", "10.10.10.10"),
            ("", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(url_to_host(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn bind_port_defaults_to_zero() {
        assert_eq!(bind_port(&HashMap::new()), ":0");
    }

    #[test]
    fn bind_port_uses_configured_port() {
        let opts = HashMap::from([("port".to_string(), "4242".to_string())]);
        assert_eq!(bind_port(&opts), ":4242");
    }
}
