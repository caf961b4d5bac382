use std::env;
use std::path::PathBuf;

pub const DEFAULT_CONFIG_FILE: &str = "lmvisor.json";
pub const DEFAULT_CLIENT_HOST: &str = "http://127.0.0.1:9696";

/// Path of the JSON config file (`LMVISOR_CONFIG`, default `lmvisor.json` in the working directory).
pub fn config_path() -> PathBuf {
    env::var("LMVISOR_CONFIG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Base URL the CLI client talks to (`LMVISOR_HOST`).
///
/// Accepts `host:port` or a full URL; a missing port falls back to 9696.
pub fn client_host() -> String {
    let raw = env::var("LMVISOR_HOST").unwrap_or_else(|_| DEFAULT_CLIENT_HOST.to_string());
    normalize_host(&raw)
}

fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim().trim_end_matches('/').to_string();

    if !host.starts_with("http://") && !host.starts_with("https://") {
        host = format!("http://{}", host);
    }

    // only the scheme separator, no explicit port
    if host.matches(':').count() < 2 {
        host = format!("{}:9696", host);
    }

    host
}

pub fn log_filter() -> String {
    env::var("RUST_LOG").unwrap_or_else(|_| "lmvisor=info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("192.168.1.5:9000"), "http://192.168.1.5:9000");
        assert_eq!(normalize_host("localhost"), "http://localhost:9696");
        assert_eq!(normalize_host("https://box:1234/"), "https://box:1234");
    }
}
