//! Startup helpers shared by both binaries.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global log subscriber.
pub fn init_logging(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

/// Accept `CONSUL_HTTP_ADDR` style addresses (`host:port`) as well as URLs.
pub fn consul_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consul_url() {
        assert_eq!(consul_url("127.0.0.1:8500"), "http://127.0.0.1:8500");
        assert_eq!(consul_url("https://consul:8501"), "https://consul:8501");
    }
}
