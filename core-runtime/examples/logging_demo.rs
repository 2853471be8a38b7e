//! Logging system demonstration
//!
//! Shows the log output of a simulated two-page import in each format.
//!
//! Run with:
//! ```bash
//! cargo run --example logging_demo
//! cargo run --example logging_demo -- json
//! cargo run --example logging_demo -- compact "core_runtime=trace"
//! ```

use core_runtime::logging::{init_logging, redact_if_sensitive, LogFormat, LogLevel, LoggingConfig};
use std::env;
use tracing::{debug, info, instrument, warn};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let format = match args.get(1).map(String::as_str) {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        Some(_) => LogFormat::Pretty,
        None => LogFormat::default(),
    };

    let mut config = LoggingConfig::default()
        .with_format(format)
        .with_level(LogLevel::Debug)
        .with_spans(true)
        .with_target(true);
    if let Some(filter) = args.get(2) {
        config = config.with_filter(filter.clone());
    }

    if let Err(e) = init_logging(config) {
        eprintln!("Failed to initialize logging: {}", e);
        return;
    }

    info!(
        access_token = %redact_if_sensitive("access_token", "eyJhbGciOiJIUzI1NiJ9"),
        "Connector configured"
    );

    for page in 1..=2 {
        import_page(42, page, 2).await;
    }
}

#[instrument(fields(run_id = "demo-run"))]
async fn import_page(source_id: i64, page: u32, total_pages: u32) {
    debug!("Fetching page");
    if page == 1 {
        warn!(identifier = "0012", "Skipping malformed feed entry");
    }
    info!(active = 98, inactive = 2, "Page imported");
    if page == total_pages {
        info!("Import completed, watermark advanced");
    } else {
        info!(next_page = page + 1, "Next import page scheduled");
    }
}
