//! Structured logging setup shared by the orchestrator binaries.
//!
//! - `LOG_FORMAT=json` switches to JSON lines for log shipping; anything else
//!   prints human-readable text.
//! - `RUST_LOG` controls filtering (default `info`), for example
//!   `RUST_LOG=wa_dispatch=debug,wa_maturation=info`.
//!
//! Dispatch and maturation code attach context through fields and spans:
//!
//! ```rust,ignore
//! let span = tracing::info_span!("dispatch", tenant_id = %req.tenant_id, role = %req.role);
//! async { scheduler.dispatch(req).await }.instrument(span).await;
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the global subscriber.
///
/// The service name is recorded once at startup so multi-process deployments
/// can be told apart in aggregated logs.
pub fn init_logging(service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let env_filter = default_filter();

    if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter);
    } else {
        init_text_logging(env_filter);
    }

    tracing::info!(service = service_name, format = %log_format, "Logging initialized");
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();
}

fn init_text_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .init();
}

/// Best-effort subscriber for tests; ignores "already set" errors.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}
