//! Logging initialisation and span constructors
//!
//! The metastore logs through `tracing`. Binaries and tests call
//! [`init_logging`] once; library code only emits events and spans.

use crate::config::LoggingConfig;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call
/// multiple times; only the first call has an effect, and an already
/// installed global subscriber is left in place.
///
/// # Example
///
/// ```rust
/// use profile_metastore::config::LoggingConfig;
/// use profile_metastore::observability::init_logging;
///
/// init_logging(&LoggingConfig::default());
/// ```
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        let registry = tracing_subscriber::registry().with(env_filter);
        let _ = match config.format.as_str() {
            "json" => registry.with(fmt::layer().json()).try_init(),
            "compact" => registry.with(fmt::layer().compact()).try_init(),
            _ => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Span for the application of one replicated command.
///
/// When the proposer's span is known the command span becomes its child,
/// otherwise it starts a new root.
#[must_use]
pub fn apply_span(parent: Option<&Span>, command: &str, index: u64, term: u64) -> Span {
    match parent {
        Some(parent) => tracing::info_span!(
            parent: parent,
            "fsm.apply_command",
            command = command,
            index = index,
            term = term,
        ),
        None => tracing::info_span!(
            parent: None,
            "fsm.apply_command",
            command = command,
            index = index,
            term = term,
        ),
    }
}

/// Span for compaction planner operations.
#[must_use]
pub fn compaction_span(operation: &str, tenant: &str, shard: u32, level: u32) -> Span {
    tracing::debug_span!(
        "compaction",
        op = operation,
        tenant = tenant,
        shard = shard,
        level = level,
    )
}
