use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, filter::Targets, fmt, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Only events from this crate are printed; `RUST_LOG` picks their level.
pub fn init_logging(verbose: bool) {
    let level = if verbose { "btcrate=debug" } else { "btcrate=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().pretty().without_time())
        .with(app_filter())
        .with(env_filter)
        .init();
}

fn app_filter() -> Targets {
    Targets::new().with_target("btcrate", LevelFilter::TRACE)
}
