//! Tracing initialisation.
//!
//! Development gets human-readable console logs at debug level; production
//! gets JSON at info level. `RUST_LOG` overrides either default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sauti_core::Env;

pub fn init(env: Env) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match env {
        Env::Development => "sauti_server=debug,sauti_core=debug,tower_http=debug".into(),
        Env::Production => "sauti_server=info,sauti_core=info".into(),
    });

    let registry = tracing_subscriber::registry().with(filter);
    match env {
        Env::Development => registry.with(tracing_subscriber::fmt::layer()).init(),
        Env::Production => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
