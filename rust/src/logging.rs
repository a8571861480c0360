//! Tracing subscriber for the chat core.
//!
//! Filter directives come from `RUST_LOG` (desktop only), then the
//! `log_filter` config field, then [`DEFAULT_FILTER`]. iOS goes to os_log
//! plus `<data_dir>/simplechat.log`, Android to logcat, everything else to
//! stderr. Only the first call installs a subscriber.

use std::path::PathBuf;

const DEFAULT_FILTER: &str = "simplechat_core=debug,reqwest=info,hyper=warn,info";
#[cfg(target_os = "ios")]
const LOG_FILE_NAME: &str = "simplechat.log";

pub(crate) struct LogSettings {
    pub(crate) filter: String,
    #[allow(unused)]
    pub(crate) data_dir: PathBuf,
}

impl LogSettings {
    pub(crate) fn new(data_dir: &str, configured_filter: Option<&str>) -> Self {
        #[cfg(not(any(target_os = "ios", target_os = "android")))]
        let from_env = std::env::var("RUST_LOG").ok();
        #[cfg(any(target_os = "ios", target_os = "android"))]
        let from_env: Option<String> = None;

        Self {
            filter: filter_directives(from_env.as_deref(), configured_filter),
            data_dir: PathBuf::from(data_dir),
        }
    }
}

/// First non-blank source wins; a blank config value means "use the default".
pub(crate) fn filter_directives(from_env: Option<&str>, configured: Option<&str>) -> String {
    [from_env, configured]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|f| !f.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

fn env_filter(directives: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("simplechat: bad log filter {directives:?} ({e}), using default");
        tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)
    })
}

pub(crate) fn init_logging(settings: &LogSettings) {
    let filter = env_filter(&settings.filter);

    #[cfg(target_os = "ios")]
    {
        use tracing_subscriber::prelude::*;

        let _ = std::fs::create_dir_all(&settings.data_dir);
        let file_layer = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(settings.data_dir.join(LOG_FILE_NAME))
            .ok()
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
            });

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_oslog::OsLogger::new("com.simplechat.app", "core"))
            .with(file_layer)
            .try_init();
    }

    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::prelude::*;

        let _ = tracing_subscriber::registry()
            .with(paranoid_android::layer("simplechat").with_filter(filter))
            .try_init();
    }

    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
