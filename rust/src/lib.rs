mod actions;
mod backend;
mod core;
mod logging;
mod route_projection;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use backend::{
    AuthService, BackendError, BackendErrorKind, ChatServices, DirectoryService, FeedCallback,
    GroupRecord, LocalBackend, MessagingService, RemoteMessage, RestBackend, RestBackendOptions,
    SessionContext, UserRecord,
};
pub use route_projection::*;
pub use state::*;
pub use updates::*;

const MAX_USER_ID_LEN: usize = 100;

/// Return the default `simplechat_config.json` payload used when no config file exists.
pub fn default_config_json() -> String {
    core::default_app_config_json()
}

#[uniffi::export]
pub fn normalize_user_id(input: String) -> String {
    input.trim().to_string()
}

/// User ids the backend accepts: letters, digits, `_` and `-`.
#[uniffi::export]
pub fn is_valid_user_id(input: String) -> bool {
    let normalized = normalize_user_id(input);
    !normalized.is_empty()
        && normalized.chars().count() <= MAX_USER_ID_LEN
        && normalized
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

fn init_logging(data_dir: &str, config: &core::AppConfig) {
    let filter = config.log_filter();
    logging::init_logging(&logging::LogSettings::new(data_dir, filter.as_deref()));
}

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct FfiApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

#[uniffi::export]
impl FfiApp {
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        let config = core::load_app_config(&data_dir);
        init_logging(&data_dir, &config);
        tracing::info!(data_dir = %data_dir, "FfiApp::new() starting");

        let services = config.build_services();
        Self::start(config, services)
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl FfiApp {
    /// Same as `new`, but against caller-provided services. Config is still
    /// read from `data_dir` for page sizes and the sample-user denylist.
    pub fn with_services(data_dir: String, services: ChatServices) -> Arc<Self> {
        let config = core::load_app_config(&data_dir);
        init_logging(&data_dir, &config);
        Self::start(config, services)
    }

    fn start(config: core::AppConfig, services: ChatServices) -> Arc<Self> {
        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = match crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                config,
                services,
                shared_for_core,
            ) {
                Ok(core) => core,
                Err(e) => {
                    tracing::error!(err = %format!("{e:#}"), "app core failed to start");
                    return;
                }
            };
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        })
    }
}
