pub mod agent_core;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod inference;
pub mod protocol;
pub mod tools;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use agent_core::{
    ArtifactService, ArtifactStore, InMemoryArtifactStore, InMemorySessionStore, SessionStore,
    SqliteArtifactStore, SqliteSessionStore, ToolOrchestrator,
};
use collaborators::llm::{LlmChatResponder, LlmContentGenerator, LlmIntentClassifier};
use commands::{AppState, DispatchSettings, Dispatcher, Services};
use config::{GatewayConfig, StoreKind};
use inference::{GenerationBackend, InferenceClient};
use protocol::StreamSettings;
use tools::{BuiltinTools, ToolRegistry};

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/classroom-gateway/`
/// - Linux: `$XDG_DATA_HOME/classroom-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.classroom-gateway/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("classroom-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".classroom-gateway")
}

/// Initialize the tracing subscriber.
///
/// Rotates `gateway.log` (keeps the last 3), then writes to a fresh file
/// through a line-flushing writer. Falls back to stderr when the data
/// directory is not writable.
fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("classroom_gateway=info,warn"));

    let log_dir = data_dir();
    let log_path = log_dir.join("gateway.log");
    let log_file = std::fs::create_dir_all(&log_dir).and_then(|_| {
        rotate_log_file(&log_path, 3);
        std::fs::OpenOptions::new().create(true).append(true).open(&log_path)
    });

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    match log_file {
        Ok(file) => builder.with_writer(FlushingWriter::new(file)).init(),
        Err(e) => {
            builder.with_writer(std::io::stderr).init();
            tracing::warn!(error = %e, path = %log_path.display(), "log file unavailable, logging to stderr");
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== Classroom Gateway starting ==="
    );
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so a
/// crash never loses the lines leading up to it.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the SQLite path: the configured one, or `<data_dir>/gateway.db`.
fn resolve_db_path(configured: Option<&str>) -> String {
    if let Some(path) = configured.filter(|p| !p.is_empty()) {
        return config::expand_tilde(path);
    }
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join("gateway.db").to_string_lossy().into_owned()
}

/// Load the config file, or defaults when none can be found.
fn load_config() -> anyhow::Result<GatewayConfig> {
    let cwd = std::env::current_dir().context("cannot read the working directory")?;
    match config::find_config_path(&cwd) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading gateway config");
            Ok(config::load_gateway_config(&path)?)
        }
        Err(e) => {
            tracing::warn!(error = %e, "no gateway config found, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

/// Wire stores, the model backend, and collaborators into the HTTP state.
pub fn build_app(config: &GatewayConfig) -> anyhow::Result<AppState> {
    let (sessions, artifact_store): (Arc<dyn SessionStore>, Arc<dyn ArtifactStore>) = match config.session.store {
        StoreKind::Memory => (
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
        ),
        StoreKind::Sqlite => {
            let path = resolve_db_path(config.session.database_path.as_deref());
            let sessions =
                SqliteSessionStore::open(&path).with_context(|| format!("cannot open database at {path}"))?;
            let artifacts =
                SqliteArtifactStore::open(&path).with_context(|| format!("cannot open database at {path}"))?;
            tracing::info!(path = %path, "using sqlite stores");
            (Arc::new(sessions), Arc::new(artifacts))
        }
    };
    let artifacts = Arc::new(ArtifactService::new(artifact_store));

    let client = InferenceClient::from_config(config.models.clone())?;
    let backend: Arc<dyn GenerationBackend> = Arc::new(client);
    tracing::info!(chain = ?backend.model_chain(), "model fallback chain");

    let tools = Arc::new(BuiltinTools::new(
        ToolRegistry::builtin(),
        artifacts.clone(),
        Arc::new(LlmContentGenerator::new(backend.clone())),
    ));
    let services = Services {
        sessions,
        artifacts,
        classifier: Arc::new(LlmIntentClassifier::new(backend.clone())),
        responder: Arc::new(LlmChatResponder::new(backend.clone())),
        pipeline: None,
        orchestrator: ToolOrchestrator::new(backend, tools, config.orchestrator),
    };
    let settings = DispatchSettings {
        router: config.router,
        resolver: config.resolver,
        session: config.session.clone(),
    };

    Ok(AppState {
        dispatcher: Arc::new(Dispatcher::new(services, settings)),
        stream: StreamSettings::from(&config.stream),
    })
}

/// Run the gateway until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    let state = build_app(&config)?;
    let app = commands::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    tracing::info!("=== Classroom Gateway stopped ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gateway.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("gateway.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("gateway.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("gateway.log.1")).unwrap(), "current");
        assert_eq!(std::fs::read_to_string(dir.path().join("gateway.log.2")).unwrap(), "one");
    }

    #[test]
    fn test_configured_db_path_wins() {
        assert_eq!(resolve_db_path(Some("/tmp/x.db")), "/tmp/x.db");
    }

    #[tokio::test]
    async fn test_build_app_with_sqlite_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.session.store = StoreKind::Sqlite;
        config.session.database_path = Some(dir.path().join("g.db").to_string_lossy().into_owned());

        let state = build_app(&config).unwrap();
        assert!(state.dispatcher.sessions().list().await.unwrap().is_empty());
    }
}
