//! avcall - Call-Session Engine
//!
//! Engine für Peer-to-Peer Audio/Video-Calls mit:
//! - Session Registry und Call State Machine
//! - Media Pipeline (Kamera, Audio-Routing, Bitrate, Preview)
//! - Control-Signal Channel über WebSocket-Relay oder In-Memory
//! - Ed25519-signierten Signalen
//! - SQLite-Anrufliste

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod database;
pub mod signaling;

use call_engine::{CallEngine, CallEngineError, CallEvent, MediaDevices};
use config::{ConfigError, EngineConfig};
use crypto::{KeyPair, KeyPairError};
use database::{CallLog, DatabaseError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use signaling::{ControlTransport, InboundSignal, SignalingError, WebSocketTransport};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Default-Filter wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "avcall=debug,tokio_tungstenite=warn";

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging; weitere Aufrufe sind No-ops
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

        // Ein bereits gesetzter globaler Subscriber (z.B. vom Host) bleibt aktiv
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    KeyPair(#[from] KeyPairError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Engine(#[from] CallEngineError),

    #[error("No signaling URL configured")]
    MissingSignalingUrl,
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Verdrahtet Engine, Transport und Anrufliste
pub struct CallApp {
    engine: Arc<CallEngine>,
    keypair: Arc<KeyPair>,
    call_log: Arc<CallLog>,
    relay: Option<Arc<WebSocketTransport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallApp {
    /// Startet die App mit WebSocket-Relay aus der Konfiguration
    ///
    /// Lädt Schlüssel und Anrufliste aus dem Datenverzeichnis, verbindet das
    /// Relay und richtet das Media-Setup ein.
    pub async fn init(config: EngineConfig) -> Result<Self, AppError> {
        init_logging();
        tracing::info!("Initializing avcall...");

        let config = config.with_env();
        config.validate()?;

        let data_dir = config.data_dir()?;
        let keypair = Arc::new(KeyPair::load_or_create(&data_dir)?);
        tracing::info!("Loaded keypair: {:?}", keypair);

        let call_log = Arc::new(CallLog::open(&data_dir)?);

        let (transport, inbound_rx) = Self::connect_relay(&config, Arc::clone(&keypair)).await?;

        let engine = Arc::new(CallEngine::new(
            config,
            default_devices(),
            Arc::clone(&transport) as Arc<dyn ControlTransport>,
        ));
        engine.setup()?;

        let mut app = Self::with_parts(engine, keypair, call_log);
        app.relay = Some(transport);
        app.spawn_signal_pump(inbound_rx);
        app.spawn_history_recorder();

        tracing::info!("avcall ready");
        Ok(app)
    }

    /// Baut den WebSocket-Transport aus der Konfiguration und verbindet ihn
    pub async fn connect_relay(
        config: &EngineConfig,
        keypair: Arc<KeyPair>,
    ) -> Result<(Arc<WebSocketTransport>, mpsc::Receiver<InboundSignal>), AppError> {
        let url = config.signaling_url()?.ok_or(AppError::MissingSignalingUrl)?;
        let (transport, inbound_rx) = WebSocketTransport::new(url, keypair);
        let transport = Arc::new(transport);
        transport.connect().await?;
        tracing::info!("Connected to relay as {}", transport.local_id());
        Ok((transport, inbound_rx))
    }

    /// Baut die App aus fertigen Teilen (eigener Transport, Tests)
    pub fn with_parts(engine: Arc<CallEngine>, keypair: Arc<KeyPair>, call_log: Arc<CallLog>) -> Self {
        Self {
            engine,
            keypair,
            call_log,
            relay: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    pub fn keypair(&self) -> &Arc<KeyPair> {
        &self.keypair
    }

    pub fn call_log(&self) -> &Arc<CallLog> {
        &self.call_log
    }

    pub fn relay_connected(&self) -> bool {
        self.relay.as_ref().is_some_and(|relay| relay.is_connected())
    }

    /// Reicht eingehende Signale an die Engine weiter
    pub fn spawn_signal_pump(&self, mut inbound_rx: mpsc::Receiver<InboundSignal>) {
        let engine = Arc::clone(&self.engine);
        let task = tokio::spawn(async move {
            while let Some(signal) = inbound_rx.recv().await {
                engine.handle_inbound(signal).await;
            }
            tracing::debug!("Signal pump stopped");
        });
        self.tasks.lock().push(task);
    }

    /// Schreibt jeden beendeten Call in die Anrufliste
    pub fn spawn_history_recorder(&self) {
        let mut event_rx = self.engine.subscribe();
        let call_log = Arc::clone(&self.call_log);

        let task = tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(CallEvent::CallEnded(call)) => {
                        if let Err(e) = call_log.record(&call) {
                            tracing::error!("Failed to record call {}: {}", call.handle, e);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("History recorder lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("History recorder stopped");
        });
        self.tasks.lock().push(task);
    }

    /// Beendet alle laufenden Calls und stoppt die Hintergrund-Tasks
    pub async fn shutdown(&self) {
        for call in self.engine.calls() {
            if !call.state.is_terminal() {
                if let Err(e) = self.engine.end_call(call.handle).await {
                    tracing::warn!("Hangup for {} failed during shutdown: {}", call.chat, e);
                }
            }
        }

        if let Some(relay) = &self.relay {
            relay.disconnect();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        tracing::info!("avcall shut down");
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("engine", &self.engine)
            .field("relay_connected", &self.relay_connected())
            .finish()
    }
}

/// Plattform-Geräte: cpal wenn aktiviert, sonst virtuelle Geräte
pub fn default_devices() -> Arc<dyn MediaDevices> {
    #[cfg(feature = "cpal-backend")]
    {
        Arc::new(call_engine::CpalDevices::new())
    }
    #[cfg(not(feature = "cpal-backend"))]
    {
        Arc::new(call_engine::VirtualDevices::new())
    }
}

// ============================================================================
// TESTS
// ============================================================================
