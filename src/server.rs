//! TCP front door.
//!
//! Accepts connections, gates them through the [`RateLimiter`] and hands
//! admitted ones to the [`SessionManager`]. One cancellation token stops the
//! accept loop, the session tick and the console sweep; the server then
//! waits up to `shutdown_timeout` for both loops to finish.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerSettings;
use crate::console::ConsoleManager;
use crate::error::Result;
use crate::program::ProgramRegistry;
use crate::protocol::handler::PacketHandler;
use crate::protocol::server::ServerHandler;
use crate::session::SessionManager;
use crate::utils::metrics::global_metrics;
use crate::utils::RateLimiter;

/// Everything a running server owns.
#[derive(Debug)]
pub struct Server {
    settings: ServerSettings,
    sessions: Arc<SessionManager>,
    consoles: Arc<ConsoleManager>,
    handler: Arc<ServerHandler>,
    limiter: Arc<RateLimiter>,
}

impl Server {
    /// Validate settings and load every program definition.
    pub fn new(settings: ServerSettings) -> Result<Self> {
        settings.validate_strict()?;

        let programs = Arc::new(ProgramRegistry::from_configs(&settings.programs)?);
        let consoles = Arc::new(ConsoleManager::new(settings.console.clone()));
        let handler = Arc::new(ServerHandler::new(
            programs,
            Arc::clone(&consoles),
            &settings.server,
        ));
        let handlers: Vec<Arc<dyn PacketHandler>> = vec![handler.clone() as Arc<dyn PacketHandler>];
        let sessions = Arc::new(SessionManager::new(
            settings.session.clone(),
            settings.server.max_frame_size,
            handlers,
        ));
        let limiter = Arc::new(RateLimiter::from_config(&settings.limiter));

        Ok(Self {
            settings,
            sessions,
            consoles,
            handler,
            limiter,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn consoles(&self) -> &Arc<ConsoleManager> {
        &self.consoles
    }

    pub fn handler(&self) -> &Arc<ServerHandler> {
        &self.handler
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.settings.server.address).await?;
        info!(address = %listener.local_addr()?, "Listening");
        Ok(listener)
    }

    /// Serve on an already bound listener until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tick = {
            let sessions = Arc::clone(&self.sessions);
            let cancel = shutdown.clone();
            tokio::spawn(async move { sessions.run(cancel).await })
        };
        let sweep = {
            let consoles = Arc::clone(&self.consoles);
            let cancel = shutdown.clone();
            tokio::spawn(async move { consoles.run(cancel).await })
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down server");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr).await,
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        let timeout = self.settings.server.shutdown_timeout;
        if tokio::time::timeout(timeout, async {
            let _ = tick.await;
            let _ = sweep.await;
        })
        .await
        .is_err()
        {
            warn!(?timeout, "Shutdown timeout reached, forcing exit");
        }

        global_metrics().log_metrics();
        Ok(())
    }

    /// Bind and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                signal.cancel();
            }
        });

        self.serve(listener, shutdown).await
    }

    async fn admit(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        if !self.limiter.check(addr.ip()) {
            global_metrics().rate_limited();
            debug!(%addr, "Connection refused by rate limiter");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        match self.sessions.open_session(stream, Some(addr)).await {
            Ok(session) => debug!(session = %session.id(), %addr, "Connection accepted"),
            Err(e) => warn!(%addr, error = %e, "Failed to open session"),
        }
    }
}
