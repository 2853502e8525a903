//! Process-scoped owner of the registries, the pool and the pipeline.
//!
//! Everything that needs a collaborator gets an explicit `Arc` to it; there is
//! no ambient global state.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::{Agent, AgentProfile, ModelClient, OpenAiModel};
use crate::connections::{ConnectionManager, EndpointClassifier, HttpConnector, HttpSender, PoolStats};
use crate::events::{EventPipeline, EventStream};
use crate::secrets::{EnvSecretResolver, SecretResolver};
use crate::sessions::{ResolvedSession, SessionRegistry, SessionStats, Sweeper};
use crate::signing::{CredentialProvider, EnvCredentialProvider, RequestSigner};
use crate::tools::{LocalToolTable, ToolCatalog, ToolDescriptor, ToolRegistry};
use crate::types::{Config, Result};

/// Collaborators supplied by the embedder.
#[derive(Debug)]
pub struct RuntimeParts {
    pub model: Arc<dyn ModelClient>,
    pub secrets: Arc<dyn SecretResolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub local_tools: LocalToolTable,
}

#[derive(Debug)]
pub struct Runtime {
    config: Config,
    sessions: Arc<SessionRegistry>,
    tools: Arc<ToolRegistry>,
    pool: Arc<ConnectionManager>,
    pipeline: EventPipeline,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Runtime {
    pub fn new(config: Config, parts: RuntimeParts) -> Result<Self> {
        config.validate()?;

        let signer = Arc::new(RequestSigner::new(parts.credentials, config.signing.signature_ttl));
        let sender = Arc::new(HttpSender::with_timeouts(
            config.pool.connect_timeout,
            config.pool.call_timeout,
            signer,
        )?);
        let pool = Arc::new(ConnectionManager::new(
            config.pool.clone(),
            EndpointClassifier::new(&config.signing)?,
            parts.secrets,
            Arc::new(HttpConnector::new(sender)),
        ));

        let catalog = ToolCatalog::from_descriptors(config.tools.iter().cloned())?;
        let tools = Arc::new(ToolRegistry::new(
            catalog,
            parts.local_tools,
            Arc::clone(&pool),
            config.agents.clone(),
        )?);

        let profile = AgentProfile {
            system_prompt: config.model.system_prompt.clone(),
            ..AgentProfile::default()
        };
        let agent = Agent::new(parts.model, Arc::clone(&tools), profile, &config.pipeline);
        let sessions = Arc::new(SessionRegistry::new(config.sessions.clone(), agent));
        let pipeline = EventPipeline::new(config.pipeline.clone());

        info!(
            tools = config.tools.len(),
            agents = config.agents.len(),
            protected_rules = config.signing.protected.len(),
            "runtime initialized"
        );
        Ok(Self {
            config,
            sessions,
            tools,
            pool,
            pipeline,
            sweeper: Mutex::new(None),
        })
    }

    /// Production wiring: env secrets and credentials, built-in local tools
    /// and the configured OpenAI-compatible model backend.
    pub async fn from_config(config: Config) -> Result<Self> {
        let secrets: Arc<dyn SecretResolver> = Arc::new(EnvSecretResolver::new());
        let model = OpenAiModel::from_config(&config.model, secrets.as_ref()).await?;
        Self::new(
            config,
            RuntimeParts {
                model: Arc::new(model),
                secrets,
                credentials: Arc::new(EnvCredentialProvider),
                local_tools: LocalToolTable::with_builtins(),
            },
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn pool(&self) -> &Arc<ConnectionManager> {
        &self.pool
    }

    /// Start the background sweeper. A second call is a no-op.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.sweeper.lock().ok()?;
        if slot.is_some() {
            return None;
        }
        let mut sweeper = Sweeper::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.pool),
            self.config.sessions.sweep_interval,
        );
        let handle = sweeper.start();
        *slot = Some(sweeper);
        Some(handle)
    }

    /// Resolve the session and start a run for `message`.
    pub async fn chat(
        &self,
        session_id: Option<&str>,
        message: &str,
    ) -> Result<(ResolvedSession, EventStream)> {
        let resolved = self.resolve_session(session_id).await?;
        let stream = self.start_run(&resolved, message)?;
        Ok((resolved, stream))
    }

    pub async fn resolve_session(&self, session_id: Option<&str>) -> Result<ResolvedSession> {
        self.sessions.resolve(session_id).await
    }

    /// Fails with `Busy` while the session already has a run in flight.
    pub fn start_run(&self, resolved: &ResolvedSession, message: &str) -> Result<EventStream> {
        self.pipeline.start(&resolved.context, message)
    }

    /// Cancel the session's in-flight run. `Ok(false)` when nothing was running.
    pub async fn abort(&self, session_id: &str) -> Result<bool> {
        let context = self.sessions.lookup(session_id).await?;
        context.touch();
        let aborted = context.abort();
        if aborted {
            info!(session_id = %context.id(), "run abort requested");
        }
        Ok(aborted)
    }

    pub async fn destroy(&self, session_id: &str) -> bool {
        self.sessions.destroy(session_id).await
    }

    /// Catalog with per-session enabled state; catalog defaults without a
    /// session.
    pub async fn catalog(&self, session_id: Option<&str>) -> Result<Vec<ToolDescriptor>> {
        let overlay = match session_id {
            Some(id) => {
                let context = self.sessions.lookup(id).await?;
                context.touch();
                context.overlay()
            }
            None => Default::default(),
        };
        Ok(self.tools.catalog(&overlay))
    }

    pub async fn set_enabled(&self, session_id: &str, tool_id: &str, enabled: bool) -> Result<()> {
        let context = self.sessions.lookup(session_id).await?;
        context.touch();
        context.update_overlay(|overlay| self.tools.set_enabled(overlay, tool_id, enabled))
    }

    pub async fn stats(&self) -> (SessionStats, PoolStats) {
        (self.sessions.stats().await, self.pool.stats().await)
    }

    /// Stop the sweeper and close pooled connections.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(mut sweeper) = sweeper {
            sweeper.stop();
        }
        self.pool.shutdown().await;
        info!("runtime shut down");
    }
}
