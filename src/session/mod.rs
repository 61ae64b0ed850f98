//! Single-session MCP client lifecycle
//!
//! [`SessionManager`] owns at most one live protocol session with the wrapped
//! server. The session is established on first use and torn down on
//! `close()`. An error reply from the server leaves the session in place; a
//! broken transport drops it so the next call reconnects.
//!
//! The protocol itself sits behind two seams:
//! - [`SessionConnector`] launches the server and performs the handshake
//! - [`ProtocolSession`] issues requests on an initialized session
//!
//! [`StdioConnector`] is the production connector (rmcp over a child process).

mod exit_stack;
mod stdio;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, JsonObject, ListToolsResult};

use crate::config::ServerConfig;
use crate::error::WrapperError;

pub use exit_stack::ExitStack;
pub use stdio::StdioConnector;

/// How to launch the wrapped MCP server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerParams {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited process environment
    pub env: HashMap<String, String>,
}

impl From<&ServerConfig> for ServerParams {
    fn from(config: &ServerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}

/// Why a request on a live session failed
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server answered with an error; the session is still usable
    #[error("{0}")]
    Rejected(String),

    /// The transport or session broke and cannot carry further requests
    #[error("{0:#}")]
    Broken(anyhow::Error),
}

/// An initialized protocol session
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    async fn list_tools(&self) -> Result<ListToolsResult, SessionError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<CallToolResult, SessionError>;
}

/// Establishes protocol sessions with the wrapped server
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Launch the server, open its transport and complete the handshake.
    ///
    /// Every resource must be registered on `cleanup` as soon as it is
    /// acquired. On error the caller unwinds `cleanup`; on success it keeps
    /// the stack alongside the returned session until close.
    async fn connect(
        &self,
        params: &ServerParams,
        cleanup: &mut ExitStack,
    ) -> anyhow::Result<Box<dyn ProtocolSession>>;
}

/// Session handle and the resources backing it, always set and cleared together
struct ActiveSession {
    session: Box<dyn ProtocolSession>,
    cleanup: ExitStack,
}

/// Owns the one protocol session shared by every request
pub struct SessionManager {
    params: ServerParams,
    connector: Arc<dyn SessionConnector>,
    active: Option<ActiveSession>,
    launches: u64,
}

impl SessionManager {
    pub fn new(params: ServerParams, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            params,
            connector,
            active: None,
            launches: 0,
        }
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Number of connection attempts made so far
    pub fn launches(&self) -> u64 {
        self.launches
    }

    /// Connect if no session is held. Idempotent while a session is alive.
    pub async fn ensure_connection(&mut self) -> Result<(), WrapperError> {
        if self.active.is_some() {
            return Ok(());
        }

        tracing::info!(
            "Starting MCP server: {} {}",
            self.params.command,
            self.params.args.join(" ")
        );
        self.launches += 1;

        let mut cleanup = ExitStack::new();
        let connected = self.connector.connect(&self.params, &mut cleanup).await;
        match connected {
            Ok(session) => {
                tracing::info!("MCP session initialized successfully");
                self.active = Some(ActiveSession { session, cleanup });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to initialize MCP session: {:#}", e);
                if let Err(release) = cleanup.close().await {
                    tracing::warn!("Cleanup after failed connect was incomplete: {:#}", release);
                }
                Err(WrapperError::Connection(format!("{:#}", e)))
            }
        }
    }

    /// List the tools advertised by the wrapped server
    pub async fn list_tools(&mut self) -> Result<ListToolsResult, WrapperError> {
        self.ensure_connection().await?;
        let session = self.session()?;
        let result = session.list_tools().await;
        self.settle(result).await
    }

    /// Invoke `name` with `arguments` on the wrapped server
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: JsonObject,
    ) -> Result<CallToolResult, WrapperError> {
        if name.is_empty() {
            return Err(WrapperError::invalid_request("Tool name is required"));
        }

        self.ensure_connection().await?;
        let session = self.session()?;
        let result = session.call_tool(name, arguments).await;
        self.settle(result).await
    }

    /// Release the session and its resources.
    ///
    /// State is reset before anything is released, so a failing release
    /// still leaves the manager ready for a fresh connect.
    pub async fn close(&mut self) -> Result<(), WrapperError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        tracing::info!("Closing MCP session");
        drop(active.session);
        active
            .cleanup
            .close()
            .await
            .map_err(|e| WrapperError::Cleanup(format!("{:#}", e)))
    }

    fn session(&self) -> Result<&dyn ProtocolSession, WrapperError> {
        self.active
            .as_ref()
            .map(|active| active.session.as_ref())
            .ok_or_else(|| WrapperError::Connection("session not established".to_string()))
    }

/// Map a session result. Only a broken session is dropped; an error reply
    /// means the server is alive and keeps its state.
    async fn settle<T>(&mut self, result: Result<T, SessionError>) -> Result<T, WrapperError> {
        match result {
            Ok(value) => Ok(value),
            Err(SessionError::Rejected(message)) => {
                tracing::warn!("MCP server returned an error: {}", message);
                Err(WrapperError::Protocol(message))
            }
            Err(SessionError::Broken(e)) => {
                let message = format!("{:#}", e);
                tracing::warn!("MCP session broken, dropping it: {}", message);
                if let Err(release) = self.close().await {
                    tracing::warn!("{}", release);
                }
                Err(WrapperError::Protocol(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{Content, Tool};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Where a scripted connect should fail
    #[derive(Clone, Copy, PartialEq)]
    enum FailAt {
        Nowhere,
        Launch,
        Handshake,
    }

    struct ScriptedSession {
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProtocolSession for ScriptedSession {
        async fn list_tools(&self) -> Result<ListToolsResult, SessionError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SessionError::Broken(anyhow::anyhow!("connection closed")));
            }
            let schema = Arc::new(JsonObject::new());
            Ok(ListToolsResult {
                tools: vec![Tool::new("echo", "Echo the input", schema)],
                next_cursor: None,
                meta: None,
            })
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: JsonObject,
        ) -> Result<CallToolResult, SessionError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(SessionError::Broken(anyhow::anyhow!("connection closed")));
            }
            if name != "echo" {
                return Err(SessionError::Rejected(format!("-32602: Unknown tool: {}", name)));
            }
            Ok(CallToolResult::success(vec![Content::text(format!("called {}", name))]))
        }
    }

    struct ScriptedConnector {
        fail_at: Mutex<FailAt>,
        connects: AtomicUsize,
        log: Log,
        broken: Arc<AtomicBool>,
    }

    impl ScriptedConnector {
        fn new(fail_at: FailAt) -> Arc<Self> {
            Arc::new(Self {
                fail_at: Mutex::new(fail_at),
                connects: AtomicUsize::new(0),
                log: Arc::new(Mutex::new(Vec::new())),
                broken: Arc::new(AtomicBool::new(false)),
            })
        }

        fn record(&self, cleanup: &mut ExitStack, resource: &'static str) {
            self.log.lock().unwrap().push(format!("open {}", resource));
            let log = self.log.clone();
            cleanup.push(resource, move || async move {
                log.lock().unwrap().push(format!("close {}", resource));
                Ok(())
            });
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn connect(
            &self,
            _params: &ServerParams,
            cleanup: &mut ExitStack,
        ) -> anyhow::Result<Box<dyn ProtocolSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let fail_at = *self.fail_at.lock().unwrap();

            if fail_at == FailAt::Launch {
                anyhow::bail!("No such file or directory");
            }
            self.record(cleanup, "transport");
            self.record(cleanup, "session");
            if fail_at == FailAt::Handshake {
                anyhow::bail!("initialize handshake failed");
            }

            self.broken.store(false, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                broken: self.broken.clone(),
            }))
        }
    }

    fn params() -> ServerParams {
        ServerParams {
            command: "echo_mcp_server".into(),
            args: vec!["--stub".into()],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_first_call_connects_once() {
        let connector = ScriptedConnector::new(FailAt::Nowhere);
        let mut manager = SessionManager::new(params(), connector.clone());
        assert!(!manager.is_connected());

        let tools = manager.list_tools().await.unwrap();
        assert_eq!(tools.tools.len(), 1);
        manager.call_tool("echo", JsonObject::new()).await.unwrap();
        manager.list_tools().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.launches(), 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_releases_in_reverse_order() {
        let connector = ScriptedConnector::new(FailAt::Handshake);
        let mut manager = SessionManager::new(params(), connector.clone());

        let err = manager.list_tools().await.unwrap_err();

        assert!(matches!(err, WrapperError::Connection(_)));
        assert!(err.to_string().contains("initialize handshake failed"));
        assert!(!manager.is_connected());
        assert_eq!(
            connector.events(),
            vec!["open transport", "open session", "close session", "close transport"]
        );
    }

    #[tokio::test]
    async fn test_failed_connect_recovers_on_next_call() {
        let connector = ScriptedConnector::new(FailAt::Launch);
        let mut manager = SessionManager::new(params(), connector.clone());

        assert!(manager.list_tools().await.is_err());
        *connector.fail_at.lock().unwrap() = FailAt::Nowhere;
        assert!(manager.list_tools().await.is_ok());

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.events(), vec!["open transport", "open session"]);
    }

    #[tokio::test]
    async fn test_empty_tool_name_never_connects() {
        let connector = ScriptedConnector::new(FailAt::Nowhere);
        let mut manager = SessionManager::new(params(), connector.clone());

        let err = manager.call_tool("", JsonObject::new()).await.unwrap_err();

        assert!(matches!(err, WrapperError::InvalidRequest(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_reply_keeps_session() {
        let connector = ScriptedConnector::new(FailAt::Nowhere);
        let mut manager = SessionManager::new(params(), connector.clone());
        manager.list_tools().await.unwrap();

        let err = manager.call_tool("nope", JsonObject::new()).await.unwrap_err();
        assert!(matches!(err, WrapperError::Protocol(_)));
        assert!(err.to_string().contains("Unknown tool: nope"));
        assert!(manager.is_connected());

        manager.call_tool("echo", JsonObject::new()).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.events(), vec!["open transport", "open session"]);
    }

    #[tokio::test]
    async fn test_broken_session_is_dropped_and_reconnects() {
        let connector = ScriptedConnector::new(FailAt::Nowhere);
        let mut manager = SessionManager::new(params(), connector.clone());
        manager.list_tools().await.unwrap();

        connector.broken.store(true, Ordering::SeqCst);
        let err = manager.call_tool("echo", JsonObject::new()).await.unwrap_err();
        assert!(matches!(err, WrapperError::Protocol(_)));
        assert!(!manager.is_connected());

        let result = manager.call_tool("echo", JsonObject::new()).await.unwrap();
        let rendered = serde_json::to_value(&result).unwrap();
        assert_eq!(rendered["content"][0]["text"], "called echo");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_releases_and_resets() {
        let connector = ScriptedConnector::new(FailAt::Nowhere);
        let mut manager = SessionManager::new(params(), connector.clone());
        manager.list_tools().await.unwrap();

        manager.close().await.unwrap();
        assert!(!manager.is_connected());
        // Closing twice is a no-op
        manager.close().await.unwrap();

        assert_eq!(
            connector.events(),
            vec!["open transport", "open session", "close session", "close transport"]
        );
    }

    #[tokio::test]
    async fn test_close_resets_state_even_when_release_fails() {
        struct StubbornConnector;

        #[async_trait]
        impl SessionConnector for StubbornConnector {
            async fn connect(
                &self,
                _params: &ServerParams,
                cleanup: &mut ExitStack,
            ) -> anyhow::Result<Box<dyn ProtocolSession>> {
                cleanup.push("process", || async { Err(anyhow::anyhow!("kill failed")) });
                Ok(Box::new(ScriptedSession {
                    broken: Arc::new(AtomicBool::new(false)),
                }))
            }
        }

        let mut manager = SessionManager::new(params(), Arc::new(StubbornConnector));
        manager.ensure_connection().await.unwrap();

        let err = manager.close().await.unwrap_err();

        assert!(matches!(err, WrapperError::Cleanup(_)));
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_params_from_server_config() {
        let config = ServerConfig {
            command: "node".into(),
            args: vec!["server.js".into()],
            ..ServerConfig::default()
        };
        let params = ServerParams::from(&config);
        assert_eq!(params.command, "node");
        assert_eq!(params.args, vec!["server.js"]);
    }
}
