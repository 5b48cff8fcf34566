//! Control channel server.
//!
//! A single-threaded, blocking TCP server. One client is served at a time;
//! others wait in the listen backlog. Each connection carries a sequence of
//! JSON requests (see [`crate::protocol`]) until the client disconnects.
//!
//! # Lifecycle
//!
//! - `wifi_reset` re-runs the connect-or-broadcast decision and then binds a
//!   fresh listener on the same port, since the device may now sit on a
//!   different network. The current connection is left open.
//! - `reset` stops accepting once the current connection finishes. The
//!   listener is closed, settings are persisted and the device reboots.
//!
//! Transport errors end a connection, never the server.

mod session;
mod socket;
mod upload;

pub use session::Session;
pub use socket::{Listener, SocketBinder, TcpBinder};
pub use upload::{chunk_sizes, receive_file, validate_filename, UploadError};

use crate::config::{ConfigStore, DISABLE_DEBUG_KEY};
use crate::platform::Platform;
use crate::protocol::{
    ack, error_response, is_truthy, methods_table, Method, ProtocolError, Request,
};
use crate::wifi::{
    add_known_ap, ConfigError, KnownAccessPoint, NetworkInterface, NetworkRole, WifiManager,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Attempts to re-acquire the control port before giving up.
const REBIND_ATTEMPTS: u32 = 5;

/// Pause between rebind attempts.
const REBIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything the request handlers operate on.
pub struct AgentContext<S, A, P> {
    pub store: ConfigStore,
    pub wifi: WifiManager<S, A>,
    pub platform: P,
    /// Directory `load_file` writes into.
    pub upload_dir: PathBuf,
}

impl<S, A, P> AgentContext<S, A, P>
where
    S: NetworkInterface,
    A: NetworkInterface,
    P: Platform,
{
    pub fn new(
        store: ConfigStore,
        wifi: WifiManager<S, A>,
        platform: P,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            wifi,
            platform,
            upload_dir: upload_dir.into(),
        }
    }

    /// Apply settings that take effect once at startup.
    pub fn apply_startup_settings(&mut self) {
        if self.store.get(DISABLE_DEBUG_KEY).is_some_and(is_truthy) {
            self.platform.suppress_debug_output();
        }
    }

    /// Startup sequence: apply settings, then join a known network or
    /// start broadcasting.
    pub fn boot(&mut self) -> NetworkRole {
        self.apply_startup_settings();
        let role = self.wifi.reset(&self.store);
        info!("Network up as {:?}", role);
        role
    }
}

/// The control channel server.
pub struct CommandServer<S, A, P, B: SocketBinder = TcpBinder> {
    ctx: AgentContext<S, A, P>,
    binder: B,
    port: u16,
    listener: Option<B::Listener>,
    keep_serving: bool,
}

impl<S, A, P, B> CommandServer<S, A, P, B>
where
    S: NetworkInterface,
    A: NetworkInterface,
    P: Platform,
    B: SocketBinder,
{
    /// Bind the control port. Port 0 picks a free port, which is then kept
    /// for every later rebind.
    pub fn bind(
        ctx: AgentContext<S, A, P>,
        mut binder: B,
        port: u16,
    ) -> Result<Self, ServerError> {
        let listener = binder
            .bind(port)
            .map_err(|source| ServerError::Bind { port, source })?;
        let port = listener.local_port()?;
        info!("Control channel listening on port {}", port);

        Ok(Self {
            ctx,
            binder,
            port,
            listener: Some(listener),
            keep_serving: true,
        })
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn context(&self) -> &AgentContext<S, A, P> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut AgentContext<S, A, P> {
        &mut self.ctx
    }

    /// Serve until a client asks for `reset`.
    ///
    /// On the way out the listener is closed, settings are persisted and the
    /// platform is asked to reboot. The context is handed back for hosts
    /// where reboot returns.
    pub fn serve(mut self) -> Result<AgentContext<S, A, P>, ServerError> {
        while self.keep_serving {
            let listener = match self.listener.as_ref() {
                Some(listener) => listener,
                None => {
                    self.rebind()?;
                    continue;
                }
            };

            match listener.accept() {
                Ok((stream, peer)) => self.handle_connection(stream, peer),
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }

        info!("Shutting down control channel");
        self.listener = None;
        if !self.ctx.store.flush() {
            warn!("Settings could not be persisted before reboot");
        }
        self.ctx.platform.reboot();
        Ok(self.ctx)
    }

    /// Drop the current listener and bind the same port again.
    fn rebind(&mut self) -> Result<(), ServerError> {
        self.listener = None;

        let mut last_error = None;
        for attempt in 1..=REBIND_ATTEMPTS {
            match self.binder.bind(self.port) {
                Ok(listener) => {
                    info!("Control channel rebound on port {}", self.port);
                    self.listener = Some(listener);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Rebind of port {} failed (attempt {}/{}): {}",
                        self.port, attempt, REBIND_ATTEMPTS, e
                    );
                    last_error = Some(e);
                    thread::sleep(REBIND_RETRY_DELAY);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse));
        error!("Giving up on port {}: {}", self.port, source);
        Err(ServerError::Bind {
            port: self.port,
            source,
        })
    }

    fn handle_connection(&mut self, stream: StreamOf<B>, peer: String) {
        info!("Client connected: {}", peer);

        let mut session = Session::new(stream, peer);
        loop {
            let message = match session.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) if e.is_transport() => {
                    warn!("Connection {} failed: {}", session.peer(), e);
                    break;
                }
                Err(e) => {
                    warn!("Bad request from {}: {}", session.peer(), e);
                    if !reply(&mut session, &error_response(&e)) {
                        break;
                    }
                    continue;
                }
            };
            debug!("<- {}: {}", session.peer(), message);

            let request = match Request::parse(message) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Rejected request from {}: {}", session.peer(), e);
                    if !reply(&mut session, &error_response(&e)) {
                        break;
                    }
                    continue;
                }
            };

            let response = match self.dispatch(&mut session, &request) {
                Ok(()) if request.method.descriptor().expects_generic_ack => ack(),
                Ok(()) => continue,
                Err(e) => {
                    warn!("{} failed: {}", request.method, e);
                    error_response(&e)
                }
            };
            if !reply(&mut session, &response) {
                break;
            }
        }
        info!("Client disconnected: {}", session.peer());
    }

    fn dispatch(
        &mut self,
        session: &mut Session<StreamOf<B>>,
        request: &Request,
    ) -> Result<(), ServerError> {
        match request.method {
            Method::Methods => session.send(&methods_table()).map_err(ServerError::Io),
            Method::Reset => {
                info!("Reset requested; finishing current connection");
                self.keep_serving = false;
                Ok(())
            }
            Method::WifiAdd => {
                let ap = KnownAccessPoint::new(
                    request.str_field("ssid")?,
                    request.str_field("password")?,
                    request.flag_field("hidden")?,
                )?;
                add_known_ap(&mut self.ctx.store, ap);
                Ok(())
            }
            Method::WifiReset => {
                self.ctx.wifi.reset(&self.ctx.store);
                if let Err(e) = self.rebind() {
                    // serve() retries before the next accept
                    warn!("Listener not rebound yet: {}", e);
                }
                Ok(())
            }
            Method::LoadFile => {
                receive_file(
                    session,
                    &self.ctx.upload_dir,
                    request.str_field("filename")?,
                    request.u64_field("length")?,
                )?;
                Ok(())
            }
        }
    }
}

type StreamOf<B> = <<B as SocketBinder>::Listener as Listener>::Stream;

/// Send a response; `false` means the connection is gone.
fn reply<T: Read + Write>(session: &mut Session<T>, message: &Value) -> bool {
    match session.send(message) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to respond to {}: {}", session.peer(), e);
            false
        }
    }
}

/// Server errors. Handler failures are reported to the client using the
/// `Display` text.
#[derive(Debug)]
pub enum ServerError {
    /// The control port could not be bound.
    Bind { port: u16, source: io::Error },
    /// Socket I/O failed.
    Io(io::Error),
    /// Request fields were missing or mistyped.
    Protocol(ProtocolError),
    /// Rejected network credentials.
    Config(ConfigError),
    /// File upload failed.
    Upload(UploadError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, source } => write!(f, "cannot bind port {}: {}", port, source),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(e) => write!(f, "{}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::Upload(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Upload(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<UploadError> for ServerError {
    fn from(e: UploadError) -> Self {
        Self::Upload(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistPolicy;
    use crate::platform::HostPlatform;
    use crate::wifi::SimulatedInterface;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;

    type TestContext = AgentContext<SimulatedInterface, SimulatedInterface, HostPlatform>;

    fn context(dir: &std::path::Path) -> TestContext {
        let store = ConfigStore::new(dir.join("config.json"), PersistPolicy::Immediate);
        let wifi = WifiManager::new(
            SimulatedInterface::station(),
            SimulatedInterface::access_point(),
        )
        .with_poll_interval(Duration::ZERO);
        AgentContext::new(store, wifi, HostPlatform::new(), dir)
    }

    #[test]
    fn test_disable_debug_setting_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.store.set(DISABLE_DEBUG_KEY, json!(true));
        ctx.apply_startup_settings();
        assert!(ctx.platform.debug_suppressed());
    }

    #[test]
    fn test_disable_debug_absent_leaves_output_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.store.set(DISABLE_DEBUG_KEY, json!(false));
        ctx.apply_startup_settings();
        assert!(!ctx.platform.debug_suppressed());
    }

    #[test]
    fn test_boot_without_known_networks_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        assert_eq!(ctx.boot(), NetworkRole::AccessPoint);
        assert!(ctx.wifi.access_point().applied_ap_config().is_some());
    }

    #[test]
    fn test_bind_port_zero_records_actual_port() {
        let dir = tempfile::tempdir().unwrap();
        let server = CommandServer::bind(context(dir.path()), TcpBinder::localhost(), 0).unwrap();
        assert_ne!(server.port(), 0);
    }

    /// Scripted client: fixed request bytes in, responses captured.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedListener {
        clients: Rc<RefCell<VecDeque<ScriptedStream>>>,
    }

    impl Listener for ScriptedListener {
        type Stream = ScriptedStream;

        fn accept(&self) -> io::Result<(ScriptedStream, String)> {
            self.clients
                .borrow_mut()
                .pop_front()
                .map(|stream| (stream, "scripted".to_string()))
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))
        }

        fn local_port(&self) -> io::Result<u16> {
            Ok(8080)
        }
    }

    #[derive(Default)]
    struct ScriptedBinder {
        clients: Rc<RefCell<VecDeque<ScriptedStream>>>,
        binds: Rc<Cell<usize>>,
    }

    impl ScriptedBinder {
        fn client(&self, requests: &[Value]) -> Rc<RefCell<Vec<u8>>> {
            let mut input = Vec::new();
            for request in requests {
                crate::protocol::write_message(&mut input, request).unwrap();
            }
            let output = Rc::new(RefCell::new(Vec::new()));
            self.clients.borrow_mut().push_back(ScriptedStream {
                input: Cursor::new(input),
                output: output.clone(),
            });
            output
        }
    }

    impl SocketBinder for ScriptedBinder {
        type Listener = ScriptedListener;

        fn bind(&mut self, _port: u16) -> io::Result<ScriptedListener> {
            self.binds.set(self.binds.get() + 1);
            Ok(ScriptedListener {
                clients: self.clients.clone(),
            })
        }
    }

    fn responses(output: &RefCell<Vec<u8>>) -> Vec<Value> {
        serde_json::Deserializer::from_slice(&output.borrow())
            .into_iter::<Value>()
            .map(|value| value.unwrap())
            .collect()
    }

    #[test]
    fn test_dispatch_sequence_on_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let binder = ScriptedBinder::default();
        let binds = binder.binds.clone();
        let output = binder.client(&[
            json!({"action": "wifi_add", "ssid": "Attic", "password": ""}),
            json!({"action": "frobnicate"}),
            json!({"action": "wifi_add", "ssid": "Attic", "password": "", "hidden": true}),
            json!({"action": "wifi_reset"}),
            json!({"action": "reset"}),
        ]);

        let server = CommandServer::bind(context(dir.path()), binder, 0).unwrap();
        assert_eq!(server.port(), 8080);
        let ctx = server.serve().unwrap();

        assert_eq!(
            responses(&output),
            vec![
                json!({"error": "Missing 'hidden' field"}),
                json!({"error": "no such method"}),
                json!({"error": false}),
                json!({"error": false}),
                json!({"error": false}),
            ]
        );
        assert_eq!(binds.get(), 2);
        assert_eq!(ctx.wifi.station().attempts(), ["Attic"]);
        assert!(ctx.platform.reboot_requested());
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn test_reset_waits_for_connection_to_finish() {
        let dir = tempfile::tempdir().unwrap();
        let binder = ScriptedBinder::default();
        let output = binder.client(&[json!({"action": "reset"}), json!({"action": "methods"})]);
        let never_served = binder.client(&[json!({"action": "methods"})]);

        let server = CommandServer::bind(context(dir.path()), binder, 0).unwrap();
        server.serve().unwrap();

        let replies = responses(&output);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], json!({"error": false}));
        assert!(replies[1].get("load_file").is_some());
        assert!(never_served.borrow().is_empty());
    }

    #[test]
    fn test_handler_errors_display_wire_text() {
        let err = ServerError::from(ProtocolError::MissingField("hidden"));
        assert_eq!(err.to_string(), "Missing 'hidden' field");
        let err = ServerError::from(ConfigError::SsidEmpty);
        assert_eq!(err.to_string(), "SSID cannot be empty");
    }
}
