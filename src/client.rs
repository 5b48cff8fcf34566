//! Host-side client for the control channel.
//!
//! # Example
//!
//! ```no_run
//! use wifi_agent_esp32::client::Client;
//!
//! let mut client = Client::connect(None)?; // discover on the local network
//! client.wifi_add("HomeNetwork", "password123", false)?;
//! client.wifi_reset()?;
//! # Ok::<(), wifi_agent_esp32::client::ClientError>(())
//! ```

use crate::discovery::{DISCOVERY_GROUP, DISCOVERY_PORT, MAX_REPLY_LEN, PING};
use crate::protocol::{write_message, CodecError, MessageReader, Method};
use log::{debug, info};
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long to wait for a discovery reply.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(100);

/// How long `wifi_reset` waits for its acknowledgment before moving on.
pub const WIFI_RESET_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Multicast TTL for discovery probes.
const DISCOVERY_TTL: u32 = 2;

/// Find an agent by multicast probe on the default group.
pub fn discover() -> Result<SocketAddr, ClientError> {
    discover_at(
        SocketAddr::new(IpAddr::V4(DISCOVERY_GROUP), DISCOVERY_PORT),
        DISCOVERY_TIMEOUT,
    )
}

/// Send a probe to `target` and wait for the first reply.
///
/// The agent address is the reply's source address with the port it
/// announced.
pub fn discover_at(target: SocketAddr, timeout: Duration) -> Result<SocketAddr, ClientError> {
    let bind = match target {
        SocketAddr::V4(v4) if v4.ip().is_loopback() => Ipv4Addr::LOCALHOST,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    let socket = UdpSocket::bind((bind, 0))?;
    if target.ip().is_multicast() {
        socket.set_multicast_ttl_v4(DISCOVERY_TTL)?;
    }
    socket.set_read_timeout(Some(timeout))?;
    socket.send_to(PING, target)?;

    let mut buf = [0u8; MAX_REPLY_LEN];
    let (n, from) = match socket.recv_from(&mut buf) {
        Ok(reply) => reply,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            return Err(ClientError::NotDiscovered)
        }
        Err(e) => return Err(e.into()),
    };

    let text = String::from_utf8_lossy(&buf[..n]);
    let port = text
        .trim()
        .parse::<u16>()
        .map_err(|_| ClientError::BadDiscoveryReply(text.to_string()))?;
    let addr = SocketAddr::new(from.ip(), port);
    info!("Discovered agent at {}", addr);
    Ok(addr)
}

/// Build request arguments from `key=value` words.
///
/// `no` and `false` (any case) become `false`, a bare key becomes `true`,
/// integers become numbers, everything else stays a string.
pub fn parse_cli_args<I, T>(words: I) -> Map<String, Value>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| match word.as_ref().split_once('=') {
            Some((key, value)) => (key.to_string(), cli_value(value)),
            None => (word.as_ref().to_string(), Value::Bool(true)),
        })
        .collect()
}

fn cli_value(raw: &str) -> Value {
    if matches!(raw.to_lowercase().as_str(), "no" | "false") {
        return Value::Bool(false);
    }
    match raw.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Connection to an agent.
pub struct Client {
    reader: MessageReader<TcpStream>,
    server: SocketAddr,
    methods: Map<String, Value>,
    /// `wifi_reset` acknowledgments sent by the agent but not read yet.
    pending_acks: usize,
    ack_timeout: Duration,
}

impl Client {
    /// Connect to `server`, or discover one when `None`, and fetch its
    /// method table.
    pub fn connect(server: Option<SocketAddr>) -> Result<Self, ClientError> {
        let server = match server {
            Some(addr) => addr,
            None => discover()?,
        };

        debug!("Connecting to {}", server);
        let stream = TcpStream::connect(server)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle's algorithm: {}", e);
        }

        let mut client = Self {
            reader: MessageReader::new(stream),
            server,
            methods: Map::new(),
            pending_acks: 0,
            ack_timeout: WIFI_RESET_ACK_TIMEOUT,
        };
        client.methods()?;
        Ok(client)
    }

    /// Address of the connected agent.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Change how long [`wifi_reset`](Self::wifi_reset) waits for its
    /// acknowledgment.
    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.ack_timeout = timeout;
    }

    /// Send a request without waiting for the reply.
    pub fn send(&mut self, action: &str, args: Map<String, Value>) -> Result<(), ClientError> {
        let mut request = args;
        request.insert("action".to_string(), Value::String(action.to_string()));
        debug!("-> {}", Value::Object(request.clone()));
        write_message(self.reader.get_mut(), &Value::Object(request))?;
        Ok(())
    }

    /// Read the next reply. A reply whose `error` is anything but `false`
    /// becomes [`ClientError::Remote`].
    pub fn response(&mut self) -> Result<Value, ClientError> {
        self.skip_pending_acks()?;
        let reply = self
            .reader
            .next_message()?
            .ok_or(ClientError::ConnectionClosed)?;
        debug!("<- {}", reply);

        match reply.get("error") {
            None | Some(Value::Bool(false)) => Ok(reply),
            Some(Value::String(message)) => Err(ClientError::Remote(message.clone())),
            Some(other) => Err(ClientError::Remote(other.to_string())),
        }
    }

    /// Invoke a method and wait for its reply.
    ///
    /// When the method table is known, the action and its required
    /// arguments are checked before anything is sent. `load_file` is
    /// refused here since it must be followed by the file contents; use
    /// [`load_file`](Self::load_file).
    pub fn call(&mut self, action: &str, args: Map<String, Value>) -> Result<Value, ClientError> {
        if action == Method::LoadFile.name() {
            return Err(ClientError::RequiresUpload(action.to_string()));
        }
        self.check_call(action, &args)?;
        self.send(action, args)?;
        self.response()
    }

    fn check_call(&self, action: &str, args: &Map<String, Value>) -> Result<(), ClientError> {
        if self.methods.is_empty() {
            return Ok(());
        }
        let method = self
            .methods
            .get(action)
            .ok_or_else(|| ClientError::UnknownMethod(action.to_string()))?;
        let required = method
            .get("args")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for arg in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(arg) {
                return Err(ClientError::MissingArgument {
                    method: action.to_string(),
                    arg: arg.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Fetch and cache the agent's method table.
    pub fn methods(&mut self) -> Result<&Map<String, Value>, ClientError> {
        self.send("methods", Map::new())?;
        match self.response()? {
            Value::Object(table) => self.methods = table,
            other => {
                return Err(ClientError::Remote(format!(
                    "unexpected method table: {}",
                    other
                )))
            }
        }
        Ok(&self.methods)
    }

    /// Method signatures such as `wifi_add(ssid, password, hidden)`.
    pub fn describe_methods(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|(name, method)| {
                let args: Vec<&str> = method
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| args.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                format!("{}({})", name, args.join(", "))
            })
            .collect()
    }

    /// Register a known network on the agent.
    pub fn wifi_add(
        &mut self,
        ssid: &str,
        password: &str,
        hidden: bool,
    ) -> Result<(), ClientError> {
        let args = json!({ "ssid": ssid, "password": password, "hidden": hidden });
        self.call("wifi_add", into_map(args))?;
        Ok(())
    }

    /// Ask the agent to redo its network selection.
    ///
    /// The acknowledgment is awaited for a short while only: the agent may
    /// move to another network and never deliver it. One that arrives later
    /// is skipped before the next reply is read.
    pub fn wifi_reset(&mut self) -> Result<(), ClientError> {
        self.check_call("wifi_reset", &Map::new())?;
        self.send("wifi_reset", Map::new())?;
        self.pending_acks += 1;

        self.reader.get_ref().set_read_timeout(Some(self.ack_timeout))?;
        let result = self.skip_pending_acks();
        self.reader.get_ref().set_read_timeout(None)?;

        match result {
            Err(ClientError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                debug!("No wifi_reset acknowledgment within {:?}", self.ack_timeout);
                Ok(())
            }
            Err(ClientError::ConnectionClosed) => {
                info!("Agent closed the connection after wifi_reset");
                Ok(())
            }
            other => other,
        }
    }

    fn skip_pending_acks(&mut self) -> Result<(), ClientError> {
        while self.pending_acks > 0 {
            let ack = self
                .reader
                .next_message()?
                .ok_or(ClientError::ConnectionClosed)?;
            debug!("<- {} (wifi_reset)", ack);
            self.pending_acks -= 1;
        }
        Ok(())
    }

    /// Upload a local file under its base name.
    pub fn load_file(&mut self, path: &Path) -> Result<Value, ClientError> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(ClientError::NotAFile(path.to_path_buf()));
        }
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ClientError::NotAFile(path.to_path_buf()))?;

        let args = into_map(json!({ "filename": filename, "length": metadata.len() }));
        self.check_call(Method::LoadFile.name(), &args)?;
        self.send(Method::LoadFile.name(), args)?;
        // Agent answers {"ready": true} before accepting raw bytes.
        self.response()?;

        let mut file = File::open(path)?;
        let sent = io::copy(&mut file, self.reader.get_mut())?;
        info!("Sent {} ({} bytes)", path.display(), sent);
        self.response()
    }

    /// Ask the agent to stop serving and reboot.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.call("reset", Map::new())?;
        Ok(())
    }

    /// Close the connection.
    pub fn disconnect(self) {
        if let Err(e) = self.reader.get_ref().shutdown(std::net::Shutdown::Both) {
            debug!("Shutdown of {} failed: {}", self.server, e);
        }
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    /// Socket or file I/O failed.
    Io(io::Error),
    /// Reply could not be decoded.
    Codec(CodecError),
    /// No agent answered the discovery probe.
    NotDiscovered,
    /// Discovery reply was not a port number.
    BadDiscoveryReply(String),
    /// Agent closed the connection.
    ConnectionClosed,
    /// Agent reported an error.
    Remote(String),
    /// Agent does not offer this method.
    UnknownMethod(String),
    /// A required argument was not supplied.
    MissingArgument { method: String, arg: String },
    /// Upload source is not a regular file.
    NotAFile(PathBuf),
    /// The method carries a file payload and cannot go through `call`.
    RequiresUpload(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Codec(e) => write!(f, "{}", e),
            Self::NotDiscovered => {
                write!(f, "no server address specified and discovery failed")
            }
            Self::BadDiscoveryReply(reply) => write!(f, "bad discovery reply: {:?}", reply),
            Self::ConnectionClosed => write!(f, "connection closed by agent"),
            Self::Remote(message) => write!(f, "{}", message),
            Self::UnknownMethod(name) => write!(f, "no such method: {}", name),
            Self::MissingArgument { method, arg } => {
                write!(f, "{} requires argument '{}'", method, arg)
            }
            Self::NotAFile(path) => write!(f, "{} is not a file", path.display()),
            Self::RequiresUpload(name) => {
                write!(f, "{} sends file contents; use the load-file command", name)
            }
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::Io(e),
            other => Self::Codec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods_table;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_cli_args() {
        let args = parse_cli_args([
            "ssid=Home",
            "password=a=b",
            "hidden=no",
            "verbose",
            "length=42",
        ]);
        assert_eq!(args["ssid"], json!("Home"));
        assert_eq!(args["password"], json!("a=b"));
        assert_eq!(args["hidden"], json!(false));
        assert_eq!(args["verbose"], json!(true));
        assert_eq!(args["length"], json!(42));
    }

    #[test]
    fn test_parse_cli_false_any_case() {
        let args = parse_cli_args(["hidden=FALSE", "other=No"]);
        assert_eq!(args["hidden"], json!(false));
        assert_eq!(args["other"], json!(false));
    }

    #[test]
    fn test_discover_timeout() {
        // Nothing listens on this freshly released port.
        let port = UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let target: SocketAddr = ([127, 0, 0, 1], port).into();
        let result = discover_at(target, Duration::from_millis(50));
        assert!(matches!(
            result,
            Err(ClientError::NotDiscovered) | Err(ClientError::Io(_))
        ));
    }

    #[test]
    fn test_remote_error_text() {
        let err = ClientError::Remote("Missing 'hidden' field".to_string());
        assert_eq!(err.to_string(), "Missing 'hidden' field");
    }

    #[test]
    fn test_late_wifi_reset_ack_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Agent that holds back the wifi_reset ack until the next request.
        let agent = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = MessageReader::new(stream);

            assert_eq!(reader.next_message().unwrap().unwrap()["action"], "methods");
            write_message(&mut writer, &methods_table()).unwrap();
            assert_eq!(
                reader.next_message().unwrap().unwrap()["action"],
                "wifi_reset"
            );
            assert_eq!(reader.next_message().unwrap().unwrap()["action"], "methods");
            write_message(&mut writer, &json!({"error": false})).unwrap();
            write_message(&mut writer, &methods_table()).unwrap();
        });

        let mut client = Client::connect(Some(addr)).unwrap();
        client.set_ack_timeout(Duration::from_millis(50));
        client.wifi_reset().unwrap();
        assert!(client.methods().unwrap().contains_key("load_file"));
        agent.join().unwrap();
    }
}
