//! Raw-REPL client.
//!
//! Drives a MicroPython-style interpreter in raw mode: each exchange sends a
//! block of source terminated by `Ctrl-D`, then reads `OK`, the captured
//! stdout, `Ctrl-D`, the captured stderr, `Ctrl-D` and the `>` prompt.
//! Filesystem operations are expressed as small generated scripts.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Ack, DeviceCommand, DeviceEntry, DeviceSnapshot, Transport, TransportError, TransportResult};
use crate::sync::{FileKind, path};

const CTRL_A: u8 = 0x01;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const WRITE_CHUNK: usize = 256;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream a REPL link can run over.
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> LinkStream for S {}

enum Endpoint {
    Tcp(String),
    Attached(Option<Box<dyn LinkStream>>),
}

/// Raw-REPL transport over TCP or an attached stream.
pub struct ReplTransport {
    endpoint: Endpoint,
    stream: Option<BufReader<Box<dyn LinkStream>>>,
    connect_timeout: Duration,
    revision: u64,
    /// Set while an exchange is on the wire; still set means it was abandoned.
    mid_exchange: bool,
}

impl ReplTransport {
    /// Connect to `host:port` (a serial-to-TCP bridge or a WebREPL proxy).
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::with_endpoint(Endpoint::Tcp(address.into()))
    }

    /// Use an already-open stream. It can be connected once.
    pub fn attached(stream: impl LinkStream) -> Self {
        Self::with_endpoint(Endpoint::Attached(Some(Box::new(stream))))
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            revision: 0,
            mid_exchange: false,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open(&mut self) -> TransportResult<Box<dyn LinkStream>> {
        match &mut self.endpoint {
            Endpoint::Tcp(address) => {
                debug!(%address, "Opening device link");
                let stream = TcpStream::connect(address.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Endpoint::Attached(stream) => stream
                .take()
                .ok_or_else(|| TransportError::Disconnected("attached stream already used".to_string())),
        }
    }

    fn stream(&mut self) -> TransportResult<&mut BufReader<Box<dyn LinkStream>>> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    async fn read_until(&mut self, marker: &[u8]) -> TransportResult<Vec<u8>> {
        let stream = self.stream()?;
        let mut buf = Vec::new();
        while !buf.ends_with(marker) {
            match stream.read_u8().await {
                Ok(byte) => buf.push(byte),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(TransportError::Disconnected("device closed the link".to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(buf.len() - marker.len());
        Ok(buf)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let stream = self.stream()?.get_mut();
        match stream.write_all(bytes).await {
            Ok(()) => Ok(stream.flush().await?),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(TransportError::Disconnected("broken pipe".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enter_raw(&mut self) -> TransportResult<()> {
        self.write_all(&[b'\r', CTRL_C, CTRL_C]).await?;
        self.write_all(&[b'\r', CTRL_A]).await?;
        self.read_until(RAW_BANNER).await?;
        Ok(())
    }

    /// Run one block of source and return its stdout.
    ///
    /// Any failure other than an interpreter error leaves the link in an
    /// unknown position, so it is closed.
    async fn exec(&mut self, code: &[u8]) -> TransportResult<String> {
        let result = self.exchange(code).await;
        if let Err(e) = &result {
            if !matches!(e, TransportError::Device(_)) {
                debug!(error = %e, "Dropping device link");
                self.stream = None;
                self.mid_exchange = false;
            }
        }
        result
    }

    async fn exchange(&mut self, code: &[u8]) -> TransportResult<String> {
        if self.mid_exchange {
            self.stream = None;
            self.mid_exchange = false;
            return Err(TransportError::Disconnected(
                "previous exchange was interrupted".to_string(),
            ));
        }
        self.mid_exchange = true;
        trace!(bytes = code.len(), "Executing on device");

        self.write_all(code).await?;
        self.write_all(&[CTRL_D]).await?;

        let mut ok = [0u8; 2];
        self.stream()?.read_exact(&mut ok).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Disconnected("device closed the link".to_string())
            } else {
                TransportError::Io(e)
            }
        })?;
        if &ok != b"OK" {
            return Err(TransportError::Protocol(format!(
                "expected OK, got {:?}",
                String::from_utf8_lossy(&ok)
            )));
        }

        let stdout = self.read_until(&[CTRL_D]).await?;
        let stderr = self.read_until(&[CTRL_D]).await?;
        self.read_until(b">").await?;
        self.mid_exchange = false;

        if !stderr.is_empty() {
            let message = String::from_utf8_lossy(&stderr);
            let last = message.lines().last().unwrap_or_default().trim().to_string();
            return Err(TransportError::Device(last));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn ack(&mut self) -> Ack {
        self.revision += 1;
        Ack {
            revision: self.revision,
        }
    }
}

/// Absolute device path literal.
fn py_path(device_path: &str) -> String {
    py_str(&format!("/{}", path::normalize(device_path)))
}

fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn py_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 3);
    out.push_str("b'");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('\'');
    out
}

const MKDIR_PRELUDE: &str = "import os\n\
def _mk(p):\n \
try:\n  os.mkdir(p)\n \
except OSError as e:\n  if e.args[0]!=17:raise\n";

fn mkdir_script(device_path: &str) -> String {
    let mut script = MKDIR_PRELUDE.to_string();
    for dir in path::ancestors(device_path) {
        let _ = writeln!(script, "_mk({})", py_path(dir));
    }
    script
}

fn write_script(device_path: &str, content: &[u8]) -> String {
    let mut script = mkdir_script(device_path);
    let _ = writeln!(script, "f=open({},'wb')\nw=f.write", py_path(device_path));
    for chunk in content.chunks(WRITE_CHUNK) {
        let _ = writeln!(script, "w({})", py_bytes(chunk));
    }
    script.push_str("f.close()\n");
    script
}

fn command_script(command: &DeviceCommand) -> String {
    match command {
        DeviceCommand::Mkdir { path: dir } => {
            let mut script = mkdir_script(dir);
            let _ = writeln!(script, "_mk({})", py_path(dir));
            script
        }
        DeviceCommand::Remove { path: target } => format!(
            "import os\n\
def _rm(p):\n \
if os.stat(p)[0]&0x4000:\n  \
for n in os.listdir(p):_rm(p+'/'+n)\n  \
os.rmdir(p)\n \
else:os.remove(p)\n\
_rm({})\n",
            py_path(target)
        ),
        DeviceCommand::Rename { from, to } => {
            let mut script = mkdir_script(to);
            let _ = writeln!(script, "os.rename({},{})", py_path(from), py_path(to));
            script
        }
    }
}

fn read_script(device_path: &str) -> String {
    format!(
        "import ubinascii\n\
f=open({},'rb')\n\
while 1:\n \
b=f.read({WRITE_CHUNK})\n \
if not b:break\n \
print(ubinascii.hexlify(b).decode(),end='')\n\
f.close()\n",
        py_path(device_path)
    )
}

const LIST_SCRIPT: &str = "import os\n\
def _ls(p):\n \
for e in os.ilistdir(p or '/'):\n  \
q=p+'/'+e[0]\n  \
if e[1]&0x4000:\n   print('d\\t0\\t'+q[1:]);_ls(q)\n  \
else:print('f\\t'+str(os.stat(q)[6])+'\\t'+q[1:])\n\
_ls('')\n";

fn parse_listing(output: &str) -> TransportResult<Vec<DeviceEntry>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.trim_end_matches('\r').splitn(3, '\t');
            let (Some(kind), Some(size), Some(entry_path)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(TransportError::Protocol(format!("bad listing line: {line:?}")));
            };
            let kind = match kind {
                "d" => FileKind::Directory,
                "f" => FileKind::File,
                other => return Err(TransportError::Protocol(format!("bad entry kind: {other:?}"))),
            };
            let size = size
                .parse()
                .map_err(|_| TransportError::Protocol(format!("bad entry size: {size:?}")))?;
            Ok(DeviceEntry {
                path: entry_path.to_string(),
                kind,
                size,
            })
        })
        .collect()
}

impl Transport for ReplTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.open().await?;
        self.stream = Some(BufReader::new(stream));
        self.mid_exchange = false;

        let timeout = self.connect_timeout;
        match tokio::time::timeout(timeout, self.enter_raw()).await {
            Ok(Ok(())) => {
                self.revision = 0;
                debug!("Device link in raw REPL mode");
                Ok(())
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(_) => {
                self.stream = None;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
            debug!("Device link closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn supports_rename(&self) -> bool {
        true
    }

    async fn send_file(&mut self, path: &str, content: &[u8]) -> TransportResult<Ack> {
        self.exec(write_script(path, content).as_bytes()).await?;
        Ok(self.ack())
    }

    async fn send_command(&mut self, command: &DeviceCommand) -> TransportResult<Ack> {
        self.exec(command_script(command).as_bytes()).await?;
        Ok(self.ack())
    }

    async fn send_raw(&mut self, code: &[u8]) -> TransportResult<String> {
        self.exec(code).await
    }

    async fn read_file(&mut self, path: &str) -> TransportResult<Vec<u8>> {
        let output = self.exec(read_script(path).as_bytes()).await?;
        hex::decode(output.trim()).map_err(|e| TransportError::Protocol(format!("bad file encoding: {e}")))
    }

    async fn tree_revision(&mut self) -> TransportResult<u64> {
        self.stream()?;
        Ok(self.revision)
    }

    async fn list_tree(&mut self) -> TransportResult<DeviceSnapshot> {
        let output = self.exec(LIST_SCRIPT.as_bytes()).await?;
        Ok(DeviceSnapshot {
            revision: self.revision,
            entries: parse_listing(&output)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    type Responder = fn(&str) -> (String, String);

    /// Minimal raw-REPL device on the far end of a duplex pipe.
    async fn fake_device(mut io: DuplexStream, respond: Responder) -> Vec<String> {
        let mut seen = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if io.read_exact(&mut byte).await.is_err() {
                return seen;
            }
            if byte[0] == CTRL_A {
                break;
            }
        }
        io.write_all(b"\r\n").await.unwrap();
        io.write_all(RAW_BANNER).await.unwrap();

        let mut code = Vec::new();
        while io.read_exact(&mut byte).await.is_ok() {
            if byte[0] != CTRL_D {
                code.push(byte[0]);
                continue;
            }
            let script = String::from_utf8_lossy(&code).into_owned();
            let (stdout, stderr) = respond(&script);
            seen.push(script);
            code.clear();
            let reply = format!("OK{stdout}\x04{stderr}\x04>");
            if io.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
        seen
    }

    async fn connected(respond: Responder) -> (ReplTransport, tokio::task::JoinHandle<Vec<String>>) {
        let (client, server) = tokio::io::duplex(4096);
        let device = tokio::spawn(fake_device(server, respond));
        let mut transport = ReplTransport::attached(client);
        transport.connect().await.unwrap();
        (transport, device)
    }

    fn silent(_: &str) -> (String, String) {
        (String::new(), String::new())
    }

    #[tokio::test]
    async fn test_send_raw_returns_stdout() {
        fn hello(_: &str) -> (String, String) {
            ("hello\r\n".to_string(), String::new())
        }
        let (mut transport, _device) = connected(hello).await;
        assert!(transport.is_connected());
        let out = transport.send_raw(b"print('hello')").await.unwrap();
        assert_eq!(out, "hello\r\n");
    }

    #[tokio::test]
    async fn test_stderr_becomes_device_error() {
        fn failing(_: &str) -> (String, String) {
            (
                String::new(),
                "Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n".to_string(),
            )
        }
        let (mut transport, _device) = connected(failing).await;
        let err = transport
            .send_command(&DeviceCommand::Remove { path: "x.py".into() })
            .await
            .unwrap_err();
        match err {
            TransportError::Device(message) => assert_eq!(message, "OSError: [Errno 2] ENOENT"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_file_script_and_revision() {
        let (mut transport, device) = connected(silent).await;
        let first = transport.send_file("lib/a.py", b"x = '1'\n").await.unwrap();
        let second = transport.send_file("b.py", b"").await.unwrap();
        assert_eq!((first.revision, second.revision), (1, 2));
        assert_eq!(transport.tree_revision().await.unwrap(), 2);

        transport.disconnect().await;
        let scripts = device.await.unwrap();
        assert!(scripts[0].contains("_mk('/lib')"));
        assert!(scripts[0].contains("f=open('/lib/a.py','wb')"));
        assert!(scripts[0].contains(r"w(b'x = \'1\'\x0a')"));
    }

    #[tokio::test]
    async fn test_read_file_decodes_hex() {
        fn hexed(_: &str) -> (String, String) {
            (hex::encode(b"print(1)\n"), String::new())
        }
        let (mut transport, _device) = connected(hexed).await;
        assert_eq!(transport.read_file("main.py").await.unwrap(), b"print(1)\n");
    }

    #[tokio::test]
    async fn test_list_tree_parses_listing() {
        fn listing(_: &str) -> (String, String) {
            ("d\t0\tlib\r\nf\t12\tlib/a.py\r\nf\t3\tmain.py\r\n".to_string(), String::new())
        }
        let (mut transport, _device) = connected(listing).await;
        let snapshot = transport.list_tree().await.unwrap();
        assert_eq!(snapshot.revision, 0);
        assert_eq!(
            snapshot.entries,
            vec![
                DeviceEntry { path: "lib".into(), kind: FileKind::Directory, size: 0 },
                DeviceEntry { path: "lib/a.py".into(), kind: FileKind::File, size: 12 },
                DeviceEntry { path: "main.py".into(), kind: FileKind::File, size: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_link_is_disconnect() {
        let (client, server) = tokio::io::duplex(4096);
        let device = tokio::spawn(fake_device(server, silent));
        let mut transport = ReplTransport::attached(client);
        transport.connect().await.unwrap();

        device.abort();
        let _ = device.await;

        let err = transport.send_raw(b"1").await.unwrap_err();
        assert!(err.implies_disconnect(), "{err:?}");
    }

    #[tokio::test]
    async fn test_abandoned_exchange_drops_link() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (late_tx, late_rx) = tokio::sync::oneshot::channel::<()>();
        // Answers the first script only once told to, so the client gives up first.
        let device = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            while server.read_exact(&mut byte).await.is_ok() && byte[0] != CTRL_A {}
            server.write_all(RAW_BANNER).await.unwrap();
            while server.read_exact(&mut byte).await.is_ok() && byte[0] != CTRL_D {}
            let _ = late_rx.await;
            let _ = server.write_all(b"OKstale\x04\x04>").await;
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
        });

        let mut transport = ReplTransport::attached(client);
        transport.connect().await.unwrap();

        let slow = tokio::time::timeout(Duration::from_millis(50), transport.send_raw(b"slow()")).await;
        assert!(slow.is_err());
        late_tx.send(()).unwrap();

        let err = transport.send_raw(b"print(2)").await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)), "{err:?}");
        assert!(!transport.is_connected());

        drop(transport);
        device.await.unwrap();
    }

    #[test]
    fn test_py_literals() {
        assert_eq!(py_path("/lib/a.py"), "'/lib/a.py'");
        assert_eq!(py_str("it's"), r"'it\'s'");
        assert_eq!(py_bytes(b"a\\\x00"), r"b'a\\\x00'");
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(parse_listing("x\t0\tfoo").is_err());
        assert!(parse_listing("f\tbig\tfoo").is_err());
        assert!(parse_listing("nonsense").is_err());
    }
}
