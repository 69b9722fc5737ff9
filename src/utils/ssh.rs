//! SSH transport: command execution and SFTP file transfer
//!
//! Sessions are opened per node and per step, never pooled. Everything above
//! this module talks to [`RemoteSession`] and [`Connector`] so the installer
//! can be driven by a mock in tests.

use crate::config::Node;
use crate::error::{ConnectionError, RemoteError};
use crate::utils::format::url_host;
use crate::utils::progress::ProgressWriter;
use ssh2::{Channel, CheckResult, KnownHostFileKind, Session, Sftp};
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Bounded time to establish a connection and authenticate
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between output polls while a remote command is quiet
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Password and/or private key. Both may be set; see [`SshConnector`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
}

/// Everything needed to open a session to one host
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
}

impl SshTarget {
    pub fn for_node(node: &Node) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            host: node.ip.clone(),
            port: node.port,
            user: node.ssh_user().to_string(),
            credentials: Credentials {
                password: non_empty(&node.password),
                key_path: non_empty(&node.key_path)
                    .map(|p| PathBuf::from(shellexpand::tilde(&p).into_owned())),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", url_host(&self.host), self.port)
    }
}

/// Captured output of a remote command that exited 0
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An open connection to one remote host
pub trait RemoteSession {
    /// Run a command and wait for it to exit. Non-zero exit is [`RemoteError::Exec`].
    fn run_command(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Copy a local file to `remote`, optionally reporting progress
    fn upload_file(&self, local: &Path, remote: &str, progress: bool) -> Result<(), RemoteError>;

    /// Write in-memory content to `remote`
    fn upload_bytes(&self, content: &[u8], remote: &str) -> Result<(), RemoteError>;

    fn download_bytes(&self, remote: &str) -> Result<Vec<u8>, RemoteError>;

    /// Create `remote` and any missing parents
    fn mkdir_all(&self, remote: &str) -> Result<(), RemoteError>;

    fn file_size(&self, remote: &str) -> Result<u64, RemoteError>;

    /// Copy `remote` into a local file
    fn download(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let content = self.download_bytes(remote)?;
        std::fs::write(local, content).map_err(|source| RemoteError::Transfer {
            path: local.display().to_string(),
            source,
        })
    }
}

/// Opens sessions. Shared across worker threads, so it must be `Sync`.
pub trait Connector: Send + Sync {
    fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, ConnectionError>;
}

/// Decides whether to trust the key a server presents during the handshake
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<(), ConnectionError>;

    fn describe(&self) -> String;
}

/// Accepts any host key. Only for trusted, operator-controlled networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureAcceptAny;

impl HostKeyVerifier for InsecureAcceptAny {
    fn verify(&self, _session: &Session, _host: &str, _port: u16) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "insecure (host keys are not verified)".to_string()
    }
}

/// Checks the host key against an OpenSSH known_hosts file
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    path: PathBuf,
}

impl KnownHostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HostKeyVerifier for KnownHostsFile {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<(), ConnectionError> {
        let addr = format!("{}:{}", url_host(host), port);
        let reject = |reason: String| ConnectionError::HostKey {
            addr: addr.clone(),
            reason,
        };

        let (key, _) = session
            .host_key()
            .ok_or_else(|| reject("server presented no host key".to_string()))?;
        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| reject(e.to_string()))?;
        known_hosts
            .read_file(&self.path, KnownHostFileKind::OpenSSH)
            .map_err(|e| reject(format!("failed to read {}: {}", self.path.display(), e)))?;

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(reject(format!(
                "no entry in {}",
                self.path.display()
            ))),
            CheckResult::Mismatch => Err(reject(format!(
                "key does not match entry in {}",
                self.path.display()
            ))),
            CheckResult::Failure => Err(reject("known_hosts check failed".to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("known_hosts ({})", self.path.display())
    }
}

/// Opens real SSH sessions over TCP.
///
/// When a node has both a password and a key, password authentication is
/// attempted first and the key second; the first method the server accepts wins.
pub struct SshConnector {
    verifier: Arc<dyn HostKeyVerifier>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self {
            verifier,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Connector that skips host key verification
    pub fn insecure() -> Self {
        Self::new(Arc::new(InsecureAcceptAny))
    }

    pub fn host_key_policy(&self) -> String {
        self.verifier.describe()
    }

    fn connect(&self, target: &SshTarget) -> Result<SshSession, ConnectionError> {
        let addr = target.addr();
        tracing::debug!(host = %target.host, port = target.port, user = %target.user, "establishing SSH connection");

        let socket_addr = addr
            .to_socket_addrs()
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
            })
            .map_err(|source| ConnectionError::Address {
                addr: addr.clone(),
                source,
            })?;
        let tcp = TcpStream::connect_timeout(&socket_addr, self.connect_timeout).map_err(
            |source| ConnectionError::Tcp {
                addr: addr.clone(),
                source,
            },
        )?;

        let handshake_err = |e: ssh2::Error| ConnectionError::Handshake {
            addr: addr.clone(),
            source: e.into(),
        };
        let mut session = Session::new().map_err(handshake_err)?;
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(handshake_err)?;

        self.verifier.verify(&session, &target.host, target.port)?;
        let method = authenticate(&session, target, &addr)?;
        tracing::debug!(auth = method, "SSH connection established");

        // Remote commands have no deadline of their own
        session.set_timeout(0);

        let sftp = session.sftp().map_err(|e| ConnectionError::Subsystem {
            addr: addr.clone(),
            source: e.into(),
        })?;

        Ok(SshSession {
            addr,
            session,
            sftp: Some(sftp),
        })
    }
}

impl Connector for SshConnector {
    fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, ConnectionError> {
        Ok(Box::new(self.connect(target)?))
    }
}

fn authenticate(
    session: &Session,
    target: &SshTarget,
    addr: &str,
) -> Result<&'static str, ConnectionError> {
    let user = &target.user;
    let mut tried = Vec::new();

    if let Some(password) = &target.credentials.password {
        tried.push("password");
        if session.userauth_password(user, password).is_ok() && session.authenticated() {
            return Ok("password");
        }
    }

    if let Some(key_path) = &target.credentials.key_path {
        std::fs::metadata(key_path).map_err(|source| ConnectionError::Key {
            path: key_path.clone(),
            source,
        })?;
        tried.push("publickey");
        if session
            .userauth_pubkey_file(user, None, key_path, None)
            .is_ok()
            && session.authenticated()
        {
            return Ok("key");
        }
    }

    if tried.is_empty() {
        return Err(ConnectionError::NoCredentials {
            user: user.clone(),
            addr: addr.to_string(),
        });
    }
    Err(ConnectionError::Auth {
        user: user.clone(),
        addr: addr.to_string(),
        tried: tried.join(", "),
    })
}

/// Live SSH connection with an SFTP channel. Closed on drop.
pub struct SshSession {
    addr: String,
    session: Session,
    sftp: Option<Sftp>,
}

impl SshSession {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn sftp(&self, path: &str) -> Result<&Sftp, RemoteError> {
        self.sftp.as_ref().ok_or_else(|| RemoteError::Transfer {
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::NotConnected, "sftp channel closed"),
        })
    }
}

fn transfer_err(path: &str) -> impl Fn(io::Error) -> RemoteError + '_ {
    move |source| RemoteError::Transfer {
        path: path.to_string(),
        source,
    }
}

/// The two output streams of a running remote command
trait CommandStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn at_eof(&self) -> bool;
}

impl CommandStreams for Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Read stdout and stderr in turns until the command closes its output
fn collect_output(streams: &mut impl CommandStreams) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = vec![0u8; 32 * 1024];
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        if read_round(streams, &mut buf, &mut stdout, &mut stderr)? {
            continue;
        }
        if streams.at_eof() {
            // Data that arrived together with the EOF
            while read_round(streams, &mut buf, &mut stdout, &mut stderr)? {}
            return Ok((stdout, stderr));
        }
        std::thread::sleep(OUTPUT_POLL_INTERVAL);
    }
}

/// One read from each stream; true if either produced data
fn read_round(
    streams: &mut impl CommandStreams,
    buf: &mut [u8],
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
) -> io::Result<bool> {
    let read = streams.read_stdout(buf);
    let got_stdout = append_read(read, buf, stdout)?;
    let read = streams.read_stderr(buf);
    let got_stderr = append_read(read, buf, stderr)?;
    Ok(got_stdout || got_stderr)
}

fn append_read(read: io::Result<usize>, buf: &[u8], out: &mut Vec<u8>) -> io::Result<bool> {
    match read {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(false),
        Err(e) => Err(e),
    }
}

impl RemoteSession for SshSession {
    fn run_command(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let channel_err = |source: io::Error| RemoteError::Channel {
            command: command.to_string(),
            source,
        };

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| channel_err(e.into()))?;
        channel.exec(command).map_err(|e| channel_err(e.into()))?;

        // Non-blocking so a full stderr window cannot stall the stdout read
        self.session.set_blocking(false);
        let output = collect_output(&mut channel);
        self.session.set_blocking(true);
        let (stdout, stderr) = output.map_err(channel_err)?;

        channel.wait_close().map_err(|e| channel_err(e.into()))?;
        let status = channel.exit_status().map_err(|e| channel_err(e.into()))?;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if status != 0 {
            return Err(RemoteError::Exec {
                command: command.to_string(),
                status,
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }

    fn upload_file(&self, local: &Path, remote: &str, progress: bool) -> Result<(), RemoteError> {
        let err = transfer_err(remote);
        let mut local_file = File::open(local).map_err(&err)?;
        let size = local_file.metadata().map_err(&err)?.len();
        let mut remote_file = self
            .sftp(remote)?
            .create(Path::new(remote))
            .map_err(|e| err(e.into()))?;

        if progress {
            let mut writer = ProgressWriter::new(&mut remote_file, format!("upload {}", remote), size);
            io::copy(&mut local_file, &mut writer).map_err(&err)?;
        } else {
            io::copy(&mut local_file, &mut remote_file).map_err(&err)?;
        }
        Ok(())
    }

    fn upload_bytes(&self, content: &[u8], remote: &str) -> Result<(), RemoteError> {
        let err = transfer_err(remote);
        let mut remote_file = self
            .sftp(remote)?
            .create(Path::new(remote))
            .map_err(|e| err(e.into()))?;
        io::Write::write_all(&mut remote_file, content).map_err(&err)
    }

    fn download_bytes(&self, remote: &str) -> Result<Vec<u8>, RemoteError> {
        let err = transfer_err(remote);
        let mut remote_file = self
            .sftp(remote)?
            .open(Path::new(remote))
            .map_err(|e| err(e.into()))?;
        let mut content = Vec::new();
        remote_file.read_to_end(&mut content).map_err(&err)?;
        Ok(content)
    }

    fn mkdir_all(&self, remote: &str) -> Result<(), RemoteError> {
        let err = transfer_err(remote);
        let sftp = self.sftp(remote)?;
        let mut current = PathBuf::new();
        for component in Path::new(remote).components() {
            current.push(component);
            if matches!(component, Component::RootDir | Component::CurDir) {
                continue;
            }
            match sftp.stat(&current) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => {
                    return Err(err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", current.display()),
                    )));
                }
                Err(_) => sftp.mkdir(&current, 0o755).map_err(|e| err(e.into()))?,
            }
        }
        Ok(())
    }

    fn file_size(&self, remote: &str) -> Result<u64, RemoteError> {
        let stat = self
            .sftp(remote)?
            .stat(Path::new(remote))
            .map_err(|e| transfer_err(remote)(e.into()))?;
        Ok(stat.size.unwrap_or(0))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // SFTP channel first, then the transport
        self.sftp.take();
        if let Err(e) = self.session.disconnect(None, "k3lift done", None) {
            tracing::debug!(addr = %self.addr, error = %e, "SSH disconnect failed");
        }
    }
}
