//! Process lifecycle management for the server and bidder clients.
//!
//! Tracks launched clients by participant name, routes command lines to their
//! stdin and collects their exit status at the end of a run.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};

use crate::config::CommandSpec;
use crate::error::{DriverError, DriverResult};

/// Paths of the stdout/stderr capture files for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPair {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPair {
    /// `server.log` / `server.err`
    pub fn server(logs_dir: &Path) -> Self {
        Self {
            stdout: logs_dir.join("server.log"),
            stderr: logs_dir.join("server.err"),
        }
    }

    /// `<participant>@<host>:<port>.out` / `.err`
    pub fn client(logs_dir: &Path, participant: &str, host: &str, port: &str) -> Self {
        let stem = format!("{}@{}:{}", participant, host, port);
        Self {
            stdout: logs_dir.join(format!("{}.out", stem)),
            stderr: logs_dir.join(format!("{}.err", stem)),
        }
    }

    /// Create (truncating) both files
    fn open(&self) -> DriverResult<(File, File)> {
        Ok((open_log(&self.stdout)?, open_log(&self.stderr)?))
    }
}

fn open_log(path: &Path) -> DriverResult<File> {
    File::create(path).map_err(|source| DriverError::LogFile {
        path: path.to_path_buf(),
        source,
    })
}

/// The long-lived auction server
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    logs: LogPair,
}

impl ServerHandle {
    /// Spawn the server with output captured under `logs_dir`
    pub fn spawn(spec: &CommandSpec, logs_dir: &Path) -> DriverResult<Self> {
        let logs = LogPair::server(logs_dir);
        let (out, err) = logs.open()?;

        tracing::info!(program = %spec.program, args = ?spec.args, "Launching server");

        let child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .spawn()
            .map_err(|source| DriverError::ProcessSpawn {
                what: format!("server '{}'", spec.program),
                source,
            })?;

        tracing::debug!(pid = ?child.id(), "Server process spawned");
        Ok(Self { child, logs })
    }

    pub fn logs(&self) -> &LogPair {
        &self.logs
    }

    /// Non-blocking check whether the server has already exited
    pub fn try_exited(&mut self) -> DriverResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Kill the server. Only used when it never became ready.
    pub async fn kill(&mut self) -> DriverResult<()> {
        tracing::info!(pid = ?self.child.id(), "Killing server");
        self.child.kill().await?;
        Ok(())
    }
}

/// Lifecycle of one client process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Spawned, stdin may still be open
    Launched,
    /// Exited with this code (None when killed by a signal)
    Exited(Option<i32>),
    /// Did not exit within the drain timeout and was killed
    TimedOut,
    /// The OS could not report the exit status
    WaitFailed(String),
}

/// A spawned bidder client
#[derive(Debug)]
pub struct ClientHandle {
    participant: String,
    child: Child,
    stdin: Option<ChildStdin>,
    state: ClientState,
}

impl ClientHandle {
    /// Spawn a client as `<client command> <host> <port> <participant>`
    pub fn spawn(
        spec: &CommandSpec,
        host: &str,
        logs_dir: &Path,
        participant: &str,
        port: &str,
    ) -> DriverResult<Self> {
        let logs = LogPair::client(logs_dir, participant, host, port);
        let (out, err) = logs.open()?;

        tracing::info!(participant = %participant, port = %port, "Launching client");

        let mut child = spec
            .to_command()
            .arg(host)
            .arg(port)
            .arg(participant)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .spawn()
            .map_err(|source| DriverError::ProcessSpawn {
                what: format!("client '{}'", participant),
                source,
            })?;

        let stdin = child.stdin.take();

        tracing::debug!(
            participant = %participant,
            pid = ?child.id(),
            stdout = %logs.stdout.display(),
            "Client process spawned"
        );

        Ok(Self {
            participant: participant.to_string(),
            child,
            stdin,
            state: ClientState::Launched,
        })
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Write `line` plus a newline to the client's stdin
    pub async fn send_line(&mut self, line: &str, timeout: Option<Duration>) -> DriverResult<()> {
        let participant = self.participant.clone();
        let stdin = self.stdin.as_mut().ok_or_else(|| DriverError::CommandDelivery {
            participant: participant.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed"),
        })?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let write = async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .map_err(|_| DriverError::CommandTimeout {
                    participant: participant.clone(),
                    timeout: limit,
                })?,
            None => write.await,
        };

        result.map_err(|source| DriverError::CommandDelivery {
            participant,
            source,
        })
    }

    /// Drop the stdin pipe so the client sees EOF
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            tracing::debug!(participant = %self.participant, "Closed client stdin");
        }
    }

    /// Wait for the client to exit, killing it if `timeout` elapses first
    pub async fn wait(&mut self, timeout: Option<Duration>) -> DriverResult<ClientState> {
        if self.state != ClientState::Launched {
            return Ok(self.state.clone());
        }

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(
                        participant = %self.participant,
                        timeout = ?limit,
                        "Client did not exit in time, killing"
                    );
                    self.child.kill().await?;
                    self.state = ClientState::TimedOut;
                    return Ok(self.state.clone());
                }
            },
            None => self.child.wait().await?,
        };

        self.state = ClientState::Exited(status.code());
        tracing::info!(participant = %self.participant, exit_code = ?status.code(), "Client exited");
        Ok(self.state.clone())
    }
}

/// Final state of one client after the drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientExit {
    pub participant: String,
    pub state: ClientState,
}

/// All launched clients, keyed by participant name
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    clients: HashMap<String, ClientHandle>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, participant: &str) -> bool {
        self.clients.contains_key(participant)
    }

    /// Sorted participant names
    pub fn participants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, participant: &str) -> Option<&ClientHandle> {
        self.clients.get(participant)
    }

    /// Fail with `DuplicateLaunch` if the participant is already registered
    pub fn ensure_vacant(&self, participant: &str) -> DriverResult<()> {
        if self.contains(participant) {
            return Err(DriverError::DuplicateLaunch(participant.to_string()));
        }
        Ok(())
    }

    /// Take ownership of a freshly spawned client
    pub fn register(&mut self, handle: ClientHandle) -> DriverResult<()> {
        self.ensure_vacant(handle.participant())?;
        self.clients.insert(handle.participant().to_string(), handle);
        Ok(())
    }

    /// Forward a command line to a registered client
    pub async fn send(
        &mut self,
        participant: &str,
        line: &str,
        timeout: Option<Duration>,
    ) -> DriverResult<()> {
        let client = self
            .clients
            .get_mut(participant)
            .ok_or_else(|| DriverError::UnknownParticipant(participant.to_string()))?;
        client.send_line(line, timeout).await
    }

    /// Close every client's stdin
    pub fn close_inputs(&mut self) {
        for client in self.clients.values_mut() {
            client.close_input();
        }
    }

    /// Wait for every client to exit on its own. Stdin pipes stay open, so
    /// clients that stop on EOF keep running until their scripted end.
    pub async fn wait_all(&mut self, timeout: Option<Duration>) -> Vec<ClientExit> {
        let mut exits = Vec::with_capacity(self.clients.len());
        for participant in self.participants() {
            let Some(client) = self.clients.get_mut(&participant) else {
                continue;
            };
            let state = match client.wait(timeout).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(participant = %participant, error = %e, "Failed to wait for client");
                    ClientState::WaitFailed(e.to_string())
                }
            };
            exits.push(ClientExit { participant, state });
        }
        exits
    }

    /// Close all inputs, then wait for every client. Used when a run aborts.
    pub async fn drain(&mut self, timeout: Option<Duration>) -> Vec<ClientExit> {
        self.close_inputs();
        self.wait_all(timeout).await
    }
}
