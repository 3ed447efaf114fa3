//! Timed event replay.
//!
//! Starts the server, waits for it to become ready, then walks the scenario
//! events in file order, sleeping the gap between consecutive timestamps and
//! either launching a client or forwarding a command line to one. Finishes by
//! waiting for every client to exit on its own, with stdin still open. Only
//! an aborted run closes the clients' stdin before waiting.
//!
//! Writes and waits are unbounded unless `command_timeout_ms` and
//! `exit_timeout_ms` are configured; a client that stops reading stdin or
//! never exits hangs the run in that case.

use std::time::{Duration, Instant};

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::process::{ClientExit, ClientHandle, ClientState, ProcessRegistry, ServerHandle};
use crate::scenario::{Action, Event, PortTable, Scenario};

/// Time to sleep before an event stamped `next` when the previous one was
/// stamped `last`. Out-of-order stamps give zero, never a negative sleep.
pub fn delay_between(last_ms: u64, next_ms: u64) -> Duration {
    Duration::from_millis(next_ms.saturating_sub(last_ms))
}

/// When one event was actually dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub index: usize,
    pub participant: String,
    pub timestamp_ms: u64,
    /// Offset from the start of the event loop
    pub dispatched_at: Duration,
}

/// Outcome of a completed run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub dispatched: Vec<DispatchRecord>,
    pub exits: Vec<ClientExit>,
}

impl RunSummary {
    /// Clients killed because they outlived the exit timeout
    pub fn timed_out(&self) -> Vec<&str> {
        self.exits
            .iter()
            .filter(|e| e.state == ClientState::TimedOut)
            .map(|e| e.participant.as_str())
            .collect()
    }
}

/// Drives one scenario against a live server and its clients
pub struct Dispatcher {
    config: DriverConfig,
    registry: ProcessRegistry,
    server: Option<ServerHandle>,
}

impl Dispatcher {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            registry: ProcessRegistry::new(),
            server: None,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// The server handle, once spawned. The driver never waits on it.
    pub fn server(&self) -> Option<&ServerHandle> {
        self.server.as_ref()
    }

    /// Bootstrap the server, replay all events and drain the clients
    pub async fn run(&mut self, scenario: &Scenario) -> DriverResult<RunSummary> {
        self.start_server(scenario).await?;

        let mut summary = RunSummary::default();
        let outcome = self.dispatch_events(scenario, &mut summary.dispatched).await;

        tracing::info!(clients = self.registry.len(), "Waiting for clients to exit");
        summary.exits = match outcome {
            Ok(()) => self.wait_all().await,
            Err(ref e) => {
                tracing::error!(error = %e, "Dispatch aborted, draining launched clients");
                self.drain().await
            }
        };

        outcome?;
        Ok(summary)
    }

    async fn start_server(&mut self, scenario: &Scenario) -> DriverResult<()> {
        let mut server = ServerHandle::spawn(&self.config.server, &self.config.logs_dir)?;

        let ready = self
            .config
            .readiness
            .wait(&mut server, &self.config.client_host, &scenario.ports)
            .await;

        if let Err(e) = ready {
            if matches!(server.try_exited(), Ok(None)) {
                if let Err(kill_err) = server.kill().await {
                    tracing::warn!(error = %kill_err, "Failed to kill unready server");
                }
            }
            return Err(e);
        }

        self.server = Some(server);
        Ok(())
    }

    /// Replay events in order without touching the server. Stops at the
    /// first error; launched clients stay registered for the drain.
    pub async fn dispatch_events(
        &mut self,
        scenario: &Scenario,
        records: &mut Vec<DispatchRecord>,
    ) -> DriverResult<()> {
        let started = Instant::now();
        let mut last_ms = 0;

        for (index, event) in scenario.events.iter().enumerate() {
            let delay = delay_between(last_ms, event.timestamp_ms);
            if event.timestamp_ms < last_ms {
                tracing::warn!(
                    index,
                    timestamp_ms = event.timestamp_ms,
                    previous_ms = last_ms,
                    "Event out of order, dispatching without delay"
                );
            }
            if !delay.is_zero() {
                tracing::debug!(
                    index,
                    participant = %event.participant,
                    delay_ms = delay.as_millis() as u64,
                    "Sleeping until next event"
                );
                tokio::time::sleep(delay).await;
            }
            last_ms = event.timestamp_ms;

            self.dispatch(event, &scenario.ports).await?;

            records.push(DispatchRecord {
                index,
                participant: event.participant.clone(),
                timestamp_ms: event.timestamp_ms,
                dispatched_at: started.elapsed(),
            });
        }

        Ok(())
    }

    /// Wait for every client to exit, leaving stdin open
    pub async fn wait_all(&mut self) -> Vec<ClientExit> {
        self.registry.wait_all(self.config.exit_timeout()).await
    }

    /// Close all client inputs and wait for every client to exit
    pub async fn drain(&mut self) -> Vec<ClientExit> {
        self.registry.drain(self.config.exit_timeout()).await
    }

    async fn dispatch(&mut self, event: &Event, ports: &PortTable) -> DriverResult<()> {
        match &event.action {
            Action::Launch => self.launch(&event.participant, ports),
            Action::Command(line) => {
                tracing::debug!(participant = %event.participant, command = %line, "Sending command");
                self.registry
                    .send(&event.participant, line, self.config.command_timeout())
                    .await
            }
        }
    }

    fn launch(&mut self, participant: &str, ports: &PortTable) -> DriverResult<()> {
        self.registry.ensure_vacant(participant)?;
        let port = ports
            .get(participant)
            .ok_or_else(|| DriverError::NoPortAssigned(participant.to_string()))?;

        let handle = ClientHandle::spawn(
            &self.config.client,
            &self.config.client_host,
            &self.config.logs_dir,
            participant,
            port,
        )?;
        self.registry.register(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_between() {
        assert_eq!(delay_between(0, 0), Duration::ZERO);
        assert_eq!(delay_between(0, 500), Duration::from_millis(500));
        assert_eq!(delay_between(500, 1000), Duration::from_millis(500));
        assert_eq!(delay_between(1000, 200), Duration::ZERO);
    }

    #[test]
    fn test_summary_timed_out() {
        let summary = RunSummary {
            dispatched: Vec::new(),
            exits: vec![
                ClientExit {
                    participant: "alice".into(),
                    state: ClientState::Exited(Some(0)),
                },
                ClientExit {
                    participant: "bob".into(),
                    state: ClientState::TimedOut,
                },
            ],
        };
        assert_eq!(summary.timed_out(), vec!["bob"]);
    }

    #[cfg(unix)]
    mod replay {
        use super::*;
        use crate::config::CommandSpec;
        use crate::readiness::Readiness;
        use tempfile::TempDir;

        /// Echoes stdin lines; exits on "quit" or EOF
        const ECHO_CLIENT: &str = r#"while IFS= read -r line; do printf '%s\n' "$line"; [ "$line" = quit ] && exit 0; done; exit 0"#;

        fn config(dir: &TempDir) -> DriverConfig {
            DriverConfig {
                server: CommandSpec::new("/bin/sh", &["-c", "exit 0"]),
                client: CommandSpec::new("/bin/sh", &["-c", ECHO_CLIENT, "echo-client"]),
                logs_dir: dir.path().to_path_buf(),
                readiness: Readiness::Grace { millis: 0 },
                exit_timeout_ms: Some(5_000),
                ..DriverConfig::default()
            }
        }

        fn client_logs(dir: &TempDir) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".out"))
                .collect();
            names.sort();
            names
        }

        #[tokio::test]
        async fn test_unknown_participant_spawns_nothing() {
            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario = "1\nalice 9001\n\n0 alice bid:10\n".parse().unwrap();

            let mut records = Vec::new();
            let err = dispatcher
                .dispatch_events(&scenario, &mut records)
                .await
                .unwrap_err();

            assert!(matches!(err, DriverError::UnknownParticipant(name) if name == "alice"));
            assert!(records.is_empty());
            assert!(dispatcher.registry().is_empty());
            assert!(client_logs(&dir).is_empty());
        }

        #[tokio::test]
        async fn test_duplicate_launch_rejected() {
            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario = "1\nalice 9001\n\n0 alice launch\n10 alice launch\n"
                .parse()
                .unwrap();

            let err = dispatcher.run(&scenario).await.unwrap_err();
            assert!(matches!(err, DriverError::DuplicateLaunch(name) if name == "alice"));
            assert_eq!(dispatcher.registry().len(), 1);
            assert_eq!(
                dispatcher.registry().get("alice").map(|c| c.state().clone()),
                Some(ClientState::Exited(Some(0)))
            );
        }

        #[tokio::test]
        async fn test_launch_without_port() {
            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario = "1\nalice 9001\n\n0 carol launch\n".parse().unwrap();

            let mut records = Vec::new();
            let err = dispatcher
                .dispatch_events(&scenario, &mut records)
                .await
                .unwrap_err();
            assert!(matches!(err, DriverError::NoPortAssigned(name) if name == "carol"));
            assert!(client_logs(&dir).is_empty());
        }

        #[tokio::test]
        async fn test_commands_reach_launched_client_in_order() {
            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario =
                "1\nalice 9001\n\n0 alice launch\n20 alice bid:10\n40 alice bid:11\n60 alice quit\n"
                    .parse()
                    .unwrap();

            let summary = dispatcher.run(&scenario).await.unwrap();
            assert_eq!(summary.dispatched.len(), 4);
            assert!(summary.timed_out().is_empty());

            let received =
                std::fs::read_to_string(dir.path().join("alice@localhost:9001.out")).unwrap();
            assert_eq!(received, "bid:10\nbid:11\nquit\n");
        }

        #[derive(Clone, Default)]
        struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

        impl std::io::Write for CapturedLog {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
            type Writer = CapturedLog;

            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        #[tokio::test]
        async fn test_inter_event_delay_is_logged() {
            let captured = CapturedLog::default();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(captured.clone())
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .finish();
            let _guard = tracing::subscriber::set_default(subscriber);

            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario = "1\nalice 9001\n\n0 alice launch\n30 alice quit\n"
                .parse()
                .unwrap();

            let mut records = Vec::new();
            dispatcher.dispatch_events(&scenario, &mut records).await.unwrap();
            dispatcher.wait_all().await;

            let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
            assert!(output.contains("delay_ms=30"), "missing delay field: {}", output);
        }

        #[tokio::test]
        async fn test_unsorted_events_do_not_fail() {
            let dir = TempDir::new().unwrap();
            let mut dispatcher = Dispatcher::new(config(&dir));
            let scenario: Scenario =
                "1\nalice 9001\n\n100 alice launch\n0 alice early\n0 alice quit\n"
                    .parse()
                    .unwrap();

            let summary = dispatcher.run(&scenario).await.unwrap();
            assert_eq!(summary.dispatched.len(), 3);
            let gap = summary.dispatched[1].dispatched_at - summary.dispatched[0].dispatched_at;
            assert!(gap < Duration::from_millis(100));
        }
    }
}
