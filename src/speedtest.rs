//! Invocation of the external `speedtest` CLI and the per-cycle fan-out over
//! the configured servers.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tracing::{debug, info};

/// Flag the speedtest CLI uses to pin a run to a single server.
const SERVER_FLAG: &str = "-s";

/// The executable plus the arguments passed on every run. The server flag and
/// id are appended per invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Command {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Args")]
    pub args: Vec<String>,
}

/// One parsed JSON document emitted by `speedtest --format=json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TestResults {
    pub ping: Ping,
    pub download: Speed,
    pub upload: Speed,
    pub packet_loss: f64,
    pub isp: String,
    pub server: Server,
}

impl TestResults {
    /// True when the CLI exited cleanly but left out fields we publish.
    pub fn is_missing_data(&self) -> bool {
        self.ping.is_missing_data()
            || self.download.is_missing_data()
            || self.upload.is_missing_data()
            // packet loss can legitimately be zero
            || self.server.is_missing_data()
            || self.isp.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(default)]
pub struct Ping {
    /// Milliseconds.
    pub jitter: f64,
    /// Milliseconds.
    pub latency: f64,
}

impl Ping {
    pub fn is_zero(&self) -> bool {
        self.latency == 0.0 && self.jitter == 0.0
    }

    pub fn is_missing_data(&self) -> bool {
        self.latency == 0.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(default)]
pub struct Speed {
    /// Bytes per second.
    pub bandwidth: f64,
    pub bytes: f64,
    pub elapsed: f64,
}

impl Speed {
    pub fn is_zero(&self) -> bool {
        self.bandwidth == 0.0 && self.bytes == 0.0 && self.elapsed == 0.0
    }

    pub fn is_missing_data(&self) -> bool {
        self.bandwidth == 0.0 || self.bytes == 0.0 || self.elapsed == 0.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
    pub id: i32,
    pub name: String,
    pub location: String,
    pub country: String,
    pub host: String,
    pub port: u16,
}

impl Server {
    pub fn is_zero(&self) -> bool {
        self.id == 0
            && self.name.is_empty()
            && self.location.is_empty()
            && self.country.is_empty()
            && self.host.is_empty()
            && self.port == 0
    }

    pub fn is_missing_data(&self) -> bool {
        self.id == 0
            || self.name.is_empty()
            || self.location.is_empty()
            || self.country.is_empty()
            || self.host.is_empty()
            || self.port == 0
    }
}

#[derive(Error, Debug)]
pub enum ProcessFailure {
    #[error("{0}")]
    Spawn(#[from] io::Error),
    #[error("{0}")]
    Exit(ExitStatus),
}

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("failed to run speed test: {0}")]
    ProcessFailed(#[source] ProcessFailure),
    #[error("failed to unmarshal results: {0}")]
    MalformedOutput(#[source] serde_json::Error),
}

/// A single server's failure within a cycle.
#[derive(Error, Debug)]
#[error("server {server_id}: {error}")]
pub struct TargetFailure {
    pub server_id: i32,
    #[source]
    pub error: InvocationError,
}

/// Every failure from one cycle, in the order the servers were tested.
#[derive(Error, Debug)]
#[error("{}", describe_failures(.failures))]
pub struct CycleError {
    pub failures: Vec<TargetFailure>,
}

impl CycleError {
    pub fn failed_server_ids(&self) -> Vec<i32> {
        self.failures.iter().map(|f| f.server_id).collect()
    }
}

fn describe_failures(failures: &[TargetFailure]) -> String {
    let mut out = match failures.len() {
        1 => "1 error occurred:".to_string(),
        n => format!("{n} errors occurred:"),
    };
    for failure in failures {
        let _ = write!(out, " [{failure}]");
    }
    out
}

/// Runs one measurement against one server.
#[async_trait]
pub trait SpeedTest: Send + Sync {
    async fn run(&self, server_id: i32) -> Result<TestResults, InvocationError>;
}

/// Runs the configured command as a child process and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandSpeedTest {
    command: Arc<Command>,
}

impl CommandSpeedTest {
    pub fn new(command: Arc<Command>) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[async_trait]
impl SpeedTest for CommandSpeedTest {
    async fn run(&self, server_id: i32) -> Result<TestResults, InvocationError> {
        info!(server_id, "Running speed test");

        let mut command = TokioCommand::new(&self.command.name);
        command
            .args(&self.command.args)
            .arg(SERVER_FLAG)
            .arg(server_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // stderr is ignored
            .stderr(Stdio::null());
        debug!(command = ?command, "Spawning speed test process.");

        let output = command
            .output()
            .await
            .map_err(|e| InvocationError::ProcessFailed(ProcessFailure::Spawn(e)))?;
        if !output.status.success() {
            return Err(InvocationError::ProcessFailed(ProcessFailure::Exit(
                output.status,
            )));
        }

        let results: TestResults =
            serde_json::from_slice(&output.stdout).map_err(InvocationError::MalformedOutput)?;

        info!(
            server_id,
            full_results = %String::from_utf8_lossy(&output.stdout),
            "Results"
        );
        Ok(results)
    }
}

/// Tests each server in order, collecting successes and failures alike.
///
/// A failing server never stops the remaining ones from being tested. The
/// shutdown signal is checked before each server; once it is set the results
/// gathered so far are returned and the rest are skipped without recording
/// an error for them.
pub async fn run_tests<S>(
    speed_test: &S,
    server_ids: &[i32],
    shutdown: &watch::Receiver<bool>,
) -> (Vec<TestResults>, Option<CycleError>)
where
    S: SpeedTest + ?Sized,
{
    let mut results = Vec::with_capacity(server_ids.len());
    let mut failures = Vec::new();

    for &server_id in server_ids {
        if *shutdown.borrow() {
            debug!(server_id, "Shutdown requested, skipping remaining servers.");
            break;
        }
        match speed_test.run(server_id).await {
            Ok(result) => results.push(result),
            Err(error) => failures.push(TargetFailure { server_id, error }),
        }
    }

    let err = if failures.is_empty() {
        None
    } else {
        Some(CycleError { failures })
    };
    (results, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_result, ScriptedSpeedTest};

    const SAMPLE_JSON: &str = r#"{
        "type": "result",
        "timestamp": "2024-01-01T00:00:00Z",
        "ping": {"jitter": 1.0, "latency": 10.0},
        "download": {"bandwidth": 5000, "bytes": 500000, "elapsed": 100},
        "upload": {"bandwidth": 2000, "bytes": 200000, "elapsed": 100},
        "packetLoss": 0,
        "isp": "ISP",
        "server": {"id": 100, "name": "A", "location": "L", "country": "C", "host": "h", "port": 8080, "ip": "10.0.0.1"}
    }"#;

    #[test]
    fn test_parse_speedtest_output() {
        let parsed: TestResults = serde_json::from_str(SAMPLE_JSON).unwrap();
        assert_eq!(parsed, sample_result(100));
        assert!(!parsed.is_missing_data());
    }

    #[test]
    fn test_json_round_trip() {
        let original = TestResults {
            packet_loss: 1.25,
            ..sample_result(4242)
        };
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"packetLoss\":1.25"));
        let parsed: TestResults = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_missing_data_detection() {
        let complete = sample_result(1);
        assert!(!complete.is_missing_data());

        let mut no_latency = complete.clone();
        no_latency.ping.latency = 0.0;
        assert!(no_latency.is_missing_data());

        let mut no_upload_bytes = complete.clone();
        no_upload_bytes.upload.bytes = 0.0;
        assert!(no_upload_bytes.is_missing_data());

        let mut no_isp = complete.clone();
        no_isp.isp.clear();
        assert!(no_isp.is_missing_data());

        let mut no_port = complete.clone();
        no_port.server.port = 0;
        assert!(no_port.is_missing_data());

        let mut zero_jitter = complete;
        zero_jitter.ping.jitter = 0.0;
        assert!(!zero_jitter.is_missing_data());

        let empty = TestResults::default();
        assert!(empty.ping.is_zero());
        assert!(empty.download.is_zero());
        assert!(empty.server.is_zero());
    }

    #[test]
    fn test_command_accepts_capitalised_keys() {
        let cmd: Command =
            serde_json::from_str(r#"{"Name": "speedtest", "Args": ["--format=json"]}"#).unwrap();
        assert_eq!(cmd.name, "speedtest");
        assert_eq!(cmd.args, vec!["--format=json".to_string()]);

        let bare: Command = serde_json::from_str(r#"{"name": "speedtest"}"#).unwrap();
        assert!(bare.args.is_empty());
    }

    #[tokio::test]
    async fn test_run_tests_preserves_order_of_successes() {
        let speed_test = ScriptedSpeedTest::new(&[300]);
        let (_tx, rx) = watch::channel(false);

        let (results, err) = run_tests(&speed_test, &[100, 200, 300, 400], &rx).await;

        let ids: Vec<i32> = results.iter().map(|r| r.server.id).collect();
        assert_eq!(ids, vec![100, 200, 400]);
        assert_eq!(err.unwrap().failed_server_ids(), vec![300]);
        assert_eq!(speed_test.calls(), vec![100, 200, 300, 400]);
    }

    #[tokio::test]
    async fn test_run_tests_all_succeed_has_no_error() {
        let speed_test = ScriptedSpeedTest::new(&[]);
        let (_tx, rx) = watch::channel(false);

        let (results, err) = run_tests(&speed_test, &[1, 2], &rx).await;

        assert_eq!(results.len(), 2);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_run_tests_empty_server_list() {
        let speed_test = ScriptedSpeedTest::new(&[]);
        let (_tx, rx) = watch::channel(false);

        let (results, err) = run_tests(&speed_test, &[], &rx).await;

        assert!(results.is_empty());
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_run_tests_all_fail() {
        let speed_test = ScriptedSpeedTest::new(&[1, 2, 3]);
        let (_tx, rx) = watch::channel(false);

        let (results, err) = run_tests(&speed_test, &[1, 2, 3], &rx).await;

        assert!(results.is_empty());
        let err = err.expect("all servers failed");
        assert_eq!(err.failed_server_ids(), vec![1, 2, 3]);
        assert!(err.to_string().starts_with("3 errors occurred:"));
    }

    #[tokio::test]
    async fn test_run_tests_cancelled_before_start() {
        let speed_test = ScriptedSpeedTest::new(&[]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let (results, err) = run_tests(&speed_test, &[1, 2, 3], &rx).await;

        assert!(results.is_empty());
        assert!(err.is_none());
        assert!(speed_test.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_tests_cancelled_between_servers() {
        let (tx, rx) = watch::channel(false);
        let speed_test = ScriptedSpeedTest::new(&[2]).cancel_after(2, tx);

        let (results, err) = run_tests(&speed_test, &[1, 2, 3, 4], &rx).await;

        assert_eq!(speed_test.calls(), vec![1, 2]);
        assert_eq!(results.len(), 1);
        assert_eq!(err.unwrap().failed_server_ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_scenario_one_success_one_failure() {
        let speed_test = ScriptedSpeedTest::new(&[200]);
        let (_tx, rx) = watch::channel(false);

        let (results, err) = run_tests(&speed_test, &[100, 200], &rx).await;

        assert_eq!(results, vec![sample_result(100)]);
        let err = err.unwrap();
        assert_eq!(err.failed_server_ids(), vec![200]);
        assert!(err.to_string().contains("server 200"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn shell(script: &str) -> CommandSpeedTest {
            CommandSpeedTest::new(Arc::new(Command {
                name: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            }))
        }

        #[tokio::test]
        async fn test_invoker_parses_stdout() {
            let json = serde_json::to_string(&sample_result(100)).unwrap();
            let speed_test = shell(&format!("printf '%s' '{json}'"));

            let result = speed_test.run(100).await.unwrap();

            assert_eq!(result, sample_result(100));
        }

        #[tokio::test]
        async fn test_invoker_appends_server_flag() {
            // `sh -c script -s 77` binds $0 to "-s" and $1 to "77".
            let speed_test = shell(r#"printf '{"server":{"id":%s},"isp":"%s"}' "$1" "$0""#);

            let result = speed_test.run(77).await.unwrap();

            assert_eq!(result.server.id, 77);
            assert_eq!(result.isp, "-s");
        }

        #[tokio::test]
        async fn test_invoker_non_zero_exit() {
            let speed_test = shell("printf '{}'; exit 3");

            let err = speed_test.run(1).await.unwrap_err();

            match err {
                InvocationError::ProcessFailed(ProcessFailure::Exit(status)) => {
                    assert_eq!(status.code(), Some(3));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_invoker_spawn_failure() {
            let speed_test = CommandSpeedTest::new(Arc::new(Command {
                name: "/nonexistent/speedtest-binary".to_string(),
                args: vec![],
            }));

            let err = speed_test.run(1).await.unwrap_err();

            assert!(matches!(
                err,
                InvocationError::ProcessFailed(ProcessFailure::Spawn(_))
            ));
        }

        #[tokio::test]
        async fn test_invoker_malformed_output() {
            let speed_test = shell("echo 'Speedtest by Ookla'");

            let err = speed_test.run(1).await.unwrap_err();

            assert!(matches!(err, InvocationError::MalformedOutput(_)));
            assert!(err.to_string().starts_with("failed to unmarshal results"));
        }

        #[tokio::test]
        async fn test_invoker_ignores_stderr() {
            let speed_test = shell("echo 'license prompt' >&2; printf '{\"isp\":\"X\"}'");

            let result = speed_test.run(5).await.unwrap();

            assert_eq!(result.isp, "X");
            assert!(result.is_missing_data());
        }
    }
}
