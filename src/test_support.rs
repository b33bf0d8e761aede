//! Fixtures shared by the unit tests.
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::sync::Mutex;
use tokio::sync::watch;

use crate::speedtest::{
    InvocationError, Ping, ProcessFailure, Server, Speed, SpeedTest, TestResults,
};

/// The canonical complete result used across tests, tagged with `server_id`.
pub(crate) fn sample_result(server_id: i32) -> TestResults {
    TestResults {
        ping: Ping {
            latency: 10.0,
            jitter: 1.0,
        },
        download: Speed {
            bandwidth: 5000.0,
            bytes: 500000.0,
            elapsed: 100.0,
        },
        upload: Speed {
            bandwidth: 2000.0,
            bytes: 200000.0,
            elapsed: 100.0,
        },
        packet_loss: 0.0,
        isp: "ISP".to_string(),
        server: Server {
            id: server_id,
            name: "A".to_string(),
            location: "L".to_string(),
            country: "C".to_string(),
            host: "h".to_string(),
            port: 8080,
        },
    }
}

/// A `SpeedTest` that succeeds with `sample_result` for every server except
/// the ones listed as failing, and records every call it receives.
pub(crate) struct ScriptedSpeedTest {
    failing: HashSet<i32>,
    calls: Mutex<Vec<i32>>,
    cancel_after: Option<(usize, watch::Sender<bool>)>,
    result_override: Option<TestResults>,
}

impl ScriptedSpeedTest {
    pub(crate) fn new(failing: &[i32]) -> Self {
        Self {
            failing: failing.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
            cancel_after: None,
            result_override: None,
        }
    }

    /// Requests shutdown once `count` servers have been attempted.
    pub(crate) fn cancel_after(mut self, count: usize, tx: watch::Sender<bool>) -> Self {
        self.cancel_after = Some((count, tx));
        self
    }

    /// Returns `result` (with the server id rewritten) instead of the sample.
    pub(crate) fn with_result(mut self, result: TestResults) -> Self {
        self.result_override = Some(result);
        self
    }

    pub(crate) fn calls(&self) -> Vec<i32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeedTest for ScriptedSpeedTest {
    async fn run(&self, server_id: i32) -> Result<TestResults, InvocationError> {
        let attempted = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(server_id);
            calls.len()
        };
        if let Some((count, tx)) = &self.cancel_after {
            if attempted >= *count {
                let _ = tx.send(true);
            }
        }

        if self.failing.contains(&server_id) {
            return Err(InvocationError::ProcessFailed(ProcessFailure::Spawn(
                io::Error::other("exit status: 1"),
            )));
        }
        let mut result = self
            .result_override
            .clone()
            .unwrap_or_else(|| sample_result(server_id));
        result.server.id = server_id;
        Ok(result)
    }
}
