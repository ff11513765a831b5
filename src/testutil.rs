//! In-memory fakes shared by the unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::QoS;

use crate::bus::{BusError, MessageBus};
use crate::remote::{CommandOutput, RemoteConnector, RemoteError, RemoteSession};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum BusMode {
    #[default]
    Ok,
    Fail,
    Stall,
}

/// [`MessageBus`] that records every publish.
#[derive(Debug, Default)]
pub struct RecordingBus {
    published: Mutex<Vec<Published>>,
    mode: BusMode,
}

impl RecordingBus {
    pub fn failing() -> Self {
        Self {
            mode: BusMode::Fail,
            ..Default::default()
        }
    }

    pub fn stalled() -> Self {
        Self {
            mode: BusMode::Stall,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Payloads only, in publish order.
    pub fn events(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.payload).collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BusError> {
        match self.mode {
            BusMode::Ok => {}
            BusMode::Fail => {
                return Err(BusError::Client(rumqttc::ClientError::TryRequest(
                    rumqttc::Request::Disconnect(rumqttc::Disconnect),
                )))
            }
            BusMode::Stall => std::future::pending::<()>().await,
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
        });
        Ok(())
    }
}

/// Calls observed by [`FakeConnector`] sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Connect,
    Upload { local: PathBuf, remote: String },
    Run(String),
    Disconnect,
}

/// Scripted [`RemoteConnector`]: each knob decides how one step behaves.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    pub calls: Arc<Mutex<Vec<RemoteCall>>>,
    pub fail_connect: bool,
    pub fail_upload: bool,
    pub fail_command: bool,
    /// Never complete the upload or the command, like a half-open session.
    pub hang_upload: bool,
    pub hang_command: bool,
    pub exit_codes: Arc<Mutex<VecDeque<Option<u32>>>>,
    pub stdout: String,
    pub stderr: String,
}

impl FakeConnector {
    pub fn with_exit_code(code: u32) -> Self {
        let fake = Self::default();
        fake.exit_codes.lock().unwrap().push_back(Some(code));
        fake
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran_command(&self) -> bool {
        self.calls()
            .iter()
            .any(|c| matches!(c, RemoteCall::Run(_)))
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.calls.lock().unwrap().push(RemoteCall::Connect);
        if self.fail_connect {
            return Err(RemoteError::Connect("connection refused".to_string()));
        }
        Ok(Box::new(FakeSession {
            fake: self.clone(),
        }))
    }
}

struct FakeSession {
    fake: FakeConnector,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.fake.calls.lock().unwrap().push(RemoteCall::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        });
        if self.fake.hang_upload {
            std::future::pending::<()>().await;
        }
        if self.fake.fail_upload {
            return Err(RemoteError::Upload("permission denied".to_string()));
        }
        Ok(())
    }

    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.fake
            .calls
            .lock()
            .unwrap()
            .push(RemoteCall::Run(command.to_string()));
        if self.fake.hang_command {
            std::future::pending::<()>().await;
        }
        if self.fake.fail_command {
            return Err(RemoteError::Command("channel closed".to_string()));
        }
        let exit_code = self
            .fake
            .exit_codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Some(0));
        Ok(CommandOutput {
            exit_code,
            stdout: self.fake.stdout.clone(),
            stderr: self.fake.stderr.clone(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.fake.calls.lock().unwrap().push(RemoteCall::Disconnect);
        Ok(())
    }
}
