use crate::process::RunState;
use crate::versions::VersionFact;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Everything a worker reports back to the presentation side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunState {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Version {
        fact: VersionFact,
    },
    Operation {
        kind: OperationKind,
        success: bool,
        message: String,
    },
    /// The repository root was marked as a safe directory for git.
    SafeDirectoryMarked {
        root: PathBuf,
    },
    /// The bundled git path was written into ComfyUI-Manager's config.
    ManagerGitApplied {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Start,
    Stop,
    Update,
    Checkout,
    Install,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Start => write!(f, "start"),
            OperationKind::Stop => write!(f, "stop"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Checkout => write!(f, "checkout"),
            OperationKind::Install => write!(f, "install"),
        }
    }
}

impl Event {
    pub fn operation<T: std::fmt::Display, E: std::fmt::Display>(
        kind: OperationKind,
        result: &Result<T, E>,
    ) -> Self {
        match result {
            Ok(value) => Event::Operation {
                kind,
                success: true,
                message: value.to_string(),
            },
            Err(e) => Event::Operation {
                kind,
                success: false,
                message: e.to_string(),
            },
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending half of the dispatch queue. Cloned into every worker; sends
/// after the receiver is gone are dropped.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A dispatcher nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
