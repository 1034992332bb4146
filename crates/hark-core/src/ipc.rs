use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::Mutex,
};

use crate::connectivity::ConnectivityState;
use crate::events::AssistantEvent;
use crate::handle::AssistantHandle;
use crate::session::{SessionState, TurnOrigin};

/// Socket file name inside the data directory
pub const SOCKET_NAME: &str = "hark.sock";

/// Status board published by the orchestrator after every event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    pub session_state: SessionState,
    pub turn_origin: Option<TurnOrigin>,
    pub paused_turns: usize,
    pub connectivity: ConnectivityState,
    pub auth_expired: bool,
    pub quiet_hours_active: bool,
    pub pending_priority: usize,
    pub pending_regular: usize,
    pub pending_filtered: usize,
    pub pending_reminders: usize,
    pub interrupts_in_window: usize,
}

impl StatusSnapshot {
    #[must_use]
    pub fn starting(at: DateTime<Local>) -> Self {
        Self {
            started_at: at,
            updated_at: at,
            session_state: SessionState::Idle,
            turn_origin: None,
            paused_turns: 0,
            connectivity: ConnectivityState::Connected,
            auth_expired: false,
            quiet_hours_active: false,
            pending_priority: 0,
            pending_regular: 0,
            pending_filtered: 0,
            pending_reminders: 0,
            interrupts_in_window: 0,
        }
    }
}

/// IPC request from CLI to the running assistant
#[derive(Serialize, Deserialize, Debug)]
pub enum IpcRequest {
    Status,
    Shutdown,
}

/// IPC response from the running assistant to CLI
#[derive(Serialize, Deserialize, Debug)]
pub enum IpcResponse {
    Status(StatusSnapshot),
    Shutdown,
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the socket is unreachable or the reply is malformed
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path).await?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

pub struct StatusIpcHandler {
    status: Mutex<StatusSnapshot>,
    handle: AssistantHandle,
}

impl StatusIpcHandler {
    #[must_use]
    pub fn new(handle: AssistantHandle, started_at: DateTime<Local>) -> Self {
        Self {
            status: Mutex::new(StatusSnapshot::starting(started_at)),
            handle,
        }
    }

    pub async fn publish(&self, snapshot: StatusSnapshot) {
        let mut lock = self.status.lock().await;
        *lock = snapshot;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.status.lock().await.clone()
    }

    /// Answer one request
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be written
    pub async fn handle(&self, stream: &mut UnixStream, request: IpcRequest) -> Result<()> {
        let response = self.respond(request).await;
        let encoded = bincode::serialize(&response)?;
        stream.write_all(&encoded).await?;
        Ok(())
    }

    async fn respond(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => IpcResponse::Status(self.snapshot().await),
            IpcRequest::Shutdown => {
                if let Err(e) = self.handle.submit_event(AssistantEvent::Shutdown).await {
                    log::warn!("Shutdown request after loop exit: {e}");
                }
                IpcResponse::Shutdown
            }
        }
    }
}

/// Accept connections until the task is dropped
///
/// # Errors
///
/// Returns an error if the socket cannot be bound
pub async fn listen(handler: Arc<StatusIpcHandler>, sock_path: &Path) -> io::Result<()> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;
    log::info!("Status endpoint listening on {}", sock_path.display());

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0; 1024];
                    match stream.read(&mut buf).await {
                        Ok(n) if n > 0 => match bincode::deserialize::<IpcRequest>(&buf[..n]) {
                            Ok(request) => {
                                if let Err(e) = handler.handle(&mut stream, request).await {
                                    log::error!("IPC handle error: {e}");
                                }
                            }
                            Err(e) => {
                                log::error!("IPC deserialize error: {e}");
                            }
                        },
                        Ok(_) => {} // Connection closed
                        Err(e) => {
                            log::error!("IPC read error: {e}");
                        }
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::event_channel;
    use chrono::TimeZone;

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_status_wire_format_roundtrip() {
        let mut snapshot = StatusSnapshot::starting(started());
        snapshot.connectivity = ConnectivityState::Degraded(2);
        snapshot.pending_regular = 4;
        snapshot.turn_origin = Some(TurnOrigin::ProactiveInterrupt);

        let bytes = bincode::serialize(&IpcResponse::Status(snapshot.clone())).unwrap();
        match bincode::deserialize::<IpcResponse>(&bytes).unwrap() {
            IpcResponse::Status(decoded) => assert_eq!(decoded, snapshot),
            IpcResponse::Shutdown => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_status_and_shutdown_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join(SOCKET_NAME);
        let (handle, mut events) = event_channel(4);
        let handler = Arc::new(StatusIpcHandler::new(handle, started()));

        let mut published = StatusSnapshot::starting(started());
        published.pending_priority = 1;
        handler.publish(published.clone()).await;

        let server_sock = sock.clone();
        let server = tokio::spawn(async move { listen(handler, &server_sock).await });
        // Wait for bind
        for _ in 0..50 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let client = IpcClient::new(&sock);
        match client.send_command(IpcRequest::Status).await.unwrap() {
            IpcResponse::Status(status) => assert_eq!(status, published),
            IpcResponse::Shutdown => panic!("wrong variant"),
        }

        assert!(matches!(
            client.send_command(IpcRequest::Shutdown).await.unwrap(),
            IpcResponse::Shutdown
        ));
        assert!(matches!(events.recv().await, Some(AssistantEvent::Shutdown)));
        server.abort();
    }
}
