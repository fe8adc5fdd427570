// Bootstrap handle exchange between host and target.
//
// The host creates four pipes. The target learns the ends of the host's
// server channel from its environment, connects, then asks for the ends of
// the host's client channel over RPC.

use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;

use super::engine::{RpcChannel, RpcEngine};
use super::pipe::{open_inbound, open_outbound, PipeReader, PipeWriter, RawPipeHandle, RemotePipeEnd};
use super::protocol::{HandleValue, Method};
use crate::error::{BridgeError, BridgeResult};

pub const PIPE_READ_ENV: &str = "OVERLAY_PIPE_READ";
pub const PIPE_WRITE_ENV: &str = "OVERLAY_PIPE_WRITE";

/// The host's server-channel ends as the target sees them: it reads
/// responses from `read` and writes requests to `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchHandles {
    pub read: RawPipeHandle,
    pub write: RawPipeHandle,
}

impl LaunchHandles {
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = lookup(PIPE_READ_ENV)
            .ok_or_else(|| BridgeError::HandshakeFailed(format!("{} is not set", PIPE_READ_ENV)))?;
        let write = lookup(PIPE_WRITE_ENV)
            .ok_or_else(|| BridgeError::HandshakeFailed(format!("{} is not set", PIPE_WRITE_ENV)))?;

        Ok(Self {
            read: parse_raw_handle(PIPE_READ_ENV, &read)?,
            write: parse_raw_handle(PIPE_WRITE_ENV, &write)?,
        })
    }

    /// Environment entries handed to the launched target.
    pub fn to_env(&self) -> [(&'static str, String); 2] {
        [
            (PIPE_READ_ENV, self.read.to_string()),
            (PIPE_WRITE_ENV, self.write.to_string()),
        ]
    }
}

/// The host's client-channel ends as the target sees them: its server reads
/// requests from `read` and writes responses to `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeHandles {
    pub read: RawPipeHandle,
    pub write: RawPipeHandle,
}

pub fn parse_raw_handle(name: &str, text: &str) -> BridgeResult<RawPipeHandle> {
    let value: i64 = text.trim().parse().map_err(|_| {
        BridgeError::HandshakeFailed(format!("{} = {:?} is not an integer handle", name, text))
    })?;
    validate_handle(name, HandleValue(value as u64))
}

fn validate_handle(name: &str, handle: HandleValue) -> BridgeResult<RawPipeHandle> {
    if !handle.is_valid() {
        return Err(BridgeError::HandshakeFailed(format!(
            "{} is the invalid handle sentinel",
            name
        )));
    }
    let raw = handle.0 as i64;
    if raw < 0 {
        return Err(BridgeError::HandshakeFailed(format!(
            "{} is negative ({})",
            name, raw
        )));
    }
    Ok(raw)
}

/// Pipe ends created on behalf of the target.
pub struct RemoteEnds {
    launch_read: RemotePipeEnd,
    launch_write: RemotePipeEnd,
    exchange_read: RemotePipeEnd,
    exchange_write: RemotePipeEnd,
}

impl RemoteEnds {
    fn all(&self) -> [&RemotePipeEnd; 4] {
        [
            &self.launch_read,
            &self.launch_write,
            &self.exchange_read,
            &self.exchange_write,
        ]
    }

    pub fn launch_handles(&self) -> LaunchHandles {
        LaunchHandles {
            read: self.launch_read.raw_handle(),
            write: self.launch_write.raw_handle(),
        }
    }

    pub fn exchange_handles(&self) -> ExchangeHandles {
        ExchangeHandles {
            read: self.exchange_read.raw_handle(),
            write: self.exchange_write.raw_handle(),
        }
    }

    /// Let the next spawned child inherit all four ends.
    pub fn mark_inheritable(&self) -> BridgeResult<()> {
        for end in self.all() {
            end.make_inheritable()?;
        }
        Ok(())
    }

    /// Hand every end to an in-process target without closing it.
    pub fn detach(self) -> LaunchHandles {
        let launch = self.launch_handles();
        self.launch_read.detach();
        self.launch_write.detach();
        self.exchange_read.detach();
        self.exchange_write.detach();
        launch
    }

    /// Drop the host's copies once the target owns them.
    pub fn close(&mut self) {
        self.launch_read.close();
        self.launch_write.close();
        self.exchange_read.close();
        self.exchange_write.close();
        debug!("[HANDSHAKE] Released host copies of the target pipe ends");
    }
}

/// The four pipes of one host/target mesh, host side.
pub struct HostPipes {
    pub server: RpcChannel,
    pub client: RpcChannel,
    pub remote: RemoteEnds,
}

impl HostPipes {
    pub fn open(max_message_size: usize) -> BridgeResult<Self> {
        // Server channel: target requests in, host responses out.
        let (server_in, launch_write) = open_inbound(max_message_size)?;
        let (server_out, launch_read) = open_outbound(max_message_size)?;
        // Client channel: host requests out, target responses in.
        let (client_out, exchange_read) = open_outbound(max_message_size)?;
        let (client_in, exchange_write) = open_inbound(max_message_size)?;

        let remote = RemoteEnds {
            launch_read,
            launch_write,
            exchange_read,
            exchange_write,
        };
        info!(
            "[HANDSHAKE] Opened pipes: launch {:?}, exchange {:?}",
            remote.launch_handles(),
            remote.exchange_handles()
        );

        Ok(Self {
            server: RpcChannel::new(server_in, server_out),
            client: RpcChannel::new(client_in, client_out),
            remote,
        })
    }
}

const READ_SERVED: u8 = 0b01;
const WRITE_SERVED: u8 = 0b10;
const BOTH_SERVED: u8 = READ_SERVED | WRITE_SERVED;

/// Host half of the handshake: serves the exchange handles and tracks
/// whether the target has fetched both.
pub struct HostHandshake {
    served: watch::Sender<u8>,
}

impl HostHandshake {
    pub fn install(engine: &RpcEngine, handles: ExchangeHandles) -> Arc<Self> {
        let (served, _) = watch::channel(0);
        let handshake = Arc::new(Self { served });

        let tracker = Arc::clone(&handshake);
        engine.register_method(Method::GetServerReadHandle, move |_| {
            let tracker = Arc::clone(&tracker);
            async move {
                tracker.mark_served(READ_SERVED, "read", handles.read);
                Ok(Some(serde_json::to_value(HandleValue(handles.read as u64))?))
            }
        });

        let tracker = Arc::clone(&handshake);
        engine.register_method(Method::GetServerWriteHandle, move |_| {
            let tracker = Arc::clone(&tracker);
            async move {
                tracker.mark_served(WRITE_SERVED, "write", handles.write);
                Ok(Some(serde_json::to_value(HandleValue(handles.write as u64))?))
            }
        });

        handshake
    }

    fn mark_served(&self, bit: u8, which: &str, raw: RawPipeHandle) {
        self.served.send_modify(|served| *served |= bit);
        info!("[HANDSHAKE] Served {} handle {}", which, raw);
    }

    pub fn is_complete(&self) -> bool {
        *self.served.borrow() == BOTH_SERVED
    }

    pub async fn wait_complete(&self) {
        let mut served = self.served.subscribe();
        let _ = served.wait_for(|served| *served == BOTH_SERVED).await;
    }

    /// Wait for both handle calls, failing if the deadline passes first.
    pub async fn wait_served(&self, timeout: Option<Duration>) -> BridgeResult<()> {
        tokio::select! {
            _ = self.wait_complete() => Ok(()),
            _ = deadline(timeout) => Err(BridgeError::HandshakeFailed(format!(
                "target did not fetch its handles within {:?}",
                timeout.unwrap_or_default()
            ))),
        }
    }

    /// Wait for both handle calls, failing if the target exits or the
    /// deadline passes first.
    pub async fn wait_for_target(&self, child: &mut Child, timeout: Option<Duration>) -> BridgeResult<()> {
        tokio::select! {
            result = self.wait_served(timeout) => {
                if result.is_ok() {
                    info!("[HANDSHAKE] Target connected");
                }
                result
            }
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("target exited ({}) before the handshake completed", status),
                    Err(e) => format!("lost track of target: {}", e),
                };
                warn!("[HANDSHAKE] {}", reason);
                Err(BridgeError::HandshakeFailed(reason))
            }
        }
    }
}

fn deadline(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    }
}

/// Target half of the handshake.
///
/// Adopts the launch handles, starts `client` on them and fetches the
/// exchange handles. Returns the channel the target serves the host on.
/// On any failure the client is closed and `HandshakeFailed` is returned.
pub async fn connect_target(
    client: &RpcEngine,
    launch: LaunchHandles,
    max_message_size: usize,
    timeout: Option<Duration>,
) -> BridgeResult<RpcChannel> {
    // SAFETY: launch handles were inherited from the host for this process
    // alone and are adopted exactly once.
    let channel = unsafe { adopt_channel(launch.read, launch.write, max_message_size) }?;
    client.start(channel).await?;
    info!("[HANDSHAKE] Client channel up on {:?}", launch);

    match fetch_server_channel(client, max_message_size, timeout).await {
        Ok(channel) => Ok(channel),
        Err(e) => {
            client.close().await;
            Err(match e {
                BridgeError::HandshakeFailed(_) => e,
                other => BridgeError::HandshakeFailed(other.to_string()),
            })
        }
    }
}

async fn fetch_server_channel(
    client: &RpcEngine,
    max_message_size: usize,
    timeout: Option<Duration>,
) -> BridgeResult<RpcChannel> {
    let read = request_handle(client, Method::GetServerReadHandle, timeout).await?;
    // Owned from here on, so a failed second fetch closes it.
    // SAFETY: the host created this end for this process and hands the
    // value out once.
    let inbound = unsafe { PipeReader::from_raw_handle(read) }?.with_max_message_size(max_message_size);

    let write = request_handle(client, Method::GetServerWriteHandle, timeout).await?;
    // SAFETY: as above.
    let outbound = unsafe { PipeWriter::from_raw_handle(write) }?.with_max_message_size(max_message_size);
    info!("[HANDSHAKE] Server channel handles: read {} write {}", read, write);

    Ok(RpcChannel::new(inbound, outbound))
}

async fn request_handle(
    client: &RpcEngine,
    method: Method,
    timeout: Option<Duration>,
) -> BridgeResult<RawPipeHandle> {
    let value = client
        .call_with_timeout(method.clone(), Vec::new(), timeout)
        .await?;
    let handle: HandleValue = serde_json::from_value(value).map_err(|e| {
        BridgeError::HandshakeFailed(format!("{} returned a malformed handle: {}", method, e))
    })?;
    validate_handle(method.as_str(), handle)
}

unsafe fn adopt_channel(
    read: RawPipeHandle,
    write: RawPipeHandle,
    max_message_size: usize,
) -> BridgeResult<RpcChannel> {
    let inbound = PipeReader::from_raw_handle(read)?.with_max_message_size(max_message_size);
    let outbound = PipeWriter::from_raw_handle(write)?.with_max_message_size(max_message_size);
    Ok(RpcChannel::new(inbound, outbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe::DEFAULT_MAX_MESSAGE_SIZE;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_launch_handles_from_environment() {
        let handles =
            LaunchHandles::from_lookup(lookup(&[(PIPE_READ_ENV, "12"), (PIPE_WRITE_ENV, " 13 ")]))
                .unwrap();
        assert_eq!(handles, LaunchHandles { read: 12, write: 13 });

        let env = handles.to_env();
        let restored = LaunchHandles::from_lookup(lookup(&[
            (env[0].0, env[0].1.as_str()),
            (env[1].0, env[1].1.as_str()),
        ]))
        .unwrap();
        assert_eq!(restored, handles);
    }

    #[test]
    fn test_malformed_launch_handles_fail_handshake() {
        for (read, write) in [("abc", "3"), ("-1", "3"), ("4", "-7"), ("", "3")] {
            let err = LaunchHandles::from_lookup(lookup(&[(PIPE_READ_ENV, read), (PIPE_WRITE_ENV, write)]))
                .unwrap_err();
            assert!(matches!(err, BridgeError::HandshakeFailed(_)), "{} / {}", read, write);
        }

        let err = LaunchHandles::from_lookup(lookup(&[(PIPE_READ_ENV, "3")])).unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_wait_served_times_out() {
        let engine = RpcEngine::new("server", None);
        let handshake = HostHandshake::install(&engine, ExchangeHandles { read: 5, write: 6 });
        assert!(!handshake.is_complete());

        let err = handshake
            .wait_served(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_handles_served_over_rpc() {
        let (host_side, target_side) = RpcChannel::memory_pair(4096);
        let server = RpcEngine::new("server", None);
        let handshake = HostHandshake::install(&server, ExchangeHandles { read: 21, write: 22 });
        server.start(host_side).await.unwrap();

        let client = RpcEngine::new("client", Some(Duration::from_secs(5)));
        client.start(target_side).await.unwrap();

        let read = request_handle(&client, Method::GetServerReadHandle, None).await.unwrap();
        assert!(!handshake.is_complete());
        let write = request_handle(&client, Method::GetServerWriteHandle, None).await.unwrap();

        assert_eq!((read, write), (21, 22));
        handshake.wait_served(Some(Duration::from_secs(1))).await.unwrap();
        assert!(handshake.is_complete());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_target_exit_fails_handshake() {
        let engine = RpcEngine::new("server", None);
        let handshake = HostHandshake::install(&engine, ExchangeHandles { read: 5, write: 6 });
        let mut child = tokio::process::Command::new("true").spawn().unwrap();

        let err = handshake
            .wait_for_target(&mut child, Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_four_pipe_mesh_over_os_pipes() {
        let pipes = HostPipes::open(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let exchange = pipes.remote.exchange_handles();

        let host_server = RpcEngine::new("host-server", Some(Duration::from_secs(5)));
        let handshake = HostHandshake::install(&host_server, exchange);
        host_server.start(pipes.server).await.unwrap();
        let host_client = RpcEngine::new("host-client", Some(Duration::from_secs(5)));
        host_client.start(pipes.client).await.unwrap();

        let launch = pipes.remote.detach();
        let target_client = RpcEngine::new("target-client", Some(Duration::from_secs(5)));
        let server_channel = connect_target(
            &target_client,
            launch,
            DEFAULT_MAX_MESSAGE_SIZE,
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        assert!(handshake.is_complete());

        let target_server = RpcEngine::new("target-server", None);
        target_server.register_method(Method::SetMouseCursor, |params| async move {
            Ok(Some(json!(params.first() == Some(&json!("pointer")))))
        });
        target_server.start(server_channel).await.unwrap();

        let applied = host_client
            .call(Method::SetMouseCursor, vec![json!("pointer")])
            .await
            .unwrap();
        assert_eq!(applied, json!(true));

        target_client.close().await;
        host_server.wait_closed().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_write_fetch_closes_fetched_read_end() {
        let pipes = HostPipes::open(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let (mut exchange_writer, exchange_read) = open_outbound(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        let exchange_read = exchange_read.detach();

        // Only the read half of the exchange is served.
        let host_server = RpcEngine::new("host-server", None);
        host_server.register_method(Method::GetServerReadHandle, move |_| async move {
            Ok(Some(serde_json::to_value(HandleValue(exchange_read as u64))?))
        });
        host_server.start(pipes.server).await.unwrap();

        let launch = pipes.remote.detach();
        let target_client = RpcEngine::new("target-client", Some(Duration::from_secs(5)));
        let err = connect_target(&target_client, launch, DEFAULT_MAX_MESSAGE_SIZE, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::HandshakeFailed(_)));

        // With its only reader gone the pipe reports a broken write.
        let mut closed = false;
        for _ in 0..100 {
            match exchange_writer.write_message("ping").await {
                Err(e) if e.is_transport_closed() => {
                    closed = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(closed, "fetched read end still open after the failed handshake");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sentinel_exchange_handle_fails_handshake() {
        let pipes = HostPipes::open(DEFAULT_MAX_MESSAGE_SIZE).unwrap();

        let host_server = RpcEngine::new("host-server", None);
        host_server.register_method(Method::GetServerReadHandle, |_| async {
            Ok(Some(serde_json::to_value(HandleValue::INVALID)?))
        });
        host_server.start(pipes.server).await.unwrap();

        let launch = pipes.remote.detach();
        let target_client = RpcEngine::new("target-client", Some(Duration::from_secs(5)));
        let err = connect_target(&target_client, launch, DEFAULT_MAX_MESSAGE_SIZE, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::HandshakeFailed(_)));
        assert!(target_client.is_closed());
    }
}
