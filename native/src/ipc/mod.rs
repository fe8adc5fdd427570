// JSON-RPC 2.0 over anonymous pipe pairs, plus the bootstrap handle exchange.

pub mod engine;
pub mod handshake;
pub mod pending;
pub mod pipe;
pub mod protocol;

pub use engine::{positional, HandlerFuture, RpcChannel, RpcEngine};
pub use handshake::{
    connect_target, ExchangeHandles, HostHandshake, HostPipes, LaunchHandles, RemoteEnds,
    PIPE_READ_ENV, PIPE_WRITE_ENV,
};
pub use pipe::{
    memory_pipe, PipeDirection, PipeReader, PipeWriter, RawPipeHandle, RemotePipeEnd,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use protocol::{
    codes, AdapterLuid, Frame, HandleValue, Method, RpcError, RpcId, RpcMessage,
};
