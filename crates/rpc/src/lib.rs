pub mod cache;
pub mod client;
pub mod error;
pub mod protocol;
pub mod service;

pub use cache::RpcClientCache;
pub use client::{ClientOptions, RpcClient};
pub use error::{RemoteError, RemoteErrorKind, RpcError};
pub use protocol::{RpcArgs, RpcReply, RpcRequest, STATUS_ERROR, STATUS_OK};
pub use service::{RpcHandler, RpcService, ServiceError};
