pub mod connection;
pub mod machine;

pub use connection::{
    proxy_protocol_header, BackendConnection, BackendHandle, BackendReply, BackendRequest,
    BackendStream,
};
pub use machine::{AuthState, BackendProtocol, Effect};
