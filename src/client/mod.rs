//! The Client Dispatcher: session registration, leader discovery, and
//! command/query submission against a cluster member.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::DispatcherHandle;
pub use transport::ClusterTransport;
pub use transport::CloseSessionRequest;
pub use transport::CommandRequest;
pub use transport::KeepAliveRequest;
pub use transport::QueryRequest;
pub use transport::RegisterRequest;
pub use transport::RegisterResponse;
