pub mod dispatch;
pub mod election;
pub mod handshake;
pub mod health;
pub mod registry;
pub mod server;
pub mod session;

pub use dispatch::{Call, HandlerRegistry};
pub use election::{negotiate, Role};
pub use handshake::{Identity, PeerKind, Rejection};
pub use registry::Registry;
