//! Wire format shared by the coordinator, workers and consoles.
//!
//! Every frame on a session is one JSON object with the keys
//! `{type, target, name, data}`; function calls add `{function, args, kwargs}`.

pub mod classifier;
pub mod message;

pub use classifier::Classifier;
pub use message::{DecodeError, Envelope, FunctionMessage, Message, MessageKind, Target};
