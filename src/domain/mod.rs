//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! broker implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod handler;
mod message;

// --- Broker domain re-exports ---

pub use broker::{
    //
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    Session,
    SessionPtr,
    StartPosition,
};

// --- Message domain re-exports ---

pub use handler::{handler_fn, HandlerFn, MessageHandler};
pub use message::{GroupName, MessageRequest, SubscribeRequest};
