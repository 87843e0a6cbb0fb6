//! # amqp-receiver-core
//!
//! Credit-flow, prefetch-buffer and pending-request state machine for a
//! single AMQP 1.0 receiver link, built for embedding inside a larger
//! messaging client (session/connection management, wire codec and the CBS
//! channel itself all live outside this crate, behind the traits in
//! [`amqp`]).

#![forbid(unsafe_code)]
#![warn(
    // Warns on ::path, allows crate::path.
    absolute_paths_not_starting_with_crate,

    // Warns you about missing documentation comments.
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Warns you when you have dependencies you're not using.
    unused_crate_dependencies,

    // Warns on converting values using the `as` keyword.
    clippy::as_conversions,
)]

pub mod amqp;
pub mod config;
pub mod error;
mod credit;
mod link_state;
mod pending_queue;
mod prefetch_buffer;
mod reactor;
mod receiver;
mod timeout_tracker;
mod timer;
mod token_manager;

pub use config::ReceiverConfig;
pub use error::{Error, LinkError};
pub use link_state::{ErrorContextSnapshot, LinkState};
pub use reactor::LinkHandlerSink;
pub use receiver::Receiver;

/// Convenience type for a result using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    pub use super::*;

    mod fakes;
    mod basic;
    mod scenarios;
}
