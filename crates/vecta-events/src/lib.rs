//! Reconnecting server-push event stream client for the Vecta admin console.
//!
//! The console pushes task progress, notifications, and system log lines
//! over one long-lived ND-JSON connection. This crate keeps that connection
//! alive within a bounded retry budget and fans each message out to
//! subscribers in registration order.

pub mod client;
pub mod error;
pub mod message;
pub mod transport;

pub use client::{
    ConnectionState, EVENTS_PATH, EventStreamClient, PushCallback, ReconnectPolicy, Subscription,
};
pub use error::{Result, StreamError};
pub use message::{
    NotificationReadReceipt, NotificationRecord, PushMessage, SystemLogLine, TaskProgress,
    parse_frame,
};
pub use transport::{ByteStream, HttpStreamTransport, StreamTransport};
