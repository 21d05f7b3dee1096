//! Async client for the rtmessage publish/subscribe bus.
//!
//! A [`Connection`] talks to a message router over a Unix domain socket or
//! TCP. It serializes outgoing frames behind a single write lock, runs one
//! background task that decodes incoming frames, and fans them out to
//! registered listeners or to one-shot request callbacks.
//!
//! # Quick start
//!
//! ```no_run
//! use rtmessage::{CancellationToken, Connection, Message};
//!
//! # async fn demo() -> rtmessage::Result<()> {
//! let conn = Connection::builder("unix:///tmp/rtrouted", "my_app")
//!     .subscription("A.B.C")
//!     .message_listener(|msg: &Message| {
//!         println!("{}: {} bytes", msg.topic, msg.payload.len());
//!     })
//!     .build()?;
//!
//! conn.connect().await?;
//! conn.send(Message::new("A.B.C", b"hello".to_vec()), &CancellationToken::new())
//!     .await?;
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod endpoint;
mod error;
mod listener;
mod subscription;

pub use config::ConnectionBuilder;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use listener::{CancelListener, Listeners, MessageListener, ReadErrorListener};
pub use rtmessage_proto::{Flags, FrameError, Message};
pub use subscription::{SUBSCRIBE_TOPIC, SubscriptionRequest, inbox_topic};
pub use tokio_util::sync::CancellationToken;
