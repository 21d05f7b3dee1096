//! Connection configuration and builder.

use std::sync::Arc;
use std::time::Duration;

use rtmessage_proto::MAX_TOPIC_LEN;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::listener::{MessageListener, ReadErrorListener};
use crate::subscription::inbox_topic;

/// Validated settings shared by a connection and its reader task.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// Router address.
    pub endpoint: Endpoint,
    /// Private inbox topic derived from the application name and inbox id.
    pub inbox: String,
    /// Bound on reading the rest of a frame once it has started.
    pub read_timeout: Option<Duration>,
    /// Bound on each send, including the wait for the write lock.
    pub write_timeout: Option<Duration>,
    /// Bound on dialing the router.
    pub connect_timeout: Option<Duration>,
}

/// Builder for a [`Connection`].
///
/// Defaults: no timeouts, no subscriptions besides the private inbox, inbox
/// id equal to the OS process id.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use rtmessage::Connection;
///
/// let conn = Connection::builder("tcp://127.0.0.1:10001", "my_app")
///     .read_timeout(Duration::from_secs(5))
///     .write_timeout(Duration::from_secs(5))
///     .subscription("A.B.C")
///     .build()
///     .expect("invalid connection config");
/// ```
#[must_use = "a ConnectionBuilder does nothing until .build() is called"]
pub struct ConnectionBuilder {
    /// Router URL, parsed in `build`.
    url: String,
    /// Application name used in the inbox topic.
    app_name: String,
    /// Process-unique part of the inbox topic.
    inbox_id: u32,
    /// See [`ConnectionBuilder::read_timeout`].
    read_timeout: Option<Duration>,
    /// See [`ConnectionBuilder::write_timeout`].
    write_timeout: Option<Duration>,
    /// See [`ConnectionBuilder::connect_timeout`].
    connect_timeout: Option<Duration>,
    /// Topics subscribed on every connect.
    subscriptions: Vec<String>,
    /// Listeners registered before the connection exists.
    message_listeners: Vec<Arc<dyn MessageListener>>,
    /// Read-error listeners registered before the connection exists.
    error_listeners: Vec<Arc<dyn ReadErrorListener>>,
}

impl ConnectionBuilder {
    /// Starts a builder for the router at `url` on behalf of `app_name`.
    pub fn new(url: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            app_name: app_name.into(),
            inbox_id: std::process::id(),
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            subscriptions: Vec::new(),
            message_listeners: Vec::new(),
            error_listeners: Vec::new(),
        }
    }

    /// Bounds how long the rest of a frame may take once its first bytes
    /// have arrived. Idle time between frames is never bounded.
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Bounds each send, subscribe, and unsubscribe call.
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Bounds how long [`Connection::connect`] waits for the socket to open.
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Overrides the process-unique inbox id (default: the OS process id).
    pub const fn inbox_id(mut self, id: u32) -> Self {
        self.inbox_id = id;
        self
    }

    /// Adds a topic to subscribe to on every connect.
    pub fn subscription(mut self, topic: impl Into<String>) -> Self {
        self.subscriptions.push(topic.into());
        self
    }

    /// Adds several topics to subscribe to on every connect.
    pub fn subscriptions<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Registers a listener for messages not claimed by a request callback.
    ///
    /// Use [`Connection::add_message_listener`] to get a cancel handle.
    pub fn message_listener(mut self, listener: impl MessageListener + 'static) -> Self {
        self.message_listeners.push(Arc::new(listener));
        self
    }

    /// Registers a listener for the error that stops the background reader.
    pub fn error_listener(mut self, listener: impl ReadErrorListener + 'static) -> Self {
        self.error_listeners.push(Arc::new(listener));
        self
    }

    /// Validates the configuration and creates a disconnected [`Connection`].
    pub fn build(self) -> Result<Connection> {
        let endpoint: Endpoint = self.url.parse()?;
        if self.app_name.is_empty() {
            return Err(Error::InvalidInput("application name is required".into()));
        }
        for topic in &self.subscriptions {
            validate_topic(topic)?;
        }
        let inbox = inbox_topic(&self.app_name, self.inbox_id);
        validate_topic(&inbox)?;

        let config = Config {
            endpoint,
            inbox,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            connect_timeout: self.connect_timeout,
        };
        Ok(Connection::from_parts(
            config,
            self.subscriptions,
            self.message_listeners,
            self.error_listeners,
        ))
    }
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("url", &self.url)
            .field("app_name", &self.app_name)
            .field("inbox_id", &self.inbox_id)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

/// Rejects topics the wire format cannot carry.
pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidInput("topic must not be empty".into()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidInput(format!(
            "topic '{topic}' is {} bytes, limit is {MAX_TOPIC_LEN}",
            topic.len()
        )));
    }
    Ok(())
}
