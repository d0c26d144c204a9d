//! Delivery of notification events to subscribers.
//!
//! The [`dispatcher`] decides who receives an event and over which channel,
//! the channel senders ([`email`], [`push`]) talk to the outside world, and
//! the [`delivery_log`] keeps an audit trail of every attempt.
pub mod delivery_log;
pub mod dispatcher;
pub mod email;
pub mod push;
pub mod templates;

pub use delivery_log::{DeliveryLogger, InMemoryDeliveryStore, JsonLinesDeliveryStore};
pub use dispatcher::{ChannelCounts, ChannelSendError, DispatchReport, DispatchSettings, NotificationDispatcher};
pub use email::HttpEmailSender;
pub use push::ExpoPushSender;
