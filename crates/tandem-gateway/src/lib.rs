pub mod connection;
pub mod dispatcher;
pub mod notifier;
pub mod push;

pub use dispatcher::Dispatcher;
pub use notifier::NotificationDispatcher;
pub use push::{PushGateway, PushMessage};
