pub mod backend;
pub mod noop;
pub mod slack;

pub use backend::AlertNotifier;
pub use noop::NoopNotifier;
pub use slack::SlackWebhook;
