pub mod models;
pub mod senders;
pub mod service;

pub use models::{CardMessage, InstanceContext, NotificationEvent};
pub use service::{AttemptStatus, NotificationAttempt, NotificationService, NotifierSettings};
