pub mod api_call;
pub mod notification;
pub mod script;

pub use api_call::{ApiCallExecutor, WebhookExecutor};
pub use notification::NotificationExecutor;
pub use script::ScriptExecutor;
