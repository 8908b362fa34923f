pub mod assess;
pub mod render;
pub mod telegram;
pub mod types;

pub use telegram::{Notifier, SendTransport, TelegramClient};
pub use types::{AlertEvent, HealthSnapshot, Severity, SymbolSnapshot};
