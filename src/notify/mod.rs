pub mod telegram;
pub mod threads;

pub use telegram::{MediaItem, NotificationSink, TelegramNotifier};
pub use threads::ThreadRoutes;
