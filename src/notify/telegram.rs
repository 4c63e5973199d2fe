use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use teloxide::payloads::SendMediaGroupSetters;
use teloxide::requests::Requester;
use teloxide::types::{
    ChatId, InputFile, InputMedia, InputMediaPhoto, InputMediaVideo, MessageId, ThreadId,
};
use teloxide::Bot;

use crate::config::TelegramConfig;
use crate::error::Result;
use crate::notify::threads::ThreadRoutes;

/// One attachment in an outgoing notification.
#[derive(Debug, Clone)]
pub enum MediaItem {
    Photo { path: PathBuf, caption: String },
    Video { path: PathBuf, caption: String },
}

/// Chat sink for event and status notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Operational status line, sent to the status chat.
    async fn send_status(&self, text: &str) -> Result<()>;

    /// Media group routed to the camera's thread in the event chat.
    async fn send_media_group(&self, camera: &str, items: Vec<MediaItem>) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
    event_chat: ChatId,
    status_chat: ChatId,
    routes: ThreadRoutes,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            event_chat: ChatId(config.chat_id),
            status_chat: ChatId(config.error_chat_id),
            routes: ThreadRoutes::new(config.camera_threads.clone()),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send_status(&self, text: &str) -> Result<()> {
        self.bot.send_message(self.status_chat, text).await?;
        Ok(())
    }

    async fn send_media_group(&self, camera: &str, items: Vec<MediaItem>) -> Result<()> {
        let media: Vec<InputMedia> = items.into_iter().map(input_media).collect();
        let thread = self.routes.thread_for(camera);

        let mut request = self.bot.send_media_group(self.event_chat, media);
        if thread != 0 {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        request.await?;
        debug!("sent media group for camera {} to thread {}", camera, thread);
        Ok(())
    }
}

fn input_media(item: MediaItem) -> InputMedia {
    match item {
        MediaItem::Photo { path, caption } => {
            InputMedia::Photo(InputMediaPhoto::new(InputFile::file(path)).caption(caption))
        }
        MediaItem::Video { path, caption } => {
            InputMedia::Video(InputMediaVideo::new(InputFile::file(path)).caption(caption))
        }
    }
}
