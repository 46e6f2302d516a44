use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use teloxide::prelude::*;
use teloxide::types::Chat;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Collector, IncomingPost};

pub const SHORT_NAME: &str = "telegram";
pub const LONG_NAME: &str = "Telegram Channel Monitor";

fn chat_kind(chat: &Chat) -> &'static str {
    if chat.is_channel() {
        "channel"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_group() {
        "group"
    } else {
        "private"
    }
}

/// Message text, falling back to the caption of media posts.
fn post_text<'a>(text: Option<&'a str>, caption: Option<&'a str>) -> Option<&'a str> {
    text.or(caption).filter(|t| !t.trim().is_empty())
}

fn to_incoming(msg: &Message) -> Option<IncomingPost> {
    let text = post_text(msg.text(), msg.caption())?;
    let source_name = msg
        .chat
        .title()
        .or_else(|| msg.chat.username())
        .map(str::to_string);

    Some(IncomingPost {
        source_uid: msg.chat.id.0.to_string(),
        source_name,
        origin_time: Some(msg.date),
        text: text.to_string(),
        metadata: json!({
            "message_id": msg.id.0,
            "chat_type": chat_kind(&msg.chat),
            "chat_username": msg.chat.username(),
            "author_signature": msg.author_signature(),
            "has_photo": msg.photo().is_some(),
        }),
    })
}

/// Run the Telegram collector until `shutdown` flips to true.
pub async fn run(
    bot_token: &str,
    collector: Arc<Collector>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if bot_token.is_empty() {
        anyhow::bail!("Telegram bot token is not set (telegram.bot_token or TELEGRAM_BOT_TOKEN)");
    }
    let bot = Bot::new(bot_token);

    info!(
        "Starting Telegram collector (collector ID {})...",
        collector.collector_id()
    );

    // Channel posts arrive as their own update kind; group messages as plain messages
    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handle_post))
        .branch(
            Update::filter_message()
                .filter(|msg: Message| !msg.chat.is_private())
                .endpoint(handle_post),
        );

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![collector])
        .default_handler(|upd| async move {
            debug!("Ignoring update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram collector"))
        .build();

    let token = dispatcher.shutdown_token();
    let stopper = tokio::spawn(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
        info!("Stopping Telegram collector...");
        // The dispatcher may not be polling yet
        loop {
            match token.shutdown() {
                Ok(done) => {
                    done.await;
                    return;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    });

    dispatcher.dispatch().await;
    stopper.abort();

    info!("Telegram collector stopped");
    Ok(())
}

async fn handle_post(msg: Message, collector: Arc<Collector>) -> ResponseResult<()> {
    let Some(post) = to_incoming(&msg) else {
        debug!("Skipping post {} without text in chat {}", msg.id.0, msg.chat.id);
        return Ok(());
    };

    info!(
        "Post from {} ({}): {} chars",
        post.source_name.as_deref().unwrap_or("unnamed"),
        post.source_uid,
        post.text.chars().count()
    );

    // One bad post must not stop the dispatcher
    match collector.ingest(&post).await {
        Ok(Some(content_id)) => debug!("Post {} stored as content {}", msg.id.0, content_id),
        Ok(None) => warn!("Post {} from {} was not stored", msg.id.0, post.source_uid),
        Err(e) => error!("Failed to collect post {} from {}: {:#}", msg.id.0, post.source_uid, e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_text_prefers_text_then_caption() {
        assert_eq!(post_text(Some("body"), Some("caption")), Some("body"));
        assert_eq!(post_text(None, Some("caption")), Some("caption"));
        assert_eq!(post_text(None, None), None);
        assert_eq!(post_text(Some("  "), None), None);
    }

    #[tokio::test]
    async fn test_run_requires_token() {
        let (_tx, rx) = watch::channel(false);
        let store = crate::store::Store::open_in_memory().unwrap();
        let queue = Arc::new(crate::queue::SqliteQueue::open_in_memory(3).unwrap());
        let collector = Collector::register(store, queue, SHORT_NAME, LONG_NAME, true)
            .await
            .unwrap();
        assert!(run("", Arc::new(collector), rx).await.is_err());
    }
}
