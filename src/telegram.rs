use async_trait::async_trait;
use grammers_client::session::Session;
use grammers_client::types::{Chat, Media, PackedChat};
use grammers_client::{Client, Config, SignInError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::models::{Channel, MediaKind, RawMessage};

/// Bot API style ids for channels carry this offset (`-100xxxxxxxxxx`).
const MARKED_CHANNEL_OFFSET: i64 = 1_000_000_000_000;

/// Anything that can hand out a channel's history one page at a time.
#[async_trait(?Send)]
pub trait MessageSource {
    /// Up to `limit` messages of `channel` strictly older than `before_id`
    /// (or the newest ones when `None`), most recent first.
    async fn fetch_page(
        &self,
        channel: &Channel,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;
}

fn telegram_err<E: Display>(e: E) -> Error {
    Error::Telegram(e.to_string())
}

/// Connect to Telegram and ensure authorization. Saves the session to `config.session_file`.
pub async fn connect(config: &TelegramConfig) -> Result<Client> {
    let client = Client::connect(Config {
        session: Session::load_file_or_create(&config.session_file)?,
        api_id: config.api_id,
        api_hash: config.api_hash.clone(),
        params: Default::default(),
    })
    .await
    .map_err(telegram_err)?;

    if !client.is_authorized().await.map_err(telegram_err)? {
        println!("First-time login: please enter your Telegram credentials.");
        let phone = prompt("Enter your phone number (international format): ")?;
        let token = client
            .request_login_code(phone.trim())
            .await
            .map_err(telegram_err)?;
        let code = prompt("Enter the login code you received: ")?;
        match client.sign_in(&token, code.trim()).await {
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().unwrap_or("none");
                let password = prompt(&format!("Enter your password (hint: {}): ", hint))?;
                client
                    .check_password(password_token, password.trim())
                    .await
                    .map_err(telegram_err)?;
            }
            Err(e) => return Err(Error::Telegram(format!("Login failed: {}", e))),
            Ok(_) => {}
        }
        info!("Logged in to Telegram successfully.");
        if let Err(e) = client.session().save_to_file(&config.session_file) {
            warn!("Failed to save session file, next run will ask to log in again: {}", e);
        }
    }

    let me = client.get_me().await.map_err(telegram_err)?;
    info!(
        "Connected to Telegram as {} (@{})",
        me.first_name(),
        me.username().unwrap_or("no username")
    );
    Ok(client)
}

fn prompt(message: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", message)?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

/// Strip the `-100` marker some tools put in front of channel ids.
/// `None` when the id has no positive counterpart.
pub fn bare_channel_id(id: i64) -> Option<i64> {
    if id <= -MARKED_CHANNEL_OFFSET {
        id.checked_neg().map(|n| n - MARKED_CHANNEL_OFFSET)
    } else {
        id.checked_abs()
    }
}

/// User and channel ids live in separate namespaces, so only channels can match.
fn dialog_matches(is_channel: bool, dialog_id: i64, wanted: i64) -> bool {
    is_channel && bare_channel_id(dialog_id) == Some(wanted)
}

/// What the media mapping needs to know about a grammers `Media` value.
#[derive(Debug, Clone, Copy)]
enum MediaShape<'a> {
    Photo,
    Document { mime: Option<&'a str> },
    Sticker,
    Contact,
    Poll,
    Geo,
    GeoLive,
    Venue,
    WebPage,
    Other,
}

fn media_shape(media: &Media) -> MediaShape<'_> {
    match media {
        Media::Photo(_) => MediaShape::Photo,
        Media::Document(doc) => MediaShape::Document { mime: doc.mime_type() },
        Media::Sticker(_) => MediaShape::Sticker,
        Media::Contact(_) => MediaShape::Contact,
        Media::Poll(_) => MediaShape::Poll,
        Media::Geo(_) => MediaShape::Geo,
        Media::GeoLive(_) => MediaShape::GeoLive,
        Media::Venue(_) => MediaShape::Venue,
        Media::WebPage(_) => MediaShape::WebPage,
        _ => MediaShape::Other,
    }
}

fn kind_of(shape: MediaShape<'_>) -> MediaKind {
    match shape {
        MediaShape::Photo => MediaKind::Photo,
        MediaShape::Document { mime } => MediaKind::from_mime(mime),
        MediaShape::Sticker => MediaKind::Sticker,
        MediaShape::Contact => MediaKind::Contact,
        MediaShape::Poll => MediaKind::Poll,
        MediaShape::Geo | MediaShape::GeoLive | MediaShape::Venue => MediaKind::Location,
        MediaShape::WebPage => MediaKind::WebPage,
        MediaShape::Other => MediaKind::Unknown,
    }
}

fn media_kind(media: &Media) -> MediaKind {
    kind_of(media_shape(media))
}

/// `MessageSource` backed by a logged-in grammers client.
pub struct TelegramSource {
    client: Client,
    resolved: Mutex<HashMap<i64, PackedChat>>,
}

impl TelegramSource {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Find the access handle for a channel: by @handle when one is known,
    /// otherwise by scanning the account's dialogs for the numeric id.
    async fn resolve(&self, channel: &Channel) -> Result<PackedChat> {
        if let Some(packed) = self.cached(channel.telegram_id) {
            return Ok(packed);
        }

        let mut chat = None;
        if let Some(username) = &channel.username {
            chat = self
                .client
                .resolve_username(username.trim_start_matches('@'))
                .await
                .map_err(telegram_err)?;
        }
        if chat.is_none() {
            chat = self.find_in_dialogs(channel.telegram_id).await?;
        }

        let packed = chat
            .ok_or(Error::ChannelNotFound(channel.telegram_id))?
            .pack();
        if let Ok(mut cache) = self.resolved.lock() {
            cache.insert(channel.telegram_id, packed);
        }
        Ok(packed)
    }

    fn cached(&self, telegram_id: i64) -> Option<PackedChat> {
        self.resolved.lock().ok()?.get(&telegram_id).copied()
    }

    async fn find_in_dialogs(&self, telegram_id: i64) -> Result<Option<Chat>> {
        let wanted = bare_channel_id(telegram_id).ok_or(Error::ChannelNotFound(telegram_id))?;
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(telegram_err)? {
            let chat = dialog.chat();
            if dialog_matches(matches!(chat, Chat::Channel(_)), chat.id(), wanted) {
                return Ok(Some(chat.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait(?Send)]
impl MessageSource for TelegramSource {
    async fn fetch_page(
        &self,
        channel: &Channel,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let packed = self.resolve(channel).await?;
        let mut iter = self.client.iter_messages(packed).limit(limit);
        if let Some(before) = before_id {
            let offset = i32::try_from(before)
                .map_err(|_| Error::Telegram(format!("message id {} out of range", before)))?;
            iter = iter.offset_id(offset);
        }

        let mut page = Vec::with_capacity(limit);
        while let Some(message) = iter.next().await.map_err(telegram_err)? {
            let text = message.text();
            page.push(RawMessage {
                message_id: message.id() as i64,
                published_at: message.date(),
                text: if text.is_empty() { None } else { Some(text.to_string()) },
                media: message.media().as_ref().map(media_kind),
            });
        }
        debug!("Fetched {} messages from {}", page.len(), channel.name);
        Ok(page)
    }
}
