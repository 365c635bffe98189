use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{Analysis, Channel, MediaKind, Message, NewChannel, RawMessage, Sentiment};

/// Messages shown per page by `list_messages`.
pub const PAGE_SIZE: usize = 20;

const CHANNEL_COLUMNS: &str =
    "id, name, telegram_id, username, invite_link, active, created_at, last_processed_at";
const MESSAGE_COLUMNS: &str =
    "id, channel_id, message_id, published_at, text, media, is_risk, sentiment, keywords";

/// Open (or create) the SQLite database and make sure the schema exists.
pub fn init_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

         CREATE TABLE IF NOT EXISTS channels (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            name              TEXT NOT NULL UNIQUE,
            telegram_id       INTEGER NOT NULL UNIQUE,
            username          TEXT UNIQUE,
            invite_link       TEXT,
            active            BOOLEAN NOT NULL DEFAULT 1,
            created_at        INTEGER NOT NULL,
            last_processed_at INTEGER
         );

         CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id   INTEGER NOT NULL,
            message_id   INTEGER NOT NULL,
            published_at INTEGER NOT NULL,
            text         TEXT,
            media        TEXT,
            is_risk      BOOLEAN NOT NULL DEFAULT 0,
            sentiment    TEXT CHECK (sentiment IN ('positive', 'neutral', 'negative')),
            keywords     TEXT,
            UNIQUE(channel_id, message_id),
            FOREIGN KEY(channel_id) REFERENCES channels(id) ON DELETE CASCADE
         );

         CREATE INDEX IF NOT EXISTS idx_messages_published ON messages(published_at);
         CREATE INDEX IF NOT EXISTS idx_messages_unanalyzed ON messages(sentiment) WHERE sentiment IS NULL;",
    )?;
    Ok(())
}

// -- Channels --

/// Register a channel for monitoring. Returns the new row id.
pub fn add_channel(conn: &Connection, channel: &NewChannel) -> Result<i64> {
    conn.execute(
        "INSERT INTO channels (name, telegram_id, username, invite_link, active, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5);",
        params![
            channel.name,
            channel.telegram_id,
            channel.username,
            channel.invite_link,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_channel_active(conn: &Connection, channel_id: i64, active: bool) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE channels SET active = ?1 WHERE id = ?2;",
        params![active, channel_id],
    )?;
    Ok(changed > 0)
}

pub fn get_channel(conn: &Connection, channel_id: i64) -> Result<Option<Channel>> {
    let channel = conn
        .query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1;", CHANNEL_COLUMNS),
            [channel_id],
            channel_from_row,
        )
        .optional()?;
    Ok(channel)
}

/// All channels ordered by name.
pub fn list_channels(conn: &Connection) -> Result<Vec<Channel>> {
    query_channels(conn, "")
}

/// Channels with monitoring switched on, ordered by name.
pub fn active_channels(conn: &Connection) -> Result<Vec<Channel>> {
    query_channels(conn, "WHERE active = 1")
}

fn query_channels(conn: &Connection, filter: &str) -> Result<Vec<Channel>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM channels {} ORDER BY name COLLATE NOCASE;",
        CHANNEL_COLUMNS, filter
    ))?;
    let rows = stmt.query_map([], channel_from_row)?;
    let mut channels = Vec::new();
    for channel in rows {
        channels.push(channel?);
    }
    Ok(channels)
}

/// Move a channel's watermark forward. A value older than the stored one is ignored.
pub fn advance_watermark(conn: &Connection, channel_id: i64, watermark: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE channels
         SET last_processed_at = MAX(COALESCE(last_processed_at, ?1), ?1)
         WHERE id = ?2;",
        params![watermark.timestamp(), channel_id],
    )?;
    Ok(())
}

// -- Messages --

/// Insert a fetched message or overwrite the mutable fields of the stored copy.
/// Analysis fields are left alone on overwrite.
pub fn upsert_message(conn: &Connection, channel_id: i64, msg: &RawMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (channel_id, message_id, published_at, text, media)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(channel_id, message_id) DO UPDATE SET
            published_at = excluded.published_at,
            text = excluded.text,
            media = excluded.media;",
        params![
            channel_id,
            msg.message_id,
            msg.published_at.timestamp(),
            msg.text,
            msg.media.map(|m| m.as_str()),
        ],
    )?;
    Ok(())
}

pub fn get_message(conn: &Connection, channel_id: i64, message_id: i64) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {} FROM messages WHERE channel_id = ?1 AND message_id = ?2;",
                MESSAGE_COLUMNS
            ),
            params![channel_id, message_id],
            message_from_row,
        )
        .optional()?;
    Ok(message)
}

/// Messages that have not been through an analysis pass yet, oldest first.
pub fn unanalyzed_messages(conn: &Connection, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE sentiment IS NULL ORDER BY published_at ASC, id ASC LIMIT ?1;",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt.query_map([limit as i64], message_from_row)?;
    let mut messages = Vec::new();
    for msg in rows {
        messages.push(msg?);
    }
    Ok(messages)
}

/// Write all three analysis fields of a message in one statement.
pub fn save_analysis(conn: &Connection, id: i64, analysis: &Analysis) -> Result<()> {
    let keywords = analysis
        .keywords
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "UPDATE messages SET is_risk = ?1, sentiment = ?2, keywords = ?3 WHERE id = ?4;",
        params![analysis.is_risk, analysis.sentiment.as_str(), keywords, id],
    )?;
    Ok(())
}

// -- Reporting --

/// Filters for `list_messages`. `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub channel_id: Option<i64>,
    pub is_risk: Option<bool>,
    pub sentiment: Option<Sentiment>,
    pub since: Option<DateTime<Utc>>,
}

/// One page of a message listing.
#[derive(Debug)]
pub struct Page {
    pub items: Vec<(Message, String)>,
    pub number: usize,
    pub total_pages: usize,
    pub total: usize,
}

pub fn count_channels(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM channels;", [], |row| row.get(0))?;
    Ok(n as usize)
}

pub fn count_messages(conn: &Connection, filter: &MessageFilter) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE (?1 IS NULL OR channel_id = ?1)
           AND (?2 IS NULL OR is_risk = ?2)
           AND (?3 IS NULL OR sentiment = ?3)
           AND (?4 IS NULL OR published_at >= ?4);",
        filter_params(filter),
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

/// Newest-first listing, paginated `PAGE_SIZE` at a time. Out-of-range page
/// numbers are clamped to the nearest valid page.
pub fn list_messages(conn: &Connection, filter: &MessageFilter, page: usize) -> Result<Page> {
    let total = count_messages(conn, filter)?;
    let total_pages = total.div_ceil(PAGE_SIZE).max(1);
    let number = page.clamp(1, total_pages);
    let offset = (number - 1) * PAGE_SIZE;

    let (channel_id, is_risk, sentiment, since) = filter_params(filter);
    let mut stmt = conn.prepare(
        "SELECT m.id, m.channel_id, m.message_id, m.published_at, m.text, m.media,
                m.is_risk, m.sentiment, m.keywords, c.name
         FROM messages m
         JOIN channels c ON c.id = m.channel_id
         WHERE (?1 IS NULL OR m.channel_id = ?1)
           AND (?2 IS NULL OR m.is_risk = ?2)
           AND (?3 IS NULL OR m.sentiment = ?3)
           AND (?4 IS NULL OR m.published_at >= ?4)
         ORDER BY m.published_at DESC, m.id DESC
         LIMIT ?5 OFFSET ?6;",
    )?;
    let rows = stmt.query_map(
        params![channel_id, is_risk, sentiment, since, PAGE_SIZE as i64, offset as i64],
        |row| Ok((message_from_row(row)?, row.get::<_, String>(9)?)),
    )?;
    let mut items = Vec::new();
    for item in rows {
        items.push(item?);
    }
    Ok(Page {
        items,
        number,
        total_pages,
        total,
    })
}

/// Text of every message published since `since`.
pub fn texts_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT text FROM messages WHERE published_at >= ?1 AND text IS NOT NULL;",
    )?;
    let rows = stmt.query_map([since.timestamp()], |row| row.get::<_, String>(0))?;
    let mut texts = Vec::new();
    for text in rows {
        texts.push(text?);
    }
    Ok(texts)
}

fn filter_params(filter: &MessageFilter) -> (Option<i64>, Option<bool>, Option<&'static str>, Option<i64>) {
    (
        filter.channel_id,
        filter.is_risk,
        filter.sentiment.map(|s| s.as_str()),
        filter.since.map(|t| t.timestamp()),
    )
}

// -- Row mapping --

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ts: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, format!("invalid timestamp {}", ts).into())
    })
}

fn optional_timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn channel_from_row(row: &Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        telegram_id: row.get(2)?,
        username: row.get(3)?,
        invite_link: row.get(4)?,
        active: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
        last_processed_at: optional_timestamp_at(row, 7)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let sentiment = match row.get::<_, Option<String>>(7)? {
        Some(s) => Some(
            s.parse::<Sentiment>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, e.into()))?,
        ),
        None => None,
    };
    let keywords = match row.get::<_, Option<String>>(8)? {
        Some(json) => Some(
            serde_json::from_str::<Vec<String>>(&json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        message_id: row.get(2)?,
        published_at: timestamp_at(row, 3)?,
        text: row.get(4)?,
        media: row.get::<_, Option<String>>(5)?.map(|m| MediaKind::parse(&m)),
        is_risk: row.get(6)?,
        sentiment,
        keywords,
    })
}
