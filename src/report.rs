use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::collections::HashMap;

use crate::database::{self, MessageFilter};
use crate::error::Result;
use crate::models::{Message, Sentiment};
use crate::text::normalize;

/// Window the dashboard counts cover.
const RECENT_DAYS: i64 = 7;
const LATEST_RISK_COUNT: usize = 5;
const TOP_TERMS_COUNT: usize = 20;
const SNIPPET_CHARS: usize = 120;
const WRAP_WIDTH: usize = 76;

/// Aggregated numbers shown by `report`.
#[derive(Debug)]
pub struct Dashboard {
    pub total_channels: usize,
    pub total_messages: usize,
    pub recent_risk: usize,
    pub recent_neutral: usize,
    pub latest_risk: Vec<(Message, String)>,
    pub top_terms: Vec<(String, usize)>,
}

pub fn dashboard(conn: &Connection, now: DateTime<Utc>) -> Result<Dashboard> {
    let since = now - Duration::days(RECENT_DAYS);
    let recent_risk = MessageFilter {
        is_risk: Some(true),
        since: Some(since),
        ..Default::default()
    };
    let recent_neutral = MessageFilter {
        sentiment: Some(Sentiment::Neutral),
        since: Some(since),
        ..Default::default()
    };
    let any_risk = MessageFilter {
        is_risk: Some(true),
        ..Default::default()
    };

    let mut latest_risk = database::list_messages(conn, &any_risk, 1)?.items;
    latest_risk.truncate(LATEST_RISK_COUNT);

    Ok(Dashboard {
        total_channels: database::count_channels(conn)?,
        total_messages: database::count_messages(conn, &MessageFilter::default())?,
        recent_risk: database::count_messages(conn, &recent_risk)?,
        recent_neutral: database::count_messages(conn, &recent_neutral)?,
        latest_risk,
        top_terms: top_terms(&database::texts_since(conn, since)?, TOP_TERMS_COUNT),
    })
}

/// Most frequent normalized terms longer than three characters, most common first.
pub fn top_terms(texts: &[String], limit: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for token in normalize(Some(text)) {
            if token.chars().count() > 3 {
                *counts.entry(token).or_default() += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

pub fn print_dashboard(conn: &Connection) -> Result<()> {
    let board = dashboard(conn, Utc::now())?;
    println!("=== Telegram Observatory ===");
    println!(" - Channels monitored: {}", board.total_channels);
    println!(" - Messages collected: {}", board.total_messages);
    println!(" - Risky messages (last {} days): {}", RECENT_DAYS, board.recent_risk);
    println!(" - Neutral messages (last {} days): {}", RECENT_DAYS, board.recent_neutral);

    println!("\nLatest risky messages:");
    if board.latest_risk.is_empty() {
        println!("   (none)");
    }
    for (msg, channel_name) in &board.latest_risk {
        print_message(msg, channel_name);
    }

    println!("\nMost frequent terms (last {} days):", RECENT_DAYS);
    if board.top_terms.is_empty() {
        println!("   (none)");
    }
    for (term, count) in &board.top_terms {
        println!("   {:<24} {}", term, count);
    }
    Ok(())
}

pub fn print_channels(conn: &Connection) -> Result<()> {
    println!("=== Monitored Channels ===");
    for channel in database::list_channels(conn)? {
        println!(
            "\n[{}] {}{}",
            channel.id,
            channel.name,
            if channel.active { "" } else { " (paused)" }
        );
        println!(" - Handle: {}", channel.username.as_deref().map_or("-".into(), |u| format!("@{}", u)));
        println!(" - Telegram ID: {}", channel.telegram_id);
        if let Some(link) = &channel.invite_link {
            println!(" - Invite link: {}", link);
        }
        println!(" - Added: {}", format_time(channel.created_at));
        println!(
            " - Last processed: {}",
            channel.last_processed_at.map_or("never".into(), format_time)
        );
    }
    Ok(())
}

pub fn print_messages(conn: &Connection, filter: &MessageFilter, page: usize) -> Result<()> {
    let page = database::list_messages(conn, filter, page)?;
    println!(
        "=== Messages (page {} of {}, {} total) ===",
        page.number, page.total_pages, page.total
    );
    for (msg, channel_name) in &page.items {
        print_message(msg, channel_name);
    }
    Ok(())
}

fn print_message(msg: &Message, channel_name: &str) {
    let mut tags = Vec::new();
    if msg.is_risk {
        tags.push("RISK".to_string());
    }
    tags.push(msg.sentiment.map_or("pending".into(), |s| s.to_string()));
    if let Some(media) = msg.media {
        tags.push(media.to_string());
    }
    println!(
        "\n * [{} @ {}] #{} {}",
        channel_name,
        format_time(msg.published_at),
        msg.message_id,
        tags.join(", ")
    );
    if let Some(keywords) = &msg.keywords {
        println!("   keywords: {}", keywords.join(", "));
    }
    let text = snippet(msg.text.as_deref().unwrap_or(""), SNIPPET_CHARS);
    for line in textwrap::wrap(&text, WRAP_WIDTH) {
        println!("   {}", line);
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// First `max` characters of `text`, with an ellipsis when cut.
fn snippet(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{}…", cut.trim_end())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{test_channel, test_db};
    use crate::models::{Analysis, RawMessage};

    #[test]
    fn top_terms_count_normalized_tokens() {
        let texts = vec![
            "Ataque no centro, ataque confirmado".to_string(),
            "Novo ataque https://t.me/x #urgente".to_string(),
            "dia bom".to_string(),
        ];
        let terms = top_terms(&texts, 2);
        assert_eq!(terms, vec![("ataque".to_string(), 3), ("centro".to_string(), 1)]);
    }

    #[test]
    fn snippet_cuts_on_characters() {
        assert_eq!(snippet("ação rápida", 4), "ação…");
        assert_eq!(snippet("curto", 10), "curto");
        assert_eq!(snippet("linha\nnova", 20), "linha nova");
    }

    #[test]
    fn dashboard_counts_recent_activity() {
        let conn = test_db();
        let channel = test_channel(&conn, "observado", 1);
        test_channel(&conn, "outro", 2);
        let now = Utc::now();
        let rows = [
            (1, "ataque recente", now - Duration::days(1), true, Sentiment::Neutral),
            (2, "ataque antigo", now - Duration::days(10), true, Sentiment::Neutral),
            (3, "dia excelente", now - Duration::days(2), false, Sentiment::Positive),
        ];
        for (id, text, published_at, is_risk, sentiment) in rows {
            database::upsert_message(
                &conn,
                channel,
                &RawMessage {
                    message_id: id,
                    published_at,
                    text: Some(text.into()),
                    media: None,
                },
            )
            .unwrap();
            let stored = database::get_message(&conn, channel, id).unwrap().unwrap();
            database::save_analysis(
                &conn,
                stored.id,
                &Analysis {
                    is_risk,
                    sentiment,
                    keywords: None,
                },
            )
            .unwrap();
        }

        let board = dashboard(&conn, now).unwrap();
        assert_eq!(board.total_channels, 2);
        assert_eq!(board.total_messages, 3);
        assert_eq!(board.recent_risk, 1);
        assert_eq!(board.recent_neutral, 1);
        assert_eq!(board.latest_risk.len(), 2);
        assert_eq!(board.latest_risk[0].0.message_id, 1);
        assert_eq!(board.top_terms[0], ("ataque".to_string(), 1));
    }
}
