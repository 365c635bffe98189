use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use tokio::time::sleep;

use crate::classifier::Classifier;
use crate::config::CollectConfig;
use crate::database;
use crate::error::Result;
use crate::models::Channel;
use crate::telegram::MessageSource;

/// What one channel scan did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChannelOutcome {
    pub stored: usize,
    pub skipped_without_text: usize,
    pub failed: usize,
    /// New watermark, `None` when the scan was not clean and the watermark stayed put.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectSummary {
    pub channels: usize,
    pub channels_failed: usize,
    pub stored: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AnalysisSummary {
    pub analyzed: usize,
    pub failed: usize,
}

/// Pull everything published after the channel's watermark and upsert it.
///
/// Pages are read newest first until a message at or before the watermark shows
/// up, the source runs dry, or `max_pages` is reached. Without a watermark the
/// cutoff is `now - first_run_window`. The watermark only advances when every
/// page was fetched and every message stored; it then moves to the newest stored
/// publication time (never below the cutoff). A fetch error aborts the scan and
/// is returned with the watermark untouched, so the next run re-reads the window.
pub async fn collect_channel<S: MessageSource + ?Sized>(
    source: &S,
    conn: &Connection,
    channel: &Channel,
    config: &CollectConfig,
    now: DateTime<Utc>,
) -> Result<ChannelOutcome> {
    let cutoff = channel
        .last_processed_at
        .unwrap_or(now - config.first_run_window);
    let mut outcome = ChannelOutcome::default();
    let mut newest: Option<DateTime<Utc>> = None;
    let mut before_id = None;

    'pages: for page_no in 0..config.max_pages {
        if page_no > 0 {
            sleep(config.page_delay).await;
        }
        let page = source.fetch_page(channel, before_id, config.page_size).await?;

        for raw in &page {
            if raw.published_at <= cutoff {
                debug!("Reached watermark in {} at message {}", channel.name, raw.message_id);
                break 'pages;
            }
            if !raw.has_text() {
                outcome.skipped_without_text += 1;
                continue;
            }
            match database::upsert_message(conn, channel.id, raw) {
                Ok(()) => {
                    outcome.stored += 1;
                    newest = newest.max(Some(raw.published_at));
                }
                Err(e) => {
                    outcome.failed += 1;
                    error!("Error saving message {} from {}: {}", raw.message_id, channel.name, e);
                }
            }
        }

        if page.len() < config.page_size {
            break;
        }
        before_id = page.iter().map(|m| m.message_id).min();
    }

    if outcome.failed == 0 {
        let watermark = newest.map_or(cutoff, |n| n.max(cutoff));
        database::advance_watermark(conn, channel.id, watermark)?;
        outcome.watermark = Some(watermark);
    } else {
        warn!(
            "{} messages from {} failed to save; watermark left unchanged",
            outcome.failed, channel.name
        );
    }
    Ok(outcome)
}

/// The "collect" batch: scan every active channel in turn.
pub async fn run_collection<S: MessageSource + ?Sized>(
    source: &S,
    conn: &Connection,
    config: &CollectConfig,
) -> Result<CollectSummary> {
    let channels = database::active_channels(conn)?;
    let mut summary = CollectSummary::default();
    if channels.is_empty() {
        warn!("No active channels found. Register one with `add-channel`.");
        return Ok(summary);
    }

    for (i, channel) in channels.iter().enumerate() {
        if i > 0 {
            sleep(config.channel_delay).await;
        }
        info!(
            "Fetching messages from channel {} ({})",
            channel.name,
            channel
                .username
                .clone()
                .unwrap_or_else(|| channel.telegram_id.to_string())
        );
        summary.channels += 1;
        match collect_channel(source, conn, channel, config, Utc::now()).await {
            Ok(outcome) => {
                info!(
                    "Collected {} new messages from {} ({} without text skipped, watermark {})",
                    outcome.stored,
                    channel.name,
                    outcome.skipped_without_text,
                    outcome
                        .watermark
                        .map_or("unchanged".to_string(), |w| w.to_rfc3339())
                );
                summary.stored += outcome.stored;
            }
            Err(e) => {
                summary.channels_failed += 1;
                error!("Error collecting from channel {}: {}", channel.name, e);
            }
        }
    }
    Ok(summary)
}

/// The "analyze" batch: annotate up to `batch_size` messages that have no sentiment yet.
///
/// A message whose analysis cannot be saved keeps its empty fields and is picked
/// up again by the next run.
pub fn run_analysis(conn: &Connection, classifier: &Classifier, batch_size: usize) -> Result<AnalysisSummary> {
    let pending = database::unanalyzed_messages(conn, batch_size)?;
    let mut summary = AnalysisSummary::default();
    if pending.is_empty() {
        info!("No new messages to analyze.");
        return Ok(summary);
    }
    info!(
        "Analyzing {} messages ({})",
        pending.len(),
        if classifier.detector().is_trained() { "trained risk model" } else { "keyword risk fallback" }
    );

    for msg in &pending {
        let analysis = classifier.analyze(msg.text.as_deref());
        match database::save_analysis(conn, msg.id, &analysis) {
            Ok(()) => {
                summary.analyzed += 1;
                debug!(
                    "Message {} analyzed: risk={}, sentiment={}",
                    msg.id, analysis.is_risk, analysis.sentiment
                );
            }
            Err(e) => {
                summary.failed += 1;
                error!("Error analyzing message {}: {}", msg.id, e);
            }
        }
    }
    info!("Analysis complete: {} analyzed, {} failed.", summary.analyzed, summary.failed);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{RiskDetector, TRAINING_SAMPLE};
    use crate::database::tests::{test_channel, test_db};
    use crate::database::MessageFilter;
    use crate::error::Error;
    use crate::models::{MediaKind, RawMessage, Sentiment};
    use async_trait::async_trait;
    use chrono::Duration as Span;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::time::Duration;

    /// In-memory history keyed by telegram id, newest first.
    #[derive(Default)]
    struct FakeSource {
        history: HashMap<i64, Vec<RawMessage>>,
        fail_channel: Option<i64>,
        fail_on_call: Option<usize>,
        calls: Cell<usize>,
    }

    #[async_trait(?Send)]
    impl MessageSource for FakeSource {
        async fn fetch_page(
            &self,
            channel: &Channel,
            before_id: Option<i64>,
            limit: usize,
        ) -> Result<Vec<RawMessage>> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if self.fail_channel == Some(channel.telegram_id) || self.fail_on_call == Some(call) {
                return Err(Error::Telegram("FLOOD_WAIT_30".into()));
            }
            Ok(self
                .history
                .get(&channel.telegram_id)
                .map(|msgs| {
                    msgs.iter()
                        .filter(|m| before_id.map_or(true, |b| m.message_id < b))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn now_secs() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0).unwrap()
    }

    fn text_msg(message_id: i64, published_at: DateTime<Utc>) -> RawMessage {
        RawMessage {
            message_id,
            published_at,
            text: Some(format!("mensagem {}", message_id)),
            media: None,
        }
    }

    fn quick_config() -> CollectConfig {
        CollectConfig {
            page_delay: Duration::ZERO,
            channel_delay: Duration::ZERO,
            ..CollectConfig::default()
        }
    }

    fn channel(conn: &Connection, id: i64) -> Channel {
        database::get_channel(conn, id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_run_only_keeps_last_thirty_days() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let source = FakeSource {
            history: HashMap::from([(
                555,
                vec![
                    text_msg(3, now - Span::days(5)),
                    text_msg(2, now - Span::days(20)),
                    text_msg(1, now - Span::days(40)),
                ],
            )]),
            ..Default::default()
        };

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 2);
        assert!(database::get_message(&conn, id, 3).unwrap().is_some());
        assert!(database::get_message(&conn, id, 2).unwrap().is_some());
        assert!(database::get_message(&conn, id, 1).unwrap().is_none());
        assert_eq!(outcome.watermark, Some(now - Span::days(5)));
        assert_eq!(channel(&conn, id).last_processed_at, Some(now - Span::days(5)));
    }

    #[tokio::test]
    async fn scan_stops_at_watermark() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let watermark = now - Span::days(2);
        database::advance_watermark(&conn, id, watermark).unwrap();
        let source = FakeSource {
            history: HashMap::from([(
                555,
                vec![
                    text_msg(12, now - Span::hours(1)),
                    text_msg(11, watermark),
                    text_msg(10, now - Span::days(1)),
                ],
            )]),
            ..Default::default()
        };

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();

        // The first message at the watermark ends the scan, even if later ones look newer.
        assert_eq!(outcome.stored, 1);
        assert!(database::get_message(&conn, id, 10).unwrap().is_none());
        assert_eq!(channel(&conn, id).last_processed_at, Some(now - Span::hours(1)));
    }

    #[tokio::test]
    async fn messages_without_text_are_dropped() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let photo = RawMessage {
            message_id: 2,
            published_at: now - Span::hours(2),
            text: None,
            media: Some(MediaKind::Photo),
        };
        let mut captioned = text_msg(1, now - Span::hours(3));
        captioned.media = Some(MediaKind::Video);
        let source = FakeSource {
            history: HashMap::from([(555, vec![photo, captioned])]),
            ..Default::default()
        };

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.skipped_without_text, 1);
        let stored = database::get_message(&conn, id, 1).unwrap().unwrap();
        assert_eq!(stored.media, Some(MediaKind::Video));
        assert_eq!(stored.sentiment, None);
    }

    #[tokio::test]
    async fn page_limit_bounds_the_scan() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let history = (1..=10).rev().map(|i| text_msg(i, now - Span::minutes(100 - i))).collect();
        let source = FakeSource {
            history: HashMap::from([(555, history)]),
            ..Default::default()
        };
        let config = CollectConfig {
            page_size: 2,
            max_pages: 2,
            ..quick_config()
        };

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &config, now)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 4);
        assert_eq!(source.calls.get(), 2);
        for kept in [10, 9, 8, 7] {
            assert!(database::get_message(&conn, id, kept).unwrap().is_some());
        }
        assert!(database::get_message(&conn, id, 6).unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_error_leaves_watermark_alone() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let history = (1..=4).rev().map(|i| text_msg(i, now - Span::minutes(10 - i))).collect();
        let source = FakeSource {
            history: HashMap::from([(555, history)]),
            fail_on_call: Some(2),
            ..Default::default()
        };
        let config = CollectConfig {
            page_size: 2,
            ..quick_config()
        };

        let result = collect_channel(&source, &conn, &channel(&conn, id), &config, now).await;

        assert!(matches!(result, Err(Error::Telegram(_))));
        assert!(database::get_message(&conn, id, 4).unwrap().is_some());
        assert_eq!(channel(&conn, id).last_processed_at, None);
    }

    #[tokio::test]
    async fn upsert_failure_keeps_watermark() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        conn.execute_batch(
            "CREATE TRIGGER reject_two BEFORE INSERT ON messages
             WHEN NEW.message_id = 2
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
        let source = FakeSource {
            history: HashMap::from([(
                555,
                vec![
                    text_msg(3, now - Span::hours(1)),
                    text_msg(2, now - Span::hours(2)),
                    text_msg(1, now - Span::hours(3)),
                ],
            )]),
            ..Default::default()
        };

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.watermark, None);
        assert!(database::get_message(&conn, id, 2).unwrap().is_none());
        assert_eq!(channel(&conn, id).last_processed_at, None);
    }

    #[tokio::test]
    async fn watermark_is_monotonic_across_runs() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let source = FakeSource {
            history: HashMap::from([(555, vec![text_msg(1, now - Span::days(1))])]),
            ..Default::default()
        };

        collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();
        let first = channel(&conn, id).last_processed_at.unwrap();

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now + Span::days(1))
            .await
            .unwrap();
        let second = channel(&conn, id).last_processed_at.unwrap();

        assert_eq!(outcome.stored, 0);
        assert!(second >= first);
    }

    #[tokio::test]
    async fn empty_channel_records_the_cutoff() {
        let conn = test_db();
        let id = test_channel(&conn, "silencioso", 777);
        let now = now_secs();
        let source = FakeSource::default();

        let outcome = collect_channel(&source, &conn, &channel(&conn, id), &quick_config(), now)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 0);
        assert_eq!(channel(&conn, id).last_processed_at, Some(now - Span::days(30)));
    }

    #[tokio::test]
    async fn collection_skips_inactive_and_survives_failing_channel() {
        let conn = test_db();
        let now = now_secs();
        let ok = test_channel(&conn, "a-ok", 1);
        let broken = test_channel(&conn, "b-broken", 2);
        let paused = test_channel(&conn, "c-paused", 3);
        database::set_channel_active(&conn, paused, false).unwrap();
        let source = FakeSource {
            history: HashMap::from([
                (1, vec![text_msg(1, now - Span::hours(1))]),
                (3, vec![text_msg(1, now - Span::hours(1))]),
            ]),
            fail_channel: Some(2),
            ..Default::default()
        };

        let summary = run_collection(&source, &conn, &quick_config()).await.unwrap();

        assert_eq!(
            summary,
            CollectSummary {
                channels: 2,
                channels_failed: 1,
                stored: 1,
            }
        );
        assert!(channel(&conn, ok).last_processed_at.is_some());
        assert!(channel(&conn, broken).last_processed_at.is_none());
        assert!(database::get_message(&conn, paused, 1).unwrap().is_none());
    }

    #[test]
    fn analysis_fills_every_pending_message_once() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        let texts = [
            "Novo ataque anunciado no centro",
            "Ótimo dia, parabéns equipe",
            "Reunião marcada para amanhã",
        ];
        for (i, text) in texts.iter().enumerate() {
            let raw = RawMessage {
                message_id: i as i64 + 1,
                published_at: now - Span::minutes(i as i64),
                text: Some(text.to_string()),
                media: None,
            };
            database::upsert_message(&conn, id, &raw).unwrap();
        }
        let classifier = Classifier::new(RiskDetector::train(TRAINING_SAMPLE));

        let summary = run_analysis(&conn, &classifier, 100).unwrap();
        assert_eq!(summary, AnalysisSummary { analyzed: 3, failed: 0 });

        let attack = database::get_message(&conn, id, 1).unwrap().unwrap();
        assert_eq!(attack.keywords, Some(vec!["ataque".to_string()]));
        let cheerful = database::get_message(&conn, id, 2).unwrap().unwrap();
        assert_eq!(cheerful.sentiment, Some(Sentiment::Positive));
        assert_eq!(cheerful.keywords, None);

        let again = run_analysis(&conn, &classifier, 100).unwrap();
        assert_eq!(again.analyzed, 0);

        // Re-collecting an analyzed message does not reset its sentiment.
        database::upsert_message(&conn, id, &text_msg(2, now)).unwrap();
        let recollected = database::get_message(&conn, id, 2).unwrap().unwrap();
        assert_eq!(recollected.sentiment, Some(Sentiment::Positive));
    }

    #[test]
    fn analysis_respects_batch_size() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        let now = now_secs();
        for i in 0..5 {
            database::upsert_message(&conn, id, &text_msg(i, now - Span::minutes(i))).unwrap();
        }
        let classifier = Classifier::new(RiskDetector::keyword_fallback());

        assert_eq!(run_analysis(&conn, &classifier, 2).unwrap().analyzed, 2);
        assert_eq!(run_analysis(&conn, &classifier, 2).unwrap().analyzed, 2);
        assert_eq!(run_analysis(&conn, &classifier, 2).unwrap().analyzed, 1);

        let neutral = MessageFilter {
            sentiment: Some(Sentiment::Neutral),
            ..Default::default()
        };
        assert_eq!(database::count_messages(&conn, &neutral).unwrap(), 5);
    }

    #[test]
    fn failed_analysis_is_retried_next_run() {
        let conn = test_db();
        let id = test_channel(&conn, "observado", 555);
        database::upsert_message(&conn, id, &text_msg(1, now_secs())).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_analysis BEFORE UPDATE OF sentiment ON messages
             BEGIN SELECT RAISE(ABORT, 'locked'); END;",
        )
        .unwrap();
        let classifier = Classifier::new(RiskDetector::keyword_fallback());

        let summary = run_analysis(&conn, &classifier, 100).unwrap();
        assert_eq!(summary, AnalysisSummary { analyzed: 0, failed: 1 });
        assert_eq!(database::get_message(&conn, id, 1).unwrap().unwrap().sentiment, None);

        conn.execute_batch("DROP TRIGGER reject_analysis;").unwrap();
        let retry = run_analysis(&conn, &classifier, 100).unwrap();
        assert_eq!(retry, AnalysisSummary { analyzed: 1, failed: 0 });
        assert!(database::get_message(&conn, id, 1).unwrap().unwrap().sentiment.is_some());
    }
}
