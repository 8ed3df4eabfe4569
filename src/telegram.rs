use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::TELEGRAM_API_BASE;
use crate::config::TelegramConfig;
use crate::sink::{AnomalySink, SinkError};
use crate::types::{Anomaly, AnomalyKind};

/// Grouped messages above this many alerts in one batch.
const BATCH_COLLAPSE_THRESHOLD: usize = 3;

/// Pushes anomaly alerts to a Telegram chat via the Bot API.
///
/// Only anomalies at or above the configured minimum severity are sent;
/// a batch with more than three eligible alerts collapses into a single
/// grouped message to avoid flooding the chat.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self::with_api_base(config, TELEGRAM_API_BASE)
    }

    pub fn with_api_base(config: TelegramConfig, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            config,
        }
    }

    async fn send_message(&self, text: &str) -> Result<(), SinkError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base, self.config.bot_token
        );
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Transport(format!(
                "telegram api returned {status}"
            )));
        }
        debug!("Telegram alert delivered to chat {}", self.config.chat_id);
        Ok(())
    }
}

#[async_trait]
impl AnomalySink for TelegramNotifier {
    async fn append(&self, batch: &[Anomaly]) -> Result<(), SinkError> {
        let alerts: Vec<&Anomaly> = batch
            .iter()
            .filter(|a| a.severity >= self.config.min_severity)
            .collect();
        if alerts.is_empty() {
            return Ok(());
        }

        if alerts.len() > BATCH_COLLAPSE_THRESHOLD {
            info!("Sending grouped Telegram alert ({} anomalies)", alerts.len());
            self.send_message(&format_batch(&alerts)).await
        } else {
            for alert in alerts {
                self.send_message(&format_alert(alert)).await?;
            }
            Ok(())
        }
    }
}

fn kind_label(kind: AnomalyKind) -> &'static str {
    match kind {
        AnomalyKind::SharpDrop => "Sharp drop",
        AnomalyKind::SharpRise => "Sharp rise",
        AnomalyKind::ValueBet => "Value bet",
        AnomalyKind::UnbalancedFlow => "Unbalanced flow",
        AnomalyKind::TotalOverSpike => "Total over spike",
        AnomalyKind::LateGameSpike => "Late game spike",
        AnomalyKind::CorridorBreach => "Corridor breach",
        AnomalyKind::LimitCut => "Limit cut",
    }
}

fn format_alert(anomaly: &Anomaly) -> String {
    let change = anomaly
        .change_percent
        .map(|pct| format!(" ({pct:+.2}%)"))
        .unwrap_or_default();
    format!(
        "<b>{kind}</b> [{severity:?}]\n\
         {event}\n\
         {league}\n\
         Market {market}: {before:.2} → {after:.2}{change}",
        kind = kind_label(anomaly.kind),
        severity = anomaly.severity,
        event = anomaly.entity.event_name,
        league = anomaly.entity.league,
        market = anomaly.market_label,
        before = anomaly.before,
        after = anomaly.after,
    )
}

fn format_batch(alerts: &[&Anomaly]) -> String {
    let mut message = format!("<b>{} anomalies detected</b>\n", alerts.len());
    for anomaly in alerts {
        let change = anomaly
            .change_percent
            .map(|pct| format!(" {pct:+.1}%"))
            .unwrap_or_default();
        message.push_str(&format!(
            "\n{} — {} ({}){}",
            kind_label(anomaly.kind),
            anomaly.entity.event_name,
            anomaly.market_label,
            change,
        ));
    }
    message
}
