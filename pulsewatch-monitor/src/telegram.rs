use async_trait::async_trait;
use pulsewatch::{
    error::MonitorError,
    notify::{NotificationOptions, NotificationSink},
};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

/// Telegram Bot API base.
const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Sink delivering notifications through the Telegram Bot API.
///
/// The notification destination is the target chat id.
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    token: String,
}

/// `sendMessage` request body.
#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_notification: bool,
}

impl<'a> SendMessage<'a> {
    fn new(chat_id: &'a str, text: &'a str, options: &NotificationOptions) -> Self {
        Self {
            chat_id,
            text,
            parse_mode: options.parse_html.then_some("HTML"),
            disable_notification: options.silent,
        }
    }
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
        }
    }

    pub fn from_env() -> Self {
        let token = std::env::var("PULSEWATCH_TELEGRAM_TOKEN").unwrap_or_else(|_| {
            warn!("PULSEWATCH_TELEGRAM_TOKEN not set, notification delivery will fail");
            String::new()
        });
        let mut notifier = Self::new(token);
        if let Ok(api_url) = std::env::var("PULSEWATCH_TELEGRAM_API_URL") {
            notifier.api_url = api_url;
        }
        notifier
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(
        &self,
        destination: &str,
        text: &str,
        options: &NotificationOptions,
    ) -> Result<(), MonitorError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let body = SendMessage::new(destination, text, options);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| MonitorError::Notification(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MonitorError::Notification(format!(
                "sendMessage returned {status}: {detail}"
            )));
        }

        debug!(destination, "notification delivered");
        Ok(())
    }
}
