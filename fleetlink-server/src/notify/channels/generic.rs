//! Generic webhook/email/chat handler: the catch-all match, covering any
//! `http://`/`https://` URL (Slack/Discord/Teams incoming webhooks, generic
//! JSON POST endpoints) the same way apprise-style URL schemes fan out to a
//! single HTTP POST.

use async_trait::async_trait;
use url::Url;

use crate::notify::NotificationHandler;

pub struct GenericUrlChannel {
    client: reqwest::Client,
}

impl GenericUrlChannel {
    pub fn new() -> Self {
        GenericUrlChannel {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GenericUrlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationHandler for GenericUrlChannel {
    fn matches(&self, url: &str) -> bool {
        Url::parse(url)
            .map(|u| u.scheme() == "http" || u.scheme() == "https")
            .unwrap_or(false)
    }

    async fn send(&self, url: &str, title: &str, message: &str) -> bool {
        let body = serde_json::json!({ "title": title, "text": message });
        match self.client.post(url).json(&body).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                log::warn!("generic webhook delivery to {url} failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_http_and_https_only() {
        let channel = GenericUrlChannel::new();
        assert!(channel.matches("https://hooks.example.com/x"));
        assert!(channel.matches("http://hooks.example.com/x"));
        assert!(!channel.matches("sip:1234@example.com"));
        assert!(!channel.matches("not a url"));
    }
}
