//! Notification dispatcher: per-channel-URL delivery, ordered handler
//! registry with first-match-wins dispatch.

pub mod channels;

use async_trait::async_trait;

/// One user-registered delivery target: a display name plus the URL that
/// decides which handler owns it.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    pub name: String,
    pub url: String,
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    fn matches(&self, url: &str) -> bool;
    async fn send(&self, url: &str, title: &str, message: &str) -> bool;
}

/// Ordered set of handlers; the first whose `matches` predicate returns
/// true is invoked. Unmatched URLs are logged and skipped rather than
/// treated as fatal — one bad channel must never block the rest.
pub struct NotificationDispatcher {
    handlers: Vec<Box<dyn NotificationHandler>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        NotificationDispatcher {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn NotificationHandler>) {
        self.handlers.push(handler);
    }

    pub fn builtin() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(channels::sip::SipChannel::new()));
        dispatcher.register(Box::new(channels::generic::GenericUrlChannel::new()));
        dispatcher
    }

    /// Delivers to every channel, filtering first by the alert's selected
    /// channels (if any), falling back to the device's configured channel
    /// list for this alert's config key, falling back to "all channels" if
    /// neither narrows it. Individual send failures are logged as warnings
    /// and never abort the remaining deliveries.
    pub async fn dispatch(
        &self,
        channels: &[NotificationChannel],
        title: &str,
        message: &str,
    ) {
        for channel in channels {
            let Some(handler) = self.handlers.iter().find(|h| h.matches(&channel.url)) else {
                log::warn!("no notification handler matches channel url {}", channel.url);
                continue;
            };
            if !handler.send(&channel.url, title, message).await {
                log::warn!(
                    "notification delivery failed for channel {} ({})",
                    channel.name,
                    channel.url
                );
            }
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Implements the channel-selection rule from the notification dispatcher
/// module: explicit `selected_channels` wins; else an alert-specific entry
/// in `alert_channels` (even empty, meaning deliver nothing) wins; else all
/// of the user's channels.
pub fn select_channels<'a>(
    metadata: &serde_json::Value,
    alert_channels_config: Option<&std::collections::HashMap<String, Vec<String>>>,
    user_channels: &'a [NotificationChannel],
) -> Vec<&'a NotificationChannel> {
    if let Some(selected) = metadata.get("selected_channels").and_then(|v| v.as_array()) {
        let names: Vec<&str> = selected.iter().filter_map(|v| v.as_str()).collect();
        return user_channels
            .iter()
            .filter(|c| names.contains(&c.name.as_str()))
            .collect();
    }

    if let Some(config_key) = metadata.get("config_key").and_then(|v| v.as_str()) {
        if let Some(map) = alert_channels_config {
            if let Some(names) = map.get(config_key) {
                return user_channels
                    .iter()
                    .filter(|c| names.contains(&c.name))
                    .collect();
            }
        }
    }

    user_channels.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> NotificationChannel {
        NotificationChannel {
            name: name.to_string(),
            url: format!("https://example.com/{name}"),
        }
    }

    #[test]
    fn selected_channels_takes_priority() {
        let channels = vec![channel("sms"), channel("email")];
        let metadata = serde_json::json!({ "selected_channels": ["sms"] });
        let picked = select_channels(&metadata, None, &channels);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "sms");
    }

    #[test]
    fn empty_config_key_list_means_deliver_nothing() {
        let channels = vec![channel("sms"), channel("email")];
        let metadata = serde_json::json!({ "config_key": "speed_tolerance" });
        let mut config = std::collections::HashMap::new();
        config.insert("speed_tolerance".to_string(), vec![]);
        let picked = select_channels(&metadata, Some(&config), &channels);
        assert!(picked.is_empty());
    }

    #[test]
    fn absent_config_key_falls_back_to_all_channels() {
        let channels = vec![channel("sms"), channel("email")];
        let metadata = serde_json::json!({ "config_key": "idle_timeout_minutes" });
        let config = std::collections::HashMap::new();
        let picked = select_channels(&metadata, Some(&config), &channels);
        assert_eq!(picked.len(), 2);
    }
}
