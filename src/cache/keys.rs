//! Key and channel naming for one cache namespace.

use crate::config::CacheConfig;

/// Payload published on invalidation channels. Receivers only read the channel.
pub const INVALIDATE_PAYLOAD: &str = "invalidate";

/// Derives store keys and channel names from a [`CacheConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    key_prefix: String,
    order_key: String,
    invalidation_prefix: String,
}

impl CacheKeys {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            order_key: config.order_key.clone(),
            invalidation_prefix: config.invalidation_prefix.clone(),
        }
    }

    /// `<prefix><id>`
    pub fn payload_key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn order_key(&self) -> &str {
        &self.order_key
    }

    /// `<invalidation-prefix><id>`
    pub fn channel(&self, id: &str) -> String {
        format!("{}{}", self.invalidation_prefix, id)
    }

    /// Pattern matching every invalidation channel of this namespace.
    pub fn channel_pattern(&self) -> String {
        format!("{}*", self.invalidation_prefix)
    }

    /// Recovers the identifier from a channel name.
    pub fn id_from_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.invalidation_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    /// True when `id` would map onto the order index key itself.
    pub fn collides_with_index(&self, id: &str) -> bool {
        self.payload_key(id) == self.order_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> CacheKeys {
        CacheKeys::new(&CacheConfig::default())
    }

    #[test]
    fn test_key_layout() {
        let keys = keys();
        assert_eq!(keys.payload_key("42"), "profile:42");
        assert_eq!(keys.order_key(), "profile:order");
        assert_eq!(keys.channel("42"), "invalidation:42");
        assert_eq!(keys.channel_pattern(), "invalidation:*");
    }

    #[test]
    fn test_id_from_channel() {
        let keys = keys();
        assert_eq!(keys.id_from_channel("invalidation:42"), Some("42"));
        assert_eq!(keys.id_from_channel("invalidation:"), None);
        assert_eq!(keys.id_from_channel("profile:42"), None);
    }

    #[test]
    fn test_index_collision() {
        let keys = keys();
        assert!(keys.collides_with_index("order"));
        assert!(!keys.collides_with_index("orders"));
    }
}
