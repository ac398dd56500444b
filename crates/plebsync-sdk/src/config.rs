//! Client configuration.

use std::time::Duration;

/// How many times a publication is resubmitted after failing a challenge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `None` retries until the
    /// publication is verified or stopped.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
        }
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Configuration for the plebsync client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Comments revealed per feed page.
    pub posts_per_page: usize,
    /// Buffered posts per subplebbit at or below which its next page is
    /// prefetched.
    pub posts_left_before_next_page: usize,
    /// Debounce window of feed recomputation.
    pub feeds_update_interval: Duration,
    /// Size of the `comments` LRU cache.
    pub comments_cache_size: usize,
    /// Size of the `subplebbitsPages` LRU cache.
    pub pages_cache_size: usize,
    /// Size of each account's `commentReplies-{id}` LRU cache.
    pub comment_replies_cache_size: usize,
    /// Capacity of every store's event channel.
    pub event_channel_capacity: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            posts_per_page: 25,
            posts_left_before_next_page: 50,
            feeds_update_interval: Duration::from_millis(50),
            comments_cache_size: 5000,
            pages_cache_size: 500,
            comment_replies_cache_size: 1000,
            event_channel_capacity: 1024,
            retry_policy: RetryPolicy::unbounded(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn posts_per_page(mut self, posts: usize) -> Self {
        self.config.posts_per_page = posts;
        self
    }

    pub fn posts_left_before_next_page(mut self, posts: usize) -> Self {
        self.config.posts_left_before_next_page = posts;
        self
    }

    pub fn feeds_update_interval(mut self, interval: Duration) -> Self {
        self.config.feeds_update_interval = interval;
        self
    }

    pub fn comments_cache_size(mut self, size: usize) -> Self {
        self.config.comments_cache_size = size;
        self
    }

    pub fn pages_cache_size(mut self, size: usize) -> Self {
        self.config.pages_cache_size = size;
        self
    }

    pub fn comment_replies_cache_size(mut self, size: usize) -> Self {
        self.config.comment_replies_cache_size = size;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
