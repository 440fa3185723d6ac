//! Robots.txt parsing and per-origin caching.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use url::Url;

/// Cache entries expire after this long by default.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    /// Rules per user-agent (lowercase)
    rules: HashMap<String, AgentRules>,

    /// Default rules (for *)
    default_rules: AgentRules,
}

/// Rules for a specific user-agent.
#[derive(Debug, Clone, Default)]
pub struct AgentRules {
    disallow: Vec<String>,
    /// Allow patterns override disallow.
    allow: Vec<String>,
    crawl_delay: Option<f64>,
}

impl RobotsTxt {
    /// Parse robots.txt content.
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules = AgentRules::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((directive, value)) = line.split_once(':') {
                let directive = directive.trim().to_lowercase();
                let value = value.trim();

                match directive.as_str() {
                    "user-agent" => {
                        // A directive after rules starts a new group.
                        if !current_agents.is_empty()
                            && (!current_rules.disallow.is_empty()
                                || !current_rules.allow.is_empty()
                                || current_rules.crawl_delay.is_some())
                        {
                            robots.store_group(&current_agents, current_rules.clone());
                            current_rules = AgentRules::default();
                            current_agents.clear();
                        }
                        current_agents.push(value.to_lowercase());
                    }
                    "disallow" => {
                        if !value.is_empty() {
                            current_rules.disallow.push(value.to_string());
                        }
                    }
                    "allow" => {
                        if !value.is_empty() {
                            current_rules.allow.push(value.to_string());
                        }
                    }
                    "crawl-delay" => {
                        if let Ok(delay) = value.parse::<f64>() {
                            current_rules.crawl_delay = Some(delay);
                        }
                    }
                    _ => {}
                }
            }
        }

        if !current_agents.is_empty() {
            robots.store_group(&current_agents, current_rules);
        }

        robots
    }

    fn store_group(&mut self, agents: &[String], rules: AgentRules) {
        for agent in agents {
            if agent == "*" {
                self.default_rules = rules.clone();
            } else {
                self.rules.insert(agent.clone(), rules.clone());
            }
        }
    }

    fn rules_for(&self, user_agent: &str) -> &AgentRules {
        let agent_lower = user_agent.to_lowercase();
        self.rules
            .get(&agent_lower)
            .or_else(|| {
                self.rules
                    .iter()
                    .find(|(name, _)| agent_lower.contains(name.as_str()))
                    .map(|(_, rules)| rules)
            })
            .unwrap_or(&self.default_rules)
    }

    /// Check whether a path is allowed for a user-agent.
    ///
    /// Allow rules take precedence over disallow; a path no rule matches
    /// is allowed.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let rules = self.rules_for(user_agent);

        for allow in &rules.allow {
            if pattern_matches(allow, path) {
                return true;
            }
        }
        for disallow in &rules.disallow {
            if pattern_matches(disallow, path) {
                return false;
            }
        }
        true
    }

    /// Crawl delay for a user-agent, falling back to the `*` group.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        let delay = self
            .rules_for(user_agent)
            .crawl_delay
            .or(self.default_rules.crawl_delay)?;
        if delay.is_finite() && delay >= 0.0 {
            Some(Duration::from_secs_f64(delay))
        } else {
            None
        }
    }
}

/// Robots pattern matching: plain patterns are prefixes; a single `*` may
/// sit at the start (suffix match), the end (prefix match), or the middle
/// (prefix + later substring).
fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.matches('*').count() {
        0 => path.starts_with(pattern),
        1 => {
            if let Some(suffix) = pattern.strip_prefix('*') {
                return path.ends_with(suffix);
            }
            if let Some(prefix) = pattern.strip_suffix('*') {
                return path.starts_with(prefix);
            }
            let (head, tail) = pattern.split_once('*').unwrap();
            path.starts_with(head) && path[head.len()..].contains(tail)
        }
        _ => {
            // Multiple stars: greedy left-to-right scan.
            let mut remaining = path;
            let mut segments = pattern.split('*');
            if let Some(first) = segments.next() {
                if !remaining.starts_with(first) {
                    return false;
                }
                remaining = &remaining[first.len()..];
            }
            for segment in segments {
                if segment.is_empty() {
                    continue;
                }
                match remaining.find(segment) {
                    Some(pos) => remaining = &remaining[pos + segment.len()..],
                    None => return false,
                }
            }
            true
        }
    }
}

struct CacheEntry {
    robots: RobotsTxt,
    fetched_at: Instant,
}

/// Lazily-populated robots.txt cache keyed by origin.
///
/// Fetch failures degrade to allow-all; concurrent fetches for the same
/// origin race benignly (last writer wins).
pub struct RobotsCache {
    client: reqwest::Client,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_ttl(client, DEFAULT_TTL)
    }

    pub fn with_ttl(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn origin_key(url: &Url) -> String {
        let mut key = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
        if let Some(port) = url.port() {
            key.push_str(&format!(":{port}"));
        }
        key
    }

    /// Inject rules for an origin without a network fetch (tests, warmup).
    pub fn prime(&self, origin_url: &str, content: &str) {
        if let Ok(url) = Url::parse(origin_url) {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(
                Self::origin_key(&url),
                CacheEntry {
                    robots: RobotsTxt::parse(content),
                    fetched_at: Instant::now(),
                },
            );
        }
    }

    async fn rules_for(&self, url: &Url) -> RobotsTxt {
        let key = Self::origin_key(url);

        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return entry.robots.clone();
                }
            }
        }

        let robots = self.fetch(url).await;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                robots: robots.clone(),
                fetched_at: Instant::now(),
            },
        );
        robots
    }

    async fn fetch(&self, url: &Url) -> RobotsTxt {
        let robots_url = match url.join("/robots.txt") {
            Ok(robots_url) => robots_url,
            Err(_) => return RobotsTxt::default(),
        };

        match self.client.get(robots_url.clone()).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(content) => {
                    debug!(origin = %Self::origin_key(url), "fetched robots.txt");
                    RobotsTxt::parse(&content)
                }
                Err(e) => {
                    warn!(url = %robots_url, error = %e, "failed to read robots.txt body");
                    RobotsTxt::default()
                }
            },
            // Missing robots.txt (or any fetch failure) means allow-all.
            Ok(_) => RobotsTxt::default(),
            Err(e) => {
                warn!(url = %robots_url, error = %e, "failed to fetch robots.txt");
                RobotsTxt::default()
            }
        }
    }

    /// Whether the url's path is allowed for `user_agent`.
    pub async fn is_allowed(&self, url: &Url, user_agent: &str) -> bool {
        let rules = self.rules_for(url).await;
        rules.is_allowed(user_agent, url.path())
    }

    /// Origin's crawl delay for `user_agent`, if any.
    pub async fn crawl_delay(&self, url: &Url, user_agent: &str) -> Option<Duration> {
        let rules = self.rules_for(url).await;
        rules.crawl_delay(user_agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_groups() {
        let content = r#"
User-agent: *
Disallow: /private/
Disallow: /admin/
Allow: /public/
Crawl-delay: 2
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(robots.is_allowed("KiteBot", "/public/page"));
        assert!(!robots.is_allowed("KiteBot", "/private/page"));
        assert!(!robots.is_allowed("KiteBot", "/admin/"));
        assert!(robots.is_allowed("KiteBot", "/other/page"));
        assert_eq!(robots.crawl_delay("KiteBot"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn specific_user_agent_wins_over_default() {
        let content = r#"
User-agent: *
Disallow: /

User-agent: goodbot
Allow: /
        "#;

        let robots = RobotsTxt::parse(content);
        assert!(!robots.is_allowed("BadBot", "/page"));
        assert!(robots.is_allowed("GoodBot", "/page"));
    }

    #[test]
    fn allow_overrides_disallow() {
        let content = r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
        "#;

        let robots = RobotsTxt::parse(content);
        assert!(!robots.is_allowed("Bot", "/private/secret"));
        assert!(robots.is_allowed("Bot", "/private/public/page"));
    }

    #[test]
    fn consecutive_agent_lines_share_a_group() {
        let content = r#"
User-agent: alpha
User-agent: beta
Disallow: /shared/
        "#;

        let robots = RobotsTxt::parse(content);
        assert!(!robots.is_allowed("alpha", "/shared/x"));
        assert!(!robots.is_allowed("beta", "/shared/x"));
        assert!(robots.is_allowed("gamma", "/shared/x"));
    }

    #[test]
    fn empty_rules_allow_everything() {
        let robots = RobotsTxt::parse("");
        assert!(robots.is_allowed("AnyBot", "/any/path"));
        assert!(robots.crawl_delay("AnyBot").is_none());
    }

    #[test]
    fn trailing_wildcard_matches_prefix() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /cases/*");
        assert!(!robots.is_allowed("Bot", "/cases/2024/123"));
        assert!(robots.is_allowed("Bot", "/search"));
    }

    #[test]
    fn leading_wildcard_matches_suffix() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: *.pdf");
        assert!(!robots.is_allowed("Bot", "/judgments/2024.pdf"));
        assert!(robots.is_allowed("Bot", "/judgments/2024.html"));
    }

    #[test]
    fn middle_wildcard_splits_on_one_star() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /cases/*/download");
        assert!(!robots.is_allowed("Bot", "/cases/2024/download"));
        assert!(!robots.is_allowed("Bot", "/cases/a/b/download?id=1"));
        assert!(robots.is_allowed("Bot", "/cases/2024/view"));
    }

    #[test]
    fn disallow_root_blocks_all() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /");
        assert!(!robots.is_allowed("Bot", "/anything"));
        assert!(!robots.is_allowed("Bot", "/"));
    }

    #[tokio::test]
    async fn cache_prime_and_check() {
        let cache = RobotsCache::new(reqwest::Client::new());
        cache.prime(
            "https://courts.example.com/",
            "User-agent: *\nDisallow: /secret",
        );

        let blocked = Url::parse("https://courts.example.com/secret/file").unwrap();
        let open = Url::parse("https://courts.example.com/public").unwrap();

        assert!(!cache.is_allowed(&blocked, "KiteBot").await);
        assert!(cache.is_allowed(&open, "KiteBot").await);
    }

    #[test]
    fn origin_keys_include_explicit_ports() {
        let with_port = Url::parse("http://localhost:8080/a").unwrap();
        let without = Url::parse("http://localhost/a").unwrap();
        assert_ne!(
            RobotsCache::origin_key(&with_port),
            RobotsCache::origin_key(&without)
        );
    }
}
