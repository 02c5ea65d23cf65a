// Analyzer - classifies raw HTTP observations into visitor statistics
//
// Maps a free-form User-Agent string to a short agent label, a type
// (feed/bot/browser), an OS, a subscriber multiplier, and a stable per-visitor
// id. The rule list is ordered; the first rule producing a non-empty trimmed
// value wins, so reordering changes results.

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

/// One row of the stats table. String fields use "" for absent; the store
/// maps empty strings to SQL NULL at insert time.
#[derive(Debug, Clone, Default)]
pub struct StatRow {
    /// Advisory id from the wire; the store neither persists nor dedupes on it.
    #[allow(dead_code)]
    pub event_id: String,
    pub date: String,
    pub time: String,
    pub host: String,
    pub path: String,
    pub query: String,
    pub ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub r#type: String,
    pub agent: String,
    pub os: String,
    pub ref_domain: String,
    pub mult: i64,
    pub set_cookie: String,
    pub uniq: String,
    pub second_visit: bool,
}

/// Browser agent labels that classify a row as `browser` directly.
const BROWSER_AGENTS: &[&str] = &[
    "Chrome",
    "Firefox",
    "Edg",
    "EdgA",
    "EdgiOS",
    "Safari",
    "OPR",
    "YaBrowser",
    "Vivaldi",
    "SamsungBrowser",
    "UCBrowser",
];

/// UA analyzer with all rule patterns compiled once.
pub struct Analyzer {
    special: Regex,
    uuid_prefix: Regex,
    compatible: Regex,
    bot_prefix: Regex,
    bot_word: Regex,
    trident: Regex,
    mozilla_suffixed: Regex,
    mozilla_safari: Regex,
    mozilla_tail: Regex,
    feed_id_name: Regex,
    before_dash: Regex,
    before_version: Regex,
    before_punct: Regex,
    single_word: Regex,

    rss: Regex,
    bot_hint: Regex,
    os_android: Regex,
    os_windows: Regex,
    os_ios: Regex,
    os_mac: Regex,
    os_linux: Regex,

    subscribers: Regex,
    feed_id: Regex,
}

impl Analyzer {
    pub fn new() -> Self {
        // Hard-coded patterns; a failure here is a programming error.
        let re = |pattern: &str| Regex::new(pattern).expect("built-in pattern");
        Self {
            special: re(r"(?i)(?:Leed|BeyondPod|360Spider|Lark|Nutch|Skype|leakix\.net|uni-app)"),
            uuid_prefix: re(
                r"(?i)^[0-9A-F]{8}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{12}/\d+ ([^;(/]+)",
            ),
            compatible: re(r"(?i)compatible; ([^;(/+]*[^;(/+ ])"),
            bot_prefix: re(r"(?i)^[\w\.\-_@ ]*[\w\.\-_@] (?:ro)?bot"),
            bot_word: re(r"(?i)\b[\w\-_]+bot\b"),
            trident: re(r"(?i)Trident/[0-9.]+"),
            mozilla_suffixed: re(
                r"(?i)^Mozilla/.* ([A-Za-z0-9_]+)/[A-Z0-9.]+(?: (?:Chrome|Version|Mobile|Safari|Mobile Safari)/[A-Z0-9.]+)+$",
            ),
            mozilla_safari: re(r"(?i)^Mozilla/.* ([A-Za-z0-9_]+)/[0-9.]+(?: Mobile)? Safari/[0-9.]+$"),
            mozilla_tail: re(r"(?i)^Mozilla/.* ([A-Za-z0-9_]+)/[a-z0-9.]+(?: \([^\)]+\)| Mobile| GTB[0-9.]+)*$"),
            feed_id_name: re(r"(?i)^([\w\.\-_@ ]*[\w\.\-_@]) feed-id:"),
            before_dash: re(r"(?i)^([\w\._@ ]*[\w\._@]) - "),
            before_version: re(r"(?i)^([\w\.\-_@ ]*[\w\.\-_@])[- ]v?\d+\.\d+"),
            before_punct: re(r"(?i)^([\w\.\-_@% ]*[\w\.\-_@%]) ?[/\(:\+]"),
            single_word: re(r"(?i)^[\w\.\-_@ ]*[\w\.\-_@]$"),

            rss: re(r"(?i)rss"),
            bot_hint: re(
                r"(?i)bot|crawl|fetch|node|ruby|.rb|python|curl|okhttp|spider|scan|nutch|mastodon|\+http",
            ),
            os_android: re(r"(?i)Android"),
            os_windows: re(r"(?i)Windows"),
            os_ios: re(r"(?i)iOS|iPhone|iPad|Mobile.*Safari"),
            os_mac: re(r"(?i)macOS|Mac OS|Macintosh|Darwin"),
            os_linux: re(r"(?i)Linux|X11"),

            subscribers: re(r"(?i)(\d+) subscriber"),
            feed_id: re(r"(?i)feed-id[=:]([A-Za-z0-9_]+)"),
        }
    }

    /// Fill the derived columns of `row` that are still empty. Idempotent:
    /// already-populated fields (e.g. a pre-seeded `type`) are left alone.
    pub fn analyze(&self, row: &mut StatRow) {
        if row.agent.is_empty() {
            row.agent = self.agent(&row.user_agent);
        }
        if row.r#type.is_empty() {
            row.r#type = self.r#type(&row.agent, &row.user_agent);
        }
        if row.os.is_empty() {
            row.os = self.os(&row.user_agent);
        }
        if row.mult == 0 {
            row.mult = self.multiplier(&row.user_agent);
        }
        // Feed identities come from the UA alone and are computed even when
        // the row carries a freshly minted cookie (feeds and bots never echo
        // it back). The ip+ua identity is the one the cookie handshake
        // replaces, so a tentative row keeps uniq NULL until its
        // confirmation UPDATE arrives.
        if row.uniq.is_empty() {
            if let Some(id) = self.feed_uniq(&row.user_agent, &row.agent) {
                row.uniq = id;
            } else if row.set_cookie.is_empty() {
                row.uniq = self.uniq(&row.ip, &row.user_agent, &row.agent);
            }
        }
        if row.ref_domain.is_empty() {
            row.ref_domain = ref_domain(&row.referrer);
        }
    }

    /// Short human-readable label for the client, or "" when nothing matched.
    pub fn agent(&self, user_agent: &str) -> String {
        if user_agent.is_empty() {
            return String::new();
        }
        let ua = dequote(user_agent);

        if let Some(v) = found(&self.special, ua) {
            return v;
        }
        if let Some(v) = group(&self.uuid_prefix, ua) {
            return v;
        }
        if let Some(v) = group(&self.compatible, ua) {
            return v;
        }
        if let Some(v) = found(&self.bot_prefix, ua) {
            return v;
        }
        if let Some(v) = found(&self.bot_word, ua) {
            return v;
        }
        if self.trident.is_match(ua) {
            return "Trident".to_string();
        }
        if let Some(v) = group(&self.mozilla_suffixed, ua) {
            if !is_generic_component(&v) {
                return v;
            }
        }
        if let Some(v) = group(&self.mozilla_safari, ua) {
            if !v.eq_ignore_ascii_case("Version") {
                return v;
            }
        }
        if let Some(v) = group(&self.mozilla_tail, ua) {
            return v;
        }
        if let Some(v) = group(&self.feed_id_name, ua) {
            return v;
        }
        if let Some(v) = group(&self.before_dash, ua) {
            return v;
        }
        if let Some(v) = group(&self.before_version, ua) {
            return v;
        }
        if let Some(v) = group(&self.before_punct, ua) {
            if !v.to_lowercase().starts_with("mozilla") {
                return v;
            }
        }
        if let Some(v) = found(&self.single_word, ua) {
            return v;
        }
        String::new()
    }

    /// Coarse taxonomy: feed, browser, or bot.
    pub fn r#type(&self, agent: &str, user_agent: &str) -> String {
        if !user_agent.is_empty() && self.rss.is_match(user_agent) {
            return "feed".to_string();
        }
        if BROWSER_AGENTS.contains(&agent) {
            return "browser".to_string();
        }
        if !user_agent.is_empty() && self.bot_hint.is_match(user_agent) {
            return "bot".to_string();
        }
        if user_agent.starts_with("Mozilla/") {
            return "browser".to_string();
        }
        "bot".to_string()
    }

    /// First OS family the UA hints at, or "".
    pub fn os(&self, user_agent: &str) -> String {
        if self.os_android.is_match(user_agent) {
            return "Android".to_string();
        }
        if self.os_windows.is_match(user_agent) {
            return "Windows".to_string();
        }
        if self.os_ios.is_match(user_agent) {
            return "iOS".to_string();
        }
        if self.os_mac.is_match(user_agent) {
            return "macOS".to_string();
        }
        if self.os_linux.is_match(user_agent) {
            return "Linux".to_string();
        }
        String::new()
    }

    /// Subscriber multiplier: "N subscriber(s)" in the UA, else 1.
    pub fn multiplier(&self, user_agent: &str) -> i64 {
        self.subscribers
            .captures(user_agent)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1)
    }

    /// Stable per-visitor id, UUID-shaped.
    ///
    /// Feed fetchers advertising a feed-id collapse to hash(agent/feed_id);
    /// ones advertising subscriber counts collapse to hash(agent); everything
    /// else hashes ip+UA. The hash is the first 16 bytes of SHA-256 formatted
    /// as 8-4-4-4-12 hex. The version/variant bits are NOT adjusted, so the
    /// value is not a conformant v4 UUID; it must stay byte-for-byte stable
    /// across replays.
    pub fn uniq(&self, ip: &str, user_agent: &str, agent: &str) -> String {
        self.feed_uniq(user_agent, agent)
            .unwrap_or_else(|| hash_uuid(&format!("{}{}", ip, user_agent)))
    }

    /// UA-derived identity for feed fetchers: hash(agent/feed_id) when the UA
    /// advertises a feed-id, hash(agent) when it only advertises subscribers.
    fn feed_uniq(&self, user_agent: &str, agent: &str) -> Option<String> {
        if user_agent.is_empty() || agent.is_empty() {
            return None;
        }
        if let Some(feed_id) = self.extract_feed_id(user_agent) {
            return Some(hash_uuid(&format!("{}/{}", agent, feed_id)));
        }
        if user_agent.to_lowercase().contains("subscriber") {
            return Some(hash_uuid(agent));
        }
        None
    }

    fn extract_feed_id(&self, user_agent: &str) -> Option<String> {
        self.feed_id
            .captures(user_agent)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Registrable domain of the referrer, "www." stripped; "" when the referrer
/// is absent or not an absolute URL with a host.
pub fn ref_domain(referrer: &str) -> String {
    if referrer.is_empty() {
        return String::new();
    }
    match Url::parse(referrer) {
        Ok(u) => u
            .host_str()
            .map(|h| h.trim_start_matches("www.").to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// SHA-256 of the input, first 16 bytes as lowercase 8-4-4-4-12 hex.
pub fn hash_uuid(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let h = hex::encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

fn dequote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn is_generic_component(name: &str) -> bool {
    matches!(
        name,
        "Chrome" | "Version" | "Mobile" | "Safari" | "Mobile Safari"
    )
}

fn found(re: &Regex, s: &str) -> Option<String> {
    re.find(s).and_then(|m| trimmed(m.as_str()))
}

fn group(re: &Regex, s: &str) -> Option<String> {
    re.captures(s)
        .and_then(|caps| caps.get(1))
        .and_then(|m| trimmed(m.as_str()))
}

fn trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}
