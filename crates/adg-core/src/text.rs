//! Text heuristics used by the moderation pipeline (word counts, contact
//! detection, domain extraction, request intent).

use std::sync::OnceLock;

use regex::Regex;

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

/// Count words in a caption/text. HTML tags are stripped and runs made only of
/// underscores are ignored.
pub fn count_words(text: &str) -> usize {
    static TAG: OnceLock<Regex> = OnceLock::new();
    static WORD: OnceLock<Regex> = OnceLock::new();

    let stripped = re(&TAG, r"<[^>]+>").replace_all(text, " ");
    re(&WORD, r"\w+")
        .find_iter(&stripped)
        .filter(|m| m.as_str().chars().any(|c| c != '_'))
        .count()
}

/// Does the text carry something that looks like contact info (phone, link,
/// handle, email)?
pub fn has_contact_like(text: &str) -> bool {
    static MOBILE: OnceLock<Regex> = OnceLock::new();
    static PHONE: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();
    static HANDLE: OnceLock<Regex> = OnceLock::new();
    static EMAIL: OnceLock<Regex> = OnceLock::new();

    if text.trim().is_empty() {
        return false;
    }
    let s = text.to_lowercase();
    re(&MOBILE, r"(\+?98|0)?9\d{9}").is_match(&s)
        || re(&PHONE, r"\b\+?\d[\d\s\-]{8,}\d\b").is_match(&s)
        || re(&LINK, r"(https?://|www\.)\S+").is_match(&s)
        || re(&HANDLE, r"@\w{3,}").is_match(&s)
        || s.contains("t.me/")
        || re(&EMAIL, r"[\w.\-]+@[\w.\-]+\.[a-z]{2,}").is_match(&s)
}

/// Lowercase a domain and drop a leading `www.` and trailing dots.
pub fn normalize_domain(raw: &str) -> String {
    let d = raw.trim().trim_end_matches('.').to_lowercase();
    d.strip_prefix("www.").map(str::to_string).unwrap_or(d)
}

/// Hosts found in URLs plus bare host-like tokens, normalized, sorted, unique.
pub fn extract_domains(text: &str) -> Vec<String> {
    static URL: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();

    let mut out = Vec::new();
    for m in re(&URL, r"(?i)https?://[^\s)\]><]+").find_iter(text) {
        if let Some(host) = url_host(m.as_str()) {
            out.push(normalize_domain(host));
        }
    }
    let bare = re(
        &BARE,
        r"(?i)\b([a-z0-9\x{0600}-\x{06FF}][a-z0-9.\-\x{0600}-\x{06FF}]*\.[a-z\x{0600}-\x{06FF}]{2,})",
    );
    for caps in bare.captures_iter(text) {
        if let Some(host) = caps.get(1) {
            // Skip the local part of an email address.
            if text[host.end()..].starts_with('@') {
                continue;
            }
            out.push(normalize_domain(host.as_str()));
        }
    }
    out.retain(|d| !d.is_empty());
    out.sort();
    out.dedup();
    out
}

fn url_host(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Does the text read as someone asking for something (where to buy, who
/// has, recommend me ...)? Persian colloquial forms and English forms.
pub fn is_request_intent(text: &str) -> bool {
    static INVISIBLE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    static BUY_WORD: OnceLock<Regex> = OnceLock::new();

    if text.trim().is_empty() {
        return false;
    }
    let norm = re(&INVISIBLE, r"[\x{200c}\x{200e}\x{200f}]").replace_all(text.trim(), " ");
    let s = re(&SPACES, r"\s+").replace_all(&norm, " ");

    let patterns = PATTERNS.get_or_init(|| {
        [
            // Persian
            r"می\s*خوا(?:م|ستم)",
            r"میخاستم",
            r"نیاز\s?دارم",
            r"دنبال",
            r"کجا(?:ی)?",
            r"پیدا\s?(?:می[شس]ه|می\s*تونم)?",
            r"راهنمایی(?:\s+کنید)?",
            r"معرفی(?:\s+کنید)?",
            r"پیشنهاد\s?بدید",
            r"(?:چه|کدوم)(?:\s+\S+){0,8}\s+(?:استفاده\s*کنیم|مناسبه|بهتره)",
            r"دار(?:ید|ین|ی)(?:\s+\S+){0,6}\s+بفرس(?:تین|تید)",
            r"(?:پی\.?\s*وی|پیوی)\s*قیمت",
            r"(?:قیمت|هزینه)\s*(?:بده|بدید|اعلام|لطفا|چنده|چقد(?:ر|ه))",
            r"(?:موجود|موجودی)\s+دار(?:ه|ید|ین|ن|ند)",
            r"کسی(?:\s+\S+){0,10}\s+(?:هست|نیست|دار(?:ه|ید|ی|ن|ند)|ندار(?:ه|ید|ین|ن|ند))",
            r"کسی(?:\s+\S+){0,10}\s+(?:اطلاع|سراغ|موجود)\s+دار(?:ه|ید|ین|ن|ند)",
            r"کسی(?:\s+\S+){0,10}\s+(?:می\s*تونه|میتونه|بتونه|بتونید|بتونی|بتونن)",
            // English
            r"(?i)\b(?:i\s+(?:need|want|am\s+looking\s+for)|looking\s+for)\b",
            r"(?i)\bwhere\s+(?:can|do|could|should)\s+i\b",
            r"(?i)\b(?:anyone|anybody|someone|somebody)\s+(?:has|have|know|knows|sell|sells|can)\b",
            r"(?i)\b(?:recommend|suggest)\b",
            r"(?i)\b(?:how\s+much|what(?:'s|\s+is)\s+the\s+price)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    });

    if patterns.iter().any(|p| p.is_match(&s)) {
        return true;
    }
    (s.contains('?') || s.contains('؟'))
        && re(&BUY_WORD, r"(?i)(بخر|خرید|تهیه|\bbuy\b)").is_match(&s)
}

/// Remove `@bot_username` mentions (case-insensitive) and trim.
pub fn strip_mention(text: &str, bot_username: &str) -> String {
    let pattern = format!(r"(?i)@{}\b", regex::escape(bot_username));
    match Regex::new(&pattern) {
        Ok(mention) => mention.replace_all(text, "").trim().to_string(),
        Err(_) => text.trim().to_string(),
    }
}

/// Truncate to at most `max` chars, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
