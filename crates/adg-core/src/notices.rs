//! User-facing texts (Telegram HTML).

use std::time::Duration;

use crate::{
    messaging::types::InboundMessage,
    text::{escape_html, truncate_chars},
};

/// Platform limit for callback alerts.
pub const ALERT_MAX_CHARS: usize = 200;

pub fn grace_text(grace: Duration) -> String {
    let secs = grace.as_secs();
    if secs >= 60 {
        let mins = secs / 60;
        format!("{mins} minute{}", plural(mins))
    } else {
        format!("{secs} second{}", plural(secs))
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

pub fn nocap_warn(grace: Duration, min_words: usize) -> String {
    format!(
        "📝 <b>Caption required.</b>\nPosts with media need a caption of at least {min_words} word{}. \
         Edit the post or reply to it with a caption within <b>{}</b>, otherwise it will be removed.",
        plural(min_words as u64),
        grace_text(grace)
    )
}

pub fn caption_too_short(min_words: usize) -> String {
    format!(
        "✏️ The caption is still too short. Please write at least <b>{min_words}</b> word{}.",
        plural(min_words as u64)
    )
}

pub fn reopen(grace: Duration) -> String {
    format!(
        "⚠️ The caption was removed or shortened. Restore it within <b>{}</b>, otherwise the post will be removed.",
        grace_text(grace)
    )
}

pub fn caption_received() -> String {
    "✅ Caption received. Thank you!".to_string()
}

pub fn ad_detected(msg: &InboundMessage) -> String {
    let (mention, id_html) = sender_html(msg);
    format!(
        "🚫 <b>Advertising is not allowed here.</b>\nSender: {mention} ({id_html})"
    )
}

pub fn still_ad() -> String {
    "🚫 This post is still classified as an advertisement.".to_string()
}

pub fn quota_exhausted() -> String {
    "⛔️ Your weekly advertising quota is used up. You can post the next ad next week.".to_string()
}

pub fn forward_not_allowed() -> String {
    "🚫 Forwarding posts from channels, groups or bots is not allowed in this chat.".to_string()
}

pub fn guide_alert(min_words: usize) -> String {
    truncate_chars(
        &format!(
            "Add a caption describing your post (at least {min_words} words): what it is, condition, price, location. \
             Edit the post or reply to it with the caption."
        ),
        ALERT_MAX_CHARS,
    )
}

pub fn info_alert(hours: u32) -> String {
    truncate_chars(
        &format!(
            "Admins can use the mute button to silence the sender for {hours} hour{} and remove the post.",
            plural(u64::from(hours))
        ),
        ALERT_MAX_CHARS,
    )
}

pub fn mute_done(user_name: &str, hours: u32) -> String {
    format!(
        "🔇 <b>{}</b> was muted for {hours} hour{} and the post was removed.",
        escape_html(user_name),
        plural(u64::from(hours))
    )
}

pub fn guide_button() -> &'static str {
    "🧩 Guide / example"
}

pub fn info_button() -> &'static str {
    "ℹ️ Info"
}

pub fn mute_button(hours: u32) -> String {
    format!("🔇 Mute {hours}h")
}

pub fn admins_only() -> &'static str {
    "This button is for admins only."
}

pub fn cannot_mute_admin() -> &'static str {
    "Admins and the owner cannot be muted."
}

pub fn permission_check_failed() -> &'static str {
    "Could not verify permissions."
}

pub fn invalid_button() -> &'static str {
    "Invalid button data."
}

pub fn action_failed(err: &str) -> String {
    truncate_chars(&format!("Action failed: {err}"), ALERT_MAX_CHARS)
}

/// `(mention, id)` HTML for the sender, falling back to the sender chat.
pub fn sender_html(msg: &InboundMessage) -> (String, String) {
    if let Some(s) = &msg.sender {
        let display = if s.first_name.trim().is_empty() {
            s.username
                .as_deref()
                .map(|u| format!("@{u}"))
                .unwrap_or_else(|| "user".to_string())
        } else {
            s.first_name.trim().to_string()
        };
        return (
            format!(
                "<a href=\"tg://user?id={}\">{}</a>",
                s.id.0,
                escape_html(&display)
            ),
            format!("<code>{}</code>", s.id.0),
        );
    }
    if let Some(chat) = msg.sender_chat {
        let title = msg.sender_chat_title.as_deref().unwrap_or("channel/group");
        return (
            format!("<b>{}</b>", escape_html(title)),
            format!("<code>{}</code>", chat.0),
        );
    }
    ("user".to_string(), "—".to_string())
}
