//! User-facing message texts.
//!
//! Fixed English strings for every message the bot sends. The captcha
//! option labels here must stay in sync with the option table in
//! [`crate::captcha`].

/// Callback reply for a correctly solved captcha
pub const SOLVED_REPLY: &str = "Correct! Welcome aboard, you can chat now.";

/// Escalating replies for users pressing buttons on someone else's captcha.
/// The attempt count indexes into this list; once it runs out, the user gets
/// [`MEDDLING_FINAL_REPLY`] and a temporary mute instead.
pub const MEDDLING_REPLIES: &[&str] = &[
    "This captcha is not for you.",
    "Seriously, hands off someone else's captcha.",
    "Last warning: stop pressing these buttons.",
];

/// Reply sent together with the temporary mute once escalation is exhausted
pub const MEDDLING_FINAL_REPLY: &str = "You were warned. Enjoy the timeout.";

/// Sent when every catalog item has already been dispatched to a chat
pub const OUT_OF_CONTENT_MESSAGE: &str =
    "I'm all out of fresh material for this chat. Someone say something interesting!";

/// Escalation reply for the given meddling attempt count, if one is configured
#[must_use]
pub fn meddling_reply(attempt: u32) -> Option<&'static str> {
    let index = usize::try_from(attempt).ok()?.checked_sub(1)?;
    MEDDLING_REPLIES.get(index).copied()
}

/// Challenge prompt embedding the label of the correct option
#[must_use]
pub fn challenge_text(mention: &str, option_label: &str) -> String {
    format!(
        "Welcome, {mention}! To prove you are human, press the {option_label} button below. \
         You cannot write until you do."
    )
}

/// Farewell for members who leave voluntarily
#[must_use]
pub fn goodbye_text(mention: &str) -> String {
    format!("{mention} has left the chat. Farewell!")
}

/// Human-readable label for a captcha option id
#[must_use]
pub fn option_label(option_id: &str) -> &str {
    match option_id {
        "red" => "red",
        "yellow" => "yellow",
        "green" => "green",
        "blue" => "blue",
        other => other,
    }
}
