//! Channel-specific payload rendering.
//!
//! Every subject names the matched labels; every body carries the sender and
//! a subject excerpt. Length budgets follow each provider's limits.

use crate::notify::ChannelKind;
use crate::pipeline::types::{ClassificationResult, Message};

/// Pushover caps titles at 250 characters.
const PUSHOVER_TITLE_MAX: usize = 250;
/// Pushover caps messages at 1024 characters.
const PUSHOVER_BODY_MAX: usize = 1024;
/// One SMS segment.
const SMS_MAX: usize = 160;

const SUBJECT_EXCERPT: usize = 80;

/// Render `(subject, body)` for `channel`.
pub fn render(
    channel: ChannelKind,
    message: &Message,
    classification: &ClassificationResult,
) -> (String, String) {
    let labels = classification.label_names().join(", ");
    let subject_line = format!("[{}] {}", labels, excerpt(&message.subject, SUBJECT_EXCERPT));

    match channel {
        ChannelKind::Pushover => {
            let title = truncate(&format!("Important Email {}", subject_line), PUSHOVER_TITLE_MAX);
            let body = format!(
                "From: {}\nSubject: {}\n\n{}",
                message.sender,
                excerpt(&message.subject, SUBJECT_EXCERPT),
                excerpt(&message.body_preview, 200)
            );
            (title, truncate(&body, PUSHOVER_BODY_MAX))
        }
        ChannelKind::Email => {
            let subject = format!("Important Email {}", subject_line);
            let body = format!(
                "Important email received:\n\n\
                 Labels: {}\n\
                 From: {}\n\
                 Subject: {}\n\
                 Date: {}\n\n\
                 Preview:\n{}\n",
                labels,
                message.sender,
                message.subject,
                message.received_at.to_rfc2822(),
                excerpt(&message.body_preview, 500)
            );
            (subject, body)
        }
        ChannelKind::Sms => {
            // Sender leads so the segment cut only ever eats labels and subject.
            let body = format!(
                "Important email from {}: [{}] {}",
                message.sender,
                labels,
                excerpt(&message.subject, 60)
            );
            (subject_line, truncate(&body, SMS_MAX))
        }
        ChannelKind::WhatsApp => {
            let body = format!(
                "📧 *Important Email*\n\n\
                 *Labels:* {}\n\
                 *Subject:* {}\n\
                 *From:* {}\n\
                 *Date:* {}\n\n\
                 *Preview:*\n{}",
                labels,
                excerpt(&message.subject, SUBJECT_EXCERPT),
                message.sender,
                message.received_at.format("%Y-%m-%d %H:%M UTC"),
                excerpt(&message.body_preview, 250)
            );
            (subject_line, body)
        }
    }
}

/// First `max` characters, with an ellipsis when shortened.
fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}

/// Hard cap at `max` characters, ellipsis included.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::LabelSource;
    use chrono::Utc;

    fn classification() -> ClassificationResult {
        let mut result = ClassificationResult::empty();
        result.push("Important", LabelSource::Rule);
        result.push("Work", LabelSource::Rule);
        result.should_notify = true;
        result
    }

    fn message(body: &str) -> Message {
        Message::new(
            "m-1",
            "Boss <boss@company.com>",
            "Urgent: quarterly review",
            body,
            Utc::now(),
            false,
        )
    }

    #[test]
    fn every_channel_names_labels_and_sender() {
        for kind in [
            ChannelKind::Pushover,
            ChannelKind::Email,
            ChannelKind::Sms,
            ChannelKind::WhatsApp,
        ] {
            let (subject, body) = render(kind, &message("Please prepare"), &classification());
            assert!(subject.contains("Important, Work"), "{kind}: {subject}");
            assert!(body.contains("boss@company.com"), "{kind}: {body}");
            assert!(body.contains("Urgent"), "{kind}: {body}");
        }
    }

    #[test]
    fn sms_fits_one_segment() {
        let long = "y".repeat(400);
        let sender = format!("{}@example.com", "x".repeat(120));
        let msg = Message::new("m", &sender, long, "", Utc::now(), false);
        let (_, body) = render(ChannelKind::Sms, &msg, &classification());
        assert!(body.chars().count() <= SMS_MAX);
        assert!(body.contains(&sender));
    }

    #[test]
    fn sms_keeps_sender_with_many_long_labels() {
        let mut many = ClassificationResult::empty();
        for name in [
            "Important Clients",
            "Quarterly Finance",
            "Board Communications",
            "Executive Team",
            "Legal Review",
        ] {
            many.push(name, LabelSource::Rule);
        }
        many.should_notify = true;
        let msg = Message::new(
            "m",
            "boss@company.com",
            "Urgent: please sign the quarterly budget approval before noon",
            "",
            Utc::now(),
            false,
        );

        let (_, body) = render(ChannelKind::Sms, &msg, &many);
        assert!(body.chars().count() <= SMS_MAX);
        assert!(body.starts_with("Important email from boss@company.com:"), "{body}");
    }

    #[test]
    fn pushover_body_within_limit() {
        let msg = message(&"z".repeat(5000));
        let (title, body) = render(ChannelKind::Pushover, &msg, &classification());
        assert!(title.chars().count() <= PUSHOVER_TITLE_MAX);
        assert!(body.chars().count() <= PUSHOVER_BODY_MAX);
    }

    #[test]
    fn email_body_includes_preview() {
        let (_, body) = render(ChannelKind::Email, &message("Numbers attached"), &classification());
        assert!(body.contains("Preview:\nNumbers attached"));
        assert!(body.contains("Labels: Important, Work"));
    }

    #[test]
    fn whatsapp_uses_markdown_emphasis() {
        let (_, body) = render(ChannelKind::WhatsApp, &message("hi"), &classification());
        assert!(body.contains("*Important Email*"));
    }

    #[test]
    fn excerpt_adds_ellipsis_only_when_cut() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij-klm", 10), "abcdefghij...");
    }
}
