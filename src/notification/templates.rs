// src/notification/templates.rs

use crate::core::{EmailMessage, NotificationEvent, PushMessage, SafetyStatus, TriggerType};
use serde_json::json;

/// The title/body pair every recipient of one dispatch receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
}

/// Builds the notification copy for an event from fixed templates.
pub fn render(event: &NotificationEvent) -> NotificationContent {
    let location = &event.location_key;
    match event.trigger_type {
        TriggerType::DataAvailable => NotificationContent {
            title: "Measurement data available".to_string(),
            body: format!(
                "Measurement results are now available for {}. Open the app to see the latest readings.",
                location
            ),
        },
        TriggerType::StatusChange => {
            let substance = substance_label(event);
            let new_status = event.new_status.map(status_label).unwrap_or("Unknown");
            let old_status = event.old_status.map(status_label).unwrap_or("Unknown");
            NotificationContent {
                title: format!("{} is now at {} level", substance, new_status),
                body: format!(
                    "{} at {} changed from {} to {}.{}",
                    substance,
                    location,
                    old_status,
                    new_status,
                    reading_suffix(event)
                ),
            }
        }
        TriggerType::DataUpdate => NotificationContent {
            title: "New measurement data".to_string(),
            body: format!("New measurements were recorded for {}.{}", location, reading_suffix(event)),
        },
    }
}

/// Wraps the content into an email with matching HTML and text bodies.
pub fn email_message(content: &NotificationContent, event: &NotificationEvent) -> EmailMessage {
    let accent = match event.new_status {
        Some(SafetyStatus::Danger) => "#c0392b",
        Some(SafetyStatus::Warning) => "#d68910",
        _ => "#1e8449",
    };
    let html_body = format!(
        "<html><body><h2 style=\"color:{}\">{}</h2><p>{}</p><p style=\"color:#777;font-size:12px\">You receive this email because you subscribed to alerts for {}.</p></body></html>",
        accent,
        escape_html(&content.title),
        escape_html(&content.body),
        escape_html(&event.location_key)
    );
    let text_body = format!(
        "{}\n\n{}\n\nYou receive this email because you subscribed to alerts for {}.",
        content.title, content.body, event.location_key
    );
    EmailMessage {
        subject: content.title.clone(),
        html_body,
        text_body,
    }
}

/// Wraps the content into a push message carrying routing data for the app.
pub fn push_message(content: &NotificationContent, event: &NotificationEvent) -> PushMessage {
    PushMessage {
        title: content.title.clone(),
        body: content.body.clone(),
        data: json!({
            "trigger_type": event.trigger_type,
            "location_key": event.location_key,
            "substance_id": event.substance_id,
            "new_status": event.new_status,
        }),
    }
}

fn substance_label(event: &NotificationEvent) -> &str {
    event
        .substance_name
        .as_deref()
        .or(event.substance_id.as_deref())
        .unwrap_or("A monitored substance")
}

fn status_label(status: SafetyStatus) -> &'static str {
    match status {
        SafetyStatus::Safe => "Safe",
        SafetyStatus::Warning => "Warning",
        SafetyStatus::Danger => "Danger",
    }
}

fn reading_suffix(event: &NotificationEvent) -> String {
    match (event.current_value, event.unit.as_deref()) {
        (Some(value), Some(unit)) => format!(" Latest reading: {} {}.", value, unit),
        (Some(value), None) => format!(" Latest reading: {}.", value),
        _ => String::new(),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
