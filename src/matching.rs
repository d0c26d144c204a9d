//! Decides whether a subscription wants to hear about an event.

use crate::core::{NotificationEvent, SafetyStatus, Subscription, TriggerType};
use serde::{Deserialize, Serialize};

/// What a subscriber who never turned on any alert class receives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UntouchedPreferencePolicy {
    /// Only events whose new status is `danger`.
    #[default]
    DangerOnly,
    /// Nothing at all.
    Nothing,
}

/// Filters subscriptions against an event. Stateless apart from the policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberMatcher {
    untouched: UntouchedPreferencePolicy,
}

impl SubscriberMatcher {
    pub fn new(untouched: UntouchedPreferencePolicy) -> Self {
        Self { untouched }
    }

    /// Returns `true` if `subscription` should be notified about `event`.
    pub fn should_notify(&self, subscription: &Subscription, event: &NotificationEvent) -> bool {
        let prefs = &subscription.preferences;

        // Opt-in notice; no other preference applies.
        if event.trigger_type == TriggerType::DataAvailable {
            return prefs.notify_when_data_available;
        }

        if let Some(substance_id) = &event.substance_id {
            if !subscription.watch_list.is_empty() && !subscription.watch_list.contains(substance_id) {
                return false;
            }
        }

        if prefs.alert_on_any_change {
            return true;
        }
        match event.new_status {
            Some(SafetyStatus::Danger) if prefs.alert_on_danger => return true,
            Some(SafetyStatus::Warning) if prefs.alert_on_warning => return true,
            _ => {}
        }

        if prefs.is_untouched() {
            return match self.untouched {
                UntouchedPreferencePolicy::DangerOnly => event.new_status == Some(SafetyStatus::Danger),
                UntouchedPreferencePolicy::Nothing => false,
            };
        }
        false
    }
}
