use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::ClassificationError;
use crate::events::{ClassifiedEvent, InboxEvent, PriorityTier};

/// An ignore-list entry. A bare string mutes a sender permanently; the table
/// form mutes it until the given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IgnoreRule {
    Always(String),
    Until {
        sender: String,
        until: DateTime<Local>,
    },
}

impl IgnoreRule {
    #[must_use]
    pub fn pattern(&self) -> &str {
        match self {
            Self::Always(pattern) | Self::Until { sender: pattern, .. } => pattern,
        }
    }

    /// Whether the rule is in force at `now`
    #[must_use]
    pub fn is_active(&self, now: DateTime<Local>) -> bool {
        match self {
            Self::Always(_) => true,
            Self::Until { until, .. } => now < *until,
        }
    }
}

/// Sender lists consulted on every classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    /// `name@host` for one address, `@host` for a whole domain
    #[serde(default)]
    pub priority_senders: Vec<String>,
    #[serde(default)]
    pub ignore_senders: Vec<IgnoreRule>,
}

/// Why an event landed in its tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationReason {
    /// Sender is on the priority list
    PrioritySender,
    /// Sender is on the ignore list (or temporarily muted)
    IgnoredSender,
    /// Provider filed it outside the primary inbox
    NonPrimaryPlacement,
    /// Unmatched mail in the primary inbox
    PrimaryInbox,
}

/// Classification result with metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub tier: PriorityTier,
    pub reason: ClassificationReason,
}

/// Classify an inbox event against the current rule set
///
/// Priority: priority list > ignore list > placement. Rules are read on every
/// call, so a reloaded rule set applies from the next event on.
///
/// # Errors
///
/// Returns an error if the event has no id or its sender is not an address
pub fn classify(
    event: &InboxEvent,
    rules: &FilterRules,
    now: DateTime<Local>,
) -> Result<PriorityTier, ClassificationError> {
    classify_full(event, rules, now).map(|c| c.tier)
}

/// Classify with full result metadata
///
/// # Errors
///
/// Returns an error if the event has no id or its sender is not an address
pub fn classify_full(
    event: &InboxEvent,
    rules: &FilterRules,
    now: DateTime<Local>,
) -> Result<Classification, ClassificationError> {
    let address = validate(event)?;

    // 1. Priority senders win regardless of placement or time
    if let Some(rule) = rules
        .priority_senders
        .iter()
        .find(|pattern| sender_matches(pattern, &address))
    {
        log::debug!("Sender '{address}' matched priority rule '{rule}'");
        return Ok(Classification {
            tier: PriorityTier::Priority,
            reason: ClassificationReason::PrioritySender,
        });
    }

    // 2. Ignore list (expired mutes no longer apply)
    if let Some(rule) = rules
        .ignore_senders
        .iter()
        .filter(|rule| rule.is_active(now))
        .find(|rule| sender_matches(rule.pattern(), &address))
    {
        log::debug!("Sender '{address}' matched ignore rule '{}'", rule.pattern());
        return Ok(Classification {
            tier: PriorityTier::Filtered,
            reason: ClassificationReason::IgnoredSender,
        });
    }

    // 3. Placement decides the rest
    if event.placement.is_primary() {
        Ok(Classification {
            tier: PriorityTier::Regular,
            reason: ClassificationReason::PrimaryInbox,
        })
    } else {
        log::debug!(
            "Event {} filed under {:?}, filtering",
            event.id,
            event.placement
        );
        Ok(Classification {
            tier: PriorityTier::Filtered,
            reason: ClassificationReason::NonPrimaryPlacement,
        })
    }
}

/// Classify and attach the tier to the event
///
/// # Errors
///
/// Returns an error if the event is malformed
pub fn classify_event(
    event: InboxEvent,
    rules: &FilterRules,
    now: DateTime<Local>,
) -> Result<ClassifiedEvent, ClassificationError> {
    let tier = classify(&event, rules, now)?;
    Ok(ClassifiedEvent { event, tier })
}

/// Pull the bare, lowercased address out of a sender header
fn validate(event: &InboxEvent) -> Result<String, ClassificationError> {
    if event.id.as_str().trim().is_empty() {
        return Err(ClassificationError::MissingId);
    }

    let raw = event.sender.trim();
    let address = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => &raw[open + 1..close],
        _ => raw,
    };
    let address = address.trim().to_lowercase();

    let well_formed = match address.split_once('@') {
        Some((local, host)) => {
            !local.is_empty() && !host.is_empty() && !host.contains('@') && !address.contains(' ')
        }
        None => false,
    };

    if well_formed {
        Ok(address)
    } else {
        Err(ClassificationError::MalformedSender {
            id: event.id.to_string(),
            sender: event.sender.clone(),
        })
    }
}

/// `@host` matches the domain and its subdomains, anything else the exact address
fn sender_matches(pattern: &str, address: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty() {
        return false;
    }

    match pattern.strip_prefix('@') {
        Some(domain) => address.rsplit_once('@').is_some_and(|(_, host)| {
            host == domain || host.ends_with(&format!(".{domain}"))
        }),
        None => address == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InboxPlacement;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, hour, minute, 0).unwrap()
    }

    fn rules() -> FilterRules {
        FilterRules {
            priority_senders: vec!["boss@work.com".to_string(), "@family.org".to_string()],
            ignore_senders: vec![
                IgnoreRule::Always("@newsletters.io".to_string()),
                IgnoreRule::Always("Boss@Work.com".to_string()),
            ],
        }
    }

    fn event(sender: &str, placement: InboxPlacement) -> InboxEvent {
        InboxEvent::new("m-1", sender, "Subject", at(9, 0)).with_placement(placement)
    }

    #[test]
    fn test_priority_sender_wins_in_every_placement_and_hour() {
        let placements = [
            InboxPlacement::Primary,
            InboxPlacement::Promotions,
            InboxPlacement::Social,
            InboxPlacement::Updates,
            InboxPlacement::Forums,
            InboxPlacement::Spam,
        ];
        for placement in placements {
            for hour in [0, 3, 9, 14, 23] {
                let tier = classify(&event("boss@work.com", placement), &rules(), at(hour, 30));
                assert_eq!(tier, Ok(PriorityTier::Priority), "{placement:?} at {hour}");
            }
        }
    }

    #[test]
    fn test_priority_list_beats_ignore_list() {
        // boss@work.com is on both lists
        let boss = event("boss@work.com", InboxPlacement::Primary);
        let result = classify_full(&boss, &rules(), at(9, 0)).unwrap();
        assert_eq!(result.reason, ClassificationReason::PrioritySender);
    }

    #[test]
    fn test_domain_rule_matches_subdomains_only_on_boundary() {
        let r = rules();
        assert_eq!(
            classify(&event("mom@family.org", InboxPlacement::Primary), &r, at(9, 0)),
            Ok(PriorityTier::Priority)
        );
        assert_eq!(
            classify(&event("kid@mail.family.org", InboxPlacement::Primary), &r, at(9, 0)),
            Ok(PriorityTier::Priority)
        );
        assert_eq!(
            classify(&event("someone@notfamily.org", InboxPlacement::Primary), &r, at(9, 0)),
            Ok(PriorityTier::Regular)
        );
    }

    #[test]
    fn test_ignored_sender_is_filtered() {
        let result = classify_full(
            &event("deals@newsletters.io", InboxPlacement::Primary),
            &rules(),
            at(9, 0),
        )
        .unwrap();
        assert_eq!(result.tier, PriorityTier::Filtered);
        assert_eq!(result.reason, ClassificationReason::IgnoredSender);
    }

    #[test]
    fn test_non_primary_unmatched_is_filtered() {
        let result = classify_full(
            &event("friend@example.com", InboxPlacement::Social),
            &rules(),
            at(9, 0),
        )
        .unwrap();
        assert_eq!(result.tier, PriorityTier::Filtered);
        assert_eq!(result.reason, ClassificationReason::NonPrimaryPlacement);
    }

    #[test]
    fn test_primary_unmatched_is_regular() {
        assert_eq!(
            classify(&event("friend@example.com", InboxPlacement::Primary), &rules(), at(9, 0)),
            Ok(PriorityTier::Regular)
        );
    }

    #[test]
    fn test_display_name_header_is_parsed() {
        assert_eq!(
            classify(
                &event("The Boss <BOSS@work.com>", InboxPlacement::Spam),
                &rules(),
                at(9, 0)
            ),
            Ok(PriorityTier::Priority)
        );
    }

    #[test]
    fn test_temporary_mute_expires() {
        let r = FilterRules {
            priority_senders: vec![],
            ignore_senders: vec![IgnoreRule::Until {
                sender: "chatty@example.com".to_string(),
                until: at(12, 0),
            }],
        };
        let e = event("chatty@example.com", InboxPlacement::Primary);
        assert_eq!(classify(&e, &r, at(11, 59)), Ok(PriorityTier::Filtered));
        assert_eq!(
            classify(&e, &r, at(12, 0) + Duration::seconds(1)),
            Ok(PriorityTier::Regular)
        );
    }

    #[test]
    fn test_rule_changes_apply_on_next_call() {
        let e = event("new@example.com", InboxPlacement::Primary);
        let mut r = rules();
        assert_eq!(classify(&e, &r, at(9, 0)), Ok(PriorityTier::Regular));
        r.priority_senders.push("new@example.com".to_string());
        assert_eq!(classify(&e, &r, at(9, 0)), Ok(PriorityTier::Priority));
    }

    #[test]
    fn test_malformed_events_are_rejected() {
        let mut e = event("not-an-address", InboxPlacement::Primary);
        assert!(matches!(
            classify(&e, &rules(), at(9, 0)),
            Err(ClassificationError::MalformedSender { .. })
        ));

        e.sender = "a@b@c".to_string();
        assert!(classify(&e, &rules(), at(9, 0)).is_err());

        let missing_id = InboxEvent::new("  ", "a@b.c", "S", at(9, 0));
        assert_eq!(
            classify(&missing_id, &rules(), at(9, 0)),
            Err(ClassificationError::MissingId)
        );
    }

    #[test]
    fn test_ignore_rules_deserialize_from_toml() {
        let toml_src = r#"
            priority_senders = ["@family.org"]
            ignore_senders = [
                "@spam.example",
                { sender = "chatty@example.com", until = "2024-01-15T12:00:00+00:00" },
            ]
        "#;
        let parsed: FilterRules = toml::from_str(toml_src).unwrap();
        assert_eq!(parsed.priority_senders, vec!["@family.org".to_string()]);
        assert!(matches!(parsed.ignore_senders[0], IgnoreRule::Always(_)));
        assert!(matches!(parsed.ignore_senders[1], IgnoreRule::Until { .. }));
    }
}
