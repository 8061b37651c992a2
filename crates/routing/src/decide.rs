use {
    relay_common::{CanonicalMessage, DestChannelId},
    serde::Serialize,
    tracing::debug,
};

use crate::rule::ForwardingRule;

/// Who to mention on the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Mentions {
    /// Append `@everyone`.
    pub everyone: bool,
    /// Role names from matching mention overrides, in config order.
    pub roles: Vec<String>,
}

impl Mentions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.everyone && self.roles.is_empty()
    }
}

/// Why a forwarder did not take a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterReason {
    /// An excluded hashtag was present.
    Excluded { tag: String },
    /// `forward_everything` is off and no forward hashtag matched.
    NoMatchingHashtag,
}

/// Outcome of one rule for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub forwarder: String,
    pub destination_channel_id: DestChannelId,
    pub forward: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered: Option<FilterReason>,
    pub mentions: Mentions,
    pub strip_links: bool,
    pub as_embed: bool,
}

/// One decision per rule, in rule order. Deterministic and side-effect free.
#[must_use]
pub fn decide(msg: &CanonicalMessage, rules: &[ForwardingRule]) -> Vec<RoutingDecision> {
    rules.iter().map(|rule| decide_one(msg, rule)).collect()
}

fn decide_one(msg: &CanonicalMessage, rule: &ForwardingRule) -> RoutingDecision {
    let filtered = filter_reason(msg, rule);
    let forward = filtered.is_none();
    if let Some(reason) = &filtered {
        debug!(
            forwarder = %rule.name,
            source_channel = msg.source_channel_id,
            message_id = msg.source_message_id,
            ?reason,
            "message filtered"
        );
    }
    RoutingDecision {
        forwarder: rule.name.clone(),
        destination_channel_id: rule.destination_channel_id,
        forward,
        filtered,
        mentions: if forward {
            mentions_for(msg, rule)
        } else {
            Mentions::default()
        },
        strip_links: rule.strip_links,
        as_embed: rule.send_as_embed,
    }
}

fn filter_reason(msg: &CanonicalMessage, rule: &ForwardingRule) -> Option<FilterReason> {
    if let Some(tag) = rule
        .excluded_hashtags
        .iter()
        .find(|t| msg.hashtags.contains(*t))
    {
        return Some(FilterReason::Excluded { tag: tag.clone() });
    }
    if rule.forward_everything || rule.forward_hashtags.iter().any(|t| msg.hashtags.contains(&t.tag))
    {
        return None;
    }
    Some(FilterReason::NoMatchingHashtag)
}

/// Mentions `rule` asks for on `msg`, ignoring whether it would be forwarded.
///
/// Edits use this directly since they bypass the hashtag filter.
#[must_use]
pub fn mentions_for(msg: &CanonicalMessage, rule: &ForwardingRule) -> Mentions {
    let lowered_text = msg.text.to_lowercase();
    let mut roles: Vec<String> = Vec::new();
    let mut overridden = false;
    for ov in &rule.mention_overrides {
        let matched = if ov.is_hashtag() {
            msg.hashtags.contains(&ov.tag)
        } else {
            !ov.tag.is_empty() && lowered_text.contains(&ov.tag)
        };
        if matched {
            overridden = true;
            for role in &ov.roles {
                if !roles.contains(role) {
                    roles.push(role.clone());
                }
            }
        }
    }
    if overridden {
        return Mentions {
            everyone: false,
            roles,
        };
    }

    // Matched forward hashtags decide @everyone on their own.
    let mut matched = rule
        .forward_hashtags
        .iter()
        .filter(|t| msg.hashtags.contains(&t.tag))
        .peekable();
    let everyone = if matched.peek().is_some() {
        matched.any(|t| t.override_mention_everyone)
    } else {
        rule.mention_everyone
    };
    Mentions { everyone, roles }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::rule::{ForwardTag, MentionOverride},
        chrono::DateTime,
        relay_common::{EventKind, MessageOrigin},
        rstest::rstest,
        std::collections::BTreeSet,
    };

    fn msg(text: &str, tags: &[&str]) -> CanonicalMessage {
        CanonicalMessage {
            source_channel_id: -1001,
            source_message_id: 1,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            text: text.into(),
            hashtags: tags.iter().map(|t| t.to_string()).collect(),
            links: vec![],
            media_refs: vec![],
            reply_to_source_id: None,
            event_kind: EventKind::Create,
            origin: MessageOrigin::Live,
        }
    }

    fn rule() -> ForwardingRule {
        ForwardingRule {
            name: "news".into(),
            source_channel_id: -1001,
            destination_channel_id: 42,
            strip_links: false,
            send_as_embed: true,
            mention_everyone: false,
            forward_everything: true,
            forward_hashtags: vec![],
            excluded_hashtags: BTreeSet::new(),
            mention_overrides: vec![],
        }
    }

    fn tag(name: &str, everyone: bool) -> ForwardTag {
        ForwardTag {
            tag: name.into(),
            override_mention_everyone: everyone,
        }
    }

    #[test]
    fn excluded_beats_forward_everything() {
        let mut r = rule();
        r.excluded_hashtags.insert("#sponsored".into());
        let d = &decide(&msg("buy now #sponsored", &["#sponsored"]), &[r])[0];
        assert!(!d.forward);
        assert_eq!(
            d.filtered,
            Some(FilterReason::Excluded {
                tag: "#sponsored".into()
            })
        );
        assert!(d.mentions.is_empty());
    }

    #[rstest]
    #[case(&["#a", "#b"], false)]
    #[case(&["#a"], true)]
    #[case(&["#b"], false)]
    #[case(&[], false)]
    #[case(&["#c"], false)]
    fn forward_and_exclude_lists(#[case] tags: &[&str], #[case] forwarded: bool) {
        let mut r = rule();
        r.forward_everything = false;
        r.forward_hashtags = vec![tag("#a", false)];
        r.excluded_hashtags.insert("#b".into());
        let d = &decide(&msg("x", tags), &[r])[0];
        assert_eq!(d.forward, forwarded);
    }

    #[test]
    fn one_decision_per_rule_in_order() {
        let mut second = rule();
        second.name = "deals".into();
        second.destination_channel_id = 43;
        second.forward_everything = false;
        second.forward_hashtags = vec![tag("#deal", false)];
        let decisions = decide(&msg("hello", &[]), &[rule(), second]);
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].forward);
        assert!(!decisions[1].forward);
        assert_eq!(decisions[1].filtered, Some(FilterReason::NoMatchingHashtag));
        assert_eq!(decisions[1].destination_channel_id, 43);
    }

    #[rstest]
    // rule.mention_everyone, forward_everything, tag override flag, expected everyone
    #[case(false, true, false, false)]
    #[case(false, true, true, true)]
    #[case(true, true, false, false)]
    #[case(true, false, false, false)]
    #[case(true, false, true, true)]
    #[case(false, false, true, true)]
    fn matched_tag_decides_everyone(
        #[case] rule_everyone: bool,
        #[case] everything: bool,
        #[case] tag_flag: bool,
        #[case] want: bool,
    ) {
        let mut r = rule();
        r.mention_everyone = rule_everyone;
        r.forward_everything = everything;
        r.forward_hashtags = vec![tag("#alert", tag_flag)];
        let d = &decide(&msg("fire #alert", &["#alert"]), &[r])[0];
        assert!(d.forward);
        assert_eq!(d.mentions.everyone, want);
    }

    #[rstest]
    #[case(false, false)]
    #[case(true, true)]
    fn unmatched_tags_keep_rule_default(#[case] rule_everyone: bool, #[case] want: bool) {
        let mut r = rule();
        r.mention_everyone = rule_everyone;
        r.forward_hashtags = vec![tag("#alert", true)];
        let d = &decide(&msg("quiet day", &[]), &[r])[0];
        assert!(d.forward);
        assert_eq!(d.mentions.everyone, want);
    }

    #[test]
    fn any_matched_tag_can_ask_for_everyone() {
        let mut r = rule();
        r.mention_everyone = true;
        r.forward_everything = false;
        r.forward_hashtags = vec![tag("#a", false), tag("#b", true)];
        assert!(!mentions_for(&msg("x #a", &["#a"]), &r).everyone);
        assert!(mentions_for(&msg("x #a #b", &["#a", "#b"]), &r).everyone);
    }

    #[test]
    fn override_replaces_everyone_default() {
        let mut r = rule();
        r.forward_everything = false;
        r.forward_hashtags = vec![tag("#alert", true)];
        r.mention_overrides = vec![MentionOverride {
            tag: "#alert".into(),
            roles: vec!["Ops".into(), "OnCall".into()],
        }];
        let d = &decide(&msg("fire #alert", &["#alert"]), &[r])[0];
        assert!(d.forward);
        assert_eq!(d.mentions, Mentions {
            everyone: false,
            roles: vec!["Ops".into(), "OnCall".into()],
        });
    }

    #[test]
    fn plain_text_override_matches_substring() {
        let mut r = rule();
        r.mention_everyone = true;
        r.mention_overrides = vec![
            MentionOverride {
                tag: "outage".into(),
                roles: vec!["Ops".into()],
            },
            MentionOverride {
                tag: "#never".into(),
                roles: vec!["Nobody".into()],
            },
            MentionOverride {
                tag: "database".into(),
                roles: vec!["Ops".into(), "DBA".into()],
            },
        ];
        let m = mentions_for(&msg("Major OUTAGE in the Database tier", &[]), &r);
        assert_eq!(m.roles, vec!["Ops".to_string(), "DBA".to_string()]);
        assert!(!m.everyone);

        let m = mentions_for(&msg("all good", &[]), &r);
        assert!(m.everyone);
        assert!(m.roles.is_empty());
    }
}
