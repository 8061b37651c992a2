use std::collections::{BTreeMap, BTreeSet};

use {
    relay_common::{DestChannelId, SourceChannelId},
    relay_config::{ForwarderConfig, RelayConfig},
};

use crate::hashtags::normalize_tag;

/// A forward hashtag, lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTag {
    pub tag: String,
    pub override_mention_everyone: bool,
}

/// Roles mentioned when `tag` matches.
///
/// `tag` is lower-cased. A leading `#` matches message hashtags; anything
/// else matches as a substring of the lower-cased message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionOverride {
    pub tag: String,
    pub roles: Vec<String>,
}

impl MentionOverride {
    #[must_use]
    pub fn is_hashtag(&self) -> bool {
        self.tag.starts_with('#')
    }
}

/// One source→destination forwarding rule, read-only after start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub name: String,
    pub source_channel_id: SourceChannelId,
    pub destination_channel_id: DestChannelId,
    pub strip_links: bool,
    pub send_as_embed: bool,
    pub mention_everyone: bool,
    pub forward_everything: bool,
    pub forward_hashtags: Vec<ForwardTag>,
    pub excluded_hashtags: BTreeSet<String>,
    pub mention_overrides: Vec<MentionOverride>,
}

impl ForwardingRule {
    #[must_use]
    pub fn from_config(cfg: &ForwarderConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            source_channel_id: cfg.source_channel_id,
            destination_channel_id: cfg.destination_channel_id,
            strip_links: cfg.strip_links,
            send_as_embed: cfg.send_as_embed,
            mention_everyone: cfg.mention_everyone,
            forward_everything: cfg.forward_everything,
            forward_hashtags: cfg
                .forward_hashtags
                .iter()
                .map(|t| ForwardTag {
                    tag: normalize_tag(&t.name),
                    override_mention_everyone: t.override_mention_everyone,
                })
                .collect(),
            excluded_hashtags: cfg
                .excluded_hashtags
                .iter()
                .map(|t| normalize_tag(&t.name))
                .collect(),
            mention_overrides: cfg
                .mention_overrides
                .iter()
                .map(|o| MentionOverride {
                    tag: normalize_tag(&o.tag),
                    roles: o.roles.clone(),
                })
                .collect(),
        }
    }
}

/// All rules, grouped by source channel in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    by_channel: BTreeMap<SourceChannelId, Vec<ForwardingRule>>,
}

impl RuleSet {
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = ForwardingRule>) -> Self {
        let mut by_channel: BTreeMap<SourceChannelId, Vec<ForwardingRule>> = BTreeMap::new();
        for rule in rules {
            by_channel
                .entry(rule.source_channel_id)
                .or_default()
                .push(rule);
        }
        Self { by_channel }
    }

    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.forwarders.iter().map(ForwardingRule::from_config))
    }

    /// Rules bound to `channel`; empty when the channel is unhandled.
    #[must_use]
    pub fn rules_for(&self, channel: SourceChannelId) -> &[ForwardingRule] {
        self.by_channel.get(&channel).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_bound(&self, channel: SourceChannelId) -> bool {
        self.by_channel.contains_key(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = SourceChannelId> + '_ {
        self.by_channel.keys().copied()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        relay_config::{HashtagConfig, MentionOverrideConfig},
    };

    #[test]
    fn config_tags_are_lowercased() {
        let mut cfg = ForwarderConfig::new("news", -1, 7);
        cfg.forward_hashtags = vec![HashtagConfig {
            name: "#Deal".into(),
            override_mention_everyone: true,
        }];
        cfg.excluded_hashtags = vec![HashtagConfig {
            name: " #Sponsored".into(),
            override_mention_everyone: false,
        }];
        cfg.mention_overrides = vec![MentionOverrideConfig {
            tag: "URGENT".into(),
            roles: vec!["Ops".into()],
        }];

        let rule = ForwardingRule::from_config(&cfg);
        assert_eq!(rule.forward_hashtags[0].tag, "#deal");
        assert!(rule.excluded_hashtags.contains("#sponsored"));
        assert_eq!(rule.mention_overrides[0].tag, "urgent");
        assert!(!rule.mention_overrides[0].is_hashtag());
    }

    #[test]
    fn rule_set_groups_by_channel() {
        let config = RelayConfig {
            forwarders: vec![
                ForwarderConfig::new("a", 1, 10),
                ForwarderConfig::new("b", 2, 20),
                ForwarderConfig::new("c", 1, 30),
            ],
            ..Default::default()
        };
        let rules = RuleSet::from_config(&config);
        let names: Vec<_> = rules.rules_for(1).iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(rules.rules_for(3).is_empty());
        assert!(!rules.is_bound(3));
        assert_eq!(rules.channels().collect::<Vec<_>>(), vec![1, 2]);
        let total: usize = rules.channels().map(|c| rules.rules_for(c).len()).sum();
        assert_eq!(total, 3);
    }
}
