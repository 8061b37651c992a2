//! Per-forwarder routing decisions.
//!
//! Precedence for each forwarder bound to the message's source channel:
//! 1. Any excluded hashtag present → not forwarded (hard veto)
//! 2. `forward_everything`, or any forward hashtag present → forwarded
//! 3. Otherwise → not forwarded
//!
//! Mentions are decided alongside: a matching mention override replaces the
//! `@everyone` default with its own role set.

pub mod decide;
pub mod hashtags;
pub mod rule;

pub use {
    decide::{FilterReason, Mentions, RoutingDecision, decide, mentions_for},
    hashtags::extract_hashtags,
    rule::{ForwardTag, ForwardingRule, MentionOverride, RuleSet},
};
