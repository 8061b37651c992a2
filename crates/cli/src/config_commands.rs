use std::path::Path;

use {
    anyhow::Result,
    relay_config::validate::{self, Severity, ValidationResult},
    relay_routing::{ForwardingRule, RuleSet},
};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Validate the config file and print diagnostics. Exits with status 1 when
/// any error was found.
pub fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate::validate(path);

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found.\n");
    }

    let shown = print_diagnostics(&result, verbose);

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    if verbose && let Some(ref path) = result.config_path {
        let config = relay_config::load_config(path)?;
        let rules = RuleSet::from_config(&config);
        eprintln!();
        for line in route_summary(&rules) {
            eprintln!("{line}");
        }
    }
    Ok(())
}

fn print_diagnostics(result: &ValidationResult, verbose: bool) -> usize {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }
    shown
}

/// One line per source channel followed by its forwarders.
fn route_summary(rules: &RuleSet) -> Vec<String> {
    let mut lines = Vec::new();
    for channel in rules.channels() {
        lines.push(format!("{BOLD}source {channel}{RESET}"));
        for rule in rules.rules_for(channel) {
            lines.push(format!("  {}", describe(rule)));
        }
    }
    if lines.is_empty() {
        lines.push("No forwarders configured.".into());
    }
    lines
}

fn describe(rule: &ForwardingRule) -> String {
    let selection = if rule.forward_everything {
        "everything".to_string()
    } else {
        rule.forward_hashtags
            .iter()
            .map(|t| t.tag.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };
    let mut line = format!(
        "{} -> {} [{selection}]",
        rule.name, rule.destination_channel_id
    );
    if !rule.excluded_hashtags.is_empty() {
        let excluded: Vec<&str> = rule.excluded_hashtags.iter().map(String::as_str).collect();
        line.push_str(&format!(" except {}", excluded.join(" ")));
    }
    if rule.mention_everyone {
        line.push_str(" @everyone");
    }
    if rule.strip_links {
        line.push_str(" strip-links");
    }
    line
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        relay_config::{ForwarderConfig, HashtagConfig, RelayConfig},
    };

    #[test]
    fn summary_groups_forwarders_by_source() {
        let mut deals = ForwarderConfig::new("deals", -1001, 7);
        deals.forward_everything = false;
        deals.forward_hashtags = vec![HashtagConfig {
            name: "#Deal".into(),
            override_mention_everyone: true,
        }];
        let config = RelayConfig {
            forwarders: vec![
                ForwarderConfig::new("news", -1001, 42),
                deals,
                ForwarderConfig::new("other", -2002, 9),
            ],
            ..Default::default()
        };
        let lines = route_summary(&RuleSet::from_config(&config));
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("source -2002"));
        assert_eq!(lines[1], "  other -> 9 [everything]");
        assert!(lines[2].contains("source -1001"));
        assert_eq!(lines[3], "  news -> 42 [everything]");
        assert_eq!(lines[4], "  deals -> 7 [#deal]");
    }

    #[test]
    fn empty_summary() {
        assert_eq!(route_summary(&RuleSet::default()), vec![
            "No forwarders configured.".to_string()
        ]);
    }
}
