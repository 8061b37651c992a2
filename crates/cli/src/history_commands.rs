use std::sync::Arc;

use {
    anyhow::Result,
    clap::Subcommand,
    relay_common::{DestChannelId, SourceChannelId, SourceMessageId},
    relay_config::RelayConfig,
    relay_history::{Checkpoint, FailedForward, HistoryStore, Mapping},
};

#[derive(Subcommand)]
pub enum HistoryAction {
    /// List the last processed message of every source channel.
    Checkpoints,
    /// Show where a source message was delivered.
    Lookup {
        /// Source channel id.
        #[arg(long, allow_negative_numbers = true)]
        channel: SourceChannelId,
        /// Source message id.
        #[arg(long)]
        message: SourceMessageId,
        /// Only report the mapping for this destination channel.
        #[arg(long)]
        destination: Option<DestChannelId>,
    },
    /// List messages that could not be delivered, most recent first.
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Archive the current history file now (file backend only).
    Rotate,
}

pub async fn handle_history(config: &RelayConfig, action: HistoryAction, json: bool) -> Result<()> {
    let store = relay_history::open_store(config).await?;
    let lines = run(&store, action, json).await?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

async fn run(store: &Arc<dyn HistoryStore>, action: HistoryAction, json: bool) -> Result<Vec<String>> {
    match action {
        HistoryAction::Checkpoints => {
            let checkpoints = store.list_checkpoints().await?;
            if json {
                return Ok(vec![serde_json::to_string_pretty(&checkpoints)?]);
            }
            if checkpoints.is_empty() {
                return Ok(vec!["No checkpoints recorded.".into()]);
            }
            Ok(checkpoints.iter().map(checkpoint_line).collect())
        },
        HistoryAction::Lookup {
            channel,
            message,
            destination,
        } => {
            let mappings = match destination {
                Some(dest) => store
                    .lookup_destination(channel, message, dest)
                    .await?
                    .into_iter()
                    .collect(),
                None => store.mappings_for(channel, message).await?,
            };
            if json {
                return Ok(vec![serde_json::to_string_pretty(&mappings)?]);
            }
            if mappings.is_empty() {
                return Ok(vec![format!(
                    "Message {message} of channel {channel} was not forwarded."
                )]);
            }
            Ok(mappings.iter().map(mapping_line).collect())
        },
        HistoryAction::Failed { limit } => {
            let failed = store.list_failed_forwards(limit).await?;
            if json {
                return Ok(vec![serde_json::to_string_pretty(&failed)?]);
            }
            if failed.is_empty() {
                return Ok(vec!["No failed forwards.".into()]);
            }
            Ok(failed.iter().map(failed_line).collect())
        },
        HistoryAction::Rotate => {
            let rotated = store.rotate().await?;
            let line = if rotated {
                "History rotated."
            } else {
                "Nothing to rotate: the configured backend does not rotate."
            };
            Ok(vec![line.into()])
        },
    }
}

fn checkpoint_line(cp: &Checkpoint) -> String {
    format!(
        "{:>16}  {:>10}  {}",
        cp.source_channel_id,
        cp.last_processed_source_message_id,
        cp.last_processed_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

fn mapping_line(m: &Mapping) -> String {
    format!(
        "{}/{} -> {}/{} ({})",
        m.source_channel_id,
        m.source_message_id,
        m.destination_channel_id,
        m.destination_message_id,
        m.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

fn failed_line(f: &FailedForward) -> String {
    format!(
        "{} [{}] {}/{} -> {}: {}",
        f.at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        f.forwarder,
        f.source_channel_id,
        f.source_message_id,
        f.destination_channel_id,
        f.reason
    )
}
