use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::native;
use crate::scene_graph::{SceneObject, SceneRegistry};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON connection config; flags below override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a command server and apply its frames
    Connect {
        /// WebSocket URL of the command server
        #[arg(long)]
        url: Option<String>,

        /// Delay before each reconnect attempt, in milliseconds
        #[arg(long)]
        reconnect_timeout_ms: Option<u64>,

        /// Client name sent in the init handshake
        #[arg(long)]
        client: Option<String>,

        /// Directory relative GLTF paths are resolved against
        #[arg(long)]
        asset_root: Option<PathBuf>,

        /// Stop after this many seconds and print the scene
        #[arg(long, value_parser = parse_seconds)]
        duration: Option<Duration>,
    },
    /// Apply a newline-delimited file of captured frames to a fresh scene
    Replay {
        /// Capture file, one JSON frame per line
        input: PathBuf,

        /// Directory relative GLTF paths are resolved against
        #[arg(long)]
        asset_root: Option<PathBuf>,

        /// Seconds to wait for GLTF loads to finish
        #[arg(long, value_parser = parse_seconds, default_value = "10")]
        load_timeout: Duration,
    },
}

/// A non-negative, finite number of seconds.
fn parse_seconds(arg: &str) -> Result<Duration, String> {
    let seconds: f32 = arg.parse().map_err(|e| format!("'{}' is not a number: {}", arg, e))?;
    Duration::try_from_secs_f32(seconds).map_err(|e| format!("'{}' is not a valid duration: {}", arg, e))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Connect {
            url,
            reconnect_timeout_ms,
            client,
            asset_root,
            duration,
        } => {
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(timeout) = reconnect_timeout_ms {
                config.reconnect_timeout_ms = timeout;
            }
            if let Some(client) = client {
                config.client_name = client;
            }
            if asset_root.is_some() {
                config.asset_root = asset_root;
            }

            let registry = native::run(config, duration)?;
            print_scene(&registry);
        }
        Commands::Replay {
            input,
            asset_root,
            load_timeout,
        } => {
            let asset_root = asset_root.or(config.asset_root);
            let mut registry = SceneRegistry::new();
            let summary = native::replay(
                &input,
                asset_root.as_deref(),
                &mut registry,
                load_timeout,
            )?;
            println!(
                "Replayed {} frames ({} unparseable, {} failed commands)",
                summary.frames, summary.parse_errors, summary.command_errors
            );
            print_scene(&registry);
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ConnectionConfig> {
    let Some(path) = path else {
        return Ok(ConnectionConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    ConnectionConfig::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
}

fn print_scene(registry: &SceneRegistry) {
    for name in registry.names() {
        let Some(id) = registry.id_of(name) else {
            continue;
        };
        let Some(object) = registry.get(id) else {
            continue;
        };
        let placement = match object.node() {
            Some(node) if registry.is_in_scene(id) => format!("in scene at {:?}", node.position.to_array()),
            Some(_) => "detached".to_string(),
            None => String::new(),
        };
        let detail = match object {
            SceneObject::Geometry(g) => format!("{} vertices, size {:?}", g.vertex_count(), g.bounds.size()),
            SceneObject::AnimationClip(c) => format!("{} tracks, {:.2}s", c.tracks.len(), c.duration),
            _ => String::new(),
        };
        println!("{:<24} {:<14} {} {}", name, format!("{:?}", object.kind()), placement, detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_replay() {
        let cli = Cli::try_parse_from(["vizlink", "replay", "session.jsonl", "--load-timeout", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Replay { load_timeout, .. } if load_timeout == Duration::from_secs(2)));

        let cli = Cli::try_parse_from(["vizlink", "replay", "session.jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Replay { load_timeout, .. } if load_timeout == Duration::from_secs(10)));
    }

    #[test]
    fn test_rejects_invalid_seconds() {
        for bad in ["-1", "NaN", "inf", "soon"] {
            assert!(Cli::try_parse_from(["vizlink", "replay", "session.jsonl", "--load-timeout", bad]).is_err());
            assert!(Cli::try_parse_from(["vizlink", "connect", "--duration", bad]).is_err());
        }
        let cli = Cli::try_parse_from(["vizlink", "connect", "--duration", "1.5"]).unwrap();
        assert!(matches!(cli.command, Commands::Connect { duration: Some(d), .. } if d == Duration::from_millis(1500)));
    }

    #[test]
    fn test_missing_config_is_default() {
        assert_eq!(load_config(None).unwrap(), ConnectionConfig::default());
    }
}
