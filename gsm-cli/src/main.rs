//! GSM CLI - command-line interface to the manager fleet
//!
//! This binary is both the operator front-end (send a message, start or
//! cancel a download, fetch instance config) and the entrypoint for the
//! long-lived manager processes (`gsm run <manager>`).
//!
//! # Architecture
//!
//! - `Cli` / `Commands`: argument parsing (clap)
//! - `CliRunner`: common setup (settings, logging, bus)
//! - `CliError`: centralized error handling with exit codes
//!
//! # Configuration
//!
//! All settings come from the environment (`MANAGER_TMPDIR`,
//! `SERVER_FILES_ROOT_DIR`, `STEAMCMD_*`, `SERVER_CONFIG_*`, ...); CLI
//! flags override the environment where both exist.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand, ValueEnum};
use error::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ManagerKind {
    /// downloadManager: game base files via the content tool
    Download,
    /// configManager: instance configuration via git
    Config,
    /// overlayManager: merged filesystem views
    Overlay,
    /// gameManager: the game processes
    Game,
    /// lifecycle coordinator for one instance (GAME_ID / INSTANCE_ID)
    Lifecycle,
}

#[derive(Parser)]
#[command(name = "gsm")]
#[command(version = gsm::VERSION)]
#[command(about = "Dedicated game server manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a raw message on a bus channel
    Send {
        /// Topic to publish on (dotted string)
        channel: String,
        /// Message payload; JSON if it parses, else sent as plain text
        message: String,
    },

    /// Download or update a game's base files
    DownloadGame {
        /// Game id (e.g. csgo)
        game: String,

        /// Remove the base files before downloading
        #[arg(long)]
        force: bool,

        /// Validate files after download
        #[arg(long)]
        validate: bool,

        /// Remove the base files before downloading (alias of --force)
        #[arg(long)]
        clean: bool,

        /// Reinstall the content tool first
        #[arg(long)]
        steamcmd_clean: bool,

        /// Steam username (default: anonymous login)
        #[arg(long)]
        username: Option<String>,

        /// Steam password
        #[arg(long)]
        password: Option<String>,

        /// Override the server files root directory
        #[arg(long)]
        root_directory: Option<String>,
    },

    /// List in-flight downloads
    ListDownloads,

    /// Cancel a running download
    CancelDownload {
        /// Game id of the download to cancel
        game: String,

        /// Remove the partial download directory afterwards
        #[arg(long)]
        cleanup: bool,
    },

    /// Fetch or update an instance's configuration repository
    DownloadGameConfig {
        /// Instance id ([A-Za-z0-9_-]+)
        instance_id: String,
        /// Repository URL (supports user@host:org/repo#branch and https://...#branch)
        repo_url: String,
        /// Layer identity (directory name of this config layer)
        layer_ident: String,

        /// Remove the checkout before cloning
        #[arg(long)]
        clean: bool,

        /// Override the server files root directory
        #[arg(long)]
        root_directory: Option<String>,
    },

    /// Run a manager process (long-lived)
    Run {
        /// Which manager to run
        #[arg(value_enum)]
        manager: ManagerKind,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Send { channel, message } => commands::send::run(channel, message).await,
        Commands::DownloadGame {
            game,
            force,
            validate,
            clean,
            steamcmd_clean,
            username,
            password,
            root_directory,
        } => {
            commands::download::run(commands::download::DownloadArgs {
                game,
                force,
                validate,
                clean,
                steamcmd_clean,
                username,
                password,
                root_directory,
            })
            .await
        }
        Commands::ListDownloads => commands::list::run().await,
        Commands::CancelDownload { game, cleanup } => {
            commands::cancel::run(game, cleanup).await
        }
        Commands::DownloadGameConfig {
            instance_id,
            repo_url,
            layer_ident,
            clean,
            root_directory,
        } => {
            commands::config_fetch::run(commands::config_fetch::ConfigFetchArgs {
                instance_id,
                repo_url,
                layer_ident,
                clean,
                root_directory,
            })
            .await
        }
        Commands::Run { manager } => commands::run::run(manager).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => e.exit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_download_game() {
        let cli = Cli::try_parse_from([
            "gsm",
            "download-game",
            "csgo",
            "--validate",
            "--steamcmd-clean",
        ])
        .unwrap();
        match cli.command {
            Commands::DownloadGame {
                game,
                validate,
                steamcmd_clean,
                force,
                username,
                ..
            } => {
                assert_eq!(game, "csgo");
                assert!(validate);
                assert!(steamcmd_clean);
                assert!(!force);
                assert!(username.is_none());
            }
            _ => panic!("wrong subcommand parsed"),
        }
    }

    #[test]
    fn test_parse_cancel_with_cleanup() {
        let cli =
            Cli::try_parse_from(["gsm", "cancel-download", "csgo", "--cleanup"]).unwrap();
        match cli.command {
            Commands::CancelDownload { game, cleanup } => {
                assert_eq!(game, "csgo");
                assert!(cleanup);
            }
            _ => panic!("wrong subcommand parsed"),
        }
    }

    #[test]
    fn test_parse_download_game_config() {
        let cli = Cli::try_parse_from([
            "gsm",
            "download-game-config",
            "main-1",
            "git@github.com:example/csgo-config#production",
            "common",
            "--clean",
        ])
        .unwrap();
        match cli.command {
            Commands::DownloadGameConfig {
                instance_id,
                repo_url,
                layer_ident,
                clean,
                root_directory,
            } => {
                assert_eq!(instance_id, "main-1");
                assert!(repo_url.ends_with("#production"));
                assert_eq!(layer_ident, "common");
                assert!(clean);
                assert!(root_directory.is_none());
            }
            _ => panic!("wrong subcommand parsed"),
        }
    }

    #[test]
    fn test_parse_run_manager() {
        let cli = Cli::try_parse_from(["gsm", "run", "download"]).unwrap();
        match cli.command {
            Commands::Run { manager } => assert_eq!(manager, ManagerKind::Download),
            _ => panic!("wrong subcommand parsed"),
        }
    }

    #[test]
    fn test_send_requires_channel_and_message() {
        assert!(Cli::try_parse_from(["gsm", "send", "only-channel"]).is_err());
        assert!(Cli::try_parse_from(["gsm", "send", "a.topic", "{}"]).is_ok());
    }
}
