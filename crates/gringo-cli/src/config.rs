use clap::{Parser, Subcommand};

/// CLI for gringo
#[derive(Parser, Debug)]
#[command(name = "gringo", version, about = "Local service supervisor")]
pub struct Cli {
    /// Log filter used when `RUST_LOG` is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start services in dependency order and stream their output
    Up {
        /// File path to the configuration file (TOML)
        #[arg(short, long)]
        file: Option<String>,

        /// Services to start, with their dependencies (all when empty)
        services: Vec<String>,
    },
    /// Probe every configured service once without starting anything
    Status {
        /// File path to the configuration file (TOML)
        #[arg(short, long)]
        file: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the first free local port at or above `--from`
    Port {
        #[arg(long, default_value_t = 8501)]
        from: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_up() {
        let cli = Cli::parse_from(["gringo", "up", "-f", "dev.toml", "api", "web"]);
        match cli.command {
            Commands::Up { file, services } => {
                assert_eq!(file.as_deref(), Some("dev.toml"));
                assert_eq!(services, vec!["api", "web"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn test_parse_port_default() {
        let cli = Cli::parse_from(["gringo", "--log-level", "debug", "port"]);
        assert!(matches!(cli.command, Commands::Port { from: 8501 }));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_parse_status_json() {
        let cli = Cli::parse_from(["gringo", "status", "--json"]);
        assert!(matches!(
            cli.command,
            Commands::Status {
                file: None,
                json: true
            }
        ));
    }
}
