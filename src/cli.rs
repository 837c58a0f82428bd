use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "share",
    about = "Upload files to cloud storage and get a shareable link"
)]
pub struct Args {
    /// File to upload and optional provider label, in either order
    #[arg(
        value_name = "FILE|PROVIDER",
        help = "File to upload and optionally a provider label to use instead of the active one"
    )]
    pub args: Vec<String>,

    /// Override the config file location
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to config file (default: ~/.config/sharecmd/config.json)"
    )]
    pub config: Option<PathBuf>,

    /// Launch the interactive provider setup
    #[arg(long, short = 's', help = "Launch interactive setup")]
    pub setup: bool,

    /// Force interactive provider selection for this invocation
    #[arg(long, short = 'p', help = "Select provider for this upload")]
    pub select: bool,

    /// Print version and exit
    #[arg(long, short = 'v', help = "Print version and exit")]
    pub version: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positionals_and_flags() {
        let args = Args::parse_from(["share", "-p", "report.pdf", "work"]);
        assert!(args.select);
        assert!(!args.setup);
        assert_eq!(args.args, vec!["report.pdf", "work"]);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_config_override() {
        let args = Args::parse_from(["share", "--config", "/tmp/c.json", "file.bin"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
    }

    #[test]
    fn test_no_args_is_valid() {
        let args = Args::parse_from(["share", "--setup"]);
        assert!(args.setup);
        assert!(args.args.is_empty());
    }
}
