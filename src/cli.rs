use crate::config::loader::EnterConfig;
use crate::config::types::{EnterError, SessionOutcome, SessionRequest, UserSpec};
use crate::config::validator::{validate_privileges, validate_request};
use crate::core::helpers::{create_root_locator, default_chroot_name};
use crate::core::session::Session;
use crate::exec::launcher::{BackgroundExecutor, ForegroundExecutor, Launcher};
use crate::kernel::signal;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "enter-chroot",
    author,
    version,
    about = "Enter a chroot that shares the host's kernel, devices and services",
    long_about = None
)]
pub struct Cli {
    /// Fork and run the command in the background
    #[arg(short = 'b', long)]
    pub background: bool,

    /// Directory holding the chroots
    #[arg(short = 'c', long = "chroots", value_name = "DIR")]
    pub chroots_dir: Option<PathBuf>,

    /// Chroot to enter (default: the first one found)
    #[arg(short = 'n', long, value_name = "NAME")]
    pub name: Option<String>,

    /// Log in as USER (name or uid) instead of the first regular user
    #[arg(short = 'u', long, value_name = "USER")]
    pub user: Option<String>,

    /// Run the command directly as root, without a login
    #[arg(short = 'x', long = "exec", conflicts_with_all = ["setup", "login"])]
    pub exec: bool,

    /// Run the chroot's setup script until it completes
    #[arg(long, conflicts_with = "login")]
    pub setup: bool,

    /// Run the command through a login (the default)
    #[arg(short = 'l', long)]
    pub login: bool,

    /// Leave the chroot mounted on exit
    #[arg(long)]
    pub no_unmount: bool,

    /// Configuration file (default: /etc/guestroot/config.json when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Command to run inside the chroot
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Turn flags into a validated session request. Nothing is touched yet.
    pub fn session_request(&self) -> crate::config::types::Result<SessionRequest> {
        let mut request = if self.setup {
            let mut request = SessionRequest::setup();
            request.command = self.command.clone();
            request
        } else if self.exec {
            SessionRequest::exec(self.command.clone())
        } else {
            SessionRequest::login(None, self.command.clone())
        };
        request.user = self.user.as_deref().map(UserSpec::parse);
        request.background = self.background;

        validate_request(&request)?;
        Ok(request)
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init()
        .context("Failed to initialize logging")
}

fn execute(cli: &Cli) -> crate::config::types::Result<SessionOutcome> {
    let request = cli.session_request()?;

    let mut config = EnterConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.chroots_dir {
        config.chroots_dir = dir.clone();
    }
    if cli.no_unmount {
        config.no_unmount = true;
    }

    validate_privileges()?;
    signal::install_handlers()?;

    let name = match &cli.name {
        Some(name) => name.clone(),
        None => default_chroot_name(&config.chroots_dir)?,
    };
    let locator = create_root_locator(&config);
    log::debug!("Locating chroot {} with {} locator", name, locator.locator_name());
    let env = locator.locate(&name)?;

    let launcher: Box<dyn Launcher> = if request.background {
        Box::new(BackgroundExecutor::capture_stdin()?)
    } else {
        Box::new(ForegroundExecutor)
    };

    Session::new(config, env)?
        .arm_traps()?
        .prepare()?
        .launch(&request, launcher)
}

/// Binary entry point; exits with the guest's code or the error's category code
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let code = match execute(&cli) {
        Ok(SessionOutcome::Detached { pid }) => {
            log::info!("Guest command running in the background (pid {})", pid);
            0
        }
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("enter-chroot: {}", e);
            if matches!(e, EnterError::Usage(_)) {
                eprintln!("Try 'enter-chroot --help' for more information.");
            }
            e.exit_code()
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SessionMode;

    #[test]
    fn test_second_logger_init_is_reported() {
        let _ = init_logging(0);
        let err = init_logging(2).unwrap_err();
        assert!(err.to_string().contains("logging"));
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("enter-chroot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_is_login_with_command_passthrough() {
        let cli = parse(&["-n", "sid", "ls", "-la"]);
        let request = cli.session_request().unwrap();
        assert_eq!(request.mode, SessionMode::InteractiveLogin);
        assert_eq!(request.command, vec!["ls", "-la"]);
        assert_eq!(cli.name.as_deref(), Some("sid"));
    }

    #[test]
    fn test_exec_and_user_is_usage_error() {
        let cli = parse(&["-x", "-u", "alice", "apt-get", "update"]);
        assert!(matches!(cli.session_request(), Err(EnterError::Usage(_))));
    }

    #[test]
    fn test_setup_with_command_is_usage_error() {
        let cli = parse(&["--setup", "true"]);
        assert!(matches!(cli.session_request(), Err(EnterError::Usage(_))));
        assert_eq!(
            parse(&["--setup"]).session_request().unwrap().mode,
            SessionMode::SetupScript
        );
    }

    #[test]
    fn test_background_without_command_is_usage_error() {
        let cli = parse(&["-b"]);
        assert!(matches!(cli.session_request(), Err(EnterError::Usage(_))));
        assert!(parse(&["-b", "xiwi", "startxfce4"]).session_request().unwrap().background);
    }

    #[test]
    fn test_exec_conflicts_with_setup_at_parse_time() {
        let err = Cli::try_parse_from(["enter-chroot", "-x", "--setup"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_numeric_user_is_uid() {
        let request = parse(&["-u", "1001"]).session_request().unwrap();
        assert_eq!(request.user, Some(UserSpec::Uid(1001)));
    }

    #[test]
    fn test_verbosity_counts() {
        assert_eq!(parse(&["-vv"]).verbose, 2);
    }
}
