/// Session execution: interactive login, direct exec, or the setup-script loop
///
/// Each mode turns a [`SessionRequest`] into a [`GuestCommand`] with a
/// scrubbed environment and hands it to the configured [`Launcher`].
use crate::config::loader::EnterConfig;
use crate::config::types::{EnterError, Result, SessionMode, SessionOutcome, SessionRequest};
use crate::exec::launcher::{GuestCommand, Launcher};
use crate::identity::passwd::PasswdDb;
use crate::kernel::mount::resolve;
use crate::kernel::signal;
use crate::safety::trap::TrapStack;
use crate::utils::env_hygiene::EnvHygiene;
use log::{debug, info};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Guest directories searched for bare command names, in order
pub const GUEST_SEARCH_DIRS: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// Shell used to carry a login command through `su`
const LOGIN_COMMAND_SHELL: &str = "/bin/sh";

/// Single-quote `arg` for a POSIX shell.
///
/// Compatibility shim: `su -c` only accepts one command string, so argv has
/// to be flattened there. Everywhere else commands travel as argument vectors.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Look a bare program name up in the guest's sbin/bin directories.
///
/// Returns the guest-side path; the lookup itself never leaves the root.
pub fn find_in_guest(root: &Path, program: &str) -> Result<Option<PathBuf>> {
    for dir in GUEST_SEARCH_DIRS {
        let guest = Path::new(dir).join(program);
        let resolved = resolve::resolve(root, &guest)?;
        let executable = std::fs::metadata(resolved.host())
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if executable {
            return Ok(Some(guest));
        }
    }
    Ok(None)
}

/// Runs one session request against a prepared guest root
pub struct SessionExecutor {
    root: PathBuf,
    setup_script: PathBuf,
    hygiene: EnvHygiene,
    launcher: Box<dyn Launcher>,
}

impl SessionExecutor {
    pub fn new(root: PathBuf, config: &EnterConfig, launcher: Box<dyn Launcher>) -> Self {
        Self {
            root,
            setup_script: config.setup_script.clone(),
            hygiene: EnvHygiene::default(),
            launcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execute `request`. A non-zero guest exit is a value, not an error.
    pub fn run(&self, request: &SessionRequest, trap: &mut TrapStack) -> Result<SessionOutcome> {
        info!("Starting {} session in {}", request.mode, self.root.display());
        match request.mode {
            SessionMode::SetupScript => self.run_setup(trap),
            SessionMode::InteractiveLogin | SessionMode::DirectExec => {
                let command = self.build_command(request)?;
                self.launcher.launch(&command, trap)
            }
        }
    }

    /// Command for login and direct-exec modes
    pub fn build_command(&self, request: &SessionRequest) -> Result<GuestCommand> {
        let argv = match request.mode {
            SessionMode::InteractiveLogin => self.login_argv(request)?,
            SessionMode::DirectExec => self.exec_argv(&request.command)?,
            SessionMode::SetupScript => self.setup_argv(),
        };
        Ok(GuestCommand::new(Some(self.root.clone()), argv)?
            .with_env(self.hygiene.sanitize_environment()))
    }

    fn guest_program(&self, program: &str) -> Result<String> {
        if program.contains('/') {
            return Ok(program.to_string());
        }
        match find_in_guest(&self.root, program)? {
            Some(path) => Ok(path.to_string_lossy().into_owned()),
            None => Err(EnterError::Precondition(format!(
                "{} not found in chroot",
                program
            ))),
        }
    }

    fn login_argv(&self, request: &SessionRequest) -> Result<Vec<String>> {
        let passwd = PasswdDb::load(&self.root)?;
        let user = passwd.lookup(request.user.as_ref())?;
        let su = self.guest_program("su")?;
        debug!("Login target {} (uid {}, home {})", user.name, user.uid, user.home.display());

        if request.command.is_empty() {
            return Ok(vec![su, "-".to_string(), user.name.clone()]);
        }

        let quoted: Vec<String> = request.command.iter().map(|a| shell_quote(a)).collect();
        let script = format!(
            "export SHELL={}; exec {}",
            shell_quote(&user.shell.to_string_lossy()),
            quoted.join(" ")
        );
        Ok(vec![
            su,
            "-s".to_string(),
            LOGIN_COMMAND_SHELL.to_string(),
            "-c".to_string(),
            script,
            "-".to_string(),
            user.name.clone(),
        ])
    }

    fn exec_argv(&self, command: &[String]) -> Result<Vec<String>> {
        let Some((program, args)) = command.split_first() else {
            return Err(EnterError::Usage("direct exec requires a command".to_string()));
        };
        let mut argv = vec![self.guest_program(program)?];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }

    fn setup_argv(&self) -> Vec<String> {
        vec![
            LOGIN_COMMAND_SHELL.to_string(),
            "-e".to_string(),
            self.setup_script.to_string_lossy().into_owned(),
        ]
    }

    fn setup_script_present(&self) -> Result<bool> {
        Ok(resolve::resolve_host(&self.root, &self.setup_script)?.is_file())
    }

    /// Run the setup script until it deletes itself. Any failure is fatal.
    fn run_setup(&self, trap: &mut TrapStack) -> Result<SessionOutcome> {
        if !self.setup_script_present()? {
            return Err(EnterError::Precondition(format!(
                "Setup script {} not found in chroot",
                self.setup_script.display()
            )));
        }

        let command = GuestCommand::new(Some(self.root.clone()), self.setup_argv())?
            .with_env(self.hygiene.sanitize_environment());

        let mut pass = 0u32;
        loop {
            signal::check_interrupted()?;
            pass += 1;
            info!("Running setup script {} (pass {})", self.setup_script.display(), pass);

            match self.launcher.launch(&command, trap)? {
                SessionOutcome::Exited(0) => {}
                SessionOutcome::Exited(code) => {
                    return Err(EnterError::SetupScript(format!(
                        "{} failed with exit code {} on pass {}",
                        self.setup_script.display(),
                        code,
                        pass
                    )));
                }
                detached @ SessionOutcome::Detached { .. } => return Ok(detached),
            }

            if !self.setup_script_present()? {
                info!("Setup complete after {} passes", pass);
                return Ok(SessionOutcome::Exited(0));
            }
            debug!("Setup script still present, running it again");
        }
    }
}
