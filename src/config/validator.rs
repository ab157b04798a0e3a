// Request and environment validation.
// Usage problems are reported before anything on the host is touched;
// precondition problems are reported before the first mount.

use crate::config::types::{ChrootEnvironment, EnterError, Result, SessionMode, SessionRequest};
use std::path::Path;

/// Reject incompatible flag combinations
pub fn validate_request(request: &SessionRequest) -> Result<()> {
    match request.mode {
        SessionMode::DirectExec => {
            if request.user.is_some() {
                return Err(EnterError::Usage(
                    "a target user cannot be combined with direct exec".to_string(),
                ));
            }
            if request.command.is_empty() {
                return Err(EnterError::Usage(
                    "direct exec requires a command".to_string(),
                ));
            }
        }
        SessionMode::SetupScript => {
            if !request.command.is_empty() {
                return Err(EnterError::Usage(
                    "the setup script mode does not take a command".to_string(),
                ));
            }
            if request.user.is_some() {
                return Err(EnterError::Usage(
                    "the setup script always runs as root".to_string(),
                ));
            }
            if request.background {
                return Err(EnterError::Usage(
                    "the setup script cannot run in the background".to_string(),
                ));
            }
        }
        SessionMode::InteractiveLogin => {}
    }

    if request.background && request.command.is_empty() {
        return Err(EnterError::Usage(
            "background execution requires a command".to_string(),
        ));
    }

    Ok(())
}

/// Entering a chroot needs effective root
pub fn validate_privileges() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(EnterError::Precondition(
            "guestroot must be run as root".to_string(),
        ));
    }
    Ok(())
}

/// The root must exist, be a directory, and look like a Linux userland
pub fn validate_environment(env: &ChrootEnvironment) -> Result<()> {
    let root = &env.root_path;

    if !root.is_absolute() {
        return Err(EnterError::Precondition(format!(
            "chroot {} resolved to a relative path: {}",
            env.name,
            root.display()
        )));
    }
    if !root.is_dir() {
        return Err(EnterError::Precondition(format!(
            "chroot {} not found at {}",
            env.name,
            root.display()
        )));
    }
    if !root.join("etc").is_dir() {
        return Err(EnterError::Precondition(format!(
            "chroot {} at {} is invalid: missing /etc",
            env.name,
            root.display()
        )));
    }

    Ok(())
}

/// Chroot names become path components; refuse anything that could walk out
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if bad || Path::new(name).components().count() != 1 {
        return Err(EnterError::Usage(format!("invalid chroot name: {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::UserSpec;
    use std::path::PathBuf;

    #[test]
    fn test_exec_with_user_is_usage_error() {
        let mut req = SessionRequest::exec(vec!["ls".to_string()]);
        req.user = Some(UserSpec::Uid(1000));
        assert!(matches!(validate_request(&req), Err(EnterError::Usage(_))));
    }

    #[test]
    fn test_setup_with_command_is_usage_error() {
        let mut req = SessionRequest::setup();
        req.command = vec!["true".to_string()];
        assert!(matches!(validate_request(&req), Err(EnterError::Usage(_))));
    }

    #[test]
    fn test_background_needs_command() {
        let req = SessionRequest::login(None, Vec::new()).in_background();
        assert!(matches!(validate_request(&req), Err(EnterError::Usage(_))));

        let req = SessionRequest::login(None, vec!["xiwi".to_string()]).in_background();
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_plain_login_is_valid() {
        assert!(validate_request(&SessionRequest::login(None, Vec::new())).is_ok());
        assert!(validate_request(&SessionRequest::setup()).is_ok());
    }

    #[test]
    fn test_environment_checks() {
        let dir = tempfile::tempdir().unwrap();
        let env = ChrootEnvironment {
            name: "jammy".to_string(),
            root_path: dir.path().to_path_buf(),
        };
        assert!(matches!(
            validate_environment(&env),
            Err(EnterError::Precondition(_))
        ));

        std::fs::create_dir(dir.path().join("etc")).unwrap();
        assert!(validate_environment(&env).is_ok());

        let missing = ChrootEnvironment {
            name: "gone".to_string(),
            root_path: PathBuf::from("/nonexistent/guestroot/gone"),
        };
        assert!(validate_environment(&missing).is_err());
    }

    #[test]
    fn test_names() {
        assert!(validate_name("jammy").is_ok());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
    }
}
