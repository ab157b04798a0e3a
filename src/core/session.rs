//! Type-state entry orchestration.
//!
//! A session moves through a fixed sequence so that teardown is always
//! registered before the first mutation:
//!
//! Fresh -> Armed (cleanup trap registered) -> Prepared (mounts applied) -> launch
//!
//! Each step consumes the prior state. Only `Session<Prepared>` can launch.
//! The trap guard travels with the session; dropping it at any step (error,
//! interruption, normal return) fires the cleanup actions exactly once.

use crate::config::loader::EnterConfig;
use crate::config::types::{ChrootEnvironment, Result, SessionOutcome, SessionRequest};
use crate::config::validator::validate_environment;
use crate::core::services::{write_marker, GuestServices};
use crate::exec::launcher::{ForegroundExecutor, Launcher};
use crate::exec::session::SessionExecutor;
use crate::identity::groups::GroupIdReconciler;
use crate::kernel::mount::plan::{apply_plan, kernel_release, standard_plan};
use crate::kernel::mount::{KernelMounts, MountBackend, MountOperator};
use crate::kernel::signal;
use crate::kernel::terminal::TerminalState;
use crate::safety::teardown::{Teardown, TeardownStrategy};
use crate::safety::trap::{TrapGuard, TrapStack};
use log::{info, warn};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Host group file the guest's hardware groups are aligned with
pub const HOST_GROUP_FILE: &str = "/etc/group";

/// Type-state marker: validated, nothing registered or mounted
pub struct Fresh;

/// Type-state marker: cleanup actions registered
pub struct Armed;

/// Type-state marker: filesystem view built, ready to launch
pub struct Prepared;

/// One entry into a chroot
pub struct Session<S> {
    id: Uuid,
    config: EnterConfig,
    env: ChrootEnvironment,
    operator: MountOperator,
    guard: TrapGuard,
    _state: PhantomData<S>,
}

impl<S> Session<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn environment(&self) -> &ChrootEnvironment {
        &self.env
    }

    pub fn operator(&self) -> &MountOperator {
        &self.operator
    }

    pub fn trap(&self) -> &TrapStack {
        self.guard.stack()
    }

    fn into_state<T>(self) -> Session<T> {
        Session {
            id: self.id,
            config: self.config,
            env: self.env,
            operator: self.operator,
            guard: self.guard,
            _state: PhantomData,
        }
    }
}

impl Session<Fresh> {
    /// Session over real kernel mounts
    pub fn new(config: EnterConfig, env: ChrootEnvironment) -> Result<Self> {
        Self::with_backend(config, env, Arc::new(KernelMounts))
    }

    pub fn with_backend(
        config: EnterConfig,
        env: ChrootEnvironment,
        backend: Arc<dyn MountBackend>,
    ) -> Result<Self> {
        validate_environment(&env)?;
        let id = Uuid::new_v4();
        info!(
            "Session {} entering chroot {} at {}",
            id,
            env.name,
            env.root_path.display()
        );

        Ok(Self {
            id,
            operator: MountOperator::with_backend(env.root_path.clone(), backend),
            config,
            env,
            guard: TrapGuard::new(TrapStack::new()),
            _state: PhantomData,
        })
    }

    /// Register terminal restoration, then (unless disabled) the unmount action
    pub fn arm_traps(mut self) -> Result<Session<Armed>> {
        let terminal = TerminalState::capture();
        self.guard
            .stack_mut()
            .register("restore terminal", move || terminal.restore());

        if self.config.no_unmount {
            info!("Leaving chroot {} mounted on exit", self.env.name);
        } else {
            let strategy = match &self.config.unmount_helper {
                Some(helper) => TeardownStrategy::Helper {
                    helper: helper.clone(),
                    chroots_dir: self.config.chroots_dir.clone(),
                    name: self.env.name.clone(),
                },
                None => TeardownStrategy::Ledger {
                    ledger: self.operator.ledger(),
                    backend: self.operator.backend(),
                },
            };
            let teardown = Teardown::new(
                strategy,
                self.env.root_path.clone(),
                self.config.marker_file.clone(),
            );
            self.guard
                .stack_mut()
                .register("unmount chroot", move || teardown.run());
        }

        Ok(self.into_state())
    }
}

impl Session<Armed> {
    /// Build the guest's filesystem view. Idempotent against an already prepared root.
    pub fn prepare(self) -> Result<Session<Prepared>> {
        signal::check_interrupted()?;
        let root = self.env.root_path.clone();

        let plan = standard_plan(&self.config, kernel_release().as_deref());
        apply_plan(&self.operator, &plan)?;

        write_marker(&root, &self.config.marker_file, &self.env.name)?;

        if self.config.reconcile_groups {
            match GroupIdReconciler::default().reconcile_root(&root, Path::new(HOST_GROUP_FILE)) {
                Ok(0) => {}
                Ok(n) => info!("Adjusted {} guest groups to host gids", n),
                Err(e) => warn!("Group reconciliation skipped: {}", e),
            }
        }

        signal::check_interrupted()?;
        let foreground = ForegroundExecutor;
        let services = GuestServices::new(&root, &foreground);
        if self.config.start_dbus {
            services.start_dbus();
        }
        if self.config.run_rc_local {
            services.run_rc_local();
        }

        Ok(self.into_state())
    }
}

impl Session<Prepared> {
    /// Run the request. Cleanup fires when this returns, or in the detached child.
    pub fn launch(
        mut self,
        request: &SessionRequest,
        launcher: Box<dyn Launcher>,
    ) -> Result<SessionOutcome> {
        let executor = SessionExecutor::new(self.env.root_path.clone(), &self.config, launcher);
        let outcome = executor.run(request, self.guard.stack_mut());
        match &outcome {
            Ok(o) => info!("Session {} finished: {:?}", self.id, o),
            Err(e) => warn!("Session {} failed: {}", self.id, e),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EnterError;
    use crate::kernel::mount::filesystem::tests::RecordingMounts;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn quiet_config() -> EnterConfig {
        EnterConfig {
            start_dbus: false,
            run_rc_local: false,
            reconcile_groups: false,
            ..EnterConfig::default()
        }
    }

    fn guest() -> (TempDir, ChrootEnvironment) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        let env = ChrootEnvironment {
            name: "sid".to_string(),
            root_path: dir.path().to_path_buf(),
        };
        (dir, env)
    }

    #[test]
    fn test_invalid_root_rejected_before_anything_registers() {
        let env = ChrootEnvironment {
            name: "gone".to_string(),
            root_path: PathBuf::from("/nonexistent/guestroot"),
        };
        let result = Session::with_backend(quiet_config(), env, Arc::new(RecordingMounts::default()));
        assert!(matches!(result, Err(EnterError::Precondition(_))));
    }

    #[test]
    fn test_trap_order_terminal_then_unmount() {
        let (_dir, env) = guest();
        let session = Session::with_backend(quiet_config(), env, Arc::new(RecordingMounts::default()))
            .unwrap()
            .arm_traps()
            .unwrap();
        assert_eq!(session.trap().labels(), vec!["restore terminal", "unmount chroot"]);
    }

    #[test]
    fn test_no_unmount_registers_terminal_only() {
        let (_dir, env) = guest();
        let config = EnterConfig {
            no_unmount: true,
            ..quiet_config()
        };
        let session = Session::with_backend(config, env, Arc::new(RecordingMounts::default()))
            .unwrap()
            .arm_traps()
            .unwrap();
        assert_eq!(session.trap().labels(), vec!["restore terminal"]);
    }

    #[test]
    fn test_prepare_mounts_writes_marker_and_drop_tears_down() {
        let (dir, env) = guest();
        let backend = Arc::new(RecordingMounts::default());
        let session = Session::with_backend(quiet_config(), env, backend.clone())
            .unwrap()
            .arm_traps()
            .unwrap()
            .prepare()
            .unwrap();

        let mounted = session.operator().ledger().lock().unwrap().count();
        assert!(mounted >= 4);
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/guestroot/name")).unwrap(),
            "sid\n"
        );

        drop(session);
        assert_eq!(backend.detached.lock().unwrap().len(), mounted);
        assert!(!dir.path().join("etc/guestroot/name").exists());
    }
}
