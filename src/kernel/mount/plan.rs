//! The guest's filesystem view, in dependency order.
//!
//! Devices before sysfs/proc, `/tmp` before anything that may live in it,
//! tmpfs `/var/run` before the lock directory and the host service sockets
//! bound underneath it. [`MountOperator`] does not reorder; this list is
//! the order.

use crate::config::loader::EnterConfig;
use crate::config::types::{MountSpec, Result};
use crate::kernel::mount::filesystem::MountOperator;
use crate::kernel::signal;

/// Guest directory host service sockets are exposed under
pub const HOST_SHARE_DIR: &str = "/var/host";

/// Build the ordered mount plan for one session
pub fn standard_plan(config: &EnterConfig, kernel_release: Option<&str>) -> Vec<MountSpec> {
    let mut plan = vec![
        MountSpec::bind_same("/dev"),
        MountSpec::bind_same("/dev/pts"),
        MountSpec::bind_same("/dev/shm"),
        // hosts commonly mount /tmp noexec; the guest needs to run things there
        MountSpec::bind_same("/tmp").with_remount(&["exec"]),
        MountSpec::bind_same("/proc"),
        MountSpec::bind_same("/sys"),
        MountSpec::tmpfs(
            "/var/run",
            &[
                "noexec",
                "nosuid",
                "mode=0755",
                &format!("size={}", config.var_run_size),
            ],
        ),
        MountSpec::tmpfs(
            "/var/run/lock",
            &[
                "noexec",
                "nosuid",
                "nodev",
                &format!("size={}", config.lock_size),
            ],
        ),
        MountSpec::bind("/var/run/dbus", &format!("{}/dbus", HOST_SHARE_DIR)).optional(),
        MountSpec::bind("/var/run/cras", &format!("{}/cras", HOST_SHARE_DIR)).optional(),
    ];

    if let Some(release) = kernel_release {
        let modules = format!("/lib/modules/{}", release);
        plan.push(
            MountSpec::bind_same(&modules)
                .with_remount(&["ro"])
                .optional(),
        );
    }

    plan.push(
        MountSpec::bind("/media", &format!("{}/media", HOST_SHARE_DIR))
            .with_options(&["rbind", "rshared"])
            .optional(),
    );

    if config.weak_random {
        plan.push(MountSpec::bind("/dev/urandom", "/dev/random"));
    }

    plan.extend(config.extra_mounts.iter().cloned());
    plan
}

/// Running kernel release, used to locate the module tree
pub fn kernel_release() -> Option<String> {
    match nix::sys::utsname::uname() {
        Ok(uts) => Some(uts.release().to_string_lossy().into_owned()).filter(|s| !s.is_empty()),
        Err(e) => {
            log::warn!("uname failed, skipping kernel modules mount: {}", e);
            None
        }
    }
}

/// Apply a plan strictly in order, stopping at the first failure or signal
pub fn apply_plan(operator: &MountOperator, plan: &[MountSpec]) -> Result<usize> {
    let mut mounted = 0;
    for spec in plan {
        signal::check_interrupted()?;
        if operator.apply(spec)? {
            mounted += 1;
        }
    }
    log::info!(
        "Mount plan applied under {}: {} new, {} already present or skipped",
        operator.root().display(),
        mounted,
        plan.len() - mounted
    );
    Ok(mounted)
}
