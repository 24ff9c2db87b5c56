//! FUSE surface for the secret cache.

pub mod inode_table;
pub mod secret_fs;

use fuser::MountOption;

pub use secret_fs::SecretFs;

/// Mount options for the secrets filesystem. Always read-only; permission
/// checks stay with the kernel so secret modes are enforced.
pub fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("secretfs".to_string()),
        MountOption::RO,
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}
