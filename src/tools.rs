//! Low-level filesystem helpers.

use anyhow::{bail, format_err, Error};
use nix::unistd;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

// distinguishes concurrent staging files written into one directory
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Atomically publish a file.
///
/// The data is staged in a hidden sibling and renamed over the target,
/// so a reader opening the target always sees a complete old or new
/// version. The staging file is synced before the rename; manifests
/// are the only record of a backup and must survive a crash that
/// follows the swap.
pub fn atomic_write_file<P: AsRef<Path>>(path: P, data: &[u8], mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("{:?} has no parent directory", path))?;
    let name = path
        .file_name()
        .ok_or_else(|| format_err!("{:?} has no file name", path))?;

    let staging = dir.join(format!(
        ".{}.{}.{}.swp",
        name.to_string_lossy(),
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed),
    ));

    let staged: Result<(), std::io::Error> = (|| {
        use std::os::unix::fs::PermissionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&staging)?;
        // the open mode is subject to the umask, the requested one is
        // authoritative
        file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&staging, path)
    })();

    if let Err(err) = staged {
        let _ = std::fs::remove_file(&staging);
        bail!("atomic write of {:?} failed: {}", path, err);
    }
    Ok(())
}

/// Read a complete file into memory.
pub fn file_get_contents<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => bail!("unable to open {:?} - {}", path, err),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// SHA-1 of a byte slice as lowercase hex.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = openssl::sha::Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finish())
}

/// Name of the user owning this process, for manifest defaults.
pub fn current_user_name() -> Result<String, Error> {
    match unistd::User::from_uid(unistd::Uid::effective())? {
        Some(user) => Ok(user.name),
        None => bail!("unable to resolve current user name"),
    }
}

/// Name of the effective group of this process.
pub fn current_group_name() -> Result<String, Error> {
    match unistd::Group::from_gid(unistd::Gid::effective())? {
        Some(group) => Ok(group.name),
        None => bail!("unable to resolve current group name"),
    }
}

/// Resolve a uid to a user name, falling back to the numeric form.
pub fn user_name_from_uid(uid: u32) -> String {
    match unistd::User::from_uid(unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Resolve a gid to a group name, falling back to the numeric form.
pub fn group_name_from_gid(gid: u32) -> String {
    match unistd::Group::from_gid(unistd::Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sha1_hex() {
        assert_eq!(
            sha1_hex(b"CONFIGSTUFF"),
            "e3db315c260e79211b7b52587123b7aa060f30ab"
        );
    }

    #[test]
    fn test_atomic_write_file() -> Result<(), Error> {
        let mut dir = std::fs::canonicalize(".").unwrap();
        dir.push(format!(".testdir-tools-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join("backup.manifest");
        atomic_write_file(&path, b"first", 0o640)?;
        atomic_write_file(&path, b"second", 0o640)?;
        assert_eq!(file_get_contents(&path)?, b"second");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);

        // no staging leftovers
        let count = std::fs::read_dir(&dir)?.count();
        assert_eq!(count, 1);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_atomic_write_needs_a_directory() {
        assert!(atomic_write_file("/", b"x", 0o640).is_err());
    }
}
