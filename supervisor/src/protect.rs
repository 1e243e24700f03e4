//! Protect and unprotect the installed agent binary around a swap.
//!
//! Scope matters: only the target path is touched, never its directory,
//! so a concurrent process working elsewhere in the install tree is
//! unaffected.

use std::io;
use std::path::Path;

/// Make the target writable so it can be replaced.
pub fn unprotect(target: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
    }
    #[cfg(windows)]
    {
        let output = std::process::Command::new("icacls")
            .arg(target)
            .arg("/reset")
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "icacls /reset failed: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            )))
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = target;
        Ok(())
    }
}

/// Restore the restrictive protection after a swap or rollback.
pub fn protect(target: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o555))
    }
    #[cfg(windows)]
    {
        let output = std::process::Command::new("icacls")
            .arg(target)
            .args(["/inheritance:r", "/grant", "Administrators:F", "/grant", "SYSTEM:F"])
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "icacls grant failed: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            )))
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = target;
        Ok(())
    }
}
