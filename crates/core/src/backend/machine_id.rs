use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use std::path::Path;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

static MACHINE_ID: OnceCell<String> = OnceCell::new();

/// Stable identifier of this host, used as the key for relay services.
/// Read once per process.
pub(super) fn get_machine_id() -> Result<String> {
    MACHINE_ID
        .get_or_try_init(|| {
            MACHINE_ID_PATHS
                .iter()
                .find_map(|p| read_id(Path::new(p)))
                .ok_or_else(|| anyhow!("Could not determine a machine id"))
        })
        .cloned()
}

fn read_id(path: &Path) -> Option<String> {
    let id = std::fs::read_to_string(path).ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");

        assert_eq!(read_id(&path), None);

        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(read_id(&path), None);

        std::fs::write(&path, "0123abcd\n").unwrap();
        assert_eq!(read_id(&path).as_deref(), Some("0123abcd"));
    }

    #[test]
    fn test_get_machine_id_is_stable() {
        // Hosts without a machine id fail every time.
        match get_machine_id() {
            Ok(id) => assert_eq!(get_machine_id().unwrap(), id),
            Err(_) => assert!(get_machine_id().is_err()),
        }
    }
}
