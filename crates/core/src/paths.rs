//! Locations of the config file, logs and the bundled default config.
use std::io;
use std::path::PathBuf;

const APP_NAME: &str = "utter";
const CONFIG_FILE: &str = "utter.yml";
const DEFAULT_CONFIG: &str = include_str!("../data/config.yml");

/// Resolves `$<xdg_var>/utter`, falling back to `platform_dir/utter` and then
/// to `~/<home_fallback>/utter`. Empty XDG variables are ignored.
fn app_dir(
    xdg_var: &str,
    platform_dir: Option<PathBuf>,
    home_fallback: &str,
) -> io::Result<PathBuf> {
    let base = std::env::var_os(xdg_var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or(platform_dir)
        .or_else(|| dirs::home_dir().map(|home| home.join(home_fallback)))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("Cannot locate a directory for {APP_NAME}, set {xdg_var}"),
            )
        })?;
    Ok(base.join(APP_NAME))
}

/// Default path of `utter.yml`.
pub fn config_file_path() -> io::Result<PathBuf> {
    Ok(app_dir("XDG_CONFIG_HOME", dirs::config_dir(), ".config")?.join(CONFIG_FILE))
}

/// Directory for logs, created on demand.
pub fn get_data_dir() -> io::Result<PathBuf> {
    let path = app_dir("XDG_DATA_HOME", dirs::data_local_dir(), ".local/share")?;
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Config written on first run.
pub fn default_config() -> &'static str {
    DEFAULT_CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests touching the environment run one at a time.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_file_path_follows_xdg() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let tmp_dir = tempfile::tempdir().unwrap();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp_dir.path());
        }

        assert_eq!(
            config_file_path().unwrap(),
            tmp_dir.path().join("utter").join("utter.yml")
        );

        unsafe {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn test_app_dir_ignores_empty_xdg() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("UTTER_TEST_XDG_EMPTY", "");
        }

        let dir = app_dir("UTTER_TEST_XDG_EMPTY", Some(PathBuf::from("/platform")), ".x").unwrap();
        assert_eq!(dir, PathBuf::from("/platform/utter"));

        unsafe {
            env::remove_var("UTTER_TEST_XDG_EMPTY");
        }
    }

    #[test]
    fn test_app_dir_falls_back_to_home() {
        let dir = app_dir("UTTER_TEST_XDG_UNSET", None, ".config");
        match dirs::home_dir() {
            Some(home) => assert_eq!(dir.unwrap(), home.join(".config").join("utter")),
            None => assert!(dir.is_err()),
        }
    }

    #[test]
    fn test_get_data_dir_creates_directory() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let tmp_dir = tempfile::tempdir().unwrap();
        unsafe {
            env::set_var("XDG_DATA_HOME", tmp_dir.path().join("nested"));
        }

        let data_dir = get_data_dir().unwrap();
        assert_eq!(data_dir, tmp_dir.path().join("nested").join("utter"));
        assert!(data_dir.is_dir());

        unsafe {
            env::remove_var("XDG_DATA_HOME");
        }
    }

    #[test]
    fn test_default_config_names_chat_backend() {
        let config = default_config();
        assert!(config.contains("backends:"));
        assert!(config.contains("segmenter:"));
        assert!(config.contains("backend: qwen"));
    }
}
