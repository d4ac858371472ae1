use crate::error::AppError;
use crate::portal::PortalEndpoints;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const SERVICE_NAME: &str = "esb-meter";

/// Strip all whitespace; MPRNs are often written in groups.
pub fn normalize_mprn(mprn: &str) -> String {
    mprn.chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn validate_mprn(mprn: &str) -> Result<String, AppError> {
    let normalized = normalize_mprn(mprn);
    if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Config(format!(
            "Invalid MPRN '{mprn}'. Expected digits only."
        )));
    }
    Ok(normalized)
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("ESB_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("ie", "esb-meter", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".esb-meter"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub poll_seconds: u64,
    pub freshness_seconds: u64,
    pub request_timeout_seconds: u64,
    pub meters: Vec<MeterSettings>,
    pub portal: PortalOverrides,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSettings {
    pub mprn: String,
    pub username: String,
    /// Legacy plaintext password, only kept while the keyring cannot hold it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for MeterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterSettings")
            .field("mprn", &self.mprn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Endpoint overrides; unset fields use the production portal.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PortalOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 60,
            freshness_seconds: 300,
            request_timeout_seconds: 10,
            meters: vec![],
            portal: PortalOverrides::default(),
        }
    }
}

impl AppConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds.max(10))
    }

    pub fn endpoints(&self) -> PortalEndpoints {
        let defaults = PortalEndpoints::default();
        PortalEndpoints {
            landing_url: self
                .portal
                .landing_url
                .clone()
                .unwrap_or(defaults.landing_url),
            login_base_url: self
                .portal
                .login_base_url
                .clone()
                .unwrap_or(defaults.login_base_url),
            policy: defaults.policy,
            download_url: self
                .portal
                .download_url
                .clone()
                .unwrap_or(defaults.download_url),
        }
    }

    pub fn meter(&self, mprn: &str) -> Option<&MeterSettings> {
        let normalized = normalize_mprn(mprn);
        self.meters.iter().find(|m| m.mprn == normalized)
    }

    /// Register a meter; an MPRN may only be configured once.
    pub fn add_meter(&mut self, mprn: &str, username: &str) -> Result<String, AppError> {
        let mprn = validate_mprn(mprn)?;
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::Config("Username must not be empty.".into()));
        }
        if self.meter(&mprn).is_some() {
            return Err(AppError::Config(format!(
                "Meter {mprn} is already configured."
            )));
        }
        self.meters.push(MeterSettings {
            mprn: mprn.clone(),
            username: username.to_string(),
            password: None,
        });
        Ok(mprn)
    }

    pub fn remove_meter(&mut self, mprn: &str) -> Result<String, AppError> {
        let normalized = normalize_mprn(mprn);
        let before = self.meters.len();
        self.meters.retain(|m| m.mprn != normalized);
        if self.meters.len() == before {
            return Err(AppError::Config(format!(
                "Meter {normalized} is not configured."
            )));
        }
        Ok(normalized)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

/// Move plaintext `password` keys into `store`. A key is only removed from
/// the file once the stored password reads back unchanged.
fn migrate_plaintext_passwords(raw: &mut toml::Value, store: &dyn PasswordStore) {
    let Some(meters) = raw.get_mut("meters").and_then(toml::Value::as_array_mut) else {
        return;
    };

    for meter in meters.iter_mut() {
        let Some(table) = meter.as_table_mut() else {
            continue;
        };

        let mprn = table
            .get("mprn")
            .and_then(toml::Value::as_str)
            .map(normalize_mprn);
        let Some(password) = table
            .get("password")
            .and_then(toml::Value::as_str)
            .map(ToString::to_string)
        else {
            continue;
        };

        if password.is_empty() {
            table.remove("password");
            continue;
        }
        let Some(mprn) = mprn else {
            continue;
        };

        match store_password(store, &mprn, &password) {
            Ok(()) => {
                table.remove("password");
                info!(%mprn, "moved plaintext password into keyring");
            }
            Err(e) => {
                warn!(%mprn, error = %e, "keeping plaintext password in config");
            }
        }
    }
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let mut meters: Vec<MeterSettings> = Vec::new();
    for meter in std::mem::take(&mut config.meters) {
        let mprn = normalize_mprn(&meter.mprn);
        let username = meter.username.trim().to_string();
        if mprn != meter.mprn || username != meter.username {
            changed = true;
        }
        if meters.iter().any(|m| m.mprn == mprn) {
            changed = true;
            continue;
        }
        meters.push(MeterSettings {
            mprn,
            username,
            password: meter.password,
        });
    }
    config.meters = meters;

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_at(&config_path()?, &KeyringStore)
}

fn load_config_at(path: &Path, store: &dyn PasswordStore) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw_str = fs::read_to_string(path)?;
    let mut raw_toml: toml::Value = toml::from_str(&raw_str)?;
    migrate_plaintext_passwords(&mut raw_toml, store);

    let mut parsed: AppConfig = raw_toml.clone().try_into()?;

    // Persist if passwords were migrated out or entries were normalized.
    if normalize_config(&mut parsed) {
        fs::write(path, toml::to_string_pretty(&parsed)?)?;
    } else {
        let rewritten = toml::to_string_pretty(&raw_toml)?;
        if rewritten != raw_str {
            fs::write(path, rewritten)?;
        }
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn password_env_var(mprn: &str) -> String {
    format!("ESB_METER_PASSWORD_{}", normalize_mprn(mprn))
}

/// Where meter passwords are kept between runs.
pub trait PasswordStore {
    fn set(&self, mprn: &str, password: &str) -> Result<(), AppError>;
    /// `Ok(None)` when nothing is stored for the meter.
    fn get(&self, mprn: &str) -> Result<Option<String>, AppError>;
    fn delete(&self, mprn: &str) -> Result<(), AppError>;
}

/// The OS keyring. Every call opens a fresh entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

impl KeyringStore {
    fn entry(mprn: &str) -> Result<keyring::Entry, AppError> {
        let normalized = normalize_mprn(mprn);
        Ok(keyring::Entry::new(
            SERVICE_NAME,
            &format!("meter:{normalized}"),
        )?)
    }
}

impl PasswordStore for KeyringStore {
    fn set(&self, mprn: &str, password: &str) -> Result<(), AppError> {
        Self::entry(mprn)?.set_password(password)?;
        Ok(())
    }

    fn get(&self, mprn: &str) -> Result<Option<String>, AppError> {
        match Self::entry(mprn)?.get_password() {
            Ok(v) if !v.is_empty() => Ok(Some(v)),
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AppError::Keyring(e)),
        }
    }

    fn delete(&self, mprn: &str) -> Result<(), AppError> {
        match Self::entry(mprn)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AppError::Keyring(e)),
        }
    }
}

/// Write a password and confirm it reads back through a separate lookup.
pub fn store_password(
    store: &dyn PasswordStore,
    mprn: &str,
    password: &str,
) -> Result<(), AppError> {
    let mprn = normalize_mprn(mprn);
    store.set(&mprn, password)?;
    match store.get(&mprn)? {
        Some(stored) if stored == password => Ok(()),
        _ => Err(AppError::Config(format!(
            "Keyring did not retain the password for meter {mprn}. Set {} instead.",
            password_env_var(&mprn)
        ))),
    }
}

/// Keyring first, then `ESB_METER_PASSWORD_<MPRN>`, then a plaintext
/// password still sitting in the config file.
pub fn resolve_password(
    store: &dyn PasswordStore,
    meter: &MeterSettings,
) -> Result<String, AppError> {
    match store.get(&meter.mprn) {
        Ok(Some(value)) => return Ok(value),
        Ok(None) => {}
        Err(e) => warn!(mprn = %meter.mprn, error = %e, "keyring lookup failed"),
    }

    let env_name = password_env_var(&meter.mprn);
    if let Ok(value) = std::env::var(&env_name) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    if let Some(value) = meter.password.as_deref().filter(|v| !v.is_empty()) {
        return Ok(value.to_string());
    }

    Err(AppError::Config(format!(
        "No password found for meter {}. Run add-meter with --password or set {env_name}.",
        normalize_mprn(&meter.mprn)
    )))
}

pub fn set_password(mprn: &str, password: &str) -> Result<(), AppError> {
    store_password(&KeyringStore, mprn, password)
}

pub fn delete_password(mprn: &str) -> Result<(), AppError> {
    KeyringStore.delete(mprn)
}

pub fn has_password(mprn: &str) -> Result<bool, AppError> {
    Ok(KeyringStore.get(mprn)?.is_some())
}

pub fn get_password(meter: &MeterSettings) -> Result<String, AppError> {
    resolve_password(&KeyringStore, meter)
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        passwords: Mutex<HashMap<String, String>>,
    }

    impl PasswordStore for MemoryStore {
        fn set(&self, mprn: &str, password: &str) -> Result<(), AppError> {
            self.passwords
                .lock()
                .expect("store lock")
                .insert(normalize_mprn(mprn), password.to_string());
            Ok(())
        }

        fn get(&self, mprn: &str) -> Result<Option<String>, AppError> {
            Ok(self
                .passwords
                .lock()
                .expect("store lock")
                .get(&normalize_mprn(mprn))
                .cloned())
        }

        fn delete(&self, mprn: &str) -> Result<(), AppError> {
            self.passwords
                .lock()
                .expect("store lock")
                .remove(&normalize_mprn(mprn));
            Ok(())
        }
    }

    /// Accepts writes but never returns them, like an unbacked keyring.
    struct ForgetfulStore;

    impl PasswordStore for ForgetfulStore {
        fn set(&self, _: &str, _: &str) -> Result<(), AppError> {
            Ok(())
        }

        fn get(&self, _: &str) -> Result<Option<String>, AppError> {
            Ok(None)
        }

        fn delete(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct BrokenStore;

    impl PasswordStore for BrokenStore {
        fn set(&self, _: &str, _: &str) -> Result<(), AppError> {
            Err(AppError::Config("backend unavailable".into()))
        }

        fn get(&self, _: &str) -> Result<Option<String>, AppError> {
            Err(AppError::Config("backend unavailable".into()))
        }

        fn delete(&self, _: &str) -> Result<(), AppError> {
            Err(AppError::Config("backend unavailable".into()))
        }
    }

    #[test]
    fn normalize_mprn_strips_whitespace() {
        assert_eq!(normalize_mprn(" 100 0000 0000 "), "10000000000");
    }

    #[test]
    fn validate_mprn_rejects_non_digits() {
        assert!(validate_mprn("10000000000").is_ok());
        let err = validate_mprn("MPRN-1").expect_err("letters rejected");
        assert!(err.to_string().contains("Invalid MPRN"));
        assert!(validate_mprn("   ").is_err());
    }

    #[test]
    fn add_meter_rejects_duplicate_mprn() {
        let mut cfg = AppConfig::default();
        cfg.add_meter("10000000000", "me@example.com")
            .expect("first add");
        let err = cfg
            .add_meter("1000 0000 000", "other@example.com")
            .expect_err("duplicate rejected");
        assert_eq!(
            err.to_string(),
            "config error: Meter 10000000000 is already configured."
        );
        assert_eq!(cfg.meters.len(), 1);
    }

    #[test]
    fn remove_meter_requires_known_mprn() {
        let mut cfg = AppConfig::default();
        cfg.add_meter("123", "me").expect("add");
        assert!(cfg.remove_meter("999").is_err());
        assert_eq!(cfg.remove_meter(" 123 ").expect("remove"), "123");
        assert!(cfg.meters.is_empty());
    }

    #[test]
    fn normalize_config_dedupes_meters() {
        let mut cfg = AppConfig {
            meters: vec![
                MeterSettings {
                    mprn: "100 200".into(),
                    username: " first ".into(),
                    password: None,
                },
                MeterSettings {
                    mprn: "100200".into(),
                    username: "second".into(),
                    password: None,
                },
            ],
            ..AppConfig::default()
        };

        assert!(normalize_config(&mut cfg));
        assert_eq!(
            cfg.meters,
            vec![MeterSettings {
                mprn: "100200".into(),
                username: "first".into(),
                password: None,
            }]
        );
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: AppConfig = toml::from_str("poll_seconds = 30\n").expect("parse");
        assert_eq!(cfg.poll_seconds, 30);
        assert_eq!(cfg.freshness(), Duration::from_secs(300));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert!(cfg.meters.is_empty());
    }

    #[test]
    fn poll_interval_has_floor() {
        let cfg = AppConfig {
            poll_seconds: 1,
            ..AppConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn endpoints_apply_overrides() {
        let cfg = AppConfig {
            portal: PortalOverrides {
                download_url: Some("http://localhost:8080/DownloadHdf".into()),
                ..PortalOverrides::default()
            },
            ..AppConfig::default()
        };
        let endpoints = cfg.endpoints();
        assert_eq!(endpoints.download_url, "http://localhost:8080/DownloadHdf");
        assert_eq!(endpoints.landing_url, PortalEndpoints::default().landing_url);
    }

    #[test]
    fn migration_without_passwords_leaves_meters_untouched() {
        let mut raw: toml::Value =
            toml::from_str("[[meters]]\nmprn = \"123\"\nusername = \"me\"\n").expect("parse");
        let before = raw.clone();
        let store = MemoryStore::default();
        migrate_plaintext_passwords(&mut raw, &store);
        assert_eq!(raw, before);
        assert_eq!(store.get("123").expect("get"), None);
    }

    fn legacy_meter(password: &str) -> toml::Value {
        toml::from_str(&format!(
            "[[meters]]\nmprn = \"77 777\"\nusername = \"me\"\npassword = \"{password}\"\n"
        ))
        .expect("parse")
    }

    fn meter_password(raw: &toml::Value) -> Option<&str> {
        raw.get("meters")?
            .as_array()?
            .first()?
            .get("password")?
            .as_str()
    }

    #[test]
    fn store_password_round_trips() {
        let store = MemoryStore::default();
        store_password(&store, "55 555", "pw").expect("store");
        assert_eq!(store.get("55555").expect("get").as_deref(), Some("pw"));

        store.delete("55555").expect("delete");
        assert_eq!(store.get("55555").expect("get"), None);
    }

    #[test]
    fn store_password_rejects_store_that_forgets() {
        let err = store_password(&ForgetfulStore, "55555", "pw").expect_err("not retained");
        assert!(err.to_string().contains("did not retain"));
        assert!(err.to_string().contains("ESB_METER_PASSWORD_55555"));
    }

    #[test]
    fn migration_moves_password_that_reads_back() {
        let mut raw = legacy_meter("secret");
        let store = MemoryStore::default();
        migrate_plaintext_passwords(&mut raw, &store);

        assert_eq!(meter_password(&raw), None);
        assert_eq!(store.get("77777").expect("get").as_deref(), Some("secret"));
    }

    #[test]
    fn migration_keeps_password_when_store_forgets() {
        let mut raw = legacy_meter("secret");
        migrate_plaintext_passwords(&mut raw, &ForgetfulStore);
        assert_eq!(meter_password(&raw), Some("secret"));
    }

    #[test]
    fn migration_keeps_password_when_store_fails() {
        let mut raw = legacy_meter("secret");
        migrate_plaintext_passwords(&mut raw, &BrokenStore);
        assert_eq!(meter_password(&raw), Some("secret"));
    }

    #[test]
    fn migration_drops_empty_password() {
        let mut raw = legacy_meter("");
        migrate_plaintext_passwords(&mut raw, &BrokenStore);
        assert_eq!(meter_password(&raw), None);
    }

    #[test]
    fn load_keeps_unmigrated_password_readable() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        // Spaced MPRN forces the normalizing rewrite.
        fs::write(
            &path,
            "[[meters]]\nmprn = \"77 777\"\nusername = \"me\"\npassword = \"secret\"\n",
        )
        .expect("write config");

        let cfg = load_config_at(&path, &ForgetfulStore).expect("load");
        let text = fs::read_to_string(&path).expect("read config");
        assert!(text.contains("mprn = \"77777\""));
        assert!(text.contains("secret"));

        let meter = cfg.meter("77777").expect("meter");
        assert_eq!(
            resolve_password(&ForgetfulStore, meter).expect("resolve"),
            "secret"
        );
    }

    #[test]
    fn load_migrates_password_out_of_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[[meters]]\nmprn = \"77777\"\nusername = \"me\"\npassword = \"secret\"\n",
        )
        .expect("write config");

        let store = MemoryStore::default();
        let cfg = load_config_at(&path, &store).expect("load");
        let text = fs::read_to_string(&path).expect("read config");
        assert!(!text.contains("secret"));

        let meter = cfg.meter("77777").expect("meter");
        assert_eq!(meter.password, None);
        assert_eq!(resolve_password(&store, meter).expect("resolve"), "secret");
    }

    #[test]
    fn resolve_password_prefers_store_over_file() {
        let store = MemoryStore::default();
        store.set("88888", "from-store").expect("set");
        let meter = MeterSettings {
            mprn: "88888".into(),
            username: "me".into(),
            password: Some("from-file".into()),
        };
        assert_eq!(resolve_password(&store, &meter).expect("resolve"), "from-store");
    }

    #[test]
    fn resolve_password_reports_missing_password() {
        let meter = MeterSettings {
            mprn: "99999000001".into(),
            username: "me".into(),
            password: None,
        };
        let err = resolve_password(&BrokenStore, &meter).expect_err("nothing stored");
        assert!(err.to_string().contains("No password found for meter 99999000001"));
    }

    #[test]
    fn meter_settings_debug_redacts_password() {
        let meter = MeterSettings {
            mprn: "1".into(),
            username: "me".into(),
            password: Some("hunter2".into()),
        };
        assert!(!format!("{meter:?}").contains("hunter2"));
    }

    #[test]
    fn keyring_round_trip_when_backend_available() {
        let mprn = "990000000017";
        if let Err(e) = set_password(mprn, "pw") {
            eprintln!("skipping, keyring unavailable: {e}");
            return;
        }
        assert!(has_password(mprn).expect("lookup"));
        delete_password(mprn).expect("delete");
        assert!(!has_password(mprn).expect("lookup"));
    }

    #[test]
    fn password_env_var_uses_normalized_mprn() {
        assert_eq!(password_env_var("10 00"), "ESB_METER_PASSWORD_1000");
    }
}
