//! Admin-editable settings.
//!
//! The tree has three groups. `clearanceFormat` and `aviation` are served to
//! every client; `system` holds server tunables and is only visible to
//! admins. Updates arrive as a [`SettingsPatch`]: groups present in the patch
//! are merged field by field and every field is replaced wholesale, lists and
//! the squawk range included. Keys the server does not know are ignored, so
//! older dashboards can keep posting their full form.
//!
//! Intervals in the `system` group are milliseconds on the wire, matching what
//! the dashboard sends.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{auth::AdminUser, datastore::StoreError};

pub const DEFAULT_TEMPLATE: &str = "{CALLSIGN}, {ATC_STATION}, good day. Startup approved. \
Information {ATIS} is correct. Cleared to {DESTINATION} via {ROUTE}, runway {RUNWAY}. \
Initial climb {INITIAL_ALT}FT, expect further climb to Flight Level {FLIGHT_LEVEL}. \
Squawk {SQUAWK}.";

/// Shortest accepted upstream polling interval, in milliseconds.
pub const MIN_POLL_INTERVAL_MS: u64 = 10_000;

/// Shortest accepted client refresh interval, in milliseconds.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 1_000;

/// Levels accepted for `system.logLevel`.
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings update must be a JSON object")]
    NotAnObject,

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Failed to persist settings: {0}")]
    Persist(#[source] StoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhraseologyStyle {
    #[default]
    #[serde(rename = "ICAO")]
    Icao,
    #[serde(rename = "FAA")]
    Faa,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClearanceFormat {
    pub custom_template: String,
    pub include_atis: bool,
    pub include_squawk: bool,
    pub include_flight_level: bool,
    pub phraseology_style: PhraseologyStyle,
    pub include_startup_approval: bool,
    pub include_initial_climb: bool,
}

impl Default for ClearanceFormat {
    fn default() -> Self {
        Self {
            custom_template: DEFAULT_TEMPLATE.to_string(),
            include_atis: true,
            include_squawk: true,
            include_flight_level: true,
            phraseology_style: PhraseologyStyle::Icao,
            include_startup_approval: true,
            include_initial_climb: true,
        }
    }
}

/// Transponder codes are four octal digits written as a decimal number,
/// e.g. `7777`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SquawkRange {
    pub min: u16,
    pub max: u16,
    pub exclude: Vec<u16>,
}

impl Default for SquawkRange {
    fn default() -> Self {
        Self {
            min: 1000,
            max: 7777,
            exclude: vec![7500, 7600, 7700],
        }
    }
}

/// Whether `code` is a four-digit octal transponder code.
///
/// # Examples
///
/// ```
/// use ifr_clearance::settings::is_squawk_code;
///
/// assert!(is_squawk_code(7700));
/// assert!(!is_squawk_code(7800));
/// ```
pub fn is_squawk_code(code: u16) -> bool {
    code <= 7777 && code.to_string().chars().all(|c| ('0'..='7').contains(&c))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Aviation {
    pub default_altitudes: Vec<u32>,
    pub enable_runway_validation: bool,
    #[serde(rename = "enableSIDValidation", alias = "enableSidValidation")]
    pub enable_sid_validation: bool,
    pub squawk_ranges: SquawkRange,
    pub atis_letters: Vec<String>,
}

impl Default for Aviation {
    fn default() -> Self {
        Self {
            default_altitudes: vec![1000, 2000, 3000, 4000, 5000],
            enable_runway_validation: false,
            enable_sid_validation: false,
            squawk_ranges: SquawkRange::default(),
            atis_letters: ('A'..='Z').map(String::from).collect(),
        }
    }
}

/// Server tunables. Only admins can read or change these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemSettings {
    /// Capacity of the live flight plan buffer.
    pub max_flight_plans_stored: usize,
    /// Logs every received flight plan at `info`.
    pub enable_detailed_logging: bool,
    /// How often clients should reload the flight plan list.
    #[serde(rename = "autoRefreshInterval")]
    pub auto_refresh_interval_ms: u64,
    /// Keep flight plans out of the live buffer unless they name both a
    /// callsign and a destination.
    pub enable_flight_plan_filtering: bool,
    #[serde(rename = "controllerPollInterval")]
    pub controller_poll_interval_ms: u64,
    #[serde(rename = "atisPollInterval")]
    pub atis_poll_interval_ms: u64,
    /// Default tracing level, one of [`LOG_LEVELS`].
    pub log_level: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_flight_plans_stored: 20,
            enable_detailed_logging: false,
            auto_refresh_interval_ms: 30_000,
            enable_flight_plan_filtering: false,
            controller_poll_interval_ms: 300_000,
            atis_poll_interval_ms: 300_000,
            log_level: "info".to_string(),
        }
    }
}

impl SystemSettings {
    pub fn controller_poll_interval(&self) -> Duration {
        Duration::from_millis(self.controller_poll_interval_ms)
    }

    pub fn atis_poll_interval(&self) -> Duration {
        Duration::from_millis(self.atis_poll_interval_ms)
    }

    pub fn auto_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.auto_refresh_interval_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminSettings {
    pub clearance_format: ClearanceFormat,
    pub aviation: Aviation,
    pub system: SystemSettings,
}

impl AdminSettings {
    /// Checks the values serde cannot: octal squawk codes, an ordered squawk
    /// range, a non-zero buffer, interval floors and a known log level.
    ///
    /// # Returns
    ///
    /// `Ok(())`, or [`SettingsError::Invalid`] naming the first offending
    /// value.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let squawk = &self.aviation.squawk_ranges;
        if let Some(code) = [squawk.min, squawk.max]
            .into_iter()
            .chain(squawk.exclude.iter().copied())
            .find(|code| !is_squawk_code(*code))
        {
            return Err(SettingsError::Invalid(format!(
                "{code} is not a valid squawk code"
            )));
        }
        if squawk.min > squawk.max {
            return Err(SettingsError::Invalid(
                "squawk range minimum exceeds maximum".into(),
            ));
        }

        let system = &self.system;
        if system.max_flight_plans_stored == 0 {
            return Err(SettingsError::Invalid(
                "maxFlightPlansStored must be at least 1".into(),
            ));
        }
        if system.controller_poll_interval_ms < MIN_POLL_INTERVAL_MS
            || system.atis_poll_interval_ms < MIN_POLL_INTERVAL_MS
        {
            return Err(SettingsError::Invalid(format!(
                "poll intervals must be at least {MIN_POLL_INTERVAL_MS} ms"
            )));
        }
        if system.auto_refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(SettingsError::Invalid(format!(
                "autoRefreshInterval must be at least {MIN_REFRESH_INTERVAL_MS} ms"
            )));
        }
        if !LOG_LEVELS.contains(&system.log_level.as_str()) {
            return Err(SettingsError::Invalid(format!(
                "logLevel must be one of {}",
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }

    /// The groups every client may read.
    pub fn public(&self) -> PublicSettings {
        PublicSettings {
            clearance_format: self.clearance_format.clone(),
            aviation: self.aviation.clone(),
        }
    }

    /// Merges `patch` into the tree without validating the result.
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(clearance_format) = patch.clearance_format {
            clearance_format.apply(&mut self.clearance_format);
        }
        if let Some(aviation) = patch.aviation {
            aviation.apply(&mut self.aviation);
        }
        if let Some(system) = patch.system {
            system.apply(&mut self.system);
        }
    }
}

/// The settings every client may read.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSettings {
    pub clearance_format: ClearanceFormat,
    pub aviation: Aviation,
}

macro_rules! replace_present {
    ($patch:ident => $target:ident: $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}

/// A partial settings tree. Absent groups and fields are left alone.
///
/// # Examples
///
/// ```
/// use ifr_clearance::settings::{AdminSettings, SettingsPatch};
/// use serde_json::json;
///
/// let patch = SettingsPatch::from_value(json!({
///     "system": { "maxFlightPlansStored": 40, "atisPollInterval": 60000 }
/// }))
/// .unwrap();
///
/// let mut settings = AdminSettings::default();
/// settings.apply(patch);
/// assert_eq!(settings.system.max_flight_plans_stored, 40);
/// assert_eq!(settings.system.atis_poll_interval_ms, 60_000);
/// assert!(settings.clearance_format.include_atis);
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub clearance_format: Option<ClearanceFormatPatch>,
    pub aviation: Option<AviationPatch>,
    pub system: Option<SystemPatch>,
}

impl SettingsPatch {
    /// Parses an update body.
    ///
    /// # Parameters
    ///
    /// * `value` - The JSON body as posted by the dashboard.
    ///
    /// # Returns
    ///
    /// The patch, [`SettingsError::NotAnObject`] for anything but a JSON
    /// object, or [`SettingsError::Invalid`] when a known field has the wrong
    /// type. Unknown keys are ignored.
    pub fn from_value(value: Value) -> Result<Self, SettingsError> {
        if !value.is_object() {
            return Err(SettingsError::NotAnObject);
        }
        serde_json::from_value(value).map_err(|e| SettingsError::Invalid(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearanceFormatPatch {
    pub custom_template: Option<String>,
    pub include_atis: Option<bool>,
    pub include_squawk: Option<bool>,
    pub include_flight_level: Option<bool>,
    pub phraseology_style: Option<PhraseologyStyle>,
    pub include_startup_approval: Option<bool>,
    pub include_initial_climb: Option<bool>,
}

impl ClearanceFormatPatch {
    fn apply(self, target: &mut ClearanceFormat) {
        let patch = self;
        replace_present!(patch => target:
            custom_template,
            include_atis,
            include_squawk,
            include_flight_level,
            phraseology_style,
            include_startup_approval,
            include_initial_climb,
        );
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AviationPatch {
    pub default_altitudes: Option<Vec<u32>>,
    pub enable_runway_validation: Option<bool>,
    #[serde(rename = "enableSIDValidation", alias = "enableSidValidation")]
    pub enable_sid_validation: Option<bool>,
    pub squawk_ranges: Option<SquawkRange>,
    pub atis_letters: Option<Vec<String>>,
}

impl AviationPatch {
    fn apply(self, target: &mut Aviation) {
        let patch = self;
        replace_present!(patch => target:
            default_altitudes,
            enable_runway_validation,
            enable_sid_validation,
            squawk_ranges,
            atis_letters,
        );
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPatch {
    pub max_flight_plans_stored: Option<usize>,
    pub enable_detailed_logging: Option<bool>,
    #[serde(rename = "autoRefreshInterval")]
    pub auto_refresh_interval_ms: Option<u64>,
    pub enable_flight_plan_filtering: Option<bool>,
    #[serde(rename = "controllerPollInterval")]
    pub controller_poll_interval_ms: Option<u64>,
    #[serde(rename = "atisPollInterval")]
    pub atis_poll_interval_ms: Option<u64>,
    pub log_level: Option<String>,
}

impl SystemPatch {
    fn apply(self, target: &mut SystemSettings) {
        let patch = self;
        replace_present!(patch => target:
            max_flight_plans_stored,
            enable_detailed_logging,
            auto_refresh_interval_ms,
            enable_flight_plan_filtering,
            controller_poll_interval_ms,
            atis_poll_interval_ms,
            log_level,
        );
    }
}

/// Durable home of the settings tree.
#[async_trait]
pub trait SettingsRepository: fmt::Debug + Send + Sync {
    async fn load_settings(&self) -> Result<Option<Value>, StoreError>;
    async fn save_settings(&self, settings: &AdminSettings) -> Result<(), StoreError>;
}

/// The live settings tree and its optional durable copy.
///
/// Reads take a short `parking_lot` read lock. Writers are serialized by an
/// async mutex held across the persistence await, so a second update never
/// merges over a stale base.
///
/// # Examples
///
/// ```
/// use ifr_clearance::settings::{SettingsPatch, SettingsStore};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SettingsStore::in_memory();
/// let patch = SettingsPatch::from_value(json!({ "clearanceFormat": { "includeSquawk": false } }))?;
/// let updated = store.update(patch).await?;
///
/// assert!(!updated.clearance_format.include_squawk);
/// assert!(store.public().clearance_format.include_atis);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<AdminSettings>,
    writer: Mutex<()>,
    repository: Option<Arc<dyn SettingsRepository>>,
}

impl SettingsStore {
    pub fn in_memory() -> Self {
        Self::with_settings(AdminSettings::default(), None)
    }

    pub fn with_settings(
        settings: AdminSettings,
        repository: Option<Arc<dyn SettingsRepository>>,
    ) -> Self {
        Self {
            current: RwLock::new(settings),
            writer: Mutex::new(()),
            repository,
        }
    }

    /// Reads the stored tree, filling anything missing from defaults. Falls
    /// back to defaults entirely when the row is absent or unreadable.
    pub async fn load(repository: Option<Arc<dyn SettingsRepository>>) -> Self {
        let settings = match &repository {
            Some(repo) => match repo.load_settings().await {
                Ok(Some(stored)) => match serde_json::from_value::<AdminSettings>(stored) {
                    Ok(settings) if settings.validate().is_ok() => {
                        info!("Loaded stored settings");
                        settings
                    }
                    Ok(_) => {
                        warn!("Stored settings fail validation, using defaults");
                        AdminSettings::default()
                    }
                    Err(error) => {
                        warn!(%error, "Stored settings are malformed, using defaults");
                        AdminSettings::default()
                    }
                },
                Ok(None) => AdminSettings::default(),
                Err(error) => {
                    warn!(%error, "Failed to load settings, using defaults");
                    AdminSettings::default()
                }
            },
            None => AdminSettings::default(),
        };

        Self::with_settings(settings, repository)
    }

    pub fn public(&self) -> PublicSettings {
        self.current.read().public()
    }

    /// The full tree. Requires proof that the caller is an admin.
    pub fn admin(&self, _admin: &AdminUser) -> AdminSettings {
        self.current.read().clone()
    }

    pub fn system(&self) -> SystemSettings {
        self.current.read().system.clone()
    }

    pub fn aviation(&self) -> Aviation {
        self.current.read().aviation.clone()
    }

    pub fn clearance_format(&self) -> ClearanceFormat {
        self.current.read().clearance_format.clone()
    }

    /// Merges `patch`, persists the result and only then makes it current.
    ///
    /// Updates are serialized; a failed validation or persist leaves the
    /// current settings untouched.
    pub async fn update(&self, patch: SettingsPatch) -> Result<AdminSettings, SettingsError> {
        self.update_with(patch, |_| {}).await
    }

    /// Like [`update`](Self::update), then runs `on_commit` with the new tree
    /// before the next writer may start.
    ///
    /// Side effects that mirror the settings (poll timers, the log filter)
    /// belong in `on_commit`: two concurrent updates then apply them in the
    /// same order they committed.
    ///
    /// # Parameters
    ///
    /// * `patch` - The partial tree to merge.
    /// * `on_commit` - Called once, only after the merged tree is persisted
    ///   and current.
    ///
    /// # Returns
    ///
    /// The new tree, or the validation or persistence error that stopped it.
    pub async fn update_with<F>(
        &self,
        patch: SettingsPatch,
        on_commit: F,
    ) -> Result<AdminSettings, SettingsError>
    where
        F: FnOnce(&AdminSettings),
    {
        let _writer = self.writer.lock().await;

        let mut merged = self.current.read().clone();
        merged.apply(patch);
        merged.validate()?;

        if let Some(repo) = &self.repository {
            repo.save_settings(&merged)
                .await
                .map_err(SettingsError::Persist)?;
        }

        *self.current.write() = merged.clone();
        on_commit(&merged);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use sea_orm::DbErr;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Default)]
    struct FakeRepository {
        stored: parking_lot::Mutex<Option<Value>>,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl SettingsRepository for FakeRepository {
        async fn load_settings(&self) -> Result<Option<Value>, StoreError> {
            Ok(self.stored.lock().clone())
        }

        async fn save_settings(&self, settings: &AdminSettings) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Database(DbErr::Custom("disk full".into())));
            }
            *self.stored.lock() = Some(serde_json::to_value(settings)?);
            Ok(())
        }
    }

    fn patch(value: Value) -> SettingsPatch {
        SettingsPatch::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn patch_replaces_only_named_leaves() {
        let store = SettingsStore::in_memory();
        let updated = store
            .update(patch(json!({ "clearanceFormat": { "includeAtis": false } })))
            .await
            .unwrap();

        let defaults = AdminSettings::default();
        assert!(!updated.clearance_format.include_atis);
        assert_eq!(
            updated.clearance_format.custom_template,
            defaults.clearance_format.custom_template
        );
        assert_eq!(updated.aviation, defaults.aviation);
        assert_eq!(updated.system, defaults.system);
    }

    #[tokio::test]
    async fn nested_ranges_are_replaced_wholesale() {
        let store = SettingsStore::in_memory();
        let updated = store
            .update(patch(json!({
                "aviation": { "squawkRanges": { "min": 2000, "max": 2777 } }
            })))
            .await
            .unwrap();

        assert_eq!(
            updated.aviation.squawk_ranges,
            SquawkRange {
                min: 2000,
                max: 2777,
                exclude: vec![7500, 7600, 7700],
            }
        );
        assert_eq!(updated.aviation.default_altitudes, vec![1000, 2000, 3000, 4000, 5000]);
    }

    #[test]
    fn non_objects_are_rejected() {
        for value in [json!([1, 2]), json!("x"), json!(null), json!(3)] {
            assert!(matches!(
                SettingsPatch::from_value(value),
                Err(SettingsError::NotAnObject)
            ));
        }
        assert!(matches!(
            SettingsPatch::from_value(json!({ "system": { "maxFlightPlansStored": "many" } })),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let parsed = SettingsPatch::from_value(json!({
            "unknownGroup": {},
            "system": { "maxFlightPlansStored": 20, "autoRefreshInterval": 30000, "legacyFlag": true }
        }))
        .unwrap();

        let system = parsed.system.unwrap();
        assert_eq!(system.auto_refresh_interval_ms, Some(30_000));
        assert_eq!(system.max_flight_plans_stored, Some(20));
    }

    #[tokio::test]
    async fn dashboard_save_form_is_accepted() {
        let store = SettingsStore::in_memory();
        let updated = store
            .update(patch(json!({
                "clearanceFormat": {
                    "customTemplate": "{CALLSIGN} cleared {DESTINATION}",
                    "includeAtis": true,
                    "includeSquawk": false,
                    "includeFlightLevel": true,
                    "includeStartupApproval": true,
                    "includeInitialClimb": true
                },
                "aviation": {
                    "defaultAltitudes": [2000, 3000],
                    "squawkRanges": { "min": 1000, "max": 7777, "exclude": [7500, 7600, 7700] },
                    "enableRunwayValidation": true,
                    "enableSIDValidation": false
                },
                "system": {
                    "maxFlightPlansStored": 30,
                    "autoRefreshInterval": 15000,
                    "controllerPollInterval": 120000,
                    "enableDetailedLogging": true,
                    "enableFlightPlanFiltering": true,
                    "atisPollInterval": 60000
                }
            })))
            .await
            .unwrap();

        assert!(!updated.clearance_format.include_squawk);
        assert!(updated.aviation.enable_runway_validation);
        assert_eq!(updated.system.auto_refresh_interval(), Duration::from_secs(15));
        assert_eq!(updated.system.controller_poll_interval(), Duration::from_secs(120));
        assert_eq!(updated.system.atis_poll_interval(), Duration::from_secs(60));
        assert!(updated.system.enable_flight_plan_filtering);
        assert_eq!(updated.system.log_level, "info");

        let value = serde_json::to_value(&updated).unwrap();
        assert_eq!(value["system"]["controllerPollInterval"], 120_000);
        assert_eq!(value["system"]["autoRefreshInterval"], 15_000);
    }

    #[tokio::test]
    async fn invalid_values_leave_settings_unchanged() {
        let store = SettingsStore::in_memory();
        let before = store.public();

        for bad in [
            json!({ "aviation": { "squawkRanges": { "min": 1800, "max": 7777, "exclude": [] } } }),
            json!({ "aviation": { "squawkRanges": { "min": 7000, "max": 1000, "exclude": [] } } }),
            json!({ "system": { "maxFlightPlansStored": 0 } }),
            json!({ "system": { "atisPollInterval": 5000 } }),
            json!({ "system": { "autoRefreshInterval": 10 } }),
            json!({ "system": { "logLevel": "verbose" } }),
        ] {
            assert!(store.update(patch(bad)).await.is_err());
        }

        assert_eq!(store.public(), before);
        assert_eq!(store.system(), SystemSettings::default());
    }

    #[tokio::test]
    async fn persist_failure_rolls_back() {
        let repo = Arc::new(FakeRepository::default());
        repo.fail_saves.store(true, Ordering::SeqCst);
        let store = SettingsStore::load(Some(repo.clone() as Arc<dyn SettingsRepository>)).await;

        let result = store
            .update(patch(json!({ "system": { "maxFlightPlansStored": 5 } })))
            .await;

        assert!(matches!(result, Err(SettingsError::Persist(_))));
        assert_eq!(store.system().max_flight_plans_stored, 20);
        assert!(repo.stored.lock().is_none());
    }

    #[tokio::test]
    async fn stored_partial_tree_merges_over_defaults() {
        let repo = Arc::new(FakeRepository::default());
        *repo.stored.lock() = Some(json!({
            "system": { "maxFlightPlansStored": 50 },
            "aviation": { "enableSIDValidation": true }
        }));

        let store = SettingsStore::load(Some(repo as Arc<dyn SettingsRepository>)).await;
        assert_eq!(store.system().max_flight_plans_stored, 50);
        assert_eq!(store.system().atis_poll_interval_ms, 300_000);
        assert!(store.aviation().enable_sid_validation);
        assert_eq!(store.clearance_format(), ClearanceFormat::default());
    }

    #[tokio::test]
    async fn successful_update_is_persisted() {
        let repo = Arc::new(FakeRepository::default());
        let store = SettingsStore::load(Some(repo.clone() as Arc<dyn SettingsRepository>)).await;

        store
            .update(patch(json!({ "system": { "enableDetailedLogging": true } })))
            .await
            .unwrap();

        let stored = repo.stored.lock().clone().unwrap();
        assert_eq!(stored["system"]["enableDetailedLogging"], true);
        assert_eq!(stored["clearanceFormat"]["phraseologyStyle"], "ICAO");
    }

    #[test]
    fn public_view_omits_system_group() {
        let value = serde_json::to_value(AdminSettings::default().public()).unwrap();
        assert!(value.get("system").is_none());
        assert!(value.get("clearanceFormat").is_some());
        assert!(value["aviation"].get("enableSIDValidation").is_some());
    }

    #[derive(Debug, Default)]
    struct SlowRepository {
        saves: AtomicUsize,
    }

    #[async_trait]
    impl SettingsRepository for SlowRepository {
        async fn load_settings(&self) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }

        async fn save_settings(&self, _: &AdminSettings) -> Result<(), StoreError> {
            // The first writer persists slowly so the second one queues behind it.
            if self.saves.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_hooks_run_in_commit_order() {
        let repo: Arc<dyn SettingsRepository> = Arc::new(SlowRepository::default());
        let store = Arc::new(SettingsStore::with_settings(AdminSettings::default(), Some(repo)));
        let applied = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let update = |interval: u64| {
            let store = Arc::clone(&store);
            let applied = Arc::clone(&applied);
            tokio::spawn(async move {
                store
                    .update_with(
                        patch(json!({ "system": { "controllerPollInterval": interval } })),
                        |settings| applied.lock().push(settings.system.controller_poll_interval_ms),
                    )
                    .await
                    .unwrap();
            })
        };

        let first = update(60_000);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = update(120_000);
        first.await.unwrap();
        second.await.unwrap();

        let applied = applied.lock().clone();
        assert_eq!(applied, vec![60_000, 120_000]);
        assert_eq!(
            applied.last().copied(),
            Some(store.system().controller_poll_interval_ms)
        );
    }

    #[tokio::test]
    async fn failed_updates_skip_the_commit_hook() {
        let store = SettingsStore::in_memory();
        let mut called = false;
        let result = store
            .update_with(patch(json!({ "system": { "maxFlightPlansStored": 0 } })), |_| {
                called = true
            })
            .await;

        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn squawk_codes_are_octal() {
        assert!(is_squawk_code(1200));
        assert!(is_squawk_code(7777));
        assert!(!is_squawk_code(1280));
        assert!(!is_squawk_code(8000));
    }
}
