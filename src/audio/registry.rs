use log::{debug, warn};

use crate::audio::backends;
use crate::audio::Api;
use crate::error::{OrchestraError, Result};
use crate::models::ApiType;

/// Constructor of one backend
pub type BackendFactory = fn() -> Result<Box<dyn Api>>;

/// A backend compiled into this build
#[derive(Debug, Clone, Copy)]
pub struct BackendEntry {
    pub api: ApiType,
    pub factory: BackendFactory,
}

impl BackendEntry {
    pub fn new(api: ApiType, factory: BackendFactory) -> Self {
        Self { api, factory }
    }
}

/// Ordered capability list of the backends an [`Interface`] may select.
///
/// The dummy backend is always present and always last, so selection can
/// never come up empty.
///
/// [`Interface`]: crate::audio::Interface
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
}

impl BackendRegistry {
    pub fn new(entries: Vec<BackendEntry>) -> Self {
        let mut entries: Vec<BackendEntry> = entries
            .into_iter()
            .filter(|entry| entry.api != ApiType::Dummy)
            .collect();
        entries.push(backends::dummy::entry());
        Self { entries }
    }

    /// Backends enabled by the cargo features of this build
    pub fn compiled() -> Self {
        Self::new(backends::compiled_entries())
    }

    /// Same ordering, with the dummy backend built by `factory`
    pub fn with_dummy(entries: Vec<BackendEntry>, factory: BackendFactory) -> Self {
        let mut registry = Self::new(entries);
        if let Some(last) = registry.entries.last_mut() {
            last.factory = factory;
        }
        registry
    }

    pub fn api_types(&self) -> Vec<ApiType> {
        self.entries.iter().map(|entry| entry.api).collect()
    }

    pub fn is_compiled(&self, api: ApiType) -> bool {
        self.entries.iter().any(|entry| entry.api == api)
    }

    pub fn create(&self, api: ApiType) -> Result<Box<dyn Api>> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.api == api)
            .ok_or_else(|| {
                OrchestraError::unsupported(format!("backend '{}' is not compiled in", api))
            })?;
        (entry.factory)()
    }

    /// Explicit choice, or the first backend that reports a device. With no
    /// device anywhere, the last backend that could be created is used.
    pub fn select(&self, preferred: Option<ApiType>) -> Result<Box<dyn Api>> {
        if let Some(api) = preferred {
            return self.create(api);
        }

        let mut fallback = None;
        for entry in &self.entries {
            match (entry.factory)() {
                Ok(mut api) => {
                    let count = api.device_count();
                    debug!("backend '{}' reports {} device(s)", entry.api, count);
                    if count > 0 {
                        return Ok(api);
                    }
                    fallback = Some(api);
                }
                Err(e) => warn!("backend '{}' unavailable: {}", entry.api, e),
            }
        }

        fallback.ok_or_else(|| {
            OrchestraError::DeviceUnavailable("no audio backend could be initialized".to_string())
        })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::compiled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backends::{DummyApi, Pacing};

    fn empty_alsa() -> Result<Box<dyn Api>> {
        Ok(Box::new(DummyApi::with_devices(Vec::new(), Pacing::Unthrottled)))
    }

    fn broken_jack() -> Result<Box<dyn Api>> {
        Err(OrchestraError::DriverError("server not running".to_string()))
    }

    #[test]
    fn test_dummy_is_always_last() {
        let registry = BackendRegistry::new(vec![
            backends::dummy::entry(),
            BackendEntry::new(ApiType::Alsa, empty_alsa),
        ]);
        assert_eq!(registry.api_types(), vec![ApiType::Alsa, ApiType::Dummy]);

        let registry = BackendRegistry::new(Vec::new());
        assert_eq!(registry.api_types(), vec![ApiType::Dummy]);
        assert!(registry.is_compiled(ApiType::Dummy));
        assert!(!registry.is_compiled(ApiType::Asio));
    }

    #[test]
    fn test_create_unknown_backend_is_unsupported() {
        let registry = BackendRegistry::new(Vec::new());
        let err = registry.create(ApiType::Pulse).err().unwrap();
        assert!(matches!(err, OrchestraError::Unsupported { .. }));
    }

    #[test]
    fn test_select_skips_backends_without_devices() {
        let registry = BackendRegistry::new(vec![
            BackendEntry::new(ApiType::Jack, broken_jack),
            BackendEntry::new(ApiType::Alsa, empty_alsa),
        ]);
        let api = registry.select(None).unwrap();
        assert_eq!(api.api_type(), ApiType::Dummy);
    }

    #[test]
    fn test_select_falls_back_to_last_created() {
        let registry = BackendRegistry::with_dummy(
            vec![BackendEntry::new(ApiType::Alsa, empty_alsa)],
            empty_alsa,
        );
        let mut api = registry.select(None).unwrap();
        assert_eq!(api.device_count(), 0);
    }

    #[test]
    fn test_select_explicit_backend() {
        let registry = BackendRegistry::new(vec![BackendEntry::new(ApiType::Jack, broken_jack)]);
        assert!(matches!(
            registry.select(Some(ApiType::Jack)).err().unwrap(),
            OrchestraError::DriverError(_)
        ));
        assert_eq!(
            registry.select(Some(ApiType::Dummy)).unwrap().api_type(),
            ApiType::Dummy
        );
    }
}
