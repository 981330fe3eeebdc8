//! Name-keyed registry of open maps
//!
//! Callers that only know a map by name (the C bindings, scripting hosts)
//! go through a registry. Each name is opened once per registry and
//! reference counted: every `open_*` adds a reference, every `close` drops
//! one, and the handle detaches when the count reaches zero. Operations on a
//! name that was never opened open it lazily with the registry defaults.

use crate::error::{MapError, Result};
use crate::map::{MapConfig, NamedMap, OpenMode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

struct Entry {
    map: Arc<NamedMap>,
    refs: usize,
}

/// Reference-counted set of open maps
pub struct MapRegistry {
    maps: Mutex<HashMap<String, Entry>>,
    defaults: MapConfig,
}

impl Default for MapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::with_defaults(MapConfig::default())
    }

    /// Registry whose lazy opens use `defaults`
    pub fn with_defaults(defaults: MapConfig) -> Self {
        Self {
            maps: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static MapRegistry {
        static GLOBAL: OnceLock<MapRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MapRegistry::new)
    }

    /// Open `name` (or take another reference to it) with `config`
    ///
    /// If the name is already open its existing handle is shared and
    /// `config` is ignored.
    pub fn open(&self, name: &str, config: MapConfig) -> Result<Arc<NamedMap>> {
        if let Some(map) = self.add_ref(name) {
            return Ok(map);
        }

        // Attaching can wait on the named lock; other names stay usable meanwhile
        let opened = Arc::new(NamedMap::try_open(name, config)?);

        let mut maps = self.maps.lock();
        if let Some(entry) = maps.get_mut(name) {
            // Another caller registered the name first; ours detaches on drop
            entry.refs += 1;
            return Ok(Arc::clone(&entry.map));
        }
        maps.insert(
            name.to_string(),
            Entry {
                map: Arc::clone(&opened),
                refs: 1,
            },
        );
        debug!(name, "registered named map");
        Ok(opened)
    }

    fn add_ref(&self, name: &str) -> Option<Arc<NamedMap>> {
        let mut maps = self.maps.lock();
        let entry = maps.get_mut(name)?;
        entry.refs += 1;
        Some(Arc::clone(&entry.map))
    }

    pub fn open_or_create(&self, name: &str, capacity: usize) -> Result<Arc<NamedMap>> {
        self.open(
            name,
            MapConfig {
                capacity,
                mode: OpenMode::OpenOrCreate,
                ..self.defaults.clone()
            },
        )
    }

    pub fn open_only(&self, name: &str) -> Result<Arc<NamedMap>> {
        self.open(
            name,
            MapConfig {
                mode: OpenMode::OpenOnly,
                ..self.defaults.clone()
            },
        )
    }

    /// Handle for `name`, opening it with the defaults if needed
    pub fn get(&self, name: &str) -> Result<Arc<NamedMap>> {
        if let Some(entry) = self.maps.lock().get(name) {
            return Ok(Arc::clone(&entry.map));
        }
        self.open(name, self.defaults.clone())
    }

    /// Drop one reference; the last one closes the map
    pub fn close(&self, name: &str) -> Result<()> {
        let removed = {
            let mut maps = self.maps.lock();
            let entry = maps
                .get_mut(name)
                .ok_or_else(|| MapError::NotOpen(name.to_string()))?;
            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }
            maps.remove(name)
        };

        match removed {
            Some(entry) => {
                debug!(name, "unregistered named map");
                entry.map.close()
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.maps.lock().contains_key(name)
    }

    /// Outstanding references to `name`
    pub fn ref_count(&self, name: &str) -> usize {
        self.maps.lock().get(name).map_or(0, |e| e.refs)
    }

    pub fn get_size(&self, name: &str) -> Result<usize> {
        self.get(name)?.size()
    }

    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.get(name)?.read_bytes()
    }

    pub fn read_ints(&self, name: &str) -> Result<Vec<i32>> {
        self.get(name)?.read_ints()
    }

    pub fn read_floats(&self, name: &str) -> Result<Vec<f32>> {
        self.get(name)?.read_floats()
    }

    pub fn read_doubles(&self, name: &str) -> Result<Vec<f64>> {
        self.get(name)?.read_doubles()
    }

    pub fn read_text(&self, name: &str) -> Result<String> {
        self.get(name)?.read_text()
    }

    pub fn write_bytes(&self, name: &str, data: &[u8]) -> Result<()> {
        self.get(name)?.write_bytes(data)
    }

    pub fn write_ints(&self, name: &str, data: &[i32]) -> Result<()> {
        self.get(name)?.write_ints(data)
    }

    pub fn write_floats(&self, name: &str, data: &[f32]) -> Result<()> {
        self.get(name)?.write_floats(data)
    }

    pub fn write_doubles(&self, name: &str, data: &[f64]) -> Result<()> {
        self.get(name)?.write_doubles(data)
    }

    pub fn write_text(&self, name: &str, text: &str) -> Result<()> {
        self.get(name)?.write_text(text)
    }
}
