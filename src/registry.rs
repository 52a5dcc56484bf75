use std::fmt;

/// Stable opaque handle for a pluggable hardware unit (the machine itself,
/// an extension, or a cartridge). Slot ownership is keyed on this id, so
/// "same owner re-claiming" and "conflicting owner" are simple comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigId(u32);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config#{}", self.0)
    }
}

/// Issues `ConfigId`s and remembers the unit name behind each, for error
/// messages and the administrative queries.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    next_id: u32,
    configs: Vec<(ConfigId, String)>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> ConfigId {
        let id = ConfigId(self.next_id);
        self.next_id += 1;
        self.configs.push((id, name.to_string()));
        tracing::debug!("[REGISTRY] Registered hardware unit {} as {}", name, id);
        id
    }

    pub fn unregister(&mut self, id: ConfigId) {
        self.configs.retain(|(entry, _)| *entry != id);
    }

    pub fn name(&self, id: ConfigId) -> Option<&str> {
        self.configs
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, name)| name.as_str())
    }

    pub fn find(&self, name: &str) -> Option<ConfigId> {
        self.configs
            .iter()
            .find(|(_, entry)| entry == name)
            .map(|(id, _)| *id)
    }
}
