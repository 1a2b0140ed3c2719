//! Instrument EEPROM settings: parsing, editing, and write-back ordering.

use std::collections::BTreeMap;

use potlib_core::error::{Error, Result};

/// One EEPROM entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingEntry {
    /// Position of this entry in the instrument's write sequence.
    pub ordinal: usize,
    /// Raw value text as reported by the instrument.
    pub value: String,
}

/// The instrument's EEPROM settings map.
///
/// The settings response is a colon-separated list of `key.value` pairs.
/// Write-back sends the values alone, and the firmware assigns them to
/// slots strictly by position, so the ordinal each key was reported at
/// must be preserved across edits. Keys are otherwise unordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: BTreeMap<String, SettingEntry>,
}

impl Settings {
    /// Create an empty settings map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the payload of a settings response (the `S` prefix already
    /// stripped), e.g. `max_time.180:r100_trim.0:r3k_trim.23`.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (ordinal, field) in payload.trim().split(':').enumerate() {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once('.').ok_or_else(|| {
                Error::Protocol(format!("malformed settings field {field:?}"))
            })?;
            entries.insert(
                key.to_string(),
                SettingEntry {
                    ordinal,
                    value: value.to_string(),
                },
            );
        }
        if entries.is_empty() {
            return Err(Error::Protocol("settings response carried no fields".into()));
        }
        Ok(Self { entries })
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Replace the value of an existing key, keeping its write position.
    ///
    /// Unknown keys are rejected: the write sequence is positional, so a
    /// key the instrument never reported has no slot to land in.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.into();
                Ok(())
            }
            None => Err(Error::InvalidParameter(format!(
                "unknown setting {key:?}"
            ))),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, entry)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingEntry)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    /// The values in instrument write order, each followed by a space.
    ///
    /// This is the payload of the settings-write command.
    pub fn write_values(&self) -> String {
        let mut ordered: Vec<&SettingEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| e.ordinal);

        let mut out = String::new();
        for entry in ordered {
            out.push_str(&entry.value);
            out.push(' ');
        }
        out
    }
}
