use std::{collections::HashMap, path::Path};

use unicode_normalization::UnicodeNormalization as _;

use crate::error::ContextError;

/// The table which associates a Private-Use-Area codepoint to the Unicode sequence the
/// OCR engine actually recognized. A single PUA glyph may expand into more than one
/// character, for example into a sequence of Hangul jamo which only composes into a
/// syllable after normalization.
///
/// The table shipped with the crate covers the documented Adobe corporate-use subarea
/// (oldstyle figures, small capitals and small punctuation forms). Engine-specific
/// tables can be loaded from a JSON file and are merged on top of the built-in entries.
#[derive(Debug, Clone)]
pub struct PuaTable {
    entries: HashMap<char, String>,
}

impl Default for PuaTable {
    fn default() -> Self {
        // The embedded table is validated by the tests, so a parse failure here can
        // only be introduced by editing the asset itself.
        Self::from_json_str(include_str!("../assets/default_pua_table.json"))
            .unwrap_or_else(|_| PuaTable {
                entries: HashMap::new(),
            })
    }
}

impl PuaTable {
    /// Create an empty table, to which entries can be added manually.
    pub fn empty() -> Self {
        PuaTable {
            entries: HashMap::new(),
        }
    }

    /// Parse a table from a JSON object whose keys are either the PUA characters themselves
    /// or their `U+XXXX` notation, and whose values are the replacement strings.
    pub fn from_json_str(content: &str) -> Result<Self, ContextError> {
        let raw_entries: HashMap<String, String> =
            serde_json::from_str(content).map_err(|error| {
                ContextError::with_error("Unable to parse the mapping table", &error)
            })?;

        let mut entries = HashMap::with_capacity(raw_entries.len());
        for (key, replacement) in raw_entries {
            let character = parse_codepoint_key(&key)?;
            if !is_private_use(character) {
                log::warn!(
                    "The mapping table key {:?} is not a Private-Use-Area codepoint, keeping it anyway",
                    character
                );
            }
            entries.insert(character, replacement);
        }

        Ok(PuaTable { entries })
    }

    /// Load a table from a JSON file on disk.
    pub fn from_json_file(path: &Path) -> Result<Self, ContextError> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            ContextError::with_error(
                format!("Unable to read the mapping table {:?}", path),
                &error,
            )
        })?;
        Self::from_json_str(&content)
    }

    /// Merge another table into this one. Entries from the other table win on conflict,
    /// so a user-supplied table overrides the built-in assignments.
    pub fn merge(&mut self, other: PuaTable) {
        self.entries.extend(other.entries);
    }

    /// Insert a single association from a PUA character to its replacement sequence.
    pub fn insert(&mut self, character: char, replacement: impl Into<String>) {
        self.entries.insert(character, replacement.into());
    }

    /// The number of associations in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table contains no associations at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the replacement sequence for a single character. Characters without an
    /// entry map to themselves.
    pub fn replacement(&self, character: char) -> Option<&str> {
        self.entries.get(&character).map(String::as_str)
    }

    /// Convert the PUA characters of a string back into their Unicode sequences,
    /// leaving every other character untouched. The result is NFC-normalized so that
    /// decomposed sequences (such as Hangul jamo) compose into the expected syllables.
    pub fn remap(&self, text: &str) -> String {
        text.chars()
            .flat_map(|character| {
                match self.entries.get(&character) {
                    Some(replacement) => replacement.chars().collect::<Vec<_>>(),
                    None => vec![character],
                }
            })
            .nfc()
            .collect()
    }

    /// Expand a single character through the table, without normalization. This is the
    /// per-glyph variant used by the overlay layout, which needs to know how many
    /// characters a single source glyph produced.
    pub fn expand(&self, character: char) -> String {
        match self.entries.get(&character) {
            Some(replacement) => replacement.clone(),
            None => character.to_string(),
        }
    }
}

/// Whether the character lies in one of the Unicode Private Use Areas: the BMP block
/// U+E000..U+F8FF or the two supplementary planes 15 and 16.
pub fn is_private_use(character: char) -> bool {
    matches!(
        character as u32,
        0xE000..=0xF8FF | 0xF0000..=0xFFFFD | 0x100000..=0x10FFFD
    )
}

/// Whether any character of the string requires remapping through a PUA table.
pub fn contains_private_use(text: &str) -> bool {
    text.chars().any(is_private_use)
}

/// Parse a mapping table key, which is either a literal single character or the
/// `U+XXXX` notation of a codepoint.
fn parse_codepoint_key(key: &str) -> Result<char, ContextError> {
    if let Some(hexadecimal) = key.strip_prefix("U+").or_else(|| key.strip_prefix("u+")) {
        let codepoint = u32::from_str_radix(hexadecimal, 16).map_err(|error| {
            ContextError::with_error(
                format!("Unable to parse the mapping table key {:?}", key),
                &error,
            )
        })?;
        return char::from_u32(codepoint).ok_or(ContextError::with_context(format!(
            "The mapping table key {:?} is not a valid Unicode scalar value",
            key
        )));
    }

    let mut characters = key.chars();
    match (characters.next(), characters.next()) {
        (Some(character), None) => Ok(character),
        _ => Err(ContextError::with_context(format!(
            "The mapping table key {:?} must be a single character or the U+XXXX notation",
            key
        ))),
    }
}
