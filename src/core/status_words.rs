//! ISO 7816-4 status word table.
//!
//! The table is a `;`-separated file with a `SW1;SW2;MEANING;DESCRIPTION`
//! header. Status bytes are hex strings; an `X` stands for any nibble, so
//! `61;XX` covers every `61 ..` response. Exact rows win over wildcards.

use std::path::Path;
use std::sync::OnceLock;

use crate::core::error::{Result, SmartcardError};
use crate::core::utils::format_hex_spaced;

/// Table shipped with the crate.
pub const DEFAULT_TABLE: &str = include_str!("../../data/apdu_response.csv");

static GLOBAL: OnceLock<StatusWordCatalog> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWordEntry {
    pub sw1: String,
    pub sw2: String,
    /// Short meaning, e.g. "Checking error".
    pub meaning: String,
    pub description: String,
}

impl StatusWordEntry {
    fn is_exact(&self) -> bool {
        !self.sw1.contains('X') && !self.sw2.contains('X')
    }

    fn matches(&self, sw1: &str, sw2: &str) -> bool {
        pattern_matches(&self.sw1, sw1) && pattern_matches(&self.sw2, sw2)
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    pattern.len() == value.len()
        && pattern
            .chars()
            .zip(value.chars())
            .all(|(p, v)| p == 'X' || p == v)
}

fn is_status_cell(cell: &str) -> bool {
    cell.len() == 2 && cell.chars().all(|c| c.is_ascii_hexdigit() || c == 'X')
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusWordCatalog {
    entries: Vec<StatusWordEntry>,
}

impl StatusWordCatalog {
    /// Parse a status word table. A leading byte order mark is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (_, header) = lines
            .next()
            .ok_or_else(|| SmartcardError::Catalog("empty table".to_string()))?;
        let columns: Vec<String> = header
            .split(';')
            .map(|column| column.trim().to_uppercase())
            .collect();
        if columns.len() < 4 || columns[0] != "SW1" || columns[1] != "SW2" {
            return Err(SmartcardError::Catalog(format!(
                "unexpected header '{}'",
                header.trim()
            )));
        }

        let mut entries = Vec::new();
        for (index, line) in lines {
            let fields: Vec<&str> = line.splitn(4, ';').map(str::trim).collect();
            if fields.len() < 4 {
                return Err(SmartcardError::Catalog(format!(
                    "line {}: expected 4 columns",
                    index + 1
                )));
            }

            let sw1 = fields[0].to_uppercase();
            let sw2 = fields[1].to_uppercase();
            if !is_status_cell(&sw1) || !is_status_cell(&sw2) {
                return Err(SmartcardError::Catalog(format!(
                    "line {}: invalid status bytes '{};{}'",
                    index + 1,
                    fields[0],
                    fields[1]
                )));
            }

            entries.push(StatusWordEntry {
                sw1,
                sw2,
                meaning: fields[2].to_string(),
                description: fields[3].to_string(),
            });
        }

        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| SmartcardError::Catalog(format!("{}: {}", path.display(), err)))?;
        Self::parse(&text)
    }

    /// Process-wide table, loaded from [`DEFAULT_TABLE`] on first use unless
    /// [`StatusWordCatalog::install_global`] came first.
    pub fn global() -> &'static StatusWordCatalog {
        GLOBAL.get_or_init(|| {
            Self::parse(DEFAULT_TABLE).unwrap_or_else(|err| {
                log::error!("Built-in status word table is invalid: {}", err);
                Self::default()
            })
        })
    }

    /// Use `catalog` as the process-wide table. Fails once a table is loaded.
    pub fn install_global(catalog: StatusWordCatalog) -> Result<()> {
        GLOBAL
            .set(catalog)
            .map_err(|_| SmartcardError::Catalog("status word table already loaded".to_string()))
    }

    pub fn entries(&self) -> &[StatusWordEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive lookup of a status word given as hex strings.
    pub fn lookup(&self, sw1: &str, sw2: &str) -> Option<&StatusWordEntry> {
        let sw1 = sw1.trim().to_uppercase();
        let sw2 = sw2.trim().to_uppercase();

        self.entries
            .iter()
            .find(|entry| entry.is_exact() && entry.matches(&sw1, &sw2))
            .or_else(|| self.entries.iter().find(|entry| entry.matches(&sw1, &sw2)))
    }

    pub fn lookup_bytes(&self, sw1: u8, sw2: u8) -> Option<&StatusWordEntry> {
        self.lookup(&format!("{sw1:02X}"), &format!("{sw2:02X}"))
    }

    /// Multi-line diagnosis of a status word, `None` when it is not listed.
    ///
    /// ```text
    /// response (Normal processing) > No further qualification
    ///     sw1 : 90
    ///     sw2 : 00
    ///     message : 01 02
    /// ```
    pub fn format(&self, sw1: &str, sw2: &str, message: Option<&[u8]>) -> Option<String> {
        let entry = self.lookup(sw1, sw2)?;
        let mut text = format!(
            "response ({}) > {}\n\tsw1 : {}\n\tsw2 : {}",
            entry.meaning,
            entry.description,
            sw1.trim().to_uppercase(),
            sw2.trim().to_uppercase()
        );
        if let Some(message) = message.filter(|message| !message.is_empty()) {
            text.push_str(&format!("\n\tmessage : {}", format_hex_spaced(message)));
        }
        Some(text)
    }

    pub fn format_bytes(&self, sw1: u8, sw2: u8, message: Option<&[u8]>) -> Option<String> {
        self.format(&format!("{sw1:02X}"), &format!("{sw2:02X}"), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StatusWordCatalog {
        StatusWordCatalog::parse(DEFAULT_TABLE).unwrap()
    }

    #[test]
    fn test_builtin_table_parses() {
        let catalog = catalog();
        assert!(catalog.len() > 40);
    }

    #[test]
    fn test_lookup_success_word() {
        let catalog = catalog();
        let entry = catalog.lookup("90", "00").unwrap();
        assert_eq!(entry.meaning, "Normal processing");
        assert_eq!(entry.description, "No further qualification");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = catalog();
        assert_eq!(
            catalog.lookup("6a", "82").unwrap().description,
            "File or application not found"
        );
        assert_eq!(catalog.lookup_bytes(0x6A, 0x82), catalog.lookup("6A", "82"));
    }

    #[test]
    fn test_unlisted_word_has_no_entry() {
        let catalog = catalog();
        assert!(catalog.lookup("FF", "FF").is_none());
        assert!(catalog.format("FF", "FF", None).is_none());
    }

    #[test]
    fn test_wildcards_and_exact_rows() {
        let catalog = catalog();
        assert_eq!(catalog.lookup("61", "10").unwrap().sw2, "XX");
        assert_eq!(catalog.lookup("63", "C3").unwrap().sw2, "CX");
        assert_eq!(catalog.lookup("63", "81").unwrap().sw2, "81");
        assert_eq!(catalog.lookup("63", "00").unwrap().sw2, "00");
    }

    #[test]
    fn test_description_may_contain_separator() {
        let catalog = catalog();
        assert!(catalog
            .lookup("6C", "08")
            .unwrap()
            .description
            .starts_with("Wrong Le field; SW2"));
    }

    #[test]
    fn test_format_without_message() {
        let text = catalog().format("90", "00", None).unwrap();
        assert_eq!(
            text,
            "response (Normal processing) > No further qualification\n\tsw1 : 90\n\tsw2 : 00"
        );
        assert!(!text.contains("message"));

        let empty = catalog().format("90", "00", Some(&[])).unwrap();
        assert_eq!(empty, text);
    }

    #[test]
    fn test_format_with_message() {
        let text = catalog()
            .format_bytes(0x90, 0x00, Some(&[0x01, 0xAB]))
            .unwrap();
        assert!(text.ends_with("\n\tmessage : 01 AB"));
    }

    #[test]
    fn test_parse_tolerates_bom_and_blank_lines() {
        let catalog =
            StatusWordCatalog::parse("\u{feff}sw1;sw2;meaning;description\n\n90;00;OK;Fine\n")
                .unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.lookup("90", "00").unwrap().meaning, "OK");
    }

    #[test]
    fn test_parse_rejects_bad_tables() {
        assert!(StatusWordCatalog::parse("").is_err());
        assert!(StatusWordCatalog::parse("A;B;C;D\n90;00;OK;Fine").is_err());
        assert!(StatusWordCatalog::parse("SW1;SW2;M;D\n90;00;OK").is_err());
        assert!(StatusWordCatalog::parse("SW1;SW2;M;D\n9G;00;OK;Fine").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = StatusWordCatalog::load("/nonexistent/apdu_response.csv").unwrap_err();
        assert!(matches!(err, SmartcardError::Catalog(_)));
    }
}
