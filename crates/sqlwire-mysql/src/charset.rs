//! Character set and collation ids.
//!
//! The handshake carries a single collation id; result columns carry the
//! collation of each value. Only the id matters on the wire, names are for
//! configuration and `SET NAMES`.

/// Collation id of the `binary` pseudo-charset.
pub const BINARY_CHARSET_ID: u16 = 63;

/// A character set / collation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    pub id: u16,
    pub name: &'static str,
    pub collation: &'static str,
    /// The collation MySQL picks when only the charset name is given.
    pub is_default: bool,
}

impl Charset {
    pub const fn is_binary(&self) -> bool {
        self.id == BINARY_CHARSET_ID
    }

    /// Whether values in this charset decode as UTF-8.
    pub fn is_utf8(&self) -> bool {
        matches!(self.name, "utf8mb4" | "utf8mb3" | "utf8" | "ascii")
    }

    /// The id sent in the one-byte handshake field.
    ///
    /// Collations above 255 cannot be expressed there; they fall back to the
    /// charset's default and are applied with `SET NAMES` after connecting.
    pub fn handshake_id(&self) -> u8 {
        u8::try_from(self.id).unwrap_or_else(|_| {
            charset_by_name(self.name)
                .and_then(|c| u8::try_from(c.id).ok())
                .unwrap_or(45)
        })
    }
}

macro_rules! charsets {
    ($(($id:expr, $name:expr, $collation:expr, $default:expr)),* $(,)?) => {
        &[$(Charset { id: $id, name: $name, collation: $collation, is_default: $default }),*]
    };
}

static CHARSETS: &[Charset] = charsets![
    (1, "big5", "big5_chinese_ci", true),
    (3, "dec8", "dec8_swedish_ci", true),
    (4, "cp850", "cp850_general_ci", true),
    (6, "hp8", "hp8_english_ci", true),
    (7, "koi8r", "koi8r_general_ci", true),
    (5, "latin1", "latin1_german1_ci", false),
    (8, "latin1", "latin1_swedish_ci", true),
    (47, "latin1", "latin1_bin", false),
    (48, "latin1", "latin1_general_ci", false),
    (49, "latin1", "latin1_general_cs", false),
    (9, "latin2", "latin2_general_ci", true),
    (10, "swe7", "swe7_swedish_ci", true),
    (11, "ascii", "ascii_general_ci", true),
    (65, "ascii", "ascii_bin", false),
    (12, "ujis", "ujis_japanese_ci", true),
    (13, "sjis", "sjis_japanese_ci", true),
    (16, "hebrew", "hebrew_general_ci", true),
    (18, "tis620", "tis620_thai_ci", true),
    (19, "euckr", "euckr_korean_ci", true),
    (22, "koi8u", "koi8u_general_ci", true),
    (24, "gb2312", "gb2312_chinese_ci", true),
    (25, "greek", "greek_general_ci", true),
    (26, "cp1250", "cp1250_general_ci", true),
    (28, "gbk", "gbk_chinese_ci", true),
    (30, "latin5", "latin5_turkish_ci", true),
    (32, "armscii8", "armscii8_general_ci", true),
    (33, "utf8", "utf8_general_ci", true),
    (83, "utf8", "utf8_bin", false),
    (192, "utf8", "utf8_unicode_ci", false),
    (35, "ucs2", "ucs2_general_ci", true),
    (36, "cp866", "cp866_general_ci", true),
    (37, "keybcs2", "keybcs2_general_ci", true),
    (38, "macce", "macce_general_ci", true),
    (39, "macroman", "macroman_general_ci", true),
    (40, "cp852", "cp852_general_ci", true),
    (41, "latin7", "latin7_general_ci", true),
    (51, "cp1251", "cp1251_general_ci", true),
    (54, "utf16", "utf16_general_ci", true),
    (56, "utf16le", "utf16le_general_ci", true),
    (57, "cp1256", "cp1256_general_ci", true),
    (59, "cp1257", "cp1257_general_ci", true),
    (60, "utf32", "utf32_general_ci", true),
    (63, "binary", "binary", true),
    (92, "geostd8", "geostd8_general_ci", true),
    (95, "cp932", "cp932_japanese_ci", true),
    (97, "eucjpms", "eucjpms_japanese_ci", true),
    (248, "gb18030", "gb18030_chinese_ci", true),
    (45, "utf8mb4", "utf8mb4_general_ci", true),
    (46, "utf8mb4", "utf8mb4_bin", false),
    (224, "utf8mb4", "utf8mb4_unicode_ci", false),
    (255, "utf8mb4", "utf8mb4_0900_ai_ci", false),
    (309, "utf8mb4", "utf8mb4_0900_bin", false),
];

/// Look up a charset by name, returning its default collation.
///
/// `utf8mb3` is accepted as an alias of `utf8`.
pub fn charset_by_name(name: &str) -> Option<&'static Charset> {
    let name = name.trim().to_ascii_lowercase();
    let name = if name == "utf8mb3" { "utf8" } else { name.as_str() };
    CHARSETS.iter().find(|c| c.name == name && c.is_default)
}

/// Look up a collation by name (e.g. `utf8mb4_unicode_ci`).
pub fn charset_by_collation(collation: &str) -> Option<&'static Charset> {
    let collation = collation.trim().to_ascii_lowercase();
    CHARSETS.iter().find(|c| c.collation == collation)
}

/// Look up a collation by id.
pub fn charset_by_id(id: u16) -> Option<&'static Charset> {
    CHARSETS.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_by_name_collation_and_id() {
        let utf8mb4 = charset_by_name("UTF8MB4").unwrap();
        assert_eq!(utf8mb4.id, 45);
        assert!(utf8mb4.is_utf8());

        assert_eq!(charset_by_name("utf8mb3").unwrap().id, 33);
        assert_eq!(charset_by_collation("utf8mb4_0900_ai_ci").unwrap().id, 255);
        assert!(charset_by_id(63).unwrap().is_binary());
        assert_eq!(charset_by_id(8).unwrap().name, "latin1");
        assert!(charset_by_name("klingon").is_none());
    }

    #[test]
    fn wide_collation_falls_back_in_handshake() {
        let wide = charset_by_id(309).unwrap();
        assert_eq!(wide.handshake_id(), 45);
        assert_eq!(charset_by_id(224).unwrap().handshake_id(), 224);
    }

    #[test]
    fn exactly_one_default_per_name() {
        for c in CHARSETS {
            let defaults = CHARSETS
                .iter()
                .filter(|o| o.name == c.name && o.is_default)
                .count();
            assert_eq!(defaults, 1, "charset {}", c.name);
        }
    }
}
