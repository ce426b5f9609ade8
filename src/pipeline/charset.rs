//! Character set resolution for processed resources.
//!
//! Sources in increasing priority: default, `<meta>` in the page, the
//! charset carried by the proxy URL, `Content-Type`, byte order mark.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CharsetPriority {
    Default,
    Meta,
    Url,
    ContentType,
    Bom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    encoding: &'static Encoding,
    priority: CharsetPriority,
}

impl Default for Charset {
    fn default() -> Self {
        Self::fallback(false)
    }
}

impl Charset {
    /// Default for a resource: UTF-8 for scripts and styles, windows-1252
    /// for pages.
    pub fn fallback(is_page: bool) -> Self {
        Self {
            encoding: if is_page { WINDOWS_1252 } else { UTF_8 },
            priority: CharsetPriority::Default,
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn priority(&self) -> CharsetPriority {
        self.priority
    }

    pub fn label(&self) -> &'static str {
        self.encoding.name()
    }

    /// Replace the charset when `label` is known and `priority` beats the
    /// current one. Returns whether it changed.
    pub fn set(&mut self, label: &str, priority: CharsetPriority) -> bool {
        if priority < self.priority {
            return false;
        }
        match Encoding::for_label(label.trim().as_bytes()) {
            Some(encoding) => {
                let changed = encoding != self.encoding;
                self.encoding = encoding;
                self.priority = priority;
                changed
            }
            None => false,
        }
    }

    pub fn from_bom(&mut self, body: &[u8]) -> bool {
        match Encoding::for_bom(body) {
            Some((encoding, _)) => self.set(encoding.name(), CharsetPriority::Bom),
            None => false,
        }
    }

    pub fn from_content_type(&mut self, content_type: &str) -> bool {
        match charset_param(content_type) {
            Some(label) => self.set(label, CharsetPriority::ContentType),
            None => false,
        }
    }

    pub fn from_url(&mut self, label: Option<&str>) -> bool {
        label.is_some_and(|label| self.set(label, CharsetPriority::Url))
    }

    /// Adopt a `<meta>` declaration. Returns whether the page must be
    /// decoded again.
    pub fn from_meta(&mut self, label: &str) -> bool {
        self.set(label, CharsetPriority::Meta)
    }

    pub fn decode(&self, body: &[u8]) -> String {
        let (text, _, _) = self.encoding.decode(body);
        text.into_owned()
    }

    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.encoding.encode(text);
        bytes.into_owned()
    }
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
            .filter(|v| !v.is_empty())
    })
}

/// Charset declared by `<meta charset>` or `<meta http-equiv content>`
/// within the first kilobytes of a page.
pub fn meta_charset(html: &str) -> Option<String> {
    const SCAN_LIMIT: usize = 1024 * 4;
    let head = &html[..floor_char_boundary(html, SCAN_LIMIT)];
    let lower = head.to_ascii_lowercase();

    let mut from = 0;
    while let Some(pos) = lower[from..].find("<meta") {
        let start = from + pos;
        let end = lower[start..].find('>').map_or(lower.len(), |e| start + e);
        let tag = &lower[start..end];
        if let Some(idx) = tag.find("charset=") {
            let value = tag[idx + "charset=".len()..].trim_start_matches(['"', '\'']);
            let label: String = value
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
                .collect();
            if !label.is_empty() {
                return Some(label);
            }
        }
        from = end;
    }
    None
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (0..=index).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priorities_win() {
        let mut charset = Charset::fallback(true);
        assert_eq!(charset.label(), "windows-1252");

        assert!(charset.from_meta("utf-8"));
        assert!(charset.from_content_type("text/html; charset=ISO-8859-2"));
        assert_eq!(charset.label(), "ISO-8859-2");
        assert!(!charset.from_meta("utf-8"));
        assert_eq!(charset.priority(), CharsetPriority::ContentType);

        assert!(charset.from_bom(b"\xEF\xBB\xBFhello"));
        assert_eq!(charset.label(), "UTF-8");
        assert!(!charset.from_url(Some("koi8-r")));
    }

    #[test]
    fn url_charset_beats_meta() {
        let mut charset = Charset::fallback(false);
        assert!(charset.from_url(Some("windows-1251")));
        assert!(!charset.from_meta("utf-8"));
        assert_eq!(charset.label(), "windows-1251");
    }

    #[test]
    fn unknown_labels_are_ignored() {
        let mut charset = Charset::fallback(false);
        assert!(!charset.set("no-such-charset", CharsetPriority::Bom));
        assert_eq!(charset.priority(), CharsetPriority::Default);
    }

    #[test]
    fn finds_meta_declarations() {
        assert_eq!(meta_charset("<head><meta charset=\"koi8-r\"></head>").as_deref(), Some("koi8-r"));
        assert_eq!(
            meta_charset("<META http-equiv=\"Content-Type\" content=\"text/html; charset=windows-1251\">").as_deref(),
            Some("windows-1251")
        );
        assert_eq!(meta_charset("<meta name=\"x\"><p>charset=utf-8</p>"), None);
    }

    #[test]
    fn decodes_with_selected_encoding() {
        let mut charset = Charset::fallback(false);
        charset.set("windows-1251", CharsetPriority::ContentType);
        assert_eq!(charset.decode(&[0xCF, 0xF0, 0xE8]), "При");
        assert_eq!(charset.encode("При"), vec![0xCF, 0xF0, 0xE8]);
    }
}
