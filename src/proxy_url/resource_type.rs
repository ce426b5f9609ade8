//! Letter-coded resource classification carried in proxy URLs.

use bitflags::bitflags;

bitflags! {
    /// Kind of load a proxy URL was generated for.
    ///
    /// The browser-side sandbox picks the flags when it rewrites a URL; the
    /// pipeline uses them to decide how the destination response is treated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceType: u16 {
        const IFRAME = 1 << 0;
        const FORM = 1 << 1;
        const SCRIPT = 1 << 2;
        const EVENT_SOURCE = 1 << 3;
        const HTML_IMPORT = 1 << 4;
        const WEB_SOCKET = 1 << 5;
        const SERVICE_WORKER = 1 << 6;
        const AJAX = 1 << 7;
        const OBJECT = 1 << 8;
    }
}

/// Wire order of the flag letters.
const LETTERS: [(ResourceType, char); 9] = [
    (ResourceType::IFRAME, 'i'),
    (ResourceType::FORM, 'f'),
    (ResourceType::SCRIPT, 's'),
    (ResourceType::EVENT_SOURCE, 'e'),
    (ResourceType::HTML_IMPORT, 'h'),
    (ResourceType::WEB_SOCKET, 'w'),
    (ResourceType::SERVICE_WORKER, 'c'),
    (ResourceType::AJAX, 'a'),
    (ResourceType::OBJECT, 'o'),
];

impl ResourceType {
    /// Render the flags as their letter code (empty for no flags).
    pub fn to_letters(self) -> String {
        LETTERS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, letter)| *letter)
            .collect()
    }

    /// Parse a letter code. Unknown letters make the whole code invalid.
    pub fn from_letters(code: &str) -> Option<Self> {
        let mut flags = ResourceType::empty();
        for ch in code.chars() {
            let (flag, _) = LETTERS.iter().find(|(_, letter)| *letter == ch)?;
            flags |= *flag;
        }
        Some(flags)
    }

    /// Script and service-worker loads carry a charset in the URL.
    pub fn is_script_like(self) -> bool {
        self.intersects(ResourceType::SCRIPT | ResourceType::SERVICE_WORKER)
    }

    pub fn is_iframe(self) -> bool {
        self.contains(ResourceType::IFRAME)
    }

    pub fn is_script(self) -> bool {
        self.contains(ResourceType::SCRIPT)
    }

    pub fn is_web_socket(self) -> bool {
        self.contains(ResourceType::WEB_SOCKET)
    }

    pub fn is_html_import(self) -> bool {
        self.contains(ResourceType::HTML_IMPORT)
    }

    pub fn is_event_source(self) -> bool {
        self.contains(ResourceType::EVENT_SOURCE)
    }

    pub fn is_ajax(self) -> bool {
        self.contains(ResourceType::AJAX)
    }
}
