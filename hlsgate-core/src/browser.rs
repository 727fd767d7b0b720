//! User-Agent classification for the adaptive manifest access limits.
//!
//! Classification is first-match-wins: download tools, then mobile
//! browsers, then desktop browsers, then a generic engine fallback,
//! then `unknown`.

/// Browser class used to pick the access-limit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    MobileBrowser,
    DesktopBrowser,
    DownloadTool,
    Unknown,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::MobileBrowser => "mobile_browser",
            BrowserKind::DesktopBrowser => "desktop_browser",
            BrowserKind::DownloadTool => "download_tool",
            BrowserKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// (name, primary keywords, platform keywords)
const MOBILE_BROWSERS: &[(&str, &[&str], &[&str])] = &[
    ("qq", &["QQBrowser", "MQQBrowser"], &["Mobile", "Android", "iPhone"]),
    ("uc", &["UCBrowser", "UCWEB"], &["Mobile", "Android", "iPhone"]),
    ("baidu", &["baiduboxapp", "BaiduHD"], &["Mobile", "Android", "iPhone"]),
    ("sogou", &["SogouMobileBrowser", "SogouSearch"], &["Mobile", "Android", "iPhone"]),
    ("chrome_mobile", &["Chrome/"], &["Mobile", "Android", "iPhone"]),
    ("safari_mobile", &["Safari/"], &["Mobile", "iPhone", "iPad"]),
    ("edge_mobile", &["Edge/", "EdgA/", "EdgiOS/"], &["Mobile", "Android", "iPhone"]),
    ("firefox_mobile", &["Firefox/", "FxiOS/"], &["Mobile", "Android", "iPhone"]),
];

const DESKTOP_BROWSERS: &[(&str, &[&str], &[&str])] = &[
    ("chrome", &["Chrome/"], &["Windows NT", "Macintosh", "X11; Linux"]),
    ("firefox", &["Firefox/"], &["Windows NT", "Macintosh", "X11; Linux"]),
    ("edge", &["Edge/", "Edg/"], &["Windows NT", "Macintosh"]),
    ("safari", &["Safari/", "Version/"], &["Macintosh"]),
    ("opera", &["Opera/", "OPR/"], &["Windows NT", "Macintosh", "X11; Linux"]),
];

const DOWNLOAD_TOOLS: &[&str] = &[
    "wget", "curl", "aria2", "axel", "youtube-dl", "yt-dlp", "ffmpeg", "vlc", "mpv", "IDM",
    "Thunder", "BitComet", "uTorrent", "qBittorrent", "Transmission", "Deluge", "FlashGet",
    "FreeDownloadManager", "EagleGet", "python-requests", "urllib", "httplib", "Go-http-client",
    "node-fetch", "axios", "okhttp",
];

/// Classify a User-Agent. Returns the class, the matched browser/tool
/// name, and the suggested access count for when configuration has no
/// entry.
pub fn detect(user_agent: &str) -> (BrowserKind, String, u32) {
    if user_agent.is_empty() {
        return (BrowserKind::Unknown, "unknown".into(), 1);
    }

    let ua = user_agent.to_lowercase();

    for tool in DOWNLOAD_TOOLS {
        if ua.contains(&tool.to_lowercase()) {
            return (BrowserKind::DownloadTool, tool.to_string(), 1);
        }
    }

    for (name, primary, platform) in MOBILE_BROWSERS {
        let has_primary = primary.iter().any(|k| ua.contains(&k.to_lowercase()));
        let has_platform = platform.iter().any(|k| ua.contains(&k.to_lowercase()));
        if has_primary && has_platform {
            let suggested = if matches!(*name, "qq" | "uc") { 3 } else { 2 };
            return (BrowserKind::MobileBrowser, name.to_string(), suggested);
        }
    }

    for (name, primary, platform) in DESKTOP_BROWSERS {
        let has_primary = primary.iter().any(|k| ua.contains(&k.to_lowercase()));
        let has_platform = platform.iter().any(|k| ua.contains(&k.to_lowercase()));
        if has_primary && has_platform {
            return (BrowserKind::DesktopBrowser, name.to_string(), 2);
        }
    }

    // Generic engine fallback
    if ["mozilla", "webkit", "chrome", "safari", "firefox", "edge"].iter().any(|k| ua.contains(k)) {
        if ["mobile", "android", "iphone", "ipad"].iter().any(|k| ua.contains(k)) {
            return (BrowserKind::MobileBrowser, "generic_mobile".into(), 2);
        }
        return (BrowserKind::DesktopBrowser, "generic_desktop".into(), 2);
    }

    (BrowserKind::Unknown, "unknown".into(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_CHROME: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
    const MOBILE_QQ: &str =
        "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 Chrome/115.0 Mobile MQQBrowser/14.0";

    #[test]
    fn download_tools_win_over_everything() {
        let (kind, name, max) = detect("curl/8.4.0");
        assert_eq!(kind, BrowserKind::DownloadTool);
        assert_eq!(name, "curl");
        assert_eq!(max, 1);
    }

    #[test]
    fn mobile_browser_needs_primary_and_platform() {
        let (kind, name, max) = detect(MOBILE_QQ);
        assert_eq!(kind, BrowserKind::MobileBrowser);
        assert_eq!(name, "qq");
        assert_eq!(max, 3);
    }

    #[test]
    fn desktop_chrome_detected() {
        let (kind, name, max) = detect(DESKTOP_CHROME);
        assert_eq!(kind, BrowserKind::DesktopBrowser);
        assert_eq!(name, "chrome");
        assert_eq!(max, 2);
    }

    #[test]
    fn generic_mobile_fallback() {
        let (kind, name, _) = detect("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)");
        assert_eq!(kind, BrowserKind::MobileBrowser);
        assert_eq!(name, "generic_mobile");
    }

    #[test]
    fn empty_and_opaque_uas_are_unknown() {
        assert_eq!(detect("").0, BrowserKind::Unknown);
        let (kind, name, max) = detect("SomePlayer/1.0");
        assert_eq!(kind, BrowserKind::Unknown);
        assert_eq!(name, "unknown");
        assert_eq!(max, 1);
    }

    #[test]
    fn class_names_match_config_keys() {
        assert_eq!(BrowserKind::MobileBrowser.as_str(), "mobile_browser");
        assert_eq!(BrowserKind::DesktopBrowser.as_str(), "desktop_browser");
        assert_eq!(BrowserKind::DownloadTool.as_str(), "download_tool");
        assert_eq!(BrowserKind::Unknown.as_str(), "unknown");
    }
}
