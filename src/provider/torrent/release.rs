//! Release-name metadata
//!
//! Pulls the release group, resolution, episode numbers and a clean title out of
//! names like `[Group] Title - 05 (1080p) [CRC32].mkv`.

use regex::Regex;
use std::sync::LazyLock;

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($pattern).unwrap());
    };
}

regex!(VIDEO_EXTENSION, r"(?i)\.(mkv|mp4|avi|webm|m4v)$");
regex!(LEADING_GROUP, r"^\s*\[([^\]]+)\]");
regex!(ENCLOSED, r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}");
regex!(RESOLUTION, r"(?i)\b(\d{3,4}[pi]|\d{3,4}x\d{3,4}|4k)\b");
regex!(WHITESPACE, r"\s+");
regex!(EPISODE_RANGE, r"(?:^|\s)(\d{2,4})\s?[-~]\s?(\d{2,4})(?:\s|$)");
regex!(SEASON_EPISODE, r"(?i)\bS\d{1,2}E(\d{1,4})");
regex!(DASH_EPISODE, r"\s-\s(\d{1,4})(?:v\d)?(?:\s|$)");
regex!(PREFIXED_EPISODE, r"(?i)\b(?:episode|ep|e)\.?\s?(\d{1,4})(?:v\d)?\b");
regex!(SEASON_WORD, r"(?i)\bseason\s*(\d{1,2})\b");
regex!(SEASON_ORDINAL, r"(?i)\b(\d{1,2})(?:st|nd|rd|th)\s+season\b");
regex!(SEASON_SHORT, r"(?i)\bs(\d{1,2})\b");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub title: String,
    pub release_group: String,
    pub resolution: String,
    /// One entry for a single episode, two for a range
    pub episode_numbers: Vec<String>,
}

pub fn parse(name: &str) -> ReleaseInfo {
    let stem = VIDEO_EXTENSION.replace(name.trim(), "");

    let release_group = LEADING_GROUP
        .captures(&stem)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let resolution = RESOLUTION
        .find(&stem)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();

    let body = ENCLOSED.replace_all(&stem, " ");
    let body = RESOLUTION.replace_all(&body, " ").replace('_', " ");
    let body = WHITESPACE.replace_all(&body, " ").trim().to_string();

    let (episode_numbers, title_end) = find_episodes(&body);
    let title = body[..title_end]
        .trim_end_matches(|c: char| c == '-' || c == '~' || c.is_whitespace())
        .to_string();

    ReleaseInfo {
        title,
        release_group,
        resolution,
        episode_numbers,
    }
}

/// Episode numbers and the byte offset where the title ends
fn find_episodes(body: &str) -> (Vec<String>, usize) {
    for caps in EPISODE_RANGE.captures_iter(body) {
        let (start, end) = (&caps[1], &caps[2]);
        if start.parse::<u32>().ok() < end.parse::<u32>().ok() {
            let at = caps.get(0).map(|m| m.start()).unwrap_or(body.len());
            return (vec![start.to_string(), end.to_string()], at);
        }
    }

    for re in [&*SEASON_EPISODE, &*DASH_EPISODE, &*PREFIXED_EPISODE] {
        if let Some(caps) = re.captures(body) {
            let at = caps.get(0).map(|m| m.start()).unwrap_or(body.len());
            return (vec![caps[1].to_string()], at);
        }
    }

    (Vec::new(), body.len())
}

/// Season number found in a title, and the title without it. Zero when absent.
pub fn extract_season_number(title: &str) -> (i32, String) {
    for re in [&*SEASON_WORD, &*SEASON_ORDINAL, &*SEASON_SHORT] {
        if let Some(caps) = re.captures(title) {
            let season = caps[1].parse().unwrap_or(0);
            let cleaned = re.replace(title, " ");
            let cleaned = WHITESPACE.replace_all(&cleaned, " ").trim().to_string();
            return (season, cleaned);
        }
    }
    (0, title.trim().to_string())
}
