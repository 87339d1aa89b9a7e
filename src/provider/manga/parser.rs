//! Chapter and page filename parsing for local manga
//!
//! Filenames are tokenized by [`Lexer`] and interpreted by [`Parser`]. The
//! parser keeps the original zero padding of numbers; use [`clean_chapter`]
//! to normalize a chapter label.

use serde::Serialize;

/// Longest first so that `chapter12` splits as `chapter` + `12`
const CHAPTER_KEYWORDS: [&str; 5] = ["chapter", "chap", "chp", "ch", "c"];
const VOLUME_KEYWORDS: [&str; 3] = ["volume", "vol", "v"];

const SEPARATORS: [char; 11] = [' ', '-', '_', '.', '[', ']', '(', ')', '{', '}', '~'];
const ARCHIVE_EXTENSIONS: [&str; 4] = ["cbz", "cbr", "pdf", "epub"];
const IGNORED_WORDS: [&str; 7] = ["digital", "group", "scan", "scans", "team", "raw", "raws"];

pub const IMAGE_EXTENSIONS: [&str; 8] = [
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".tiff", ".tif",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedChapterFile {
    /// A single chapter or both ends of a range
    pub chapter: Vec<String>,
    pub manga_title: String,
    pub chapter_title: String,
    pub volume: Vec<String>,
    #[serde(rename = "isPDF")]
    pub is_pdf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    Number,
    Keyword,
    Separator,
    Enclosed,
    FileExtension,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub position: usize,
    pub is_chapter: bool,
    pub is_volume: bool,
}

impl Token {
    fn new(kind: TokenKind, value: impl Into<String>, position: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            position,
            is_chapter: false,
            is_volume: false,
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.trim().chars().collect(),
            position: 0,
            tokens: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> Vec<Token> {
        while let Some(c) = self.current() {
            if c.is_ascii_whitespace() {
                self.position += 1;
            } else if matches!(c, '[' | '(' | '{') {
                self.read_enclosed(c);
            } else if SEPARATORS.contains(&c) {
                self.tokens.push(Token::new(TokenKind::Separator, c, self.position));
                self.position += 1;
            } else if c.is_ascii_digit() {
                self.read_number();
            } else if c.is_ascii_alphabetic() {
                self.read_text();
            } else {
                self.position += 1;
            }
        }

        self.classify();
        self.tokens
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.input[start..end].iter().collect()
    }

    fn read_enclosed(&mut self, open: char) {
        let close = match open {
            '[' => ']',
            '(' => ')',
            _ => '}',
        };
        let start = self.position;
        self.position += 1;
        let content_start = self.position;

        while self.current().is_some_and(|c| c != close) {
            self.position += 1;
        }

        // An unterminated group swallows the rest of the input.
        if self.current().is_some() {
            let content = self.slice(content_start, self.position);
            self.position += 1;
            if !content.trim().is_empty() {
                self.tokens.push(Token::new(TokenKind::Enclosed, content, start));
            }
        }
    }

    fn followed_by_extension(&self, dot: usize) -> bool {
        let rest: String = self.input[dot + 1..].iter().take(4).collect();
        ARCHIVE_EXTENSIONS.iter().any(|ext| rest.starts_with(ext))
    }

    fn read_number(&mut self) {
        let start = self.position;
        while let Some(c) = self.current() {
            if !(c.is_ascii_digit() || c == '.') {
                break;
            }
            if c == '.' && self.position + 1 < self.input.len() && self.followed_by_extension(self.position) {
                break;
            }
            self.position += 1;
        }
        let value = self.slice(start, self.position);
        self.tokens.push(Token::new(TokenKind::Number, value, start));
    }

    fn read_text(&mut self) {
        let start = self.position;
        while self.current().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.position += 1;
        }

        // Keep the decimal part of "c12.5" attached to the keyword run
        let lower = self.slice(start, self.position).to_ascii_lowercase();
        let starts_with_keyword = CHAPTER_KEYWORDS
            .iter()
            .chain(VOLUME_KEYWORDS.iter())
            .any(|k| lower.starts_with(k));
        if starts_with_keyword
            && self.current() == Some('.')
            && self.input.get(self.position + 1).is_some_and(|c| c.is_ascii_digit())
        {
            self.position += 1;
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.position += 1;
            }
        }

        let value = self.slice(start, self.position);
        match keyword_prefix(&value.to_ascii_lowercase()) {
            Some((len, is_chapter)) => {
                let mut keyword = Token::new(TokenKind::Keyword, &value[..len], start);
                keyword.is_chapter = is_chapter;
                keyword.is_volume = !is_chapter;
                self.tokens.push(keyword);
                self.tokens
                    .push(Token::new(TokenKind::Number, &value[len..], start + len));
            }
            None => self.tokens.push(Token::new(TokenKind::Text, value, start)),
        }
    }

    fn classify(&mut self) {
        for token in &mut self.tokens {
            let lower = token.value.to_lowercase();
            if CHAPTER_KEYWORDS.contains(&lower.as_str()) {
                token.kind = TokenKind::Keyword;
                token.is_chapter = true;
            }
            if VOLUME_KEYWORDS.contains(&lower.as_str()) {
                token.kind = TokenKind::Keyword;
                token.is_volume = true;
            }
            if ARCHIVE_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
                token.kind = TokenKind::FileExtension;
            }
        }
    }
}

/// Length of a keyword glued to a number (`ch001`), and whether it is a chapter keyword.
///
/// The first keyword that prefixes the text decides; a non-numeric remainder means no split.
fn keyword_prefix(lower: &str) -> Option<(usize, bool)> {
    for (keywords, is_chapter) in [(&CHAPTER_KEYWORDS[..], true), (&VOLUME_KEYWORDS[..], false)] {
        if let Some(keyword) = keywords
            .iter()
            .find(|k| lower.starts_with(*k) && lower.len() > k.len())
        {
            return is_number_part(&lower[keyword.len()..]).then_some((keyword.len(), is_chapter));
        }
    }
    None
}

fn is_number_part(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s.chars().all(|c| c.is_ascii_digit() || c == '.')
        && s.matches('.').count() <= 1
}

pub struct Parser {
    tokens: Vec<Token>,
    result: ScannedChapterFile,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            result: ScannedChapterFile::default(),
        }
    }

    pub fn parse(mut self) -> ScannedChapterFile {
        self.extract_chapters();
        self.extract_volumes();
        self.extract_titles();
        self.result.is_pdf = self
            .tokens
            .iter()
            .any(|t| t.kind == TokenKind::FileExtension && t.value.contains("pdf"));
        self.result
    }

    /// First number within two tokens after a keyword, skipping separators only.
    fn number_after(&self, i: usize) -> Option<&str> {
        for token in self.tokens.iter().skip(i + 1).take(2) {
            match token.kind {
                TokenKind::Number => return Some(&token.value),
                TokenKind::Separator => continue,
                _ => break,
            }
        }
        None
    }

    fn is_dash(&self, i: usize) -> bool {
        self.tokens
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Separator && t.value == "-")
    }

    fn kind_at(&self, i: usize) -> Option<TokenKind> {
        self.tokens.get(i).map(|t| t.kind)
    }

    fn extract_chapters(&mut self) {
        for i in 0..self.tokens.len() {
            let token = &self.tokens[i];
            if token.is_chapter {
                if let Some(number) = self.number_after(i).map(str::to_string) {
                    self.add_chapter(&number);
                }
            } else if token.kind == TokenKind::Number
                && !token.is_volume
                && self.is_likely_chapter_number(i)
            {
                let number = token.value.clone();
                self.add_chapter(&number);
            }
        }

        // "001-002": the second number joins a range when the first is already a chapter
        for i in 0..self.tokens.len().saturating_sub(2) {
            if self.kind_at(i) == Some(TokenKind::Number)
                && self.is_dash(i + 1)
                && self.kind_at(i + 2) == Some(TokenKind::Number)
                && self.result.chapter.contains(&self.tokens[i].value)
            {
                let end = self.tokens[i + 2].value.clone();
                self.result.chapter.push(end);
            }
        }
    }

    fn add_chapter(&mut self, value: &str) {
        if value.contains('-') {
            self.result.chapter.extend(
                value
                    .split('-')
                    .filter(|p| !p.is_empty())
                    .map(|p| p.trim().to_string()),
            );
        } else {
            self.result.chapter.push(value.to_string());
        }
    }

    fn extract_volumes(&mut self) {
        for i in 0..self.tokens.len() {
            if self.tokens[i].is_volume {
                if let Some(number) = self.number_after(i).map(str::to_string) {
                    self.result.volume.push(number);
                }
            }
        }
    }

    fn is_likely_chapter_number(&self, i: usize) -> bool {
        if !self.result.chapter.is_empty() {
            return false;
        }
        if i < 3 {
            return true;
        }
        let prev = &self.tokens[i - 1];
        prev.kind == TokenKind::Separator && (prev.value == "-" || prev.value == " ")
    }

    fn is_number_in_title(&self, i: usize, chapter_pos: usize) -> bool {
        if i + 1 == chapter_pos {
            return false;
        }
        if i > 0 && self.tokens[i - 1].is_volume {
            return false;
        }
        // Short numbers early on are part of titles like "Title 05"
        i < 5 && self.tokens[i].value.len() <= 2
    }

    fn extract_titles(&mut self) {
        let chapter_pos = (0..self.tokens.len()).find(|&i| {
            let token = &self.tokens[i];
            token.is_chapter || (token.kind == TokenKind::Number && self.is_likely_chapter_number(i))
        });

        match chapter_pos {
            Some(pos) if pos > 0 => {
                let parts: Vec<&str> = (0..pos)
                    .filter(|&i| {
                        let token = &self.tokens[i];
                        match token.kind {
                            TokenKind::Text => !token.is_volume && !is_ignored(token),
                            TokenKind::Number => self.is_number_in_title(i, pos),
                            _ => false,
                        }
                    })
                    .map(|i| self.tokens[i].value.as_str())
                    .collect();
                self.result.manga_title = parts.join(" ");

                let number_pos = (pos..self.tokens.len())
                    .find(|&i| self.tokens[i].kind == TokenKind::Number);
                if let Some(number_pos) = number_pos {
                    if let Some(dash) = (number_pos + 1..self.tokens.len()).find(|&i| self.is_dash(i)) {
                        self.result.chapter_title = self.title_from(dash + 1);
                    }
                }
            }
            _ => {
                let dash_title = (0..self.tokens.len().saturating_sub(2)).find(|&i| {
                    self.kind_at(i) == Some(TokenKind::Number)
                        && self.is_dash(i + 1)
                        && self.kind_at(i + 2) == Some(TokenKind::Text)
                });

                match dash_title {
                    // "12 - Title"
                    Some(i) if !self.result.chapter.is_empty() => {
                        self.result.chapter_title = self.title_from(i + 2);
                    }
                    _ => {
                        let parts: Vec<&str> = self
                            .tokens
                            .iter()
                            .filter(|t| t.kind == TokenKind::Text && !is_ignored(t))
                            .map(|t| t.value.as_str())
                            .collect();
                        self.result.manga_title = parts.join(" ");
                    }
                }
            }
        }
    }

    /// Text tokens from `start` up to the first enclosed group or file extension.
    fn title_from(&self, start: usize) -> String {
        self.tokens
            .iter()
            .skip(start)
            .take_while(|t| !matches!(t.kind, TokenKind::Enclosed | TokenKind::FileExtension))
            .filter(|t| t.kind == TokenKind::Text && !is_ignored(t))
            .map(|t| t.value.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_ignored(token: &Token) -> bool {
    if IGNORED_WORDS.contains(&token.value.as_str()) {
        return true;
    }
    // Version markers like "v2"
    let mut chars = token.value.chars();
    chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Parse a chapter archive or folder name.
pub fn scan_chapter_filename(filename: &str) -> ScannedChapterFile {
    Parser::new(Lexer::new(filename).tokenize()).parse()
}

/// Strip leading zeros from a chapter label: "001" becomes "1", "0" stays "0".
pub fn clean_chapter(chapter: &str) -> String {
    if chapter.is_empty() {
        return String::new();
    }
    let cleaned = chapter.trim_start_matches('0');
    if cleaned.is_empty() || cleaned.starts_with('.') {
        format!("0{}", cleaned)
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPageFile {
    pub number: f64,
    pub filename: String,
    /// Lowercased extension including the dot
    pub ext: String,
}

/// Extract the page number from an image filename, e.g. "page_27.jpg" is page 27.
pub fn parse_page_filename(filename: &str) -> Option<ScannedPageFile> {
    let lower = filename.to_lowercase();
    let ext = lower.rfind('.').map(|i| lower[i..].to_string()).unwrap_or_default();
    let stem = &lower[..lower.len() - ext.len()];

    let first_digit = stem.find(|c: char| c.is_ascii_digit())?;
    let number_str: String = stem[first_digit..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    Some(ScannedPageFile {
        number: number_str.parse().unwrap_or(0.0),
        filename: filename.to_string(),
        ext,
    })
}

pub fn is_image_file(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower
        .rfind('.')
        .is_some_and(|i| IMAGE_EXTENSIONS.contains(&&lower[i..]))
}
