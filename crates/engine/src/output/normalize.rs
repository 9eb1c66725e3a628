//! Cleans raw model output for display and commit.
//!
//! The pipeline runs eight steps in a fixed order:
//!
//! 1. Stop strings: cut at the first full occurrence, then trim partial suffixes
//! 2. Newline collapse (optional)
//! 3. Wrong-speaker lines, own `Name:` prefix
//! 4. `<|endoftext|>` truncation
//! 5. Instruct sequence leakage
//! 6. Group cross-talk
//! 7. Trim to the last complete sentence (final pass only, optional)
//! 8. Whitespace trim
//!
//! Every step only removes text. The pipeline repeats until a pass changes
//! nothing, so `normalize(normalize(x)) == normalize(x)`.

use std::sync::LazyLock;

use chatweave_config::AppConfig;
use regex::Regex;

pub const END_OF_TEXT: &str = "<|endoftext|>";

const SENTENCE_END: &[char] = &[
    '.', '!', '?', '*', '"', ')', '}', '`', ']', '$', '。', '！', '？', '”', '）', '】', '’', '」',
    '_',
];

static NEWLINE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n+").expect("newline pattern is valid"));

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions<'a> {
    pub is_impersonate: bool,
    pub is_continue: bool,
    pub stop_strings: &'a [String],
    /// Keep a trailing partial sentence (streaming)
    pub display_incomplete_sentences: bool,
    pub trim_names: bool,
}

impl<'a> NormalizeOptions<'a> {
    pub fn new(stop_strings: &'a [String]) -> Self {
        Self {
            stop_strings,
            trim_names: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputNormalizer {
    collapse_newlines: bool,
    trim_sentences: bool,
    trim_spaces: bool,
    user_name: String,
    character_name: String,
    group_members: Vec<String>,
    instruct_sequences: Vec<String>,
    /// `(?m)^Name:` for every participant
    line_prefixes: Vec<(String, Regex)>,
}

impl OutputNormalizer {
    pub fn new(user_name: impl Into<String>, character_name: impl Into<String>) -> Self {
        let mut normalizer = Self {
            collapse_newlines: false,
            trim_sentences: false,
            trim_spaces: true,
            user_name: user_name.into(),
            character_name: character_name.into(),
            group_members: Vec::new(),
            instruct_sequences: Vec::new(),
            line_prefixes: Vec::new(),
        };
        normalizer.compile_prefixes();
        normalizer
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut normalizer = Self::new(config.names.user.clone(), config.names.character.clone());
        normalizer.collapse_newlines = config.output.collapse_newlines;
        normalizer.trim_sentences = config.output.trim_sentences;
        normalizer.trim_spaces = config.output.trim_spaces;
        if config.instruct.enabled {
            normalizer.instruct_sequences = config.instruct.sequences();
        }
        normalizer
    }

    pub fn with_group_members(mut self, members: Vec<String>) -> Self {
        self.group_members = members;
        self.compile_prefixes();
        self
    }

    pub fn with_instruct_sequences(mut self, sequences: Vec<String>) -> Self {
        self.instruct_sequences = sequences;
        self
    }

    pub fn collapse_newlines(mut self, on: bool) -> Self {
        self.collapse_newlines = on;
        self
    }

    pub fn trim_sentences(mut self, on: bool) -> Self {
        self.trim_sentences = on;
        self
    }

    pub fn trim_spaces(mut self, on: bool) -> Self {
        self.trim_spaces = on;
        self
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn character_name(&self) -> &str {
        &self.character_name
    }

    pub fn group_members(&self) -> &[String] {
        &self.group_members
    }

    pub fn normalize(&self, raw: &str, options: &NormalizeOptions<'_>) -> String {
        let mut text = raw.to_string();
        loop {
            let next = self.pass(&text, options);
            if next == text {
                return next;
            }
            text = next;
        }
    }

    fn pass(&self, raw: &str, options: &NormalizeOptions<'_>) -> String {
        let (speaker, other) = if options.is_impersonate {
            (self.user_name.as_str(), self.character_name.as_str())
        } else {
            (self.character_name.as_str(), self.user_name.as_str())
        };

        // 1
        let mut text = trim_stop_strings(raw, options.stop_strings);

        // 2
        if self.collapse_newlines {
            text = NEWLINE_RUNS.replace_all(&text, "\n").into_owned();
        }

        // 3
        self.cut_at_line_prefix(&mut text, other);
        if options.trim_names && !options.is_continue {
            text = strip_own_name(&text, speaker);
        }

        // 4
        if let Some(pos) = text.find(END_OF_TEXT) {
            text.truncate(pos);
        }

        // 5
        for seq in &self.instruct_sequences {
            if !seq.is_empty() && text.contains(seq.as_str()) {
                text = text.replace(seq.as_str(), "");
            }
        }

        // 6
        if !options.is_impersonate {
            for member in &self.group_members {
                if member != speaker && member != other {
                    self.cut_at_line_prefix(&mut text, member);
                }
            }
        }

        // 7
        if self.trim_sentences && !options.display_incomplete_sentences {
            text = trim_to_end_sentence(&text);
        }

        // 8
        if self.trim_spaces {
            text = if options.is_continue {
                text.trim_end().to_string()
            } else {
                text.trim().to_string()
            };
        }

        text
    }

    fn cut_at_line_prefix(&self, text: &mut String, name: &str) {
        if name.is_empty() {
            return;
        }
        let found = self
            .line_prefixes
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, re)| re.find(text))
            .map(|m| m.start());
        if let Some(pos) = found {
            text.truncate(pos);
        }
    }

    fn compile_prefixes(&mut self) {
        let mut names: Vec<&String> = vec![&self.user_name, &self.character_name];
        names.extend(self.group_members.iter());
        let mut compiled: Vec<(String, Regex)> = Vec::new();
        for name in names {
            if name.is_empty() || compiled.iter().any(|(n, _)| n == name) {
                continue;
            }
            if let Ok(re) = Regex::new(&format!(r"(?m)^{}:", regex::escape(name))) {
                compiled.push((name.clone(), re));
            }
        }
        self.line_prefixes = compiled;
    }
}

/// Cut at the first full stop string, then drop any trailing partial match.
pub fn trim_stop_strings(text: &str, stop_strings: &[String]) -> String {
    let mut out = text;
    for stop in stop_strings.iter().filter(|s| !s.is_empty()) {
        if let Some(pos) = out.find(stop.as_str()) {
            out = &out[..pos];
        }
    }
    for stop in stop_strings.iter().filter(|s| !s.is_empty()) {
        for len in (1..=stop.len()).rev() {
            if !stop.is_char_boundary(len) {
                continue;
            }
            if out.ends_with(&stop[..len]) {
                out = &out[..out.len() - len];
                break;
            }
        }
    }
    out.to_string()
}

/// Cut back to the last sentence-ending character. A terminator preceded
/// by whitespace is dropped along with it.
pub fn trim_to_end_sentence(text: &str) -> String {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for i in (0..chars.len()).rev() {
        let (pos, c) = chars[i];
        if !SENTENCE_END.contains(&c) {
            continue;
        }
        let end = if i > 0 && chars[i - 1].1.is_whitespace() {
            pos
        } else {
            pos + c.len_utf8()
        };
        return text[..end].trim_end().to_string();
    }
    text.trim_end().to_string()
}

fn strip_own_name(text: &str, speaker: &str) -> String {
    if speaker.is_empty() {
        return text.to_string();
    }
    let prefix = format!("{speaker}:");
    match text.trim_start().strip_prefix(prefix.as_str()) {
        Some(rest) => rest.trim_start().to_string(),
        None => text.to_string(),
    }
}
