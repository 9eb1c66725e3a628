//! Prompt budget packer: fits story, examples, history and injections
//! under a token ceiling.
//!
//! Segments fall into three evictability classes:
//!
//! 1. **Pinned** (story, injections, chat start, cue or continuation): never evicted
//! 2. **History** (chat turns): filled newest → oldest, oldest dropped first
//! 3. **Examples** (example dialogue): fill whatever history leaves over
//!
//! When examples are pinned they move into class 1 and shrink the history
//! budget instead.
//!
//! # Determinism
//!
//! Identical inputs always produce identical prompts. The assembled text is
//! re-counted as a whole before it is returned, so the prompt never exceeds
//! the ceiling even when segment counts do not add up exactly.

use std::cmp::Reverse;
use std::sync::{Arc, OnceLock};

use chatweave_config::{ApiStyle, AppConfig, InstructConfig};
use chatweave_core::error::PackError;
use chatweave_core::message::{Message, Role};
use chatweave_core::transport::{ChatTurn, PromptPayload};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::injection::ResolvedInjections;
use crate::context::token::TokenCounter;

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evictability {
    Pinned,
    Examples,
    History,
}

impl Evictability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pinned => "pinned",
            Self::Examples => "examples",
            Self::History => "history",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    BeforeStory,
    Story,
    BeforeRequest,
    Example,
    ChatStart,
    History,
    Injection,
    Continuation,
    Cue,
}

/// A named block of prompt text.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub kind: SegmentKind,
    pub class: Evictability,
    pub role: Role,
    /// Speaker name for chat turns
    pub speaker: Option<String>,
    /// Rendered text as it appears in a text-completion prompt
    pub text: String,
    /// Unformatted content used for chat-style payloads
    pub body: String,
    /// History: 0 = newest. Injections: depth. Examples: configured order.
    pub source_index: usize,
    tokens: OnceLock<usize>,
}

impl Segment {
    fn new(
        name: impl Into<String>,
        kind: SegmentKind,
        class: Evictability,
        role: Role,
        text: String,
        body: String,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            class,
            role,
            speaker: None,
            text,
            body,
            source_index: 0,
            tokens: OnceLock::new(),
        }
    }

    fn with_source(mut self, index: usize) -> Self {
        self.source_index = index;
        self
    }

    fn with_speaker(mut self, speaker: &str) -> Self {
        self.speaker = Some(speaker.to_string());
        self
    }

    /// Token cost, counted once and cached.
    pub fn tokens(&self, counter: &TokenCounter) -> usize {
        *self.tokens.get_or_init(|| counter.count(&self.text))
    }
}

/// One completed turn of chat history, as the packer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub name: String,
    pub text: String,
}

impl HistoryTurn {
    pub fn new(role: Role, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
            text: text.into(),
        }
    }
}

impl From<&Message> for HistoryTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.name.clone(), message.text.clone())
    }
}

/// What closes the prompt.
#[derive(Debug, Clone, Copy)]
pub enum PromptTail<'a> {
    /// A speaker label for the model to complete, e.g. `Aria:`
    Cue { role: Role, name: &'a str },
    /// A partial turn extended in place; no cue follows it
    Continuation(&'a HistoryTurn),
}

/// Instruct-template sequences wrapped around each turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnFormat {
    pub input_sequence: Option<String>,
    pub output_sequence: Option<String>,
    pub system_sequence: Option<String>,
}

impl TurnFormat {
    /// `Name: text` lines with no template.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_instruct(instruct: &InstructConfig) -> Self {
        if !instruct.enabled {
            return Self::plain();
        }
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            input_sequence: non_empty(&instruct.input_sequence),
            output_sequence: non_empty(&instruct.output_sequence),
            system_sequence: non_empty(&instruct.system_sequence),
        }
    }

    fn sequence_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::User => self.input_sequence.as_deref(),
            Role::Assistant => self.output_sequence.as_deref(),
            Role::System | Role::Narrator => self.system_sequence.as_deref(),
        }
    }

    fn labelled(role: Role, name: &str, text: &str) -> String {
        match role {
            Role::User | Role::Assistant => format!("{name}: {text}"),
            Role::System | Role::Narrator => text.to_string(),
        }
    }

    fn wrap(&self, role: Role, body: String) -> String {
        match self.sequence_for(role) {
            Some(seq) => format!("{seq}\n{body}"),
            None => body,
        }
    }

    pub fn render_turn(&self, turn: &HistoryTurn) -> String {
        let body = Self::labelled(turn.role, &turn.name, turn.text.trim());
        format!("{}\n", self.wrap(turn.role, body))
    }

    pub fn render_continuation(&self, turn: &HistoryTurn) -> String {
        let body = Self::labelled(turn.role, &turn.name, turn.text.trim_start());
        self.wrap(turn.role, body)
    }

    pub fn render_cue(&self, role: Role, name: &str) -> String {
        self.wrap(role, format!("{name}:"))
    }
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Token ceiling the prompt must fit
    pub ceiling: usize,
    pub pin_examples: bool,
    /// Line placed ahead of each example block
    pub example_separator: String,
    /// Optional marker opening the chat history
    pub chat_start: String,
    pub format: TurnFormat,
}

impl PackOptions {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            pin_examples: false,
            example_separator: "***".into(),
            chat_start: String::new(),
            format: TurnFormat::plain(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ceiling: config.context.ceiling(),
            pin_examples: config.context.pin_examples,
            example_separator: config.context.example_separator.clone(),
            chat_start: config.context.chat_start.clone(),
            format: TurnFormat::from_instruct(&config.instruct),
        }
    }
}

/// All inputs required by the packer for one request.
pub struct PackInput<'a> {
    pub story: &'a str,
    /// Example dialogue blocks in configured order
    pub examples: &'a [String],
    /// Completed turns, newest first
    pub history: &'a [HistoryTurn],
    pub injections: &'a ResolvedInjections,
    pub tail: PromptTail<'a>,
}

/// Statistics for one evictability class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    pub tokens: usize,
    pub items_included: usize,
    pub items_total: usize,
}

/// Items dropped from a class while fitting the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackMetadata {
    /// Tokens in the assembled text, counted as a whole
    pub total_tokens: usize,
    pub ceiling: usize,
    /// Ceiling utilization percentage (0.0–100.0)
    pub utilization_pct: f32,
    pub per_class: Vec<LayerStats>,
    pub drops: Vec<DropInfo>,
}

impl PackMetadata {
    pub fn class(&self, name: &str) -> Option<&LayerStats> {
        self.per_class.iter().find(|s| s.name == name)
    }
}

/// The packed prompt, ready for a transport.
#[derive(Debug, Clone)]
pub struct PackedPrompt {
    pub segments: Vec<Segment>,
    pub text: String,
    pub metadata: PackMetadata,
}

impl PackedPrompt {
    pub fn total_tokens(&self) -> usize {
        self.metadata.total_tokens
    }

    pub fn ceiling(&self) -> usize {
        self.metadata.ceiling
    }

    /// Role-tagged turns for chat-style backends. The cue is omitted.
    pub fn to_chat_turns(&self) -> Vec<ChatTurn> {
        self.segments
            .iter()
            .filter(|s| s.kind != SegmentKind::Cue)
            .filter_map(|s| {
                let content = s.body.trim();
                if content.is_empty() {
                    return None;
                }
                let role = match s.role {
                    Role::Narrator => Role::System,
                    other => other,
                };
                Some(ChatTurn {
                    role,
                    name: s.speaker.clone(),
                    content: content.to_string(),
                })
            })
            .collect()
    }

    pub fn payload(&self, style: ApiStyle) -> PromptPayload {
        match style {
            ApiStyle::Text => PromptPayload::Text(self.text.clone()),
            ApiStyle::Chat => PromptPayload::Chat(self.to_chat_turns()),
        }
    }
}

// ── Packer ────────────────────────────────────────────────────────────────

/// Pinned segments in assembly order, split around the history.
struct Pinned {
    head: Vec<Segment>,
    chat_start: Option<Segment>,
    injections: Vec<Segment>,
    tail: Segment,
}

pub struct PromptPacker {
    options: PackOptions,
    counter: Arc<TokenCounter>,
}

impl PromptPacker {
    pub fn new(options: PackOptions, counter: Arc<TokenCounter>) -> Self {
        Self { options, counter }
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Pack `input` under the ceiling.
    ///
    /// # Algorithm
    ///
    /// 1. Sum pinned segments; overflow names the segment that crosses the ceiling
    /// 2. Walk history newest → oldest, stopping at the first turn that does not fit
    /// 3. Add unpinned examples in order while they fit the remainder
    /// 4. Count the assembled text; while over, drop examples then the oldest turn
    pub fn pack(&self, input: &PackInput<'_>) -> Result<PackedPrompt, PackError> {
        let ceiling = self.options.ceiling;
        if ceiling == 0 {
            return Err(PackError::InvalidCeiling(
                "ceiling is zero; raise max_context or lower max_response".into(),
            ));
        }
        let counter = self.counter.as_ref();

        let pinned = self.pinned_segments(input);
        let examples = self.example_segments(input.examples);
        let history: Vec<Segment> = input
            .history
            .iter()
            .enumerate()
            .map(|(i, turn)| self.history_segment(turn, i))
            .collect();

        // ── Pinned cost ────────────────────────────────────────────────────
        let mut pinned_tokens = 0;
        let mut pinned_count = 0;
        let pinned_examples = if self.options.pin_examples {
            examples.as_slice()
        } else {
            &[]
        };
        let pinned_order = pinned
            .head
            .iter()
            .chain(pinned_examples)
            .chain(pinned.chat_start.iter())
            .chain(pinned.injections.iter())
            .chain(std::iter::once(&pinned.tail));
        for seg in pinned_order {
            pinned_tokens += seg.tokens(counter);
            pinned_count += 1;
            if pinned_tokens > ceiling {
                return Err(PackError::Overflow {
                    segment: seg.name.clone(),
                    required: pinned_tokens,
                    ceiling,
                });
            }
        }
        let budget = ceiling - pinned_tokens;

        // ── History ────────────────────────────────────────────────────────
        let mut history_used = 0;
        let mut history_included = 0;
        for seg in &history {
            let cost = seg.tokens(counter);
            if history_used + cost > budget {
                break;
            }
            history_used += cost;
            history_included += 1;
        }
        let mut drops = Vec::new();
        push_drop(
            &mut drops,
            Evictability::History,
            &history[history_included..],
            counter,
            "Oldest turns dropped",
        );

        // ── Examples ───────────────────────────────────────────────────────
        let mut examples_included = 0;
        if !self.options.pin_examples {
            let remaining = budget - history_used;
            let mut used = 0;
            for seg in &examples {
                let cost = seg.tokens(counter);
                if used + cost > remaining {
                    break;
                }
                used += cost;
                examples_included += 1;
            }
            push_drop(
                &mut drops,
                Evictability::Examples,
                &examples[examples_included..],
                counter,
                "No budget left after history",
            );
        }

        // ── Assemble and re-validate ───────────────────────────────────────
        loop {
            let chosen_examples = if self.options.pin_examples {
                &examples[..]
            } else {
                &examples[..examples_included]
            };
            let segments = arrange(&pinned, chosen_examples, &history[..history_included]);
            let text: String = segments.iter().map(|s| s.text.as_str()).collect();
            let total_tokens = counter.count(&text);

            if total_tokens <= ceiling {
                let history_tokens = sum_tokens(&history[..history_included], counter);
                let mut per_class = vec![LayerStats {
                    name: Evictability::Pinned.as_str().into(),
                    tokens: pinned_tokens,
                    items_included: pinned_count,
                    items_total: pinned_count,
                }];
                if !self.options.pin_examples {
                    per_class.push(LayerStats {
                        name: Evictability::Examples.as_str().into(),
                        tokens: sum_tokens(chosen_examples, counter),
                        items_included: chosen_examples.len(),
                        items_total: examples.len(),
                    });
                }
                per_class.push(LayerStats {
                    name: Evictability::History.as_str().into(),
                    tokens: history_tokens,
                    items_included: history_included,
                    items_total: history.len(),
                });

                debug!(
                    total_tokens,
                    ceiling,
                    history = history_included,
                    examples = chosen_examples.len(),
                    "Prompt packed"
                );

                return Ok(PackedPrompt {
                    segments,
                    text,
                    metadata: PackMetadata {
                        total_tokens,
                        ceiling,
                        utilization_pct: (total_tokens as f32 / ceiling as f32) * 100.0,
                        per_class,
                        drops,
                    },
                });
            }

            if !self.options.pin_examples && examples_included > 0 {
                examples_included -= 1;
                push_drop(
                    &mut drops,
                    Evictability::Examples,
                    &examples[examples_included..=examples_included],
                    counter,
                    "Assembled text over ceiling",
                );
            } else if history_included > 0 {
                history_included -= 1;
                push_drop(
                    &mut drops,
                    Evictability::History,
                    &history[history_included..=history_included],
                    counter,
                    "Assembled text over ceiling",
                );
            } else {
                return Err(PackError::Overflow {
                    segment: "prompt".into(),
                    required: total_tokens,
                    ceiling,
                });
            }
        }
    }

    // ── Segment builders ───────────────────────────────────────────────────

    fn pinned_segments(&self, input: &PackInput<'_>) -> Pinned {
        let mut head = Vec::new();
        if let Some(seg) = text_block(
            "before_story",
            SegmentKind::BeforeStory,
            &input.injections.before_story,
        ) {
            head.push(seg);
        }
        if let Some(seg) = text_block("story", SegmentKind::Story, input.story) {
            head.push(seg);
        }
        if let Some(seg) = text_block(
            "before_request",
            SegmentKind::BeforeRequest,
            &input.injections.before_request,
        ) {
            head.push(seg);
        }

        let chat_start = text_block(
            "chat_start",
            SegmentKind::ChatStart,
            &self.options.chat_start,
        );

        let injections = input
            .injections
            .in_chat
            .iter()
            .filter(|inj| !inj.text.trim().is_empty())
            .map(|inj| {
                let body = inj.text.trim().to_string();
                Segment::new(
                    format!("injection@{}:{}", inj.depth, inj.role),
                    SegmentKind::Injection,
                    Evictability::Pinned,
                    inj.role,
                    format!("{body}\n"),
                    body,
                )
                .with_source(inj.depth)
            })
            .collect();

        let format = &self.options.format;
        let tail = match input.tail {
            PromptTail::Cue { role, name } => Segment::new(
                "cue",
                SegmentKind::Cue,
                Evictability::Pinned,
                role,
                format.render_cue(role, name),
                String::new(),
            ),
            PromptTail::Continuation(turn) => Segment::new(
                "continuation",
                SegmentKind::Continuation,
                Evictability::Pinned,
                turn.role,
                format.render_continuation(turn),
                turn.text.clone(),
            )
            .with_speaker(&turn.name),
        };

        Pinned {
            head,
            chat_start,
            injections,
            tail,
        }
    }

    fn example_segments(&self, examples: &[String]) -> Vec<Segment> {
        let class = if self.options.pin_examples {
            Evictability::Pinned
        } else {
            Evictability::Examples
        };
        let separator = self.options.example_separator.trim();
        examples
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .enumerate()
            .map(|(i, body)| {
                let text = if separator.is_empty() {
                    format!("{body}\n")
                } else {
                    format!("{separator}\n{body}\n")
                };
                Segment::new(
                    format!("example[{i}]"),
                    SegmentKind::Example,
                    class,
                    Role::System,
                    text,
                    body.to_string(),
                )
                .with_source(i)
            })
            .collect()
    }

    fn history_segment(&self, turn: &HistoryTurn, index: usize) -> Segment {
        Segment::new(
            format!("history[{index}]"),
            SegmentKind::History,
            Evictability::History,
            turn.role,
            self.options.format.render_turn(turn),
            turn.text.trim().to_string(),
        )
        .with_source(index)
        .with_speaker(&turn.name)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn text_block(name: &str, kind: SegmentKind, text: &str) -> Option<Segment> {
    let body = text.trim();
    if body.is_empty() {
        return None;
    }
    Some(Segment::new(
        name,
        kind,
        Evictability::Pinned,
        Role::System,
        format!("{body}\n"),
        body.to_string(),
    ))
}

/// Lay segments out in prompt order. `history` is newest first.
fn arrange(pinned: &Pinned, examples: &[Segment], history: &[Segment]) -> Vec<Segment> {
    let mut out: Vec<Segment> = pinned.head.clone();
    out.extend_from_slice(examples);
    if let Some(start) = &pinned.chat_start {
        out.push(start.clone());
    }

    // Deeper injections first; depths past the history clamp to its head.
    let turns = history.len();
    let mut injections: Vec<&Segment> = pinned.injections.iter().collect();
    injections.sort_by_key(|s| Reverse(s.source_index));

    for after in (0..=turns).rev() {
        out.extend(
            injections
                .iter()
                .filter(|s| s.source_index.min(turns) == after)
                .map(|s| (*s).clone()),
        );
        if after > 0 {
            out.push(history[after - 1].clone());
        }
    }

    out.push(pinned.tail.clone());
    out
}

fn sum_tokens(segments: &[Segment], counter: &TokenCounter) -> usize {
    segments.iter().map(|s| s.tokens(counter)).sum()
}

fn push_drop(
    drops: &mut Vec<DropInfo>,
    class: Evictability,
    dropped: &[Segment],
    counter: &TokenCounter,
    reason: &str,
) {
    if dropped.is_empty() {
        return;
    }
    drops.push(DropInfo {
        layer: class.as_str().into(),
        items_dropped: dropped.len(),
        tokens_dropped: sum_tokens(dropped, counter),
        reason: reason.into(),
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::injection::DepthInjection;

    // ── Helpers ────────────────────────────────────────────────────────

    fn counter() -> Arc<TokenCounter> {
        Arc::new(TokenCounter::heuristic())
    }

    fn packer(ceiling: usize) -> PromptPacker {
        PromptPacker::new(PackOptions::new(ceiling), counter())
    }

    /// Newest first, alternating speakers.
    fn history(n: usize) -> Vec<HistoryTurn> {
        (0..n)
            .rev()
            .map(|i| {
                if i % 2 == 0 {
                    HistoryTurn::new(Role::User, "User", format!("user message number {i}"))
                } else {
                    HistoryTurn::new(Role::Assistant, "Aria", format!("assistant reply number {i}"))
                }
            })
            .collect()
    }

    fn examples() -> Vec<String> {
        vec![
            "User: hi\nAria: hello there, traveller".to_string(),
            "User: bye\nAria: farewell, and mind the road".to_string(),
        ]
    }

    fn cue() -> PromptTail<'static> {
        PromptTail::Cue {
            role: Role::Assistant,
            name: "Aria",
        }
    }

    fn input<'a>(
        history: &'a [HistoryTurn],
        examples: &'a [String],
        injections: &'a ResolvedInjections,
    ) -> PackInput<'a> {
        PackInput {
            story: "Aria is a wandering bard.",
            examples,
            history,
            injections,
            tail: cue(),
        }
    }

    fn kinds(packed: &PackedPrompt) -> Vec<SegmentKind> {
        packed.segments.iter().map(|s| s.kind).collect()
    }

    // ── Tests ──────────────────────────────────────────────────────────

    #[test]
    fn everything_fits_in_order() {
        let hist = history(3);
        let ex = examples();
        let inj = ResolvedInjections::default();
        let packed = packer(4096).pack(&input(&hist, &ex, &inj)).unwrap();

        assert_eq!(
            kinds(&packed),
            vec![
                SegmentKind::Story,
                SegmentKind::Example,
                SegmentKind::Example,
                SegmentKind::History,
                SegmentKind::History,
                SegmentKind::History,
                SegmentKind::Cue,
            ]
        );
        assert!(packed.text.starts_with("Aria is a wandering bard.\n***\n"));
        assert!(packed.text.contains("User: user message number 0\n"));
        assert!(packed.text.ends_with("user message number 2\nAria:"));
        assert!(packed.metadata.drops.is_empty());
    }

    #[test]
    fn history_is_chronological_in_prompt() {
        let hist = history(4);
        let inj = ResolvedInjections::default();
        let packed = packer(4096).pack(&input(&hist, &[], &inj)).unwrap();
        let first = packed.text.find("number 0").unwrap();
        let last = packed.text.find("number 3").unwrap();
        assert!(first < last);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let hist = history(12);
        let ex = examples();
        let inj = ResolvedInjections {
            in_chat: vec![DepthInjection {
                depth: 2,
                role: Role::System,
                text: "\n[Aria is tired]\n".into(),
            }],
            ..Default::default()
        };
        let count = counter();
        for ceiling in 1..400 {
            let packer = PromptPacker::new(PackOptions::new(ceiling), count.clone());
            match packer.pack(&input(&hist, &ex, &inj)) {
                Ok(packed) => {
                    assert!(packed.total_tokens() <= ceiling);
                    assert!(count.count(&packed.text) <= ceiling);
                }
                Err(PackError::Overflow { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn oldest_history_dropped_first() {
        let hist = history(10);
        let inj = ResolvedInjections::default();
        let full = packer(4096).pack(&input(&hist, &[], &inj)).unwrap();
        let tight = packer(full.total_tokens() - 10)
            .pack(&input(&hist, &[], &inj))
            .unwrap();

        let stats = tight.metadata.class("history").unwrap();
        assert!(stats.items_included < 10);
        assert!(tight.text.contains("number 9"));
        assert!(!tight.text.contains("number 0\n"));
        assert_eq!(tight.metadata.drops[0].layer, "history");
    }

    #[test]
    fn examples_yield_to_history() {
        let hist = history(4);
        let ex = examples();
        let inj = ResolvedInjections::default();
        let full = packer(4096).pack(&input(&hist, &ex, &inj)).unwrap();
        let pinned = full.metadata.class("pinned").unwrap().tokens;
        let hist_tokens = full.metadata.class("history").unwrap().tokens;

        let packed = packer(pinned + hist_tokens + 1)
            .pack(&input(&hist, &ex, &inj))
            .unwrap();
        assert_eq!(packed.metadata.class("history").unwrap().items_included, 4);
        assert_eq!(packed.metadata.class("examples").unwrap().items_included, 0);
        assert!(
            packed
                .metadata
                .drops
                .iter()
                .any(|d| d.layer == "examples" && d.items_dropped == 2)
        );
    }

    #[test]
    fn pinned_examples_shrink_history_budget() {
        let hist = history(6);
        let ex = examples();
        let inj = ResolvedInjections::default();
        let count = counter();

        let unpinned = PromptPacker::new(PackOptions::new(60), count.clone())
            .pack(&input(&hist, &ex, &inj))
            .unwrap();
        let mut options = PackOptions::new(60);
        options.pin_examples = true;
        let pinned = PromptPacker::new(options, count)
            .pack(&input(&hist, &ex, &inj))
            .unwrap();

        let examples_in = |p: &PackedPrompt| {
            p.segments
                .iter()
                .filter(|s| s.kind == SegmentKind::Example)
                .count()
        };
        assert_eq!(examples_in(&pinned), 2);
        assert!(
            pinned.metadata.class("history").unwrap().items_included
                < unpinned.metadata.class("history").unwrap().items_included
        );
    }

    #[test]
    fn pinned_overflow_names_segment() {
        let story = "word ".repeat(200);
        let inj = ResolvedInjections::default();
        let packer = packer(50);
        let err = packer
            .pack(&PackInput {
                story: &story,
                examples: &[],
                history: &[],
                injections: &inj,
                tail: cue(),
            })
            .unwrap_err();
        match err {
            PackError::Overflow {
                segment, ceiling, ..
            } => {
                assert_eq!(segment, "story");
                assert_eq!(ceiling, 50);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn zero_ceiling_is_invalid() {
        let inj = ResolvedInjections::default();
        let err = packer(0).pack(&input(&[], &[], &inj)).unwrap_err();
        assert!(matches!(err, PackError::InvalidCeiling(_)));
    }

    #[test]
    fn depth_injections_placed_from_tail() {
        let hist = history(3);
        let inj = ResolvedInjections {
            in_chat: vec![
                DepthInjection {
                    depth: 0,
                    role: Role::System,
                    text: "\n[depth zero]\n".into(),
                },
                DepthInjection {
                    depth: 1,
                    role: Role::System,
                    text: "\n[depth one]\n".into(),
                },
                DepthInjection {
                    depth: 99,
                    role: Role::System,
                    text: "\n[far away]\n".into(),
                },
            ],
            ..Default::default()
        };
        let packed = packer(4096).pack(&input(&hist, &[], &inj)).unwrap();

        assert!(packed.text.ends_with("[depth zero]\nAria:"));
        assert!(packed.text.contains("[depth one]\nUser: user message number 2\n"));
        assert!(
            packed
                .text
                .contains("Aria is a wandering bard.\n[far away]\nUser: user message number 0")
        );
    }

    #[test]
    fn chat_start_opens_history() {
        let hist = history(2);
        let inj = ResolvedInjections::default();
        let mut options = PackOptions::new(4096);
        options.chat_start = "<START>".into();
        let packed = PromptPacker::new(options, counter())
            .pack(&input(&hist, &[], &inj))
            .unwrap();
        assert!(packed.text.contains("<START>\nUser: user message number 0\n"));
    }

    #[test]
    fn continuation_replaces_cue() {
        let hist = history(2);
        let partial = HistoryTurn::new(Role::Assistant, "Aria", "The road bends and");
        let inj = ResolvedInjections::default();
        let packed = packer(4096)
            .pack(&PackInput {
                story: "Story.",
                examples: &[],
                history: &hist,
                injections: &inj,
                tail: PromptTail::Continuation(&partial),
            })
            .unwrap();
        assert!(packed.text.ends_with("Aria: The road bends and"));
        assert!(!kinds(&packed).contains(&SegmentKind::Cue));
    }

    #[test]
    fn instruct_format_wraps_turns() {
        let hist = vec![HistoryTurn::new(Role::User, "User", "hello")];
        let inj = ResolvedInjections::default();
        let mut options = PackOptions::new(4096);
        options.format = TurnFormat {
            input_sequence: Some("### Instruction:".into()),
            output_sequence: Some("### Response:".into()),
            system_sequence: None,
        };
        let packed = PromptPacker::new(options, counter())
            .pack(&input(&hist, &[], &inj))
            .unwrap();
        assert!(
            packed
                .text
                .ends_with("### Instruction:\nUser: hello\n### Response:\nAria:")
        );
    }

    #[test]
    fn chat_turns_skip_cue_and_keep_roles() {
        let hist = history(2);
        let inj = ResolvedInjections::default();
        let packed = packer(4096).pack(&input(&hist, &[], &inj)).unwrap();
        let turns = packed.to_chat_turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(turns[1].content, "user message number 0");
        assert_eq!(turns[2].role, Role::Assistant);
        assert_eq!(turns[2].name.as_deref(), Some("Aria"));
    }

    #[test]
    fn deterministic_packing() {
        let hist = history(8);
        let ex = examples();
        let inj = ResolvedInjections::default();
        let a = packer(80).pack(&input(&hist, &ex, &inj)).unwrap();
        let b = packer(80).pack(&input(&hist, &ex, &inj)).unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.total_tokens(), b.total_tokens());
    }
}
