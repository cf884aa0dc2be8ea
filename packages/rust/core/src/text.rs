//! Lexical analysis shared by every pipeline stage.
//!
//! A [`Lexicon`] knows a set of named entities (companies) and sector
//! vocabulary. [`Lexicon::analyze`] turns free text into a [`TextProfile`]:
//! its goal frame, the entities and concepts it mentions, the sectors those
//! belong to, and whether it signals confusion.

use std::collections::{BTreeSet, HashMap};

use learnline_shared::{EntityEntry, GoalFrame};

/// Prefix marking sector tags inside term sets.
const SECTOR_TAG: &str = "#";

/// Longest concept phrase kept, in tokens.
const MAX_CONCEPT_TOKENS: usize = 3;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "been", "before", "being", "between", "both", "but", "by", "can", "could", "did", "do",
    "does", "doing", "dont", "doesnt", "down", "each", "eg", "etc", "even", "every", "for",
    "from", "get", "gets", "getting", "given", "go", "going", "got", "had", "has", "have",
    "having", "he", "her", "here", "him", "his", "how", "however", "i", "ie", "if", "im", "in",
    "into", "is", "isnt", "it", "its", "just", "kind", "know", "let", "lets", "like", "lot",
    "make", "makes", "me", "more", "most", "much", "my", "no", "not", "now", "of", "off", "ok",
    "okay", "on", "one", "only", "or", "other", "our", "out", "over", "please", "quite",
    "rather", "really", "right", "same", "say", "see", "she", "should", "so", "some", "such",
    "tell", "than", "that", "thats", "the", "their", "them", "then", "there", "these", "they",
    "thing", "things", "think", "this", "those", "through", "to", "too", "under", "up", "us",
    "very", "want", "was", "way", "we", "well", "were", "what", "whats", "when", "where",
    "whether", "which", "while", "who", "why", "will", "with", "would", "yes", "yet", "you",
    "your",
];

/// Words that express what kind of understanding is sought rather than its subject.
const FRAME_WORDS: &[&str] = &[
    "affect", "affecting", "affects", "basics", "big", "bigger", "compare", "compared",
    "compete", "competes", "competition", "competitive", "competitor", "competitors",
    "confused", "confusing", "demand", "difference", "dominance", "dominant", "driver",
    "drivers", "drives", "driving", "earnings", "example", "examples", "explain", "explained",
    "forecast", "future", "growth", "grow", "growing", "impact", "intuition", "intuitively",
    "leader", "lost", "margin", "margins", "market", "markets", "mean", "means", "outlook",
    "position", "profit", "profits", "revenue", "rival", "rivals", "share", "simple", "simply",
    "size", "still", "terms", "total", "unclear", "understand", "valuation", "versus", "vs",
    "work", "working", "works",
];

const COMPANIES: &[(&str, &[&str], &str)] = &[
    ("NVIDIA", &["nvidia", "nvda"], "semiconductors"),
    ("AMD", &["amd", "advanced micro devices"], "semiconductors"),
    ("Intel", &["intel", "intc"], "semiconductors"),
    ("TSMC", &["tsmc", "taiwan semiconductor"], "semiconductors"),
    ("Qualcomm", &["qualcomm"], "semiconductors"),
    ("Broadcom", &["broadcom", "avgo"], "semiconductors"),
    ("Amazon", &["amazon", "aws"], "cloud"),
    ("Microsoft", &["microsoft", "azure", "msft"], "cloud"),
    ("Google", &["google", "alphabet", "gcp"], "cloud"),
    ("Oracle", &["oracle"], "cloud"),
    ("Tesla", &["tesla", "tsla"], "ev"),
    ("BYD", &["byd"], "ev"),
    ("Rivian", &["rivian"], "ev"),
    ("Lucid", &["lucid"], "ev"),
    ("NIO", &["nio"], "ev"),
];

const VOCABULARY: &[(&str, &str)] = &[
    ("chip", "semiconductors"),
    ("chips", "semiconductors"),
    ("gpu", "semiconductors"),
    ("gpus", "semiconductors"),
    ("semiconductor", "semiconductors"),
    ("semiconductors", "semiconductors"),
    ("foundry", "semiconductors"),
    ("accelerator", "semiconductors"),
    ("accelerators", "semiconductors"),
    ("cuda", "semiconductors"),
    ("wafer", "semiconductors"),
    ("cloud", "cloud"),
    ("hyperscaler", "cloud"),
    ("hyperscalers", "cloud"),
    ("datacenter", "cloud"),
    ("datacenters", "cloud"),
    ("ev", "ev"),
    ("evs", "ev"),
    ("battery", "ev"),
    ("batteries", "ev"),
];

// ---------------------------------------------------------------------------
// Lexicon
// ---------------------------------------------------------------------------

/// A named entity the pipeline can recognise.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Display name, e.g. `NVIDIA`.
    pub name: String,
    /// Lowercase canonical key, used as the concept name.
    pub key: String,
    pub sector: String,
}

/// Entity and sector vocabulary used for analysis.
#[derive(Debug, Clone)]
pub struct Lexicon {
    entities: Vec<Entity>,
    aliases: HashMap<String, usize>,
    vocabulary: HashMap<String, String>,
    max_alias_tokens: usize,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Lexicon {
    /// The built-in lexicon.
    pub fn builtin() -> Self {
        Self::with_entries(&[])
    }

    /// The built-in lexicon extended (and overridden by name) with `entries`.
    pub fn with_entries(entries: &[EntityEntry]) -> Self {
        let mut lexicon = Self {
            entities: Vec::new(),
            aliases: HashMap::new(),
            vocabulary: VOCABULARY
                .iter()
                .map(|(term, sector)| (term.to_string(), sector.to_string()))
                .collect(),
            max_alias_tokens: 1,
        };
        for (name, aliases, sector) in COMPANIES {
            lexicon.insert(name, aliases.iter().copied(), sector);
        }
        for entry in entries {
            lexicon.insert(
                &entry.name,
                entry.aliases.iter().map(String::as_str),
                &entry.sector,
            );
        }
        lexicon
    }

    fn insert<'a>(&mut self, name: &str, aliases: impl Iterator<Item = &'a str>, sector: &str) {
        let key = tokenize(name).join(" ");
        if key.is_empty() {
            return;
        }
        let entity = Entity {
            name: name.to_string(),
            key: key.clone(),
            sector: sector.to_lowercase(),
        };
        let idx = match self.entities.iter().position(|e| e.key == key) {
            Some(idx) => {
                self.entities[idx] = entity;
                idx
            }
            None => {
                self.entities.push(entity);
                self.entities.len() - 1
            }
        };
        let mut alias_keys = vec![key];
        alias_keys.extend(aliases.map(|a| tokenize(a).join(" ")));
        for alias in alias_keys {
            if alias.is_empty() {
                continue;
            }
            self.max_alias_tokens = self.max_alias_tokens.max(alias.split(' ').count());
            self.aliases.insert(alias, idx);
        }
    }

    /// Look up an entity by its canonical key.
    pub fn entity(&self, key: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.key == key)
    }

    /// Display name for a concept: the entity name when it is one, else the concept itself.
    pub fn display(&self, concept: &str) -> String {
        self.entity(concept)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| concept.to_string())
    }

    /// Sector of a concept, if it is an entity or sector vocabulary.
    pub fn sector_of(&self, concept: &str) -> Option<&str> {
        if let Some(entity) = self.entity(concept) {
            return Some(&entity.sector);
        }
        self.vocabulary.get(concept).map(String::as_str)
    }

    /// Entities in `sector`.
    pub fn sector_entities<'a>(&'a self, sector: &'a str) -> impl Iterator<Item = &'a Entity> {
        self.entities.iter().filter(move |e| e.sector == sector)
    }

    /// Number of occurrences of each entity in `text`, keyed by entity key.
    pub fn entity_mentions(&self, text: &str) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for clause in clauses(text) {
            let tokens = tokenize(clause);
            let mut i = 0;
            while i < tokens.len() {
                match self.match_entity(&tokens, i) {
                    Some((idx, len)) => {
                        *counts.entry(self.entities[idx].key.clone()).or_insert(0) += 1;
                        i += len;
                    }
                    None => i += 1,
                }
            }
        }
        counts
    }

    /// Longest alias match starting at `start`: `(entity index, tokens consumed)`.
    fn match_entity(&self, tokens: &[String], start: usize) -> Option<(usize, usize)> {
        let longest = self.max_alias_tokens.min(tokens.len() - start);
        (1..=longest).rev().find_map(|len| {
            let candidate = tokens[start..start + len].join(" ");
            self.aliases.get(&candidate).map(|idx| (*idx, len))
        })
    }

    /// Analyze free text.
    pub fn analyze(&self, text: &str) -> TextProfile {
        let tokens = tokenize(text);
        let mut entities: Vec<String> = Vec::new();
        let mut concepts: Vec<String> = Vec::new();
        let mut sectors = BTreeSet::new();

        for clause in clauses(text) {
            let clause_tokens = tokenize(clause);
            let mut run: Vec<&str> = Vec::new();
            let mut i = 0;
            while i < clause_tokens.len() {
                if let Some((idx, len)) = self.match_entity(&clause_tokens, i) {
                    flush_run(&mut run, &mut concepts);
                    let entity = &self.entities[idx];
                    push_unique(&mut entities, &entity.key);
                    push_unique(&mut concepts, &entity.key);
                    sectors.insert(entity.sector.clone());
                    i += len;
                    continue;
                }
                let token = clause_tokens[i].as_str();
                if is_subject_token(token) {
                    if let Some(sector) = self.vocabulary.get(token) {
                        sectors.insert(sector.clone());
                    }
                    run.push(token);
                } else {
                    flush_run(&mut run, &mut concepts);
                }
                i += 1;
            }
            flush_run(&mut run, &mut concepts);
        }

        let frame = detect_frame(&tokens);
        let confused = detect_confusion(&tokens);

        TextProfile {
            tokens,
            frame,
            entities,
            sectors,
            concepts,
            confused,
        }
    }
}

fn flush_run(run: &mut Vec<&str>, concepts: &mut Vec<String>) {
    if run.is_empty() {
        return;
    }
    let start = run.len().saturating_sub(MAX_CONCEPT_TOKENS);
    push_unique(concepts, &run[start..].join(" "));
    run.clear();
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
    }
}

// ---------------------------------------------------------------------------
// TextProfile
// ---------------------------------------------------------------------------

/// What a piece of text is about and what it is after.
#[derive(Debug, Clone, PartialEq)]
pub struct TextProfile {
    /// Every token, in order.
    pub tokens: Vec<String>,
    pub frame: GoalFrame,
    /// Entity keys, first-seen order.
    pub entities: Vec<String>,
    pub sectors: BTreeSet<String>,
    /// Concept phrases (entity keys included), first-seen order.
    pub concepts: Vec<String>,
    pub confused: bool,
}

impl TextProfile {
    /// Tokens of every concept phrase.
    pub fn subject_terms(&self) -> BTreeSet<String> {
        self.concepts
            .iter()
            .flat_map(|c| c.split(' ').map(str::to_string))
            .collect()
    }

    /// Subject terms plus sector tags.
    pub fn term_set(&self) -> BTreeSet<String> {
        let mut terms = self.subject_terms();
        terms.extend(sector_tags(&self.sectors));
        terms
    }

    /// Whether any of `cues` occurs as a token.
    pub fn has_cue(&self, cues: &[&str]) -> bool {
        self.tokens.iter().any(|t| cues.contains(&t.as_str()))
    }

    /// A plain "what is X" style question with no analytical frame.
    pub fn is_definitional(&self) -> bool {
        if !matches!(self.frame, GoalFrame::Mechanics | GoalFrame::General) {
            return false;
        }
        DEFINITION_PHRASES
            .iter()
            .any(|phrase| contains_phrase(&self.tokens, phrase))
    }
}

const DEFINITION_PHRASES: &[&[&str]] = &[
    &["what", "is"],
    &["what", "are"],
    &["whats"],
    &["who", "is"],
    &["define"],
    &["definition"],
    &["meaning"],
    &["explain"],
];

/// Sector names as tags that cannot collide with words.
pub fn sector_tags(sectors: &BTreeSet<String>) -> impl Iterator<Item = String> + '_ {
    sectors.iter().map(|s| format!("{SECTOR_TAG}{s}"))
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Lowercase word tokens with possessives and apostrophes removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter_map(|raw| {
            let t = raw.trim_matches('\'');
            let t = t.strip_suffix("'s").unwrap_or(t);
            let t: String = t.chars().filter(|c| *c != '\'').collect();
            (!t.is_empty()).then_some(t)
        })
        .collect()
}

/// Split text at clause punctuation.
fn clauses(text: &str) -> impl Iterator<Item = &str> {
    text.split([',', '.', ';', ':', '?', '!', '(', ')', '\n'])
        .filter(|c| !c.trim().is_empty())
}

/// Whether a token can be part of a subject phrase.
pub fn is_subject_token(token: &str) -> bool {
    token.chars().count() >= 2
        && !token.chars().all(|c| c.is_ascii_digit())
        && !STOPWORDS.contains(&token)
        && !FRAME_WORDS.contains(&token)
}

/// Informative tokens of arbitrary text (no stopwords, no frame words, no numbers).
pub fn informative_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() >= 3 && is_subject_token(t))
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &[&str]) -> bool {
    tokens
        .windows(phrase.len())
        .any(|w| w.iter().zip(phrase).all(|(a, b)| a == b))
}

fn detect_frame(tokens: &[String]) -> GoalFrame {
    let has = |words: &[&str]| tokens.iter().any(|t| words.contains(&t.as_str()));
    let phrase = |p: &[&str]| contains_phrase(tokens, p);

    if phrase(&["how", "big"])
        || phrase(&["market", "size"])
        || (has(&["total"]) && has(&["market", "markets"]))
        || has(&["tam", "addressable"])
    {
        GoalFrame::MarketSize
    } else if has(&["share", "position", "dominance", "dominant", "leader"]) {
        GoalFrame::MarketPosition
    } else if has(&[
        "demand", "affecting", "affect", "affects", "driving", "drivers", "driver", "adoption",
    ]) {
        GoalFrame::DemandDrivers
    } else if has(&[
        "compete", "competes", "competitor", "competitors", "competition", "competitive",
        "rival", "rivals",
    ]) {
        GoalFrame::Competition
    } else if has(&[
        "revenue", "earnings", "margin", "margins", "profit", "profits", "valuation",
    ]) {
        GoalFrame::Financials
    } else if has(&["future", "outlook", "forecast"]) {
        GoalFrame::Outlook
    } else if phrase(&["how", "does"])
        || phrase(&["how", "do"])
        || phrase(&["what", "is"])
        || phrase(&["what", "are"])
        || has(&["explain", "work", "works", "understand", "confused", "confusing"])
    {
        GoalFrame::Mechanics
    } else {
        GoalFrame::General
    }
}

fn detect_confusion(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|t| matches!(t.as_str(), "confused" | "confusing" | "unclear" | "lost"))
        || contains_phrase(tokens, &["dont", "understand"])
        || contains_phrase(tokens, &["do", "not", "understand"])
        || contains_phrase(tokens, &["dont", "get"])
        || contains_phrase(tokens, &["makes", "no", "sense"])
        || contains_phrase(tokens, &["doesnt", "make", "sense"])
}

/// Tokens of a concept phrase.
pub fn concept_tokens(concept: &str) -> BTreeSet<String> {
    concept.split(' ').map(str::to_string).collect()
}

/// Whether two concept phrases name the same thing (one's tokens contain the other's).
pub fn same_concept(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (ta, tb) = (concept_tokens(a), concept_tokens(b));
    !ta.is_empty() && !tb.is_empty() && (ta.is_subset(&tb) || tb.is_subset(&ta))
}

/// Jaccard similarity of two term sets (0 when both are empty).
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
