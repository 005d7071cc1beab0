//! Entity Resolver: maps free-text mentions to roster ids.
//!
//! Mentions are extracted with a handful of patterns (class codes, grade
//! phrases, student-name cues, assignment titles) plus a literal scan for
//! every known roster alias. Each mention is then matched against the
//! roster indices built once in [`EntityResolver::new`]:
//!
//! 1. direct alias hit → `exact` (1.0)
//! 2. hit after canonicalizing class prefixes/suffixes → `alias` (0.95)
//! 3. edit-distance similarity ≥ threshold → `fuzzy` (score)
//!
//! Grade phrases expand to every class of that grade (`grade`, 0.9) and take
//! priority over individual class mentions. Students and assignments are only
//! ever looked up inside a known class; without one, the result asks for it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tools::registry::similarity;

const EXACT_CONFIDENCE: f64 = 1.0;
const ALIAS_CONFIDENCE: f64 = 0.95;
const GRADE_CONFIDENCE: f64 = 0.9;

/// Context key reported when members are mentioned without a class.
pub const MISSING_CLASS: &str = "class";

// ─── Roster ─────────────────────────────────────────────────────────────────

/// Classes with their students and assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub classes: Vec<ClassRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Free-form grade label ("Grade 5", "五年级", "初一").
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub students: Vec<StudentRecord>,
    #[serde(default)]
    pub assignments: Vec<AssignmentRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

// ─── Result Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Class,
    Student,
    Assignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Alias,
    Grade,
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    None,
    Single,
    Multi,
    Grade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub display_name: String,
    pub confidence: f64,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResult {
    pub entities: Vec<ResolvedEntity>,
    /// True when any entity was matched fuzzily.
    pub is_ambiguous: bool,
    pub scope_mode: ScopeMode,
    /// Context the request needs but does not name (e.g. `"class"`).
    pub missing_context: Vec<String>,
}

impl ResolveResult {
    pub fn ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.entity_id.clone()).collect()
    }
}

/// Per-turn context that can stand in for a class the message omits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveContext {
    pub class_id: Option<String>,
}

// ─── Extraction Patterns ────────────────────────────────────────────────────

static CLASS_CODE_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(?:form|class|grade|year)\s*)?\d{1,2}[a-z]\b").expect("valid regex")
});

static CLASS_CODE_ZH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[高初][一二三]|[一二三四五六七八九十\d]{1,2}年级)?[(（]?[A-Za-z\d一二三四五六七八九十]{1,3}[)）]?班",
    )
    .expect("valid regex")
});

static GRADE_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:grade|year|form)\s*(\d{1,2})\b").expect("valid regex")
});

static GRADE_ZH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([一二三四五六七八九十\d]{1,2}年级|[高初][一二三](?:年级)?)([(（]?[A-Za-z\d一二三四五六七八九十]{1,3}[)）]?班)?",
    )
    .expect("valid regex")
});

static STUDENT_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[Ss]tudents?|[Pp]upils?)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)")
        .expect("valid regex")
});

static STUDENT_POSSESSIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)'s\b").expect("valid regex")
});

static STUDENT_ZH_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:学生|同学)[:：\s]*(\p{Han}{2,3})").expect("valid regex")
});

static STUDENT_ZH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\p{Han}{2,4})同学").expect("valid regex"));

static ASSIGNMENT_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:assignment|homework|quiz|test|作业|测验|考试)\s*[:：]?\s*["“「《]([^"”」》]{1,40})["”」》]"#)
        .expect("valid regex")
});

static ASSIGNMENT_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:assignment|homework)\s+([a-z0-9][a-z0-9\- ]{0,30}?)\s*(?:[,.;!?]|\bfor\b|\bin\b|\bof\b|$)")
        .expect("valid regex")
});

static BOOK_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"《([^》]{1,40})》").expect("valid regex"));

// ─── Mentions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MentionKind {
    Class,
    Grade,
    Student,
    Assignment,
}

#[derive(Debug, Clone)]
struct Mention {
    kind: MentionKind,
    text: String,
    start: usize,
}

fn extract_mentions(text: &str) -> Vec<Mention> {
    let mut mentions = Vec::new();
    let mut push = |kind, m: regex::Match<'_>| {
        mentions.push(Mention {
            kind,
            text: m.as_str().trim().to_string(),
            start: m.start(),
        });
    };

    for m in CLASS_CODE_EN.find_iter(text) {
        push(MentionKind::Class, m);
    }
    for m in CLASS_CODE_ZH.find_iter(text) {
        push(MentionKind::Class, m);
    }
    for caps in GRADE_EN.captures_iter(text) {
        if let Some(m) = caps.get(0) {
            push(MentionKind::Grade, m);
        }
    }
    for caps in GRADE_ZH.captures_iter(text) {
        // "三年级二班" is a class, not a grade.
        if caps.get(2).is_none() {
            if let Some(m) = caps.get(1) {
                push(MentionKind::Grade, m);
            }
        }
    }
    for re in [&*STUDENT_EN, &*STUDENT_POSSESSIVE, &*STUDENT_ZH_PREFIX, &*STUDENT_ZH_SUFFIX] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(MentionKind::Student, m);
            }
        }
    }
    for re in [&*ASSIGNMENT_QUOTED, &*ASSIGNMENT_EN, &*BOOK_TITLE] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push(MentionKind::Assignment, m);
            }
        }
    }

    mentions.retain(|m| !m.text.is_empty());
    mentions.sort_by_key(|m| m.start);
    mentions
}

// ─── Normalization ──────────────────────────────────────────────────────────

/// Full-width ASCII and the ideographic space folded to half-width.
fn to_half_width(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            _ => c,
        })
        .collect()
}

/// Case-folded, half-width, single-spaced.
fn normalize(s: &str) -> String {
    to_half_width(s)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const CLASS_WORDS: &[&str] = &["form", "class", "grade", "year", "年级", "班"];

/// Class key with prefixes/suffixes, brackets and whitespace dropped and
/// Chinese numerals turned into digits: "Form 1A", "1A班" → "1a".
fn canonical_class_key(s: &str) -> String {
    let mut key: String = normalize(s)
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '-' | '.'))
        .collect();
    for word in CLASS_WORDS {
        key = key.replace(word, "");
    }
    cn_numerals_to_digits(&key)
}

/// Grade key: "Grade 5", "五年级", "5" → "5"; "初一" → "初1".
fn grade_key(s: &str) -> Option<String> {
    let key = canonical_class_key(s);
    (!key.is_empty()).then_some(key)
}

fn cn_digit(c: char) -> Option<u32> {
    "零一二三四五六七八九".chars().position(|d| d == c).map(|p| p as u32)
}

fn cn_number(run: &[char]) -> Option<u32> {
    match run {
        [] => None,
        ['十'] => Some(10),
        ['十', ones] => Some(10 + cn_digit(*ones)?),
        [tens, '十'] => Some(cn_digit(*tens)? * 10),
        [tens, '十', ones] => Some(cn_digit(*tens)? * 10 + cn_digit(*ones)?),
        [single] => cn_digit(*single),
        _ => None,
    }
}

fn cn_numerals_to_digits(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run: Vec<char> = Vec::new();
    let flush = |run: &mut Vec<char>, out: &mut String| {
        if run.is_empty() {
            return;
        }
        match cn_number(run) {
            Some(n) => out.push_str(&n.to_string()),
            None => out.extend(run.iter()),
        }
        run.clear();
    };
    for c in s.chars() {
        if c == '十' || cn_digit(c).is_some() {
            run.push(c);
        } else {
            flush(&mut run, &mut out);
            out.push(c);
        }
    }
    flush(&mut run, &mut out);
    out
}

fn is_han(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Lookup candidates for a mention. A Han-script span captured by a name cue
/// may carry leading verbs ("看看张三"), so its suffixes are tried too.
fn mention_candidates(text: &str) -> Vec<String> {
    let normalized = normalize(text);
    let chars: Vec<char> = normalized.chars().collect();
    let mut out = vec![normalized.clone()];
    if chars.len() > 2 && chars.iter().all(|c| is_han(*c)) {
        for start in 1..=chars.len() - 2 {
            out.push(chars[start..].iter().collect());
        }
    }
    out
}

/// Byte offsets of `needle` in `haystack`, honoring ASCII word boundaries
/// when the needle starts or ends with an ASCII alphanumeric.
fn find_bounded(haystack: &str, needle: &str) -> Option<usize> {
    haystack.match_indices(needle).map(|(i, _)| i).find(|&start| {
        let end = start + needle.len();
        let needs_left = needle.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let needs_right = needle.chars().next_back().is_some_and(|c| c.is_ascii_alphanumeric());
        let left_ok = !needs_left
            || haystack[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_ascii_alphanumeric());
        let right_ok = !needs_right
            || haystack[end..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_ascii_alphanumeric());
        left_ok && right_ok
    })
}

// ─── Indices ────────────────────────────────────────────────────────────────

/// Alias index over one class's students or assignments.
#[derive(Debug, Clone, Default)]
struct MemberIndex {
    /// normalized alias → (member index, display name)
    aliases: BTreeMap<String, (usize, String)>,
    ids: Vec<String>,
}

impl MemberIndex {
    fn insert(&mut self, id: &str, display: &str, names: impl IntoIterator<Item = String>) {
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        for name in names {
            let key = normalize(&name);
            if !key.is_empty() {
                self.aliases.entry(key).or_insert((idx, display.to_string()));
            }
        }
    }
}

/// Roster indices, built once and queried per message.
#[derive(Debug, Clone)]
pub struct EntityResolver {
    classes: Vec<ClassRecord>,
    /// normalized id/name/alias → class index
    class_aliases: BTreeMap<String, usize>,
    /// canonical key → class indices (only unique keys are used)
    class_canonical: BTreeMap<String, Vec<usize>>,
    /// grade key → class indices
    grades: BTreeMap<String, Vec<usize>>,
    students: Vec<MemberIndex>,
    assignments: Vec<MemberIndex>,
    fuzzy_threshold: f64,
}

impl EntityResolver {
    pub fn new(roster: &Roster, fuzzy_threshold: f64) -> Self {
        let mut class_aliases = BTreeMap::new();
        let mut class_canonical: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut grades: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut students = Vec::with_capacity(roster.classes.len());
        let mut assignments = Vec::with_capacity(roster.classes.len());

        for (idx, class) in roster.classes.iter().enumerate() {
            let names = std::iter::once(&class.id)
                .chain(std::iter::once(&class.name))
                .chain(class.aliases.iter());
            for name in names {
                let key = normalize(name);
                if !key.is_empty() {
                    class_aliases.entry(key).or_insert(idx);
                }
                let canonical = canonical_class_key(name);
                if !canonical.is_empty() {
                    let slot = class_canonical.entry(canonical).or_default();
                    if !slot.contains(&idx) {
                        slot.push(idx);
                    }
                }
            }
            if let Some(key) = class.grade.as_deref().and_then(grade_key) {
                grades.entry(key).or_default().push(idx);
            }

            let mut student_index = MemberIndex::default();
            for s in &class.students {
                let names = [s.id.clone(), s.name.clone()]
                    .into_iter()
                    .chain(s.aliases.iter().cloned());
                student_index.insert(&s.id, &s.name, names);
            }
            students.push(student_index);

            let mut assignment_index = MemberIndex::default();
            for a in &class.assignments {
                let names = [a.id.clone(), a.title.clone()]
                    .into_iter()
                    .chain(a.aliases.iter().cloned());
                assignment_index.insert(&a.id, &a.title, names);
            }
            assignments.push(assignment_index);
        }

        Self {
            classes: roster.classes.clone(),
            class_aliases,
            class_canonical,
            grades,
            students,
            assignments,
            fuzzy_threshold,
        }
    }

    /// Resolve every mention in `message`. Deterministic: equal inputs give
    /// equal outputs, ordered by first mention position.
    pub fn resolve(&self, message: &str, ctx: &ResolveContext) -> ResolveResult {
        let text = to_half_width(message);
        let lower = text.to_lowercase();
        let mentions = extract_mentions(&text);

        // Classes: explicit mentions plus literal roster-alias hits.
        let mut class_hits: Vec<(usize, usize, ResolvedEntity)> = Vec::new();
        for m in mentions.iter().filter(|m| m.kind == MentionKind::Class) {
            if let Some((idx, entity)) = self.match_class(&m.text) {
                class_hits.push((m.start, idx, entity));
            }
        }
        for (alias, &idx) in &self.class_aliases {
            if alias.chars().count() < 2 {
                continue;
            }
            if let Some(start) = find_bounded(&lower, alias) {
                class_hits.push((start, idx, self.class_entity(idx, MatchType::Exact, EXACT_CONFIDENCE)));
            }
        }

        let mut grade_hits: Vec<(usize, usize, ResolvedEntity)> = Vec::new();
        for m in mentions.iter().filter(|m| m.kind == MentionKind::Grade) {
            let Some(key) = grade_key(&m.text) else { continue };
            for &idx in self.grades.get(&key).map(Vec::as_slice).unwrap_or_default() {
                grade_hits.push((m.start, idx, self.class_entity(idx, MatchType::Grade, GRADE_CONFIDENCE)));
            }
        }

        let grade_scope = !grade_hits.is_empty();
        let class_hits = if grade_scope { grade_hits } else { class_hits };

        let mut found: Vec<(usize, ResolvedEntity)> = Vec::new();
        let mut scope: Vec<usize> = Vec::new();
        for (start, idx, entity) in class_hits {
            if !scope.contains(&idx) {
                scope.push(idx);
            }
            found.push((start, entity));
        }
        let class_count = scope.len();

        if scope.is_empty() {
            if let Some(idx) = ctx
                .class_id
                .as_deref()
                .and_then(|id| self.classes.iter().position(|c| c.id == id))
            {
                scope.push(idx);
            }
        }

        // Members: only within the scoped classes.
        let mut missing_context = Vec::new();
        let member_mentions: Vec<&Mention> = mentions
            .iter()
            .filter(|m| matches!(m.kind, MentionKind::Student | MentionKind::Assignment))
            .collect();

        if scope.is_empty() {
            if !member_mentions.is_empty() || self.mentions_any_member(&lower) {
                missing_context.push(MISSING_CLASS.to_string());
            }
        } else {
            for m in &member_mentions {
                let (entity_type, indices) = match m.kind {
                    MentionKind::Student => (EntityType::Student, &self.students),
                    _ => (EntityType::Assignment, &self.assignments),
                };
                if let Some(entity) = self.match_member(&m.text, entity_type, indices, &scope) {
                    found.push((m.start, entity));
                }
            }
            for &class_idx in &scope {
                for (entity_type, index) in [
                    (EntityType::Student, &self.students[class_idx]),
                    (EntityType::Assignment, &self.assignments[class_idx]),
                ] {
                    for (alias, (member_idx, display)) in &index.aliases {
                        if alias.chars().count() < 2 {
                            continue;
                        }
                        if let Some(start) = find_bounded(&lower, alias) {
                            found.push((
                                start,
                                ResolvedEntity {
                                    entity_type,
                                    entity_id: index.ids[*member_idx].clone(),
                                    display_name: display.clone(),
                                    confidence: EXACT_CONFIDENCE,
                                    match_type: MatchType::Exact,
                                },
                            ));
                        }
                    }
                }
            }
        }

        let entities = dedupe(found);
        let is_ambiguous = entities.iter().any(|e| e.match_type == MatchType::Fuzzy);
        let scope_mode = if grade_scope {
            ScopeMode::Grade
        } else if class_count > 1 {
            ScopeMode::Multi
        } else if class_count == 1 || !entities.is_empty() {
            ScopeMode::Single
        } else {
            ScopeMode::None
        };

        ResolveResult {
            entities,
            is_ambiguous,
            scope_mode,
            missing_context,
        }
    }

    fn class_entity(&self, idx: usize, match_type: MatchType, confidence: f64) -> ResolvedEntity {
        let class = &self.classes[idx];
        ResolvedEntity {
            entity_type: EntityType::Class,
            entity_id: class.id.clone(),
            display_name: class.name.clone(),
            confidence,
            match_type,
        }
    }

    fn match_class(&self, mention: &str) -> Option<(usize, ResolvedEntity)> {
        let key = normalize(mention);
        if let Some(&idx) = self.class_aliases.get(&key) {
            return Some((idx, self.class_entity(idx, MatchType::Exact, EXACT_CONFIDENCE)));
        }

        let canonical = canonical_class_key(mention);
        if let Some([idx]) = self.class_canonical.get(&canonical).map(Vec::as_slice) {
            return Some((*idx, self.class_entity(*idx, MatchType::Alias, ALIAS_CONFIDENCE)));
        }

        let mut best: Option<(usize, f64)> = None;
        for (alias, &idx) in &self.class_aliases {
            let score = similarity(&key, alias);
            if score >= self.fuzzy_threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        best.map(|(idx, score)| (idx, self.class_entity(idx, MatchType::Fuzzy, score)))
    }

    fn match_member(
        &self,
        mention: &str,
        entity_type: EntityType,
        indices: &[MemberIndex],
        scope: &[usize],
    ) -> Option<ResolvedEntity> {
        let candidates = mention_candidates(mention);
        let entity = |index: &MemberIndex, member_idx: usize, display: &str, match_type, confidence| {
            ResolvedEntity {
                entity_type,
                entity_id: index.ids[member_idx].clone(),
                display_name: display.to_string(),
                confidence,
                match_type,
            }
        };

        for candidate in &candidates {
            for &class_idx in scope {
                let index = &indices[class_idx];
                if let Some((member_idx, display)) = index.aliases.get(candidate) {
                    return Some(entity(
                        index,
                        *member_idx,
                        display.as_str(),
                        MatchType::Exact,
                        EXACT_CONFIDENCE,
                    ));
                }
            }
        }

        let mut best: Option<(&MemberIndex, usize, &str, f64)> = None;
        for candidate in &candidates {
            for &class_idx in scope {
                let index = &indices[class_idx];
                for (alias, (member_idx, display)) in &index.aliases {
                    let score = similarity(candidate, alias);
                    if score >= self.fuzzy_threshold && best.map_or(true, |(.., s)| score > s) {
                        best = Some((index, *member_idx, display.as_str(), score));
                    }
                }
            }
        }
        best.map(|(index, member_idx, display, score)| {
            entity(index, member_idx, display, MatchType::Fuzzy, score)
        })
    }

    /// Whether any student or assignment alias of any class appears literally.
    fn mentions_any_member(&self, lower: &str) -> bool {
        self.students
            .iter()
            .chain(self.assignments.iter())
            .flat_map(|index| index.aliases.keys())
            .filter(|alias| alias.chars().count() >= 2)
            .any(|alias| find_bounded(lower, alias).is_some())
    }
}

/// Keep the highest-confidence entry per `(type, id)`, ordered by the first
/// position the entity was mentioned.
fn dedupe(mut found: Vec<(usize, ResolvedEntity)>) -> Vec<ResolvedEntity> {
    found.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.entity_type.cmp(&b.1.entity_type))
            .then(a.1.entity_id.cmp(&b.1.entity_id))
    });

    let mut best: BTreeMap<(EntityType, String), ResolvedEntity> = BTreeMap::new();
    let mut order: Vec<(EntityType, String)> = Vec::new();
    let mut seen = BTreeSet::new();
    for (_, entity) in found {
        let key = (entity.entity_type, entity.entity_id.clone());
        if seen.insert(key.clone()) {
            order.push(key.clone());
        }
        let replace = best
            .get(&key)
            .map_or(true, |existing| entity.confidence > existing.confidence);
        if replace {
            best.insert(key, entity);
        }
    }
    order.into_iter().filter_map(|key| best.remove(&key)).collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: &str, name: &str, grade: Option<&str>) -> ClassRecord {
        ClassRecord {
            id: id.into(),
            name: name.into(),
            grade: grade.map(String::from),
            ..Default::default()
        }
    }

    fn roster() -> Roster {
        let mut c1 = class("c1", "Form 1A", Some("Form 1"));
        c1.students = vec![
            StudentRecord {
                id: "s1".into(),
                name: "张三".into(),
                aliases: vec![],
            },
            StudentRecord {
                id: "s2".into(),
                name: "Amy Chen".into(),
                aliases: vec!["Amy".into()],
            },
        ];
        c1.assignments = vec![AssignmentRecord {
            id: "a1".into(),
            title: "Fractions Practice".into(),
            aliases: vec![],
        }];
        let c2 = class("c2", "Form 1B", Some("Form 1"));
        let c3 = class("c3", "三年级二班", Some("三年级"));
        Roster {
            classes: vec![c1, c2, c3],
        }
    }

    fn resolver() -> EntityResolver {
        EntityResolver::new(&roster(), 0.6)
    }

    #[test]
    fn test_exact_class_mention_in_mixed_language() {
        let roster = Roster {
            classes: vec![class("c1", "Form 1A", None)],
        };
        let result = EntityResolver::new(&roster, 0.6).resolve("分析 Form 1A 英语成绩", &ResolveContext::default());
        assert_eq!(result.entities.len(), 1);
        let e = &result.entities[0];
        assert_eq!(e.entity_id, "c1");
        assert_eq!(e.entity_type, EntityType::Class);
        assert_eq!(e.match_type, MatchType::Exact);
        assert_eq!(e.confidence, 1.0);
        assert_eq!(result.scope_mode, ScopeMode::Single);
        assert!(!result.is_ambiguous);
        assert!(result.missing_context.is_empty());
    }

    #[test]
    fn test_canonical_form_is_alias_match() {
        let result = resolver().resolve("compare 1A班 results", &ResolveContext::default());
        let e = &result.entities[0];
        assert_eq!(e.entity_id, "c1");
        assert_eq!(e.match_type, MatchType::Alias);
        assert_eq!(e.confidence, 0.95);
    }

    #[test]
    fn test_chinese_class_name_exact() {
        let result = resolver().resolve("三年级二班的数学成绩怎么样", &ResolveContext::default());
        assert_eq!(result.ids(), vec!["c3"]);
        assert_eq!(result.entities[0].match_type, MatchType::Exact);
        assert_eq!(result.scope_mode, ScopeMode::Single);
    }

    #[test]
    fn test_two_classes_is_multi_scope() {
        let result = resolver().resolve("Compare Form 1A and Form 1B", &ResolveContext::default());
        assert_eq!(result.ids(), vec!["c1", "c2"]);
        assert_eq!(result.scope_mode, ScopeMode::Multi);
    }

    #[test]
    fn test_grade_expansion_takes_priority() {
        let result = resolver().resolve("How did all of Form 1 do, especially Form 1A?", &ResolveContext::default());
        assert_eq!(result.scope_mode, ScopeMode::Grade);
        assert_eq!(result.ids(), vec!["c1", "c2"]);
        assert!(result.entities.iter().all(|e| e.match_type == MatchType::Grade));
        assert!(result.entities.iter().all(|e| e.confidence == 0.9));
    }

    #[test]
    fn test_chinese_grade_expansion() {
        let result = resolver().resolve("三年级的平均分", &ResolveContext::default());
        assert_eq!(result.scope_mode, ScopeMode::Grade);
        assert_eq!(result.ids(), vec!["c3"]);
    }

    #[test]
    fn test_fuzzy_match_marks_ambiguous() {
        let roster = Roster {
            classes: vec![class("c9", "Form 2C", None)],
        };
        let result = EntityResolver::new(&roster, 0.6).resolve("scores for Form 2D", &ResolveContext::default());
        assert_eq!(result.ids(), vec!["c9"]);
        assert_eq!(result.entities[0].match_type, MatchType::Fuzzy);
        assert!(result.is_ambiguous);
        assert!(result.entities[0].confidence >= 0.6);
    }

    #[test]
    fn test_below_threshold_is_not_matched() {
        let result = resolver().resolve("class 9z", &ResolveContext::default());
        assert!(result.entities.is_empty());
        assert_eq!(result.scope_mode, ScopeMode::None);
    }

    #[test]
    fn test_no_entity_below_threshold_ever() {
        let r = resolver();
        for msg in ["Form 3Q report", "看看李四同学", "homework xyz for Form 1A", "year 9 trip"] {
            let result = r.resolve(msg, &ResolveContext::default());
            assert!(result.entities.iter().all(|e| e.confidence >= 0.6), "{msg}");
        }
    }

    #[test]
    fn test_student_without_class_reports_missing_context() {
        let result = resolver().resolve("请帮我看看张三同学的作业", &ResolveContext::default());
        assert!(result.entities.is_empty());
        assert_eq!(result.missing_context, vec![MISSING_CLASS]);
    }

    #[test]
    fn test_student_with_class_in_message() {
        let result = resolver().resolve("Form 1A 的张三同学最近表现", &ResolveContext::default());
        assert_eq!(result.ids(), vec!["c1", "s1"]);
        assert_eq!(result.entities[1].entity_type, EntityType::Student);
        assert_eq!(result.entities[1].match_type, MatchType::Exact);
        assert!(result.missing_context.is_empty());
    }

    #[test]
    fn test_student_via_context_class() {
        let ctx = ResolveContext {
            class_id: Some("c1".into()),
        };
        let result = resolver().resolve("How is Amy doing?", &ctx);
        assert_eq!(result.ids(), vec!["s2"]);
        assert_eq!(result.scope_mode, ScopeMode::Single);
    }

    #[test]
    fn test_assignment_title_resolved() {
        let result = resolver().resolve(
            "Form 1A homework \"Fractions Practice\" results",
            &ResolveContext::default(),
        );
        assert!(result.ids().contains(&"a1".to_string()));
    }

    #[test]
    fn test_empty_message_resolves_nothing() {
        let result = resolver().resolve("", &ResolveContext::default());
        assert!(result.entities.is_empty());
        assert_eq!(result.scope_mode, ScopeMode::None);
        assert!(!result.is_ambiguous);
        assert!(result.missing_context.is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let r = resolver();
        let msg = "对比 Form 1A 和 Form 1B 的张三同学";
        assert_eq!(
            r.resolve(msg, &ResolveContext::default()),
            r.resolve(msg, &ResolveContext::default())
        );
    }

    #[test]
    fn test_full_width_input_normalized() {
        let result = resolver().resolve("Ｆｏｒｍ　１Ａ", &ResolveContext::default());
        assert_eq!(result.ids(), vec!["c1"]);
    }

    #[test]
    fn test_chinese_numerals_convert() {
        assert_eq!(cn_numerals_to_digits("三年级二班"), "3年级2班");
        assert_eq!(cn_numerals_to_digits("十二"), "12");
        assert_eq!(canonical_class_key("Form 1A"), "1a");
        assert_eq!(canonical_class_key("1A班"), "1a");
        assert_eq!(grade_key("五年级").as_deref(), Some("5"));
        assert_eq!(grade_key("Grade 5").as_deref(), Some("5"));
        assert_eq!(grade_key("初一").as_deref(), Some("初1"));
    }
}
