//! Toolset gate: picks the capability groups exposed to the model per turn.
//!
//! Fewer tools in the prompt means fewer wrong tool picks. The gate is a
//! keyword match over the message plus two flags about the turn; it never
//! calls a model.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named bundle of tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityGroup {
    Base,
    Generate,
    Modify,
    Analyze,
    Artifact,
    Context,
}

/// Facts about the turn that widen the toolset regardless of wording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnFlags {
    /// The conversation already has at least one artifact.
    pub has_artifact: bool,
    /// The request carries resolved class/student/assignment ids.
    pub has_context_id: bool,
}

const GENERATE_KEYWORDS: &[&str] = &[
    "generate", "create", "make", "build", "write", "draft", "design", "prepare", "quiz",
    "worksheet", "lesson plan", "生成", "创建", "制作", "出题", "设计", "写", "出一", "准备",
    "测验", "练习",
];

const MODIFY_KEYWORDS: &[&str] = &[
    "change", "modify", "edit", "update", "revise", "rewrite", "fix", "adjust", "improve",
    "shorten", "lengthen", "replace", "remove", "add", "改", "修改", "调整", "优化", "替换",
    "删除", "增加", "缩短", "换",
];

const ANALYZE_KEYWORDS: &[&str] = &[
    "analyze", "analyse", "analysis", "compare", "statistics", "stats", "trend", "performance",
    "score", "grades", "average", "分析", "统计", "对比", "比较", "成绩", "趋势", "表现", "平均",
];

/// Select the capability groups for a turn.
///
/// `base` is always present. `modify` and `artifact` are added whenever an
/// artifact exists, so follow-up edits work even without edit vocabulary.
pub fn select_groups(message: &str, flags: &TurnFlags) -> BTreeSet<CapabilityGroup> {
    let lower = message.to_lowercase();
    let mut groups = BTreeSet::from([CapabilityGroup::Base]);

    if matches_any(&lower, GENERATE_KEYWORDS) {
        groups.insert(CapabilityGroup::Generate);
    }
    if matches_any(&lower, MODIFY_KEYWORDS) {
        groups.insert(CapabilityGroup::Modify);
    }
    if matches_any(&lower, ANALYZE_KEYWORDS) {
        groups.insert(CapabilityGroup::Analyze);
    }
    if flags.has_artifact {
        groups.insert(CapabilityGroup::Artifact);
        groups.insert(CapabilityGroup::Modify);
    }
    if flags.has_context_id {
        groups.insert(CapabilityGroup::Context);
    }

    // Nothing recognized: offer generation rather than a tool-less model.
    if groups.len() == 1 {
        groups.insert(CapabilityGroup::Generate);
    }

    groups
}

/// ASCII keywords must match on word boundaries; CJK keywords are substrings.
fn matches_any(lower: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        if kw.is_ascii() {
            contains_word(lower, kw)
        } else {
            lower.contains(kw)
        }
    })
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let end = start + word.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_ascii_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_ascii_alphanumeric() || c == 's');
        before_ok && after_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use CapabilityGroup::*;

    fn select(message: &str) -> BTreeSet<CapabilityGroup> {
        select_groups(message, &TurnFlags::default())
    }

    #[test]
    fn test_base_always_present() {
        for msg in ["", "hello", "生成一份测验", "analyze the scores"] {
            assert!(select(msg).contains(&Base), "{msg}");
        }
    }

    #[test]
    fn test_english_generate_request() {
        let groups = select("Create a 10-question quiz on fractions");
        assert!(groups.contains(&Generate));
        assert!(!groups.contains(&Analyze));
    }

    #[test]
    fn test_chinese_analyze_request() {
        let groups = select("分析 Form 1A 英语成绩");
        assert!(groups.contains(&Analyze));
    }

    #[test]
    fn test_modify_keywords() {
        assert!(select("please shorten question 3").contains(&Modify));
        assert!(select("把第三题改简单一点").contains(&Modify));
    }

    #[test]
    fn test_word_boundaries_for_ascii_keywords() {
        // "make" inside "makeup" and "add" inside "address" do not count
        let groups = select("the makeup exam address");
        assert!(!groups.contains(&Modify));
        assert_eq!(groups, BTreeSet::from([Base, Generate]));
    }

    #[test]
    fn test_artifact_flag_adds_edit_groups() {
        let flags = TurnFlags {
            has_artifact: true,
            has_context_id: false,
        };
        let groups = select_groups("make it harder", &flags);
        assert!(groups.contains(&Artifact));
        assert!(groups.contains(&Modify));
    }

    #[test]
    fn test_context_flag_adds_context_group() {
        let flags = TurnFlags {
            has_artifact: false,
            has_context_id: true,
        };
        assert!(select_groups("compare the classes", &flags).contains(&Context));
    }

    #[test]
    fn test_unrecognized_message_gets_generate() {
        assert_eq!(select("hmm"), BTreeSet::from([Base, Generate]));
    }
}
