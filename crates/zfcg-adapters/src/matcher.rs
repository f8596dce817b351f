use zfcg_core::{AnnouncementDraft, DEFAULT_KEYWORD};

/// Literal substring matcher over an active keyword set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
}

impl KeywordMatcher {
    pub fn new<S: AsRef<str>>(keywords: impl IntoIterator<Item = S>) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Space-joined query for the search dialect.
    pub fn search_phrase(&self) -> String {
        if self.keywords.is_empty() {
            DEFAULT_KEYWORD.to_string()
        } else {
            self.keywords.join(" ")
        }
    }

    /// With keywords: any keyword in title, content or publisher. Without:
    /// the default keyword in title or publisher.
    pub fn matches(&self, title: &str, content: Option<&str>, publisher: Option<&str>) -> bool {
        let publisher = publisher.unwrap_or_default();
        if self.keywords.is_empty() {
            return title.contains(DEFAULT_KEYWORD) || publisher.contains(DEFAULT_KEYWORD);
        }
        let content = content.unwrap_or_default();
        self.keywords.iter().any(|k| {
            title.contains(k.as_str())
                || content.contains(k.as_str())
                || publisher.contains(k.as_str())
        })
    }

    pub fn matches_draft(&self, draft: &AnnouncementDraft) -> bool {
        self.matches(
            &draft.title,
            draft.content.as_deref(),
            draft.publisher.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_keyword_in_any_field_matches() {
        let matcher = KeywordMatcher::new(["水务局", "生态环境局"]);
        assert!(matcher.matches("深圳市水务局设备采购", None, None));
        assert!(matcher.matches("设备采购", Some("采购人：深圳市生态环境局"), None));
        assert!(matcher.matches("设备采购", None, Some("深圳市生态环境局")));
        assert!(!matcher.matches("设备采购", Some("深圳市教育局"), Some("深圳市教育局")));
    }

    #[test]
    fn empty_set_uses_default_keyword_on_title_and_publisher_only() {
        let matcher = KeywordMatcher::new(Vec::<String>::new());
        assert!(matcher.matches("深圳市生态环境局采购公告", None, None));
        assert!(matcher.matches("采购公告", None, Some("深圳市生态环境局")));
        assert!(!matcher.matches("采购公告", Some("深圳市生态环境局"), None));
        assert_eq!(matcher.search_phrase(), DEFAULT_KEYWORD);
    }

    #[test]
    fn blank_keywords_are_ignored_and_matching_is_literal() {
        let matcher = KeywordMatcher::new([" ", "ABC"]);
        assert_eq!(matcher.keywords(), ["ABC".to_string()]);
        assert!(!matcher.matches("abc", None, None));
        assert_eq!(matcher.search_phrase(), "ABC");
    }
}
