//! Canonical text forms for consultations and manuals.
//!
//! These exact strings are what gets embedded into the similarity index and
//! what generated content is checked against. Section order and labels are
//! part of the contract: changing either shifts search scores and grounding
//! results for every stored manual, so treat any edit here as breaking.

use crate::models::{Consultation, ManualContent};

pub const LABEL_SUMMARY: &str = "[요약]";
pub const LABEL_INQUIRY: &str = "[문의]";
pub const LABEL_ACTION: &str = "[조치]";

pub const LABEL_KEYWORDS: &str = "[키워드]";
pub const LABEL_TOPIC: &str = "[주제]";
pub const LABEL_BACKGROUND: &str = "[배경]";
pub const LABEL_GUIDELINE: &str = "[가이드라인]";

/// Summary, inquiry, then action taken, one labeled line each.
pub fn consultation_text(consultation: &Consultation) -> String {
    labeled(&[
        (LABEL_SUMMARY, consultation.summary.as_str()),
        (LABEL_INQUIRY, consultation.inquiry.as_str()),
        (LABEL_ACTION, consultation.action_taken.as_str()),
    ])
}

/// Keywords (comma-joined), topic, background, then guideline.
pub fn manual_text(content: &ManualContent) -> String {
    let keywords = content.keywords.join(", ");
    labeled(&[
        (LABEL_KEYWORDS, keywords.as_str()),
        (LABEL_TOPIC, content.topic.as_str()),
        (LABEL_BACKGROUND, content.background.as_str()),
        (LABEL_GUIDELINE, content.guideline.as_str()),
    ])
}

fn labeled(sections: &[(&str, &str)]) -> String {
    sections
        .iter()
        .map(|(label, value)| {
            let value = value.trim();
            if value.is_empty() {
                label.to_string()
            } else {
                format!("{} {}", label, value)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consultation_sections_in_fixed_order() {
        let c = Consultation {
            id: "c1".into(),
            summary: "CVV 인증 실패".into(),
            inquiry: "결제 시 CVV 오류가 납니다".into(),
            action_taken: "카드 재등록 안내".into(),
            branch: None,
            business_type: "CARD".into(),
            error_code: "E401".into(),
        };
        assert_eq!(
            consultation_text(&c),
            "[요약] CVV 인증 실패\n[문의] 결제 시 CVV 오류가 납니다\n[조치] 카드 재등록 안내"
        );
    }

    #[test]
    fn manual_joins_keywords_with_commas() {
        let content = ManualContent {
            keywords: vec!["CVV".into(), "결제".into()],
            topic: "CVV 오류".into(),
            background: "".into(),
            guideline: "재등록 안내".into(),
        };
        assert_eq!(
            manual_text(&content),
            "[키워드] CVV, 결제\n[주제] CVV 오류\n[배경]\n[가이드라인] 재등록 안내"
        );
    }
}
