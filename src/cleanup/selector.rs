//! Pure rule evaluation over the index. Never touches the remote service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::index::{Index, IndexRecord};
use crate::sync::delete::DeleteTarget;

use super::{Rule, SelectionCriteria};

/// A record selected for deletion and the rule that selected it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub filename: String,
    pub id: Option<String>,
    pub size: Option<u64>,
    pub is_video: bool,
    /// Name of the first matching rule, e.g. `age-and-size`.
    pub reason: &'static str,
    pub detail: String,
}

impl Candidate {
    pub fn size_mb(&self) -> f64 {
        self.size.unwrap_or(0) as f64 / (1024.0 * 1024.0)
    }

    pub fn to_target(&self) -> DeleteTarget {
        DeleteTarget {
            filename: self.filename.clone(),
            id: self.id.clone(),
            reason: self.reason.to_string(),
        }
    }
}

/// Evaluate one rule. Unknown fields never satisfy a threshold.
fn evaluate(rule: &Rule, record: &IndexRecord, now: DateTime<Utc>) -> Option<String> {
    let age = record.age_years(now)?;
    match *rule {
        Rule::AgeAndSize {
            min_age_years,
            min_size_mb,
        } => {
            let size_mb = record.size_mb()?;
            (age >= min_age_years && size_mb >= min_size_mb)
                .then(|| format!("{:.1}yr, {:.1}MB", age, size_mb))
        }
        Rule::AgeAndDuration {
            min_age_years,
            max_duration_sec,
        } => {
            let duration = record.duration_secs?;
            (age >= min_age_years && duration <= max_duration_sec)
                .then(|| format!("{:.1}yr, {:.1}s", age, duration))
        }
    }
}

/// First matching rule for `record`, if any.
pub fn match_record(
    criteria: &SelectionCriteria,
    record: &IndexRecord,
    now: DateTime<Utc>,
) -> Option<(&'static str, String)> {
    let rules = if record.is_video() {
        &criteria.videos
    } else {
        &criteria.photos
    };
    if !rules.enabled {
        return None;
    }
    rules
        .rules
        .iter()
        .find_map(|rule| evaluate(rule, record, now).map(|detail| (rule.name(), detail)))
}

/// Every record matching a rule, in filename order.
pub fn select_candidates(
    index: &Index,
    criteria: &SelectionCriteria,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    index
        .records()
        .filter_map(|record| {
            let (reason, detail) = match_record(criteria, record, now)?;
            Some(Candidate {
                filename: record.filename.clone(),
                id: record.id.clone(),
                size: record.size,
                is_video: record.is_video(),
                reason,
                detail,
            })
        })
        .collect()
}

/// Candidates grouped by reason, with the count and total bytes per group.
pub fn group_by_reason(candidates: &[Candidate]) -> BTreeMap<&'static str, (usize, u64)> {
    let mut groups = BTreeMap::new();
    for c in candidates {
        let entry = groups.entry(c.reason).or_insert((0usize, 0u64));
        entry.0 += 1;
        entry.1 += c.size.unwrap_or(0);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::KindRules;
    use crate::remote::fake::{photo, reference_now, video};

    const MB: u64 = 1024 * 1024;

    fn index_of(records: Vec<IndexRecord>) -> Index {
        let mut index = Index::default();
        for r in records {
            index.insert_new(r);
        }
        index
    }

    #[test]
    fn test_first_matching_rule_wins_and_missing_dates_never_match() {
        let a = IndexRecord::from_asset(&video("A.MOV", 3 * 365 + 1, 200 * MB, 2.0));
        let b = IndexRecord::from_asset(&video("B.MOV", 182, 50 * MB, 2.0));
        let c = IndexRecord::from_asset(&video("C.MOV", 731, 90 * MB, 3.0));
        let mut undated = IndexRecord::from_asset(&video("D.MOV", 2000, 900 * MB, 1.0));
        undated.created = None;

        let index = index_of(vec![a, b, c, undated]);
        let found = select_candidates(&index, &SelectionCriteria::default(), reference_now());

        let pairs: Vec<_> = found
            .iter()
            .map(|c| (c.filename.as_str(), c.reason))
            .collect();
        assert_eq!(
            pairs,
            vec![("A.MOV", "age-and-size"), ("C.MOV", "age-and-duration")]
        );
        assert_eq!(found[0].id.as_deref(), Some("id-A.MOV"));
    }

    #[test]
    fn test_unknown_duration_fails_closed() {
        let mut r = IndexRecord::from_asset(&video("E.MOV", 800, 10 * MB, 1.0));
        r.duration_secs = None;
        assert!(match_record(&SelectionCriteria::default(), &r, reference_now()).is_none());
    }

    #[test]
    fn test_disabled_kind_is_skipped() {
        let mut criteria = SelectionCriteria::default();
        criteria.videos.enabled = false;
        let r = IndexRecord::from_asset(&video("A.MOV", 2000, 500 * MB, 60.0));
        assert!(match_record(&criteria, &r, reference_now()).is_none());
    }

    #[test]
    fn test_photo_rules_apply_to_photos_only() {
        let criteria = SelectionCriteria {
            photos: KindRules {
                enabled: true,
                rules: vec![Rule::AgeAndSize {
                    min_age_years: 1.0,
                    min_size_mb: 0.0,
                }],
            },
            videos: KindRules {
                enabled: true,
                rules: vec![],
            },
        };
        let index = index_of(vec![
            IndexRecord::from_asset(&photo("OLD.HEIC", 500)),
            IndexRecord::from_asset(&photo("NEW.HEIC", 10)),
            IndexRecord::from_asset(&video("OLD.MOV", 500, MB, 1.0)),
        ]);
        let found = select_candidates(&index, &criteria, reference_now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename, "OLD.HEIC");
        assert!(!found[0].is_video);
    }

    #[test]
    fn test_group_by_reason() {
        let index = index_of(vec![
            IndexRecord::from_asset(&video("A.MOV", 1000, 200 * MB, 30.0)),
            IndexRecord::from_asset(&video("B.MOV", 1000, 300 * MB, 30.0)),
            IndexRecord::from_asset(&video("C.MOV", 400, MB, 2.0)),
        ]);
        let found = select_candidates(&index, &SelectionCriteria::default(), reference_now());
        let groups = group_by_reason(&found);
        assert_eq!(groups["age-and-size"], (2, 500 * MB));
        assert_eq!(groups["age-and-duration"], (1, MB));
        assert_eq!(found[2].to_target().reason, "age-and-duration");
    }
}
