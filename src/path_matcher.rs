/* src/path_matcher.rs */

/// Specificity of a prefix-pattern match. Higher compares as more specific:
/// exact segments beat wildcards, longer patterns beat shorter ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchScore {
    /// Number of exact (non-wildcard) segments.
    pub exact_parts: usize,
    /// Total number of segments in the pattern.
    pub total_parts: usize,
}

/// Scores `pattern` as a segment-wise prefix of `path`, where `*` matches
/// any single segment. Returns `None` when the pattern does not match.
pub fn get_match_score(pattern: &str, path: &str) -> Option<MatchScore> {
    let pattern_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // A prefix pattern cannot have more segments than the path.
    if pattern_parts.len() > path_parts.len() {
        return None;
    }

    let mut exact_parts = 0;

    for (i, p_part) in pattern_parts.iter().enumerate() {
        if *p_part == "*" {
            continue;
        }
        if Some(p_part) != path_parts.get(i) {
            return None;
        }
        exact_parts += 1;
    }

    Some(MatchScore {
        exact_parts,
        total_parts: pattern_parts.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_pattern_matches_everything() {
        assert!(get_match_score("/", "/api/v1/jobs").is_some());
        assert!(get_match_score("/", "/").is_some());
    }

    #[test]
    fn wildcard_matches_one_segment() {
        assert!(get_match_score("/api/*/jobs", "/api/v1/jobs").is_some());
        assert!(get_match_score("/api/*/jobs", "/api/v1/companies").is_none());
    }

    #[test]
    fn pattern_longer_than_path_never_matches() {
        assert!(get_match_score("/api/v1/jobs", "/api/v1").is_none());
    }

    #[test]
    fn more_exact_segments_score_higher() {
        let specific = get_match_score("/api/v1/jobs", "/api/v1/jobs/42").unwrap();
        let wild = get_match_score("/api/*/jobs", "/api/v1/jobs/42").unwrap();
        let short = get_match_score("/api", "/api/v1/jobs/42").unwrap();
        assert!(specific > wild);
        assert!(wild > short);
    }
}
