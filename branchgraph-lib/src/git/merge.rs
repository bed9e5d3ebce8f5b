//! Parses merge commit subject lines to recover the names of the branches
//! that were merged.

use once_cell::sync::Lazy;
use regex::Regex;

static MERGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Merge branch(?: '([^']+)'|es ('[^']+'(?:, '[^']+')*) and '([^']+)')")
        .expect("merge subject pattern is valid")
});

/// Returns the branch names referenced by a merge commit subject, e.g.
/// `"Merge branch 'foo' into bar"` or
/// `"Merge branches 'a', 'b' and 'c' into bar"`. Returns an empty vector for
/// subjects that don't follow either template.
pub fn merged_branches(subject: &str) -> Vec<String> {
    let Some(captures) = MERGE_PATTERN.captures(subject) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    if let Some(single) = captures.get(1) {
        names.push(single.as_str().to_string());
    }
    if let Some(middle) = captures.get(2) {
        for part in middle.as_str().split(", ") {
            names.push(part.trim_matches('\'').to_string());
        }
    }
    if let Some(last) = captures.get(3) {
        names.push(last.as_str().to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn set(names: Vec<String>) -> HashSet<String> {
        names.into_iter().collect()
    }

    #[test]
    fn single_branch_merge() {
        let names = merged_branches("Merge branch 'X' into Y");
        assert_eq!(set(names), set(vec!["X".to_string()]));
    }

    #[test]
    fn multi_branch_merge() {
        let names = merged_branches("Merge branches 'A', 'B', 'C', 'D' and 'E' into Y");
        assert_eq!(
            set(names),
            set(vec!["A", "B", "C", "D", "E"].into_iter().map(String::from).collect())
        );
    }

    #[test]
    fn non_merge_subject_yields_nothing() {
        assert!(merged_branches("Fix the thing that was broken").is_empty());
    }

    #[test]
    fn two_branch_merge() {
        let names = merged_branches("Merge branches 'A' and 'B' into Y");
        assert_eq!(set(names), set(vec!["A".to_string(), "B".to_string()]));
    }
}
