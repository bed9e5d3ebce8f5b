//! Small parsing helpers shared by the branch model and by status
//! providers, neither of which warrants its own module.

use std::collections::HashMap;

use crate::git::Context;
use std::sync::Arc;

/// Parses the output of `git config --get-regexp <pattern>`: one mapping
/// per line, as `key SP value`. Lines that don't contain a space are
/// skipped rather than treated as a fatal parse error.
pub fn parse_config_lines(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter_map(|line| line.split_once(' '))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Extracts `remote.<name>.url` entries into a name-to-URL mapping, as used
/// by status providers to figure out which remote a build belongs to.
pub fn remote_urls(ctx: &Arc<Context>) -> eyre::Result<HashMap<String, String>> {
    let lines = ctx
        .runner
        .run_lines(&["config", "--get-regexp", r"remote\..*\.url"])?;
    Ok(parse_config_lines(&lines)
        .into_iter()
        .filter_map(|(key, url)| {
            let name = key.strip_prefix("remote.")?.strip_suffix(".url")?;
            Some((name.to_string(), url))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let lines = vec![
            "remote.origin.url git@github.com:foo/bar.git".to_string(),
            "remote.fork.url git@github.com:baz/bar.git".to_string(),
        ];
        let parsed = parse_config_lines(&lines);
        assert_eq!(
            parsed,
            vec![
                ("remote.origin.url".to_string(), "git@github.com:foo/bar.git".to_string()),
                ("remote.fork.url".to_string(), "git@github.com:baz/bar.git".to_string()),
            ]
        );
    }

    #[test]
    fn skips_lines_without_a_value() {
        let lines = vec!["remote.origin.url".to_string()];
        assert!(parse_config_lines(&lines).is_empty());
    }
}
