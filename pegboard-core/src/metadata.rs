//! Plugin header metadata.
//!
//! Plugins can annotate themselves with tags anywhere in the first 64 lines
//! of the file, typically inside a comment block:
//!
//! ```text
//! #!/usr/bin/env python3
//! # <pegboard.title>Stock ticker</pegboard.title>
//! # <pegboard.version>1.2</pegboard.version>
//! # <pegboard.author>Dev Jadhav</pegboard.author>
//! # <pegboard.desc>Shows watched symbols</pegboard.desc>
//! # <pegboard.schedule>0 30 9 * * Mon-Fri *</pegboard.schedule>
//! # <pegboard.environment>[API_HOST=localhost, API_PORT=8080]</pegboard.environment>
//! ```
//!
//! Parsing is lenient: unknown keys and malformed tags are skipped, and a
//! file with no tags at all yields empty metadata. Parsing never fails.

use serde::{Deserialize, Serialize};

/// How many leading lines of a plugin file are scanned for tags.
const HEADER_LINE_LIMIT: usize = 64;

const TAG_OPEN: &str = "<pegboard.";

/// Metadata parsed from a plugin's header tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Display name override for the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Cron expression overriding the filename schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Extra environment variables injected into every run of the plugin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<(String, String)>,
}

impl PluginMetadata {
    /// Whether no tags were found at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Scan the leading lines of a plugin file for metadata tags.
pub fn parse_metadata(content: &str) -> PluginMetadata {
    let mut meta = PluginMetadata::default();

    for line in content.lines().take(HEADER_LINE_LIMIT) {
        let mut rest = line;
        while let Some(start) = rest.find(TAG_OPEN) {
            rest = &rest[start + TAG_OPEN.len()..];
            let Some(key_end) = rest.find('>') else { break };
            let key = &rest[..key_end];
            rest = &rest[key_end + 1..];

            let close = format!("</pegboard.{key}>");
            let Some(value_end) = rest.find(close.as_str()) else {
                continue;
            };
            let value = rest[..value_end].trim();
            rest = &rest[value_end + close.len()..];

            apply_tag(&mut meta, key, value);
        }
    }

    meta
}

fn apply_tag(meta: &mut PluginMetadata, key: &str, value: &str) {
    match key {
        "title" => meta.title = Some(value.to_string()),
        "version" => meta.version = Some(value.to_string()),
        "author" => meta.author = Some(value.to_string()),
        "desc" => meta.desc = Some(value.to_string()),
        "schedule" => meta.schedule = Some(value.to_string()),
        "environment" => meta.environment.extend(parse_environment(value)),
        _ => {}
    }
}

/// Parse `[K1=v1, K2=v2]` (brackets optional) into key/value pairs.
fn parse_environment(value: &str) -> Vec<(String, String)> {
    let inner = value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');

    inner
        .split(',')
        .filter_map(|pair| {
            let (key, val) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), val.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_full_header() {
        let content = "\
#!/usr/bin/env python3
# <pegboard.title>Stock ticker</pegboard.title>
# <pegboard.version>1.2</pegboard.version>
# <pegboard.author>Dev Jadhav</pegboard.author>
# <pegboard.desc>Shows watched symbols</pegboard.desc>
# <pegboard.schedule>0 30 9 * * Mon-Fri *</pegboard.schedule>
print('hi')
";
        let meta = parse_metadata(content);
        assert_eq!(meta.title.as_deref(), Some("Stock ticker"));
        assert_eq!(meta.version.as_deref(), Some("1.2"));
        assert_eq!(meta.author.as_deref(), Some("Dev Jadhav"));
        assert_eq!(meta.desc.as_deref(), Some("Shows watched symbols"));
        assert_eq!(meta.schedule.as_deref(), Some("0 30 9 * * Mon-Fri *"));
    }

    #[test]
    fn test_parse_metadata_no_tags() {
        let meta = parse_metadata("#!/bin/sh\necho hello\n");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_parse_metadata_ignores_unknown_keys() {
        let meta = parse_metadata("# <pegboard.color>blue</pegboard.color>\n");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_parse_metadata_skips_unclosed_tag() {
        let content = "\
# <pegboard.title>never closed
# <pegboard.version>2.0</pegboard.version>
";
        let meta = parse_metadata(content);
        assert_eq!(meta.title, None);
        assert_eq!(meta.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_parse_metadata_mismatched_close_is_skipped() {
        let meta = parse_metadata("# <pegboard.title>oops</pegboard.desc>\n");
        assert_eq!(meta.title, None);
        assert_eq!(meta.desc, None);
    }

    #[test]
    fn test_parse_metadata_environment_pairs() {
        let meta = parse_metadata(
            "# <pegboard.environment>[API_HOST=localhost, API_PORT=8080]</pegboard.environment>\n",
        );
        assert_eq!(
            meta.environment,
            vec![
                ("API_HOST".to_string(), "localhost".to_string()),
                ("API_PORT".to_string(), "8080".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_metadata_environment_without_brackets() {
        let meta =
            parse_metadata("# <pegboard.environment>MODE=fast</pegboard.environment>\n");
        assert_eq!(meta.environment, vec![("MODE".to_string(), "fast".to_string())]);
    }

    #[test]
    fn test_parse_metadata_environment_skips_malformed_pairs() {
        let meta = parse_metadata(
            "# <pegboard.environment>[GOOD=1, nonsense, =empty]</pegboard.environment>\n",
        );
        assert_eq!(meta.environment, vec![("GOOD".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_parse_metadata_two_tags_on_one_line() {
        let meta = parse_metadata(
            "# <pegboard.title>A</pegboard.title> <pegboard.version>3</pegboard.version>\n",
        );
        assert_eq!(meta.title.as_deref(), Some("A"));
        assert_eq!(meta.version.as_deref(), Some("3"));
    }

    #[test]
    fn test_parse_metadata_ignores_tags_past_header_limit() {
        let mut content = String::new();
        for _ in 0..70 {
            content.push_str("# filler\n");
        }
        content.push_str("# <pegboard.title>too late</pegboard.title>\n");
        let meta = parse_metadata(&content);
        assert_eq!(meta.title, None);
    }

    #[test]
    fn test_parse_metadata_last_tag_wins() {
        let content = "\
# <pegboard.title>first</pegboard.title>
# <pegboard.title>second</pegboard.title>
";
        let meta = parse_metadata(content);
        assert_eq!(meta.title.as_deref(), Some("second"));
    }
}
