//! RTMP URL -> path name / query parsing.
//!
//! `rml_rtmp` hands the adapter `app_name` and `stream_key` separately
//! rather than a single URL; the stream key is where RTMP clients
//! conventionally smuggle a query string (`key?user=a&pass=b`). This
//! reassembles the two into one path the same way the wire spec describes:
//! trim a trailing slash, then trim the leading slash of the path
//! component.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ParsedUrl {
    pub path_name: String,
    pub query: HashMap<String, String>,
    pub raw_query: String,
}

pub fn parse(app_name: &str, stream_key: &str) -> ParsedUrl {
    let (key_path, raw_query) = match stream_key.split_once('?') {
        Some((path, query)) => (path, query.to_string()),
        None => (stream_key, String::new()),
    };

    let combined = format!("{}/{}", app_name.trim_end_matches('/'), key_path);
    let path_name = combined.trim_end_matches('/').trim_start_matches('/').to_string();

    let query = parse_query(&raw_query);

    ParsedUrl { path_name, query, raw_query }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if raw.is_empty() {
        return map;
    }
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                map.insert(k.to_string(), v.to_string());
            }
            None => {
                map.insert(pair.to_string(), String::new());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_app_and_key() {
        let parsed = parse("live", "mystream");
        assert_eq!(parsed.path_name, "live/mystream");
        assert!(parsed.query.is_empty());
    }

    #[test]
    fn trims_trailing_and_leading_slashes() {
        let parsed = parse("live", "mystream/");
        assert_eq!(parsed.path_name, "live/mystream");
    }

    #[test]
    fn extracts_query_from_stream_key() {
        let parsed = parse("live", "mystream?user=alice&pass=secret");
        assert_eq!(parsed.path_name, "live/mystream");
        assert_eq!(parsed.query.get("user"), Some(&"alice".to_string()));
        assert_eq!(parsed.query.get("pass"), Some(&"secret".to_string()));
        assert_eq!(parsed.raw_query, "user=alice&pass=secret");
    }
}
