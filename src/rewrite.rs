//! Path parsing and HTML base-path injection for proxied apps

use crate::registry::AppRecord;
use serde::Serialize;

/// Mount point and identity an app reads to configure itself
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasePathInfo {
    pub id: String,
    pub name: String,
    pub base_path: String,
    pub running: bool,
}

impl BasePathInfo {
    pub fn new(record: &AppRecord, base_path: String) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            base_path,
            running: record.is_running(),
        }
    }
}

/// Split a request path under `prefix` into the app id and the upstream path.
///
/// `/apps/demo/some/path` with prefix `/apps` yields `("demo", "/some/path")`;
/// `/apps/demo` yields `("demo", "")`, which the caller redirects to the
/// slash form. Paths outside the prefix or without an id yield `None`.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;

    let (id, tail) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };

    if id.is_empty() {
        return None;
    }
    Some((id, tail))
}

/// Script tag that publishes the app's base path as a browser global
pub fn base_path_script(global: &str, base_path: &str) -> String {
    let value = serde_json::to_string(base_path)
        .unwrap_or_else(|_| "\"/\"".to_string())
        .replace("</", "<\\/");
    format!("<script>window.{}={};</script>", global, value)
}

/// Insert `script` into an HTML document.
///
/// Placement, in order of preference: right after the opening `<head>` tag,
/// right before `</head>`, right before `<html>`, else at the very start.
pub fn inject_base_path(body: &[u8], script: &str) -> Vec<u8> {
    let at = find_head_open(body)
        .or_else(|| find_ci(body, b"</head>"))
        .or_else(|| find_tag_start(body, b"<html"))
        .unwrap_or(0);

    let mut out = Vec::with_capacity(body.len() + script.len());
    out.extend_from_slice(&body[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(&body[at..]);
    out
}

/// Offset just past the `>` of the first `<head>` or `<head ...>` tag
fn find_head_open(body: &[u8]) -> Option<usize> {
    let start = find_tag_start(body, b"<head")?;
    let close = body[start..].iter().position(|&b| b == b'>')?;
    Some(start + close + 1)
}

/// First `needle` occurrence that is a whole tag name, so `<head` does not
/// match `<header>`
fn find_tag_start(body: &[u8], needle: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = find_ci(&body[from..], needle) {
        let at = from + i;
        match body.get(at + needle.len()) {
            Some(b'>') | Some(b'/') => return Some(at),
            Some(c) if c.is_ascii_whitespace() => return Some(at),
            None => return None,
            _ => from = at + 1,
        }
    }
    None
}

fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}
